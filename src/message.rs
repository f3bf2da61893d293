//! Typed messages exchanged between a client and the mediator, together with
//! the wire-level constants shared by the codec on both sides.

use bytes::Bytes;
use num_enum::TryFromPrimitive;
use thiserror::Error;

/// Width of the zero-padded ASCII decimal length field.
pub const LENGTH_FIELD_SIZE: usize = 16;

/// Width of the ASCII message-type field.
pub const TYPE_FIELD_SIZE: usize = 1;

/// Protocol ceiling on the content size: the length field holds at most
/// 10^16 - 1 bytes. Practical deployments cap far lower via configuration.
pub const MAX_CONTENT_SIZE: u64 = 10_000_000_000_000_000;

/// The closed set of message types. The discriminant is the ASCII digit
/// written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    /// Protocol traffic between a client and the mediator itself: admission,
    /// connector commands, main-channel RPCs.
    ServerInteraction = b'1',
    /// Traffic destined for the controller peer (screen frames, frame ACKs).
    ControllerFrame = b'2',
    /// Traffic destined for the controlled peer (input events, sender ACKs).
    ControlledFrame = b'3',
}

impl MessageType {
    /// The single ASCII digit used on the wire.
    pub fn digit(self) -> u8 {
        self as u8
    }
}

/// Error constructing a [`Message`].
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message content of {0} bytes exceeds the protocol maximum")]
    Oversize(u64),
}

/// One typed message. The content is opaque at this layer; protocol strings
/// and tokens are UTF-8 text carried in the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageType,
    content: Bytes,
}

impl Message {
    /// Create a message, rejecting content the length field cannot express.
    pub fn new(kind: MessageType, content: impl Into<Bytes>) -> Result<Message, MessageError> {
        let content = content.into();
        if content.len() as u64 >= MAX_CONTENT_SIZE {
            return Err(MessageError::Oversize(content.len() as u64));
        }
        Ok(Message { kind, content })
    }

    /// Convenience constructor for protocol text. Protocol strings are short,
    /// so the oversize check cannot fire.
    pub fn text(kind: MessageType, content: impl AsRef<str>) -> Message {
        Message {
            kind,
            content: Bytes::copy_from_slice(content.as_ref().as_bytes()),
        }
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn into_content(self) -> Bytes {
        self.content
    }

    /// Decode the content as UTF-8 text. Protocol messages are always text;
    /// frame payloads generally are not.
    pub fn content_text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.content)
    }
}
