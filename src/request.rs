//! The inbound request handed to the application handler.

use std::net::SocketAddr;

use crate::hl7::Message;

/// How a logical message arrived inside its MLLP frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageOrigin {
    /// Unwrapped from an FHS/FTS file container.
    File,
    /// Unwrapped from a BHS/BTS batch container.
    Batch,
    /// The frame carried the message directly.
    Single,
}

/// One parsed inbound message plus its origin classification.
///
/// Created once per logical message and owned by the handler invocation.
#[derive(Clone, Debug)]
pub struct InboundRequest {
    message: Message,
    origin: MessageOrigin,
    peer: SocketAddr,
}

impl InboundRequest {
    pub(crate) fn new(message: Message, origin: MessageOrigin, peer: SocketAddr) -> Self {
        InboundRequest {
            message,
            origin,
            peer,
        }
    }

    /// The parsed HL7 message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Whether the message came from a file, a batch or stood alone.
    pub fn origin(&self) -> MessageOrigin {
        self.origin
    }

    /// The remote address the message arrived from.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}
