//! Typed notifications emitted by an inbound listener.
//!
//! Consumers call [`Inbound::subscribe`](crate::inbound::Inbound::subscribe)
//! to receive these over a broadcast channel. Slow or absent subscribers
//! never block the listener.

use std::net::SocketAddr;

use tokio::sync::broadcast;

/// Everything observable about a running listener.
#[derive(Clone, Debug)]
pub enum InboundEvent {
    /// The listening socket is bound and accepting connections.
    Listen { port: u16 },
    /// A socket-level problem on the listener itself.
    Error { message: String },
    /// A frame failed to decode, classify or parse. The offending frame
    /// is dropped but the connection stays open.
    DataError { message: String },
    /// The raw reassembled unit of one MLLP frame, before classification.
    DataRaw { frame: String },
    /// A client connected.
    ClientConnect { peer: SocketAddr },
    /// A client connection ended.
    ClientClose { peer: SocketAddr, had_error: bool },
    /// A client connection failed.
    ClientError { peer: SocketAddr, message: String },
    /// An acknowledgment was written back on a connection.
    ResponseSent { peer: SocketAddr },
}

pub(crate) type EventSender = broadcast::Sender<InboundEvent>;

/// Fire an event, ignoring the case where nobody is subscribed.
pub(crate) fn emit(events: &EventSender, event: InboundEvent) {
    let _ = events.send(event);
}
