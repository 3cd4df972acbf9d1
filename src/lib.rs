/*!
# A Tokio based MLLP server for HL7 v2.x messages.

HL7's MLLP is a simple, single-byte-text based protocol for framing HL7 messages
over a TCP (or similar) transport. This crate provides the listening side: it
accepts plain TCP or TLS connections, reassembles MLLP frames, splits batch and
file containers into their logical messages, hands each message to your handler,
and writes a version-correct ACK/NACK back on the same connection when the
handler asks for one.

Acknowledgment building *fails open*: a message too malformed to address a
proper ACK still gets a reply (an AE fallback acknowledgment), so a peer that
managed to deliver a complete frame is never left waiting.

## Example

```no_run
use hl7_mllp_server::{
    AckCode, InboundRequest, ListenerOptions, SendResponse, Server, ServerOptions,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::new(ServerOptions::default())?;

    let inbound = server
        .create_inbound(
            ListenerOptions::new(3000),
            |request: InboundRequest, mut response: SendResponse| async move {
                println!(
                    "received {} ({})",
                    request.message().get("MSH.9.1"),
                    request.message().get("MSH.10"),
                );
                let _ = response.send_response(AckCode::AA).await;
            },
        )
        .await?;

    tokio::signal::ctrl_c().await?;
    inbound.close().await?;
    Ok(())
}
```

Listeners can be observed through typed notifications
([`InboundEvent`](events::InboundEvent)) via [`Inbound::subscribe`](inbound::Inbound::subscribe),
and expose received-frame / parsed-message counters through
[`Inbound::stats`](inbound::Inbound::stats).
*/

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod hl7;
pub mod inbound;
pub mod request;
pub mod response;
pub mod server;

pub use codec::{MllpCodec, TextEncoding};
pub use config::{ListenerOptions, MshOverride, ServerOptions, TlsOptions};
pub use error::{Error, Result};
pub use events::InboundEvent;
pub use inbound::{Inbound, InboundHandler, ListenerStats};
pub use request::{InboundRequest, MessageOrigin};
pub use response::{AckCode, SendResponse};
pub use server::Server;
