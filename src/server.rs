//! The server facade: validated server-wide options plus listener creation.

use std::sync::Arc;

use crate::config::{normalize_server_options, ListenerOptions, ServerOptions};
use crate::error::Result;
use crate::inbound::{Inbound, InboundHandler};

/// Holds the validated server-wide options every listener shares.
///
/// Construction fails on an invalid configuration; a `Server` in an
/// invalid state never exists.
pub struct Server {
    options: ServerOptions,
}

impl Server {
    pub fn new(options: ServerOptions) -> Result<Server> {
        let options = normalize_server_options(options)?;
        Ok(Server { options })
    }

    /// The normalized server options.
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Create an inbound listener on this server's bind address.
    ///
    /// `handler` is invoked once per logical message; see
    /// [`InboundHandler`]. The returned [`Inbound`] is already listening.
    pub async fn create_inbound<H: InboundHandler>(
        &self,
        options: ListenerOptions,
        handler: H,
    ) -> Result<Inbound> {
        Inbound::new(&self.options, options, Arc::new(handler)).await
    }
}
