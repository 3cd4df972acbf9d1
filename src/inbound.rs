//! The inbound MLLP listener.
//!
//! An [`Inbound`] owns one listening socket (plain TCP, or TLS when the
//! server options carry TLS material) and supervises every accepted
//! connection. Each connection runs its own reassembly codec over a
//! Framed transport; completed units are classified as file, batch or
//! single message, decomposed, and dispatched to the application handler
//! one logical message at a time.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::rustls::{self, ServerConfig as TlsServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::codec::{MllpCodec, TextEncoding, Transport};
use crate::config::{
    normalize_listener_options, normalize_server_options, ListenerOptions, MshOverride,
    ServerOptions, TlsOptions,
};
use crate::error::{Error, Result};
use crate::events::{emit, EventSender, InboundEvent};
use crate::hl7::{is_batch, is_file, Batch, FileBatch, Message};
use crate::request::{InboundRequest, MessageOrigin};
use crate::response::{SendResponse, SharedSink};

/// Application callback invoked once per inbound logical message.
///
/// Invocations are dispatched as independent tasks: a slow handler does
/// not stall byte ingestion on its connection, and nothing waits for a
/// handler that never responds.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle(&self, request: InboundRequest, response: SendResponse);
}

#[async_trait]
impl<F, Fut> InboundHandler for F
where
    F: Fn(InboundRequest, SendResponse) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, request: InboundRequest, response: SendResponse) {
        (self)(request, response).await;
    }
}

/// Counters aggregated across all connections of one listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    received: AtomicU64,
    total_messages: AtomicU64,
}

impl ListenerStats {
    /// Completed MLLP frames across all connections.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Logical messages parsed out of those frames. At least `received`,
    /// since one frame may carry a whole batch or file.
    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }
}

struct ConnectionHandle {
    peer: SocketAddr,
    shutdown: CancellationToken,
}

/// State shared between the accept loop and every connection task.
struct Shared {
    name: String,
    encoding: TextEncoding,
    msh_overrides: Arc<Vec<(String, MshOverride)>>,
    handler: Arc<dyn InboundHandler>,
    stats: Arc<ListenerStats>,
    events: EventSender,
    connections: Arc<DashMap<u64, ConnectionHandle>>,
}

/// One listening MLLP endpoint.
pub struct Inbound {
    name: String,
    local_addr: SocketAddr,
    stats: Arc<ListenerStats>,
    events: EventSender,
    connections: Arc<DashMap<u64, ConnectionHandle>>,
    accept_task: JoinHandle<()>,
    closed: AtomicBool,
}

impl Inbound {
    /// Validate the configuration, bind the socket and start accepting.
    ///
    /// Configuration problems (bad addresses, bad names, bad TLS
    /// material, out-of-range ports) and bind failures are fatal here;
    /// no partial listener is ever created. Everything after this point
    /// is reported through [`InboundEvent`] notifications.
    pub async fn new(
        server_options: &ServerOptions,
        options: ListenerOptions,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Inbound> {
        let server_options = normalize_server_options(server_options.clone())?;
        let options = normalize_listener_options(options, server_options.encoding)?;

        let name = options.name.clone().unwrap_or_default();
        let encoding = options.encoding.unwrap_or(server_options.encoding);

        let tls_acceptor = match &server_options.tls {
            Some(tls) => Some(build_tls_acceptor(tls)?),
            None => None,
        };

        let bind_addr = resolve_bind_addr(&server_options, options.port)?;
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let (events, _) = broadcast::channel(64);
        let stats = Arc::new(ListenerStats::default());
        let connections = Arc::new(DashMap::new());

        let shared = Arc::new(Shared {
            name: name.clone(),
            encoding,
            msh_overrides: Arc::new(options.msh_overrides),
            handler,
            stats: Arc::clone(&stats),
            events: events.clone(),
            connections: Arc::clone(&connections),
        });

        info!(
            "[{}] listening on {}{}",
            name,
            local_addr,
            if tls_acceptor.is_some() { " (TLS)" } else { "" }
        );
        emit(
            &events,
            InboundEvent::Listen {
                port: local_addr.port(),
            },
        );

        let accept_task = tokio::spawn(accept_loop(listener, tls_acceptor, shared));

        Ok(Inbound {
            name,
            local_addr,
            stats,
            events,
            connections,
            accept_task,
            closed: AtomicBool::new(false),
        })
    }

    /// The listener name (configured or randomized).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound address, useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Frame and message counters for this listener.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Currently tracked connections.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Subscribe to this listener's notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.events.subscribe()
    }

    /// Stop accepting, terminate every tracked connection without
    /// waiting for in-flight handlers, and release the listening socket.
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.accept_task.abort();
        for entry in self.connections.iter() {
            entry.value().shutdown.cancel();
        }
        self.connections.clear();

        info!("[{}] listener closed", self.name);
        Ok(())
    }
}

impl Drop for Inbound {
    fn drop(&mut self) {
        self.accept_task.abort();
        for entry in self.connections.iter() {
            entry.value().shutdown.cancel();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
) {
    let mut next_id: u64 = 0;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                next_id += 1;
                spawn_connection(next_id, stream, peer, tls_acceptor.clone(), &shared);
            }
            Err(e) => {
                error!("[{}] accept error: {}", shared.name, e);
                emit(
                    &shared.events,
                    InboundEvent::Error {
                        message: e.to_string(),
                    },
                );
                // don't spin on a persistent socket error
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn spawn_connection(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    shared: &Arc<Shared>,
) {
    // favour latency over throughput for small protocol messages
    if let Err(e) = stream.set_nodelay(true) {
        debug!("[{}] could not disable send delay for {}: {}", shared.name, peer, e);
    }

    let shutdown = CancellationToken::new();
    shared.connections.insert(
        id,
        ConnectionHandle {
            peer,
            shutdown: shutdown.clone(),
        },
    );
    emit(&shared.events, InboundEvent::ClientConnect { peer });
    debug!("[{}] client {} connected", shared.name, peer);

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let had_error = tokio::select! {
            _ = shutdown.cancelled() => false,
            had_error = serve_connection(stream, tls_acceptor, peer, &shared) => had_error,
        };

        shared.connections.remove(&id);
        emit(&shared.events, InboundEvent::ClientClose { peer, had_error });
        debug!("[{}] client {} closed", shared.name, peer);
    });
}

async fn serve_connection(
    stream: TcpStream,
    tls_acceptor: Option<TlsAcceptor>,
    peer: SocketAddr,
    shared: &Shared,
) -> bool {
    match tls_acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => handle_connection(Box::new(tls_stream), peer, shared).await,
            Err(e) => {
                warn!("[{}] TLS handshake with {} failed: {}", shared.name, peer, e);
                emit(
                    &shared.events,
                    InboundEvent::ClientError {
                        peer,
                        message: e.to_string(),
                    },
                );
                true
            }
        },
        None => handle_connection(Box::new(stream), peer, shared).await,
    }
}

// Runs one connection to completion. Returns whether it ended in error.
async fn handle_connection(stream: Box<dyn Transport>, peer: SocketAddr, shared: &Shared) -> bool {
    // a fresh codec per connection: reassembly state is never shared
    let framed = Framed::new(stream, MllpCodec::with_encoding(shared.encoding));
    let (sink, mut frames) = framed.split();
    let sink: SharedSink = Arc::new(Mutex::new(sink));

    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut had_error = false;

    while let Some(result) = frames.next().await {
        // reap handler tasks that have already finished
        while in_flight.try_join_next().is_some() {}

        match result {
            Ok(unit) => {
                shared.stats.received.fetch_add(1, Ordering::Relaxed);
                emit(
                    &shared.events,
                    InboundEvent::DataRaw {
                        frame: unit.clone(),
                    },
                );

                if let Err(e) = dispatch_unit(&unit, peer, &sink, shared, &mut in_flight) {
                    // the frame is dropped, the connection stays open
                    warn!("[{}] bad data from {}: {}", shared.name, peer, e);
                    emit(
                        &shared.events,
                        InboundEvent::DataError {
                            message: e.to_string(),
                        },
                    );
                }
            }
            Err(e) => {
                warn!("[{}] client {} errored: {}", shared.name, peer, e);
                emit(
                    &shared.events,
                    InboundEvent::ClientError {
                        peer,
                        message: e.to_string(),
                    },
                );
                had_error = true;
                break;
            }
        }
    }

    // in-flight handlers are cancelled, not awaited: connection close is
    // the only cancellation signal a handler gets
    in_flight.abort_all();
    had_error
}

/// Classify one reassembled unit, decompose it into logical messages and
/// dispatch each to the handler with its own request/response pair.
fn dispatch_unit(
    unit: &str,
    peer: SocketAddr,
    sink: &SharedSink,
    shared: &Shared,
    in_flight: &mut JoinSet<()>,
) -> Result<()> {
    let raw_messages: Vec<(String, MessageOrigin)> = if is_file(unit) {
        FileBatch::new(unit)
            .messages()
            .into_iter()
            .map(|m| (m, MessageOrigin::File))
            .collect()
    } else if is_batch(unit) {
        Batch::new(unit)
            .messages()
            .into_iter()
            .map(|m| (m, MessageOrigin::Batch))
            .collect()
    } else {
        vec![(unit.to_string(), MessageOrigin::Single)]
    };

    for (raw, origin) in raw_messages {
        let message = Message::parse(&raw)?;
        shared.stats.total_messages.fetch_add(1, Ordering::Relaxed);

        let request = InboundRequest::new(message.clone(), origin, peer);
        let response = SendResponse::new(
            Arc::clone(sink),
            message,
            Arc::clone(&shared.msh_overrides),
            peer,
            shared.events.clone(),
        );

        let handler = Arc::clone(&shared.handler);
        in_flight.spawn(async move {
            handler.handle(request, response).await;
        });
    }

    Ok(())
}

fn resolve_bind_addr(options: &ServerOptions, port: u16) -> Result<SocketAddr> {
    let ip = if options.bind_address == "localhost" {
        if options.ipv6 {
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    } else if options.ipv6 {
        IpAddr::V6(
            options
                .bind_address
                .parse()
                .map_err(|_| Error::Server("bindAddress is an invalid ipv6 address.".to_string()))?,
        )
    } else {
        IpAddr::V4(
            options
                .bind_address
                .parse()
                .map_err(|_| Error::Server("bindAddress is an invalid ipv4 address.".to_string()))?,
        )
    };

    Ok(SocketAddr::new(ip, port))
}

fn build_tls_acceptor(options: &TlsOptions) -> Result<TlsAcceptor> {
    if options.request_cert && options.ca.is_none() {
        return Err(Error::Server(
            "client certificates requested but no CA material given.".to_string(),
        ));
    }

    let certs = rustls_pemfile::certs(&mut &options.cert[..])
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut &options.key[..])?
        .ok_or_else(|| Error::Server("no private key found in TLS material.".to_string()))?;

    let config = match (options.request_cert, &options.ca) {
        (true, Some(ca)) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut &ca[..]) {
                roots
                    .add(cert?)
                    .map_err(|e| Error::Server(format!("bad CA certificate: {}", e)))?;
            }

            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| Error::Server(format!("could not build client verifier: {}", e)))?;

            TlsServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        _ => TlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?,
    };

    Ok(TlsAcceptor::from(Arc::new(config)))
}
