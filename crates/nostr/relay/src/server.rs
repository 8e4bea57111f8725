//! WebSocket server for handling client connections
//!
//! The relay kernel is single-threaded, so it runs on its own thread and owns
//! the [`Relay`]. Connection tasks on the tokio runtime talk to it over
//! channels: transport notifications go in as [`KernelCommand`]s, and frames
//! for a connection come back on that connection's outbound channel.

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::metrics::RelayMetrics;
use crate::relay::Relay;
use crate::session::{Frame, Handshake, Transport, TransportError, TransportEvent, TransportHandle};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header;
use tracing::{debug, error, info, warn};

const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Work for the kernel thread.
#[derive(Debug)]
pub enum KernelCommand {
    Connect {
        handle: TransportHandle,
        handshake: Handshake,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    Data {
        handle: TransportHandle,
        frame: Frame,
    },
    Closed {
        handle: TransportHandle,
    },
}

/// Kernel to connection task.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    Close,
}

/// [`Transport`] backed by a connection task's outbound channel.
struct ChannelTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Frame) -> std::result::Result<(), TransportError> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// What the kernel hands back once it is up.
struct KernelReady {
    metrics: Arc<RelayMetrics>,
}

/// Nostr relay server
pub struct RelayServer {
    config: RelayConfig,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn start(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Relay server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let (kernel, ready) = spawn_kernel(self.config)?;
        let ready = ready.await.map_err(|_| RelayError::KernelStopped)?;

        let metrics = Arc::clone(&ready.metrics);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let snapshot = metrics.snapshot();
                info!(
                    "Relay metrics: {} connections, {} received, {} stored, {} duplicate, {} bad, {} bytes in, {} bytes out",
                    snapshot.active_connections,
                    snapshot.events_received,
                    snapshot.events_stored,
                    snapshot.events_duplicate,
                    snapshot.bad_messages,
                    snapshot.bytes_received,
                    snapshot.bytes_sent,
                );
            }
        });

        let mut next_handle = 0u64;
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    next_handle += 1;
                    let handle = TransportHandle(next_handle);
                    debug!("New connection {} from {}", handle, addr);

                    let kernel = kernel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, handle, kernel).await {
                            error!("Error handling connection from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}

fn spawn_kernel(
    config: RelayConfig,
) -> Result<(
    mpsc::UnboundedSender<KernelCommand>,
    oneshot::Receiver<KernelReady>,
)> {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("relay-kernel".to_string())
        .spawn(move || {
            if let Err(e) = run_kernel(config, commands_rx, ready_tx) {
                error!("Relay kernel failed: {}", e);
            }
        })?;
    Ok((commands_tx, ready_rx))
}

/// Own the relay and apply commands until every sender is gone.
fn run_kernel(
    config: RelayConfig,
    mut commands: mpsc::UnboundedReceiver<KernelCommand>,
    ready: oneshot::Sender<KernelReady>,
) -> Result<()> {
    let relay = Relay::new(config);
    relay.connect();

    let info = relay.information_document()?;
    ready
        .send(KernelReady {
            metrics: relay.metrics(),
        })
        .map_err(|_| RelayError::KernelStopped)?;
    info!("Relay kernel started, supporting NIPs {:?}", info.supported_nips);

    while let Some(command) = commands.blocking_recv() {
        let result = match command {
            KernelCommand::Connect {
                handle,
                handshake,
                outbound,
            } => relay
                .accept(handle, handshake, Rc::new(ChannelTransport { outbound }))
                .map(|_| ()),
            KernelCommand::Data { handle, frame } => {
                relay.handle(handle, TransportEvent::Data(frame))
            }
            KernelCommand::Closed { handle } => relay.handle(handle, TransportEvent::Closed),
        };
        if let Err(e) = result {
            warn!("Kernel command failed: {}", e);
        }
        relay.run_pending();
    }

    info!("Relay kernel stopped");
    Ok(())
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: TransportHandle,
    kernel: mpsc::UnboundedSender<KernelCommand>,
) -> Result<()> {
    let mut handshake = Handshake {
        remote_addr: Some(addr),
        ..Handshake::default()
    };

    let ws_stream = accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            handshake.path = request.uri().path().to_string();
            handshake.user_agent = request
                .headers()
                .get(header::USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            Ok(response)
        },
    )
    .await
    .map_err(|e| RelayError::WebSocket(e.to_string()))?;
    info!("WebSocket connection established: {} ({})", addr, handle);

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    kernel
        .send(KernelCommand::Connect {
            handle,
            handshake,
            outbound: outbound_tx,
        })
        .map_err(|_| RelayError::KernelStopped)?;

    let (mut write, mut read) = ws_stream.split();
    let result = loop {
        tokio::select! {
            msg = read.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(text))) => Frame::text(text.as_str()),
                    Some(Ok(Message::Binary(data))) => Frame::binary(data),
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client {} disconnected", addr);
                        break Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", addr, e);
                        break Ok(());
                    }
                };
                if kernel.send(KernelCommand::Data { handle, frame }).is_err() {
                    break Err(RelayError::KernelStopped);
                }
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = write.send(to_message(frame)).await {
                            warn!("Failed to send to {}: {}", addr, e);
                            break Ok(());
                        }
                    }
                    Some(Outbound::Close) | None => {
                        debug!("Relay closed connection {}", handle);
                        let _ = write.send(Message::Close(None)).await;
                        break Ok(());
                    }
                }
            }
        }
    };

    let _ = kernel.send(KernelCommand::Closed { handle });
    info!("Connection closed: {}", addr);
    result
}

fn to_message(frame: Frame) -> Message {
    match frame.as_text() {
        Some(text) => Message::text(text.to_owned()),
        None => Message::binary(frame.data),
    }
}
