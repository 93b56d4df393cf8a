use crate::audit::{ConnectionRegistry, LogDirection, LogEntry};
use crate::config::EngineConfig;
use crate::database::DatabaseAdapter;
use crate::device::DeviceAdapter;
use crate::dispatch::run_bounded;
use crate::responder::{Responder, Response};
use crate::validation::{self, Direction};
use crate::{strip_framing, Message};
use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

// MLLP specific constants
pub const MLLP_START_BLOCK: u8 = 0x0B; // Vertical Tab
pub const MLLP_END_BLOCK: u8 = 0x1C; // File Separator
pub const MLLP_CARRIAGE_RETURN: u8 = 0x0D; // Carriage Return

/// Receive buffer bound used when none is configured
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Frames waiting for their response per connection
const FRAME_QUEUE_DEPTH: usize = 32;

/// Errors that can occur in MLLP operations
#[derive(Debug, Error)]
pub enum MllpError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("MLLP frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("Cannot listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Codec for encoding/decoding MLLP frames
///
/// A frame runs from `0x0B` to the next `0x1C`. A `0x0D` directly after the
/// end block is consumed with the frame. Bytes outside a frame are discarded.
#[derive(Debug, Clone)]
pub struct MllpCodec {
    max_frame_bytes: usize,
}

impl MllpCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for MllpCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for MllpCodec {
    type Item = Bytes;
    type Error = MllpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|&b| b == MLLP_START_BLOCK) {
            Some(start_pos) => {
                if start_pos > 0 {
                    discard(src, start_pos);
                }

                if let Some(end_pos) = src.iter().position(|&b| b == MLLP_END_BLOCK) {
                    // the body sits between the start block at 0 and end_pos
                    if end_pos - 1 > self.max_frame_bytes {
                        return Err(MllpError::FrameTooLarge {
                            limit: self.max_frame_bytes,
                        });
                    }
                    let mut frame = src.split_to(end_pos + 1);
                    if src.first() == Some(&MLLP_CARRIAGE_RETURN) {
                        src.advance(1);
                    }
                    // drop the start and end blocks
                    frame.advance(1);
                    frame.truncate(frame.len() - 1);
                    return Ok(Some(frame.freeze()));
                }
            }
            None if !src.is_empty() => {
                let len = src.len();
                discard(src, len);
            }
            None => {}
        }

        // only a start block and a partial body can remain here
        if src.len().saturating_sub(1) > self.max_frame_bytes {
            return Err(MllpError::FrameTooLarge {
                limit: self.max_frame_bytes,
            });
        }

        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            warn!("Discarding {} bytes of an incomplete frame", src.len());
            src.clear();
        }
        Ok(None)
    }
}

impl Encoder<String> for MllpCodec {
    type Error = MllpError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(wrap_in_mllp(&item).as_bytes());
        Ok(())
    }
}

/// Drop `count` leading bytes that are not part of any frame
fn discard(src: &mut BytesMut, count: usize) {
    let noise = src[..count]
        .iter()
        .any(|b| !b.is_ascii_whitespace() && *b != MLLP_END_BLOCK);
    if noise {
        warn!("Discarding {} bytes outside of an MLLP frame", count);
    }
    src.advance(count);
}

/// Wrap an HL7 message in an MLLP frame. Already framed input is not wrapped twice.
pub fn wrap_in_mllp(message: &str) -> String {
    let start = MLLP_START_BLOCK as char;
    let end = MLLP_END_BLOCK as char;
    let body = message.strip_prefix(start).unwrap_or(message);
    let body = body
        .strip_suffix(MLLP_CARRIAGE_RETURN as char)
        .and_then(|b| b.strip_suffix(end))
        .or_else(|| body.strip_suffix(end))
        .unwrap_or(body);

    let mut framed = String::with_capacity(body.len() + 3);
    framed.push(start);
    framed.push_str(body);
    framed.push(end);
    framed.push(MLLP_CARRIAGE_RETURN as char);
    framed
}

/// Turns one inbound frame into at most one response
pub struct MessageHandler {
    device: Arc<dyn DeviceAdapter>,
    database: Arc<dyn DatabaseAdapter>,
    responder: Responder,
    dispatch_timeout: Duration,
}

impl MessageHandler {
    pub fn new(
        device: Arc<dyn DeviceAdapter>,
        database: Arc<dyn DatabaseAdapter>,
        responder: Responder,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            device,
            database,
            responder,
            dispatch_timeout,
        }
    }

    pub fn from_config(
        config: &EngineConfig,
        device: Arc<dyn DeviceAdapter>,
        database: Arc<dyn DatabaseAdapter>,
    ) -> Self {
        Self::new(
            device,
            database,
            Responder::from_config(config),
            config.server.dispatch_timeout(),
        )
    }

    /// Parse, validate and answer one frame. Blocking.
    ///
    /// Returns `None` when the frame cannot be parsed.
    pub fn handle(&self, frame: &[u8]) -> Option<Response> {
        let message = match self.device.parse_message(frame) {
            Ok(message) => message,
            Err(e) => {
                error!("Dropping unparseable frame: {}", e);
                return None;
            }
        };
        validation::validate(&message, Direction::Inbound);

        let response = self
            .responder
            .respond(&message, self.device.as_ref(), self.database.as_ref());

        if let Some(outbound) = &response.message {
            match Message::parse(outbound) {
                Ok(parsed) => {
                    validation::validate(&parsed, Direction::Outbound);
                }
                Err(e) => warn!("Generated response does not parse: {}", e),
            }
        }
        Some(response)
    }
}

/// Shared state handed to every connection task
#[derive(Clone)]
struct ConnectionContext {
    handler: Arc<MessageHandler>,
    registry: Arc<ConnectionRegistry>,
    max_frame_bytes: usize,
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

/// MLLP Server that listens for connections and handles HL7 messages
pub struct MllpServer {
    address: String,
    context: ConnectionContext,
    running: Arc<AtomicBool>,
    state: Mutex<Option<RunningServer>>,
}

impl MllpServer {
    /// Create a new MLLP server with specified address and message handler
    pub fn new<A: ToString>(
        address: A,
        handler: MessageHandler,
        max_frame_bytes: usize,
        audit_capacity: usize,
    ) -> Self {
        Self {
            address: address.to_string(),
            context: ConnectionContext {
                handler: Arc::new(handler),
                registry: Arc::new(ConnectionRegistry::new(audit_capacity)),
                max_frame_bytes,
            },
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        }
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Calling this while already listening returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, MllpError> {
        let mut state = self.state.lock().await;
        if let Some(running) = state.as_ref() {
            debug!("MLLP server already listening on {}", running.local_addr);
            return Ok(running.local_addr);
        }

        let listener = TcpListener::bind(&self.address)
            .await
            .map_err(|source| MllpError::Bind {
                address: self.address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!("MLLP server listening on {}", local_addr);

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.context.clone(),
            shutdown.clone(),
            tracker.clone(),
        ));

        *state = Some(RunningServer {
            local_addr,
            shutdown,
            tracker,
            accept_task,
        });
        self.running.store(true, Ordering::SeqCst);
        Ok(local_addr)
    }

    /// Close the listener, end every connection and wait for them to finish
    pub async fn stop(&self) {
        // held until teardown ends so a concurrent start waits for it
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            return;
        };
        info!("Stopping MLLP server on {}", running.local_addr);

        running.shutdown.cancel();
        if let Err(e) = running.accept_task.await {
            error!("Accept loop ended abnormally: {}", e);
        }
        running.tracker.close();
        running.tracker.wait().await;

        self.running.store(false, Ordering::SeqCst);
        info!("MLLP server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Active connections and their learned device names
    pub fn connections(&self) -> BTreeMap<SocketAddr, String> {
        self.context.registry.connections()
    }

    /// Snapshot of the communication audit log, oldest first
    pub fn communication_log(&self) -> Vec<LogEntry> {
        self.context.registry.log().snapshot()
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: ConnectionContext,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let (socket, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        info!(peer = %addr, "New connection");
        let context = context.clone();
        let token = shutdown.child_token();

        // Spawn a new task to handle this connection
        tracker.spawn(async move {
            context.registry.register(addr);
            if let Err(e) = handle_connection(socket, addr, &context, token).await {
                error!(peer = %addr, "Error handling connection: {}", e);
                context
                    .registry
                    .record(addr, LogDirection::Error, &e.to_string());
            }
            context.registry.unregister(addr);
            info!(peer = %addr, "Connection closed");
        });
    }
    // the listener is dropped here, closing the socket
}

/// Handle a single MLLP connection
///
/// Frames are read as they arrive and answered strictly in arrival order by a
/// separate worker, so response generation never blocks reading.
async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    context: &ConnectionContext,
    shutdown: CancellationToken,
) -> Result<(), MllpError> {
    let (read_half, write_half) = socket.into_split();
    let mut frames = FramedRead::new(read_half, MllpCodec::new(context.max_frame_bytes));
    let writer = FramedWrite::new(write_half, MllpCodec::new(context.max_frame_bytes));

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
    let mut worker = tokio::spawn(respond_in_order(frame_rx, writer, addr, context.clone()));

    let read_result = tokio::select! {
        _ = shutdown.cancelled() => {
            info!(peer = %addr, "Closing connection for shutdown");
            worker.abort();
            return Ok(());
        }
        result = read_frames(&mut frames, &frame_tx, addr, &context.registry) => result,
    };
    drop(frame_tx);

    // let responses to frames already received go out before closing
    tokio::select! {
        _ = shutdown.cancelled() => worker.abort(),
        joined = &mut worker => match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => error!(peer = %addr, "Response worker failed: {}", e),
        },
    }
    read_result
}

async fn read_frames(
    frames: &mut FramedRead<OwnedReadHalf, MllpCodec>,
    queue: &mpsc::Sender<Bytes>,
    addr: SocketAddr,
    registry: &ConnectionRegistry,
) -> Result<(), MllpError> {
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        registry.record(addr, LogDirection::Device, &String::from_utf8_lossy(&frame));
        if frame.is_empty() {
            warn!(peer = %addr, "Empty frame ignored");
            continue;
        }
        info!(peer = %addr, "Received frame ({} bytes)", frame.len());

        if queue.send(frame).await.is_err() {
            // the worker is gone, its error is reported by the caller
            break;
        }
    }
    Ok(())
}

async fn respond_in_order(
    mut queue: mpsc::Receiver<Bytes>,
    mut writer: FramedWrite<OwnedWriteHalf, MllpCodec>,
    addr: SocketAddr,
    context: ConnectionContext,
) -> Result<(), MllpError> {
    while let Some(frame) = queue.recv().await {
        let handler = context.handler.clone();
        let limit = handler.dispatch_timeout;

        let response = match run_bounded(limit, move || handler.handle(&frame)).await {
            Ok(Some(response)) => response,
            Ok(None) => continue,
            Err(e) => {
                warn!(peer = %addr, "No response sent: {}", e);
                context
                    .registry
                    .record(addr, LogDirection::Error, &e.to_string());
                continue;
            }
        };

        if let Some(sender) = &response.sender {
            context.registry.set_name(addr, sender);
        }
        if let Some(message) = response.message {
            let payload = strip_framing(&message).to_string();
            writer.send(message).await?;
            info!(peer = %addr, "Sent response ({} bytes)", payload.len());
            context.registry.record(addr, LogDirection::Server, &payload);
        }
    }
    Ok(())
}

/// Send one message to an MLLP listener and wait up to `wait` for a reply
pub async fn send_message(
    address: &str,
    message: &str,
    wait: Duration,
) -> Result<Option<Bytes>, MllpError> {
    let stream = TcpStream::connect(address).await?;
    let mut framed = Framed::new(stream, MllpCodec::default());
    framed.send(message.to_string()).await?;
    info!("Sent {} bytes to {}", message.len(), address);

    match tokio::time::timeout(wait, framed.next()).await {
        Ok(Some(reply)) => Ok(Some(reply?)),
        Ok(None) => Ok(None),
        Err(_) => {
            warn!("No reply from {} within {:?}", address, wait);
            Ok(None)
        }
    }
}
