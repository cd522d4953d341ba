//! Newline-delimited JSON-RPC 2.0 over stdin/stdout
//!
//! A stdio process has exactly one peer, addressed as [`CLIENT_ID`]. Lines are
//! processed sequentially; numeric request ids are remembered so responses
//! echo them back with their original JSON type.

use super::{Transport, TransportEvents, TransportType};
use crate::error::{ErrorKind, Result, TransportError};
use crate::protocol::{Envelope, EnvelopeKind, ErrorInfo, JsonRpcFrame, JsonRpcId};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

pub const CLIENT_ID: &str = "stdio";

const MAX_LINE_LENGTH: usize = 1024 * 1024;

enum Line {
    Text(String),
    /// The line was longer than `MAX_LINE_LENGTH` and has been discarded.
    Oversize,
}

/// `LinesCodec` that reports an over-long line as an item instead of a
/// stream error. The inner codec skips to the next newline on its own.
struct BoundedLines(LinesCodec);

impl BoundedLines {
    fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
    }

    fn map(decoded: std::result::Result<Option<String>, LinesCodecError>) -> DecodeResult {
        match decoded {
            Ok(line) => Ok(line.map(Line::Text)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Line::Oversize)),
            Err(e) => Err(e),
        }
    }
}

type DecodeResult = std::result::Result<Option<Line>, LinesCodecError>;

impl Decoder for BoundedLines {
    type Item = Line;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut bytes::BytesMut) -> DecodeResult {
        Self::map(self.0.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut bytes::BytesMut) -> DecodeResult {
        Self::map(self.0.decode_eof(buf))
    }
}

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LinesCodec>;

pub struct StdioTransport {
    reader: std::sync::Mutex<Option<Reader>>,
    writer: Arc<Mutex<Writer>>,
    pending_ids: Arc<DashMap<String, JsonRpcId>>,
    running: Arc<AtomicBool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioTransport {
    pub fn new() -> Self {
        Self::with_io(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Runs the transport over arbitrary byte streams.
    pub fn with_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self {
            reader: std::sync::Mutex::new(Some(Box::new(reader))),
            writer: Arc::new(Mutex::new(FramedWrite::new(
                writer,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            ))),
            pending_ids: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            task: std::sync::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn write_frame(writer: &Mutex<Writer>, frame: &JsonRpcFrame) -> Result<()> {
    let line = serde_json::to_string(frame)?;
    writer
        .lock()
        .await
        .send(line)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()).into())
}

/// Answers an unreadable line with an id-less `InvalidRequest` error.
async fn reject(writer: &Mutex<Writer>, message: String) {
    let reply = Envelope::error(None, ErrorInfo::new(ErrorKind::InvalidRequest, message));
    if let Err(e) = write_frame(writer, &JsonRpcFrame::from_envelope(reply, None)).await {
        warn!(error = %e, "Failed to write error frame");
    }
}

async fn read_loop(
    reader: Reader,
    writer: Arc<Mutex<Writer>>,
    pending_ids: Arc<DashMap<String, JsonRpcId>>,
    running: Arc<AtomicBool>,
    events: Arc<dyn TransportEvents>,
) {
    let mut lines = FramedRead::new(reader, BoundedLines::new());
    events.on_connect(CLIENT_ID).await;

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(Line::Text(line)) => line,
            Ok(Line::Oversize) => {
                debug!(limit = MAX_LINE_LENGTH, "Discarding over-long line");
                reject(&writer, format!("line exceeds {MAX_LINE_LENGTH} bytes")).await;
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read from stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match JsonRpcFrame::parse(&line) {
            Ok(frame) => {
                if let (Some(id), Some(_)) = (&frame.id, &frame.method) {
                    pending_ids.insert(id.as_key(), id.clone());
                }
                events.on_message(CLIENT_ID, frame.into_envelope()).await;
            }
            Err(e) => {
                debug!(error = %e, "Rejecting malformed frame");
                reject(&writer, e.to_string()).await;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    events.on_disconnect(CLIENT_ID).await;
    info!("stdin closed");
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self, events: Arc<dyn TransportEvents>) -> Result<()> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or(TransportError::AlreadyStarted)?;
        self.running.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(read_loop(
            reader,
            self.writer.clone(),
            self.pending_ids.clone(),
            self.running.clone(),
            events,
        ));
        *self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
        info!("Stdio transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        let mut writer = self.writer.lock().await;
        SinkExt::<String>::flush(&mut *writer)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn send(&self, client_id: &str, envelope: Envelope) -> Result<()> {
        if client_id != CLIENT_ID {
            return Err(TransportError::UnknownClient(client_id.to_string()).into());
        }

        let original_id = match envelope.kind {
            EnvelopeKind::Response | EnvelopeKind::Error => envelope
                .id
                .as_ref()
                .and_then(|id| self.pending_ids.remove(id))
                .map(|(_, original)| original),
            _ => None,
        };
        write_frame(&self.writer, &JsonRpcFrame::from_envelope(envelope, original_id)).await
    }

    async fn broadcast(&self, envelope: Envelope) -> Result<()> {
        self.send(CLIENT_ID, envelope).await
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Stdio
    }
}
