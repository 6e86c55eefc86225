//! Chunked streaming: `open` / `data` / `end` / `error` frames.
//!
//! A writer is single-writer: chunks carry a monotonically increasing
//! sequence, oversized chunks are split at the configured chunk size, and
//! binary chunks travel base64-encoded with the `b64` flag.  Writing after
//! end is an error; a stream never reopens.  The receiving side buffers
//! chunks and exposes them as an asynchronous iterator that terminates on
//! `end` and fails with the reason on `error`.

use crate::error::{BusError, BusResult, ErrorKind};
use crate::router::SendFn;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::Stream;
use mb_protocol::{Envelope, MessageKind, StreamFrame};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default split threshold for outgoing chunks, in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 64_000;

/// One stream chunk, text or binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Text(String),
    Binary(Vec<u8>),
}

impl Chunk {
    pub fn len(&self) -> usize {
        match self {
            Chunk::Text(s) => s.len(),
            Chunk::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Sending half of a stream session.
pub struct StreamWriter {
    sid: String,
    name: String,
    seq: AtomicU64,
    ended: AtomicBool,
    chunk_size: usize,
    send: SendFn,
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("sid", &self.sid)
            .field("name", &self.name)
            .field("seq", &self.seq)
            .field("ended", &self.ended)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl StreamWriter {
    /// Open a new stream toward `send`, announcing `name` and `meta`.
    pub async fn open(
        name: &str,
        meta: Option<Map<String, Value>>,
        chunk_size: usize,
        send: SendFn,
    ) -> BusResult<StreamWriter> {
        let sid = Uuid::new_v4().to_string();
        let frame = StreamFrame::Open {
            sid: sid.clone(),
            name: name.to_owned(),
            meta,
        };
        send(stream_envelope(&frame)).await?;
        debug!(sid, name, "stream opened");
        Ok(StreamWriter {
            sid,
            name: name.to_owned(),
            seq: AtomicU64::new(0),
            ended: AtomicBool::new(false),
            chunk_size,
            send,
        })
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write one chunk, splitting it when it exceeds the chunk size.
    pub async fn write(&self, chunk: Chunk) -> BusResult<()> {
        if self.ended.load(Ordering::Acquire) {
            return Err(BusError::msg(
                ErrorKind::ChannelClosed,
                "stream already ended",
            ));
        }
        match chunk {
            Chunk::Binary(bytes) => {
                for part in split_bytes(&bytes, self.chunk_size) {
                    self.send_data(BASE64.encode(part), true).await?;
                }
            }
            Chunk::Text(text) => {
                for part in split_text(&text, self.chunk_size) {
                    self.send_data(part.to_owned(), false).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn write_text(&self, text: impl Into<String>) -> BusResult<()> {
        self.write(Chunk::Text(text.into())).await
    }

    pub async fn write_bytes(&self, bytes: impl Into<Vec<u8>>) -> BusResult<()> {
        self.write(Chunk::Binary(bytes.into())).await
    }

    /// Graceful completion.  Idempotent; later writes fail.
    pub async fn end(&self) -> BusResult<()> {
        if self.ended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let frame = StreamFrame::End {
            sid: self.sid.clone(),
        };
        self.send.clone()(stream_envelope(&frame)).await
    }

    /// Abnormal termination with a reason.  The session never reopens.
    pub async fn abort(&self, reason: &str) -> BusResult<()> {
        if self.ended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let frame = StreamFrame::Error {
            sid: self.sid.clone(),
            reason: reason.to_owned(),
        };
        self.send.clone()(stream_envelope(&frame)).await
    }

    async fn send_data(&self, d: String, b64: bool) -> BusResult<()> {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let frame = StreamFrame::Data {
            sid: self.sid.clone(),
            seq,
            d,
            b64,
        };
        self.send.clone()(stream_envelope(&frame)).await
    }
}

fn stream_envelope(frame: &StreamFrame) -> Value {
    Envelope::new(
        MessageKind::Stream,
        serde_json::to_value(frame).expect("stream frame serializes"),
    )
    .to_value()
}

fn split_bytes(bytes: &[u8], size: usize) -> impl Iterator<Item = &[u8]> {
    bytes.chunks(size.max(1))
}

/// Split on char boundaries so every part stays valid UTF-8.
fn split_text(text: &str, size: usize) -> Vec<&str> {
    let size = size.max(4);
    let mut parts = Vec::new();
    let mut rest = text;
    while rest.len() > size {
        let mut cut = size;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        parts.push(head);
        rest = tail;
    }
    parts.push(rest);
    parts
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

enum StreamItem {
    Chunk(Chunk),
    End,
    Error(String),
}

/// Receiving half of a stream session, handed to the stream acceptor when
/// an `open` frame arrives.
pub struct IncomingStream {
    pub sid: String,
    pub name: String,
    pub meta: Option<Map<String, Value>>,
    pub peer_id: String,
    rx: mpsc::UnboundedReceiver<StreamItem>,
    done: bool,
}

impl IncomingStream {
    /// Next chunk in arrival order.  `Ok(None)` after `end`; an `error`
    /// frame surfaces its reason as `channel-failed`.
    pub async fn next_chunk(&mut self) -> BusResult<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(StreamItem::Chunk(chunk)) => Ok(Some(chunk)),
            Some(StreamItem::End) | None => {
                self.done = true;
                Ok(None)
            }
            Some(StreamItem::Error(reason)) => {
                self.done = true;
                Err(BusError::msg(ErrorKind::ChannelFailed, reason))
            }
        }
    }

    /// The chunks as a futures `Stream`.
    pub fn into_stream(mut self) -> impl Stream<Item = BusResult<Chunk>> {
        async_stream::stream! {
            loop {
                match self.next_chunk().await {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }

    /// Assemble every chunk: the concatenated string when all chunks are
    /// text, otherwise one binary buffer (text chunks contribute their
    /// UTF-8 bytes).
    pub async fn collect(mut self) -> BusResult<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            chunks.push(chunk);
        }
        let all_text = chunks.iter().all(|c| matches!(c, Chunk::Text(_)));
        if all_text {
            let mut out = String::new();
            for chunk in chunks {
                if let Chunk::Text(s) = chunk {
                    out.push_str(&s);
                }
            }
            Ok(Chunk::Text(out))
        } else {
            let mut out = Vec::new();
            for chunk in chunks {
                match chunk {
                    Chunk::Binary(b) => out.extend_from_slice(&b),
                    Chunk::Text(s) => out.extend_from_slice(s.as_bytes()),
                }
            }
            Ok(Chunk::Binary(out))
        }
    }
}

// ---------------------------------------------------------------------------
// Registry (inbound dispatch)
// ---------------------------------------------------------------------------

/// Tracks receiving sessions by stream id and feeds their buffers.
pub struct StreamRegistry {
    sessions: Mutex<HashMap<String, mpsc::UnboundedSender<StreamItem>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        StreamRegistry {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn open_count(&self) -> usize {
        self.sessions.lock().expect("stream lock").len()
    }

    /// Dispatch one inbound frame.  An `open` returns the new session for
    /// the acceptor; `data`/`end`/`error` feed or finish an existing one.
    pub fn handle_frame(&self, frame: StreamFrame, peer_id: &str) -> Option<IncomingStream> {
        match frame {
            StreamFrame::Open { sid, name, meta } => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.sessions
                    .lock()
                    .expect("stream lock")
                    .insert(sid.clone(), tx);
                Some(IncomingStream {
                    sid,
                    name,
                    meta,
                    peer_id: peer_id.to_owned(),
                    rx,
                    done: false,
                })
            }
            StreamFrame::Data { sid, seq, d, b64 } => {
                let chunk = if b64 {
                    match BASE64.decode(d.as_bytes()) {
                        Ok(bytes) => Chunk::Binary(bytes),
                        Err(e) => {
                            warn!(sid, seq, error = %e, "undecodable base64 chunk dropped");
                            return None;
                        }
                    }
                } else {
                    Chunk::Text(d)
                };
                let sessions = self.sessions.lock().expect("stream lock");
                match sessions.get(&sid) {
                    Some(tx) => {
                        let _ = tx.send(StreamItem::Chunk(chunk));
                    }
                    None => warn!(sid, seq, "data frame for unknown stream"),
                }
                None
            }
            StreamFrame::End { sid } => {
                if let Some(tx) = self.sessions.lock().expect("stream lock").remove(&sid) {
                    let _ = tx.send(StreamItem::End);
                }
                None
            }
            StreamFrame::Error { sid, reason } => {
                if let Some(tx) = self.sessions.lock().expect("stream lock").remove(&sid) {
                    let _ = tx.send(StreamItem::Error(reason));
                }
                None
            }
        }
    }

    /// Abort every receiving session (teardown).
    pub fn clear(&self) {
        let sessions: Vec<mpsc::UnboundedSender<StreamItem>> = {
            let mut map = self.sessions.lock().expect("stream lock");
            map.drain().map(|(_, tx)| tx).collect()
        };
        for tx in sessions {
            let _ = tx.send(StreamItem::Error("bus destroyed".to_owned()));
        }
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
