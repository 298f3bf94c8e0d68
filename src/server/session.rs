//! Connection session
//!
//! Owns one upgraded stream. Inbound bytes are fed through the frame decoder
//! and each event is dispatched: text is echoed back with a label, pongs are
//! logged, close is answered and ends the session. A keep-alive ping goes
//! out every 30 seconds for as long as the stream stays writable.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::frame::{close_frame, ping_frame, text_frame, FrameDecoder};
use super::handshake::switching_protocols_response;
use super::protocol::{DecodedEvent, ProtocolError, ProtocolResult, ECHO_PREFIX};

/// Keep-alive ping period
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Open,
    Closed,
}

/// Counters reported when a session ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub frames_received: u64,
    pub echoes_sent: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// One upgraded WebSocket connection
pub struct ConnectionSession<S> {
    id: Uuid,
    stream: S,
    decoder: FrameDecoder,
    state: SessionState,
    summary: SessionSummary,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<S> ConnectionSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a session for `stream`.
    ///
    /// `pending` holds bytes the client sent right after its request head;
    /// they are decoded before anything else is read.
    pub fn new(stream: S, pending: BytesMut, shutdown_rx: broadcast::Receiver<()>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream,
            decoder: FrameDecoder::with_buffer(pending),
            state: SessionState::Handshaking,
            summary: SessionSummary::default(),
            shutdown_rx,
        }
    }

    /// Session identifier used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state
    #[allow(dead_code)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Complete the handshake by sending `101 Switching Protocols`
    pub async fn open(&mut self, accept_token: &str) -> ProtocolResult<()> {
        let response = switching_protocols_response(accept_token);
        self.write(response.as_bytes()).await?;
        self.transition(SessionState::Open);
        info!("[{}] Client connected", self.id);
        Ok(())
    }

    /// Drive the session until the peer closes, an error occurs or the
    /// server shuts down
    pub async fn run(mut self) -> ProtocolResult<SessionSummary> {
        if self.state != SessionState::Open {
            return Err(ProtocolError::SessionNotOpen);
        }

        let mut keepalive = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = self.event_loop(&mut keepalive).await;
        // Timer is released with `keepalive` when this returns
        self.transition(SessionState::Closed);
        // Errors are reported by the caller
        if let Ok(summary) = &result {
            info!(
                "[{}] Session closed ({} frames, {} echoes, {} pings)",
                self.id, summary.frames_received, summary.echoes_sent, summary.pings_sent
            );
        }
        result
    }

    async fn event_loop(
        &mut self,
        keepalive: &mut tokio::time::Interval,
    ) -> ProtocolResult<SessionSummary> {
        // Frames that arrived together with the request head
        if self.drain().await? == Flow::Stop {
            return Ok(self.summary);
        }

        loop {
            tokio::select! {
                read = self.stream.read_buf(self.decoder.buffer_mut()) => {
                    match read? {
                        0 => {
                            if let Some(DecodedEvent::Error(e)) = self.decoder.finish() {
                                warn!("[{}] Discarding partial frame at end of stream: {}", self.id, e);
                            }
                            debug!("[{}] Connection closed by peer", self.id);
                            break;
                        }
                        n => {
                            trace!("[{}] Read {} bytes", self.id, n);
                            if self.drain().await? == Flow::Stop {
                                break;
                            }
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.write(&ping_frame()).await {
                        debug!("[{}] Socket no longer writable, stopping keep-alive", self.id);
                        return Err(e);
                    }
                    self.summary.pings_sent += 1;
                    trace!("[{}] Sent ping", self.id);
                }
                _ = self.shutdown_rx.recv() => {
                    info!("[{}] Shutdown signal received, closing connection", self.id);
                    let _ = self.write(&close_frame()).await;
                    break;
                }
            }
        }

        Ok(self.summary)
    }

    /// Dispatch every complete frame currently buffered
    async fn drain(&mut self) -> ProtocolResult<Flow> {
        while let Some(event) = self.decoder.decode() {
            if self.dispatch(event).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    async fn dispatch(&mut self, event: DecodedEvent) -> ProtocolResult<Flow> {
        match event {
            DecodedEvent::Text(text) => {
                self.summary.frames_received += 1;
                debug!("[{}] Client says: {}", self.id, text);
                match text_frame(&format!("{ECHO_PREFIX}{text}")) {
                    Ok(frame) => {
                        self.write(&frame).await?;
                        self.summary.echoes_sent += 1;
                    }
                    Err(e) => warn!("[{}] Dropping echo: {}", self.id, e),
                }
                Ok(Flow::Continue)
            }
            DecodedEvent::Pong => {
                self.summary.frames_received += 1;
                self.summary.pongs_received += 1;
                debug!("[{}] Heartbeat: pong received", self.id);
                Ok(Flow::Continue)
            }
            DecodedEvent::Close => {
                self.summary.frames_received += 1;
                info!("[{}] Client requested close", self.id);
                self.write(&close_frame()).await?;
                let _ = self.stream.shutdown().await;
                Ok(Flow::Stop)
            }
            DecodedEvent::Unsupported(opcode) => {
                self.summary.frames_received += 1;
                debug!(
                    "[{}] Ignoring frame with unsupported opcode {:#x}",
                    self.id, opcode
                );
                Ok(Flow::Continue)
            }
            DecodedEvent::Error(e) => {
                warn!("[{}] Frame error: {}", self.id, e);
                let _ = self.write(&close_frame()).await;
                Ok(Flow::Stop)
            }
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> ProtocolResult<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        debug!("[{}] {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }
}
