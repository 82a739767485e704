//! Connection actor: one task per client channel
//!
//! The actor owns both halves of the client's bidirectional stream. Inbound
//! frames are decoded, parsed, and submitted to the room store one at a
//! time — the store's acknowledgement is awaited before the next frame is
//! read, which gives the per-sender ordering guarantee. Outbound frames
//! arrive on a bounded queue filled by the store and are drained by a
//! writer task.
//!
//! Any read error, write error, or stream close issues a `Disconnect` to
//! the store and ends the actor.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use quinn::{Connection, RecvStream, SendStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::protocol::events::ClientEvent;
use crate::protocol::frame::{Frame, FrameCodec};
use crate::server::rooms::SessionId;
use crate::server::store::StoreHandle;

/// Protocol violations tolerated inside the window before the channel closes
const VIOLATION_LIMIT: usize = 5;
const VIOLATION_WINDOW: Duration = Duration::from_secs(10);

/// Read buffer size for the inbound stream
const READ_BUF_SIZE: usize = 8192;

/// Sliding-window counter for protocol violations
struct ViolationWindow {
    events: VecDeque<Instant>,
    limit: usize,
    window: Duration,
}

impl ViolationWindow {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            limit,
            window,
        }
    }

    /// Record a violation. Returns true once the budget inside the window
    /// is exhausted.
    fn record(&mut self, now: Instant) -> bool {
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) >= self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.push_back(now);
        self.events.len() >= self.limit
    }
}

/// Per-connection actor
pub struct ConnectionActor {
    connection: Connection,
    store: StoreHandle,
    queue_depth: usize,
}

impl ConnectionActor {
    pub fn new(connection: Connection, store: StoreHandle, queue_depth: usize) -> Self {
        Self {
            connection,
            store,
            queue_depth,
        }
    }

    /// Run the actor to completion. The session lives as long as this
    /// future.
    pub async fn run(self) -> Result<()> {
        let remote = self.connection.remote_address();

        // the client opens the single bidirectional channel
        let (send, recv) = self
            .connection
            .accept_bi()
            .await
            .map_err(|e| RelayError::connection(format!("failed to accept channel: {}", e)))?;

        let (out_tx, out_rx) = mpsc::channel::<Bytes>(self.queue_depth);
        let session_id = self.store.connect(out_tx).await?;
        info!(%remote, session = %session_id, "channel open");

        let mut writer = tokio::spawn(write_outbound(send, out_rx));

        let result = self.read_loop(recv, &session_id, &mut writer).await;

        self.store.disconnect(session_id.clone());
        writer.abort();
        self.connection.close(0u32.into(), b"session closed");

        match &result {
            Ok(()) => info!(%remote, session = %session_id, "channel closed"),
            Err(e) => info!(%remote, session = %session_id, error = %e, "channel closed"),
        }
        result
    }

    async fn read_loop(
        &self,
        mut recv: RecvStream,
        session_id: &SessionId,
        writer: &mut JoinHandle<()>,
    ) -> Result<()> {
        let mut codec = FrameCodec::new();
        let mut violations = ViolationWindow::new(VIOLATION_LIMIT, VIOLATION_WINDOW);
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            tokio::select! {
                read = recv.read(&mut buf) => match read {
                    Ok(Some(n)) => {
                        codec.feed(&buf[..n]);
                        loop {
                            match codec.decode_next() {
                                Ok(Some(frame)) => {
                                    if let Err(e) = self.handle_frame(&frame, session_id).await {
                                        if e.is_protocol() {
                                            warn!(session = %session_id, error = %e, "dropping bad frame");
                                            if violations.record(Instant::now()) {
                                                return Err(RelayError::protocol(
                                                    "too many protocol violations",
                                                ));
                                            }
                                        } else {
                                            return Err(e);
                                        }
                                    }
                                }
                                Ok(None) => break,
                                // an oversized or corrupt length prefix loses
                                // framing sync and cannot be skipped
                                Err(e) => {
                                    return Err(RelayError::protocol(format!(
                                        "frame decode error: {}",
                                        e
                                    )));
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(session = %session_id, "channel finished by client");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                },
                // the writer stops when the store evicted this session
                // (queue dropped) or the write half failed
                _ = &mut *writer => {
                    return Err(RelayError::connection("outbound channel closed"));
                }
            }
        }
    }

    /// Parse one frame and submit the resulting command, awaiting the
    /// store's acknowledgement so later frames observe its effects.
    async fn handle_frame(&self, frame: &Frame, session_id: &SessionId) -> Result<()> {
        let text = frame
            .as_text()
            .map_err(|e| RelayError::protocol(e.to_string()))?;

        match ClientEvent::parse(text)? {
            ClientEvent::JoinChat(profile) => {
                self.store.join_chat(session_id.clone(), profile).await
            }
            ClientEvent::SendMessage(data) => {
                self.store.send_message(session_id.clone(), data).await
            }
            ClientEvent::TypingStart(data) => {
                self.store.typing_start(session_id.clone(), data).await
            }
            ClientEvent::TypingStop(data) => {
                self.store.typing_stop(session_id.clone(), data).await
            }
            ClientEvent::DeleteMessage(data) => {
                self.store.delete_message(session_id.clone(), data).await
            }
            ClientEvent::FileSendingStart(data) => {
                self.store.file_sending_start(session_id.clone(), data).await
            }
            ClientEvent::FileSendingEnd(data) => {
                self.store.file_sending_end(session_id.clone(), data).await
            }
            ClientEvent::Signal(kind, data) => {
                self.store.signal(session_id.clone(), kind, data).await
            }
            ClientEvent::DisconnectChat => {
                self.store.disconnect_chat(session_id.clone()).await
            }
        }
    }
}

/// Drain the outbound queue into the stream's write half. Ends when the
/// queue closes (session evicted) or a write fails.
async fn write_outbound(mut send: SendStream, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = send.write_all(&bytes).await {
            debug!(error = %e, "outbound write failed");
            return;
        }
    }
    let _ = send.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_window_tolerates_slow_offenders() {
        let start = Instant::now();
        let mut window = ViolationWindow::new(5, Duration::from_secs(10));

        // one violation every 11 seconds never trips the limit
        for i in 0..20 {
            assert!(!window.record(start + Duration::from_secs(11 * i)));
        }
    }

    #[test]
    fn test_violation_window_trips_on_burst() {
        let start = Instant::now();
        let mut window = ViolationWindow::new(5, Duration::from_secs(10));

        for _ in 0..4 {
            assert!(!window.record(start));
        }
        assert!(window.record(start + Duration::from_secs(1)));
    }

    #[test]
    fn test_violation_window_forgets_old_entries() {
        let start = Instant::now();
        let mut window = ViolationWindow::new(3, Duration::from_secs(10));

        assert!(!window.record(start));
        assert!(!window.record(start + Duration::from_secs(1)));
        // the first two have aged out by now
        assert!(!window.record(start + Duration::from_secs(12)));
        assert!(!window.record(start + Duration::from_secs(13)));
        assert!(window.record(start + Duration::from_secs(14)));
    }
}
