//! Per-fd WebSocket connection state (§3 "WebSocket connection", §4.K).
//! Parsing runs on the owning sub-reactor thread (one read task in flight
//! at a time, same ONESHOT discipline as HTTP); the send path is callable
//! from any thread — `WebSocketServer::broadcast_room` runs on whichever
//! sub-reactor owns the sender — so the write buffer sits behind its own
//! mutex independent of the rest of the connection.

use std::sync::Mutex;

use super::frame::{self, FrameError, Opcode};

/// What a completed inbound frame means for the application layer. Binary
/// frames are accepted but discarded rather than delivered (spec §4.K:
/// "only text is delivered to the application").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    Text(String),
    ClosedByPeer,
    /// A ping was received; a pong has already been queued in the write
    /// buffer for the caller to flush.
    PongQueued,
}

pub struct WebSocketConnection {
    pub username: Mutex<String>,
    write_buffer: Mutex<Vec<u8>>,
    read_buffer: Mutex<Vec<u8>>,
    pub closed: std::sync::atomic::AtomicBool,
}

impl WebSocketConnection {
    pub fn new() -> Self {
        Self {
            username: Mutex::new(String::new()),
            write_buffer: Mutex::new(Vec::new()),
            read_buffer: Mutex::new(Vec::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn username(&self) -> String {
        self.username.lock().unwrap().clone()
    }

    pub fn bind_username(&self, name: &str) {
        *self.username.lock().unwrap() = name.to_string();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Feeds freshly-read bytes into the connection's read buffer and
    /// drains as many complete frames as are present, returning one
    /// `WsEvent` per delivered text/close/ping frame. Frames with unknown
    /// opcodes are logged and skipped (spec §4.K). Takes `&self` (the read
    /// buffer sits behind its own mutex, same as the write side) so a
    /// sub-reactor can call this through the same `Arc<WebSocketConnection>`
    /// the room registry holds, without needing exclusive ownership.
    pub fn feed(&self, bytes: &[u8]) -> Result<Vec<WsEvent>, FrameError> {
        let mut read_buffer = self.read_buffer.lock().unwrap();
        read_buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        loop {
            match frame::parse_client_frame(&read_buffer) {
                Ok((frame, consumed)) => {
                    read_buffer.drain(..consumed);
                    match frame.opcode {
                        Opcode::Text => {
                            if let Ok(text) = String::from_utf8(frame.payload) {
                                events.push(WsEvent::Text(text));
                            }
                        }
                        Opcode::Close => {
                            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
                            self.enqueue_raw(&frame::pack_close_frame());
                            events.push(WsEvent::ClosedByPeer);
                        }
                        Opcode::Ping => {
                            self.enqueue_raw(&frame::pack_pong_frame());
                            events.push(WsEvent::PongQueued);
                        }
                        Opcode::Pong => {} // ignored per spec
                        Opcode::Binary | Opcode::Continuation => {}
                        Opcode::Other(code) => {
                            proxy_log::warn!("unknown websocket opcode 0x{code:x}, skipping");
                        }
                    }
                }
                Err(FrameError::Incomplete) => break,
                Err(e @ (FrameError::UnmaskedClientFrame | FrameError::Malformed)) => {
                    self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        Ok(events)
    }

    /// Appends a packed text frame to the write buffer. Returns `true` if
    /// the buffer was empty beforehand — the "edge trigger on
    /// empty->non-empty" signal `WebSocketServer::broadcast_room` uses to
    /// decide whether it needs to re-arm `EPOLLOUT` for this fd (spec
    /// §4.L).
    pub fn send_text(&self, text: &str) -> bool {
        self.enqueue_raw(&frame::pack_text_frame(text))
    }

    fn enqueue_raw(&self, bytes: &[u8]) -> bool {
        let mut buf = self.write_buffer.lock().unwrap();
        let was_empty = buf.is_empty();
        buf.extend_from_slice(bytes);
        was_empty
    }

    /// Drains and returns everything queued for send, for the sub-reactor's
    /// write path to hand to the socket.
    pub fn take_write_buffer(&self) -> Vec<u8> {
        std::mem::take(&mut self.write_buffer.lock().unwrap())
    }

    pub fn has_pending_write(&self) -> bool {
        !self.write_buffer.lock().unwrap().is_empty()
    }

    /// Puts back bytes a partial (`EAGAIN`) write couldn't send, preserving
    /// order with anything enqueued meanwhile.
    pub fn requeue_unsent(&self, unsent: &[u8]) {
        if unsent.is_empty() {
            return;
        }
        let mut buf = self.write_buffer.lock().unwrap();
        let mut combined = unsent.to_vec();
        combined.append(&mut buf);
        *buf = combined;
    }
}

impl Default for WebSocketConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_text_reports_empty_to_nonempty_edge() {
        let conn = WebSocketConnection::new();
        assert!(conn.send_text("a")); // was empty -> true
        assert!(!conn.send_text("b")); // already non-empty -> false
    }

    #[test]
    fn feed_delivers_text_and_handles_ping() {
        let mut conn = WebSocketConnection::new();
        let mask = [9, 8, 7, 6];
        let text_frame = crate::websocket::frame::pack_server_frame(
            crate::websocket::frame::Opcode::Text,
            b"hello",
        );
        // Build a masked client-style frame manually since pack_server_frame
        // is unmasked; reuse frame module internals via parse round trip.
        let mut masked = vec![text_frame[0], text_frame[1] | 0x80];
        masked.extend_from_slice(&mask);
        for (i, b) in b"hello".iter().enumerate() {
            masked.push(b ^ mask[i % 4]);
        }
        let events = conn.feed(&masked).unwrap();
        assert_eq!(events, vec![WsEvent::Text("hello".to_string())]);
    }

    #[test]
    fn unmasked_frame_closes_connection() {
        let mut conn = WebSocketConnection::new();
        let wire = frame::pack_server_frame(Opcode::Text, b"hi");
        assert!(conn.feed(&wire).is_err());
        assert!(conn.is_closed());
    }
}
