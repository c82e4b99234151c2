//! WebSocket support: RFC 6455 framing (`frame`), per-connection state
//! (`connection`), the room/user singleton (`server`), and the small JSON
//! reader the application protocol rides on (`json`).

pub mod connection;
pub mod frame;
pub mod handshake;
pub mod json;
pub mod server;

pub use connection::{WebSocketConnection, WsEvent};
pub use server::{WakeFn, WebSocketServer};

use mio::Token;

use self::json::{parse_object, JsonValue};
use crate::utils::SessionStore;

/// Result of dispatching one decoded WebSocket text message, telling the
/// caller what (if anything) to send back to just the originating fd. Room
/// broadcasts are performed as a side effect against `WebSocketServer`
/// directly rather than returned, since they fan out to other fds.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Send this text back to the sender only (auth ack/error).
    Reply(String),
    /// Nothing further to send to the sender.
    None,
}

/// Decodes `msg` as one of the three application-level message kinds (spec
/// §6) and dispatches it. `session_store` resolves `auth`'s `sessionid` to
/// a username (the "context's session map" spec calls for); everything
/// else goes through the `WebSocketServer` singleton.
pub fn handle_message(fd: Token, msg: &str, session_store: &mut SessionStore) -> DispatchOutcome {
    let Ok(obj) = parse_object(msg) else {
        return DispatchOutcome::Reply(error_reply("malformed message"));
    };
    let Some(kind) = obj.get("type").and_then(JsonValue::as_str) else {
        return DispatchOutcome::Reply(error_reply("missing type"));
    };

    match kind {
        "auth" => handle_auth(fd, &obj, session_store),
        "room" => handle_room(fd, &obj),
        "chat" => handle_chat(fd, &obj),
        other => DispatchOutcome::Reply(error_reply(&format!("unknown type {other}"))),
    }
}

fn handle_auth(fd: Token, obj: &json::JsonObject, session_store: &SessionStore) -> DispatchOutcome {
    let Some(session_id) = obj.get("sessionid").and_then(JsonValue::as_str) else {
        return DispatchOutcome::Reply(error_reply("missing sessionid"));
    };

    match session_store.resolve_username(session_id) {
        Some(username) => {
            WebSocketServer::instance().bind_username(fd, &username);
            DispatchOutcome::Reply(format!(
                r#"{{"type":"system","content":"authenticated","username":"{}"}}"#,
                json::escape(&username)
            ))
        }
        None => DispatchOutcome::Reply(error_reply("invalid or expired session")),
    }
}

fn handle_room(fd: Token, obj: &json::JsonObject) -> DispatchOutcome {
    let Some(action) = obj.get("action").and_then(JsonValue::as_str) else {
        return DispatchOutcome::Reply(error_reply("missing action"));
    };
    let Some(room) = obj.get("room").and_then(JsonValue::as_str) else {
        return DispatchOutcome::Reply(error_reply("missing room"));
    };

    match action {
        "join" => WebSocketServer::instance().join_room(room, fd),
        "leave" => WebSocketServer::instance().leave_room(room, fd),
        other => return DispatchOutcome::Reply(error_reply(&format!("unknown room action {other}"))),
    }
    DispatchOutcome::None
}

fn handle_chat(fd: Token, obj: &json::JsonObject) -> DispatchOutcome {
    let Some(subtype) = obj.get("subtype").and_then(JsonValue::as_str) else {
        return DispatchOutcome::Reply(error_reply("missing subtype"));
    };
    if subtype != "room_msg" {
        return DispatchOutcome::Reply(error_reply(&format!("unknown chat subtype {subtype}")));
    }

    let Some(from) = obj.get("from").and_then(JsonValue::as_str) else {
        return DispatchOutcome::Reply(error_reply("missing from"));
    };
    let Some(room) = obj.get("room").and_then(JsonValue::as_str) else {
        return DispatchOutcome::Reply(error_reply("missing room"));
    };
    let Some(content) = obj.get("content").and_then(JsonValue::as_str) else {
        return DispatchOutcome::Reply(error_reply("missing content"));
    };

    let bound = WebSocketServer::instance().username_of(fd).unwrap_or_default();
    if bound != from {
        return DispatchOutcome::Reply(error_reply("from does not match authenticated user"));
    }

    let ts = obj.get("ts").and_then(JsonValue::as_f64).unwrap_or(0.0);
    let frame = format!(
        r#"{{"type":"chat","subtype":"room_msg","from":"{}","room":"{}","content":"{}","ts":{}}}"#,
        json::escape(from),
        json::escape(room),
        json::escape(content),
        ts
    );
    // No exclusion: sender receives its own echo (spec §4.L, kept as-is).
    WebSocketServer::instance().broadcast_room(room, &frame, None);
    DispatchOutcome::None
}

fn error_reply(content: &str) -> String {
    format!(
        r#"{{"type":"error","content":"{}"}}"#,
        json::escape(content)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_with_unknown_session_is_rejected() {
        let mut store = SessionStore::new(60);
        let outcome = handle_message(Token(1), r#"{"type":"auth","sessionid":"nope"}"#, &mut store);
        match outcome {
            DispatchOutcome::Reply(s) => assert!(s.contains("error")),
            DispatchOutcome::None => panic!("expected a reply"),
        }
    }

    #[test]
    fn chat_rejects_spoofed_sender() {
        WebSocketServer::instance().add(
            Token(5),
            std::sync::Arc::new(WebSocketConnection::new()),
            Box::new(|_| {}),
        );
        WebSocketServer::instance().bind_username(Token(5), "alice");
        let msg = r#"{"type":"chat","subtype":"room_msg","from":"mallory","room":"lobby","content":"hi","ts":1}"#;
        let mut store = SessionStore::new(60);
        let outcome = handle_message(Token(5), msg, &mut store);
        match outcome {
            DispatchOutcome::Reply(s) => assert!(s.contains("error")),
            DispatchOutcome::None => panic!("expected a reply"),
        }
        WebSocketServer::instance().remove(Token(5));
    }
}
