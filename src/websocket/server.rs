//! Singleton registry of ws connections, rooms, and users (§3 "Room
//! registry", §4.L). Eternal for the life of the process, deliberately: a
//! `WebSocketConnection`'s lifetime is otherwise owned by whichever
//! sub-reactor slot holds it, and any sub-reactor's worker threads may need
//! to broadcast into a room at any time, so this singleton is how the
//! design note in spec §9 ("the ws-server is eternal... to break a
//! lifetime cycle with per-connection callbacks") gets realized in Rust:
//! connections are held by `Arc`, rooms/users index fds (mio `Token`s), and
//! a `wake` callback per fd lets a broadcast originating on one sub-reactor
//! thread post a write-ready notification back to whichever sub-reactor
//! owns that fd, without the registry itself touching any `Poll`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use mio::Token;

use super::connection::WebSocketConnection;

/// Callback a sub-reactor registers when it hands a fd's `WebSocketConnection`
/// to this registry: "wake me up, this fd has bytes to write." Implemented
/// as a boxed closure rather than a raw eventfd write so the registry stays
/// OS-agnostic; `server.rs` supplies one backed by its action channel +
/// `mio::Waker`.
pub type WakeFn = Box<dyn Fn(Token) + Send + Sync>;

struct Entry {
    conn: Arc<WebSocketConnection>,
    wake: WakeFn,
}

#[derive(Default)]
struct Registry {
    conns: HashMap<Token, Entry>,
    rooms: HashMap<String, HashSet<Token>>,
    users: HashMap<String, HashSet<Token>>,
}

pub struct WebSocketServer {
    inner: Mutex<Registry>,
}

static INSTANCE: OnceLock<WebSocketServer> = OnceLock::new();

impl WebSocketServer {
    pub fn instance() -> &'static WebSocketServer {
        INSTANCE.get_or_init(|| WebSocketServer {
            inner: Mutex::new(Registry::default()),
        })
    }

    pub fn add(&self, fd: Token, conn: Arc<WebSocketConnection>, wake: WakeFn) {
        let mut reg = self.inner.lock().unwrap();
        reg.conns.insert(fd, Entry { conn, wake });
    }

    /// Pulls `fd` out of every room and user set, drops its callback, and
    /// releases the connection reference. Spec invariant 5: afterwards
    /// `rooms`/`users` never mention a fd not in `conns` — enforced here by
    /// removing from every collection under the one registry mutex.
    pub fn remove(&self, fd: Token) {
        let mut reg = self.inner.lock().unwrap();
        reg.conns.remove(&fd);
        for members in reg.rooms.values_mut() {
            members.remove(&fd);
        }
        reg.rooms.retain(|_, members| !members.is_empty());
        for members in reg.users.values_mut() {
            members.remove(&fd);
        }
        reg.users.retain(|_, members| !members.is_empty());
    }

    pub fn join_room(&self, room: &str, fd: Token) {
        {
            let mut reg = self.inner.lock().unwrap();
            reg.rooms.entry(room.to_string()).or_default().insert(fd);
        }
        self.broadcast_room(
            room,
            &format!("{{\"type\":\"system\",\"content\":\"joined {room}\"}}"),
            None,
        );
    }

    pub fn leave_room(&self, room: &str, fd: Token) {
        {
            let mut reg = self.inner.lock().unwrap();
            if let Some(members) = reg.rooms.get_mut(room) {
                members.remove(&fd);
                if members.is_empty() {
                    reg.rooms.remove(room);
                }
            }
        }
        self.broadcast_room(
            room,
            &format!("{{\"type\":\"system\",\"content\":\"left {room}\"}}"),
            None,
        );
    }

    pub fn bind_username(&self, fd: Token, username: &str) {
        let mut reg = self.inner.lock().unwrap();
        if let Some(entry) = reg.conns.get(&fd) {
            entry.conn.bind_username(username);
        }
        reg.users
            .entry(username.to_string())
            .or_default()
            .insert(fd);
    }

    /// Appends `msg` to every room member's write buffer except
    /// `exclude_fd`, waking only the fds whose buffer transitioned from
    /// empty to non-empty (spec §4.L's edge-trigger rule, avoiding a
    /// redundant `EPOLLOUT` re-arm for a fd that already has a write
    /// pending). Per spec's explicit "keep current behaviour" decision on
    /// the echo quirk, the sender is *not* implicitly excluded — callers
    /// pass `exclude_fd: None` unless they want self-exclusion.
    pub fn broadcast_room(&self, room: &str, msg: &str, exclude_fd: Option<Token>) {
        let reg = self.inner.lock().unwrap();
        let Some(members) = reg.rooms.get(room) else {
            return;
        };
        for &fd in members {
            if Some(fd) == exclude_fd {
                continue;
            }
            let Some(entry) = reg.conns.get(&fd) else {
                continue;
            };
            let became_non_empty = entry.conn.send_text(msg);
            if became_non_empty {
                (entry.wake)(fd);
            }
        }
    }

    pub fn rooms_of(&self, fd: Token) -> Vec<String> {
        let reg = self.inner.lock().unwrap();
        reg.rooms
            .iter()
            .filter(|(_, members)| members.contains(&fd))
            .map(|(room, _)| room.clone())
            .collect()
    }

    pub fn username_of(&self, fd: Token) -> Option<String> {
        let reg = self.inner.lock().unwrap();
        reg.conns.get(&fd).map(|e| e.conn.username())
    }

    pub fn conn_count(&self) -> usize {
        self.inner.lock().unwrap().conns.len()
    }

    pub fn contains(&self, fd: Token) -> bool {
        self.inner.lock().unwrap().conns.contains_key(&fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_registry() -> WebSocketServer {
        WebSocketServer {
            inner: Mutex::new(Registry::default()),
        }
    }

    #[test]
    fn join_leave_and_broadcast() {
        let server = fresh_registry();
        let woken = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3u32 {
            let woken = Arc::clone(&woken);
            server.add(
                Token(i as usize),
                Arc::new(WebSocketConnection::new()),
                Box::new(move |fd| woken.lock().unwrap().push(fd)),
            );
        }
        server.join_room("lobby", Token(0));
        server.join_room("lobby", Token(1));

        server.broadcast_room("lobby", "hi", None);
        assert!(woken.lock().unwrap().contains(&Token(0)));
        assert!(woken.lock().unwrap().contains(&Token(1)));
        assert!(!woken.lock().unwrap().contains(&Token(2)));
    }

    #[test]
    fn remove_clears_all_maps() {
        let server = fresh_registry();
        server.add(
            Token(0),
            Arc::new(WebSocketConnection::new()),
            Box::new(|_| {}),
        );
        server.join_room("lobby", Token(0));
        server.bind_username(Token(0), "alice");
        server.remove(Token(0));

        assert!(!server.contains(Token(0)));
        assert!(server.rooms_of(Token(0)).is_empty());
        assert_eq!(server.conn_count(), 0);
    }

    #[test]
    fn broadcast_includes_sender_unless_excluded() {
        let server = fresh_registry();
        let a_conn = Arc::new(WebSocketConnection::new());
        server.add(Token(0), Arc::clone(&a_conn), Box::new(|_| {}));
        server.join_room("lobby", Token(0));

        server.broadcast_room("lobby", "echo", None);
        assert!(a_conn.has_pending_write());

        a_conn.take_write_buffer();
        server.broadcast_room("lobby", "echo", Some(Token(0)));
        assert!(!a_conn.has_pending_write());
    }
}
