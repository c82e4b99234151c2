use crate::prelude::*;
use std::clone;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Session {
    pub data: HashMap<String, String>,
    pub created_at: u64,
    pub expires_at: u64,
}

impl Session {
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    pub fn new(ttl: u64) -> Self {
        Session {
            data: HashMap::new(),
            created_at: current_timestamp(),
            expires_at: current_timestamp() + ttl,
        }
    }
}

use std::time::{SystemTime, UNIX_EPOCH};

pub struct SessionStore {
    sessions: HashMap<String, Session>,
    ttl: u64,
    counter: u64,
    pub last_cleanup: Instant,
}

impl SessionStore {
    pub fn new(ttl: u64) -> Self {
        SessionStore {
            sessions: HashMap::new(),
            ttl,
            counter: 0,
            last_cleanup: Instant::now(),
        }
    }

    /// Resolves a `Sec-WebSocket` `auth` message's `sessionid` to the
    /// username stashed in that session's data, if any and not expired.
    pub fn resolve_username(&self, session_id: &str) -> Option<String> {
        let now = current_timestamp();
        self.sessions
            .get(session_id)
            .filter(|s| !s.is_expired(now))
            .and_then(|s| s.data.get("username").cloned())
    }

    pub fn set_username(&mut self, session_id: &str, username: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.data.insert("username".to_string(), username.to_string());
        }
    }

    // pub fn get_or_create(&mut self, session_id: Option<&String>) -> (Session, bool) {
    //     let now = current_timestamp();

    //     if let Some(id) = session_id {
    //         if let Some(session) = self.sessions.get(id) {
    //             if !session.is_expired(now) {
    //                 return (session.clone(), false);
    //             }
    //         }
    //     }

    //     // let session = self.create(now);
    //     (session, true)
    // }

    // fn create(&mut self, now: u64) -> Session {
    //     self.counter += 1;

    //     // let id = format!("{}-{}", now, self.counter);

    //     let session = Session {
    //         expires_at: now + self.ttl,
    //         data: HashMap::new(),
    //     };

    //     self.sessions.insert(id.clone(), session.clone());
    //     session
    // }

    pub fn cleanup(&mut self) {
        let now = current_timestamp();
        self.sessions.retain(|_, s| !s.is_expired(now));
        self.last_cleanup = Instant::now();
    }

    fn setup_new_session(&mut self) -> (String, String) {
        self.counter += 1;
        let uuid = format!("{}-{}", current_timestamp(), self.counter);
        self.sessions.insert(uuid.clone(), Session::new(self.ttl));

        let set_cookie = SetCookie::new("session_id", &uuid)
            .max_age(3600)
            .to_header();

        (uuid, set_cookie)
    }

    /// Resolves (or creates) the session for a connection from its `Cookie`
    /// header. Returns a `Set-Cookie` header value when a new session was
    /// minted, so the caller can attach it to whatever response it ends up
    /// serializing for this request.
    pub fn mange_session_store(&mut self, conn: &mut HttpConnection) -> Option<String> {
        let cookies_header = conn.request.headers.get("cookie");
        let cookies: Cookies = match cookies_header {
            Some(data) => Cookies::parse(data),
            None => Cookies::new(),
        };

        let (session_id, set_cookie) = match cookies.get("session_id") {
            Some(session_id) => match self.sessions.get(session_id) {
                Some(session) if !session.is_expired(current_timestamp()) => {
                    (session_id.to_string(), None)
                }
                _ => {
                    let (id, header) = self.setup_new_session();
                    (id, Some(header))
                }
            },
            _ => {
                let (id, header) = self.setup_new_session();
                (id, Some(header))
            }
        };
        conn.session_id = Some(session_id);
        set_cookie
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}
