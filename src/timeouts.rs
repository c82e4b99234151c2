

use std::sync::Mutex;

use crate::prelude::*;

/// Idle-connection and CGI-timeout sweep, run once per sub-reactor loop
/// iteration (spec §4.M/N: each sub-reactor owns its own connection table,
/// so each runs this sweep over its own slice rather than one reactor
/// sweeping a process-wide table).
pub fn process_reactor(
    connections: &mut HashMap<Token, HttpConnection>,
    poll: &Poll,
    cgi_to_client: &mut HashMap<Token, Token>,
    session_store: &Mutex<SessionStore>,
) {
    let now = Instant::now();

    connections.retain(|token, conn| {
        // 1️⃣ Client inactivity timeout
        if now.duration_since(conn.last_activity) > CLIENT_TIMEOUT {
            cleanup_connection(conn, poll);
            force_cgi_timeout(conn, cgi_to_client);
            return false;
        }

        // CGI execution timeout
        if let ActiveAction::Cgi { start_time, .. } = &conn.action {
            if start_time.elapsed().as_secs() > TIMEOUT_CGI {

                force_cgi_timeout(conn, cgi_to_client);

                poll.registry()
                    .reregister(&mut conn.stream, *token, Interest::WRITABLE)
                    .ok();
            }
        }

        true
    });

    let mut store = session_store.lock().unwrap();
    if store.last_cleanup.elapsed() > Duration::from_secs(CLEAN_UP) {
        store.cleanup();
    }
}
fn cleanup_connection(conn: &mut HttpConnection, poll: &Poll) {
    let _ = poll.registry().deregister(&mut conn.stream);
    let _ = conn.stream.shutdown(Shutdown::Both);
}
