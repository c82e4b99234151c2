//! The upgrade handshake itself (spec §4.I "Upgrade" action, §4.K): given
//! a parsed request, decide whether it's a valid WebSocket upgrade and,
//! if so, compute the `Sec-WebSocket-Accept` value the 101 response
//! carries. Framing and the post-upgrade connection live in `frame.rs`
//! and `connection.rs`; this module is just the RFC 6455 §1.3 handshake
//! math, done with the `sha1`/`base64` crates already in the dependency
//! tree for exactly this purpose.

use base64::Engine;
use sha1::{Digest, Sha1};

use crate::http::HttpRequest;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Returns `Some(accept_value)` when `request` is a GET carrying the
/// three headers RFC 6455 requires to start a handshake:
/// `Upgrade: websocket`, `Sec-WebSocket-Version: 13`, and a
/// `Sec-WebSocket-Key`. Anything else (wrong method, missing/odd
/// headers) is `None`, meaning "handle as an ordinary HTTP request."
pub fn accepted_key(request: &HttpRequest) -> Option<String> {
    if request.method != crate::http::Method::GET {
        return None;
    }
    let upgrade = request.headers.get("upgrade")?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return None;
    }
    let version = request.headers.get("sec-websocket-version")?;
    if version.trim() != "13" {
        return None;
    }
    let key = request.headers.get("sec-websocket-key")?;
    Some(accept_value(key))
}

/// `Base64(SHA-1(key || GUID))`, the value RFC 6455 calls
/// `Sec-WebSocket-Accept`.
pub fn accept_value(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_rfc6455_example() {
        // RFC 6455 §1.3's worked example.
        assert_eq!(
            accept_value("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn rejects_non_get_and_missing_headers() {
        let mut req = HttpRequest::new();
        req.method = crate::http::Method::POST;
        req.headers.insert("upgrade".into(), "websocket".into());
        req.headers.insert("sec-websocket-version".into(), "13".into());
        req.headers.insert("sec-websocket-key".into(), "x".into());
        assert!(accepted_key(&req).is_none());

        req.method = crate::http::Method::GET;
        assert!(accepted_key(&req).is_some());

        req.headers.remove("sec-websocket-key");
        assert!(accepted_key(&req).is_none());
    }
}
