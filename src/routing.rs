//! The programmatic route table spec §4.H describes: literal-or-regex
//! `RouteRule`s matched first-match-wins against a method's rule list,
//! dispatching to a `(Request, Context) -> Response` handler. This sits
//! alongside (not instead of) `router.rs`'s config-driven virtual-host
//! routing: that one resolves static files/CGI/uploads through
//! `ServerConfig`'s longest-prefix table, this one is for the handful of
//! application endpoints (`/api/login`, `/api/register`, the WebSocket
//! upgrade) that aren't backed by the filesystem.

use std::sync::Arc;

use regex::Regex;

use crate::context::Context;
use crate::http::{HttpRequest, HttpResponse, Method};

pub type Handler = Arc<dyn Fn(&HttpRequest, &Context) -> HttpResponse + Send + Sync>;

enum Matcher {
    Literal(String),
    Regex(Regex),
}

struct RouteRule {
    pattern: String,
    matcher: Matcher,
    handler: Handler,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvalidPattern(pub String);

impl std::fmt::Display for InvalidPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "route pattern '{}' contains regex metacharacters but failed to compile", self.0)
    }
}

impl std::error::Error for InvalidPattern {}

/// A pattern is treated as regex iff it contains any of `.*+?^${}()|[]\`
/// (spec §3 "Route rule"). Literal patterns match by exact string equality;
/// regex patterns match the full string (`Regex::is_match` on an anchored
/// pattern, via `^(?:...)$`).
fn looks_like_regex(pattern: &str) -> bool {
    pattern.contains(['.', '*', '+', '?', '^', '$', '{', '}', '(', ')', '|', '[', ']', '\\'])
}

/// First-match-wins route table, one per HTTP method. Unlike the spec's
/// source, a pattern that looks like regex but fails to compile is a
/// startup error (`InvalidPattern`), not a silent degrade to literal
/// matching — DESIGN.md's decision on that quirk.
#[derive(Default)]
pub struct Router {
    rules: std::collections::HashMap<Method, Vec<RouteRule>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMiss {
    NotFound,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rule for `method`. Rules are tried in registration
    /// order, so register specific literal routes before broad regex
    /// fallbacks (spec §4.H rationale).
    pub fn add_route(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Handler,
    ) -> Result<(), InvalidPattern> {
        let matcher = if looks_like_regex(pattern) {
            let anchored = format!("^(?:{pattern})$");
            match Regex::new(&anchored) {
                Ok(re) => Matcher::Regex(re),
                Err(_) => return Err(InvalidPattern(pattern.to_string())),
            }
        } else {
            Matcher::Literal(pattern.to_string())
        };

        self.rules.entry(method).or_default().push(RouteRule {
            pattern: pattern.to_string(),
            matcher,
            handler,
        });
        Ok(())
    }

    /// First-match-wins lookup by method then pattern. A method with no
    /// registered rules, or a path no rule matches, is `RouteMiss::NotFound`
    /// (spec §4.H: "no match -> 404").
    pub fn find(&self, method: &Method, path: &str) -> Result<&Handler, RouteMiss> {
        let Some(rules) = self.rules.get(method) else {
            return Err(RouteMiss::NotFound);
        };
        for rule in rules {
            let matched = match &rule.matcher {
                Matcher::Literal(p) => p == path,
                Matcher::Regex(re) => re.is_match(path),
            };
            if matched {
                return Ok(&rule.handler);
            }
        }
        Err(RouteMiss::NotFound)
    }

    pub fn route(&self, request: &HttpRequest, ctx: &Context) -> Option<HttpResponse> {
        match self.find(&request.method, &request.url) {
            Ok(handler) => Some(handler(request, ctx)),
            Err(RouteMiss::NotFound) => None,
        }
    }

    /// Patterns registered for `method`, in match order — used by tests and
    /// by the startup banner.
    pub fn patterns_for(&self, method: &Method) -> Vec<&str> {
        self.rules
            .get(method)
            .map(|rules| rules.iter().map(|r| r.pattern.as_str()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(body: &'static str) -> Handler {
        Arc::new(move |_req, _ctx| {
            let mut resp = HttpResponse::new(200, "OK");
            resp.set_body(body.as_bytes().to_vec(), "text/plain");
            resp
        })
    }

    #[test]
    fn literal_exact_match_wins_over_regex_fallback() {
        let mut router = Router::new();
        router
            .add_route(Method::GET, "/api/login", ok("literal"))
            .unwrap();
        router
            .add_route(Method::GET, "/api/.*", ok("regex"))
            .unwrap();

        let handler = router.find(&Method::GET, "/api/login").unwrap();
        let ctx = test_ctx();
        let req = req_for("/api/login");
        let resp = handler(&req, &ctx);
        assert_eq!(resp.body, b"literal");
    }

    #[test]
    fn regex_fallback_used_when_no_literal_matches() {
        let mut router = Router::new();
        router
            .add_route(Method::GET, "/api/login", ok("literal"))
            .unwrap();
        router
            .add_route(Method::GET, "/api/.*", ok("regex"))
            .unwrap();

        let handler = router.find(&Method::GET, "/api/other").unwrap();
        let resp = handler(&req_for("/api/other"), &test_ctx());
        assert_eq!(resp.body, b"regex");
    }

    #[test]
    fn unmatched_path_is_not_found() {
        let mut router = Router::new();
        router.add_route(Method::GET, "/only", ok("x")).unwrap();
        assert_eq!(
            router.find(&Method::GET, "/other"),
            Err(RouteMiss::NotFound)
        );
    }

    #[test]
    fn bad_regex_pattern_fails_loudly_at_registration() {
        let mut router = Router::new();
        let result = router.add_route(Method::GET, "/bad(unterminated", ok("x"));
        assert!(result.is_err());
    }

    fn req_for(path: &str) -> HttpRequest {
        let mut req = HttpRequest::new();
        req.method = Method::GET;
        req.url = path.to_string();
        req
    }

    fn test_ctx() -> Context {
        Context::new(60, 1).unwrap()
    }
}
