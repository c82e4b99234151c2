use crate::config::RouteConfig;
use crate::http::{HttpRequest, HttpResponse, Method};
use std::collections::HashMap;
use std::sync::Arc;

pub type Handler = fn(&HttpRequest) -> HttpResponse;

#[derive(Debug, Clone, PartialEq)]
pub enum RoutingError {
    NotFound,
    MethodNotAllowed,
}

/// Longest-prefix match of `url` against `routes`, the shape every
/// `ServerConfig` uses internally to resolve a request to a route.
///
/// A path with no configured route still resolves to the best-matching
/// prefix (never a hard 404) unless no route at all is configured for the
/// server, or the matching route doesn't allow the request method.
pub fn longest_prefix_match(
    routes: &[RouteConfig],
    url: &str,
    method: &Method,
) -> Result<Arc<RouteConfig>, RoutingError> {
    let mut best: Option<&RouteConfig> = None;
    for route in routes {
        if url == route.path || url.starts_with(route.path.as_str()) {
            if best.is_none_or(|b| route.path.len() > b.path.len()) {
                best = Some(route);
            }
        }
    }

    match best {
        Some(route) => {
            if route.methods.iter().any(|m| m == method.as_str()) {
                Ok(Arc::new(route.clone()))
            } else {
                Err(RoutingError::MethodNotAllowed)
            }
        }
        None => Err(RoutingError::NotFound),
    }
}

/// Host-keyed router used outside the per-connection `ServerConfig` lookup
/// path (tests, and any future caller that wants routing without first
/// resolving a virtual host via `HttpConnection::resolve_config`).
#[derive(Default)]
pub struct Router {
    // Key: "host|path" -> route config
    pub routes: HashMap<String, Arc<RouteConfig>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn add_route_config(&mut self, host: &str, path: &str, route: Arc<RouteConfig>) {
        self.routes.insert(format!("{host}|{path}"), route);
    }

    pub fn resolve(
        &self,
        method: &Method,
        host: &str,
        path: &str,
    ) -> Result<Arc<RouteConfig>, RoutingError> {
        let prefix = format!("{host}|");
        let mut best: Option<(&str, &Arc<RouteConfig>)> = None;
        let mut host_has_any_route = false;

        for (key, route) in &self.routes {
            let Some(route_path) = key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            host_has_any_route = true;
            if path == route_path || path.starts_with(route_path) {
                if best.is_none_or(|(b, _)| route_path.len() > b.len()) {
                    best = Some((route_path, route));
                }
            }
        }

        if !host_has_any_route {
            return Err(RoutingError::NotFound);
        }

        match best {
            Some((_, route)) => {
                if route.methods.iter().any(|m| m == method.as_str()) {
                    Ok(Arc::clone(route))
                } else {
                    Err(RoutingError::MethodNotAllowed)
                }
            }
            None => Err(RoutingError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str, methods: &[Method]) -> Arc<RouteConfig> {
        Arc::new(RouteConfig {
            path: path.to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn simple_match() {
        let mut r = Router::new();
        r.add_route_config("localhost", "/", route("/", &[Method::GET]));
        let res = r.resolve(&Method::GET, "localhost", "/");
        assert_eq!(res.unwrap().path, "/");
    }

    #[test]
    fn longest_prefix_wins() {
        let mut r = Router::new();
        r.add_route_config("localhost", "/a", route("/a", &[Method::GET]));
        r.add_route_config("localhost", "/a/b", route("/a/b", &[Method::GET]));
        let res = r.resolve(&Method::GET, "localhost", "/a/b/c");
        assert_eq!(res.unwrap().path, "/a/b");
    }

    #[test]
    fn unknown_host_is_not_found() {
        let mut r = Router::new();
        r.add_route_config("localhost", "/", route("/", &[Method::GET]));
        let res = r.resolve(&Method::GET, "otherhost", "/");
        assert_eq!(res.unwrap_err(), RoutingError::NotFound);
    }

    #[test]
    fn method_not_allowed() {
        let mut r = Router::new();
        r.add_route_config("localhost", "/", route("/", &[Method::GET]));
        let res = r.resolve(&Method::POST, "localhost", "/");
        assert_eq!(res.unwrap_err(), RoutingError::MethodNotAllowed);
    }
}
