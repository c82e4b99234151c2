use parser_derive::YamlStruct;
use std::collections::HashMap;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SERVER_NAME: &str = "localhost";
pub const DEFAULT_MAX_BODY_SIZE: usize = 1_048_576;
pub const DEFAULT_ROUTE_PATH: &str = "/";
pub const DEFAULT_ROOT: &str = ".";
pub const DEFAULT_FILE: &str = "index.html";

/// One `path:`-scoped routing rule inside a `server:` block.
#[derive(Debug, Clone, YamlStruct)]
pub struct RouteConfig {
    pub path: String,
    #[field(default = "[GET]")]
    pub methods: Vec<String>,
    pub redirection: Option<String>,
    pub redirect_code: Option<u16>,
    #[field(default = ".")]
    pub root: String,
    #[field(default = "index.html")]
    pub default_file: String,
    #[field(default = "")]
    pub upload_dir: String,
    pub cgi_ext: Option<String>,
    pub cgi_path: Option<String>,
    #[field(default = "false")]
    pub autoindex: bool,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_ROUTE_PATH.to_string(),
            methods: vec!["GET".to_string()],
            redirection: None,
            redirect_code: None,
            root: DEFAULT_ROOT.to_string(),
            default_file: DEFAULT_FILE.to_string(),
            upload_dir: String::new(),
            cgi_ext: None,
            cgi_path: None,
            autoindex: false,
        }
    }
}

/// One `host:port` listener, possibly shared with other virtual hosts via
/// `server_name`.
#[derive(Debug, Clone, YamlStruct)]
pub struct ServerConfig {
    #[field(default = "127.0.0.1")]
    pub host: String,
    #[field(default = "[8080]")]
    pub ports: Vec<u16>,
    #[field(default = "localhost")]
    pub server_name: String,
    #[field(default = "false")]
    pub default_server: bool,
    #[field(default = ".")]
    pub root: String,
    #[field(default = "{}")]
    pub error_pages: HashMap<u16, String>,
    #[field(default = "1048576")]
    pub client_max_body_size: usize,
    #[field(default = "[]")]
    pub routes: Vec<RouteConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            ports: vec![DEFAULT_PORT],
            server_name: DEFAULT_SERVER_NAME.to_string(),
            default_server: false,
            root: DEFAULT_ROOT.to_string(),
            error_pages: HashMap::new(),
            client_max_body_size: DEFAULT_MAX_BODY_SIZE,
            routes: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Longest-prefix match against this server's own route table.
    pub fn find_route(
        &self,
        url: &str,
        method: &crate::http::Method,
    ) -> Result<std::sync::Arc<RouteConfig>, crate::router::RoutingError> {
        crate::router::longest_prefix_match(&self.routes, url, method)
    }
}

/// Top-level parsed `config.yaml` document: a flat list of listeners.
#[derive(Debug, Clone, YamlStruct)]
pub struct AppConfig {
    #[field(default = "[]")]
    pub servers: Vec<ServerConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { servers: Vec::new() }
    }
}
