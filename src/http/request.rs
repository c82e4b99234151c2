use crate::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    GET,
    POST,
    DELETE,
    HEAD,
    /// Any request-line token that isn't one of the above. Kept as a
    /// value rather than a parse error so a request can still flow
    /// through to a 405/501 response instead of being dropped as
    /// malformed (spec §3 Method enum).
    UNKNOWN,
}

impl Method {
    pub fn is_allowed(&self, allowed_methods: &Vec<String>) -> bool {
        allowed_methods.contains(&self.to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::UNKNOWN => "UNKNOWN",
        }
    }
}

impl FromStr for Method {
    type Err = ParseError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(Method::GET),
            "POST" => Ok(Method::POST),
            "DELETE" => Ok(Method::DELETE),
            "HEAD" => Ok(Method::HEAD),
            _ => Ok(Method::UNKNOWN),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, PartialEq)]
pub enum ParsingState {
    RequestLine,
    Headers,
    HeadersDone,
    Body,
    Complete,
    Error,
}

const CRLN_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    IncompleteRequestLine,
    MalformedRequestLine,
    InvalidMethod,
    InvalidUtf8(std::string::FromUtf8Error),
    UnexpectedEof,
    HeaderTooLong,
    TooManyHeaders,
    InvalidHeaderName,
    InvalidHeaderValue,
    InvalidChunkSize,
    PayloadTooLarge,
    ParseHexError,
    Error(u16),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::IncompleteRequestLine => write!(f, "Incomplete request line"),
            ParseError::MalformedRequestLine => write!(f, "Malformed request line"),
            ParseError::InvalidMethod => write!(f, "Invalid HTTP method"),
            ParseError::InvalidUtf8(_) => write!(f, "Invalid UTF-8 in request"),
            ParseError::UnexpectedEof => write!(f, "Unexpected end of input"),
            ParseError::HeaderTooLong => write!(f, "Header line too long"),
            ParseError::TooManyHeaders => write!(f, "Too many headers"),
            ParseError::InvalidHeaderName => write!(f, "Invalid header name"),
            ParseError::InvalidHeaderValue => write!(f, "Invalid header value"),
            ParseError::PayloadTooLarge => write!(f, "Payload too large"),
            ParseError::ParseHexError => write!(f, "Parse Hex Error"),
            ParseError::Error(_) => write!(f, "other error"),
            ParseError::InvalidChunkSize => write!(f, "invalid chunk size"),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<std::string::FromUtf8Error> for ParseError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        ParseError::InvalidUtf8(err)
    }
}

/// One file saved out of a `multipart/form-data` body (spec §3 Request
/// data model). `handel_upload_manager` populates these from
/// `Upload::saved_filenames` once a POST upload completes, so a dynamic
/// route handler can inspect what landed on disk without reaching into
/// the upload machinery itself.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: String,
    pub temp_path: PathBuf,
    pub size: u64,
}

#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub trailers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub body_file: Option<File>,
    pub is_large_body: bool,
    pub buffer: Vec<u8>,
    pub cursor: usize,
    pub state: ParsingState,
    /// Fields decoded from an `application/x-www-form-urlencoded` body
    /// (spec §4.G.3). Empty for any other content type.
    pub form_fields: HashMap<String, String>,
    pub uploaded_files: HashMap<String, UploadedFile>,
    /// The cookie session id `SessionStore::mange_session_store` resolved
    /// or minted for this connection, mirrored here so a dynamic route
    /// handler (which only sees `&HttpRequest`, not the connection) can
    /// bind a username to it after a successful login.
    pub session_id: Option<String>,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequest {
    pub fn new() -> Self {
        HttpRequest {
            method: Method::GET,
            url: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            trailers: HashMap::new(),
            body: Vec::new(),
            buffer: Vec::with_capacity(4096),
            cursor: 0,
            state: ParsingState::RequestLine,
            is_large_body: false,
            body_file: None,
            form_fields: HashMap::new(),
            uploaded_files: HashMap::new(),
            session_id: None,
        }
    }

    pub fn clear(&mut self) {
        self.state = ParsingState::RequestLine;
        self.headers.clear();
        self.trailers.clear();
        self.body.clear();
        self.form_fields.clear();
        self.uploaded_files.clear();
        self.session_id = None;
    }

    pub fn finish_request(&mut self) {
        self.buffer.drain(..self.cursor);
        self.cursor = 0;
        self.clear();
    }

    /// An owned copy of the fields a dynamic route handler actually reads
    /// (method, url, headers, form fields, uploaded-file metadata, session
    /// id), used to hand a request off to `Context::dispatch` without
    /// requiring `HttpRequest` itself to be `Clone` — it can't be, since
    /// `body_file` is a live `File` mid multipart-upload. Dynamic routes
    /// never go through the upload path, so the snapshot's `body_file` is
    /// always `None`.
    pub fn snapshot_for_handler(&self) -> HttpRequest {
        HttpRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            version: self.version.clone(),
            headers: self.headers.clone(),
            trailers: self.trailers.clone(),
            body: self.body.clone(),
            body_file: None,
            is_large_body: self.is_large_body,
            buffer: Vec::new(),
            cursor: 0,
            state: ParsingState::Complete,
            form_fields: self.form_fields.clone(),
            uploaded_files: self.uploaded_files.clone(),
            session_id: self.session_id.clone(),
        }
    }

    /// Runs a dynamic route's handler, offloading it to `ctx.dispatch`'s
    /// worker pool when one is wired (the real server) and falling back
    /// to running it inline when it isn't (bare `Context`s built directly
    /// in handler unit tests never touch `routing::Router` at all, but a
    /// `Context` constructed via `Context::new`/`with_router` alone still
    /// works the same way here). `Some(response)` means the response is
    /// ready to write now; `None` means the job was handed off
    /// to a worker thread and `conn.action` is now `PendingRoute` —
    /// `Server::apply_pending_routes` finishes it once the slot fills.
    fn dispatch_route(
        token: Token,
        handler: crate::routing::Handler,
        conn: &mut HttpConnection,
        ctx: &Context,
    ) -> Option<HttpResponse> {
        let Some(dispatcher) = ctx.dispatch.as_ref() else {
            return Some(handler(&conn.request, ctx));
        };

        let snapshot = conn.request.snapshot_for_handler();
        let ctx_owned = ctx.clone();
        let slot = Arc::new(std::sync::Mutex::new(None));
        conn.action = ActiveAction::PendingRoute(Arc::clone(&slot));

        let submitted = dispatcher.dispatch(token, slot, move || handler(&snapshot, &ctx_owned));
        if submitted {
            None
        } else {
            conn.action = ActiveAction::None;
            let mut response = HttpResponse::new(HTTP_SERVICE_UNAVAILABLE, "Service Unavailable");
            response.set_body(
                br#"{"status":"error","msg":"server busy"}"#.to_vec(),
                "application/json",
            );
            Some(response)
        }
    }

    pub fn proces_request(
        registry: &Registry,
        token: Token,
        next_token: &mut usize,
        cgi_to_client: &mut HashMap<Token, Token>,
        conn: &mut HttpConnection,
        session_store: &mut SessionStore,
        ctx: &Context,
    ) -> Result<bool> {
        let mut closed = false;
        // trace!("### start processing a request ###");
        loop {
            match HttpRequest::parse_request(
                conn,
                registry,
                next_token,
                cgi_to_client,
                token,
                session_store,
                ctx,
            ) {
                Ok(()) => {
                    trace!("### request state is complete ###");
                    let s_cfg = conn.s_cfg.as_ref().unwrap().clone();

                    if let Some(upload_manager) = &mut conn.upload_manager {
                        let mut response = HttpResponse::new(HTTP_OK, "OK");
                        Upload::handel_upload_manager(&mut response, upload_manager, &s_cfg);
                        for part in &upload_manager.saved_parts {
                            let temp_path = upload_manager.path.join(&part.filename);
                            let size = std::fs::metadata(&temp_path).map(|m| m.len()).unwrap_or(0);
                            conn.request.uploaded_files.insert(
                                part.field_name.clone(),
                                UploadedFile {
                                    filename: part.filename.clone(),
                                    content_type: part.content_type.clone(),
                                    temp_path,
                                    size,
                                },
                            );
                        }
                        for (name, value) in upload_manager.form_fields.drain() {
                            conn.request.form_fields.insert(name, value);
                        }
                        conn.write_buffer.extend_from_slice(&response.to_bytes());
                    }

                    if let ActiveAction::DynamicRoute(handler) =
                        std::mem::replace(&mut conn.action, ActiveAction::None)
                    {
                        conn.request.parse_form_fields();
                        conn.request.session_id = conn.session_id.clone();
                        if let Some(response) = HttpRequest::dispatch_route(token, handler, conn, ctx)
                        {
                            conn.write_buffer.extend_from_slice(&response.to_bytes());
                        }
                    }

                    conn.request.finish_request();
                    break;
                }
                Err(ParseError::IncompleteRequestLine) => break,
                Err(e) => {
                    let code = match e {
                        ParseError::PayloadTooLarge => HTTP_PAYLOAD_TOO_LARGE,
                        ParseError::InvalidMethod => HTTP_METHOD_NOT_ALLOWED,
                        ParseError::HeaderTooLong => HTTP_URI_TOO_LONG,
                        _ => HTTP_BAD_REQUEST,
                    };
                    let mut response = HttpResponse::new(code, "");
                    handle_error(&mut response, code, conn.s_cfg.as_ref());
                    closed = true;
                    conn.write_buffer.extend_from_slice(&response.to_bytes());
                    conn.request.finish_request();
                    break;
                }
            }
        }

        if !conn.write_buffer.is_empty()
            || matches!(conn.action, ActiveAction::FileDownload(_, _, _))
        {
            registry.reregister(
                &mut conn.stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            )?;
        }
        Ok(closed)
    }

    pub fn parse_request<'a>(
        conn: &mut HttpConnection,
        registry: &Registry,
        next_token: &mut usize,
        cgi_to_client: &mut HashMap<Token, Token>,
        client_token: Token,
        session_store: &mut SessionStore,
        ctx: &Context,
    ) -> core::result::Result<(), ParseError> {
        loop {
            let res = match conn.request.state {
                ParsingState::RequestLine => conn.request.parse_request_line(),
                ParsingState::Headers => HttpRequest::parse_headers(conn),
                ParsingState::HeadersDone => {
                    let set_cookie = session_store.mange_session_store(conn);
                    match HttpRequest::setup_action(
                        conn,
                        registry,
                        next_token,
                        cgi_to_client,
                        client_token,
                        ctx,
                    )? {
                        Some(mut res) => {
                            if let Some(cookie) = set_cookie {
                                res.set_header("Set-Cookie", &cookie);
                            }
                            conn.write_buffer.extend_from_slice(&res.to_bytes());
                            conn.request.state = ParsingState::Complete;
                        }
                        // `None` with the handler handed to a worker
                        // thread means there's nothing left to parse for
                        // this request; `None` otherwise (a body still
                        // inbound) means `setup_action` already advanced
                        // `state` past `HeadersDone` itself so this arm
                        // isn't re-entered without new bytes.
                        None if matches!(conn.action, ActiveAction::PendingRoute(_)) => {
                            conn.request.state = ParsingState::Complete;
                        }
                        None => {}
                    }
                    Ok(())
                }
                ParsingState::Body => HttpRequest::parse_unchunked_body(registry, conn),
                _ => break,
            };

            match res {
                Ok(_) => {
                    if conn.request.state == ParsingState::Complete {
                        break;
                    }
                }
                Err(ParseError::IncompleteRequestLine) => {
                    return Err(ParseError::IncompleteRequestLine);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn setup_action(
        conn: &mut HttpConnection,
        registry: &Registry,
        next_token: &mut usize,
        cgi_to_client: &mut HashMap<Token, Token>,
        client_token: Token,
        ctx: &Context,
    ) -> core::result::Result<Option<HttpResponse>, ParseError> {
        let s_cfg = conn.resolve_config();
        conn.s_cfg = Some(Arc::clone(&s_cfg));

        // Request-side `Transfer-Encoding: chunked` is an explicit
        // non-goal: this server only ever chunks its own CGI output.
        if conn
            .request
            .headers
            .get("transfer-encoding")
            .map(|v| v.contains("chunked"))
            .unwrap_or(false)
        {
            return Ok(Some(error_response(HTTP_NOT_IMPLEMENTED, &s_cfg)));
        }

        // WebSocket upgrade (spec §4.I "Upgrade" action, §4.K) takes
        // priority over both the dynamic router and the static/CGI
        // routes below: it never has a body to wait for.
        if let Some(accept) = crate::websocket::handshake::accepted_key(&conn.request) {
            let mut res = HttpResponse::new(101, "Switching Protocols");
            res.set_header("Upgrade", "websocket");
            res.set_header("Connection", "Upgrade");
            res.set_header("Sec-WebSocket-Accept", &accept);
            conn.action = ActiveAction::WsUpgrade;
            return Ok(Some(res));
        }

        // Programmatic routes (`/api/login`, `/api/register`, ...)
        // resolve before the filesystem/CGI table (spec §4.H: these
        // aren't backed by `ServerConfig`'s route list at all).
        if let Ok(handler) = ctx
            .router
            .find(&conn.request.method, &conn.request.url)
            .map(|h| h.clone())
        {
            if matches!(conn.request.method, Method::GET | Method::HEAD) {
                conn.request.session_id = conn.session_id.clone();
                return Ok(HttpRequest::dispatch_route(client_token, handler, conn, ctx));
            }
            let declared_len = conn
                .request
                .headers
                .get("content-length")
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(0);
            if declared_len > s_cfg.client_max_body_size {
                return Err(ParseError::PayloadTooLarge);
            }
            conn.action = ActiveAction::DynamicRoute(handler);
            conn.body_remaining = declared_len;
            if conn.body_remaining == 0 {
                conn.request.parse_form_fields();
                conn.request.session_id = conn.session_id.clone();
                let handler = match std::mem::replace(&mut conn.action, ActiveAction::None) {
                    ActiveAction::DynamicRoute(h) => h,
                    _ => unreachable!(),
                };
                return Ok(HttpRequest::dispatch_route(client_token, handler, conn, ctx));
            }
            // Body still inbound: advance past `HeadersDone` so
            // `parse_request`'s loop lands on `ParsingState::Body` instead
            // of re-entering this match arm every pass with nothing new
            // to do (it would otherwise spin forever waiting on bytes
            // that `parse_unchunked_body` is the one that waits for).
            conn.request.state = ParsingState::Body;
            return Ok(None);
        }

        let content_length = conn
            .request
            .headers
            .get("content-length")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);

        let content_type = conn
            .request
            .headers
            .get("content-type")
            .map(|s| s.as_str())
            .unwrap_or("");

        conn.boundary = content_type
            .split("boundary=")
            .nth(1)
            .map(|b| b.trim())
            .unwrap_or("")
            .to_string();

        // 1. Initial Size Check
        if content_length > s_cfg.client_max_body_size {
            return Err(ParseError::PayloadTooLarge);
        }

        conn.body_remaining = content_length;

        // 2. Resolve Route and Set Intent
        let request = &conn.request;
        let res = match s_cfg.find_route(&request.url, &request.method) {
            Ok(r_cfg) => {
                if let Some(ref redirect_url) = r_cfg.redirection {
                    Some(HttpResponse::redirect(
                        r_cfg.redirect_code.unwrap_or(HTTP_FOUND),
                        redirect_url,
                    ))
                } else if r_cfg
                    .cgi_ext
                    .as_ref()
                    .map_or(false, |ext| request.url.ends_with(ext))
                {
                    let program = match &r_cfg.cgi_path {
                        Some(p) => p.as_str(),
                        None => {
                            let ext = r_cfg.cgi_ext.as_deref().unwrap();
                            match ext {
                                "py" => "python3",
                                "sh" => "bash",
                                _ => "python3",
                            }
                        }
                    };

                    let full_script_path =
                        PathBuf::from(&s_cfg.root).join(request.url.trim_start_matches('/'));

                    // 1. Create the OUT pair (Script Output -> Server)
                    let Ok((server_out_std, script_out_std)) = UnixStream::pair() else {
                        return Ok(Some(error_response(HTTP_INTERNAL_SERVER_ERROR, &s_cfg)));
                    };
                    server_out_std.set_nonblocking(true).ok();
                    let mut server_out_mio = mio::net::UnixStream::from_std(server_out_std);

                    // 2. Setup Input pair (Server -> Script Input)
                    let Ok((server_in_std, script_in_std)) = UnixStream::pair() else {
                        return Ok(Some(error_response(HTTP_INTERNAL_SERVER_ERROR, &s_cfg)));
                    };
                    server_in_std.set_nonblocking(true).ok();
                    let mut server_in_mio = mio::net::UnixStream::from_std(server_in_std);

                    let script_output_file =
                        unsafe { File::from_raw_fd(script_out_std.into_raw_fd()) };
                    let script_input_file =
                        unsafe { File::from_raw_fd(script_in_std.into_raw_fd()) };

                    let mut cmd = Command::new(program);
                    cmd.arg(&full_script_path)
                        .envs(build_cgi_env(conn))
                        .stdin(Stdio::from(script_input_file))
                        .stdout(Stdio::from(script_output_file))
                        .stderr(Stdio::inherit());

                    match cmd.spawn() {
                        Ok(child) => {
                            let out_token = Token(*next_token);
                            *next_token += 1;
                            registry
                                .register(&mut server_out_mio, out_token, Interest::READABLE)
                                .ok();

                            let in_token = Token(*next_token);
                            *next_token += 1;
                            registry
                                .register(&mut server_in_mio, in_token, Interest::WRITABLE)
                                .ok();

                            conn.cgi_out_token = Some(out_token);
                            conn.cgi_in_token = Some(in_token);

                            conn.action = ActiveAction::Cgi {
                                out_stream: server_out_mio,
                                in_stream: Some(server_in_mio),
                                child,
                                parse_state: CgiParsingState::ReadHeaders,
                                header_buf: Vec::new(),
                            };

                            cgi_to_client.insert(out_token, client_token);
                            cgi_to_client.insert(in_token, client_token);

                            None
                        }
                        Err(_) => Some(error_response(HTTP_INTERNAL_SERVER_ERROR, &s_cfg)),
                    }
                } else {
                    match request.method {
                        Method::GET | Method::HEAD => {
                            let mut res = HttpResponse::new(HTTP_OK, "OK");
                            let action = handle_get(request, &mut res, r_cfg, &s_cfg);
                            if let ActiveAction::FileDownload(file, offset, file_size) = action {
                                conn.action = ActiveAction::FileDownload(file, offset, file_size);
                            }
                            Some(res)
                        }
                        Method::POST => {
                            // Decide if we will upload to a file
                            if !r_cfg.upload_dir.is_empty() {
                                let path = PathBuf::from(&r_cfg.root).join(&r_cfg.upload_dir);
                                conn.action = ActiveAction::Upload(path);
                                None
                            } else {
                                Some(error_response(HTTP_METHOD_NOT_ALLOWED, &s_cfg))
                            }
                        }
                        Method::DELETE => Some(handle_delete(request, r_cfg, &s_cfg)),
                    }
                }
            }
            Err(RoutingError::MethodNotAllowed) => {
                Some(error_response(HTTP_METHOD_NOT_ALLOWED, &s_cfg))
            }
            Err(RoutingError::NotFound) => Some(error_response(HTTP_NOT_FOUND, &s_cfg)),
        };

        // 3. Update State based on body presence
        if res.is_none() {
            if content_length > 0 {
                conn.request.state = ParsingState::Body;
            } else {
                if matches!(conn.action, ActiveAction::Cgi { .. }) {
                    conn.request.state = ParsingState::Complete;
                } else {
                    return Ok(Some(HttpResponse::new(400, "Bad Request").set_body(
                        b"Error: No file data provided.".to_vec(),
                        "text/plain; charset=utf-8",
                    )));
                }
            }
        }

        Ok(res)
    }

    fn parse_request_line(&mut self) -> core::result::Result<(), ParseError> {
        if let Some(abs_index) = find_crlf(&self.buffer, self.cursor) {
            let line_bytes = &self.buffer[self.cursor..abs_index];
            let request_line =
                std::str::from_utf8(line_bytes).map_err(|_| ParseError::MalformedRequestLine)?;

            let parts: Vec<&str> = request_line.split_whitespace().collect();
            if parts.len() == 3 {
                self.method = match parts[0] {
                    "GET" => Method::GET,
                    "POST" => Method::POST,
                    "DELETE" => Method::DELETE,
                    "HEAD" => Method::HEAD,
                    _ => Method::UNKNOWN,
                };
                self.url = parts[1].to_string();
                self.version = parts[2].to_string();

                self.cursor = abs_index + CRLN_LEN;
                self.state = ParsingState::Headers;
            } else {
                return Err(ParseError::MalformedRequestLine);
            }
        } else {
            return Err(ParseError::IncompleteRequestLine);
        }
        Ok(())
    }

    fn extract_and_parse_header(
        &mut self,
    ) -> core::result::Result<Option<(String, String)>, ParseError> {
        if let Some(abs_index) = find_crlf(&self.buffer, self.cursor) {
            let line_bytes = &self.buffer[self.cursor..abs_index];
            if line_bytes.is_empty() {
                self.cursor = abs_index + CRLN_LEN;
                return Ok(None);
            }
            let line =
                std::str::from_utf8(line_bytes).map_err(|_| ParseError::MalformedRequestLine)?;
            self.cursor = abs_index + CRLN_LEN;
            if let Some(sep) = line.find(':') {
                let key = line[..sep].trim().to_string();
                let val = line[sep + 1..].trim().to_string();
                return Ok(Some((key.to_ascii_lowercase(), val)));
            }
            Err(ParseError::MalformedRequestLine)
        } else {
            Err(ParseError::IncompleteRequestLine)
        }
    }

    fn parse_headers(conn: &mut HttpConnection) -> core::result::Result<(), ParseError> {
        loop {
            let headers_option = conn.request.extract_and_parse_header()?;
            match headers_option {
                Some((k, v)) => conn.request.headers.insert(k, v),
                None => {
                    conn.request.buffer.drain(..conn.request.cursor);
                    conn.request.cursor = 0;
                    conn.request.state = ParsingState::HeadersDone;

                    return Ok(());
                }
            };
        }
    }

    pub fn parse_unchunked_body(
        registry: &Registry,
        conn: &mut HttpConnection,
    ) -> core::result::Result<(), ParseError> {
        if let Some(_) = &conn.s_cfg {
            let available = conn.request.buffer.len() - conn.request.cursor;
            let to_process = std::cmp::min(available, conn.body_remaining);
            // let cursor = conn.request.cursor;

            if to_process > 0 {
                match &mut conn.action {
                    ActiveAction::Cgi { in_stream, .. } => {
                        let data = conn.request.buffer.drain(..to_process).collect::<Vec<u8>>();
                        conn.cgi_buffer.extend_from_slice(&data);
                        conn.body_remaining -= to_process;

                        if let Some(in_token) = conn.cgi_in_token {
                            if let Some(pipe) = in_stream {
                                registry
                                    .reregister(pipe, in_token, Interest::WRITABLE)
                                    .ok();
                            }
                        }
                    }
                    ActiveAction::DynamicRoute(_) => {
                        let data = conn.request.buffer.drain(..to_process).collect::<Vec<u8>>();
                        conn.request.body.extend_from_slice(&data);
                        conn.body_remaining -= to_process;
                    }
                    _ => {
                        let start = conn.request.cursor;
                        execute_active_action(
                            &conn.request,
                            &mut conn.upload_manager,
                            &mut conn.action,
                            start,
                            to_process,
                            &conn.boundary,
                        )?;

                        conn.body_remaining -= to_process;
                        conn.request.buffer.drain(start..start + to_process);
                    }
                }
            }
        }

        if conn.body_remaining == 0 {
            conn.request.state = ParsingState::Complete;
        } else {
            return Err(ParseError::IncompleteRequestLine);
        }

        Ok(())
    }

    pub fn extract_filename(&self) -> String {
        format!(
            "uploaded_{}",
            SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0)
                .to_string()
        )
    }

    /// Populates `form_fields` by decoding `body` as
    /// `application/x-www-form-urlencoded` (spec §4.G.3: `+` is a space,
    /// `%XX` is a percent-escape, pairs are split on `&` then `=`). A
    /// no-op if the body isn't that content type.
    pub fn parse_form_fields(&mut self) {
        let is_urlencoded = self
            .headers
            .get("content-type")
            .map(|v| v.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if !is_urlencoded {
            return;
        }
        for pair in self.body.split(|&b| b == b'&') {
            if pair.is_empty() {
                continue;
            }
            let mut parts = pair.splitn(2, |&b| b == b'=');
            let key = parts.next().unwrap_or(b"");
            let value = parts.next().unwrap_or(b"");
            self.form_fields
                .insert(percent_decode(key), percent_decode(value));
        }
    }
}

/// Decodes `+` as a space and `%XX` escapes, per
/// `application/x-www-form-urlencoded` (RFC 3986 / the HTML form spec).
/// Malformed escapes are passed through as literal bytes.
fn percent_decode(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < input.len() => {
                let hex = std::str::from_utf8(&input[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(input[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn find_crlf(buffer: &[u8], start_offset: usize) -> Option<usize> {
    let search_area = buffer.get(start_offset..)?;

    let mut current_pos = 0;
    while let Some(r_pos) = search_area[current_pos..].iter().position(|&b| b == b'\r') {
        let abs_r_pos_in_search = current_pos + r_pos;

        if search_area.get(abs_r_pos_in_search + 1) == Some(&b'\n') {
            // Return the absolute position in the original 'buffer'
            return Some(start_offset + abs_r_pos_in_search);
        }
        current_pos = abs_r_pos_in_search + 1;
    }
    None
}

pub fn find_subsequence(buffer: &[u8], needle: &[u8], start_offset: usize) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let search_area = buffer.get(start_offset..)?;
    let first_byte = needle[0];
    let mut current_pos = 0;

    // Use .iter().position() to find the first byte efficiently
    while let Some(rel_pos) = search_area[current_pos..]
        .iter()
        .position(|&b| b == first_byte)
    {
        let abs_pos_in_search = current_pos + rel_pos;

        // Check if the remaining bytes match
        if let Some(candidate) =
            search_area.get(abs_pos_in_search..abs_pos_in_search + needle.len())
        {
            if candidate == needle {
                return Some(start_offset + abs_pos_in_search);
            }
        } else {
            // Not enough bytes left in search_area to match needle
            return None;
        }

        // Move forward to keep searching
        current_pos = abs_pos_in_search + 1;
    }
    None
}

impl Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- HTTP Request ---\n")?;
        // 1. Request Line: GET /path HTTP/1.1
        writeln!(f, "{:?} {} {}", self.method, self.url, self.version)?;

        // 2. Headers: Key: Value
        writeln!(f, "Headers:")?;
        for (key, value) in &self.headers {
            writeln!(f, "  {}: {}", key, value)?;
        }

        // 3. Body Summary
        // We only print the body if it's UTF-8; otherwise, we show the byte count.
        if !self.body.is_empty() {
            writeln!(f, "Body ({} bytes):", self.body.len())?;
            match String::from_utf8(self.body.clone()) {
                Ok(s) => writeln!(f, "  {}", s)?,
                Err(_) => writeln!(f, "  <binary data>")?,
            }
        } else {
            writeln!(f, "Body: <empty>")?;
        }
        writeln!(f, "\n--------------------")?;
        writeln!(f, "--------------------")
    }
}

#[derive(Debug, Default)]
pub struct PartInfo {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: String,
}

fn error_response(code: u16, s_cfg: &Arc<ServerConfig>) -> HttpResponse {
    let mut res = HttpResponse::new(code, "");
    handle_error(&mut res, code, Some(s_cfg));
    res
}

pub fn parse_part_headers(headers: &str) -> PartInfo {
    let mut info = PartInfo {
        name: String::new(),
        filename: None,
        content_type: String::new(),
    };

    for line in headers.lines() {
        if line.starts_with("Content-Disposition:") {
            // Extract 'name'
            if let Some(n) = line.split(';').find(|s| s.trim().starts_with("name=")) {
                info.name = n
                    .split('=')
                    .nth(1)
                    .unwrap_or("")
                    .trim_matches('"')
                    .to_string();
            }
            // Extract 'filename'
            if let Some(f) = line.split(';').find(|s| s.trim().starts_with("filename=")) {
                info.filename = Some(
                    f.split('=')
                        .nth(1)
                        .unwrap_or("")
                        .trim_matches('"')
                        .to_string(),
                );
            }
        } else if line.starts_with("Content-Type:") {
            info.content_type = line
                .split(':')
                .nth(1)
                .unwrap_or("text/plain")
                .trim()
                .to_string();
        }
    }
    info
}
