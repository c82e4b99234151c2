//! Main reactor (components M/N): binds every listener named across the
//! parsed `AppConfig` and accepts connections, but does none of the actual
//! HTTP/WebSocket/CGI work itself — that's spread across `opts.sub_reactors`
//! `reactor::SubReactor` threads, each owning its own `mio::Poll` and its
//! own slice of connections, fed accepted sockets round-robin through a
//! per-reactor incoming queue. The room/user registry
//! (`websocket::WebSocketServer`) and the worker pool that runs dynamic
//! route handlers and dispatched read/write phases are the two pieces of
//! state every sub-reactor shares; everything else is reactor-local.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::error::CleanError;
use crate::handlers::{handle_login, handle_register};
use crate::prelude::*;
use crate::reactor::{IncomingConn, SubReactor};

const WORKER_BACKLOG: usize = 256;
const SESSION_TTL_SECS: u64 = 3600;

/// Runtime tunables a deployer can override from the command line (spec
/// §6 "CLI" / SPEC_FULL §1.3: `-s/--sql-pool-size`, `-t/--threads`,
/// `-r/--sub-reactors`). `Default` matches the teacher's original
/// hardcoded constants, plus a sub-reactor count sized for a small
/// deployment (spec §2/§4.M/N: "N sub-reactor threads").
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub db_pool_size: usize,
    pub worker_threads: usize,
    pub sub_reactors: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            db_pool_size: 4,
            worker_threads: 4,
            sub_reactors: 2,
        }
    }
}

/// Token for the main acceptor's own waker and self-pipe signal fd; kept
/// well clear of `reactor::TOKEN_SPACE`-sized ranges sub-reactors use.
const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);

pub struct Server {
    listeners: HashMap<Token, (TcpListener, Vec<Arc<ServerConfig>>)>,
    worker_pool: Arc<WorkerPool>,
    ctx_base: Context,
    session_store: Arc<Mutex<SessionStore>>,
    sub_reactors: usize,
    signal_fd: RawFd,
}

impl Server {
    /// Binds every `(host, port)` a valid `ServerConfig` names, groups
    /// virtual hosts sharing one listener the way `HttpConnection::
    /// resolve_config` expects, and builds the programmatic route table for
    /// the endpoints that aren't backed by a `RouteConfig` at all.
    pub fn new(config: AppConfig, poll: &Poll, opts: ServerOptions) -> Result<Self> {
        let servers = validate_configs(config.servers);
        if servers.is_empty() {
            return Err(CleanError::from(
                "no valid server blocks remain after validation",
            ));
        }

        let mut groups: HashMap<(String, u16), Vec<Arc<ServerConfig>>> = HashMap::new();
        for cfg in servers {
            let cfg = Arc::new(cfg);
            for port in cfg.ports.clone() {
                groups
                    .entry((cfg.host.clone(), port))
                    .or_default()
                    .push(Arc::clone(&cfg));
            }
        }

        let mut listeners = HashMap::new();
        let mut next_token = 0usize;
        for ((host, port), config_list) in groups {
            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            let mut listener = TcpListener::bind(addr)?;
            let token = Token(next_token);
            next_token += 1;
            poll.registry()
                .register(&mut listener, token, Interest::READABLE)?;
            info!(
                "listening on {addr} ({} virtual host{})",
                config_list.len(),
                if config_list.len() == 1 { "" } else { "s" }
            );
            listeners.insert(token, (listener, config_list));
        }

        let signal_fd = crate::signal::install(poll.registry(), SIGNAL_TOKEN)?;

        let mut router = Router::new();
        router
            .add_route(Method::POST, "/api/login", Arc::new(handle_login))
            .map_err(|e| CleanError::from(e.to_string()))?;
        router
            .add_route(Method::POST, "/api/register", Arc::new(handle_register))
            .map_err(|e| CleanError::from(e.to_string()))?;

        let worker_pool = Arc::new(WorkerPool::new(opts.worker_threads, WORKER_BACKLOG));
        let ctx_base = Context::with_router(SESSION_TTL_SECS, opts.db_pool_size, router)?;
        let session_store = Arc::clone(&ctx_base.session_store);

        Ok(Self {
            listeners,
            worker_pool,
            ctx_base,
            session_store,
            sub_reactors: opts.sub_reactors.max(1),
            signal_fd,
        })
    }

    /// Spawns the sub-reactor threads, then drives the main acceptor loop
    /// until SIGINT/SIGTERM arrives: accepts connections and round-robins
    /// them to the sub-reactors, and otherwise does nothing but wait. On
    /// shutdown, signals every sub-reactor, joins their threads, and tears
    /// down the shared worker pool before returning.
    pub fn run(self, poll: Poll) -> Result<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut incoming_queues = Vec::with_capacity(self.sub_reactors);
        let mut wakers = Vec::with_capacity(self.sub_reactors);
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.sub_reactors);

        for id in 0..self.sub_reactors {
            let sub_poll = Poll::new()?;
            let incoming: Arc<Mutex<Vec<IncomingConn>>> = Arc::new(Mutex::new(Vec::new()));
            let reactor = SubReactor::new(
                id,
                &sub_poll,
                Arc::clone(&self.session_store),
                self.ctx_base.clone(),
                Arc::clone(&self.worker_pool),
                Arc::clone(&incoming),
                Arc::clone(&shutdown),
            )?;
            wakers.push(reactor.waker());
            incoming_queues.push(incoming);

            let handle = std::thread::Builder::new()
                .name(format!("sub-reactor-{id}"))
                .spawn(move || {
                    if let Err(e) = reactor.run(sub_poll) {
                        proxy_log::warn!("sub-reactor {id} exited with an error: {e}");
                    }
                })
                .map_err(|e| CleanError::from(e.to_string()))?;
            handles.push(handle);
        }

        let mut listeners = self.listeners;
        let mut events = Events::with_capacity(256);
        let mut round_robin = 0usize;

        'accept_loop: loop {
            match poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(CleanError::from(e)),
            }

            for event in events.iter() {
                let token = event.token();

                if token == SIGNAL_TOKEN {
                    crate::signal::drain(self.signal_fd);
                    info!("shutdown signal received, stopping sub-reactors");
                    break 'accept_loop;
                }

                if let Some((listener, config_list)) = listeners.get_mut(&token) {
                    loop {
                        match listener.accept() {
                            Ok((stream, _addr)) => {
                                let idx = round_robin % incoming_queues.len();
                                round_robin = round_robin.wrapping_add(1);
                                incoming_queues[idx].lock().unwrap().push(IncomingConn {
                                    stream,
                                    config_list: config_list.clone(),
                                });
                                let _ = wakers[idx].wake();
                            }
                            Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                            Err(e) => {
                                proxy_log::warn!("accept failed: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        }

        shutdown.store(true, Ordering::Relaxed);
        for waker in &wakers {
            let _ = waker.wake();
        }
        for handle in handles {
            let _ = handle.join();
        }

        self.worker_pool.shutdown();
        Ok(())
    }
}
