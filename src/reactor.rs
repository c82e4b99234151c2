//! One sub-reactor (spec §2/§4.M/N "main reactor accepts, N sub-reactors
//! each own an epoll instance and round-robin-receive fds"). Everything a
//! single reactor thread needs to own outright — its own `mio::Poll`, its
//! own HTTP/WebSocket/CGI connection tables — lives here; the handful of
//! things every sub-reactor shares with its siblings (the worker pool, the
//! session store, the process-wide WebSocket room registry) come in as
//! `Arc`s from `Server::run`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::cgi::{cleanup_cgi, handle_cgi_event};
use crate::context::RouteDispatcher;
use crate::error::CleanError;
use crate::prelude::*;
use crate::websocket::{self, WakeFn, WsEvent};

const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Token values for sub-reactor `id` live in `[id * TOKEN_SPACE, (id+1) *
/// TOKEN_SPACE)`. Disjoint ranges mean every `Token` handed to the
/// process-wide `websocket::WebSocketServer` singleton, and every token a
/// worker thread allocates for a CGI pipe on this reactor's behalf, stays
/// globally unique without any cross-reactor coordination.
const TOKEN_SPACE: usize = 1 << 32;

/// Per-dispatch token block: `handle_read_phase`/`handle_write_phase` only
/// ever mint a couple of tokens (a CGI stdin/stdout pipe pair), so reserving
/// this many up front for each dispatched job leaves plenty of headroom
/// without needing to report unused tokens back to the reactor.
const TOKENS_PER_DISPATCH: usize = 16;

struct WsSlot {
    stream: TcpStream,
    conn: Arc<websocket::WebSocketConnection>,
    timer_id: crate::timer::TimerId,
}

/// A connection handed over by the main reactor, queued for this
/// sub-reactor to register and take ownership of on its next loop tick.
pub struct IncomingConn {
    pub stream: TcpStream,
    pub config_list: Vec<Arc<ServerConfig>>,
}

pub struct SubReactor {
    connections: HashMap<Token, HttpConnection>,
    ws_connections: HashMap<Token, WsSlot>,
    ws_timers: TimerManager<Token>,
    cgi_to_client: HashMap<Token, Token>,
    zombie_purgatory: Vec<std::process::Child>,
    session_store: Arc<Mutex<SessionStore>>,
    ctx: Context,
    buffer_pool: BufferPool,
    pending_ws_wakes: Arc<Mutex<Vec<Token>>>,
    pending_route_wakes: Arc<Mutex<Vec<Token>>>,
    /// Connections a worker thread finished `handle_read_phase`/
    /// `handle_write_phase` on (spec §4.E/§9): dispatched instead of run
    /// inline on this reactor thread, and handed back here once the job
    /// completes.
    finished_io: Arc<Mutex<Vec<(Token, HttpConnection)>>>,
    waker: Arc<mio::Waker>,
    waker_token: Token,
    next_token: AtomicUsize,
    worker_pool: Arc<WorkerPool>,
    incoming: Arc<Mutex<Vec<IncomingConn>>>,
    shutdown: Arc<AtomicBool>,
}

impl SubReactor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        poll: &Poll,
        session_store: Arc<Mutex<SessionStore>>,
        ctx_base: Context,
        worker_pool: Arc<WorkerPool>,
        incoming: Arc<Mutex<Vec<IncomingConn>>>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let base = id * TOKEN_SPACE;
        let waker_token = Token(base);
        let waker = Arc::new(mio::Waker::new(poll.registry(), waker_token)?);

        let pending_route_wakes = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = RouteDispatcher::new(
            Arc::clone(&worker_pool),
            Arc::clone(&pending_route_wakes),
            Arc::clone(&waker),
        );
        let ctx = ctx_base.with_dispatch(Arc::new(dispatcher));

        Ok(Self {
            connections: HashMap::new(),
            ws_connections: HashMap::new(),
            ws_timers: TimerManager::new(),
            cgi_to_client: HashMap::new(),
            zombie_purgatory: Vec::new(),
            session_store,
            ctx,
            buffer_pool: BufferPool::new(),
            pending_ws_wakes: Arc::new(Mutex::new(Vec::new())),
            pending_route_wakes,
            finished_io: Arc::new(Mutex::new(Vec::new())),
            waker,
            waker_token,
            next_token: AtomicUsize::new(base + 1),
            worker_pool,
            incoming,
            shutdown,
        })
    }

    pub fn waker(&self) -> Arc<mio::Waker> {
        Arc::clone(&self.waker)
    }

    fn alloc_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Drives this sub-reactor's event loop until the process-wide
    /// `shutdown` flag is observed. Every iteration: pulls in connections
    /// handed over by the acceptor, re-arms `EPOLLOUT` for WebSocket fds a
    /// broadcast queued bytes for, reinstates connections whose dispatched
    /// read/write phase or route handler finished on a worker thread,
    /// blocks in `poll.poll`, dispatches whichever kind of token came back,
    /// then runs the idle-connection and CGI-timeout sweeps.
    pub fn run(mut self, poll: Poll) -> Result<()> {
        let mut events = Events::with_capacity(1024);

        while !self.shutdown.load(Ordering::Relaxed) {
            self.accept_incoming(&poll)?;
            self.rearm_pending_ws_writes(&poll);
            self.apply_pending_routes(&poll)?;
            self.apply_finished_io(&poll)?;

            match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(CleanError::from(e)),
            }

            for event in events.iter() {
                let token = event.token();

                if token == self.waker_token {
                    continue;
                }
                if self.ws_connections.contains_key(&token) {
                    self.handle_ws_event(&poll, token, event);
                    continue;
                }
                if let Some(&client_token) = self.cgi_to_client.get(&token) {
                    if let Some(conn) = self.connections.get_mut(&client_token) {
                        handle_cgi_event(
                            &poll,
                            event,
                            token,
                            client_token,
                            conn,
                            &mut self.cgi_to_client,
                        )?;
                    }
                    self.close_if_done(client_token);
                    continue;
                }
                if self.connections.contains_key(&token) {
                    self.dispatch_client_event(&poll, token, event)?;
                }
            }

            self.reap_zombies();
            timeouts::process_reactor(
                &mut self.connections,
                &poll,
                &mut self.cgi_to_client,
                &self.session_store,
            );
            self.sweep_ws_timeouts(&poll);
        }

        Ok(())
    }

    fn accept_incoming(&mut self, poll: &Poll) -> Result<()> {
        let incoming: Vec<IncomingConn> = std::mem::take(&mut *self.incoming.lock().unwrap());
        for IncomingConn { mut stream, config_list } in incoming {
            let token = self.alloc_token();
            if let Err(e) = poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
            {
                proxy_log::warn!("failed to register handed-off connection: {e}");
                continue;
            }
            let conn = HttpConnection::new(stream, config_list);
            self.connections.insert(token, conn);
        }
        Ok(())
    }

    /// Submits the per-connection read/write state-machine step to the
    /// worker pool (spec §4.E/§9: "a read task and a write task for the
    /// same fd cannot overlap") instead of running it inline here. The
    /// connection is pulled out of `self.connections` for the job's
    /// duration — any event for its token arriving before the job
    /// finishes is silently dropped, same as the existing `PendingRoute`
    /// guard in `handle_post_write_update` — and handed back through
    /// `finished_io` once the job completes.
    fn dispatch_client_event(&mut self, poll: &Poll, token: Token, event: &Event) -> Result<()> {
        let Some(mut conn) = self.connections.remove(&token) else {
            return Ok(());
        };
        conn.touch();
        let readable = event.is_readable();
        let writable = event.is_writable();

        let registry = poll.registry().try_clone()?;
        let session_store = Arc::clone(&self.session_store);
        let ctx = self.ctx.clone();
        let finished_io = Arc::clone(&self.finished_io);
        let waker = Arc::clone(&self.waker);
        let mut local_next_token = self.next_token.fetch_add(TOKENS_PER_DISPATCH, Ordering::Relaxed);

        let conn_slot: Arc<Mutex<Option<HttpConnection>>> = Arc::new(Mutex::new(None));
        *conn_slot.lock().unwrap() = Some(conn);
        let conn_slot_for_job = Arc::clone(&conn_slot);

        let submit_result = self.worker_pool.append(Box::new(move || {
            let mut conn = conn_slot_for_job.lock().unwrap().take().unwrap();
            let mut cgi_to_client: HashMap<Token, Token> = HashMap::new();

            if readable {
                let _ = HttpConnection::handle_read_phase(
                    &mut conn,
                    &registry,
                    token,
                    &mut local_next_token,
                    &mut cgi_to_client,
                    &mut session_store.lock().unwrap(),
                    &ctx,
                );
            }
            if !conn.closed && writable {
                let _ = HttpConnection::handle_write_phase(
                    &mut conn,
                    &registry,
                    token,
                    &mut local_next_token,
                    &mut cgi_to_client,
                    &mut session_store.lock().unwrap(),
                    &ctx,
                );
            }

            finished_io.lock().unwrap().push((token, conn));
            let _ = waker.wake();
        }));

        if let Err(_job) = submit_result {
            // Backlog full (spec §7 "pool exhaustion"): fall back to
            // running this fd's read/write phase inline, same as a
            // dynamic route's handler falls back to synchronous
            // execution in `HttpRequest::dispatch_route`.
            let mut conn = conn_slot.lock().unwrap().take().unwrap();
            let registry = poll.registry();
            let mut inline_next_token = self.next_token.load(Ordering::Relaxed);

            if readable {
                HttpConnection::handle_read_phase(
                    &mut conn,
                    registry,
                    token,
                    &mut inline_next_token,
                    &mut self.cgi_to_client,
                    &mut self.session_store.lock().unwrap(),
                    &self.ctx,
                )?;
            }
            if !conn.closed && writable {
                HttpConnection::handle_write_phase(
                    &mut conn,
                    registry,
                    token,
                    &mut inline_next_token,
                    &mut self.cgi_to_client,
                    &mut self.session_store.lock().unwrap(),
                    &self.ctx,
                )?;
            }
            self.next_token
                .fetch_max(inline_next_token, Ordering::Relaxed);
            self.connections.insert(token, conn);
            self.finish_client_event(poll, token)?;
        }

        Ok(())
    }

    /// The synchronous counterpart of `apply_finished_io`'s per-connection
    /// handling, used by the inline fallback path.
    fn finish_client_event(&mut self, poll: &Poll, token: Token) -> Result<()> {
        let ready_for_ws = self
            .connections
            .get(&token)
            .map(|c| matches!(c.action, ActiveAction::WsUpgrade) && c.write_buffer.is_empty())
            .unwrap_or(false);
        if ready_for_ws {
            return self.promote_to_websocket(poll, token);
        }
        self.close_if_done(token);
        Ok(())
    }

    fn close_if_done(&mut self, token: Token) {
        let should_close = self
            .connections
            .get(&token)
            .map(HttpConnection::should_close)
            .unwrap_or(false);
        if should_close {
            HttpConnection::terminate_connection(
                &mut self.connections,
                &mut self.cgi_to_client,
                &mut self.zombie_purgatory,
                token,
            );
        }
    }

    /// Drains connections a worker thread finished `handle_read_phase`/
    /// `handle_write_phase` on, reinserts them, and promotes to WebSocket
    /// or tears down as needed — the counterpart of the synchronous path
    /// `Server::handle_client_event` used to run inline before dispatch.
    fn apply_finished_io(&mut self, poll: &Poll) -> Result<()> {
        let finished: Vec<(Token, HttpConnection)> =
            std::mem::take(&mut *self.finished_io.lock().unwrap());
        for (token, conn) in finished {
            self.connections.insert(token, conn);
            self.finish_client_event(poll, token)?;
        }
        Ok(())
    }

    /// Finishes the "Upgrade" action (spec §4.I/§4.K): the 101 response has
    /// drained from `write_buffer`, so the HTTP connection slot is retired
    /// and its socket reborn as a `WebSocketConnection`, registered with the
    /// process-wide room/user singleton.
    fn promote_to_websocket(&mut self, poll: &Poll, token: Token) -> Result<()> {
        let Some(conn) = self.connections.remove(&token) else {
            return Ok(());
        };
        let mut stream = conn.stream;
        poll.registry()
            .reregister(&mut stream, token, Interest::READABLE)?;

        let ws_conn = Arc::new(websocket::WebSocketConnection::new());
        let pending = Arc::clone(&self.pending_ws_wakes);
        let waker = Arc::clone(&self.waker);
        let wake: WakeFn = Box::new(move |fd: Token| {
            pending.lock().unwrap().push(fd);
            let _ = waker.wake();
        });
        websocket::WebSocketServer::instance().add(token, Arc::clone(&ws_conn), wake);

        let timer_id = self.ws_timers.add_from_now(CLIENT_TIMEOUT, token);
        self.ws_connections.insert(
            token,
            WsSlot {
                stream,
                conn: ws_conn,
                timer_id,
            },
        );
        info!("{token:?} upgraded to a websocket connection");
        Ok(())
    }

    fn handle_ws_event(&mut self, poll: &Poll, token: Token, event: &Event) {
        let mut close = false;

        if event.is_readable() {
            close |= self.read_ws(token);
        }
        if !close && event.is_writable() {
            close |= self.flush_ws(poll, token);
        }
        if close {
            self.drop_ws(poll, token);
        } else if let Some(slot) = self.ws_connections.get(&token) {
            let interest = if slot.conn.has_pending_write() {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if let Some(slot) = self.ws_connections.get_mut(&token) {
                let _ = poll.registry().reregister(&mut slot.stream, token, interest);
            }
        }
    }

    /// Returns `true` if the connection should be torn down.
    fn read_ws(&mut self, token: Token) -> bool {
        let Some(slot) = self.ws_connections.get_mut(&token) else {
            return true;
        };

        let mut buf = self.buffer_pool.acquire(4096);
        buf.resize(4096, 0);
        let outcome = match slot.stream.read(&mut buf) {
            Ok(0) => Some(true),
            Ok(n) => {
                self.ws_timers.adjust_from_now(slot.timer_id, CLIENT_TIMEOUT);
                match slot.conn.feed(&buf[..n]) {
                    Ok(events) => {
                        for ev in events {
                            match ev {
                                WsEvent::Text(text) => {
                                    let mut store = self.session_store.lock().unwrap();
                                    if let websocket::DispatchOutcome::Reply(reply) =
                                        websocket::handle_message(token, &text, &mut store)
                                    {
                                        slot.conn.send_text(&reply);
                                    }
                                }
                                WsEvent::ClosedByPeer | WsEvent::PongQueued => {}
                            }
                        }
                        None
                    }
                    Err(_) => Some(true),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => None,
            Err(_) => Some(true),
        };
        buf.clear();
        self.buffer_pool.release(buf);

        let closed_by_peer = self
            .ws_connections
            .get(&token)
            .map(|s| s.conn.is_closed())
            .unwrap_or(false);

        outcome.unwrap_or(false) || closed_by_peer
    }

    /// Returns `true` if the write failed and the connection should close.
    fn flush_ws(&mut self, _poll: &Poll, token: Token) -> bool {
        let Some(slot) = self.ws_connections.get_mut(&token) else {
            return true;
        };
        let pending = slot.conn.take_write_buffer();
        if pending.is_empty() {
            return false;
        }
        match slot.stream.write(&pending) {
            Ok(n) if n == pending.len() => false,
            Ok(n) => {
                slot.conn.requeue_unsent(&pending[n..]);
                false
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                slot.conn.requeue_unsent(&pending);
                false
            }
            Err(_) => true,
        }
    }

    fn drop_ws(&mut self, poll: &Poll, token: Token) {
        if let Some(mut slot) = self.ws_connections.remove(&token) {
            self.ws_timers.remove(slot.timer_id);
            let _ = poll.registry().deregister(&mut slot.stream);
        }
        websocket::WebSocketServer::instance().remove(token);
    }

    /// Re-arms `EPOLLOUT` for every fd a `WebSocketServer::broadcast_room`
    /// (possibly from a worker thread) queued bytes for since the last
    /// pass, draining the shared queue the `WakeFn` feeds (spec §4.L
    /// edge-trigger rule: a fd only gets woken on the empty->non-empty
    /// transition, so this list never grows unbounded between ticks).
    fn rearm_pending_ws_writes(&mut self, poll: &Poll) {
        let tokens: Vec<Token> = std::mem::take(&mut *self.pending_ws_wakes.lock().unwrap());
        for token in tokens {
            if let Some(slot) = self.ws_connections.get_mut(&token) {
                let _ = poll.registry().reregister(
                    &mut slot.stream,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                );
            }
        }
    }

    /// Drains the completed-dispatch list `Context::dispatch`'s worker
    /// pool pushes a fd onto once a dynamic route's handler body finishes
    /// (spec §4.M: "the worker posts the resulting `Action` back via the
    /// eventfd queue"). For each ready fd: pulls the response out of its
    /// `PendingRoute` slot, writes it, and arms `EPOLLOUT` the same way
    /// `proces_request` does for a synchronously-produced response.
    fn apply_pending_routes(&mut self, poll: &Poll) -> Result<()> {
        let tokens: Vec<Token> = std::mem::take(&mut *self.pending_route_wakes.lock().unwrap());
        for token in tokens {
            let Some(conn) = self.connections.get_mut(&token) else {
                continue;
            };
            let ActiveAction::PendingRoute(slot) = &conn.action else {
                continue;
            };
            let Some(response) = slot.lock().unwrap().take() else {
                continue;
            };
            conn.action = ActiveAction::None;
            conn.write_buffer.extend_from_slice(&response.to_bytes());
            poll.registry().reregister(
                &mut conn.stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            )?;
        }
        Ok(())
    }

    fn sweep_ws_timeouts(&mut self, poll: &Poll) {
        for (_, token) in self.ws_timers.tick() {
            self.drop_ws(poll, token);
        }
    }

    fn reap_zombies(&mut self) {
        self.zombie_purgatory
            .retain_mut(|child| !matches!(child.try_wait(), Ok(Some(_))));
    }
}
