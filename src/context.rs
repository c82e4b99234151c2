//! Shared state every dynamic route handler closes over (spec §4.H
//! "invoke handler with `(request, context)`", §9 "any closure type
//! suffices"). Built once at startup and held behind `Arc` so every
//! sub-reactor and worker thread sees the same session table and DB pool.

use std::sync::{Arc, Mutex};

use mio::Token;

use crate::http::HttpResponse;
use crate::pools::db::{DbPool, FixtureDbHandle};
use crate::routing::Router;
use crate::utils::SessionStore;
use crate::workers::WorkerPool;

#[derive(Clone)]
pub struct Context {
    pub session_store: Arc<Mutex<SessionStore>>,
    pub db_pool: Arc<DbPool<FixtureDbHandle>>,
    pub router: Arc<Router>,
    /// Offloads a dynamic route's handler body (spec §4.E/§9: "a
    /// sub-reactor hands blocking work here"). `None` in tests and any
    /// other caller that builds a bare `Context` — `HttpRequest::
    /// setup_action`/`proces_request` fall back to running the handler
    /// inline when this is absent, so unit tests exercising handlers
    /// directly are unaffected.
    pub dispatch: Option<Arc<RouteDispatcher>>,
}

impl Context {
    /// Builds the shared state with an empty route table; callers that
    /// need the login/register/ws-upgrade endpoints should use
    /// `with_router` instead (`Server::new` does).
    pub fn new(session_ttl: u64, db_pool_size: usize) -> crate::error::Result<Self> {
        Self::with_router(session_ttl, db_pool_size, Router::new())
    }

    pub fn with_router(
        session_ttl: u64,
        db_pool_size: usize,
        router: Router,
    ) -> crate::error::Result<Self> {
        Ok(Self {
            session_store: Arc::new(Mutex::new(SessionStore::new(session_ttl))),
            db_pool: Arc::new(DbPool::new(db_pool_size)?),
            router: Arc::new(router),
            dispatch: None,
        })
    }

    /// Attaches the worker pool `Server::new` constructs. Chainable so
    /// `Context::with_router(..)?.with_dispatch(..)` reads as one setup
    /// expression.
    pub fn with_dispatch(mut self, dispatch: Arc<RouteDispatcher>) -> Self {
        self.dispatch = Some(dispatch);
        self
    }
}

/// Wakes the owning reactor when a worker thread finishes a dynamic
/// route's handler body, the same "post the result back through the
/// eventfd queue" shape §4.M uses for read/write tasks (here: `mio::
/// Waker` standing in for the eventfd, `completed` standing in for the
/// task queue the reactor drains every loop iteration).
pub struct RouteDispatcher {
    pool: Arc<WorkerPool>,
    completed: Arc<Mutex<Vec<Token>>>,
    waker: Arc<mio::Waker>,
}

impl RouteDispatcher {
    /// `pool` is shared across every sub-reactor's own `RouteDispatcher`;
    /// `completed`/`waker` belong to the one sub-reactor this dispatcher
    /// was built for, so a finished job wakes only the reactor that's
    /// actually waiting on it.
    pub fn new(
        pool: Arc<WorkerPool>,
        completed: Arc<Mutex<Vec<Token>>>,
        waker: Arc<mio::Waker>,
    ) -> Self {
        Self { pool, completed, waker }
    }

    /// Submits `job` to the worker pool. On success, `job`'s result lands
    /// in `slot` and `token` is pushed onto the completed-dispatch list
    /// before the reactor is woken — `Server::apply_pending_routes` drains
    /// that list each loop iteration. Returns `false` if the backlog is
    /// full (spec §7 "pool exhaustion": the caller decides what to do,
    /// here that's a synchronous fallback or a 503).
    pub fn dispatch(
        &self,
        token: Token,
        slot: Arc<Mutex<Option<HttpResponse>>>,
        job: impl FnOnce() -> HttpResponse + Send + 'static,
    ) -> bool {
        let completed = Arc::clone(&self.completed);
        let waker = Arc::clone(&self.waker);
        self.pool
            .append(Box::new(move || {
                let response = job();
                *slot.lock().unwrap() = Some(response);
                completed.lock().unwrap().push(token);
                let _ = waker.wake();
            }))
            .is_ok()
    }
}
