//! Resource pools (§4.D, §4.F, §4.J): database handles, byte buffers, and
//! reusable per-connection state. Kept as one module because all three
//! share the same shape — a mutex-guarded free list with a capacity cap —
//! even though each pools a different kind of thing.

pub mod buffer;
pub mod connection;
pub mod db;

pub use buffer::BufferPool;
pub use connection::{ConnectionPool, PoolReset, Pooled};
pub use db::{DbHandle, DbPool, FixtureDbHandle, PooledHandle};
