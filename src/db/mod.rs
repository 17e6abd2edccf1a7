//! Postgres access for the durable queue store.
//!
//! Wraps diesel-async pooling (bb8) and the embedded migrations that
//! create the queue tables.

mod pool;

pub use pool::{AsyncDbPool, MIGRATIONS, establish_async_connection_pool, run_pending_migrations};
