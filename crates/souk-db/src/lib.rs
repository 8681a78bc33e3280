//! Storage layer for the Souk federation core.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations for the three tables the federation core
//! owns: the local server identity, the federated server trust table, and
//! the append-only federation audit log.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: concurrent readers with a single writer match
//!   the federation access pattern (many verifications, rare trust changes).
//! - **Row-keyed upserts**: writes to one remote server's record go through
//!   `ON CONFLICT(server_id)` statements, so SQLite serializes same-row
//!   writers without any application-level lock.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!` and cannot drift from the code that depends on them.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
