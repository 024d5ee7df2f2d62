//! SQLite command bridge for host applications.
//!
//! # Intention
//!
//! - Expose SQLite to a host runtime through a small method protocol:
//!   execute, insert, update, query, cursor paging and batches.
//! - Turn every outcome into a transport-safe envelope, with SQLite's own
//!   error codes passed through untouched.
//!
//! # Architectural Boundaries
//!
//! - Only the adaptation layer lives here. The engine is rusqlite, the
//!   transport belongs to the host.
//! - Handles are addressed by generated ids held in the [`Dispatcher`]
//!   registry; there is no global state.

pub mod batch;
pub mod command;
pub mod config;
pub mod cursor;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod sanitize;
pub mod sqlite;
pub mod value;

pub use batch::{BatchItem, BatchOptions, BatchResult};
pub use command::{Command, CommandOptions, Envelope, Method, MethodCall, Params, Response};
pub use config::{BridgeConfig, LogLevel};
pub use cursor::{CursorId, Page, ResultCursor};
pub use database::{DatabaseId, OpenOptions, TransactionState};
pub use dispatcher::Dispatcher;
pub use error::{BridgeError, EngineError, ErrorEnvelope};
pub use executor::{OperationKind, Outcome};
pub use sqlite::{MethodHandler, SqliteService};
pub use value::Value;
