//! Named, validated connection wrappers for the conveyor controller.
//!
//! - **[`Client`]**: a named connection generic over a [`Backend`]. Its
//!   [`ConnectState`] moves `Closed → Pending → Open` on connect and back to
//!   `Closed` on close or failure. Statements run through [`Executable`],
//!   which is a no-op whenever the client is not open.
//!
//! - **[`Parameter`] / [`ParamMap`]**: typed settings values with coercion
//!   and validators. A client resolves its map once, at construction, so a
//!   bad value fails before any connection attempt.
//!
//! - **[`ClientRegistry`] / [`ClientMap`]**: ordered `(name, constructor)`
//!   declarations and the fixed set of clients built from them.
//!
//! Two backends ship with the crate: [`SqliteBackend`] (rusqlite) and
//! [`HostBackend`] (plain TCP).

pub mod backend;
pub mod capability;
pub mod client;
pub mod error;
pub mod fetch;
pub mod param;
pub mod registry;
pub mod settings;
pub mod state;

// ── Primary re-exports ──────────────────────────────────────────────
pub use backend::{Backend, HostBackend, SqlBackend, SqliteBackend};
pub use capability::{Closable, Connectable, Executable, ManagedClient};
pub use client::{Client, HostClient, Session, SqliteClient};
pub use error::{BoxError, Error};
pub use fetch::{FetchMode, Fetched, QueryParams, Row};
pub use param::{ConnectParams, ParamKind, ParamMap, ParamValue, Parameter};
pub use registry::{ClientMap, ClientRegistry};
pub use settings::Settings;
pub use state::ConnectState;
