//! Connection drivers behind [`Client`](crate::Client).
//!
//! A [`Backend`] knows which parameters it needs and how to open and
//! release one connection. [`SqlBackend`] adds statement execution, which
//! is what makes a client [`Executable`](crate::Executable).

mod host;
mod sqlite;

pub use host::HostBackend;
pub use sqlite::SqliteBackend;

use crate::error::BoxError;
use crate::fetch::{FetchMode, Fetched, QueryParams};
use crate::param::{ConnectParams, ParamMap};

pub trait Backend: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Short kind name used in logs and configuration.
    const KIND: &'static str;

    /// Parameters this backend reads, with settings keys prefixed by
    /// `prefix` (the client's upper-cased logical name).
    fn param_map(&self, prefix: &str) -> ParamMap;

    fn open(&self, params: &ConnectParams) -> Result<Self::Connection, BoxError>;

    fn release(&self, connection: Self::Connection) -> Result<(), BoxError>;
}

pub trait SqlBackend: Backend {
    /// Prepare `query`, bind `params`, run it and read rows per `fetch`.
    /// The prepared statement must not outlive the call.
    fn run(
        &self,
        connection: &mut Self::Connection,
        query: &str,
        params: &QueryParams,
        fetch: FetchMode,
    ) -> Result<Fetched, BoxError>;

    /// Commit the open transaction, if any.
    fn commit(&self, connection: &mut Self::Connection) -> Result<(), BoxError>;
}
