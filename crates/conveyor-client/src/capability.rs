// ── Capability traits ──
//
// Clients are composed from small capabilities instead of a class
// hierarchy. The controller only needs `ManagedClient`; handlers reach
// for `Executable` on the concrete client type.

use std::any::Any;
use std::sync::Arc;

use crate::error::Error;
use crate::fetch::{FetchMode, Fetched, QueryParams};
use crate::param::ConnectParams;
use crate::state::ConnectState;

/// Something that can open a connection and report its state.
pub trait Connectable {
    type Error;

    /// Open (or re-open) the connection.
    fn connect(&self) -> Result<(), Self::Error>;

    fn state(&self) -> ConnectState;
}

/// Something that can release its connection.
pub trait Closable {
    type Error;

    /// Release the connection. The state is CLOSED afterwards even when
    /// releasing fails.
    fn close(&self) -> Result<(), Self::Error>;
}

/// Something that can run statements.
///
/// Both operations are no-ops while the connection is not open:
/// `execute` yields [`Fetched::Nothing`] and `commit` succeeds.
pub trait Executable {
    type Error;

    fn execute(
        &self,
        query: &str,
        params: &QueryParams,
        fetch: FetchMode,
    ) -> Result<Fetched, Self::Error>;

    fn commit(&self) -> Result<(), Self::Error>;
}

/// Object-safe view of a client as held by a [`ClientMap`](crate::ClientMap).
pub trait ManagedClient:
    Connectable<Error = Error> + Closable<Error = Error> + Send + Sync + 'static
{
    /// Logical name the client was declared under.
    fn name(&self) -> &str;

    /// Backend kind, e.g. `"sqlite"`.
    fn kind(&self) -> &'static str;

    /// Resolved connection parameters.
    fn params(&self) -> &ConnectParams;

    /// Upcast for [`ClientMap::typed`](crate::ClientMap::typed).
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
