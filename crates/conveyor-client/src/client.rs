// ── Client ──
//
// A named connection wrapper generic over its backend. The connection
// handle and `ConnectState` live together behind one mutex so they never
// disagree; backend I/O during connect happens outside the lock.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, trace, warn};

use crate::backend::{Backend, HostBackend, SqlBackend, SqliteBackend};
use crate::capability::{Closable, Connectable, Executable, ManagedClient};
use crate::error::{BoxError, Error};
use crate::fetch::{FetchMode, Fetched, QueryParams};
use crate::param::{ConnectParams, ParamMap};
use crate::settings::Settings;
use crate::state::ConnectState;

pub type SqliteClient = Client<SqliteBackend>;
pub type HostClient = Client<HostBackend>;

struct Slot<C> {
    state: ConnectState,
    conn: Option<C>,
}

pub struct Client<B: Backend> {
    name: String,
    backend: B,
    params: ConnectParams,
    slot: Mutex<Slot<B::Connection>>,
}

impl<B: Backend> fmt::Debug for Client<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("kind", &B::KIND)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Client<B> {
    /// Build a client whose parameters come from the backend's own map,
    /// with settings keys prefixed by the upper-cased `name`.
    ///
    /// Fails on a missing or invalid parameter. Nothing is connected.
    pub fn from_settings(
        name: impl Into<String>,
        backend: B,
        settings: &Settings,
    ) -> Result<Self, Error> {
        let name = name.into();
        let map = backend.param_map(&name.to_ascii_uppercase());
        Self::with_params(name, backend, &map, settings)
    }

    /// Build a client from an explicit parameter map.
    pub fn with_params(
        name: impl Into<String>,
        backend: B,
        map: &ParamMap,
        settings: &Settings,
    ) -> Result<Self, Error> {
        let name = name.into();
        let params = map.resolve(settings).inspect_err(|err| {
            warn!(client = %name, kind = B::KIND, error = %err, "client parameters rejected");
        })?;
        Ok(Self {
            name,
            backend,
            params,
            slot: Mutex::new(Slot {
                state: ConnectState::Closed,
                conn: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        B::KIND
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn params(&self) -> &ConnectParams {
        &self.params
    }

    pub fn state(&self) -> ConnectState {
        self.lock().state
    }

    /// Run `f` against the live connection, connecting first if the client
    /// is not open.
    pub fn with_connection<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut B::Connection) -> Result<T, BoxError>,
    {
        if !self.state().is_open() {
            self.connect()?;
        }
        let mut slot = self.lock();
        let conn = slot.conn.as_mut().ok_or_else(|| Error::Execute {
            client: self.name.clone(),
            source: "connection closed while in use".into(),
        })?;
        f(conn).map_err(|source| Error::Execute {
            client: self.name.clone(),
            source,
        })
    }

    /// Scoped use: connects a closed client now and closes it again when
    /// the returned guard drops. An already open client is left open.
    pub fn session(&self) -> Result<Session<'_, B>, Error> {
        let opened = if self.state().is_open() {
            false
        } else {
            self.connect()?;
            true
        };
        Ok(Session {
            client: self,
            opened,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slot<B::Connection>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_logged(&self, conn: B::Connection, what: &str) {
        if let Err(err) = self.backend.release(conn) {
            warn!(client = %self.name, kind = B::KIND, error = %err, "failed releasing {what} connection");
        }
    }
}

impl<B: Backend> Connectable for Client<B> {
    type Error = Error;

    fn connect(&self) -> Result<(), Error> {
        let previous = {
            let mut slot = self.lock();
            slot.state = ConnectState::Pending;
            slot.conn.take()
        };
        if let Some(conn) = previous {
            debug!(client = %self.name, "reconnecting, releasing previous connection");
            self.release_logged(conn, "previous");
        }

        match self.backend.open(&self.params) {
            Ok(conn) => {
                let stale = {
                    let mut slot = self.lock();
                    slot.state = ConnectState::Open;
                    slot.conn.replace(conn)
                };
                if let Some(conn) = stale {
                    self.release_logged(conn, "stale");
                }
                info!(client = %self.name, kind = B::KIND, "client connected");
                Ok(())
            }
            Err(source) => {
                {
                    let mut slot = self.lock();
                    if slot.conn.is_none() {
                        slot.state = ConnectState::Closed;
                    }
                }
                error!(client = %self.name, kind = B::KIND, error = %source, "failed connecting to host");
                Err(Error::Connect {
                    client: self.name.clone(),
                    kind: B::KIND,
                    source,
                })
            }
        }
    }

    fn state(&self) -> ConnectState {
        Client::state(self)
    }
}

impl<B: Backend> Closable for Client<B> {
    type Error = Error;

    fn close(&self) -> Result<(), Error> {
        let conn = {
            let mut slot = self.lock();
            slot.state = ConnectState::Closed;
            slot.conn.take()
        };
        let Some(conn) = conn else {
            return Ok(());
        };
        self.backend.release(conn).map_err(|source| {
            error!(client = %self.name, kind = B::KIND, error = %source, "failed disconnecting");
            Error::Close {
                client: self.name.clone(),
                kind: B::KIND,
                source,
            }
        })?;
        debug!(client = %self.name, kind = B::KIND, "client closed");
        Ok(())
    }
}

impl<B: SqlBackend> Executable for Client<B> {
    type Error = Error;

    fn execute(
        &self,
        query: &str,
        params: &QueryParams,
        fetch: FetchMode,
    ) -> Result<Fetched, Error> {
        let mut slot = self.lock();
        let Slot { state, conn } = &mut *slot;
        let Some(conn) = conn.as_mut().filter(|_| state.is_open()) else {
            trace!(client = %self.name, "execute on closed client skipped");
            return Ok(Fetched::Nothing);
        };
        self.backend
            .run(conn, query, params, fetch)
            .map_err(|source| Error::Execute {
                client: self.name.clone(),
                source,
            })
    }

    fn commit(&self) -> Result<(), Error> {
        let mut slot = self.lock();
        let Slot { state, conn } = &mut *slot;
        let Some(conn) = conn.as_mut().filter(|_| state.is_open()) else {
            return Ok(());
        };
        self.backend.commit(conn).map_err(|source| Error::Execute {
            client: self.name.clone(),
            source,
        })
    }
}

impl<B: Backend> ManagedClient for Client<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        B::KIND
    }

    fn params(&self) -> &ConnectParams {
        &self.params
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ── Session guard ──

/// Returned by [`Client::session`].
pub struct Session<'a, B: Backend> {
    client: &'a Client<B>,
    opened: bool,
}

impl<B: Backend> Deref for Session<'_, B> {
    type Target = Client<B>;

    fn deref(&self) -> &Client<B> {
        self.client
    }
}

impl<B: Backend> Drop for Session<'_, B> {
    fn drop(&mut self) {
        if self.opened {
            // close() already logged the failure
            let _ = self.client.close();
        }
    }
}
