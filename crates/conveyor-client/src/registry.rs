// ── Client registry & map ──

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::backend::{HostBackend, SqliteBackend};
use crate::capability::{Closable, Connectable, ManagedClient};
use crate::client::{HostClient, SqliteClient};
use crate::error::Error;
use crate::settings::Settings;
use crate::state::ConnectState;

type Constructor =
    Box<dyn Fn(&str, &Settings) -> Result<Arc<dyn ManagedClient>, Error> + Send + Sync>;

/// Ordered `(name, constructor)` declarations, made once at startup.
#[derive(Default)]
pub struct ClientRegistry {
    entries: Vec<(String, Constructor)>,
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a client under `name`. The constructor runs when the map is
    /// built and receives the logical name and the settings.
    pub fn register<C, F>(&mut self, name: impl Into<String>, constructor: F) -> Result<&mut Self, Error>
    where
        C: ManagedClient,
        F: Fn(&str, &Settings) -> Result<C, Error> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.entries.iter().any(|(existing, _)| *existing == name) {
            return Err(Error::DuplicateClient { name });
        }
        let erased: Constructor = Box::new(move |name: &str, settings: &Settings| {
            constructor(name, settings).map(|c| Arc::new(c) as Arc<dyn ManagedClient>)
        });
        self.entries.push((name, erased));
        Ok(self)
    }

    /// Declare a [`SqliteClient`] reading `<NAME>_PATH` and friends.
    pub fn sqlite(&mut self, name: impl Into<String>) -> Result<&mut Self, Error> {
        self.register(name, |name, settings| {
            SqliteClient::from_settings(name, SqliteBackend, settings)
        })
    }

    /// Declare a [`HostClient`] reading `<NAME>_HOST` and `<NAME>_PORT`.
    pub fn host(&mut self, name: impl Into<String>) -> Result<&mut Self, Error> {
        self.register(name, |name, settings| {
            HostClient::from_settings(name, HostBackend, settings)
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every constructor in declaration order. The first parameter
    /// failure aborts the build.
    pub fn build(&self, settings: &Settings) -> Result<ClientMap, Error> {
        let mut clients = IndexMap::with_capacity(self.entries.len());
        for (name, constructor) in &self.entries {
            let client = constructor(name, settings)?;
            debug!(client = %name, kind = client.kind(), "client declared");
            clients.insert(name.clone(), client);
        }
        Ok(ClientMap {
            clients: Arc::new(clients),
        })
    }
}

/// Named clients, fixed at construction. Cloning shares the same clients.
#[derive(Clone, Default)]
pub struct ClientMap {
    clients: Arc<IndexMap<String, Arc<dyn ManagedClient>>>,
}

impl fmt::Debug for ClientMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.clients.iter().map(|(name, c)| (name, c.state())))
            .finish()
    }
}

impl ClientMap {
    pub fn get(&self, name: &str) -> Result<Arc<dyn ManagedClient>, Error> {
        self.clients
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownClient {
                name: name.to_owned(),
            })
    }

    /// Look up a client as its concrete type, e.g. `typed::<SqliteClient>("db")`.
    pub fn typed<C: ManagedClient>(&self, name: &str) -> Result<Arc<C>, Error> {
        self.get(name)?
            .into_any()
            .downcast::<C>()
            .map_err(|_| Error::WrongClientType {
                name: name.to_owned(),
                expected: std::any::type_name::<C>(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ManagedClient>)> {
        self.clients.iter().map(|(name, c)| (name.as_str(), c))
    }

    pub fn states(&self) -> Vec<(String, ConnectState)> {
        self.iter()
            .map(|(name, c)| (name.to_owned(), c.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Connect in declaration order, stopping at the first failure.
    pub fn connect_all(&self) -> Result<(), Error> {
        for client in self.clients.values() {
            client.connect()?;
        }
        if !self.is_empty() {
            info!(clients = self.len(), "all clients connected");
        }
        Ok(())
    }

    /// Close every client, returning the first failure after trying all.
    pub fn close_all(&self) -> Result<(), Error> {
        let mut first_err = None;
        for client in self.clients.values() {
            if let Err(err) = client.close() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
