// ── Event routing ──
//
// Static table from event name to handler, built once before the
// controller starts. Channels are reduced to their event name with
// `event_name` both at registration and at lookup.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use conveyor_client::{BoxError, ClientMap, ManagedClient};
use futures_util::future::BoxFuture;

use crate::error::CoreError;
use crate::message::{Message, event_name};

/// What a handler returns; any error type converts with `?`.
pub type HandlerResult = Result<(), BoxError>;

/// Handler run on the dispatch thread.
pub type Handler = Arc<dyn Fn(&HandlerContext, &Message) -> HandlerResult + Send + Sync>;

/// Handler run as a tokio task.
pub type AsyncHandler =
    Arc<dyn Fn(HandlerContext, Message) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

pub type SyncEventMap = EventMap<Handler>;
pub type AsyncEventMap = EventMap<AsyncHandler>;

// ── HandlerContext ───────────────────────────────────────────────

/// What a handler can reach: the controller's clients.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    clients: ClientMap,
}

impl HandlerContext {
    pub fn new(clients: ClientMap) -> Self {
        Self { clients }
    }

    pub fn clients(&self) -> &ClientMap {
        &self.clients
    }

    pub fn client(&self, name: &str) -> Result<Arc<dyn ManagedClient>, CoreError> {
        Ok(self.clients.get(name)?)
    }

    /// Concrete client, e.g. `ctx.typed::<SqliteClient>("db")`.
    pub fn typed<C: ManagedClient>(&self, name: &str) -> Result<Arc<C>, CoreError> {
        Ok(self.clients.typed(name)?)
    }

    /// Run blocking client I/O on tokio's blocking pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, BoxError>
    where
        T: Send + 'static,
        F: FnOnce(&ClientMap) -> Result<T, BoxError> + Send + 'static,
    {
        let clients = self.clients.clone();
        tokio::task::spawn_blocking(move || f(&clients)).await?
    }
}

// ── EventMap ─────────────────────────────────────────────────────

/// Event name → handler. Immutable once built.
#[derive(Clone)]
pub struct EventMap<H> {
    handlers: BTreeMap<String, H>,
}

impl<H> Default for EventMap<H> {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }
}

impl<H> std::fmt::Debug for EventMap<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl<H> EventMap<H> {
    pub fn builder() -> EventMapBuilder<H> {
        EventMapBuilder {
            handlers: BTreeMap::new(),
        }
    }

    /// Handler for the event the channel names.
    pub fn resolve(&self, channel: &str) -> Result<&H, CoreError> {
        let event = event_name(channel);
        self.handlers.get(event).ok_or_else(|| CoreError::Routing {
            channel: channel.to_owned(),
            event: event.to_owned(),
        })
    }

    pub fn contains(&self, event: &str) -> bool {
        self.handlers.contains_key(event_name(event))
    }

    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Collects registrations for an [`EventMap`]. Registering an event twice
/// keeps the later handler.
pub struct EventMapBuilder<H> {
    handlers: BTreeMap<String, H>,
}

impl<H> EventMapBuilder<H> {
    pub fn build(self) -> EventMap<H> {
        EventMap {
            handlers: self.handlers,
        }
    }

    fn insert(mut self, event: &str, handler: H) -> Self {
        self.handlers.insert(event_name(event).to_owned(), handler);
        self
    }
}

impl EventMapBuilder<Handler> {
    pub fn on<F>(self, event: &str, handler: F) -> Self
    where
        F: Fn(&HandlerContext, &Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(event, Arc::new(handler))
    }
}

impl EventMapBuilder<AsyncHandler> {
    pub fn on<F, Fut>(self, event: &str, handler: F) -> Self
    where
        F: Fn(HandlerContext, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let erased: AsyncHandler = Arc::new(
            move |ctx: HandlerContext, message: Message| -> BoxFuture<'static, HandlerResult> {
                Box::pin(handler(ctx, message))
            },
        );
        self.insert(event, erased)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn resolves_by_event_name() {
        let events = SyncEventMap::builder()
            .on("exec", |_, _| Ok(()))
            .on("/jobs/log", |_, _| Ok(()))
            .build();

        assert!(events.resolve("/db/exec").is_ok());
        assert!(events.resolve("log").is_ok());
        assert_eq!(events.events().collect::<Vec<_>>(), ["exec", "log"]);
    }

    #[test]
    fn unknown_event_is_a_routing_error() {
        let events = SyncEventMap::builder().on("exec", |_, _| Ok(())).build();
        let err = events.resolve("/x/unknown").err().expect("routing error");
        assert!(matches!(
            err,
            CoreError::Routing { ref channel, ref event }
                if channel == "/x/unknown" && event == "unknown"
        ));
    }

    #[tokio::test]
    async fn async_handlers_are_boxed() {
        let events = AsyncEventMap::builder()
            .on("echo", |_, message: Message| async move {
                if message.field("fail").is_some() {
                    Err(BoxError::from("asked to fail"))
                } else {
                    Ok(())
                }
            })
            .build();

        let ctx = HandlerContext::new(ClientMap::default());
        let handler = events.resolve("echo").expect("registered");
        assert!(handler(ctx.clone(), Message::new("echo", json!({}))).await.is_ok());
        assert!(handler(ctx, Message::new("echo", json!({ "fail": true }))).await.is_err());
    }
}
