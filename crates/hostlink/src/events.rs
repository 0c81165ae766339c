//! # Event Dispatcher
//!
//! Routes host-pushed events to the handlers registered for their name.
//!
//! ## Dispatch
//!
//! All handlers for an event run concurrently on the runtime. Each one is
//! isolated: an error or a panic is logged and its sibling handlers still run
//! to completion. Once every handler is done, an event that carried an id is
//! answered with its overrides (if any) and a single `event_done`.
//!
//! ## Invariants
//! - No handlers registered means no answer at all: no overrides, no `event_done`.
//! - The last textual outcome overrides chat; the last numeric outcome
//!   overrides damage, and only on events whose fields carry `damage`.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use hostwire::Message;
use hostwire::Priority;
use hostwire::Proxy;
use hostwire::ResultKind;
use hostwire::Value;
use serde_json::Value as Json;
use tracing::debug;
use tracing::warn;

use crate::bridge::Bridge;
use crate::error::Result;

/// Synthetic event dispatched when the host announces shutdown.
pub const SHUTDOWN_EVENT: &str = "shutdown";

/// Event the host sends once the client reported ready.
pub const BOOT_EVENT: &str = "server_boot";

// ============================================================================
//  HANDLERS
// ============================================================================

/// What a handler hands back to the host.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Outcome {
    /// No opinion.
    #[default]
    None,
    /// Replacement chat text.
    Text(String),
    /// Replacement damage amount.
    Number(f64),
}

impl From<()> for Outcome {
    fn from(_: ()) -> Self {
        Outcome::None
    }
}

impl From<String> for Outcome {
    fn from(text: String) -> Self {
        Outcome::Text(text)
    }
}

impl From<&str> for Outcome {
    fn from(text: &str) -> Self {
        Outcome::Text(text.to_string())
    }
}

impl From<f64> for Outcome {
    fn from(amount: f64) -> Self {
        Outcome::Number(amount)
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Event) -> anyhow::Result<Outcome>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> anyhow::Result<Outcome> {
        (self)(event).await
    }
}

/// How the host should deliver a subscribed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscribeOptions {
    /// Coalesce to at most one dispatch per server tick.
    pub once_per_tick: bool,
    pub priority: Priority,
    /// Minimum milliseconds between dispatches. Zero disables throttling.
    pub throttle_ms: u64,
}

impl SubscribeOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn once_per_tick(mut self) -> Self {
        self.once_per_tick = true;
        self
    }

    pub fn throttle_ms(mut self, throttle_ms: u64) -> Self {
        self.throttle_ms = throttle_ms;
        self
    }

    pub(crate) fn message(&self, event: &str) -> Message {
        Message::Subscribe {
            event: event.to_string(),
            once_per_tick: self.once_per_tick,
            priority: self.priority,
            throttle_ms: self.throttle_ms,
        }
    }
}

// ============================================================================
//  EVENTS
// ============================================================================

/// One delivery of a host event.
#[derive(Clone)]
pub struct Event {
    name: String,
    id: Option<i64>,
    payload: Value,
    bridge: Bridge,
}

impl Event {
    pub(crate) fn new(name: impl Into<String>, id: Option<i64>, payload: Value, bridge: Bridge) -> Self {
        Self { name: name.into(), id, payload, bridge }
    }

    /// Builds an event from a decoded payload.
    ///
    /// A mapping with an `event` proxy is unwrapped: `id` becomes the event id
    /// and the remaining keys are merged into the proxy's field cache.
    pub(crate) fn from_payload(name: &str, payload: Value, bridge: Bridge) -> Self {
        let Value::Map(mut map) = payload else {
            return Self::new(name, None, payload, bridge);
        };
        let mut proxy = match map.remove("event") {
            Some(Value::Proxy(proxy)) => proxy,
            other => {
                // not an event proxy: hand the payload over untouched
                if let Some(value) = other {
                    map.insert("event".into(), value);
                }
                return Self::new(name, None, Value::Map(map), bridge);
            }
        };

        let id = map.get("id").and_then(Value::as_i64);
        proxy.fields_mut().append(&mut map);
        Self::new(name, id, Value::Proxy(proxy), bridge)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Present only for cancellable events.
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.payload.as_proxy()
    }

    /// Looks up a field on the event proxy, or a key of a plain payload mapping.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match &self.payload {
            Value::Proxy(proxy) => proxy.field(name),
            Value::Map(map) => map.get(name),
            _ => None,
        }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Cancels the event.
    ///
    /// With an event id this is a one-way `event_cancel` frame. Without one the
    /// event proxy is asked to `setCancelled(true)` like any other call.
    pub async fn cancel(&self) -> Result<()> {
        if let Some(id) = self.id {
            return self.bridge.send(&Message::EventCancel { id });
        }
        match self.proxy() {
            Some(proxy) => self
                .bridge
                .call(proxy, "setCancelled", vec![Value::Bool(true)])
                .await
                .map(|_| ()),
            None => Ok(()),
        }
    }
}

// ============================================================================
//  DISPATCHER
// ============================================================================

#[derive(Default)]
pub(crate) struct Dispatcher {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl Dispatcher {
    pub(crate) fn on(&self, event: &str, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(event.to_string()).or_default().push(handler);
    }

    pub(crate) fn handlers(&self, event: &str) -> Vec<Arc<dyn EventHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(event).cloned().unwrap_or_default()
    }
}

/// Runs every handler for `event`, then answers the host if the event has an id.
pub(crate) async fn dispatch(event: Event) {
    let handlers = event.bridge.dispatcher().handlers(&event.name);
    debug!(event = %event.name, id = ?event.id, handlers = handlers.len(), "dispatching event");

    let runs = handlers.iter().map(|handler| {
        let event = event.clone();
        AssertUnwindSafe(handler.handle(event)).catch_unwind()
    });

    let mut outcomes = Vec::with_capacity(handlers.len());
    for (index, result) in join_all(runs).await.into_iter().enumerate() {
        match result {
            Ok(Ok(outcome)) => outcomes.push(outcome),
            Ok(Err(e)) => warn!(event = %event.name, handler = index, "handler failed: {e:#}"),
            Err(_) => warn!(event = %event.name, handler = index, "handler panicked"),
        }
    }

    let Some(id) = event.id else {
        return;
    };
    if handlers.is_empty() {
        return;
    }

    for message in answer(id, event.field("damage").is_some(), &outcomes) {
        if let Err(e) = event.bridge.send(&message) {
            warn!(event = %event.name, id, "could not answer event: {e}");
            return;
        }
    }
}

/// The override frames and the final `event_done` for a finished dispatch.
pub(crate) fn answer(id: i64, damage_event: bool, outcomes: &[Outcome]) -> Vec<Message> {
    let mut text = None;
    let mut damage = None;
    for outcome in outcomes {
        match outcome {
            Outcome::Text(t) => text = Some(t.clone()),
            Outcome::Number(n) if damage_event => damage = Some(*n),
            _ => {}
        }
    }

    let mut messages = Vec::new();
    if let Some(text) = text {
        messages.push(Message::EventResult { id, result: Json::String(text), result_type: ResultKind::Chat });
    }
    if let Some(amount) = damage.and_then(serde_json::Number::from_f64) {
        messages.push(Message::EventResult { id, result: Json::Number(amount), result_type: ResultKind::Damage });
    }
    messages.push(Message::EventDone { id });
    messages
}

/// Runs the shutdown handlers, then acknowledges the shutdown.
pub(crate) async fn shutdown(bridge: Bridge) {
    dispatch(Event::new(SHUTDOWN_EVENT, None, Value::Null, bridge.clone())).await;
    if let Err(e) = bridge.send(&Message::ShutdownAck) {
        warn!("could not acknowledge shutdown: {e}");
    }
}
