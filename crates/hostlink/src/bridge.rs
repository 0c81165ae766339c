//! # Bridge Connection
//!
//! [`Bridge`] owns one connection to the host and everything hanging off it:
//! the request registry, the batch buffer, the release queue, and the event
//! handlers.
//!
//! ## Threads
//!
//! A dedicated reader thread blocks on the transport for the lifetime of the
//! connection. It resolves call waiters directly (oneshot senders and condvar
//! slots are thread-safe) and hands events to the tokio runtime with
//! `Handle::spawn`; it never runs handler code itself.
//!
//! Blocking calls park only the calling thread. Making a blocking call from a
//! runtime worker stalls that worker until the reply arrives; doing so from the
//! only thread driving a runtime that must produce the reply deadlocks.
//!
//! ## Invariants
//! - The first frame written is `auth`.
//! - When the reader loop ends for any reason, every outstanding call fails
//!   with `ConnectionLost` exactly once. There is no reconnect.
//! - Queued handle releases go out before every call and every batch frame.

use std::future::Future;
use std::sync::Arc;
use std::thread;

use futures::future::join_all;
use hostwire::Codec;
use hostwire::Fields;
use hostwire::Message;
use hostwire::PlayerDirectory;
use hostwire::Proxy;
use hostwire::ReleaseSink;
use hostwire::TypeRegistry;
use hostwire::Value;
use serde_json::Value as Json;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::batch::BatchMode;
use crate::batch::BatchScope;
use crate::batch::Batcher;
use crate::config::BridgeConfig;
use crate::error::Error;
use crate::error::Result;
use crate::events;
use crate::events::BOOT_EVENT;
use crate::events::Dispatcher;
use crate::events::Event;
use crate::events::EventHandler;
use crate::events::Outcome;
use crate::events::SubscribeOptions;
use crate::proxy::Attribute;
use crate::proxy::Facade;
use crate::proxy::Invoker;
use crate::proxy::Selector;
use crate::registry::CallFuture;
use crate::registry::Registry;
use crate::release::ReleaseQueue;
use crate::transport::TcpTransport;
use crate::transport::Transport;

struct Inner {
    transport: Arc<dyn Transport>,
    codec: Codec,
    registry: Registry,
    batcher: Batcher,
    releases: Arc<ReleaseQueue>,
    dispatcher: Dispatcher,
    runtime: Handle,
    closed: watch::Sender<bool>,
}

/// A live connection to the host. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    // ========================================================================
    //  CONSTRUCTION
    // ========================================================================

    /// Connects over TCP, authenticates and asks for the online players.
    pub fn connect(config: &BridgeConfig) -> Result<Self> {
        let address = config.address();
        let transport = TcpTransport::connect(&address)?;
        info!(%address, "connected to host");
        let bridge = Self::with_transport(transport, &config.token)?;

        let primed = bridge.prime_players();
        bridge.inner.runtime.spawn(async move {
            match primed.await {
                Ok(count) => debug!(count, "primed player directory"),
                Err(e) => warn!("could not prime player directory: {e}"),
            }
        });
        Ok(bridge)
    }

    /// Connects with settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::connect(&BridgeConfig::from_env()?)
    }

    /// Authenticates over an established transport and starts the reader.
    ///
    /// Must be called from within a tokio runtime; events are dispatched on it.
    pub fn with_transport<T: Transport>(transport: T, token: &str) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let transport: Arc<dyn Transport> = Arc::new(transport);

        let releases = Arc::new(ReleaseQueue::new(transport.clone()));
        let sink: Arc<dyn ReleaseSink> = releases.clone();
        let codec = Codec::new(Arc::new(TypeRegistry::default()))
            .with_players(Arc::new(PlayerDirectory::default()))
            .with_release_sink(Arc::downgrade(&sink));

        let bridge = Bridge {
            inner: Arc::new(Inner {
                transport,
                codec,
                registry: Registry::new(),
                batcher: Batcher::default(),
                releases,
                dispatcher: Dispatcher::default(),
                runtime,
                closed: watch::Sender::new(false),
            }),
        };

        bridge.send(&Message::Auth { token: token.to_string() })?;

        let reader = bridge.clone();
        thread::Builder::new()
            .name("hostlink-reader".into())
            .spawn(move || reader.read_loop())
            .map_err(|e| Error::Transport(format!("spawn reader thread: {e}")))?;

        Ok(bridge)
    }

    pub fn codec(&self) -> &Codec {
        &self.inner.codec
    }

    pub fn types(&self) -> &TypeRegistry {
        self.inner.codec.types()
    }

    pub fn players(&self) -> &PlayerDirectory {
        self.inner.codec.players()
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub(crate) fn batcher(&self) -> &Batcher {
        &self.inner.batcher
    }

    // ========================================================================
    //  SENDING
    // ========================================================================

    /// Writes one message. Fails with `ConnectionLost` once the reader has stopped.
    pub fn send(&self, message: &Message) -> Result<()> {
        if self.inner.registry.is_closed() {
            return Err(self.inner.registry.lost());
        }
        let payload = message.to_bytes()?;
        self.inner.transport.send(&payload)?;
        debug!(kind = message.kind(), bytes = payload.len(), "sent frame");
        Ok(())
    }

    /// Registers and sends (or buffers) an async call.
    fn submit(&self, mut message: hostwire::CallMessage, selector: &Selector, args: Vec<Value>) -> CallFuture {
        let registry = &self.inner.registry;
        let id = registry.next_id();
        message.id = id;

        let (future, args) = if self.inner.batcher.is_active() {
            let (future, batch_reply) = registry.register_batched(id);
            match self.inner.batcher.try_buffer(message, selector, args, batch_reply) {
                Ok(()) => {
                    debug!(id, "buffered call");
                    return future;
                }
                Err((unbuffered, args)) => {
                    message = unbuffered;
                    (future, args)
                }
            }
        } else {
            (registry.register_async(id), args)
        };

        self.inner.releases.flush();
        if let Err(e) = self.send(&Message::Call(message)) {
            registry.fail(id, e);
        }
        // handles the arguments own must outlive the frame that names them
        drop(args);
        future
    }

    // ========================================================================
    //  CALLS
    // ========================================================================

    /// Calls `method` on whatever `selector` addresses.
    pub fn invoke(&self, selector: &Selector, method: &str, args: Vec<Value>, named: Fields) -> CallFuture {
        let message = selector.call_message(method, &args, &named);
        self.submit(message, selector, args)
    }

    /// Like [`Bridge::invoke`], parking the current thread for the reply.
    ///
    /// Never buffered by a batch scope.
    pub fn invoke_blocking(&self, selector: &Selector, method: &str, args: Vec<Value>, named: Fields) -> Result<Value> {
        let registry = &self.inner.registry;
        let mut message = selector.call_message(method, &args, &named);
        let id = registry.next_id();
        message.id = id;

        let slot = registry.register_blocking(id);
        self.inner.releases.flush();
        if let Err(e) = self.send(&Message::Call(message)) {
            registry.fail(id, e);
        }
        let result = slot.wait();
        drop(args);
        result
    }

    pub fn call(&self, proxy: &Proxy, method: &str, args: Vec<Value>) -> CallFuture {
        self.invoke(&Selector::of(proxy), method, args, Fields::new())
    }

    pub fn call_with(&self, proxy: &Proxy, method: &str, args: Vec<Value>, named: Fields) -> CallFuture {
        self.invoke(&Selector::of(proxy), method, args, named)
    }

    pub fn call_blocking(&self, proxy: &Proxy, method: &str, args: Vec<Value>) -> Result<Value> {
        self.invoke_blocking(&Selector::of(proxy), method, args, Fields::new())
    }

    /// Reads `name` from the field cache, or binds the remote method of that name.
    pub fn attr<'a>(&self, proxy: &'a Proxy, name: &str) -> Attribute<'a> {
        match proxy.field(name) {
            Some(value) => Attribute::Cached(value),
            None => Attribute::Method(self.method(proxy, name)),
        }
    }

    pub fn method(&self, proxy: &Proxy, name: &str) -> Invoker {
        Invoker::new(self.clone(), Selector::of(proxy), name)
    }

    /// Writes an attribute on the host object. The local cache is not touched.
    pub fn set_attr(&self, proxy: &Proxy, field: &str, value: impl Into<Value>) -> CallFuture {
        let selector = Selector::of(proxy);
        let value = value.into();
        let message = selector.assign_message(field, &value);
        self.submit(message, &selector, vec![value])
    }

    /// The cached field if present, else the result of calling `method`.
    pub async fn field_or_call(&self, proxy: &Proxy, field: &str, method: &str) -> Result<Value> {
        match proxy.field(field) {
            Some(value) => Ok(value.clone()),
            None => self.call(proxy, method, Vec::new()).await,
        }
    }

    /// Blocking variant of [`Bridge::field_or_call`] for synchronous accessors.
    pub fn field_or_call_blocking(&self, proxy: &Proxy, field: &str, method: &str) -> Result<Value> {
        match proxy.field(field) {
            Some(value) => Ok(value.clone()),
            None => self.call_blocking(proxy, method, Vec::new()),
        }
    }

    /// Resolves a player's UUID, parking the thread only as a last resort.
    ///
    /// Tries the field cache, then a UUID-keyed reference, then the player
    /// directory, then a blocking `getUniqueId`. A resolved UUID is written back
    /// to the proxy's field cache and, when the player's name is known, to the
    /// directory.
    pub fn player_uuid_blocking(&self, player: &mut Proxy) -> Result<Option<String>> {
        let name = match player.reference() {
            Some(reference) if reference.kind == "player_name" => Some(reference.id.clone()),
            _ => player.field("name").and_then(Value::as_str).map(str::to_string),
        };

        let resolved = match uuid_text(player.field("uuid")) {
            Some(uuid) => Some(uuid),
            None => match player.reference() {
                Some(reference) if reference.kind == "player" => Some(reference.id.clone()),
                _ => None,
            },
        };
        let resolved = match resolved.or_else(|| name.as_deref().and_then(|name| self.players().uuid_of(name))) {
            Some(uuid) => Some(uuid),
            None => uuid_text(Some(&self.call_blocking(player, "getUniqueId", Vec::new())?)),
        };

        if let Some(uuid) = &resolved {
            player.fields_mut().insert("uuid".into(), Value::Str(uuid.clone()));
            if let Some(name) = name {
                self.players().remember(name, uuid.clone());
            }
        }
        Ok(resolved)
    }

    /// Fills the player directory from the host's online player list.
    ///
    /// The request goes out immediately; the directory fills as the reply is
    /// decoded, whether or not the future is awaited. Resolves to how many
    /// players were listed.
    pub fn prime_players(&self) -> impl Future<Output = Result<usize>> + Send + use<> {
        let listed = self.server().call("getOnlinePlayers", Vec::new());
        async move {
            let players = listed.await?;
            Ok(players.as_list().map_or(0, <[Value]>::len))
        }
    }

    // ========================================================================
    //  HOST SERVICES
    // ========================================================================

    pub fn facade(&self, name: &str) -> Facade {
        Facade::new(self.clone(), name)
    }

    pub fn server(&self) -> Facade {
        self.facade("server")
    }

    /// A player reference by name, with its UUID filled in when already known.
    pub fn player(&self, name: &str) -> Proxy {
        let proxy = Proxy::player(name);
        match self.players().uuid_of(name) {
            Some(uuid) if proxy.field("uuid").is_none() => proxy.with_field("uuid", uuid),
            _ => proxy,
        }
    }

    /// Resolves after the host has run `ticks` server ticks.
    pub fn wait(&self, ticks: u64) -> CallFuture {
        let registry = &self.inner.registry;
        let id = registry.next_id();
        let future = registry.register_async(id);
        if let Err(e) = self.send(&Message::Wait { id, ticks }) {
            registry.fail(id, e);
        }
        future
    }

    /// Tells the host every handler is registered.
    pub fn ready(&self) -> Result<()> {
        self.send(&Message::Ready)
    }

    // ========================================================================
    //  BATCHING
    // ========================================================================

    /// Opens a scope whose calls travel in one frame and fail independently.
    pub fn frame(&self) -> BatchScope {
        BatchScope::open(self.clone(), BatchMode::Frame)
    }

    /// Opens a scope whose calls stop at the first failure on the host.
    pub fn atomic(&self) -> BatchScope {
        BatchScope::open(self.clone(), BatchMode::Atomic)
    }

    /// Mode of the open batch scopes, if any.
    pub fn batch_mode(&self) -> Option<BatchMode> {
        self.inner.batcher.mode()
    }

    /// Sends buffered calls now without leaving any scope.
    pub async fn flush(&self) -> Result<()> {
        self.flush_batch(false).await
    }

    /// Sends the batch buffer as one frame and waits for every reply.
    ///
    /// The first failure, in call order, is returned.
    pub(crate) async fn flush_batch(&self, closing_scope: bool) -> Result<()> {
        let drained = self.inner.batcher.drain(closing_scope);
        if drained.messages.is_empty() {
            return Ok(());
        }

        let ids: Vec<u64> = drained.messages.iter().map(|m| m.id).collect();
        debug!(calls = ids.len(), atomic = drained.atomic, "flushing batch");

        self.inner.releases.flush();
        let sent = self.send(&Message::CallBatch {
            atomic: drained.atomic,
            messages: drained.messages,
        });
        if let Err(e) = sent {
            for id in &ids {
                self.inner.registry.fail(*id, e.clone());
            }
        }
        drop(drained.retained);

        let mut first_error = None;
        for reply in join_all(drained.replies).await {
            let result = reply.unwrap_or_else(|_| Err(self.inner.registry.lost()));
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ========================================================================
    //  EVENTS
    // ========================================================================

    /// Adds a handler for `event` without subscribing on the host.
    pub fn on(&self, event: &str, handler: impl EventHandler) {
        self.inner.dispatcher.on(event, Arc::new(handler));
    }

    /// Asks the host to start delivering `event`.
    pub fn subscribe(&self, event: &str, options: SubscribeOptions) -> Result<()> {
        info!(event, ?options, "subscribing");
        self.send(&options.message(event))
    }

    /// Adds a handler and subscribes in one step.
    pub fn listen(&self, event: &str, options: SubscribeOptions, handler: impl EventHandler) -> Result<()> {
        self.on(event, handler);
        self.subscribe(event, options)
    }

    /// Registers a server command. Invocations arrive as `command_<name>` events.
    pub fn command(&self, name: &str, permission: Option<&str>, handler: impl EventHandler) -> Result<()> {
        let name = name.to_lowercase();
        self.on(&format!("command_{name}"), handler);
        info!(command = %name, "registering command");
        self.send(&Message::RegisterCommand {
            name,
            permission: permission.map(str::to_string),
        })
    }

    /// Runs `task` every `interval` ticks once the server has booted.
    ///
    /// Errors from `task` are logged and the loop continues; it ends when the
    /// connection closes.
    pub fn repeat<F, Fut>(&self, interval: u64, delay: u64, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task = Arc::new(task);
        self.on(BOOT_EVENT, move |event: Event| {
            let task = task.clone();
            async move {
                tokio::spawn(run_repeating(event.bridge().clone(), task, interval.max(1), delay));
                Ok::<_, anyhow::Error>(Outcome::None)
            }
        });
    }

    // ========================================================================
    //  CONNECTION STATE
    // ========================================================================

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the connection has shut down.
    pub async fn closed(&self) {
        let mut state = self.inner.closed.subscribe();
        let _ = state.wait_for(|closed| *closed).await;
    }

    /// Closes the connection and fails every outstanding call.
    pub fn close(&self) {
        self.inner.transport.close();
        self.mark_closed("closed by client");
    }

    pub fn flush_releases(&self) {
        self.inner.releases.flush();
    }

    pub fn pending_releases(&self) -> usize {
        self.inner.releases.pending()
    }

    /// Calls sent or buffered that have no reply yet.
    pub fn outstanding_calls(&self) -> usize {
        self.inner.registry.outstanding()
    }

    pub fn buffered_calls(&self) -> usize {
        self.inner.batcher.buffered()
    }

    fn mark_closed(&self, reason: &str) {
        self.inner.registry.close(reason);
        self.inner.closed.send_replace(true);
    }

    // ========================================================================
    //  READER
    // ========================================================================

    fn read_loop(self) {
        let reason = loop {
            match self.inner.transport.recv() {
                Ok(Some(payload)) => {
                    if let Err(e) = self.handle_frame(&payload) {
                        error!("reader stopped: {e}");
                        break e.to_string();
                    }
                }
                Ok(None) => {
                    info!("host closed the connection");
                    break "connection closed by host".to_string();
                }
                Err(e) => {
                    error!("reader stopped: {e}");
                    break e.to_string();
                }
            }
        };
        self.inner.transport.close();
        self.mark_closed(&reason);
    }

    fn handle_frame(&self, payload: &[u8]) -> Result<()> {
        let message = Message::from_bytes(payload)?;
        debug!(kind = message.kind(), "received frame");

        match message {
            Message::Return { id, result } => {
                let value = self.inner.codec.decode(&result)?;
                self.inner.registry.complete(id, Ok(value));
            }
            Message::Error { id: Some(id), message, code } => {
                self.inner.registry.complete(id, Err(Error::from_remote(message, code)));
            }
            Message::Error { id: None, message, code } => {
                warn!(?code, "host error without a call id: {}", message.unwrap_or_default());
            }
            Message::Event { event, payload } => self.post_event(&event, &payload)?,
            Message::EventBatch { event, payloads } => {
                for payload in &payloads {
                    self.post_event(&event, payload)?;
                }
            }
            Message::Shutdown => {
                info!("host is shutting down");
                self.inner.runtime.spawn(events::shutdown(self.clone()));
            }
            other => warn!(kind = other.kind(), "ignoring unexpected frame"),
        }
        Ok(())
    }

    fn post_event(&self, name: &str, payload: &Json) -> Result<()> {
        let payload = self.inner.codec.decode(payload)?;
        let event = Event::from_payload(name, payload, self.clone());
        self.inner.runtime.spawn(events::dispatch(event));
        Ok(())
    }
}

async fn run_repeating<F, Fut>(bridge: Bridge, task: Arc<F>, interval: u64, delay: u64)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    if delay > 0 && bridge.wait(delay).await.is_err() {
        return;
    }
    while !bridge.is_closed() {
        if let Err(e) = task().await {
            warn!("repeating task failed: {e:#}");
        }
        if bridge.wait(interval).await.is_err() {
            break;
        }
    }
}

fn uuid_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Str(text) if !text.is_empty() => Some(text.clone()),
        Value::Uuid(uuid) => Some(uuid.to_string()),
        _ => None,
    }
}
