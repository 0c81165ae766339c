//! # Proxy Operations
//!
//! How calls on a [`Proxy`] are addressed on the wire, and the late-bound
//! accessors built on top of them.
//!
//! Attribute access never guesses: a name present in the field cache is
//! returned as-is with no network traffic, anything else becomes an
//! [`Invoker`] for the remote method of that name.

use std::sync::Arc;

use hostwire::CallMessage;
use hostwire::Fields;
use hostwire::HandleLease;
use hostwire::Identity;
use hostwire::Proxy;
use hostwire::Reference;
use hostwire::Value;
use hostwire::codec::encode;
use hostwire::codec::encode_fields;
use serde_json::Value as Json;

use crate::bridge::Bridge;
use crate::error::Result;
use crate::registry::CallFuture;

/// Target selector name for reference-bound calls.
const REF_TARGET: &str = "ref";

/// Where a call is sent.
#[derive(Debug, Clone)]
pub enum Selector {
    /// A live host object. Holding the lease keeps the handle unreleased.
    Handle(Arc<HandleLease>),
    /// A stable reference the host resolves per call.
    Reference(Reference),
    /// A named host service such as `server` or `chat`.
    Facade(String),
    /// No target; the host applies its default receiver.
    Unbound,
}

impl Selector {
    pub fn of(proxy: &Proxy) -> Self {
        match proxy.identity() {
            Identity::Handle(lease) => Selector::Handle(lease.clone()),
            Identity::Reference(reference) => Selector::Reference(reference.clone()),
            Identity::Value => Selector::Unbound,
        }
    }

    /// Builds the `call` message for `method`. The id is filled in on submit.
    pub(crate) fn call_message(&self, method: &str, args: &[Value], named: &Fields) -> CallMessage {
        let args_list: Vec<Json> = args.iter().map(encode).collect();
        match self {
            Selector::Handle(lease) => CallMessage::new(0, method, args_list)
                .with_handle(lease.id())
                .with_named(encode_fields(named)),
            Selector::Reference(reference) => {
                let mut wrapped = vec![
                    Json::String(reference.kind.clone()),
                    Json::String(reference.id.clone()),
                    Json::String(method.to_string()),
                    Json::Array(args_list),
                ];
                if !named.is_empty() {
                    wrapped.push(Json::Object(encode_fields(named)));
                }
                CallMessage::new(0, "call", wrapped).with_target(REF_TARGET)
            }
            Selector::Facade(name) => CallMessage::new(0, method, args_list)
                .with_target(name.as_str())
                .with_named(encode_fields(named)),
            Selector::Unbound => CallMessage::new(0, method, args_list).with_named(encode_fields(named)),
        }
    }

    /// Builds the attribute write for `field`.
    pub(crate) fn assign_message(&self, field: &str, value: &Value) -> CallMessage {
        match self {
            Selector::Handle(lease) => CallMessage::new(0, "set_attr", Vec::new())
                .with_handle(lease.id())
                .with_assignment(field, encode(value)),
            Selector::Reference(reference) => CallMessage::new(
                0,
                "setAttr",
                vec![
                    Json::String(reference.kind.clone()),
                    Json::String(reference.id.clone()),
                    Json::String(field.to_string()),
                    encode(value),
                ],
            )
            .with_target(REF_TARGET),
            Selector::Facade(name) => CallMessage::new(0, "set_attr", Vec::new())
                .with_target(name.as_str())
                .with_assignment(field, encode(value)),
            Selector::Unbound => CallMessage::new(0, "set_attr", Vec::new()).with_assignment(field, encode(value)),
        }
    }
}

/// Result of reading an attribute off a proxy.
pub enum Attribute<'a> {
    /// Served from the local field cache.
    Cached(&'a Value),
    /// Not cached; call it to reach the host.
    Method(Invoker),
}

impl<'a> Attribute<'a> {
    pub fn cached(&self) -> Option<&'a Value> {
        match self {
            Attribute::Cached(value) => Some(value),
            Attribute::Method(_) => None,
        }
    }

    pub fn into_method(self) -> Option<Invoker> {
        match self {
            Attribute::Cached(_) => None,
            Attribute::Method(invoker) => Some(invoker),
        }
    }
}

/// A remote method bound to its receiver.
#[derive(Clone)]
pub struct Invoker {
    bridge: Bridge,
    selector: Selector,
    method: String,
}

impl Invoker {
    pub(crate) fn new(bridge: Bridge, selector: Selector, method: impl Into<String>) -> Self {
        Self { bridge, selector, method: method.into() }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn call(&self, args: Vec<Value>) -> CallFuture {
        self.bridge.invoke(&self.selector, &self.method, args, Fields::new())
    }

    pub fn call_with(&self, args: Vec<Value>, named: Fields) -> CallFuture {
        self.bridge.invoke(&self.selector, &self.method, args, named)
    }

    /// Parks the current thread until the host replies.
    pub fn call_blocking(&self, args: Vec<Value>) -> Result<Value> {
        self.bridge.invoke_blocking(&self.selector, &self.method, args, Fields::new())
    }
}

/// A named host service. Not a proxy: it has no identity and no field cache.
#[derive(Clone)]
pub struct Facade {
    bridge: Bridge,
    name: String,
}

impl Facade {
    pub(crate) fn new(bridge: Bridge, name: impl Into<String>) -> Self {
        Self { bridge, name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn selector(&self) -> Selector {
        Selector::Facade(self.name.clone())
    }

    pub fn method(&self, method: impl Into<String>) -> Invoker {
        Invoker::new(self.bridge.clone(), self.selector(), method)
    }

    pub fn call(&self, method: &str, args: Vec<Value>) -> CallFuture {
        self.bridge.invoke(&self.selector(), method, args, Fields::new())
    }

    pub fn call_with(&self, method: &str, args: Vec<Value>, named: Fields) -> CallFuture {
        self.bridge.invoke(&self.selector(), method, args, named)
    }

    pub fn call_blocking(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.bridge.invoke_blocking(&self.selector(), method, args, Fields::new())
    }
}
