//! # Codec
//!
//! The translation layer between [`Value`] and the JSON documents carried in
//! frames.
//!
//! ## Wire shapes
//!
//! | Value                | JSON                                               |
//! |----------------------|----------------------------------------------------|
//! | handle-bound proxy   | `{"__handle__": id}` (host adds `__type__`, `fields`) |
//! | reference-bound proxy| `{"__ref__": {"type": kind, "id": id}}`            |
//! | value-only proxy     | `{"__value__": class, "fields": {...}}`            |
//! | enum constant        | `{"__enum__": typeName, "name": name}`             |
//! | UUID                 | `{"__uuid__": "..."}`                              |
//! | position             | `{"x": .., "y": .., "z": .., ...}`                 |
//!
//! Lists and mappings recurse; scalars pass through.
//!
//! ## Invariants
//! - **Stateless**: no per-call state; only the shared registries are consulted.
//! - **One Lease Per Handle**: decoding a handle that is still in use joins its
//!   existing lease.
//! - **Panic Safety**: decoding returns `Result` on every malformed shape.

use std::sync::Arc;
use std::sync::Weak;

use serde_json::Map;
use serde_json::Number;
use serde_json::Value as Json;
use uuid::Uuid;

use crate::error::Error;
use crate::error::Result;
use crate::registry::PlayerDirectory;
use crate::registry::TypeRegistry;
use crate::value::EnumValue;
use crate::value::Fields;
use crate::value::Identity;
use crate::value::LeaseTable;
use crate::value::Position;
use crate::value::Proxy;
use crate::value::ProxyClass;
use crate::value::Reference;
use crate::value::ReleaseSink;
use crate::value::Value;

pub const HANDLE_TAG: &str = "__handle__";
pub const TYPE_TAG: &str = "__type__";
pub const REF_TAG: &str = "__ref__";
pub const VALUE_TAG: &str = "__value__";
pub const UUID_TAG: &str = "__uuid__";
pub const ENUM_TAG: &str = "__enum__";

// ============================================================================
//  ENCODING (Value -> JSON)
// ============================================================================

/// Encodes a value into its JSON wire shape.
///
/// Infallible: non-finite floats have no JSON spelling and encode as `null`.
pub fn encode(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(v) => Json::Number((*v).into()),
        Value::Float(v) => Number::from_f64(*v).map(Json::Number).unwrap_or(Json::Null),
        Value::Str(s) => Json::String(s.clone()),
        Value::List(items) => Json::Array(items.iter().map(encode).collect()),
        Value::Map(map) => Json::Object(encode_fields(map)),
        Value::Proxy(proxy) => encode_proxy(proxy),
        Value::Enum(e) => {
            let mut obj = Map::new();
            obj.insert(ENUM_TAG.into(), Json::String(e.type_name.clone()));
            obj.insert("name".into(), Json::String(e.name.clone()));
            Json::Object(obj)
        }
        Value::Uuid(u) => {
            let mut obj = Map::new();
            obj.insert(UUID_TAG.into(), Json::String(u.to_string()));
            Json::Object(obj)
        }
        Value::Position(p) => {
            let mut obj = encode_fields(&p.extra);
            obj.insert("x".into(), encode(&Value::Float(p.x)));
            obj.insert("y".into(), encode(&Value::Float(p.y)));
            obj.insert("z".into(), encode(&Value::Float(p.z)));
            Json::Object(obj)
        }
    }
}

/// Encodes a string-keyed mapping member by member.
pub fn encode_fields(fields: &Fields) -> Map<String, Json> {
    fields.iter().map(|(k, v)| (k.clone(), encode(v))).collect()
}

fn encode_proxy(proxy: &Proxy) -> Json {
    let mut obj = Map::new();
    match proxy.identity() {
        Identity::Handle(lease) => {
            obj.insert(HANDLE_TAG.into(), Json::Number(lease.id().into()));
        }
        Identity::Reference(r) => {
            let mut inner = Map::new();
            inner.insert("type".into(), Json::String(r.kind.clone()));
            inner.insert("id".into(), Json::String(r.id.clone()));
            obj.insert(REF_TAG.into(), Json::Object(inner));
        }
        Identity::Value => {
            obj.insert(VALUE_TAG.into(), Json::String(proxy.type_name().to_string()));
            obj.insert("fields".into(), Json::Object(encode_fields(proxy.fields())));
        }
    }
    Json::Object(obj)
}

// ============================================================================
//  DECODING (JSON -> Value)
// ============================================================================

/// Decodes JSON into values, building proxies through the shared registries.
#[derive(Clone)]
pub struct Codec {
    types: Arc<TypeRegistry>,
    players: Arc<PlayerDirectory>,
    leases: Arc<LeaseTable>,
    releaser: Option<Weak<dyn ReleaseSink>>,
}

impl Codec {
    pub fn new(types: Arc<TypeRegistry>) -> Self {
        Self {
            types,
            players: Arc::new(PlayerDirectory::default()),
            leases: Arc::new(LeaseTable::default()),
            releaser: None,
        }
    }

    /// Shares a player directory instead of owning a private one.
    pub fn with_players(mut self, players: Arc<PlayerDirectory>) -> Self {
        self.players = players;
        self
    }

    /// Handle-bound proxies decoded from now on report their release here.
    pub fn with_release_sink(mut self, sink: Weak<dyn ReleaseSink>) -> Self {
        self.releaser = Some(sink);
        self
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn players(&self) -> &PlayerDirectory {
        &self.players
    }

    /// Leases of the handles this codec has decoded and that are still in use.
    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn encode(&self, value: &Value) -> Json {
        encode(value)
    }

    /// Decodes a JSON document into a value.
    pub fn decode(&self, json: &Json) -> Result<Value> {
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => decode_number(n),
            Json::String(s) => Value::Str(s.clone()),
            Json::Array(items) => Value::List(
                items.iter().map(|item| self.decode(item)).collect::<Result<_>>()?,
            ),
            Json::Object(obj) => self.decode_object(obj)?,
        })
    }

    /// Decodes every member of a mapping.
    pub fn decode_fields(&self, obj: &Map<String, Json>) -> Result<Fields> {
        obj.iter()
            .map(|(k, v)| self.decode(v).map(|v| (k.clone(), v)))
            .collect()
    }

    fn decode_object(&self, obj: &Map<String, Json>) -> Result<Value> {
        if let Some(handle) = obj.get(HANDLE_TAG) {
            return self.decode_handle(handle, obj).map(Value::Proxy);
        }
        if let Some(reference) = obj.get(REF_TAG) {
            return self.decode_reference(reference, obj).map(Value::Proxy);
        }
        if let Some(class_name) = obj.get(VALUE_TAG) {
            let class_name = class_name
                .as_str()
                .ok_or_else(|| Error::MalformedTag(format!("{VALUE_TAG} must be a string")))?;
            let fields = self.decode_member_fields(obj)?;
            let class = self.types.resolve(class_name);
            return Ok(Value::Proxy(Proxy::value(class_name, class, fields)));
        }
        if let Some(text) = obj.get(UUID_TAG) {
            let text = text
                .as_str()
                .ok_or_else(|| Error::MalformedTag(format!("{UUID_TAG} must be a string")))?;
            let uuid = Uuid::parse_str(text).map_err(|_| Error::InvalidUuid(text.to_string()))?;
            return Ok(Value::Uuid(uuid));
        }
        if let Some(type_name) = obj.get(ENUM_TAG) {
            let type_name = type_name
                .as_str()
                .ok_or_else(|| Error::MalformedTag(format!("{ENUM_TAG} must be a string")))?;
            let name = obj
                .get("name")
                .and_then(Json::as_str)
                .ok_or_else(|| Error::MalformedTag(format!("{ENUM_TAG} without a name")))?;
            return Ok(Value::Enum(EnumValue::from_parts(type_name, name)));
        }
        if let Some(position) = self.decode_position(obj)? {
            return Ok(Value::Position(position));
        }
        Ok(Value::Map(self.decode_fields(obj)?))
    }

    fn decode_handle(&self, handle: &Json, obj: &Map<String, Json>) -> Result<Proxy> {
        let id = handle
            .as_i64()
            .ok_or_else(|| Error::MalformedTag(format!("{HANDLE_TAG} must be an integer")))?;
        let type_name = obj.get(TYPE_TAG).and_then(Json::as_str).unwrap_or_default();
        let fields = self.decode_member_fields(obj)?;
        let class = self.types.resolve(type_name);

        if class == ProxyClass::Player {
            self.remember_player(&fields);
        }

        let lease = self.leases.acquire(id, self.releaser.clone());
        Ok(Proxy::from_lease(lease, type_name, class, fields))
    }

    fn decode_reference(&self, reference: &Json, obj: &Map<String, Json>) -> Result<Proxy> {
        let malformed = || Error::MalformedTag(format!("{REF_TAG} needs string type and id"));
        let inner = reference.as_object().ok_or_else(malformed)?;
        let kind = inner.get("type").and_then(Json::as_str).ok_or_else(malformed)?;
        let id = inner.get("id").and_then(Json::as_str).ok_or_else(malformed)?;
        let fields = self.decode_member_fields(obj)?;
        Ok(Proxy::from_reference(Reference::new(kind, id), reference_class(kind), fields))
    }

    /// Decodes the optional `fields` member of a tagged object.
    fn decode_member_fields(&self, obj: &Map<String, Json>) -> Result<Fields> {
        match obj.get("fields") {
            None | Some(Json::Null) => Ok(Fields::new()),
            Some(Json::Object(fields)) => self.decode_fields(fields),
            Some(other) => Err(Error::MalformedTag(format!("fields must be a mapping, found {other}"))),
        }
    }

    fn decode_position(&self, obj: &Map<String, Json>) -> Result<Option<Position>> {
        let coord = |key: &str| obj.get(key).and_then(Json::as_f64);
        let (Some(x), Some(y), Some(z)) = (coord("x"), coord("y"), coord("z")) else {
            return Ok(None);
        };

        let mut extra = Fields::new();
        for (key, value) in obj {
            if !matches!(key.as_str(), "x" | "y" | "z") {
                extra.insert(key.clone(), self.decode(value)?);
            }
        }
        Ok(Some(Position { x, y, z, extra }))
    }

    fn remember_player(&self, fields: &Fields) {
        let Some(name) = fields.get("name").and_then(Value::as_str) else {
            return;
        };
        match fields.get("uuid") {
            Some(Value::Str(uuid)) => self.players.remember(name, uuid.clone()),
            Some(Value::Uuid(uuid)) => self.players.remember(name, uuid.to_string()),
            _ => {}
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(Arc::new(TypeRegistry::default()))
    }
}

fn decode_number(n: &Number) -> Value {
    match n.as_i64() {
        Some(v) => Value::Int(v),
        None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
    }
}

/// Proxy class implied by a reference kind.
fn reference_class(kind: &str) -> ProxyClass {
    match kind {
        "player" | "player_name" => ProxyClass::Player,
        "entity" => ProxyClass::Entity,
        "world" => ProxyClass::World,
        "block" => ProxyClass::Block,
        "chunk" => ProxyClass::Chunk,
        "player_inventory" => ProxyClass::Inventory,
        _ => ProxyClass::Generic,
    }
}
