//! # Value Model
//!
//! The dynamic values that cross the bridge in either direction.
//!
//! A [`Value`] is either a plain scalar/container (mirroring a JSON document) or
//! one of the tagged kinds the host understands: proxies, enum constants, UUIDs,
//! and lightweight positions.
//!
//! ## Invariants
//!
//! - A [`Proxy`] holds exactly one [`Identity`]; the kinds are mutually exclusive
//!   by construction.
//! - Clones of a handle-bound proxy share one [`HandleLease`]. The handle is
//!   handed to the [`ReleaseSink`] exactly once, when the last clone is dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

/// Field cache of a proxy, or the body of a plain mapping.
pub type Fields = BTreeMap<String, Value>;

/// A value that can be passed to, or returned from, the host.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(Fields),
    Proxy(Proxy),
    Enum(EnumValue),
    Uuid(Uuid),
    Position(Position),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of the value. Integers widen to `f64`; booleans are not numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Fields> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Value::Proxy(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumValue> {
        match self {
            Value::Enum(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_position(&self) -> Option<&Position> {
        match self {
            Value::Position(p) => Some(p),
            _ => None,
        }
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Proxy(_) => "proxy",
            Value::Enum(_) => "enum",
            Value::Uuid(_) => "uuid",
            Value::Position(_) => "position",
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v $(as $cast)?)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i64 => Int,
    i32 => Int as i64,
    u32 => Int as i64,
    f64 => Float,
    f32 => Float as f64,
    String => Str,
    Vec<Value> => List,
    Fields => Map,
    Proxy => Proxy,
    EnumValue => Enum,
    Uuid => Uuid,
    Position => Position,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// ============================================================================
//  POSITIONS
// ============================================================================

/// An untagged `{x, y, z}` mapping from the host.
///
/// Decoded as plain coordinates rather than a full proxy. Keys other than the
/// coordinates are kept in `extra` so the mapping round-trips.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub extra: Fields,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z, extra: Fields::new() }
    }
}

// ============================================================================
//  ENUM CONSTANTS
// ============================================================================

/// Client-side families of host enum types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnumKind {
    Material,
    Biome,
    GameMode,
    Sound,
    Particle,
    Difficulty,
    AttributeType,
    BarColor,
    BarStyle,
    EntityType,
    EffectType,
    /// A host enum type with no client-side family.
    Other,
}

impl EnumKind {
    /// Fully-qualified host type name for this family.
    pub fn host_type(self) -> Option<&'static str> {
        Some(match self {
            EnumKind::Material => "org.bukkit.Material",
            EnumKind::Biome => "org.bukkit.block.Biome",
            EnumKind::GameMode => "org.bukkit.GameMode",
            EnumKind::Sound => "org.bukkit.Sound",
            EnumKind::Particle => "org.bukkit.Particle",
            EnumKind::Difficulty => "org.bukkit.Difficulty",
            EnumKind::AttributeType => "org.bukkit.attribute.Attribute",
            EnumKind::BarColor => "org.bukkit.boss.BarColor",
            EnumKind::BarStyle => "org.bukkit.boss.BarStyle",
            EnumKind::EntityType => "org.bukkit.entity.EntityType",
            EnumKind::EffectType => "org.bukkit.potion.PotionEffectType",
            EnumKind::Other => return None,
        })
    }

    /// Resolves a host type name to its family. Unknown names map to `Other`.
    pub fn from_host_type(type_name: &str) -> Self {
        const ALL: [EnumKind; 11] = [
            EnumKind::Material,
            EnumKind::Biome,
            EnumKind::GameMode,
            EnumKind::Sound,
            EnumKind::Particle,
            EnumKind::Difficulty,
            EnumKind::AttributeType,
            EnumKind::BarColor,
            EnumKind::BarStyle,
            EnumKind::EntityType,
            EnumKind::EffectType,
        ];
        ALL.into_iter()
            .find(|kind| kind.host_type() == Some(type_name))
            .unwrap_or(EnumKind::Other)
    }

    /// Builds a constant of this family, e.g. `EnumKind::Material.value("DIAMOND")`.
    pub fn value(self, name: impl Into<String>) -> EnumValue {
        EnumValue {
            kind: self,
            type_name: self.host_type().unwrap_or_default().to_string(),
            name: name.into(),
        }
    }
}

/// A named constant of a host enum type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumValue {
    pub kind: EnumKind,
    pub type_name: String,
    pub name: String,
}

impl EnumValue {
    /// The `(typeName, name)` factory used by the decoder.
    pub fn from_parts(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            kind: EnumKind::from_host_type(&type_name),
            type_name,
            name: name.into(),
        }
    }
}

impl fmt::Display for EnumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ============================================================================
//  PROXIES
// ============================================================================

/// Receives handles whose last client-side owner went away.
pub trait ReleaseSink: Send + Sync {
    fn release(&self, handle: i64);

    /// Withdraws a queued release because the host handed `handle` out again.
    fn reclaim(&self, _handle: i64) {}
}

/// Ownership of one host-assigned handle.
///
/// Dropping the lease queues the handle for release. The sink is held weakly so
/// a proxy that outlives its connection releases nothing.
pub struct HandleLease {
    id: i64,
    sink: Option<Weak<dyn ReleaseSink>>,
    table: Option<Weak<LeaseTable>>,
}

impl HandleLease {
    pub fn new(id: i64, sink: Option<Weak<dyn ReleaseSink>>) -> Self {
        Self { id, sink, table: None }
    }

    /// A lease that never reports its release.
    pub fn detached(id: i64) -> Self {
        Self { id, sink: None, table: None }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    fn release(&self) {
        if let Some(sink) = self.sink.as_ref().and_then(|weak| weak.upgrade()) {
            sink.release(self.id);
        }
    }
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        match self.table.as_ref().and_then(|weak| weak.upgrade()) {
            Some(table) => table.retire(self),
            None => self.release(),
        }
    }
}

impl fmt::Debug for HandleLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleLease").field("id", &self.id).finish()
    }
}

/// The live lease for every handle id the codec has handed out.
///
/// The host answers with the same id each time it returns an object it already
/// tracks. Decoding that id again must join the existing lease, or dropping
/// either copy would release a handle the other still uses.
///
/// ## Invariants
/// - At most one live lease per id.
/// - Acquiring and retiring an id serialize on its map entry, so a release
///   queued by a dying lease is withdrawn when the id is acquired again.
#[derive(Default)]
pub struct LeaseTable {
    live: DashMap<i64, Weak<HandleLease>>,
}

impl LeaseTable {
    /// The live lease for `id`, or a fresh one reporting to `sink`.
    pub fn acquire(self: &Arc<Self>, id: i64, sink: Option<Weak<dyn ReleaseSink>>) -> Arc<HandleLease> {
        let mut entry = self.live.entry(id).or_default();
        if let Some(lease) = entry.upgrade() {
            return lease;
        }

        if let Some(sink) = sink.as_ref().and_then(|weak| weak.upgrade()) {
            sink.reclaim(id);
        }
        let lease = Arc::new(HandleLease {
            id,
            sink,
            table: Some(Arc::downgrade(self)),
        });
        *entry = Arc::downgrade(&lease);
        lease
    }

    /// Number of ids with a live lease.
    pub fn live(&self) -> usize {
        self.live.iter().filter(|entry| entry.strong_count() > 0).count()
    }

    // runs from the lease's Drop, when its strong count is already zero
    fn retire(&self, lease: &HandleLease) {
        if let Entry::Occupied(entry) = self.live.entry(lease.id) {
            if entry.get().strong_count() > 0 {
                // acquired again while this lease was dying; the new one owns the id
                return;
            }
            // still holding the entry so a concurrent acquire sees the release queued
            lease.release();
            entry.remove();
        } else {
            lease.release();
        }
    }
}

/// A stable `(kind, id)` address the client can build without a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub kind: String,
    pub id: String,
}

impl Reference {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self { kind: kind.into(), id: id.into() }
    }
}

/// How a proxy is addressed on the host.
#[derive(Debug, Clone)]
pub enum Identity {
    /// A live host object, valid until released.
    Handle(Arc<HandleLease>),
    /// A stable key resolved by the host on each call.
    Reference(Reference),
    /// No host identity; serialized inline from its fields.
    Value,
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Identity::Handle(a), Identity::Handle(b)) => a.id() == b.id(),
            (Identity::Reference(a), Identity::Reference(b)) => a == b,
            (Identity::Value, Identity::Value) => true,
            _ => false,
        }
    }
}

/// Client-side class of a proxy, resolved from the host type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyClass {
    Server,
    Player,
    Entity,
    World,
    Dimension,
    Location,
    Block,
    Chunk,
    Vector,
    Inventory,
    Item,
    Effect,
    BossBar,
    Scoreboard,
    Team,
    Objective,
    Advancement,
    AdvancementProgress,
    Attribute,
    Event,
    Generic,
}

impl ProxyClass {
    /// The class name sent as `__value__` for value-only proxies.
    pub fn name(self) -> &'static str {
        match self {
            ProxyClass::Server => "Server",
            ProxyClass::Player => "Player",
            ProxyClass::Entity => "Entity",
            ProxyClass::World => "World",
            ProxyClass::Dimension => "Dimension",
            ProxyClass::Location => "Location",
            ProxyClass::Block => "Block",
            ProxyClass::Chunk => "Chunk",
            ProxyClass::Vector => "Vector",
            ProxyClass::Inventory => "Inventory",
            ProxyClass::Item => "Item",
            ProxyClass::Effect => "Effect",
            ProxyClass::BossBar => "BossBar",
            ProxyClass::Scoreboard => "Scoreboard",
            ProxyClass::Team => "Team",
            ProxyClass::Objective => "Objective",
            ProxyClass::Advancement => "Advancement",
            ProxyClass::AdvancementProgress => "AdvancementProgress",
            ProxyClass::Attribute => "Attribute",
            ProxyClass::Event => "Event",
            ProxyClass::Generic => "Proxy",
        }
    }
}

/// Client-side stand-in for an object the host owns or understands.
#[derive(Debug, Clone, PartialEq)]
pub struct Proxy {
    type_name: String,
    class: ProxyClass,
    identity: Identity,
    fields: Fields,
}

impl Proxy {
    /// A proxy bound to a live host handle.
    pub fn from_handle(lease: HandleLease, type_name: impl Into<String>, class: ProxyClass, fields: Fields) -> Self {
        Self {
            type_name: type_name.into(),
            class,
            identity: Identity::Handle(Arc::new(lease)),
            fields,
        }
    }

    /// A proxy sharing an existing lease, as decoded handles do.
    pub fn from_lease(lease: Arc<HandleLease>, type_name: impl Into<String>, class: ProxyClass, fields: Fields) -> Self {
        Self {
            type_name: type_name.into(),
            class,
            identity: Identity::Handle(lease),
            fields,
        }
    }

    /// A proxy addressed by a stable reference.
    pub fn from_reference(reference: Reference, class: ProxyClass, fields: Fields) -> Self {
        Self {
            type_name: class.name().to_string(),
            class,
            identity: Identity::Reference(reference),
            fields,
        }
    }

    /// A value-only proxy with the given class name.
    pub fn value(type_name: impl Into<String>, class: ProxyClass, fields: Fields) -> Self {
        Self {
            type_name: type_name.into(),
            class,
            identity: Identity::Value,
            fields,
        }
    }

    /// A player addressed by name, or by UUID when `key` parses as one.
    pub fn player(key: &str) -> Self {
        match Uuid::parse_str(key) {
            Ok(uuid) => Self::player_by_uuid(uuid),
            Err(_) => {
                let mut fields = Fields::new();
                fields.insert("name".into(), Value::from(key));
                Self::from_reference(Reference::new("player_name", key), ProxyClass::Player, fields)
            }
        }
    }

    pub fn player_by_uuid(uuid: Uuid) -> Self {
        let mut fields = Fields::new();
        fields.insert("uuid".into(), Value::Str(uuid.to_string()));
        Self::from_reference(Reference::new("player", uuid.to_string()), ProxyClass::Player, fields)
    }

    pub fn entity(uuid: Uuid) -> Self {
        let mut fields = Fields::new();
        fields.insert("uuid".into(), Value::Str(uuid.to_string()));
        Self::from_reference(Reference::new("entity", uuid.to_string()), ProxyClass::Entity, fields)
    }

    pub fn world(name: &str) -> Self {
        let mut fields = Fields::new();
        fields.insert("name".into(), Value::from(name));
        Self::from_reference(Reference::new("world", name), ProxyClass::World, fields)
    }

    /// A block addressed as `world:x:y:z`.
    pub fn block(world: &str, x: i64, y: i64, z: i64) -> Self {
        let mut fields = Fields::new();
        fields.insert("x".into(), Value::Int(x));
        fields.insert("y".into(), Value::Int(y));
        fields.insert("z".into(), Value::Int(z));
        fields.insert("world".into(), Value::Proxy(Self::world(world)));
        let id = format!("{world}:{x}:{y}:{z}");
        Self::from_reference(Reference::new("block", id), ProxyClass::Block, fields)
    }

    /// A chunk addressed as `world:x:z` in chunk coordinates.
    pub fn chunk(world: &str, x: i64, z: i64) -> Self {
        let mut fields = Fields::new();
        fields.insert("x".into(), Value::Int(x));
        fields.insert("z".into(), Value::Int(z));
        fields.insert("world".into(), Value::Proxy(Self::world(world)));
        let id = format!("{world}:{x}:{z}");
        Self::from_reference(Reference::new("chunk", id), ProxyClass::Chunk, fields)
    }

    /// The inventory of a player, keyed by player name or UUID.
    pub fn player_inventory(player: &str) -> Self {
        Self::from_reference(Reference::new("player_inventory", player), ProxyClass::Inventory, Fields::new())
    }

    pub fn location(x: f64, y: f64, z: f64, world: Option<&str>, yaw: f64, pitch: f64) -> Self {
        let mut fields = Fields::new();
        fields.insert("x".into(), Value::Float(x));
        fields.insert("y".into(), Value::Float(y));
        fields.insert("z".into(), Value::Float(z));
        fields.insert("yaw".into(), Value::Float(yaw));
        fields.insert("pitch".into(), Value::Float(pitch));
        if let Some(world) = world {
            fields.insert("world".into(), Value::Proxy(Self::world(world)));
        }
        Self::value("Location", ProxyClass::Location, fields)
    }

    pub fn vector(x: f64, y: f64, z: f64) -> Self {
        let mut fields = Fields::new();
        fields.insert("x".into(), Value::Float(x));
        fields.insert("y".into(), Value::Float(y));
        fields.insert("z".into(), Value::Float(z));
        Self::value("Vector", ProxyClass::Vector, fields)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn class(&self) -> ProxyClass {
        self.class
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn handle(&self) -> Option<i64> {
        match &self.identity {
            Identity::Handle(lease) => Some(lease.id()),
            _ => None,
        }
    }

    pub fn reference(&self) -> Option<&Reference> {
        match &self.identity {
            Identity::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self.identity, Identity::Value)
    }

    /// Reads the local field cache. Never touches the network.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Mutable access to the field cache, for merging data the host sent.
    pub fn fields_mut(&mut self) -> &mut Fields {
        &mut self.fields
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}
