//! # Type Registry
//!
//! Maps host type names to client-side proxy classes.
//!
//! Resolution is exact match first, then a suffix/substring heuristic so host
//! types the client has never heard of (e.g. `CraftPlayer`) still build the
//! closest known class. The registry is append-only; entries are never removed.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::value::ProxyClass;

/// Suffix rules, checked in order after exact lookup fails.
const SUFFIX_RULES: &[(&str, ProxyClass)] = &[
    ("Player", ProxyClass::Player),
    ("Entity", ProxyClass::Entity),
    ("World", ProxyClass::World),
    ("Location", ProxyClass::Location),
    ("Block", ProxyClass::Block),
    ("Chunk", ProxyClass::Chunk),
];

/// Substring rules, checked after the suffix rules.
const CONTAINS_RULES: &[(&str, ProxyClass)] = &[
    ("Inventory", ProxyClass::Inventory),
    ("ItemStack", ProxyClass::Item),
    ("PotionEffect", ProxyClass::Effect),
];

/// Concurrent, append-only `type name -> ProxyClass` table.
pub struct TypeRegistry {
    exact: RwLock<HashMap<String, ProxyClass>>,
}

impl TypeRegistry {
    /// An empty registry with no exact entries; only the heuristics apply.
    pub fn empty() -> Self {
        Self { exact: RwLock::new(HashMap::new()) }
    }

    /// Registers an exact mapping. Later registrations of the same name win.
    pub fn register(&self, type_name: impl Into<String>, class: ProxyClass) {
        let mut exact = self.exact.write().unwrap_or_else(|e| e.into_inner());
        exact.insert(type_name.into(), class);
    }

    /// Resolves a host type name to a proxy class.
    pub fn resolve(&self, type_name: &str) -> ProxyClass {
        // event types are matched by suffix before the table, so every
        // `*Event` lands on the event class regardless of registrations
        if type_name.ends_with("Event") {
            return ProxyClass::Event;
        }

        {
            let exact = self.exact.read().unwrap_or_else(|e| e.into_inner());
            if let Some(class) = exact.get(type_name) {
                return *class;
            }
        }

        if type_name.is_empty() {
            return ProxyClass::Generic;
        }

        SUFFIX_RULES
            .iter()
            .find(|(suffix, _)| type_name.ends_with(suffix))
            .or_else(|| CONTAINS_RULES.iter().find(|(needle, _)| type_name.contains(needle)))
            .map(|(_, class)| *class)
            .unwrap_or(ProxyClass::Generic)
    }
}

impl Default for TypeRegistry {
    /// A registry seeded with the host types the client knows by name.
    fn default() -> Self {
        let registry = Self::empty();
        for (name, class) in [
            ("Server", ProxyClass::Server),
            ("Player", ProxyClass::Player),
            ("Entity", ProxyClass::Entity),
            ("World", ProxyClass::World),
            ("WorldImpl", ProxyClass::World),
            ("Dimension", ProxyClass::Dimension),
            ("Location", ProxyClass::Location),
            ("Block", ProxyClass::Block),
            ("Chunk", ProxyClass::Chunk),
            ("Vector", ProxyClass::Vector),
            ("Inventory", ProxyClass::Inventory),
            ("ItemStack", ProxyClass::Item),
            ("Item", ProxyClass::Item),
            ("PotionEffect", ProxyClass::Effect),
            ("Effect", ProxyClass::Effect),
            ("BossBar", ProxyClass::BossBar),
            ("Scoreboard", ProxyClass::Scoreboard),
            ("Team", ProxyClass::Team),
            ("Objective", ProxyClass::Objective),
            ("Advancement", ProxyClass::Advancement),
            ("AdvancementProgress", ProxyClass::AdvancementProgress),
            ("AttributeInstance", ProxyClass::Attribute),
            ("Attribute", ProxyClass::Attribute),
        ] {
            registry.register(name, class);
        }
        registry
    }
}

/// Player name to UUID cache, fed by every decoded player proxy.
///
/// Lets name-keyed references answer identity questions without a round trip.
#[derive(Default)]
pub struct PlayerDirectory {
    uuids: RwLock<HashMap<String, String>>,
}

impl PlayerDirectory {
    pub fn remember(&self, name: impl Into<String>, uuid: impl Into<String>) {
        let mut uuids = self.uuids.write().unwrap_or_else(|e| e.into_inner());
        uuids.insert(name.into(), uuid.into());
    }

    pub fn uuid_of(&self, name: &str) -> Option<String> {
        let uuids = self.uuids.read().unwrap_or_else(|e| e.into_inner());
        uuids.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.uuids.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
