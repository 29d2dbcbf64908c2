//! Communication settings and their cascaded resolution.
//!
//! Layers, least to most specific:
//!
//! | Layer | Config key |
//! |-------|------------|
//! | built-in defaults per primitive type | - |
//! | base | `base` |
//! | primitive type | `types.<command\|query\|event>` |
//! | service category | `categories.<local\|external>` (+ `.types`) |
//! | service | `services.<name>` (+ `.types`) |
//! | primitive name | `primitives."<service>.<primitive>"` |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{EventId, MethodId, PrimitiveKind, ServiceCategory, ServiceId};

// ─── Resolved settings ────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCommunicationSettings {
    pub deduplicate: bool,
    pub resilient: bool,
    pub persistent: bool,
    pub roaming_state: bool,
    pub transactional: bool,
    pub run_in_place: bool,
    pub ignore_transaction: bool,
}

impl MethodCommunicationSettings {
    pub fn query_defaults() -> Self {
        Self {
            run_in_place: true,
            ignore_transaction: true,
            ..Self::default()
        }
    }

    pub fn command_defaults() -> Self {
        Self {
            deduplicate: true,
            resilient: true,
            persistent: true,
            transactional: true,
            ..Self::default()
        }
    }

    pub fn defaults_for(kind: PrimitiveKind) -> Self {
        match kind {
            PrimitiveKind::Query => Self::query_defaults(),
            PrimitiveKind::Command | PrimitiveKind::Event => Self::command_defaults(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCommunicationSettings {
    pub deduplicate: bool,
    pub resilient: bool,
    pub persistent: bool,
    pub transactional: bool,
    /// Run local subscribers in this process instead of queueing them.
    pub run_in_place: bool,
    pub ignore_transaction: bool,
}

impl EventCommunicationSettings {
    pub fn defaults() -> Self {
        Self {
            deduplicate: true,
            resilient: true,
            persistent: true,
            transactional: true,
            run_in_place: true,
            ignore_transaction: false,
        }
    }
}

// ─── Overrides ────────────────────────────────────────────────

/// One layer of the cascade. Unset fields inherit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsOverride {
    pub deduplicate: Option<bool>,
    pub resilient: Option<bool>,
    pub persistent: Option<bool>,
    pub roaming_state: Option<bool>,
    pub transactional: Option<bool>,
    pub run_in_place: Option<bool>,
    pub ignore_transaction: Option<bool>,
}

impl SettingsOverride {
    pub fn apply_to_method(&self, s: &mut MethodCommunicationSettings) {
        if let Some(v) = self.deduplicate {
            s.deduplicate = v;
        }
        if let Some(v) = self.resilient {
            s.resilient = v;
        }
        if let Some(v) = self.persistent {
            s.persistent = v;
        }
        if let Some(v) = self.roaming_state {
            s.roaming_state = v;
        }
        if let Some(v) = self.transactional {
            s.transactional = v;
        }
        if let Some(v) = self.run_in_place {
            s.run_in_place = v;
        }
        if let Some(v) = self.ignore_transaction {
            s.ignore_transaction = v;
        }
    }

    /// `roaming_state` has no meaning for events and is ignored.
    pub fn apply_to_event(&self, s: &mut EventCommunicationSettings) {
        if let Some(v) = self.deduplicate {
            s.deduplicate = v;
        }
        if let Some(v) = self.resilient {
            s.resilient = v;
        }
        if let Some(v) = self.persistent {
            s.persistent = v;
        }
        if let Some(v) = self.transactional {
            s.transactional = v;
        }
        if let Some(v) = self.run_in_place {
            s.run_in_place = v;
        }
        if let Some(v) = self.ignore_transaction {
            s.ignore_transaction = v;
        }
    }
}

/// Overrides for a scope plus per-primitive-type refinements inside it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopedOverride {
    pub settings: SettingsOverride,
    pub types: HashMap<PrimitiveKind, SettingsOverride>,
}

impl ScopedOverride {
    fn layers(&self, kind: PrimitiveKind) -> impl Iterator<Item = &SettingsOverride> {
        std::iter::once(&self.settings).chain(self.types.get(&kind))
    }
}

/// The `communication` section of the configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicationOverrides {
    pub base: SettingsOverride,
    pub types: HashMap<PrimitiveKind, SettingsOverride>,
    pub categories: HashMap<ServiceCategory, ScopedOverride>,
    pub services: HashMap<String, ScopedOverride>,
    /// Keyed `"<service>.<method or event>"`.
    pub primitives: HashMap<String, SettingsOverride>,
}

// ─── Resolver ─────────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct SettingsResolver {
    overrides: CommunicationOverrides,
}

impl SettingsResolver {
    pub fn new(overrides: CommunicationOverrides) -> Self {
        Self { overrides }
    }

    fn layers<'a>(
        &'a self,
        service: &ServiceId,
        category: ServiceCategory,
        kind: PrimitiveKind,
        primitive: &str,
    ) -> Vec<&'a SettingsOverride> {
        let o = &self.overrides;
        let mut layers = vec![&o.base];
        layers.extend(o.types.get(&kind));
        if let Some(scope) = o.categories.get(&category) {
            layers.extend(scope.layers(kind));
        }
        if let Some(scope) = o.services.get(&service.name) {
            layers.extend(scope.layers(kind));
        }
        layers.extend(o.primitives.get(&format!("{}.{}", service.name, primitive)));
        layers
    }

    pub fn method_settings(
        &self,
        service: &ServiceId,
        category: ServiceCategory,
        kind: PrimitiveKind,
        method: &MethodId,
    ) -> MethodCommunicationSettings {
        let mut settings = MethodCommunicationSettings::defaults_for(kind);
        for layer in self.layers(service, category, kind, &method.name) {
            layer.apply_to_method(&mut settings);
        }
        settings
    }

    pub fn event_settings(
        &self,
        service: &ServiceId,
        category: ServiceCategory,
        event: &EventId,
    ) -> EventCommunicationSettings {
        let mut settings = EventCommunicationSettings::defaults();
        for layer in self.layers(service, category, PrimitiveKind::Event, &event.name) {
            layer.apply_to_event(&mut settings);
        }
        settings
    }
}
