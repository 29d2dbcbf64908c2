//! Startup-built lookup tables: service definitions and communicator routing.
//!
//! Both are validated once when the engine is built. Lookups afterwards are
//! plain map reads.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::communicator::Communicator;
use crate::error::{FabricError, Result};
use crate::types::{MethodId, PrimitiveKind, ServiceCategory, ServiceId};

// ─── Services ─────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub id: ServiceId,
    pub category: ServiceCategory,
    /// Communicator name. `None` uses the registry default.
    pub communicator: Option<String>,
    pub methods: HashMap<MethodId, PrimitiveKind>,
}

impl ServiceDefinition {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            id: ServiceId::new(name),
            category: ServiceCategory::Local,
            communicator: None,
            methods: HashMap::new(),
        }
    }

    pub fn external(name: impl Into<String>, communicator: impl Into<String>) -> Self {
        Self {
            id: ServiceId::new(name),
            category: ServiceCategory::External,
            communicator: Some(communicator.into()),
            methods: HashMap::new(),
        }
    }

    pub fn with_method(mut self, name: impl Into<String>, kind: PrimitiveKind) -> Self {
        self.methods.insert(MethodId::new(name), kind);
        self
    }

    /// Unlisted methods are commands: the safe default for external
    /// services, whose queries must be declared.
    pub fn kind_of(&self, method: &MethodId) -> PrimitiveKind {
        self.methods
            .get(method)
            .copied()
            .unwrap_or(PrimitiveKind::Command)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<ServiceId, ServiceDefinition>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, definition: ServiceDefinition) -> Result<&mut Self> {
        if self.services.contains_key(&definition.id) {
            return Err(FabricError::configuration(format!(
                "service {} defined twice",
                definition.id
            )));
        }
        self.services.insert(definition.id.clone(), definition);
        Ok(self)
    }

    /// Define `service` as local unless it is already known.
    pub fn ensure_local(&mut self, service: &ServiceId) {
        self.services
            .entry(service.clone())
            .or_insert_with(|| ServiceDefinition::local(service.name.clone()));
    }

    pub fn get(&self, service: &ServiceId) -> Result<&ServiceDefinition> {
        self.services.get(service).ok_or_else(|| {
            FabricError::configuration(format!("unknown service {service}"))
        })
    }

    pub fn category(&self, service: &ServiceId) -> Result<ServiceCategory> {
        Ok(self.get(service)?.category)
    }

    pub fn kind_of(&self, service: &ServiceId, method: &MethodId) -> Result<PrimitiveKind> {
        Ok(self.get(service)?.kind_of(method))
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ServiceDefinition> {
        self.services.values()
    }

    pub fn contains(&self, service: &ServiceId) -> bool {
        self.services.contains_key(service)
    }
}

// ─── Communicators ────────────────────────────────────────────

/// Resolves the communicator for a (service, method) call.
pub struct CommunicatorRegistry {
    communicators: HashMap<String, Arc<dyn Communicator>>,
    service_routes: HashMap<ServiceId, String>,
    method_routes: HashMap<(ServiceId, MethodId), String>,
    default_route: Option<String>,
}

impl std::fmt::Debug for CommunicatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicatorRegistry")
            .field("communicators", &self.communicators.keys().collect::<Vec<_>>())
            .field("service_routes", &self.service_routes)
            .field("method_routes", &self.method_routes)
            .field("default_route", &self.default_route)
            .finish()
    }
}

#[derive(Default)]
pub struct CommunicatorRegistryBuilder {
    communicators: HashMap<String, Arc<dyn Communicator>>,
    duplicate_names: Vec<String>,
    service_routes: HashMap<ServiceId, BTreeSet<String>>,
    method_routes: HashMap<(ServiceId, MethodId), BTreeSet<String>>,
    default_route: Option<String>,
}

impl CommunicatorRegistryBuilder {
    pub fn communicator(mut self, name: impl Into<String>, c: Arc<dyn Communicator>) -> Self {
        let name = name.into();
        if self.communicators.insert(name.clone(), c).is_some() {
            self.duplicate_names.push(name);
        }
        self
    }

    pub fn route(mut self, service: ServiceId, communicator: impl Into<String>) -> Self {
        self.service_routes
            .entry(service)
            .or_default()
            .insert(communicator.into());
        self
    }

    pub fn route_method(
        mut self,
        service: ServiceId,
        method: MethodId,
        communicator: impl Into<String>,
    ) -> Self {
        self.method_routes
            .entry((service, method))
            .or_default()
            .insert(communicator.into());
        self
    }

    pub fn default_route(mut self, communicator: impl Into<String>) -> Self {
        self.default_route = Some(communicator.into());
        self
    }

    /// Routes from service definitions that name a communicator.
    pub fn routes_from(mut self, services: &ServiceRegistry) -> Self {
        for def in services.definitions() {
            if let Some(name) = &def.communicator {
                self = self.route(def.id.clone(), name.clone());
            }
        }
        self
    }

    /// Fails on duplicate communicator names, routes to unknown communicators
    /// and keys routed to more than one communicator.
    pub fn build(self) -> Result<CommunicatorRegistry> {
        if let Some(name) = self.duplicate_names.first() {
            return Err(FabricError::configuration(format!(
                "communicator {name} registered twice"
            )));
        }
        let known = |name: &str| -> Result<()> {
            if self.communicators.contains_key(name) {
                Ok(())
            } else {
                Err(FabricError::configuration(format!(
                    "route refers to unknown communicator {name}"
                )))
            }
        };

        let mut service_routes = HashMap::new();
        for (service, names) in &self.service_routes {
            let name = single(names, || format!("service {service}"))?;
            known(name)?;
            service_routes.insert(service.clone(), name.to_string());
        }
        let mut method_routes = HashMap::new();
        for ((service, method), names) in &self.method_routes {
            let name = single(names, || format!("method {service}.{method}"))?;
            known(name)?;
            method_routes.insert((service.clone(), method.clone()), name.to_string());
        }
        if let Some(name) = &self.default_route {
            known(name)?;
        }

        Ok(CommunicatorRegistry {
            communicators: self.communicators,
            service_routes,
            method_routes,
            default_route: self.default_route,
        })
    }
}

fn single(names: &BTreeSet<String>, what: impl FnOnce() -> String) -> Result<&str> {
    let mut iter = names.iter();
    match (iter.next(), iter.next()) {
        (Some(name), None) => Ok(name),
        _ => Err(FabricError::configuration(format!(
            "ambiguous communication method for {}: {:?}",
            what(),
            names
        ))),
    }
}

impl CommunicatorRegistry {
    pub fn builder() -> CommunicatorRegistryBuilder {
        CommunicatorRegistryBuilder::default()
    }

    /// Method route, then service route, then the default.
    pub fn resolve(&self, service: &ServiceId, method: &MethodId) -> Result<Arc<dyn Communicator>> {
        let name = self
            .method_routes
            .get(&(service.clone(), method.clone()))
            .or_else(|| self.service_routes.get(service))
            .or(self.default_route.as_ref())
            .ok_or_else(|| {
                FabricError::configuration(format!(
                    "no communication method for {service}.{method}"
                ))
            })?;
        self.get(name)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Communicator>> {
        self.communicators
            .get(name)
            .cloned()
            .ok_or_else(|| FabricError::configuration(format!("unknown communicator {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::{CommunicationTraits, InvokeOutcome, InvokePreferences};
    use crate::connector::ActiveRoutineInfo;
    use crate::intent::{ContinueRoutineIntent, ExecuteRoutineIntent};
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl Communicator for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn traits(&self) -> CommunicationTraits {
            CommunicationTraits::empty()
        }

        async fn invoke(
            &self,
            intent: &ExecuteRoutineIntent,
            _prefs: &InvokePreferences,
        ) -> Result<InvokeOutcome> {
            Ok(InvokeOutcome::Scheduled(ActiveRoutineInfo::for_intent(intent, "x")))
        }

        async fn continue_routine(&self, _intent: &ContinueRoutineIntent) -> Result<()> {
            Ok(())
        }

        async fn poll(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo> {
            Ok(info.clone())
        }
    }

    fn svc(name: &str) -> ServiceId {
        ServiceId::new(name)
    }

    #[test]
    fn resolution_order() {
        let registry = CommunicatorRegistry::builder()
            .communicator("fabric", Arc::new(Named("fabric")))
            .communicator("http", Arc::new(Named("http")))
            .communicator("grpc", Arc::new(Named("grpc")))
            .default_route("fabric")
            .route(svc("crm"), "http")
            .route_method(svc("crm"), MethodId::new("Stream"), "grpc")
            .build()
            .unwrap();

        let name = |s: &str, m: &str| {
            registry
                .resolve(&svc(s), &MethodId::new(m))
                .unwrap()
                .name()
                .to_string()
        };
        assert_eq!(name("billing", "Debit"), "fabric");
        assert_eq!(name("crm", "Lookup"), "http");
        assert_eq!(name("crm", "Stream"), "grpc");
    }

    #[test]
    fn ambiguous_route_is_fatal() {
        let err = CommunicatorRegistry::builder()
            .communicator("fabric", Arc::new(Named("fabric")))
            .communicator("http", Arc::new(Named("http")))
            .route(svc("crm"), "http")
            .route(svc("crm"), "fabric")
            .build()
            .unwrap_err();
        assert!(matches!(err, FabricError::Configuration(m) if m.contains("ambiguous")));
    }

    #[test]
    fn unknown_communicator_is_fatal() {
        let err = CommunicatorRegistry::builder()
            .route(svc("crm"), "http")
            .build()
            .unwrap_err();
        assert!(matches!(err, FabricError::Configuration(_)));
    }

    #[test]
    fn unresolvable_without_default() {
        let registry = CommunicatorRegistry::builder()
            .communicator("http", Arc::new(Named("http")))
            .build()
            .unwrap();
        assert!(registry.resolve(&svc("billing"), &MethodId::new("Debit")).is_err());
    }

    #[test]
    fn external_methods_default_to_commands() {
        let mut services = ServiceRegistry::new();
        services
            .define(
                ServiceDefinition::external("crm", "http")
                    .with_method("Lookup", PrimitiveKind::Query),
            )
            .unwrap();
        assert_eq!(
            services.kind_of(&svc("crm"), &MethodId::new("Lookup")).unwrap(),
            PrimitiveKind::Query
        );
        assert_eq!(
            services.kind_of(&svc("crm"), &MethodId::new("Update")).unwrap(),
            PrimitiveKind::Command
        );
        assert!(services.category(&svc("nope")).is_err());
        assert!(services.define(ServiceDefinition::local("crm")).is_err());
    }
}
