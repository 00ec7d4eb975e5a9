//! Generic versioned registry for orchestrations, activities and entities.
//!
//! A unified `Registry<H>` stores name -> version -> handler, with a
//! per-name `VersionPolicy` deciding what new starts resolve to. Activities
//! and entities register at 1.0.0 with Latest policy; orchestrations support
//! explicit versions. Registration is validated at build time: duplicates and
//! non-monotonic versions fail fast instead of surfacing at dispatch.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use semver::Version;

use super::entities::{EntityHandler, FnEntity};
use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::{Codec, Json};
use crate::{ActivityContext, OrchestrationContext};
use crate::runtime::entities::EntityContext;

/// Default version for activities, entities, and unversioned orchestrations.
const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

#[derive(Clone, Debug)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
    pub(crate) policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

// Manual Clone: H: ?Sized prevents the derive.
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, BTreeMap<Version, Arc<H>>>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type EntityRegistry = Registry<dyn EntityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;
pub type EntityRegistryBuilder = RegistryBuilder<dyn EntityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Resolve a handler for a new start using the name's version policy.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let policy = self
            .policy
            .lock()
            .expect("registry policy mutex poisoned")
            .get(name)
            .cloned()
            .unwrap_or(VersionPolicy::Latest);

        let result = match &policy {
            VersionPolicy::Latest => self
                .inner
                .get(name)
                .and_then(|versions| versions.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => self
                .inner
                .get(name)
                .and_then(|versions| versions.get(v))
                .map(|h| (v.clone(), Arc::clone(h))),
        };

        if result.is_none() {
            tracing::debug!(
                target: "duratask::runtime::registry",
                requested_name = %name,
                requested_policy = ?policy,
                registered_names = ?self.list_names(),
                "registry lookup miss"
            );
        }
        result
    }

    /// Resolve a handler pinned to an exact version (replay of an existing
    /// instance must run the version recorded in its history).
    pub fn resolve_handler_exact(&self, name: &str, version: &Version) -> Option<Arc<H>> {
        let result = self
            .inner
            .get(name)
            .and_then(|versions| versions.get(version))
            .cloned();
        if result.is_none() {
            tracing::debug!(
                target: "duratask::runtime::registry",
                requested_name = %name,
                requested_version = %version,
                available = ?self.list_versions(name),
                "registry exact lookup miss"
            );
        }
        result
    }

    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policy
            .lock()
            .expect("registry policy mutex poisoned")
            .insert(name.to_string(), policy);
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    /// Build, surfacing any registration errors collected along the way.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    pub fn merge_registry(mut self, other: Registry<H>, error_prefix: &str) -> Self {
        for (name, versions) in other.inner.iter() {
            let entry = self.map.entry(name.clone()).or_default();
            for (version, handler) in versions.iter() {
                if entry.contains_key(version) {
                    self.errors
                        .push(format!("duplicate {error_prefix} in merge: {name}@{version}"));
                } else {
                    entry.insert(version.clone(), handler.clone());
                }
            }
        }
        self
    }

    fn insert_checked(
        &mut self,
        name: String,
        version: Version,
        handler: Arc<H>,
        error_prefix: &str,
    ) {
        let entry = self.map.entry(name.clone()).or_default();
        if entry.contains_key(&version) {
            self.errors.push(format!(
                "duplicate {error_prefix} registration: {name}@{version}"
            ));
            return;
        }
        if let Some((latest, _)) = entry.iter().next_back() {
            if &version <= latest {
                self.errors.push(format!(
                    "non-monotonic {error_prefix} version for {name}: {version} is not later than {latest}"
                ));
                return;
            }
        }
        entry.insert(version, handler);
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert_checked(
            name.into(),
            DEFAULT_VERSION,
            Arc::new(FnOrchestration(f)),
            "orchestration",
        );
        self
    }

    pub fn register_versioned<F, Fut>(
        mut self,
        name: impl Into<String>,
        version: impl AsRef<str>,
        f: F,
    ) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        match Version::parse(version.as_ref()) {
            Ok(v) => {
                self.insert_checked(name, v, Arc::new(FnOrchestration(f)), "orchestration");
            }
            Err(e) => self
                .errors
                .push(format!("invalid orchestration version for {name}: {e}")),
        }
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: OrchestrationContext, raw: String| {
            let f = f.clone();
            async move {
                let input: In = Json::decode(&raw)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.register(name, wrapper)
    }

    pub fn merge(self, other: OrchestrationRegistry) -> Self {
        self.merge_registry(other, "orchestration")
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        self.insert_checked(name.clone(), DEFAULT_VERSION, Arc::new(FnActivity(f)), "activity");
        self.policy.insert(name, VersionPolicy::Latest);
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: ActivityContext, raw: String| {
            let f = f.clone();
            async move {
                let input: In = Json::decode(&raw)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.register(name, wrapper)
    }

    pub fn merge(self, other: ActivityRegistry) -> Self {
        self.merge_registry(other, "activity")
    }
}

impl EntityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(EntityContext, String, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        self.insert_checked(name.clone(), DEFAULT_VERSION, Arc::new(FnEntity(f)), "entity");
        self.policy.insert(name, VersionPolicy::Latest);
        self
    }

    pub fn merge(self, other: EntityRegistry) -> Self {
        self.merge_registry(other, "entity")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_fails_at_build() {
        let result = OrchestrationRegistry::builder()
            .register("Same", |_ctx, _in| async move { Ok(String::new()) })
            .register("Same", |_ctx, _in| async move { Ok(String::new()) })
            .build_result();
        let err = result.err().expect("duplicate must fail");
        assert!(err.contains("duplicate orchestration registration: Same@1.0.0"));
    }

    #[test]
    fn non_monotonic_version_fails_at_build() {
        let result = OrchestrationRegistry::builder()
            .register_versioned("Flow", "2.0.0", |_ctx, _in| async move { Ok(String::new()) })
            .register_versioned("Flow", "1.5.0", |_ctx, _in| async move { Ok(String::new()) })
            .build_result();
        assert!(result.is_err());
    }

    #[test]
    fn latest_policy_resolves_highest_version() {
        let registry = OrchestrationRegistry::builder()
            .register_versioned("Flow", "1.0.0", |_ctx, _in| async move { Ok("v1".into()) })
            .register_versioned("Flow", "2.0.0", |_ctx, _in| async move { Ok("v2".into()) })
            .build();
        let (version, _) = registry.resolve_handler("Flow").unwrap();
        assert_eq!(version, Version::new(2, 0, 0));

        registry.set_version_policy("Flow", VersionPolicy::Exact(Version::new(1, 0, 0)));
        let (version, _) = registry.resolve_handler("Flow").unwrap();
        assert_eq!(version, Version::new(1, 0, 0));
    }

    #[test]
    fn exact_resolution_misses_unknown_version() {
        let registry = OrchestrationRegistry::builder()
            .register_versioned("Flow", "1.0.0", |_ctx, _in| async move { Ok(String::new()) })
            .build();
        assert!(registry
            .resolve_handler_exact("Flow", &Version::new(3, 0, 0))
            .is_none());
        assert!(registry
            .resolve_handler_exact("Flow", &Version::new(1, 0, 0))
            .is_some());
    }
}
