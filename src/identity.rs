//! Process-scoped identity reported by heartbeats

use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    fn new(key: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceIdentity {
    pub service: String,
    pub service_instance: String,
    pub namespace: String,
    pub properties: Vec<KeyValue>,
}

impl InstanceIdentity {
    pub fn from_config(config: &Config) -> Self {
        Self {
            service: config.service_name.clone(),
            service_instance: config.service_instance.clone(),
            namespace: config.namespace.clone(),
            properties: collect_properties(&config.namespace),
        }
    }
}

fn collect_properties(namespace: &str) -> Vec<KeyValue> {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();

    let mut properties = vec![
        KeyValue::new("language", "rust"),
        KeyValue::new("OS Name", std::env::consts::OS),
        KeyValue::new("Process No.", std::process::id().to_string()),
        KeyValue::new("hostname", hostname),
    ];

    if !namespace.is_empty() {
        properties.push(KeyValue::new("namespace", namespace));
    }

    properties
}

/// Identity shared between the supervisor and its transport
#[derive(Clone, Debug)]
pub struct SharedIdentity {
    inner: Arc<RwLock<InstanceIdentity>>,
    refresh: Arc<PropsRefresh>,
}

impl SharedIdentity {
    pub fn new(identity: InstanceIdentity, report_factor: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(identity)),
            refresh: Arc::new(PropsRefresh::new(report_factor)),
        }
    }

    pub fn snapshot(&self) -> InstanceIdentity {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn refresh(&self) -> &PropsRefresh {
        &self.refresh
    }

    /// Re-derive PID-scoped properties, e.g. in a forked child. With
    /// `rename`, the instance gets a `-child-<pid>` suffix. The refresh
    /// counter is primed so the next heartbeat re-sends properties.
    pub fn reinitialize(&self, rename: bool) -> InstanceIdentity {
        let pid = std::process::id();
        let mut identity = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if rename {
            let parent = identity
                .service_instance
                .split("-child-")
                .next()
                .unwrap_or_default()
                .to_string();
            identity.service_instance = format!("{}-child-{}", parent, pid);
        }
        identity.properties = collect_properties(&identity.namespace);
        self.refresh.prime();

        identity.clone()
    }
}

/// Counts heartbeats and says when instance properties are due again.
/// The first heartbeat is always due.
#[derive(Debug)]
pub struct PropsRefresh {
    counter: AtomicU64,
    factor: u64,
}

impl PropsRefresh {
    pub fn new(factor: u64) -> Self {
        let factor = factor.max(1);
        Self {
            counter: AtomicU64::new(factor - 1),
            factor,
        }
    }

    /// Count one heartbeat; true on the first call and every `factor`-th after it.
    pub fn tick(&self) -> bool {
        let count = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        count % self.factor == 0
    }

    /// Make the next `tick` return true.
    pub fn prime(&self) {
        self.counter.store(self.factor - 1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_include_namespace_when_set() {
        let config = Config {
            namespace: "prod".to_string(),
            ..Config::default()
        };
        let identity = InstanceIdentity::from_config(&config);

        assert!(identity.properties.contains(&KeyValue::new("language", "rust")));
        assert!(identity.properties.contains(&KeyValue::new("namespace", "prod")));

        let identity = InstanceIdentity::from_config(&Config::default());
        assert!(!identity.properties.iter().any(|kv| kv.key == "namespace"));
    }

    #[test]
    fn test_refresh_fires_once_per_factor() {
        let refresh = PropsRefresh::new(10);

        let fired_at: Vec<usize> = (1..=30).filter(|_| refresh.tick()).collect();
        assert_eq!(fired_at, vec![1, 11, 21]);

        let refresh = PropsRefresh::new(1);
        assert!((0..5).all(|_| refresh.tick()));
    }

    #[test]
    fn test_reinitialize_renames_child_once() {
        let config = Config {
            service_instance: "abc".to_string(),
            ..Config::default()
        };
        let shared = SharedIdentity::new(InstanceIdentity::from_config(&config), 10);

        let pid = std::process::id();
        let child = shared.reinitialize(true);
        assert_eq!(child.service_instance, format!("abc-child-{}", pid));

        let again = shared.reinitialize(true);
        assert_eq!(again.service_instance, format!("abc-child-{}", pid));
        assert!(shared.refresh().tick());
    }

    #[test]
    fn test_prime_after_missed_refresh_retries_next_tick() {
        let refresh = PropsRefresh::new(10);
        assert!(refresh.tick());
        assert!(!refresh.tick());

        refresh.prime();
        assert!(refresh.tick());
        assert!(!refresh.tick());
    }

    #[test]
    fn test_hostname_property_is_resolved() {
        let identity = InstanceIdentity::from_config(&Config::default());
        let hostname = identity
            .properties
            .iter()
            .find(|kv| kv.key == "hostname")
            .map(|kv| kv.value.clone());
        assert!(hostname.is_some_and(|h| !h.is_empty()));
    }

    #[test]
    fn test_reinitialize_without_rename_keeps_name() {
        let config = Config {
            service_instance: "abc".to_string(),
            ..Config::default()
        };
        let shared = SharedIdentity::new(InstanceIdentity::from_config(&config), 3);

        let identity = shared.reinitialize(false);
        assert_eq!(identity.service_instance, "abc");
        assert_eq!(shared.snapshot(), identity);
    }
}
