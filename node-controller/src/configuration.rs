use crate::{rate_limiter::BackoffSettings, reconcile_engine::EngineSettings};
use anyhow::Context;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::{net::SocketAddr, str::FromStr, time::Duration};

/// Settings shared by all controllers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ControllerSettings {
    pub engine: EngineSettings,
    pub backoff: BackoffSettings,
}

impl ControllerSettings {
    /// Read the settings through `lookup`, falling back to the defaults for unset variables.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let workers: usize = parse_var(&lookup, "CONTROLLER_WORKERS", defaults.engine.workers)?;
        if workers == 0 {
            anyhow::bail!("CONTROLLER_WORKERS must be at least 1");
        }
        let cache_sync_timeout = parse_var(
            &lookup,
            "CACHE_SYNC_TIMEOUT_SECS",
            defaults.engine.cache_sync_timeout.as_secs(),
        )?;
        let base_delay = parse_var(
            &lookup,
            "RETRY_BASE_DELAY_MS",
            defaults.backoff.base_delay.as_millis() as u64,
        )?;
        let max_delay = parse_var(
            &lookup,
            "RETRY_MAX_DELAY_SECS",
            defaults.backoff.max_delay.as_secs(),
        )?;
        let max_retries = parse_var(
            &lookup,
            "RETRY_MAX_ATTEMPTS",
            defaults.backoff.max_retries,
        )?;
        Ok(Self {
            engine: EngineSettings {
                workers,
                cache_sync_timeout: Duration::from_secs(cache_sync_timeout),
            },
            backoff: BackoffSettings {
                base_delay: Duration::from_millis(base_delay),
                max_delay: Duration::from_secs(max_delay),
                max_retries,
            },
        })
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .parse()
            .with_context(|| format!("invalid value '{}' for {}", value, name)),
        None => Ok(default),
    }
}

/// Read a trimmed, non-empty environment variable.
pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn metrics_addr<F>(lookup: F) -> anyhow::Result<SocketAddr>
where
    F: Fn(&str) -> Option<String>,
{
    let addr = lookup("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
    let port = lookup("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
    format!("{}:{}", addr, port)
        .parse()
        .with_context(|| format!("invalid metrics listen address {}:{}", addr, port))
}

#[derive(Clone)]
pub(crate) struct Configuration {
    pub client: Client,
    /// Namespace of pods and virtual machines, `None` to watch all namespaces.
    pub watch_namespace: Option<String>,
    pub controller: ControllerSettings,
}

impl Configuration {
    pub fn new(client: Client) -> anyhow::Result<Self> {
        let watch_namespace = env_var("WATCH_NAMESPACE").filter(|ns| ns != "*");
        match &watch_namespace {
            Some(ns) => info!("Controller is only watching resources in namespace {}", ns),
            None => info!("Controller is watching resources in all namespaces"),
        }
        Ok(Configuration {
            client,
            watch_namespace,
            controller: ControllerSettings::from_lookup(env_var)?,
        })
    }

    /// API of a namespaced resource kind, restricted to the watch namespace if set.
    pub fn namespaced_api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + DeserializeOwned,
        K::DynamicType: Default,
    {
        match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    pub fn cluster_api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::ClusterResourceScope> + DeserializeOwned,
        K::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let settings = ControllerSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(ControllerSettings::default(), settings);
        assert_eq!(2, settings.engine.workers);
        assert_eq!(Duration::from_secs(60), settings.engine.cache_sync_timeout);
        assert_eq!(Duration::from_millis(5), settings.backoff.base_delay);
        assert_eq!(Duration::from_secs(1000), settings.backoff.max_delay);
        assert_eq!(15, settings.backoff.max_retries);
    }

    #[test]
    fn overrides() {
        let settings = ControllerSettings::from_lookup(lookup(&[
            ("CONTROLLER_WORKERS", "8"),
            ("CACHE_SYNC_TIMEOUT_SECS", "5"),
            ("RETRY_BASE_DELAY_MS", "100"),
            ("RETRY_MAX_DELAY_SECS", "30"),
            ("RETRY_MAX_ATTEMPTS", "3"),
        ]))
        .unwrap();
        assert_eq!(8, settings.engine.workers);
        assert_eq!(Duration::from_secs(5), settings.engine.cache_sync_timeout);
        assert_eq!(Duration::from_millis(100), settings.backoff.base_delay);
        assert_eq!(Duration::from_secs(30), settings.backoff.max_delay);
        assert_eq!(3, settings.backoff.max_retries);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = ControllerSettings::from_lookup(lookup(&[("RETRY_MAX_ATTEMPTS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("RETRY_MAX_ATTEMPTS"), "{}", err);
        assert!(
            ControllerSettings::from_lookup(lookup(&[("CONTROLLER_WORKERS", "0")])).is_err()
        );
        assert!(
            ControllerSettings::from_lookup(lookup(&[("CONTROLLER_WORKERS", "-1")])).is_err()
        );
    }

    #[test]
    fn metrics_listen_address() {
        assert_eq!(
            "0.0.0.0:9000".parse::<SocketAddr>().unwrap(),
            metrics_addr(lookup(&[])).unwrap()
        );
        assert_eq!(
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap(),
            metrics_addr(lookup(&[
                ("METRICS_LISTEN_ADDR", "127.0.0.1"),
                ("METRICS_LISTEN_PORT", "8080")
            ]))
            .unwrap()
        );
        assert!(metrics_addr(lookup(&[("METRICS_LISTEN_PORT", "http")])).is_err());
    }
}
