//! Top-level façade over loaded plugins.
//!
//! Indexes proxies by plugin name, validates configuration against
//! manifest schemas, and is the single place `execute` calls — direct or
//! queued — pass through, so the scheduler sees every one of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{HostError, HostResult};
use crate::host::HostConfig;
use crate::manifest::{ManifestRegistry, PluginMeta};
use crate::proxy::PluginProxy;
use crate::scheduler::{NullScheduler, Scheduler};
use crate::schema;

/// A plugin currently loaded: its static metadata, its live proxy, and its
/// validated configuration.
pub struct LoadedPlugin {
    pub meta: PluginMeta,
    pub proxy: Arc<PluginProxy>,
    pub config: Value,
    pub enabled: bool,
}

/// Snapshot of one loaded plugin, safe to hand to a caller outside the
/// manager's lock.
#[derive(Debug, Clone)]
pub struct LoadedPluginView {
    pub name: String,
    pub version: String,
    pub resource_class: String,
    pub capabilities: Vec<String>,
    pub enabled: bool,
    pub broken: bool,
}

/// Façade over discovery, loaded plugins, and the registered scheduler.
pub struct PluginManager {
    registry: std::sync::RwLock<ManifestRegistry>,
    plugins: RwLock<HashMap<String, LoadedPlugin>>,
    system_monitor: std::sync::RwLock<Option<String>>,
    scheduler: Arc<dyn Scheduler>,
    config: HostConfig,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::with_scheduler(Arc::new(NullScheduler))
    }

    pub fn with_scheduler(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            registry: std::sync::RwLock::new(ManifestRegistry::new()),
            plugins: RwLock::new(HashMap::new()),
            system_monitor: std::sync::RwLock::new(None),
            scheduler,
            config: HostConfig::from_env(),
        }
    }

    pub fn with_config(scheduler: Arc<dyn Scheduler>, config: HostConfig) -> Self {
        Self {
            registry: std::sync::RwLock::new(ManifestRegistry::new()),
            plugins: RwLock::new(HashMap::new()),
            system_monitor: std::sync::RwLock::new(None),
            scheduler,
            config,
        }
    }

    pub fn config(&self) -> HostConfig {
        self.config
    }

    /// Rescans the given manifest roots. Idempotent.
    pub fn discover_manifests(&self, roots: &[std::path::PathBuf]) {
        self.registry.write().unwrap().discover_manifests(roots);
    }

    /// Snapshot of every discovered-but-not-necessarily-loaded plugin.
    pub fn discovered(&self) -> Vec<PluginMeta> {
        self.registry.read().unwrap().iter().cloned().collect()
    }

    pub fn find_discovered(&self, name: &str) -> Option<PluginMeta> {
        self.registry.read().unwrap().get(name).cloned()
    }

    /// Spawns `meta`'s child, validates `config` against its schema, and
    /// registers it. Returns `Ok(false)` if the name is already loaded
    /// (not an error); config-validation and spawn failures are returned
    /// as typed errors.
    pub async fn load_plugin(&self, meta: &PluginMeta, config: Option<Value>) -> HostResult<bool> {
        if self.plugins.read().await.contains_key(&meta.name) {
            return Ok(false);
        }

        let requested = config.unwrap_or(Value::Object(Map::new()));
        let validated = schema::apply_defaults_and_validate(&meta.config_schema, &requested)
            .map_err(|message| HostError::ConfigValidation {
                plugin: meta.name.clone(),
                message,
            })?;

        let proxy = PluginProxy::spawn(meta, &validated, self.config.spawn_timeout).await?;
        if let Err(e) = proxy.initialize(validated.clone(), self.config.call_timeout).await {
            proxy.shutdown(self.config.shutdown_grace).await;
            return Err(e);
        }

        info!(plugin = %meta.name, stage = "spawn", "plugin loaded");
        self.plugins.write().await.insert(
            meta.name.clone(),
            LoadedPlugin {
                meta: meta.clone(),
                proxy: Arc::new(proxy),
                config: validated,
                enabled: true,
            },
        );
        Ok(true)
    }

    /// Idempotent: returns `false`, not an error, if `name` isn't loaded.
    pub async fn unload_plugin(&self, name: &str) -> bool {
        let removed = self.plugins.write().await.remove(name);
        match removed {
            Some(plugin) => {
                plugin.proxy.shutdown(self.config.shutdown_grace).await;
                info!(plugin = name, stage = "shutdown", "plugin unloaded");
                true
            }
            None => false,
        }
    }

    /// Best-effort: unloads every plugin, never propagating a failure.
    pub async fn unload_all(&self) {
        let names: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        for name in names {
            self.unload_plugin(&name).await;
        }
    }

    /// Synchronous-style convenience wrapper. In this implementation it is
    /// simply `execute_plugin_async` under another name — see DESIGN.md for
    /// why no separate blocking path is provided.
    pub async fn execute_plugin(&self, name: &str, kwargs: Map<String, Value>) -> HostResult<Value> {
        self.execute_plugin_async(name, kwargs).await
    }

    /// The entry point the job queue uses to run one job.
    pub async fn execute_plugin_async(
        &self,
        name: &str,
        kwargs: Map<String, Value>,
    ) -> HostResult<Value> {
        let (proxy, timeout) = {
            let plugins = self.plugins.read().await;
            let plugin = plugins
                .get(name)
                .ok_or_else(|| HostError::NotLoaded(name.to_string()))?;
            if !plugin.enabled {
                return Err(HostError::Disabled(name.to_string()));
            }
            (plugin.proxy.clone(), self.config.call_timeout)
        };

        self.scheduler.on_execute_begin(name);
        let result = proxy.execute(kwargs, timeout).await;
        self.scheduler.on_execute_end(name, result.is_ok());
        result
    }

    pub async fn get_plugin_config(&self, name: &str) -> HostResult<Value> {
        self.plugins
            .read()
            .await
            .get(name)
            .map(|p| p.config.clone())
            .ok_or_else(|| HostError::NotLoaded(name.to_string()))
    }

    /// Merges `partial` into the current config, re-validates, and on
    /// success re-initializes the child with the merged map. On failure
    /// the old config is retained untouched.
    pub async fn update_plugin_config(&self, name: &str, partial: Value) -> HostResult<Value> {
        let (proxy, merged_candidate) = {
            let plugins = self.plugins.read().await;
            let plugin = plugins
                .get(name)
                .ok_or_else(|| HostError::NotLoaded(name.to_string()))?;
            let mut merged = plugin.config.clone();
            merge_object(&mut merged, &partial);
            (plugin.proxy.clone(), merged)
        };

        let meta = {
            let plugins = self.plugins.read().await;
            plugins.get(name).map(|p| p.meta.config_schema.clone())
        }
        .ok_or_else(|| HostError::NotLoaded(name.to_string()))?;

        let validated = schema::apply_defaults_and_validate(&meta, &merged_candidate).map_err(
            |message| HostError::ConfigValidation {
                plugin: name.to_string(),
                message,
            },
        )?;

        proxy
            .initialize(validated.clone(), self.config.call_timeout)
            .await?;

        if let Some(plugin) = self.plugins.write().await.get_mut(name) {
            plugin.config = validated.clone();
        }
        Ok(validated)
    }

    /// Validates `cfg` against `name`'s schema without mutating anything.
    pub async fn validate_plugin_config(&self, name: &str, cfg: &Value) -> HostResult<Result<(), String>> {
        let schema = self
            .plugins
            .read()
            .await
            .get(name)
            .map(|p| p.meta.config_schema.clone())
            .ok_or_else(|| HostError::NotLoaded(name.to_string()))?;
        Ok(schema::validate(&schema, cfg))
    }

    pub async fn enable_plugin(&self, name: &str) -> HostResult<()> {
        self.set_enabled(name, true).await
    }

    pub async fn disable_plugin(&self, name: &str) -> HostResult<()> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> HostResult<()> {
        let mut plugins = self.plugins.write().await;
        let plugin = plugins
            .get_mut(name)
            .ok_or_else(|| HostError::NotLoaded(name.to_string()))?;
        plugin.enabled = enabled;
        Ok(())
    }

    pub async fn check_streaming_support(&self, name: &str) -> HostResult<bool> {
        self.plugins
            .read()
            .await
            .get(name)
            .map(|p| p.meta.has_capability("streaming"))
            .ok_or_else(|| HostError::NotLoaded(name.to_string()))
    }

    pub async fn get_streaming_plugins(&self) -> Vec<String> {
        self.plugins
            .read()
            .await
            .values()
            .filter(|p| p.meta.has_capability("streaming"))
            .map(|p| p.meta.name.clone())
            .collect()
    }

    pub async fn get_all_plugin_schemas(&self) -> HashMap<String, Value> {
        self.plugins
            .read()
            .await
            .values()
            .map(|p| (p.meta.name.clone(), p.meta.config_schema.clone()))
            .collect()
    }

    /// Registers `name` as the plugin whose `execute(action="get_stats")`
    /// answers `get_global_stats`.
    pub async fn register_system_monitor(&self, name: &str) -> HostResult<()> {
        if !self.plugins.read().await.contains_key(name) {
            return Err(HostError::NotLoaded(name.to_string()));
        }
        *self.system_monitor.write().unwrap() = Some(name.to_string());
        Ok(())
    }

    pub async fn get_global_stats(&self) -> HostResult<Value> {
        let name = self
            .system_monitor
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| HostError::NotLoaded("system monitor".to_string()))?;
        let mut kwargs = Map::new();
        kwargs.insert("action".to_string(), Value::String("get_stats".to_string()));
        self.execute_plugin_async(&name, kwargs).await
    }

    pub async fn list_plugins(&self) -> Vec<LoadedPluginView> {
        self.plugins
            .read()
            .await
            .values()
            .map(|p| LoadedPluginView {
                name: p.meta.name.clone(),
                version: p.meta.version.clone(),
                resource_class: p.meta.resource_class.clone(),
                capabilities: p.meta.capabilities.clone(),
                enabled: p.enabled,
                broken: p.proxy.is_broken(),
            })
            .collect()
    }

    /// Resource class of a loaded plugin, used by the job queue for
    /// exclusivity bookkeeping.
    pub async fn resource_class_of(&self, name: &str) -> Option<String> {
        self.plugins
            .read()
            .await
            .get(name)
            .map(|p| p.meta.resource_class.clone())
    }

    /// Fails fast with `NotLoaded`/`Disabled` without actually executing.
    /// Used by the job queue to validate a submission before queuing it.
    pub async fn ensure_executable(&self, name: &str) -> HostResult<()> {
        let plugins = self.plugins.read().await;
        let plugin = plugins
            .get(name)
            .ok_or_else(|| HostError::NotLoaded(name.to_string()))?;
        if !plugin.enabled {
            return Err(HostError::Disabled(name.to_string()));
        }
        Ok(())
    }

    pub async fn is_loaded_and_enabled(&self, name: &str) -> bool {
        self.plugins
            .read()
            .await
            .get(name)
            .map(|p| p.enabled)
            .unwrap_or(false)
    }

    pub fn call_timeout(&self) -> Duration {
        self.config.call_timeout
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_object(base: &mut Value, partial: &Value) {
    let (Value::Object(base_map), Value::Object(partial_map)) = (base, partial) else {
        return;
    };
    for (key, value) in partial_map {
        base_map.insert(key.clone(), value.clone());
    }
}
