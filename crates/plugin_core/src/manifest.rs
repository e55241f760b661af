//! Manifest discovery.
//!
//! Scans a set of directories for plugin manifests, validates the required
//! fields, and keeps a `discovered` set keyed by plugin name. Duplicate
//! names are resolved first-wins; later candidates are logged and skipped.
//! A malformed manifest never aborts discovery of its siblings.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shlex::Shlex;
use tracing::warn;

use crate::error::HostError;

/// Environment variable that overrides the default manifest search root.
pub const PLUGIN_PATH_ENV: &str = "CJM_PLUGIN_PATH";

/// Default manifest directory, relative to `$HOME` (or `%APPDATA%` on
/// Windows).
#[cfg(not(windows))]
fn default_root() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".cjm").join("plugins"))
}

#[cfg(windows)]
fn default_root() -> Option<PathBuf> {
    std::env::var("APPDATA")
        .ok()
        .map(|dir| PathBuf::from(dir).join("cjm").join("plugins"))
}

/// Resolves the manifest search roots: an env override if present,
/// otherwise the platform default.
pub fn default_search_roots() -> Vec<PathBuf> {
    if let Ok(dir) = std::env::var(PLUGIN_PATH_ENV) {
        return std::env::split_paths(&dir).collect();
    }
    default_root().into_iter().collect()
}

/// The static, immutable description of one plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMeta {
    pub name: String,
    pub version: String,
    /// How to launch the child: an interpreter command + module, or a bare
    /// executable path. Shell-quoted, parsed with [`shlex`].
    pub entry_point: String,
    /// JSON-Schema document (subset, see [`crate::schema`]) describing the
    /// plugin's configuration.
    #[serde(default)]
    pub config_schema: Value,
    /// Coarse resource label controlling queue exclusivity, e.g. `"gpu"`.
    #[serde(default)]
    pub resource_class: String,
    /// Declared capability strings, e.g. `"streaming"`, `"system_monitor"`.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Opaque path the host forwards to the plugin verbatim.
    #[serde(default)]
    pub db_path: Option<String>,
    /// Any additional manifest fields, preserved but not interpreted.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PluginMeta {
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name)
    }

    /// Splits `entry_point` into argv.
    pub fn entry_argv(&self) -> Vec<String> {
        Shlex::new(&self.entry_point).collect()
    }
}

fn parse_manifest(path: &Path, data: &str) -> Result<PluginMeta, HostError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let meta: PluginMeta = match ext {
        "json" => serde_json::from_str(data)
            .map_err(|e| HostError::Manifest(format!("{}: {e}", path.display())))?,
        _ => toml::from_str(data)
            .map_err(|e| HostError::Manifest(format!("{}: {e}", path.display())))?,
    };
    if meta.name.trim().is_empty() {
        return Err(HostError::Manifest(format!(
            "{}: missing required field 'name'",
            path.display()
        )));
    }
    if meta.version.trim().is_empty() {
        return Err(HostError::Manifest(format!(
            "{}: missing required field 'version'",
            path.display()
        )));
    }
    if meta.entry_argv().is_empty() {
        return Err(HostError::Manifest(format!(
            "{}: missing required field 'entry_point'",
            path.display()
        )));
    }
    Ok(meta)
}

fn manifest_file(dir: &Path) -> Option<PathBuf> {
    for name in ["manifest.toml", "plugin.toml", "manifest.json"] {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Scans one root directory (a directory of plugin directories, or a single
/// plugin directory) and returns every manifest parsed successfully.
fn scan_root(root: &Path) -> Vec<PluginMeta> {
    let mut found = Vec::new();
    if manifest_file(root).is_some() {
        if let Some(meta) = load_one(root) {
            found.push(meta);
        }
        return found;
    }
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %root.display(), error = %e, "cannot read manifest directory");
            return found;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(meta) = load_one(&path) {
                found.push(meta);
            }
        }
    }
    found
}

fn load_one(dir: &Path) -> Option<PluginMeta> {
    let path = manifest_file(dir)?;
    let data = match fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read manifest");
            return None;
        }
    };
    match parse_manifest(&path, &data) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping malformed manifest");
            None
        }
    }
}

/// Registry of plugins discovered on disk but not necessarily loaded.
///
/// `discover_manifests` is idempotent: it fully replaces `discovered` with
/// a fresh scan each time it is called.
#[derive(Debug, Default)]
pub struct ManifestRegistry {
    discovered: HashMap<String, PluginMeta>,
}

impl ManifestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rescans `roots`, rejecting duplicate names (first wins, subsequent
    /// candidates are logged and skipped).
    pub fn discover_manifests(&mut self, roots: &[PathBuf]) {
        let mut fresh: HashMap<String, PluginMeta> = HashMap::new();
        for root in roots {
            if !root.exists() {
                continue;
            }
            for meta in scan_root(root) {
                if fresh.contains_key(&meta.name) {
                    warn!(plugin = %meta.name, "duplicate manifest, keeping first discovered");
                    continue;
                }
                fresh.insert(meta.name.clone(), meta);
            }
        }
        self.discovered = fresh;
    }

    pub fn get(&self, name: &str) -> Option<&PluginMeta> {
        self.discovered.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginMeta> {
        self.discovered.values()
    }

    pub fn len(&self) -> usize {
        self.discovered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.discovered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, name: &str, extra: &str) {
        fs::write(
            dir.join("manifest.toml"),
            format!(
                "name = \"{name}\"\nversion = \"0.1.0\"\nentry_point = \"python worker.py\"\nresource_class = \"cpu\"\ncapabilities = [\"streaming\"]\n{extra}"
            ),
        )
        .unwrap();
    }

    #[test]
    fn discovers_valid_manifests() {
        let tmp = TempDir::new().unwrap();
        let plugin_dir = tmp.path().join("demo");
        fs::create_dir(&plugin_dir).unwrap();
        write_manifest(&plugin_dir, "demo", "");

        let mut registry = ManifestRegistry::new();
        registry.discover_manifests(&[tmp.path().to_path_buf()]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("demo").unwrap().resource_class, "cpu");
    }

    #[test]
    fn malformed_manifest_is_skipped_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let bad = tmp.path().join("bad");
        fs::create_dir(&bad).unwrap();
        fs::write(bad.join("manifest.toml"), "not valid toml = [").unwrap();

        let good = tmp.path().join("good");
        fs::create_dir(&good).unwrap();
        write_manifest(&good, "good", "");

        let mut registry = ManifestRegistry::new();
        registry.discover_manifests(&[tmp.path().to_path_buf()]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("good").is_some());
    }

    #[test]
    fn duplicate_names_first_wins() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        fs::create_dir(&a).unwrap();
        write_manifest(&a, "dup", "");
        let b = tmp.path().join("b");
        fs::create_dir(&b).unwrap();
        write_manifest(&b, "dup", "version = \"9.9.9\"\n");

        let mut registry = ManifestRegistry::new();
        registry.discover_manifests(&[tmp.path().to_path_buf()]);
        assert_eq!(registry.len(), 1);
        // whichever directory `read_dir` yields first wins; either manifest
        // is acceptable, but there must be exactly one.
        assert!(registry.get("dup").is_some());
    }

    #[test]
    fn discover_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("demo");
        fs::create_dir(&dir).unwrap();
        write_manifest(&dir, "demo", "");

        let mut registry = ManifestRegistry::new();
        registry.discover_manifests(&[tmp.path().to_path_buf()]);
        registry.discover_manifests(&[tmp.path().to_path_buf()]);
        assert_eq!(registry.len(), 1);
    }
}
