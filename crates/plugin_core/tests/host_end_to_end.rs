//! End-to-end coverage driving the public API the way a caller would:
//! discover manifests on disk, load plugins, run jobs through the queue.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use plugin_core::{HostConfig, JobQueue, JobStatus, PluginManager};
use serde_json::{json, Map};
use tempfile::TempDir;

fn write_manifest(dir: &std::path::Path, name: &str, class: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join("manifest.toml"),
        format!(
            "name = \"{name}\"\n\
             version = \"0.1.0\"\n\
             entry_point = \"{bin} {name} 0.1.0\"\n\
             resource_class = \"{class}\"\n\
             capabilities = [\"streaming\"]\n",
            bin = env!("CARGO_BIN_EXE_mock_plugin"),
        ),
    )
    .unwrap();
}

fn fast_config() -> HostConfig {
    HostConfig {
        spawn_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(2),
        call_timeout: Duration::from_secs(5),
        max_history: 50,
        max_concurrent: 1,
    }
}

#[tokio::test]
async fn discover_load_execute_and_unload() {
    let tmp = TempDir::new().unwrap();
    write_manifest(&tmp.path().join("echoer"), "echoer", "cpu");

    let manager = PluginManager::with_config(Arc::new(plugin_core::NullScheduler), fast_config());
    manager.discover_manifests(&[tmp.path().to_path_buf()]);

    let meta = manager.find_discovered("echoer").expect("discovered");
    assert!(manager.load_plugin(&meta, None).await.unwrap());

    let mut kwargs = Map::new();
    kwargs.insert("value".into(), json!(42));
    let result = manager.execute_plugin("echoer", kwargs).await.unwrap();
    assert_eq!(result["echo"]["value"], json!(42));

    let plugins = manager.list_plugins().await;
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].name, "echoer");
    assert!(!plugins[0].broken);

    manager.unload_all().await;
}

#[tokio::test]
async fn disable_then_execute_is_rejected() {
    let tmp = TempDir::new().unwrap();
    write_manifest(&tmp.path().join("gate"), "gate", "cpu");

    let manager = PluginManager::with_config(Arc::new(plugin_core::NullScheduler), fast_config());
    manager.discover_manifests(&[tmp.path().to_path_buf()]);
    let meta = manager.find_discovered("gate").unwrap();
    manager.load_plugin(&meta, None).await.unwrap();

    manager.disable_plugin("gate").await.unwrap();
    let err = manager.execute_plugin("gate", Map::new()).await.unwrap_err();
    assert!(matches!(err, plugin_core::HostError::Disabled(_)));

    manager.unload_all().await;
}

#[tokio::test]
async fn queue_enforces_priority_and_resource_exclusivity_together() {
    let tmp = TempDir::new().unwrap();
    write_manifest(&tmp.path().join("gpu_one"), "gpu_one", "gpu");
    write_manifest(&tmp.path().join("gpu_two"), "gpu_two", "gpu");
    write_manifest(&tmp.path().join("cpu_one"), "cpu_one", "cpu");

    let manager = Arc::new(PluginManager::with_config(
        Arc::new(plugin_core::NullScheduler),
        fast_config(),
    ));
    manager.discover_manifests(&[tmp.path().to_path_buf()]);
    for name in ["gpu_one", "gpu_two", "cpu_one"] {
        let meta = manager.find_discovered(name).unwrap();
        manager.load_plugin(&meta, None).await.unwrap();
    }

    let queue = JobQueue::with_defaults(manager.clone());
    queue.start();

    // The GPU class is exclusive: gpu_two must wait for gpu_one even
    // though it's unrelated to the cpu-class job running concurrently.
    let mut sleepy = Map::new();
    sleepy.insert("action".into(), json!("sleep"));
    sleepy.insert("ms".into(), json!(60));
    let gpu_job_1 = queue.submit("gpu_one", 0, sleepy).await.unwrap();
    let gpu_job_2 = queue.submit("gpu_two", 0, Map::new()).await.unwrap();
    let cpu_job = queue.submit("cpu_one", 0, Map::new()).await.unwrap();

    let gpu_1 = queue
        .wait_for_job(gpu_job_1, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let gpu_2 = queue
        .wait_for_job(gpu_job_2, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let cpu = queue
        .wait_for_job(cpu_job, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(gpu_1.status, JobStatus::Completed);
    assert_eq!(gpu_2.status, JobStatus::Completed);
    assert_eq!(cpu.status, JobStatus::Completed);
    assert!(gpu_2.started_at.unwrap() >= gpu_1.completed_at.unwrap());
    // The cpu-class job did not have to wait on the gpu class.
    assert!(cpu.started_at.unwrap() < gpu_1.completed_at.unwrap());

    queue.stop().await;
    manager.unload_all().await;
}

#[tokio::test]
async fn config_round_trip_and_rejection() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("configurable");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("manifest.toml"),
        format!(
            "name = \"configurable\"\n\
             version = \"0.1.0\"\n\
             entry_point = \"{bin} configurable 0.1.0\"\n\
             resource_class = \"cpu\"\n\
             [config_schema]\n\
             type = \"object\"\n\
             required = []\n\
             additionalProperties = false\n\
             [config_schema.properties.mode]\n\
             type = \"string\"\n\
             default = \"balanced\"\n",
            bin = env!("CARGO_BIN_EXE_mock_plugin"),
        ),
    )
    .unwrap();

    let manager = PluginManager::with_config(Arc::new(plugin_core::NullScheduler), fast_config());
    manager.discover_manifests(&[tmp.path().to_path_buf()]);
    let meta = manager.find_discovered("configurable").unwrap();
    manager.load_plugin(&meta, None).await.unwrap();

    let cfg = manager.get_plugin_config("configurable").await.unwrap();
    assert_eq!(cfg["mode"], json!("balanced"));

    manager
        .update_plugin_config("configurable", json!({"mode": "fast"}))
        .await
        .unwrap();
    let cfg = manager.get_plugin_config("configurable").await.unwrap();
    assert_eq!(cfg["mode"], json!("fast"));

    let err = manager
        .update_plugin_config("configurable", json!({"mode": 7}))
        .await
        .unwrap_err();
    assert!(matches!(err, plugin_core::HostError::ConfigValidation { .. }));
    let cfg = manager.get_plugin_config("configurable").await.unwrap();
    assert_eq!(cfg["mode"], json!("fast"));

    manager.unload_all().await;
}
