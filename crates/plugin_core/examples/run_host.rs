//! Minimal host lifecycle: discover manifests, load one plugin, submit a
//! job through the queue, and shut everything down cleanly.
//!
//! Point `CJM_PLUGIN_PATH` at a directory of plugin manifests before
//! running this, e.g.:
//!
//! ```text
//! CJM_PLUGIN_PATH=/path/to/plugins cargo run --example run_host
//! ```

use std::sync::Arc;
use std::time::Duration;

use plugin_core::{JobQueue, JobStatus, PluginManager};
use serde_json::Map;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let manager = Arc::new(PluginManager::new());
    manager.discover_manifests(&plugin_core::manifest::default_search_roots());

    let discovered = manager.discovered();
    let Some(meta) = discovered.first() else {
        println!("no plugins discovered; set CJM_PLUGIN_PATH to a manifest directory");
        return Ok(());
    };
    manager.load_plugin(meta, None).await?;

    let queue = JobQueue::with_defaults(manager.clone());
    queue.start();

    let job_id = queue.submit(&meta.name, 0, Map::new()).await?;
    let job = queue
        .wait_for_job(job_id, Some(Duration::from_secs(30)))
        .await?;

    match job.status {
        JobStatus::Completed => println!("result: {}", job.result.unwrap_or_default()),
        other => println!("job ended in state {other:?}: {:?}", job.error),
    }

    queue.stop().await;
    manager.unload_all().await;
    Ok(())
}
