//! Host-side handle to one child process.
//!
//! One [`PluginProxy`] is the sole conduit to one child: it owns the framed
//! transport, performs the handshake, correlates requests to responses by
//! `request_id`, and watches the child for unexpected exit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

use crate::error::{HostError, HostResult};
use crate::limits::{apply_limits, Limits};
use crate::manifest::PluginMeta;
use crate::protocol::{self, methods, Hello, Ready, RequestFrame, ResponseFrame};

/// Default bound on the handshake.
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(30);
/// Default grace period for a cooperative shutdown before escalating.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Waiter = oneshot::Sender<Result<ResponseFrame, String>>;

struct Shared {
    plugin_name: String,
    stdin: AsyncMutex<ChildStdin>,
    pending: StdMutex<HashMap<u64, Waiter>>,
    next_id: AtomicU64,
    broken: AtomicBool,
    exited: Notify,
    exited_flag: AtomicBool,
    pid: Option<u32>,
    shutdown_started: AtomicBool,
}

impl Shared {
    fn fail_all_pending(&self, message: &str) {
        let mut pending = self.pending.lock().unwrap();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(message.to_string()));
        }
    }

    fn mark_broken(&self, reason: &str) {
        if !self.broken.swap(true, Ordering::SeqCst) {
            warn!(plugin = %self.plugin_name, stage = "shutdown", reason, "proxy transport broken");
        }
        self.fail_all_pending(&format!("child exited: {reason}"));
    }

    fn mark_exited(&self, reason: &str) {
        self.exited_flag.store(true, Ordering::SeqCst);
        self.exited.notify_waiters();
        self.mark_broken(reason);
    }
}

/// Host-side handle to one running (or recently exited) plugin child.
pub struct PluginProxy {
    shared: Arc<Shared>,
}

impl PluginProxy {
    /// Launches the child per `meta.entry_point`, performs the hello/ready
    /// handshake, and returns a proxy ready to serve `call`.
    pub async fn spawn(
        meta: &PluginMeta,
        config: &Value,
        spawn_timeout: Duration,
    ) -> HostResult<Self> {
        let argv = meta.entry_argv();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HostError::Spawn {
                plugin: meta.name.clone(),
                message: "empty entry_point".into(),
            })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        apply_limits(&mut cmd, &Limits::from_meta(meta));

        let mut child: Child = cmd.spawn().map_err(|e| HostError::Spawn {
            plugin: meta.name.clone(),
            message: e.to_string(),
        })?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let mut stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let plugin_name = meta.name.clone();
        tokio::spawn(drain_stderr(plugin_name.clone(), stderr));

        let hello = Hello {
            protocol_version: protocol::PROTOCOL_VERSION.to_string(),
            config: config.clone(),
        };
        let handshake = async {
            protocol::write_frame(&mut stdin, &hello)
                .await
                .map_err(|e| e.to_string())?;
            protocol::read_frame::<_, Ready>(&mut stdout)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| "child closed stdout during handshake".to_string())
        };

        let ready = match tokio::time::timeout(spawn_timeout, handshake).await {
            Ok(Ok(ready)) => ready,
            Ok(Err(message)) => {
                let _ = child.start_kill();
                return Err(HostError::Spawn {
                    plugin: meta.name.clone(),
                    message,
                });
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(HostError::Spawn {
                    plugin: meta.name.clone(),
                    message: format!("handshake timed out after {spawn_timeout:?}"),
                });
            }
        };

        if ready.name != meta.name {
            let _ = child.start_kill();
            return Err(HostError::Spawn {
                plugin: meta.name.clone(),
                message: format!(
                    "manifest declares '{}' but child identified as '{}'",
                    meta.name, ready.name
                ),
            });
        }

        let pid = child.id();
        let shared = Arc::new(Shared {
            plugin_name: meta.name.clone(),
            stdin: AsyncMutex::new(stdin),
            pending: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            broken: AtomicBool::new(false),
            exited: Notify::new(),
            exited_flag: AtomicBool::new(false),
            pid,
            shutdown_started: AtomicBool::new(false),
        });

        tokio::spawn(read_loop(shared.clone(), stdout));
        tokio::spawn(watch_child(shared.clone(), child));

        debug!(plugin = %meta.name, stage = "handshake", version = %ready.version, "plugin handshake complete");
        Ok(Self { shared })
    }

    pub fn is_broken(&self) -> bool {
        self.shared.broken.load(Ordering::SeqCst)
    }

    /// Sends one request and suspends until a response frame, a timeout, or
    /// a transport failure resolves it.
    pub async fn call(&self, method: &str, payload: Value, timeout: Duration) -> HostResult<Value> {
        if self.is_broken() {
            return Err(HostError::Transport {
                plugin: self.shared.plugin_name.clone(),
                message: "proxy already broken".into(),
            });
        }

        let request_id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(request_id, tx);

        let frame = RequestFrame {
            request_id,
            method: method.to_string(),
            payload,
        };
        {
            let mut stdin = self.shared.stdin.lock().await;
            if let Err(e) = protocol::write_frame(&mut *stdin, &frame).await {
                self.shared.pending.lock().unwrap().remove(&request_id);
                self.shared.mark_broken(&e.to_string());
                return Err(HostError::Transport {
                    plugin: self.shared.plugin_name.clone(),
                    message: e.to_string(),
                });
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => response.into_result().map_err(|message| HostError::Plugin {
                plugin: self.shared.plugin_name.clone(),
                message,
            }),
            Ok(Ok(Err(message))) => Err(HostError::Transport {
                plugin: self.shared.plugin_name.clone(),
                message,
            }),
            Ok(Err(_)) => Err(HostError::Transport {
                plugin: self.shared.plugin_name.clone(),
                message: "waiter dropped without a response".into(),
            }),
            Err(_) => {
                // Timeout: forget the request. The transport is not at
                // fault, and a late response must be discarded silently.
                self.shared.pending.lock().unwrap().remove(&request_id);
                Err(HostError::Timeout {
                    plugin: self.shared.plugin_name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Thin wrapper over `call("execute", kwargs, timeout)`. The optional
    /// `action` kwarg routes to an alternate handler in the child; it is
    /// forwarded opaquely and never validated here.
    pub async fn execute(&self, kwargs: Map<String, Value>, timeout: Duration) -> HostResult<Value> {
        self.call(methods::EXECUTE, Value::Object(kwargs), timeout)
            .await
    }

    pub async fn get_schema(&self, timeout: Duration) -> HostResult<Value> {
        self.call(methods::GET_SCHEMA, Value::Null, timeout).await
    }

    pub async fn is_available(&self, timeout: Duration) -> HostResult<Value> {
        self.call(methods::IS_AVAILABLE, Value::Null, timeout).await
    }

    pub async fn get_current_config(&self, timeout: Duration) -> HostResult<Value> {
        self.call(methods::GET_CURRENT_CONFIG, Value::Null, timeout)
            .await
    }

    pub async fn initialize(&self, config: Value, timeout: Duration) -> HostResult<Value> {
        self.call(methods::INITIALIZE, config, timeout).await
    }

    /// Cooperative `shutdown` followed by an escalating signal sequence.
    /// Idempotent: a second call is a no-op.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shared.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.is_broken() {
            let _ = self.call(methods::SHUTDOWN, Value::Null, grace).await;
        }
        if self.wait_exited(grace).await {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.shared.pid {
            // Safety: `pid` was obtained from this proxy's own child and is
            // only ever signaled here, after the process is known to still
            // be running.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        if self.wait_exited(grace).await {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.shared.pid {
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
        self.wait_exited(grace).await;
    }

    async fn wait_exited(&self, timeout: Duration) -> bool {
        if self.shared.exited_flag.load(Ordering::SeqCst) {
            return true;
        }
        let notified = self.shared.exited.notified();
        tokio::select! {
            _ = notified => true,
            _ = tokio::time::sleep(timeout) => self.shared.exited_flag.load(Ordering::SeqCst),
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut stdout: tokio::process::ChildStdout) {
    loop {
        let frame: ResponseFrame = match protocol::read_frame(&mut stdout).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                shared.mark_exited("stream closed");
                return;
            }
            Err(e) => {
                shared.mark_broken(&format!("framing error: {e}"));
                return;
            }
        };

        let waiter = shared.pending.lock().unwrap().remove(&frame.request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(frame));
            }
            None => {
                let issued = shared.next_id.load(Ordering::SeqCst);
                if frame.request_id >= issued {
                    // This id was never allocated by us: a genuine protocol
                    // violation, not a late timeout response.
                    shared.mark_broken(&format!("unknown request_id {}", frame.request_id));
                    return;
                }
                // A timed-out request's late response. Discard silently.
            }
        }
    }
}

async fn watch_child(shared: Arc<Shared>, mut child: Child) {
    match child.wait().await {
        Ok(status) => shared.mark_exited(&status.to_string()),
        Err(e) => shared.mark_exited(&e.to_string()),
    }
}

async fn drain_stderr(plugin_name: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(plugin = %plugin_name, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PluginMeta;

    fn meta(name: &str, entry: &str) -> PluginMeta {
        PluginMeta {
            name: name.into(),
            version: "0.1.0".into(),
            entry_point: entry.into(),
            config_schema: Value::Null,
            resource_class: "cpu".into(),
            capabilities: vec![],
            db_path: None,
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn spawn_fails_fast_on_missing_executable() {
        let m = meta("demo", "/nonexistent/binary/path-xyz");
        let err = PluginProxy::spawn(&m, &Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Spawn { .. }));
    }
}
