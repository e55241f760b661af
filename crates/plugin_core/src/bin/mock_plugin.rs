//! Reference child implementing the worker protocol.
//!
//! Used only by this crate's integration tests as a stand-in for a real
//! plugin. Takes its declared `name` and `version` as argv so a test
//! manifest can pin them to whatever it's asserting against.
//!
//! Recognised `execute` actions beyond the default echo:
//! - `action: "crash"` exits the process immediately, mid-request.
//! - `action: "sleep"` with `ms: <u64>` sleeps before answering, for
//!   exercising proxy call timeouts.
//! - `action: "get_stats"` returns a fixed stats map, standing in for the
//!   `system_monitor` capability.

use std::time::Duration;

use plugin_core::protocol::{self, methods, Hello, Ready, RequestFrame, ResponseFrame};
use serde_json::{json, Value};
use tokio::io::{stdin, stdout};

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let name = args.next().unwrap_or_else(|| "mock".to_string());
    let version = args.next().unwrap_or_else(|| "0.1.0".to_string());

    let mut stdin = stdin();
    let mut stdout = stdout();

    let _hello: Hello = match protocol::read_frame(&mut stdin).await {
        Ok(Some(h)) => h,
        _ => return,
    };
    let ready = Ready {
        name: name.clone(),
        version,
    };
    if protocol::write_frame(&mut stdout, &ready).await.is_err() {
        return;
    }

    let mut config = Value::Null;

    loop {
        let request: RequestFrame = match protocol::read_frame(&mut stdin).await {
            Ok(Some(r)) => r,
            Ok(None) => return,
            Err(_) => return,
        };

        let response = match request.method.as_str() {
            methods::INITIALIZE => {
                config = request.payload.clone();
                ResponseFrame::ok(request.request_id, json!({"ok": true}))
            }
            methods::GET_CURRENT_CONFIG => ResponseFrame::ok(request.request_id, config.clone()),
            methods::GET_SCHEMA => ResponseFrame::ok(request.request_id, json!({})),
            methods::IS_AVAILABLE => ResponseFrame::ok(request.request_id, json!(true)),
            methods::EXECUTE => handle_execute(&request).await,
            methods::SHUTDOWN => {
                let resp = ResponseFrame::ok(request.request_id, json!({"ok": true}));
                let _ = protocol::write_frame(&mut stdout, &resp).await;
                return;
            }
            other => ResponseFrame::err(request.request_id, format!("unknown method '{other}'")),
        };

        if protocol::write_frame(&mut stdout, &response).await.is_err() {
            return;
        }
    }
}

async fn handle_execute(request: &RequestFrame) -> ResponseFrame {
    let action = request.payload.get("action").and_then(Value::as_str);
    match action {
        Some("crash") => std::process::exit(1),
        Some("sleep") => {
            let ms = request
                .payload
                .get("ms")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            ResponseFrame::ok(request.request_id, json!({"slept_ms": ms}))
        }
        Some("get_stats") => ResponseFrame::ok(
            request.request_id,
            json!({"cpu_percent": 12.5, "gpu_memory_used_mb": 2048}),
        ),
        Some("fail") => ResponseFrame::err(request.request_id, "plugin reported failure"),
        _ => ResponseFrame::ok(
            request.request_id,
            json!({"echo": request.payload.clone()}),
        ),
    }
}
