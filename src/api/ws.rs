//! WebSocket surface (spec §4.5, §6): the multiplexed control socket plus
//! per-device terminal and log-tail sockets. One reader task and one writer
//! task per connection; only the writer task drives the ping/pong
//! keep-alive (spec §5 concurrency model).

use crate::cra::ExecChunk;
use crate::domain::{CreateVmRequest, LogSource, ProvisionStep};
use crate::error::CoreError;
use crate::service::session::{ControlDirective, LogBatcher, SessionKind, parse_resize_directive};
use crate::utils::state::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ControlRequest {
    #[serde(rename = "LIST_VM")]
    ListVm,
    #[serde(rename = "CREATE_VM")]
    CreateVm { vm: CreateVmRequest },
    #[serde(rename = "INSTALL_APK")]
    InstallApk { name: String, apk: String },
    #[serde(rename = "CREATE_VM_LOG")]
    CreateVmLog { name: String },
}

/// `GET /api/v1/ws`: one connection, four message types (spec §6).
pub async fn control_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_control_ws(socket, state))
}

async fn handle_control_ws(mut socket: WebSocket, state: Arc<AppState>) {
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let req = match serde_json::from_str::<ControlRequest>(&text) {
            Ok(req) => req,
            Err(_) => {
                let unknown = json!({ "type": "UNKNOWN", "raw": text.as_str() });
                if socket.send(Message::Text(unknown.to_string().into())).await.is_err() {
                    break;
                }
                continue;
            }
        };

        if let ControlRequest::CreateVm { vm } = req {
            if create_vm_with_progress(&mut socket, &state, vm).await.is_err() {
                break;
            }
            continue;
        }

        let reply = dispatch(req, &state).await;
        if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
            break;
        }
    }
}

/// Drives `CREATE_VM` specially so the caller sees acknowledgement-style
/// `CREATE_VM_PROGRESS` envelopes (spec §4.4.3: `{step: 0..5, has_error,
/// error?}`, one per completed pipeline stage) ahead of the final
/// `CREATE_VM` result, instead of only learning the outcome once
/// provisioning finishes. `ProvisionStep` tracks the pipeline at a finer
/// grain internally; `wire_step` collapses it onto the six stages the
/// client expects.
async fn create_vm_with_progress(
    socket: &mut WebSocket,
    state: &Arc<AppState>,
    vm: CreateVmRequest,
) -> Result<(), axum::Error> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProvisionStep>();
    let vmm = state.vmm.clone();
    let create = tokio::spawn(async move { vmm.create_with_progress(vm, Some(tx)).await });

    // Acknowledgement-style: a stage's `step` is sent once the *next* stage
    // begins (or, for the last stage, once the whole pipeline finishes).
    let mut completed: Option<u8> = None;
    while let Some(step) = rx.recv().await {
        let wire_step = step.wire_step();
        if let Some(prev) = completed {
            if prev != wire_step {
                send_progress(socket, prev, false, None).await?;
            }
        }
        completed = Some(wire_step);
    }

    let reply = match create.await {
        Ok(Ok(item)) => {
            if let Some(prev) = completed {
                send_progress(socket, prev, false, None).await?;
            }
            json!({ "type": "CREATE_VM", "vm": item })
        }
        Ok(Err(err)) => {
            let step = completed.unwrap_or_else(|| preflight_failure_step(&err));
            send_progress(socket, step, true, Some(err.to_string())).await?;
            error_envelope("CREATE_VM", &err)
        }
        Err(_) => {
            let err = CoreError::InternalInvariant("provisioning task panicked".to_string());
            send_progress(socket, completed.unwrap_or(0), true, Some(err.to_string())).await?;
            error_envelope("CREATE_VM", &err)
        }
    };
    socket.send(Message::Text(reply.to_string().into())).await
}

/// Which wire `step` a failure that happens before any `ProvisionStep` is
/// reported (i.e. during preflight, before index allocation) is attributed
/// to (spec §4.4.3 "Preflight rules").
fn preflight_failure_step(err: &CoreError) -> u8 {
    match err {
        CoreError::Duplicate(_) => 1,
        CoreError::InvalidInput(_) => 2,
        _ => 0,
    }
}

async fn send_progress(
    socket: &mut WebSocket,
    step: u8,
    has_error: bool,
    error: Option<String>,
) -> Result<(), axum::Error> {
    let mut envelope = json!({ "type": "CREATE_VM_PROGRESS", "step": step, "has_error": has_error });
    if let Some(error) = error {
        envelope["error"] = json!(error);
    }
    socket.send(Message::Text(envelope.to_string().into())).await
}

async fn dispatch(req: ControlRequest, state: &Arc<AppState>) -> serde_json::Value {
    match req {
        ControlRequest::ListVm => match state.vmm.list().await {
            Ok(items) => json!({ "type": "LIST_VM", "vms": items }),
            Err(err) => error_envelope("LIST_VM", &err),
        },
        ControlRequest::CreateVm { vm } => match state.vmm.create_with_progress(vm, None).await {
            Ok(item) => json!({ "type": "CREATE_VM", "vm": item }),
            Err(err) => error_envelope("CREATE_VM", &err),
        },
        ControlRequest::InstallApk { name, apk } => {
            match state.storage.list_apks(&name).await {
                Ok(apks) if apks.iter().any(|a| a.name == apk) => {
                    json!({ "type": "INSTALL_APK", "name": name, "apk": apk, "status": "ready" })
                }
                Ok(_) => error_envelope(
                    "INSTALL_APK",
                    &CoreError::NotFound(format!("apk not uploaded: {apk}")),
                ),
                Err(err) => json!({
                    "type": "INSTALL_APK",
                    "error": err.to_string(),
                }),
            }
        }
        ControlRequest::CreateVmLog { name } => {
            json!({ "type": "CREATE_VM_LOG", "name": name, "path": format!("/vms/{name}/log/launcher") })
        }
    }
}

fn error_envelope(kind: &str, err: &CoreError) -> serde_json::Value {
    json!({ "type": kind, "error": err.to_string() })
}

/// `GET /vms/:name/ws`: the interactive terminal (spec §4.4.1).
pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal_ws(socket, state, name))
}

async fn handle_terminal_ws(socket: WebSocket, state: Arc<AppState>, device_name: String) {
    let handle = state
        .sessions
        .register(&device_name, SessionKind::Terminal)
        .await;
    let container_name = state.config.container_name(&device_name);

    let attached = match state
        .runtime
        .exec_attached_tty(&container_name, vec!["/bin/bash".to_string(), "-l".to_string()])
        .await
    {
        Ok(a) => a,
        Err(err) => {
            let (mut sender, _) = socket.split();
            let _ = sender
                .send(Message::Text(err.as_ws_text().into()))
                .await;
            state.sessions.unregister(handle.id).await;
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();
    let mut output = attached.output;
    let mut input = attached.input;
    let exec_id = attached.exec_id.clone();
    let cancel = handle.cancel.clone();
    let ping_interval = Duration::from_secs(state.config.ws_ping_interval_secs);
    let pong_timeout = Duration::from_secs(state.config.ws_pong_timeout_secs);
    let last_pong = Arc::new(std::sync::Mutex::new(tokio::time::Instant::now()));

    let runtime = state.runtime.clone();
    let reader_pong = last_pong.clone();
    let reader = async {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                incoming = receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match parse_resize_directive(&text) {
                                Some(ControlDirective::Resize(resize)) => {
                                    let _ = runtime.resize_tty(&exec_id, resize.cols, resize.rows).await;
                                }
                                Some(ControlDirective::Malformed) => {
                                    tracing::warn!(%text, "malformed control directive, ignoring");
                                }
                                None => {
                                    use tokio::io::AsyncWriteExt;
                                    if input.write_all(text.as_bytes()).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            use tokio::io::AsyncWriteExt;
                            if input.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            *reader_pong.lock().unwrap() = tokio::time::Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {}
                    }
                }
            }
        }
        cancel.cancel();
    };

    let writer = async {
        let mut ticker = tokio::time::interval(ping_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if last_pong.lock().unwrap().elapsed() > pong_timeout {
                        tracing::warn!(device = %device_name, "pong timeout, closing terminal session");
                        break;
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                chunk = output.next() => {
                    match chunk {
                        Some(Ok(ExecChunk::Stdout(bytes))) | Some(Ok(ExecChunk::Stderr(bytes))) => {
                            if sender.send(Message::Binary(bytes.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(_)) | None => break,
                    }
                }
            }
        }
        cancel.cancel();
    };

    tokio::join!(reader, writer);

    // spec §4.4.1 cleanup: reap the shell even if the websocket closed
    // without an orderly "exit" from the client side.
    use tokio::io::AsyncWriteExt;
    let _ = input.write_all(b"exit\r").await;
    let _ = input.shutdown().await;
    let _ = runtime
        .kill_by_command_signature(&container_name, "/bin/bash")
        .await;

    state.sessions.unregister(handle.id).await;
}

/// `GET /vms/:name/log/:source`: the log tailer (spec §4.4.2).
pub async fn log_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path((name, source)): Path<(String, String)>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_log_ws(socket, state, name, source))
}

#[derive(Serialize)]
struct LogLine<'a> {
    source: &'a str,
    data: String,
}

async fn handle_log_ws(socket: WebSocket, state: Arc<AppState>, device_name: String, source: String) {
    let (mut sender, mut receiver) = socket.split();

    let Some(log_source) = LogSource::parse(&source) else {
        let _ = sender
            .send(Message::Text(
                format!("error: unknown log source {source}").into(),
            ))
            .await;
        return;
    };

    let handle = state
        .sessions
        .register(&device_name, SessionKind::LogTail)
        .await;
    let container_name = state.config.container_name(&device_name);
    let cf_instance = match state.vmm.cf_instance(&device_name).await {
        Ok(idx) => idx,
        Err(err) => {
            let _ = sender.send(Message::Text(err.as_ws_text().into())).await;
            state.sessions.unregister(handle.id).await;
            return;
        }
    };
    let path = format!(
        "/home/vsoc-01/cuttlefish_runtime.{cf_instance}/{}",
        log_source.file_name()
    );

    let tail_cmd = vec![
        "tail".to_string(),
        "-f".to_string(),
        "-n".to_string(),
        "+1".to_string(),
        path,
    ];
    let kill_signature = tail_cmd.join(" ");

    let attached = match state
        .runtime
        .exec_attached(&container_name, tail_cmd)
        .await
    {
        Ok(a) => a,
        Err(err) => {
            let _ = sender.send(Message::Text(err.as_ws_text().into())).await;
            state.sessions.unregister(handle.id).await;
            return;
        }
    };

    let mut output = attached.output;
    let mut batcher = LogBatcher::new(state.config.log_tail_flush_bytes);
    let mut ticker = tokio::time::interval(Duration::from_millis(state.config.log_tail_flush_millis));
    let mut ping_ticker = tokio::time::interval(Duration::from_secs(state.config.ws_ping_interval_secs));
    let pong_timeout = Duration::from_secs(state.config.ws_pong_timeout_secs);
    let mut last_pong = tokio::time::Instant::now();
    let cancel = handle.cancel.clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = tokio::time::Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = ping_ticker.tick() => {
                if last_pong.elapsed() > pong_timeout {
                    tracing::warn!(device = %device_name, "pong timeout, closing log-tail session");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Some(flushed) = batcher.flush() {
                    if send_log_line(&mut sender, &source, flushed).await.is_err() {
                        break;
                    }
                }
            }
            chunk = output.next() => {
                match chunk {
                    Some(Ok(ExecChunk::Stdout(bytes))) | Some(Ok(ExecChunk::Stderr(bytes))) => {
                        if let Some(flushed) = batcher.push(&bytes) {
                            if send_log_line(&mut sender, &source, flushed).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Err(_)) | None => break,
                }
            }
        }
    }

    // spec §4.4.2 cleanup: same contract as the terminal, with the full
    // `tail` invocation as the kill signature.
    let _ = state
        .runtime
        .kill_by_command_signature(&container_name, &kill_signature)
        .await;

    state.sessions.unregister(handle.id).await;
}

async fn send_log_line(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    source: &str,
    bytes: Vec<u8>,
) -> Result<(), axum::Error> {
    let line = LogLine {
        source,
        data: String::from_utf8_lossy(&bytes).into_owned(),
    };
    sender
        .send(Message::Text(serde_json::to_string(&line).unwrap_or_default().into()))
        .await
}
