//! mpv JSON IPC driver — the production player backend.
//!
//! ```text
//!   MpvPlayer::spawn()
//!         │
//!         ├── writer_task    ← receives IpcRequest via mpsc, serialises → socket
//!         ├── reader_task    ← reads JSON lines from socket, matches
//!         │                    request_id responses to pending oneshots
//!         └── serve_requests ← translates PlayerRequest to mpv commands
//! ```
//!
//! The reconciler never sees any of this; it talks to the `PlayerHandle`
//! returned by `spawn`, and an in-memory fake can service the same handle
//! in tests.  Unix only (mpv IPC over a unix domain socket).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use telecast_proto::config::{data_dir, MpvConfig};

use crate::player::{PlayerHandle, PlayerRequest};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

struct IpcRequest {
    req_id: u64,
    /// Serialised JSON line, '\n' included.
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

#[derive(Clone)]
struct IpcHandle {
    tx: mpsc::Sender<IpcRequest>,
}

impl IpcHandle {
    async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(IpcRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(std::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={req_id}"))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={req_id}"))?
    }
}

/// Owns the mpv child process.
pub struct MpvPlayer {
    socket_path: PathBuf,
    process: tokio::process::Child,
}

impl MpvPlayer {
    /// Spawn mpv and return the capability handle the reconciler consumes.
    ///
    /// `--keep-open=yes` makes mpv pause on the last frame at end of file
    /// instead of unloading, which is exactly the hold behaviour the
    /// reconciler expects at an item boundary.
    pub async fn spawn(config: &MpvConfig) -> anyhow::Result<(Self, PlayerHandle)> {
        tokio::fs::create_dir_all(data_dir()).await?;
        let socket_path = data_dir().join(format!("mpv-{}.sock", std::process::id()));
        let _ = tokio::fs::remove_file(&socket_path).await;

        let binary = config
            .binary
            .clone()
            .unwrap_or_else(|| PathBuf::from("mpv"));
        let ipc_arg = format!("--input-ipc-server={}", socket_path.display());
        let process = tokio::process::Command::new(&binary)
            .arg("--idle=yes")
            .arg("--force-window=yes")
            .arg("--keep-open=yes")
            .arg("--quiet")
            .arg(&ipc_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        info!(pid = ?process.id(), "mpv: spawned");

        // Wait for the IPC socket to appear.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let ipc = start_io_tasks(stream);

        let (handle, request_rx) = PlayerHandle::channel();
        tokio::spawn(serve_requests(ipc, request_rx));

        Ok((
            Self {
                socket_path,
                process,
            },
            handle,
        ))
    }

    pub async fn kill(&mut self) {
        let _ = self.process.kill().await;
        let _ = tokio::fs::remove_file(&self.socket_path).await;
    }
}

fn start_io_tasks(stream: UnixStream) -> IpcHandle {
    let (read_half, write_half) = stream.into_split();
    let reader = BufReader::new(read_half);

    // pending map: req_id → reply channel.  Writer inserts, reader resolves.
    let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<IpcRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, Arc::clone(&pending)));
    tokio::spawn(reader_task(reader, pending));

    IpcHandle { tx: cmd_tx }
}

/// Translate `PlayerRequest`s into mpv IPC commands.
async fn serve_requests(ipc: IpcHandle, mut rx: mpsc::Receiver<PlayerRequest>) {
    while let Some(req) = rx.recv().await {
        match req {
            PlayerRequest::Load { src, reply } => {
                let result = ipc.send(json!(["loadfile", src])).await.map(|_| ());
                let _ = reply.send(result);
            }
            PlayerRequest::SeekTo { secs, reply } => {
                let result = ipc
                    .send(json!(["set_property", "time-pos", secs]))
                    .await
                    .map(|_| ());
                let _ = reply.send(result);
            }
            PlayerRequest::Play { reply } => {
                let result = ipc
                    .send(json!(["set_property", "pause", false]))
                    .await
                    .map(|_| ());
                let _ = reply.send(result);
            }
            PlayerRequest::Pause { reply } => {
                let result = ipc
                    .send(json!(["set_property", "pause", true]))
                    .await
                    .map(|_| ());
                let _ = reply.send(result);
            }
            PlayerRequest::CurrentTime { reply } => {
                let result = match ipc.send(json!(["get_property", "time-pos"])).await {
                    Ok(resp) => Ok(resp["data"].as_f64()),
                    // mpv answers "property unavailable" while nothing is
                    // loaded; that is a valid "no time yet", not a failure.
                    Err(e) if e.to_string().contains("property unavailable") => Ok(None),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
        }
    }
    debug!("mpv: request service exiting");
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{trimmed}': {e}");
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error");
                            Err(anyhow::anyhow!("mpv error: {err}"))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={req_id}");
                    }
                }
                // Unsolicited events (start-file, end-file, …) are not needed;
                // the reconciler polls time-pos on its own tick.
            }
            Err(e) => {
                warn!("mpv reader: read error: {e}");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {e}")));
                }
                break;
            }
        }
    }
}

async fn writer_task<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<IpcRequest>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register the reply channel before writing so the reader can match it.
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {e}");
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {e}")));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}
