//! Browser transport layer
//!
//! Launches the browser process and speaks DevTools protocol over a
//! hand-rolled WebSocket client. Detectable protocol commands are filtered
//! before they reach the wire.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use base64::Engine;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{Error, Result};

/// Commands that are never sent (highly detectable by anti-bot scripts)
const BLOCKED_COMMANDS: &[&str] = &[
    "Runtime.enable",
    "Runtime.disable",
    "HeapProfiler.enable",
    "Profiler.enable",
    "Debugger.enable",
    "Console.enable",
];

/// Commands that work but leave observable traces
const RISKY_COMMANDS: &[&str] = &[
    "Emulation.setDeviceMetricsOverride",
    "Network.setUserAgentOverride",
];

mod opcode {
    pub const TEXT: u8 = 0x1;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xA;
}

/// A protocol event scoped to one target session
#[derive(Debug, Clone)]
pub struct Event {
    pub method: String,
    pub params: Value,
}

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;
type Subscribers = Arc<StdMutex<HashMap<String, mpsc::UnboundedSender<Event>>>>;

/// Build and send one masked text frame
async fn write_frame(writer: &mut OwnedWriteHalf, data: &[u8]) -> std::io::Result<()> {
    let len = data.len();
    let mut frame = Vec::with_capacity(14 + len);

    frame.push(0x80 | opcode::TEXT);

    if len < 126 {
        frame.push(0x80 | len as u8);
    } else if len < 65536 {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(0x80 | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    // Clients must mask every frame
    let mask: [u8; 4] = rand::random();
    frame.extend_from_slice(&mask);
    frame.extend(data.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));

    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read one frame, returning (opcode, payload)
async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let op = header[0] & 0x0F;
    let masked = (header[1] & 0x80) != 0;
    let mut len = (header[1] & 0x7F) as usize;

    if len == 126 {
        let mut ext = [0u8; 2];
        reader.read_exact(&mut ext).await?;
        len = u16::from_be_bytes(ext) as usize;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        reader.read_exact(&mut ext).await?;
        len = u64::from_be_bytes(ext) as usize;
    }

    let mask = if masked {
        let mut m = [0u8; 4];
        reader.read_exact(&mut m).await?;
        Some(m)
    } else {
        None
    };

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok((op, payload))
}

/// DevTools transport over one WebSocket connection
pub struct Transport {
    child: Mutex<Child>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    next_id: AtomicU64,
    pending: Pending,
    subscribers: Subscribers,
}

impl Transport {
    /// Connect to the browser's DevTools endpoint
    pub async fn connect(child: Child, ws_url: &str) -> Result<Self> {
        let url = ws_url.trim_start_matches("ws://");
        let (host_port, path) = url.split_once('/').unwrap_or((url, ""));

        let stream = TcpStream::connect(host_port)
            .await
            .map_err(|e| Error::transport_io("Failed to connect to browser", e))?;
        stream.set_nodelay(true).ok();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // WebSocket upgrade handshake
        let key = base64::engine::general_purpose::STANDARD.encode(rand::random::<[u8; 16]>());
        let handshake = format!(
            "GET /{path} HTTP/1.1\r\n\
             Host: {host_port}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n"
        );
        write_half
            .write_all(handshake.as_bytes())
            .await
            .map_err(|e| Error::transport_io("Handshake write failed", e))?;

        let mut status = String::new();
        reader
            .read_line(&mut status)
            .await
            .map_err(|e| Error::transport_io("Handshake read failed", e))?;
        if !status.contains("101") {
            return Err(Error::transport(format!(
                "WebSocket handshake rejected: {}",
                status.trim()
            )));
        }
        // Drain the remaining response headers
        loop {
            let mut line = String::new();
            reader
                .read_line(&mut line)
                .await
                .map_err(|e| Error::transport_io("Handshake read failed", e))?;
            if line == "\r\n" || line.is_empty() {
                break;
            }
        }

        tracing::debug!("WebSocket connected to {}", ws_url);

        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(StdMutex::new(HashMap::new()));
        let writer = Arc::new(Mutex::new(write_half));

        tokio::spawn(Self::read_loop(
            reader,
            Arc::clone(&writer),
            Arc::clone(&pending),
            Arc::clone(&subscribers),
        ));

        Ok(Self {
            child: Mutex::new(child),
            writer,
            next_id: AtomicU64::new(1),
            pending,
            subscribers,
        })
    }

    async fn read_loop(
        mut reader: BufReader<OwnedReadHalf>,
        writer: Arc<Mutex<OwnedWriteHalf>>,
        pending: Pending,
        subscribers: Subscribers,
    ) {
        loop {
            let (op, payload) = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("WebSocket read ended: {}", e);
                    break;
                }
            };

            match op {
                opcode::TEXT => {
                    let msg: Value = match serde_json::from_slice(&payload) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!("Unparseable protocol message: {}", e);
                            continue;
                        }
                    };

                    if let Some(id) = msg.get("id").and_then(Value::as_u64) {
                        let result = if let Some(error) = msg.get("error") {
                            Err(Error::driver(
                                "response",
                                error
                                    .get("message")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unknown"),
                            ))
                        } else {
                            Ok(msg.get("result").cloned().unwrap_or_else(|| json!({})))
                        };

                        let sender = pending.lock().expect("pending lock").remove(&id);
                        if let Some(sender) = sender {
                            let _ = sender.send(result);
                        }
                    } else if let Some(method) = msg.get("method").and_then(Value::as_str) {
                        let session = msg.get("sessionId").and_then(Value::as_str);
                        if let Some(session) = session {
                            let tx = subscribers
                                .lock()
                                .expect("subscribers lock")
                                .get(session)
                                .cloned();
                            if let Some(tx) = tx {
                                let _ = tx.send(Event {
                                    method: method.to_string(),
                                    params: msg
                                        .get("params")
                                        .cloned()
                                        .unwrap_or_else(|| json!({})),
                                });
                            }
                        }
                    }
                }
                opcode::PING => {
                    let mut w = writer.lock().await;
                    let mask: [u8; 4] = rand::random();
                    let mut frame = vec![0x80 | opcode::PONG, 0x80];
                    frame.extend_from_slice(&mask);
                    let _ = w.write_all(&frame).await;
                }
                opcode::CLOSE => {
                    tracing::debug!("WebSocket closed by browser");
                    break;
                }
                _ => {}
            }
        }

        // Fail anything still waiting for a response
        let mut pending = pending.lock().expect("pending lock");
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(Error::transport("Connection closed")));
        }
    }

    /// Send a browser-scope command
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.send_raw(None, method, params).await
    }

    /// Send a command scoped to a target session
    pub async fn send_to_session(
        &self,
        session_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        self.send_raw(Some(session_id), method, params).await
    }

    async fn send_raw(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        if BLOCKED_COMMANDS.contains(&method) {
            tracing::debug!("Blocked detectable command: {}", method);
            return Ok(json!({}));
        }
        if RISKY_COMMANDS.contains(&method) {
            tracing::debug!("Sending risky command: {}", method);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);

        let mut msg = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            msg["sessionId"] = json!(session_id);
        }
        let data = serde_json::to_string(&msg)?;

        {
            let mut writer = self.writer.lock().await;
            write_frame(&mut writer, data.as_bytes())
                .await
                .map_err(|e| Error::transport_io("WebSocket write failed", e))?;
        }

        tracing::trace!("Sent command: {} (id={})", method, id);

        rx.await
            .map_err(|_| Error::transport("Response channel closed"))?
    }

    /// Register for events addressed to a session
    pub fn subscribe(&self, session_id: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscribers lock")
            .insert(session_id.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, session_id: &str) {
        self.subscribers
            .lock()
            .expect("subscribers lock")
            .remove(session_id);
    }

    /// Close the connection and kill the browser process
    pub async fn close(&self) {
        {
            let mut writer = self.writer.lock().await;
            let mask: [u8; 4] = rand::random();
            let mut frame = vec![0x80 | opcode::CLOSE, 0x80];
            frame.extend_from_slice(&mask);
            let _ = writer.write_all(&frame).await;
        }

        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // Best-effort kill if close() was never awaited
        if let Ok(mut child) = self.child.try_lock() {
            let _ = child.start_kill();
        }
    }
}

/// Launch the browser and return the process plus its DevTools endpoint
pub async fn launch_browser(path: &Path, args: &[String]) -> Result<(Child, String)> {
    let mut cmd = Command::new(path);
    cmd.args(args)
        .arg("--remote-debugging-port=0")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Launch(format!("Failed to spawn browser: {}", e)))?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Launch("No stderr from browser".into()))?;
    let mut lines = BufReader::new(stderr).lines();

    // The browser prints: DevTools listening on ws://127.0.0.1:PORT/devtools/browser/GUID
    let ws_url = tokio::time::timeout(Duration::from_secs(30), async {
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::trace!("browser stderr: {}", line);
            if line.contains("DevTools listening on") {
                if let Some(start) = line.find("ws://") {
                    return Some(line[start..].trim().to_string());
                }
            }
        }
        None
    })
    .await
    .map_err(|_| Error::Launch("Timed out waiting for DevTools endpoint".into()))?
    .ok_or_else(|| Error::Launch("No DevTools endpoint in browser output".into()))?;

    // Keep draining stderr so the pipe never blocks the browser
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::trace!("browser stderr: {}", line);
        }
    });

    tracing::info!("DevTools endpoint: {}", ws_url);

    Ok((child, ws_url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_command_list() {
        assert!(BLOCKED_COMMANDS.contains(&"Runtime.enable"));
        assert!(!BLOCKED_COMMANDS.contains(&"Runtime.evaluate"));
    }
}
