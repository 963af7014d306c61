//! A scripted fake Redis peer for integration tests, grounded on the
//! teacher's `glide-core/tests/utilities/mocks.rs` `ServerMock`: a listener
//! that auto-answers the ready-check chatter (`INFO`) and otherwise hands
//! back whatever bytes the test scripts, in order. Adapted to pure async
//! Tokio since this crate's controller never blocks a std thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

enum ServerCmd {
    Write(Vec<u8>),
    Kill,
}

/// A single fake server, bound to an ephemeral localhost port, that accepts
/// connections one at a time (closing one before the next is accepted,
/// mirroring a real reconnect).
pub struct ScriptedServer {
    port: u16,
    raw_log: Arc<Mutex<Vec<u8>>>,
    ready_gate: Arc<AtomicBool>,
    cmd_tx: mpsc::UnboundedSender<ServerCmd>,
}

impl ScriptedServer {
    /// Binds the listener and spawns its accept loop. `INFO` replies are
    /// held back until [`ScriptedServer::release_ready`] is called, so
    /// tests can deterministically race offline command submission against
    /// the ready check.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind scripted server");
        let port = listener.local_addr().expect("local addr").port();
        let raw_log = Arc::new(Mutex::new(Vec::new()));
        let ready_gate = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let task_log = raw_log.clone();
        let task_gate = ready_gate.clone();
        tokio::spawn(run_server(listener, task_log, task_gate, cmd_rx));

        ScriptedServer {
            port,
            raw_log,
            ready_gate,
            cmd_tx,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Lets the next (and all subsequent) `INFO` probes receive their
    /// canned reply, unblocking the ready check.
    pub fn release_ready(&self) {
        self.ready_gate.store(true, Ordering::SeqCst);
    }

    /// Queues raw bytes to be written to the current connection, in order.
    pub fn push_response(&self, raw: impl Into<Vec<u8>>) {
        let _ = self.cmd_tx.send(ServerCmd::Write(raw.into()));
    }

    /// Drops the current connection, as if the network had died. The
    /// accept loop keeps running and will pick up the client's reconnect.
    pub fn kill_connection(&self) {
        let _ = self.cmd_tx.send(ServerCmd::Kill);
    }

    /// All bytes received on the current connection since it was accepted
    /// (the log is cleared each time a new connection is accepted).
    pub fn raw_log(&self) -> Vec<u8> {
        self.raw_log.lock().unwrap().clone()
    }

    /// Polls [`ScriptedServer::raw_log`] until it ends with `expected` or
    /// `timeout` elapses.
    pub async fn wait_for_tail(&self, expected: &[u8], timeout: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.raw_log().ends_with(expected) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for wire tail {:?}; log so far: {:?}",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.raw_log())
                );
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

async fn run_server(
    listener: TcpListener,
    raw_log: Arc<Mutex<Vec<u8>>>,
    ready_gate: Arc<AtomicBool>,
    mut cmd_rx: mpsc::UnboundedReceiver<ServerCmd>,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        raw_log.lock().unwrap().clear();
        let (mut read_half, mut write_half) = stream.into_split();

        loop {
            let mut buf = [0u8; 8192];
            tokio::select! {
                read_result = read_half.read(&mut buf) => {
                    match read_result {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let chunk = buf[..n].to_vec();
                            auto_reply(&chunk, &ready_gate, &mut write_half).await;
                            raw_log.lock().unwrap().extend_from_slice(&chunk);
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ServerCmd::Write(bytes)) => {
                            let _ = write_half.write_all(&bytes).await;
                        }
                        Some(ServerCmd::Kill) | None => break,
                    }
                }
            }
        }
    }
}

async fn auto_reply(
    chunk: &[u8],
    ready_gate: &AtomicBool,
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
) {
    let text = String::from_utf8_lossy(chunk);
    if text.contains("INFO") {
        if ready_gate.load(Ordering::SeqCst) {
            let _ = write_half.write_all(b"$11\r\nloading:0\r\n\r\n").await;
        }
    } else if text.contains("AUTH") || text.contains("SELECT") {
        let _ = write_half.write_all(b"+OK\r\n").await;
    }
}

/// Builds a RESP array-of-bulk-strings reply, e.g. a subscribe ack.
pub fn resp_array_of_bulk(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        out.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
        out.extend_from_slice(part);
        out.extend_from_slice(b"\r\n");
    }
    out
}
