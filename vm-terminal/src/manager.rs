//! Registry of live terminal sessions.
//!
//! Every session runs in its own task which owns the pty and the child
//! process. The registry only keeps the session's metadata and the sender
//! half of its command channel; output and lifecycle events go to the
//! owning client through the event channel handed to [`TerminalManager::connect`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, TerminalError};
use crate::launcher::{AddressResolver, ShellLauncher};
use crate::protocol::TerminalEvent;
use crate::pty::PtyProcess;

/// How long a session waits for output before checking on its process.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Events queued towards one client before the sessions feeding it wait.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

const COMMAND_BUFFER: usize = 64;

/// Input bytes held for a terminal whose process is not reading.
const MAX_PENDING_INPUT: usize = 64 * 1024;

pub type EventSender = mpsc::Sender<TerminalEvent>;
pub type EventReceiver = mpsc::Receiver<TerminalEvent>;

/// Channel for one client's terminal events. A client that reads slowly
/// holds back the output of its sessions instead of growing the queue.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalInfo {
    pub terminal_id: String,
    pub vm_id: String,
    pub username: String,
    pub client_id: String,
    pub address: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
enum SessionCommand {
    Input(Vec<u8>),
    Close,
}

struct SessionHandle {
    info: TerminalInfo,
    commands: mpsc::Sender<SessionCommand>,
    serial: u64,
}

type Registry = Arc<Mutex<HashMap<String, SessionHandle>>>;

#[derive(Clone)]
pub struct TerminalManager {
    sessions: Registry,
    next_serial: Arc<AtomicU64>,
    resolver: Arc<dyn AddressResolver>,
    launcher: Arc<dyn ShellLauncher>,
}

impl TerminalManager {
    pub fn new(resolver: Arc<dyn AddressResolver>, launcher: Arc<dyn ShellLauncher>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_serial: Arc::new(AtomicU64::new(0)),
            resolver,
            launcher,
        }
    }

    /// Open a shell to `vm_id` for `client_id`.
    ///
    /// `ssh_connected` is sent on `events` before any output. The session
    /// ends with `ssh_disconnected` when the process exits or the session
    /// is closed from either side.
    #[instrument(skip(self, events))]
    pub async fn connect(
        &self,
        client_id: &str,
        vm_id: &str,
        username: &str,
        events: EventSender,
    ) -> Result<String> {
        if username.is_empty() || username.contains(|c: char| c == '@' || c.is_whitespace()) {
            return Err(TerminalError::InvalidInput(format!(
                "invalid username '{}'",
                username
            )));
        }

        let address = self.resolver.resolve(vm_id).await?;
        let process = PtyProcess::spawn(self.launcher.command(&address, username))?;

        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.lock().await;
        let terminal_id = unique_id(&sessions, vm_id, username, Utc::now().timestamp());
        let info = TerminalInfo {
            terminal_id: terminal_id.clone(),
            vm_id: vm_id.to_string(),
            username: username.to_string(),
            client_id: client_id.to_string(),
            address,
            created_at: Utc::now(),
        };
        sessions.insert(
            terminal_id.clone(),
            SessionHandle {
                info,
                commands,
                serial,
            },
        );
        drop(sessions);

        info!(pid = ?process.id(), "Terminal {} opened", terminal_id);
        let _ = events
            .send(TerminalEvent::Connected {
                terminal_id: terminal_id.clone(),
            })
            .await;

        tokio::spawn(run_session(
            terminal_id.clone(),
            serial,
            process,
            command_rx,
            events,
            self.sessions.clone(),
        ));

        Ok(terminal_id)
    }

    /// Write client input verbatim to the session's terminal.
    pub async fn write(&self, terminal_id: &str, input: &[u8]) -> Result<()> {
        let sender = self.sender(terminal_id).await?;
        sender
            .send(SessionCommand::Input(input.to_vec()))
            .await
            .map_err(|_| TerminalError::NotFound(terminal_id.to_string()))
    }

    /// Close a session. The session task reaps the process and reports
    /// `ssh_disconnected` to its client.
    pub async fn disconnect(&self, terminal_id: &str) -> Result<()> {
        let handle = self
            .sessions
            .lock()
            .await
            .remove(terminal_id)
            .ok_or_else(|| TerminalError::NotFound(terminal_id.to_string()))?;

        info!("Closing terminal {}", terminal_id);
        close(handle);
        Ok(())
    }

    /// Close every session a client owns. Returns how many were closed.
    pub async fn disconnect_client(&self, client_id: &str) -> usize {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<String> = sessions
                .values()
                .filter(|h| h.info.client_id == client_id)
                .map(|h| h.info.terminal_id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let closed = handles.len();
        handles.into_iter().for_each(close);
        if closed > 0 {
            info!("Closed {} terminal(s) of client {}", closed, client_id);
        }
        closed
    }

    pub async fn get(&self, terminal_id: &str) -> Result<TerminalInfo> {
        self.sessions
            .lock()
            .await
            .get(terminal_id)
            .map(|h| h.info.clone())
            .ok_or_else(|| TerminalError::NotFound(terminal_id.to_string()))
    }

    pub async fn list(&self) -> Vec<TerminalInfo> {
        let mut infos: Vec<TerminalInfo> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|h| h.info.clone())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    async fn sender(&self, terminal_id: &str) -> Result<mpsc::Sender<SessionCommand>> {
        self.sessions
            .lock()
            .await
            .get(terminal_id)
            .map(|h| h.commands.clone())
            .ok_or_else(|| TerminalError::NotFound(terminal_id.to_string()))
    }
}

/// Ask a session to end without waiting on its command queue. A full
/// queue still ends the session once the dropped handle closes it.
fn close(handle: SessionHandle) {
    let _ = handle.commands.try_send(SessionCommand::Close);
}

/// `{vm}_{user}_{epoch}`, with a numeric suffix if that id is taken.
fn unique_id(
    sessions: &HashMap<String, SessionHandle>,
    vm_id: &str,
    username: &str,
    epoch: i64,
) -> String {
    let base = format!("{}_{}_{}", vm_id, username, epoch);
    if !sessions.contains_key(&base) {
        return base;
    }
    (1..)
        .map(|n| format!("{}-{}", base, n))
        .find(|id| !sessions.contains_key(id))
        .unwrap_or(base)
}

async fn run_session(
    terminal_id: String,
    serial: u64,
    mut process: PtyProcess,
    mut commands: mpsc::Receiver<SessionCommand>,
    events: EventSender,
    sessions: Registry,
) {
    // input not yet accepted by the terminal
    let mut pending: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            command = commands.recv(), if pending.len() < MAX_PENDING_INPUT => match command {
                Some(SessionCommand::Input(data)) => pending.extend_from_slice(&data),
                Some(SessionCommand::Close) | None => break,
            },
            written = process.write_some(&pending), if !pending.is_empty() => match written {
                Ok(n) => {
                    pending.drain(..n);
                }
                Err(e) => {
                    warn!("Write to terminal {} failed: {}", terminal_id, e);
                    let _ = events
                        .send(TerminalEvent::Error {
                            terminal_id: Some(terminal_id.clone()),
                            error: e.to_string(),
                        })
                        .await;
                    break;
                }
            },
            read = tokio::time::timeout(READ_TIMEOUT, process.read_chunk()) => match read {
                Ok(Ok(chunk)) if chunk.is_empty() => break,
                Ok(Ok(chunk)) => {
                    let event = TerminalEvent::Output {
                        terminal_id: terminal_id.clone(),
                        output: String::from_utf8_lossy(&chunk).into_owned(),
                    };
                    if events.send(event).await.is_err() {
                        debug!("Client of terminal {} is gone", terminal_id);
                        break;
                    }
                }
                Ok(Err(e)) => {
                    warn!("Read from terminal {} failed: {}", terminal_id, e);
                    break;
                }
                Err(_elapsed) => {
                    if !matches!(process.try_wait(), Ok(None)) {
                        break;
                    }
                }
            },
        }
    }

    match process.terminate().await {
        Ok(status) => info!("Terminal {} ended ({})", terminal_id, status),
        Err(e) => warn!("Failed to reap terminal {}: {}", terminal_id, e),
    }
    {
        // the id may already belong to a newer session
        let mut sessions = sessions.lock().await;
        if sessions.get(&terminal_id).is_some_and(|h| h.serial == serial) {
            sessions.remove(&terminal_id);
        }
    }
    let _ = events
        .send(TerminalEvent::Disconnected { terminal_id })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_suffixes_collisions() {
        let mut sessions = HashMap::new();
        assert_eq!(unique_id(&sessions, "12", "root", 1700000000), "12_root_1700000000");

        let (commands, _rx) = mpsc::channel(1);
        let info = TerminalInfo {
            terminal_id: "12_root_1700000000".to_string(),
            vm_id: "12".to_string(),
            username: "root".to_string(),
            client_id: "c".to_string(),
            address: "172.16.0.50".to_string(),
            created_at: Utc::now(),
        };
        sessions.insert(
            info.terminal_id.clone(),
            SessionHandle {
                info,
                commands,
                serial: 0,
            },
        );

        assert_eq!(
            unique_id(&sessions, "12", "root", 1700000000),
            "12_root_1700000000-1"
        );
    }
}
