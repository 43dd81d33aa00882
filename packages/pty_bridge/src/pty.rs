use anyhow::Context;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::PtyError;

/// Size of the buffer used by the blocking reader thread.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Configuration for spawning a PTY
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
    /// Output chunks buffered between the reader thread and the consumer
    pub output_capacity: usize,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: "/bin/sh".to_string(),
            args: Vec::new(),
            env: Vec::new(),
            rows: 24,
            cols: 80,
            output_capacity: 64,
        }
    }
}

/// State of a PTY session
#[derive(Clone, Debug)]
pub struct PtyState {
    pub running: bool,
    pub pid: Option<u32>,
    pub rows: u16,
    pub cols: u16,
}

pub(crate) enum PtyMessage {
    Write {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, PtyError>>,
    },
    Resize {
        rows: u16,
        cols: u16,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    GetState {
        respond_to: oneshot::Sender<PtyState>,
    },
    Kill {
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
}

/// Handle to communicate with a PTY actor
#[derive(Clone)]
pub struct PtyHandle {
    sender: mpsc::Sender<PtyMessage>,
}

impl PtyHandle {
    /// Write raw bytes (keystrokes) to the PTY
    pub async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Write {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelError("write".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("write response".into()))?
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Resize {
                rows,
                cols,
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelError("resize".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("resize response".into()))?
    }

    pub async fn state(&self) -> Result<PtyState, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| PtyError::ChannelError("state".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("state response".into()))
    }

    /// Kill the attached process.
    ///
    /// Dropping the master side of the PTY is not enough: an attached
    /// `exec` keeps running until it is signalled.
    pub async fn kill(&self) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Kill { respond_to: tx })
            .await
            .map_err(|_| PtyError::ChannelError("kill".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("kill response".into()))?
    }
}

/// The actor owning one PTY and its child process
pub struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    state: PtyState,
    receiver: mpsc::Receiver<PtyMessage>,
}

impl PtyActor {
    /// Spawn a process in a new PTY.
    ///
    /// Returns the control handle and the output stream. The stream ends
    /// when the process closes its side of the terminal.
    pub fn spawn(config: PtyConfig) -> Result<(PtyHandle, mpsc::Receiver<Vec<u8>>), PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")
            .map_err(PtyError::from)?;

        let mut cmd = CommandBuilder::new(&config.command);
        for arg in &config.args {
            cmd.arg(arg);
        }

        cmd.env("TERM", "xterm-256color");
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        debug!(command = %config.command, args = ?config.args, "spawning pty command");

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", config.command, e);
            PtyError::CreateFailed(e.to_string())
        })?;
        // Only the child should hold the slave side, so EOF reaches the reader.
        drop(pair.slave);

        let pid = child.process_id();
        info!(?pid, command = %config.command, "pty process started");

        let state = PtyState {
            running: true,
            pid,
            rows: config.rows,
            cols: config.cols,
        };

        let (output_tx, output_rx) = mpsc::channel(config.output_capacity.max(1));
        let (msg_tx, msg_rx) = mpsc::channel(32);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")
            .map_err(PtyError::from)?;

        let mut actor = Self {
            master: pair.master,
            writer: None,
            child,
            state,
            receiver: msg_rx,
        };

        std::thread::spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        debug!("pty EOF");
                        break;
                    }
                    Ok(n) => {
                        if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                            // consumer went away
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("pty read ended: {}", e);
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            actor.run().await;
        });

        Ok((PtyHandle { sender: msg_tx }, output_rx))
    }

    async fn run(&mut self) {
        match self.master.take_writer() {
            Ok(writer) => self.writer = Some(writer),
            Err(e) => error!("Failed to get PTY writer: {}", e),
        }

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                PtyMessage::Write { data, respond_to } => {
                    let _ = respond_to.send(self.handle_write(&data));
                }
                PtyMessage::Resize {
                    rows,
                    cols,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handle_resize(rows, cols));
                }
                PtyMessage::GetState { respond_to } => {
                    self.refresh_running();
                    let _ = respond_to.send(self.state.clone());
                }
                PtyMessage::Kill { respond_to } => {
                    let result = self.handle_kill();
                    let _ = respond_to.send(result);
                    break;
                }
            }
        }

        // Every handle dropped without an explicit kill still must not
        // leave the attached process behind.
        if self.state.running {
            if let Err(e) = self.handle_kill() {
                warn!("Failed to kill pty process on shutdown: {}", e);
            }
        }
        debug!(pid = ?self.state.pid, "pty actor shutting down");
    }

    fn refresh_running(&mut self) {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(?status, "pty process exited");
            self.state.running = false;
        }
    }

    fn handle_write(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PtyError::WriteFailed("No PTY writer available".into()))?;

        writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;

        Ok(data.len())
    }

    fn handle_resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;

        self.state.rows = rows;
        self.state.cols = cols;
        Ok(())
    }

    fn handle_kill(&mut self) -> Result<(), PtyError> {
        self.refresh_running();
        if !self.state.running {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.state.pid {
                // ESRCH just means it already exited
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        self.child
            .kill()
            .or_else(|e| {
                if e.kind() == std::io::ErrorKind::InvalidInput {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .map_err(|e| PtyError::KillFailed(e.to_string()))?;
        let _ = self.child.wait();

        self.state.running = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn collect_output(rx: &mut mpsc::Receiver<Vec<u8>>, needle: &str) -> String {
        let mut out = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !out.contains(needle) {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(chunk)) => out.push_str(&String::from_utf8_lossy(&chunk)),
                _ => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn spawn_streams_output() {
        let config = PtyConfig {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "echo bridge-hello".to_string()],
            ..Default::default()
        };
        let (_handle, mut rx) = PtyActor::spawn(config).unwrap();
        let out = collect_output(&mut rx, "bridge-hello").await;
        assert!(out.contains("bridge-hello"), "got: {out:?}");
    }

    #[tokio::test]
    async fn write_is_echoed_back() {
        let config = PtyConfig {
            command: "/bin/cat".to_string(),
            ..Default::default()
        };
        let (handle, mut rx) = PtyActor::spawn(config).unwrap();
        handle.write(b"ping\n").await.unwrap();
        let out = collect_output(&mut rx, "ping").await;
        assert!(out.contains("ping"));
        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn resize_updates_state() {
        let config = PtyConfig {
            command: "/bin/cat".to_string(),
            ..Default::default()
        };
        let (handle, _rx) = PtyActor::spawn(config).unwrap();
        handle.resize(40, 120).await.unwrap();
        let state = handle.state().await.unwrap();
        assert_eq!(state.rows, 40);
        assert_eq!(state.cols, 120);
        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn kill_terminates_long_running_process() {
        let config = PtyConfig {
            command: "/bin/sleep".to_string(),
            args: vec!["30".to_string()],
            ..Default::default()
        };
        let (handle, mut rx) = PtyActor::spawn(config).unwrap();
        let pid = handle.state().await.unwrap().pid;
        assert!(pid.is_some());

        handle.kill().await.unwrap();

        // actor is gone after kill
        assert!(handle.state().await.is_err());

        // reader sees EOF once the process is dead
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "output stream should close after kill");
    }

    #[test]
    fn default_config_is_80x24() {
        let config = PtyConfig::default();
        assert_eq!(config.rows, 24);
        assert_eq!(config.cols, 80);
        assert!(config.output_capacity > 0);
    }
}
