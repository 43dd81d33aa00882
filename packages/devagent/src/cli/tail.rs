//! Polling tail of a multiplexer session.
//!
//! One capture of the last N lines, then on every tick "everything since
//! my cursor". A backwards cursor means the pane was reset and triggers a
//! single full re-capture. A pane whose scrollback is full stops moving
//! its cursor, so while the server reports it saturated each tick re-reads
//! the last N lines and prints only the part after what was already shown.

use async_trait::async_trait;
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::{ApiClient, ClientError};
use crate::cursor::{self, Progress};
use crate::error::ErrorKind;
use crate::fleet::Capture;

/// Where captures come from.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn capture_lines(&self, lines: u32) -> Result<Capture, ClientError>;
    async fn capture_since(&self, cursor: u64) -> Result<Capture, ClientError>;
}

pub struct HttpCaptureSource {
    client: ApiClient,
    container: String,
    session: String,
}

impl HttpCaptureSource {
    pub fn new(client: ApiClient, container: String, session: String) -> Self {
        Self {
            client,
            container,
            session,
        }
    }
}

#[async_trait]
impl CaptureSource for HttpCaptureSource {
    async fn capture_lines(&self, lines: u32) -> Result<Capture, ClientError> {
        self.client
            .capture_lines(&self.container, &self.session, lines)
            .await
    }

    async fn capture_since(&self, cursor: u64) -> Result<Capture, ClientError> {
        self.client
            .capture(&self.container, &self.session, None, Some(cursor))
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    Initial,
    Polling,
    /// The previous tick lost the connection; one more failure is fatal.
    Reconnecting,
    Ended,
}

/// Clean endings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEnd {
    Cancelled,
    /// The session or its container went away.
    SessionEnded(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error("lost connection to devagent: {0}")]
    ConnectionLost(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

pub struct Tailer<S, W> {
    source: S,
    out: W,
    interval: Duration,
    lines: u32,
    cancel: CancellationToken,
    state: TailState,
    cursor: Option<u64>,
    recaptures: u64,
    /// Most recently printed lines, at most `lines` of them.
    recent: Vec<String>,
}

impl<S: CaptureSource, W: Write + Send> Tailer<S, W> {
    pub fn new(
        source: S,
        out: W,
        interval: Duration,
        lines: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            out,
            interval,
            lines,
            cancel,
            state: TailState::Initial,
            cursor: None,
            recaptures: 0,
            recent: Vec::new(),
        }
    }

    pub fn state(&self) -> TailState {
        self.state
    }

    /// Full re-captures caused by pane resets.
    pub fn recaptures(&self) -> u64 {
        self.recaptures
    }

    #[cfg(test)]
    pub fn into_output(self) -> W {
        self.out
    }

    pub async fn run(&mut self) -> Result<TailEnd, TailError> {
        loop {
            if self.cancel.is_cancelled() {
                self.state = TailState::Ended;
                return Ok(TailEnd::Cancelled);
            }

            // a request to a hung instance must not outlive Ctrl-C
            let cancel = self.cancel.clone();
            let ticked = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.tick() => Some(result),
            };
            match ticked {
                None => {
                    self.state = TailState::Ended;
                    return Ok(TailEnd::Cancelled);
                }
                Some(result) => {
                    if let Some(end) = result? {
                        return Ok(end);
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    async fn tick(&mut self) -> Result<Option<TailEnd>, TailError> {
        let result = match self.cursor {
            None => self.initial().await,
            Some(last) => self.poll(last).await,
        };

        match result {
            Ok(()) => {
                if self.state != TailState::Polling {
                    debug!(cursor = ?self.cursor, "tail polling");
                }
                self.state = TailState::Polling;
                Ok(None)
            }
            Err(TailError::Client(e)) if e.is_connection() => {
                if self.state == TailState::Reconnecting {
                    self.state = TailState::Ended;
                    return Err(TailError::ConnectionLost(e.to_string()));
                }
                warn!("Connection failed, retrying once: {}", e);
                self.state = TailState::Reconnecting;
                Ok(None)
            }
            Err(TailError::Client(e))
                if matches!(e.kind(), Some(ErrorKind::NotFound | ErrorKind::BadState)) =>
            {
                self.state = TailState::Ended;
                Ok(Some(TailEnd::SessionEnded(e.to_string())))
            }
            Err(e) => {
                self.state = TailState::Ended;
                Err(e)
            }
        }
    }

    async fn initial(&mut self) -> Result<(), TailError> {
        let capture = self.source.capture_lines(self.lines).await?;
        self.emit(&capture.content)?;
        self.cursor = Some(capture.cursor_y);
        Ok(())
    }

    async fn poll(&mut self, last: u64) -> Result<(), TailError> {
        let capture = self.source.capture_since(last).await?;
        match cursor::progress(last, capture.cursor_y) {
            Progress::Advanced => {
                self.emit(&capture.content)?;
                self.cursor = Some(capture.cursor_y);
            }
            Progress::Unchanged if capture.saturated => self.follow_saturated().await?,
            Progress::Unchanged => {}
            Progress::Reset => {
                debug!(last, current = capture.cursor_y, "pane reset, re-capturing");
                let full = self.source.capture_lines(self.lines).await?;
                self.recaptures += 1;
                self.recent.clear();
                self.emit(&full.content)?;
                self.cursor = Some(full.cursor_y);
            }
        }
        Ok(())
    }

    async fn follow_saturated(&mut self) -> Result<(), TailError> {
        let window = self.source.capture_lines(self.lines).await?;
        let lines: Vec<&str> = window.content.lines().collect();
        let seen = overlap(&self.recent, &lines);
        let fresh: String = lines[seen..].iter().map(|l| format!("{l}\n")).collect();
        self.emit(&fresh)?;
        self.cursor = Some(window.cursor_y);
        Ok(())
    }

    fn emit(&mut self, content: &str) -> Result<(), TailError> {
        if content.is_empty() {
            return Ok(());
        }
        self.out.write_all(content.as_bytes())?;
        if !content.ends_with('\n') {
            self.out.write_all(b"\n")?;
        }
        self.out.flush()?;

        self.recent.extend(content.lines().map(str::to_string));
        let keep = self.lines.max(1) as usize;
        if self.recent.len() > keep {
            self.recent.drain(..self.recent.len() - keep);
        }
        Ok(())
    }
}

/// Length of the longest suffix of `seen` that is also a prefix of `window`.
fn overlap(seen: &[String], window: &[&str]) -> usize {
    let max = seen.len().min(window.len());
    (0..=max)
        .rev()
        .find(|&k| {
            seen[seen.len() - k..]
                .iter()
                .zip(&window[..k])
                .all(|(a, b)| a == b)
        })
        .unwrap_or(0)
}
