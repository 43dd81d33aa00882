//! Message queue of the in-process terminal UI.
//!
//! The UI is a single consumer that handles one message per turn. The web
//! layer is just another producer: it pushes [`AppMessage::StateChanged`]
//! and the UI re-reads the whole fleet on its next turn. Rendering is
//! reduced to a logged summary here.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::fleet::Fleet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMessage {
    /// Something changed through the API; re-read full state.
    StateChanged,
    ServerReady(SocketAddr),
    Shutdown,
}

pub type UiSender = mpsc::UnboundedSender<AppMessage>;

pub fn channel() -> (UiSender, mpsc::UnboundedReceiver<AppMessage>) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FleetSummary {
    pub projects: usize,
    pub worktrees: usize,
    pub containers: usize,
    pub running: usize,
    pub unmatched: usize,
}

pub struct UiLoop {
    fleet: Arc<Fleet>,
    rx: mpsc::UnboundedReceiver<AppMessage>,
    summary: FleetSummary,
    refreshes: u64,
}

impl UiLoop {
    pub fn new(fleet: Arc<Fleet>, rx: mpsc::UnboundedReceiver<AppMessage>) -> Self {
        Self {
            fleet,
            rx,
            summary: FleetSummary::default(),
            refreshes: 0,
        }
    }

    /// Runs until `Shutdown` or every producer is gone. Returns how many
    /// full refreshes happened.
    pub async fn run(mut self) -> u64 {
        self.refresh().await;
        while let Some(msg) = self.rx.recv().await {
            match msg {
                AppMessage::StateChanged => {
                    // one refresh covers everything already queued
                    let mut shutdown = false;
                    while let Ok(queued) = self.rx.try_recv() {
                        match queued {
                            AppMessage::StateChanged => {}
                            AppMessage::ServerReady(addr) => announce(addr),
                            AppMessage::Shutdown => shutdown = true,
                        }
                    }
                    self.refresh().await;
                    if shutdown {
                        break;
                    }
                }
                AppMessage::ServerReady(addr) => announce(addr),
                AppMessage::Shutdown => break,
            }
        }
        self.refreshes
    }

    async fn refresh(&mut self) {
        self.refreshes += 1;
        let hierarchy = match self.fleet.hierarchy().await {
            Ok(h) => h,
            Err(e) => {
                warn!("UI refresh failed: {}", e);
                return;
            }
        };
        let mut summary = FleetSummary {
            projects: hierarchy.projects.len(),
            unmatched: hierarchy.unmatched.len(),
            ..Default::default()
        };
        let containers = hierarchy
            .projects
            .iter()
            .flat_map(|p| p.worktrees.iter())
            .inspect(|_| summary.worktrees += 1)
            .filter_map(|w| w.container.as_ref())
            .chain(hierarchy.unmatched.iter())
            .collect::<Vec<_>>();
        summary.containers = containers.len();
        summary.running = containers.iter().filter(|c| c.is_running()).count();

        if summary != self.summary {
            info!(
                projects = summary.projects,
                worktrees = summary.worktrees,
                containers = summary.containers,
                running = summary.running,
                unmatched = summary.unmatched,
                "fleet updated"
            );
            self.summary = summary;
        }
    }
}

fn announce(addr: SocketAddr) {
    info!("Control API listening on http://{}", addr);
}
