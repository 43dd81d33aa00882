pub mod client;
pub mod discovery;
pub mod tail;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::compound::CompoundReport;
use crate::config::{DevagentConfig, DiscoveryConfig, FileConfig, TailConfig};
use crate::fleet::Hierarchy;
use crate::runtime::Container;
use crate::supervisor::{self, SupervisorError};
use client::ApiClient;
use discovery::DiscoveryError;
use tail::{HttpCaptureSource, TailEnd, Tailer};

/// Find the running instance and build a client for it.
pub async fn connect(config: &DevagentConfig, fc: &FileConfig) -> Result<ApiClient> {
    let dc = DiscoveryConfig::from_file(&fc.discovery);
    let instance = discovery::discover(&config.state_dir(), &dc).await?;
    debug!(addr = %instance.addr, "connected");
    Ok(ApiClient::with_timeout(instance.base_url(), dc.request_timeout))
}

/// Exit status for a failed command: 2 when no instance runs, 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<DiscoveryError>() {
        Some(DiscoveryError::NoInstance) => 2,
        _ => 1,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Invalid path: {}", path.display()))
}

pub async fn status_command(config: &DevagentConfig, fc: &FileConfig, json: bool) -> Result<()> {
    let client = connect(config, fc).await?;
    let health = client.health().await?;
    let metrics = client.metrics().await?;
    if json {
        return print_json(&serde_json::json!({
            "url": client.base_url(),
            "health": health,
            "metrics": metrics,
        }));
    }
    println!("devagent running at {} ({})", client.base_url(), health["status"]);
    let m = &metrics["metrics"];
    println!("  uptime:        {}s", m["uptime_secs"]);
    println!("  event streams: {}", m["event_streams"]["active"]);
    println!("  terminals:     {}", m["bridges"]["active"]);
    println!("  mutations:     {}", m["mutations"]);
    Ok(())
}

pub async fn projects_command(config: &DevagentConfig, fc: &FileConfig, json: bool) -> Result<()> {
    let hierarchy = connect(config, fc).await?.projects().await?;
    if json {
        return print_json(&hierarchy);
    }
    print!("{}", render_hierarchy(&hierarchy));
    Ok(())
}

fn container_label(container: Option<&Container>) -> String {
    match container {
        Some(c) => format!("{} ({})", c.name, state_word(c)),
        None => "-".to_string(),
    }
}

fn state_word(c: &Container) -> &'static str {
    match c.state {
        crate::runtime::ContainerState::Running => "running",
        crate::runtime::ContainerState::Stopped => "stopped",
        crate::runtime::ContainerState::Unknown => "unknown",
    }
}

fn render_hierarchy(h: &Hierarchy) -> String {
    let mut out = String::new();
    if h.projects.is_empty() && h.unmatched.is_empty() {
        out.push_str("No projects.\n");
        return out;
    }
    for project in &h.projects {
        out.push_str(&format!("{}  {}\n", project.name, project.path.display()));
        for wt in &project.worktrees {
            let branch = wt.worktree.branch.as_deref().unwrap_or("-");
            out.push_str(&format!(
                "  {:<20} {:<24} {}\n",
                wt.worktree.name,
                branch,
                container_label(wt.container.as_ref())
            ));
        }
    }
    if !h.unmatched.is_empty() {
        out.push_str("unmatched containers\n");
        for c in &h.unmatched {
            out.push_str(&format!(
                "  {:<20} {:<8} {}\n",
                c.name,
                state_word(c),
                c.project_path.display()
            ));
        }
    }
    out
}

fn render_containers(containers: &[Container]) -> String {
    if containers.is_empty() {
        return "No containers.\n".to_string();
    }
    let mut out = format!("{:<14} {:<24} {:<8} {}\n", "ID", "NAME", "STATUS", "PROJECT");
    for c in containers {
        let short_id = if c.id.len() > 12 { &c.id[..12] } else { &c.id };
        out.push_str(&format!(
            "{:<14} {:<24} {:<8} {}\n",
            short_id,
            c.name,
            state_word(c),
            c.project_path.display()
        ));
    }
    out
}

pub async fn containers_command(config: &DevagentConfig, fc: &FileConfig, json: bool) -> Result<()> {
    let containers = connect(config, fc).await?.containers().await?;
    if json {
        return print_json(&containers);
    }
    print!("{}", render_containers(&containers));
    Ok(())
}

pub async fn create_command(
    config: &DevagentConfig,
    fc: &FileConfig,
    project: &Path,
    json: bool,
) -> Result<()> {
    let project = absolute(project)?;
    let container = connect(config, fc).await?.create_container(&project).await?;
    if json {
        return print_json(&container);
    }
    println!("Created {} for {}", container.name, project.display());
    Ok(())
}

pub async fn start_command(config: &DevagentConfig, fc: &FileConfig, target: &str, json: bool) -> Result<()> {
    let container = connect(config, fc).await?.start_container(target).await?;
    if json {
        return print_json(&container);
    }
    println!("Started {}", container.name);
    Ok(())
}

pub async fn stop_command(config: &DevagentConfig, fc: &FileConfig, target: &str, json: bool) -> Result<()> {
    let container = connect(config, fc).await?.stop_container(target).await?;
    if json {
        return print_json(&container);
    }
    println!("Stopped {}", container.name);
    Ok(())
}

pub async fn destroy_command(config: &DevagentConfig, fc: &FileConfig, target: &str) -> Result<()> {
    connect(config, fc).await?.destroy_container(target).await?;
    println!("Destroyed {target}");
    Ok(())
}

pub async fn sessions_command(config: &DevagentConfig, fc: &FileConfig, target: &str, json: bool) -> Result<()> {
    let sessions = connect(config, fc).await?.sessions(target).await?;
    if json {
        return print_json(&sessions);
    }
    if sessions.is_empty() {
        println!("No sessions in {target}.");
    }
    for s in &sessions {
        let attached = if s.attached { " (attached)" } else { "" };
        println!("{:<20} {} window(s){}", s.name, s.windows, attached);
    }
    Ok(())
}

pub async fn session_new_command(
    config: &DevagentConfig,
    fc: &FileConfig,
    target: &str,
    name: &str,
    json: bool,
) -> Result<()> {
    let session = connect(config, fc).await?.create_session(target, name).await?;
    if json {
        return print_json(&session);
    }
    println!("Created session {} in {}", session.name, target);
    Ok(())
}

pub async fn session_kill_command(
    config: &DevagentConfig,
    fc: &FileConfig,
    target: &str,
    name: &str,
) -> Result<()> {
    connect(config, fc).await?.kill_session(target, name).await?;
    println!("Killed session {name} in {target}");
    Ok(())
}

pub async fn send_command(
    config: &DevagentConfig,
    fc: &FileConfig,
    target: &str,
    session: &str,
    text: &str,
    submit: bool,
) -> Result<()> {
    connect(config, fc)
        .await?
        .send_keys(target, session, text, submit)
        .await?;
    Ok(())
}

pub async fn capture_command(
    config: &DevagentConfig,
    fc: &FileConfig,
    target: &str,
    session: &str,
    lines: Option<u32>,
    from_cursor: Option<u64>,
    json: bool,
) -> Result<()> {
    let capture = connect(config, fc)
        .await?
        .capture(target, session, lines, from_cursor)
        .await?;
    if json {
        return print_json(&capture);
    }
    print!("{}", capture.content);
    Ok(())
}

/// Follow a session until Ctrl-C, or until the session goes away.
pub async fn tail_command(
    config: &DevagentConfig,
    fc: &FileConfig,
    target: &str,
    session: &str,
    lines: Option<u32>,
) -> Result<()> {
    let client = connect(config, fc).await?;
    let tc = TailConfig::from_file(&fc.tail);
    let cancel = CancellationToken::new();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let source = HttpCaptureSource::new(client, target.to_string(), session.to_string());
    let mut tailer = Tailer::new(
        source,
        std::io::stdout(),
        tc.interval,
        lines.unwrap_or(tc.lines),
        cancel,
    );
    let end = tailer.run().await?;
    debug!(state = ?tailer.state(), recaptures = tailer.recaptures(), "tail finished");
    if let TailEnd::SessionEnded(notice) = end {
        eprintln!("[devagent: {notice}]");
    }
    Ok(())
}

fn print_report(report: &CompoundReport) {
    let steps: Vec<String> = report
        .completed_steps
        .iter()
        .map(|s| s.to_string())
        .collect();
    println!(
        "{} {}: {}",
        report.operation,
        report.worktree.name,
        if steps.is_empty() {
            "nothing to do".to_string()
        } else {
            steps.join(", ")
        }
    );
    if let Some(c) = &report.container {
        println!("  container {} ({})", c.name, state_word(c));
    }
}

pub async fn worktree_create_command(
    config: &DevagentConfig,
    fc: &FileConfig,
    project: &Path,
    name: &str,
    branch: Option<&str>,
    start: bool,
    json: bool,
) -> Result<()> {
    let project = absolute(project)?;
    let report = connect(config, fc)
        .await?
        .create_worktree(&project, name, branch, start)
        .await?;
    if json {
        return print_json(&report);
    }
    print_report(&report);
    Ok(())
}

pub async fn worktree_delete_command(
    config: &DevagentConfig,
    fc: &FileConfig,
    project: &Path,
    name: &str,
    json: bool,
) -> Result<()> {
    let project = absolute(project)?;
    let report = connect(config, fc)
        .await?
        .delete_worktree(&project, name)
        .await?;
    if json {
        return print_json(&report);
    }
    print_report(&report);
    Ok(())
}

pub async fn worktree_start_command(
    config: &DevagentConfig,
    fc: &FileConfig,
    project: &Path,
    name: &str,
    json: bool,
) -> Result<()> {
    let project = absolute(project)?;
    let report = connect(config, fc)
        .await?
        .start_worktree(&project, name)
        .await?;
    if json {
        return print_json(&report);
    }
    print_report(&report);
    Ok(())
}

/// Remove a registration record left by a crashed instance.
pub fn cleanup_command(config: &DevagentConfig) -> Result<()> {
    match supervisor::clean_stale_registration(&config.state_dir()) {
        Ok(true) => println!("Removed stale registration."),
        Ok(false) => println!("Nothing to clean up."),
        Err(SupervisorError::AlreadyRunning(_)) => {
            anyhow::bail!("a devagent instance is running; stop it instead of cleaning up")
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
