use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod cli;
mod compound;
mod config;
mod cursor;
mod error;
mod events;
mod fleet;
mod handlers;
mod metrics;
mod runtime;
mod supervisor;
#[cfg(test)]
mod test_helpers;
mod ui;

use crate::config::{DevagentConfig, FileConfig, ServerConfig};
use crate::events::EventBroadcaster;
use crate::fleet::Fleet;
use crate::metrics::ServerMetrics;
use crate::runtime::{
    docker::DockerRuntime, git::GitWorktrees, projects::DirProjectSource, tmux::TmuxMultiplexer,
};
use crate::supervisor::SupervisorError;
use crate::ui::{AppMessage, UiLoop};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "devagent")]
#[command(about = "Control plane for containerized development environments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom config directory (defaults to ~/.devagent)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane in the foreground
    Serve(ServeArgs),

    /// Show the running instance
    Status(JsonArgs),

    /// Projects, their worktrees and containers
    Projects(JsonArgs),

    /// List containers
    Containers(JsonArgs),

    /// Create (not start) a container for a project path
    Create(ProjectArgs),

    /// Start a container
    Start(TargetArgs),

    /// Stop a container
    Stop(TargetArgs),

    /// Destroy a container
    Destroy(TargetArgs),

    /// List sessions in a running container
    Sessions(TargetArgs),

    /// Create a session
    SessionNew(SessionArgs),

    /// Kill a session
    SessionKill(SessionArgs),

    /// Type text into a session
    Send(SendArgs),

    /// Print a capture of a session
    Capture(CaptureArgs),

    /// Follow a session's output
    Tail(TailArgs),

    /// Create a worktree and its container
    WorktreeCreate(WorktreeCreateArgs),

    /// Stop and destroy a worktree's container, then remove the worktree
    WorktreeDelete(WorktreeArgs),

    /// Start a worktree's container, creating it if needed
    WorktreeStart(WorktreeArgs),

    /// Remove a registration left behind by a crashed instance
    Cleanup,
}

#[derive(Parser)]
struct ServeArgs {
    /// Port for the Control API (0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,
}

#[derive(Parser)]
struct JsonArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct ProjectArgs {
    /// Project directory
    project: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct TargetArgs {
    /// Container name, ID, or ID prefix
    target: String,
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct SessionArgs {
    /// Container name, ID, or ID prefix
    target: String,
    /// Session name
    name: String,
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct SendArgs {
    target: String,
    session: String,
    text: String,
    /// Do not press Enter after the text
    #[arg(long)]
    no_submit: bool,
}

#[derive(Parser)]
struct CaptureArgs {
    target: String,
    session: String,
    /// Scrollback lines above the visible pane
    #[arg(short = 'n', long)]
    lines: Option<u32>,
    /// Only output produced after this cursor position
    #[arg(long)]
    from_cursor: Option<u64>,
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct TailArgs {
    target: String,
    session: String,
    /// Initial lines of scrollback
    #[arg(short = 'n', long)]
    lines: Option<u32>,
}

#[derive(Parser)]
struct WorktreeCreateArgs {
    /// Project directory
    project: PathBuf,
    /// Worktree name
    name: String,
    /// Branch to check out (defaults to a new branch named after the worktree)
    #[arg(long)]
    branch: Option<String>,
    /// Create the container but leave it stopped
    #[arg(long)]
    no_start: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct WorktreeArgs {
    project: PathBuf,
    name: String,
    #[arg(long)]
    json: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// Authoritative container/session/worktree state
    pub fleet: Arc<Fleet>,
    pub events: Arc<EventBroadcaster>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

impl AppState {
    /// Call after every committed mutation, never before.
    pub fn mutated(&self) {
        self.metrics.mutation();
        self.events.notify();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let serving = matches!(cli.command, Commands::Serve(_));
    init_logging(cli.debug, serving);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(cli::exit_code(&e))
        }
    }
}

/// The server always logs; other commands only with `--debug`, and only
/// to stderr, so stdout stays parseable.
fn init_logging(debug: bool, serving: bool) {
    if !serving && !debug {
        return;
    }
    let default_directive = if debug {
        "devagent=debug,tower_http=debug,info"
    } else {
        "devagent=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = DevagentConfig::new(cli.config_dir)?;
    let fc = config.load()?;
    let (c, f) = (&config, &fc);

    match cli.command {
        Commands::Serve(args) => run_server(args, config, fc).await,
        Commands::Status(a) => cli::status_command(c, f, a.json).await,
        Commands::Projects(a) => cli::projects_command(c, f, a.json).await,
        Commands::Containers(a) => cli::containers_command(c, f, a.json).await,
        Commands::Create(a) => cli::create_command(c, f, &a.project, a.json).await,
        Commands::Start(a) => cli::start_command(c, f, &a.target, a.json).await,
        Commands::Stop(a) => cli::stop_command(c, f, &a.target, a.json).await,
        Commands::Destroy(a) => cli::destroy_command(c, f, &a.target).await,
        Commands::Sessions(a) => cli::sessions_command(c, f, &a.target, a.json).await,
        Commands::SessionNew(a) => {
            cli::session_new_command(c, f, &a.target, &a.name, a.json).await
        }
        Commands::SessionKill(a) => cli::session_kill_command(c, f, &a.target, &a.name).await,
        Commands::Send(a) => {
            cli::send_command(c, f, &a.target, &a.session, &a.text, !a.no_submit).await
        }
        Commands::Capture(a) => {
            cli::capture_command(c, f, &a.target, &a.session, a.lines, a.from_cursor, a.json)
                .await
        }
        Commands::Tail(a) => cli::tail_command(c, f, &a.target, &a.session, a.lines).await,
        Commands::WorktreeCreate(a) => {
            cli::worktree_create_command(
                c,
                f,
                &a.project,
                &a.name,
                a.branch.as_deref(),
                !a.no_start,
                a.json,
            )
            .await
        }
        Commands::WorktreeDelete(a) => {
            cli::worktree_delete_command(c, f, &a.project, &a.name, a.json).await
        }
        Commands::WorktreeStart(a) => {
            cli::worktree_start_command(c, f, &a.project, &a.name, a.json).await
        }
        Commands::Cleanup => cli::cleanup_command(c),
    }
}

fn build_fleet(fc: &FileConfig) -> Fleet {
    let rt = &fc.runtime;
    Fleet::new(
        Arc::new(DockerRuntime::new(
            rt.docker_bin.clone(),
            rt.compose_file.clone(),
            rt.exec_user.clone(),
        )),
        Arc::new(TmuxMultiplexer::new(
            rt.docker_bin.clone(),
            rt.tmux_bin.clone(),
        )),
        Arc::new(GitWorktrees::new(rt.git_bin.clone())),
        Arc::new(DirProjectSource::new(fc.projects.roots.clone())),
    )
}

async fn run_server(args: ServeArgs, config: DevagentConfig, fc: FileConfig) -> Result<()> {
    info!("Starting devagent control plane");

    let state_dir = config.state_dir();
    let lock = match supervisor::acquire_lock(&state_dir) {
        Ok(lock) => lock,
        Err(SupervisorError::AlreadyRunning(path)) => anyhow::bail!(
            "devagent is already running (lock held on {}); use `devagent status` to find it",
            path.display()
        ),
        Err(e) => return Err(e.into()),
    };
    debug!("Holding instance lock {}", lock.path().display());

    let mut server = ServerConfig::from_file(&fc.server);
    if let Some(host) = args.host {
        server.host = host;
    }
    if let Some(port) = args.port {
        server.port = port;
    }

    let fleet = Arc::new(build_fleet(&fc));
    let (ui_tx, ui_rx) = ui::channel();
    let ui_task = tokio::spawn(UiLoop::new(fleet.clone(), ui_rx).run());

    let state = AppState {
        fleet,
        events: Arc::new(EventBroadcaster::new(Some(ui_tx.clone()))),
        metrics: Arc::new(ServerMetrics::new()),
    };

    let app = handlers::api_routes()
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            handlers::count_upstream_errors,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind((server.host.as_str(), server.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", server.host, server.port))?;
    let actual_addr = listener.local_addr()?;

    // only advertise once the socket accepts connections
    supervisor::register(&state_dir, &lock, actual_addr)?;
    let _ = ui_tx.send(AppMessage::ServerReady(actual_addr));

    info!("API endpoints:");
    info!("  GET    /api/projects                 - Project / worktree / container tree");
    info!("  GET    /api/containers               - List containers");
    info!("  GET    /api/events                   - Change notifications (SSE)");
    info!("  GET    /api/containers/:id/sessions/:name/terminal - Terminal (WebSocket)");

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    supervisor::release(&state_dir, lock);

    let _ = ui_tx.send(AppMessage::Shutdown);
    match ui_task.await {
        Ok(refreshes) => debug!(refreshes, "UI loop finished"),
        Err(e) => warn!("UI loop panicked: {}", e),
    }

    info!("Shutdown complete");
    server_result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Received shutdown signal, cleaning up...");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_kebab_case_subcommands() {
        let cli = Cli::try_parse_from([
            "devagent",
            "worktree-create",
            "/src/web",
            "feat",
            "--no-start",
        ])
        .unwrap();
        match cli.command {
            Commands::WorktreeCreate(a) => {
                assert_eq!(a.name, "feat");
                assert!(a.no_start);
                assert!(a.branch.is_none());
            }
            _ => panic!("wrong subcommand"),
        }

        let cli = Cli::try_parse_from(["devagent", "send", "web", "main", "ls", "--no-submit"])
            .unwrap();
        assert!(matches!(cli.command, Commands::Send(ref a) if a.no_submit));
    }

    #[test]
    fn global_flags_work_after_the_subcommand() {
        let cli = Cli::try_parse_from(["devagent", "containers", "--json", "--debug"]).unwrap();
        assert!(cli.debug);
        assert!(matches!(cli.command, Commands::Containers(JsonArgs { json: true })));
    }

    #[tokio::test]
    async fn mutated_counts_and_notifies() {
        let (state, _fakes) = test_helpers::test_app_state();
        let sub = state.events.subscribe();
        let mut rx = sub.receiver;
        state.mutated();
        assert!(rx.try_recv().is_ok());
        assert_eq!(state.metrics.snapshot().mutations, 1);
    }
}
