//! Terminal multiplexer sessions: tmux running inside the container,
//! reached through `docker exec`.

use async_trait::async_trait;

use super::{
    Container, LineRange, Multiplexer, PaneCursor, RuntimeError, RuntimeResult, Session,
    run_command,
};

pub struct TmuxMultiplexer {
    docker_bin: String,
    tmux_bin: String,
}

impl TmuxMultiplexer {
    pub fn new(docker_bin: String, tmux_bin: String) -> Self {
        Self {
            docker_bin,
            tmux_bin,
        }
    }

    async fn tmux(&self, container: &Container, args: &[&str]) -> RuntimeResult<String> {
        if !container.is_running() {
            return Err(RuntimeError::NotRunning(container.name.clone()));
        }
        let mut full: Vec<&str> = vec![
            "exec",
            "-u",
            container.remote_user.as_str(),
            container.id.as_str(),
            self.tmux_bin.as_str(),
        ];
        full.extend_from_slice(args);
        run_command(&self.docker_bin, &full)
            .await
            .map_err(classify_tmux_error)
    }
}

/// Exact-match pane target for a session name.
fn target(session: &str) -> String {
    format!("={session}:")
}

fn classify_tmux_error(err: RuntimeError) -> RuntimeError {
    match err {
        RuntimeError::CommandFailed { ref stderr, .. } => {
            if stderr.contains("duplicate session") {
                RuntimeError::AlreadyExists(format!("session: {stderr}"))
            } else if stderr.contains("can't find")
                || stderr.contains("session not found")
                || stderr.contains("no server running")
                || stderr.contains("error connecting")
            {
                RuntimeError::NotFound(format!("session: {stderr}"))
            } else if stderr.contains("is not running") {
                RuntimeError::NotRunning(stderr.clone())
            } else {
                err
            }
        }
        other => other,
    }
}

fn parse_sessions(out: &str) -> Vec<Session> {
    out.lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let name = parts.next()?.to_string();
            if name.is_empty() {
                return None;
            }
            let windows = parts.next().and_then(|w| w.trim().parse().ok()).unwrap_or(1);
            let attached = parts
                .next()
                .and_then(|a| a.trim().parse::<u32>().ok())
                .is_some_and(|n| n > 0);
            Some(Session {
                name,
                windows,
                attached,
            })
        })
        .collect()
}

fn parse_cursor(out: &str) -> RuntimeResult<PaneCursor> {
    let mut parts = out.split_whitespace();
    let parse = |v: Option<&str>| -> RuntimeResult<u64> {
        v.and_then(|s| s.parse().ok()).ok_or_else(|| RuntimeError::Parse {
            what: "pane cursor".into(),
            detail: out.trim().to_string(),
        })
    };
    let history_size = parse(parts.next())?;
    let cursor_y = parse(parts.next())?;
    // older tmux without the field reads as unknown
    let history_limit = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    Ok(PaneCursor {
        history_size,
        cursor_y,
        history_limit,
    })
}

#[async_trait]
impl Multiplexer for TmuxMultiplexer {
    async fn list_sessions(&self, container: &Container) -> RuntimeResult<Vec<Session>> {
        let out = self
            .tmux(
                container,
                &[
                    "list-sessions",
                    "-F",
                    "#{session_name}\t#{session_windows}\t#{session_attached}",
                ],
            )
            .await;
        match out {
            Ok(out) => Ok(parse_sessions(&out)),
            // no tmux server yet means no sessions
            Err(RuntimeError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn create_session(&self, container: &Container, name: &str) -> RuntimeResult<()> {
        self.tmux(container, &["new-session", "-d", "-s", name])
            .await
            .map(|_| ())
    }

    async fn kill_session(&self, container: &Container, name: &str) -> RuntimeResult<()> {
        let t = format!("={name}");
        self.tmux(container, &["kill-session", "-t", &t])
            .await
            .map(|_| ())
    }

    async fn cursor(&self, container: &Container, session: &str) -> RuntimeResult<PaneCursor> {
        let t = target(session);
        let out = self
            .tmux(
                container,
                &[
                    "display-message",
                    "-p",
                    "-t",
                    &t,
                    "#{history_size} #{cursor_y} #{history_limit}",
                ],
            )
            .await?;
        parse_cursor(&out)
    }

    async fn capture(
        &self,
        container: &Container,
        session: &str,
        range: LineRange,
    ) -> RuntimeResult<String> {
        let t = target(session);
        let start = range.start.map(|s| s.to_string());
        let end = range.end.map(|e| e.to_string());
        let mut args = vec!["capture-pane", "-p", "-t", t.as_str()];
        if let Some(ref s) = start {
            args.extend_from_slice(&["-S", s.as_str()]);
        }
        if let Some(ref e) = end {
            args.extend_from_slice(&["-E", e.as_str()]);
        }
        self.tmux(container, &args).await
    }

    async fn send_text(
        &self,
        container: &Container,
        session: &str,
        text: &str,
    ) -> RuntimeResult<()> {
        let t = target(session);
        self.tmux(container, &["send-keys", "-t", &t, "-l", "--", text])
            .await
            .map(|_| ())
    }

    async fn send_submit(&self, container: &Container, session: &str) -> RuntimeResult<()> {
        let t = target(session);
        self.tmux(container, &["send-keys", "-t", &t, "Enter"])
            .await
            .map(|_| ())
    }

    fn attach_command(&self, container: &Container, session: &str) -> (String, Vec<String>) {
        (
            self.docker_bin.clone(),
            vec![
                "exec".into(),
                "-it".into(),
                "-u".into(),
                container.remote_user.clone(),
                container.id.clone(),
                self.tmux_bin.clone(),
                "attach-session".into(),
                "-t".into(),
                format!("={session}"),
            ],
        )
    }
}
