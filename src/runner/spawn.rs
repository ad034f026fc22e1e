//! Agent process spawner.
//!
//! Turns a [`BuiltCommand`](super::command::BuiltCommand) into a running
//! child process with `kill_on_drop(true)` and piped stdio, injecting the
//! identifying `AGENT_LINK_AGENT_*` environment variables so the spawned
//! tool and its children can self-identify.
//!
//! Two quirks of the backend CLIs are handled here rather than in the
//! builder:
//!
//! - **Argument-length fallback** — when the argv-mode spawn fails with the
//!   OS "argument list too long" error and the backend is the default
//!   convention, the spawn is retried once in stdin mode.
//! - **TTY wrapping** — `exec`-style invocations degrade their output when
//!   stdout is not a terminal, so they are wrapped in
//!   `script … sh -c '<command line>'` with a minimal `TERM`. The `script`
//!   flag order differs between BSD and GNU variants, and the wrapper is
//!   skipped entirely on Windows, which has no `script`.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::config::{PromptMode, RunnerOverrides, TtyMode};
use crate::protocol::now_iso;
use crate::runner::command::{build_command, command_line, Backend, SpawnRequest};
use crate::{AppError, Result};

/// `TERM` value used under the wrapper when no override is set.
const DEFAULT_TTY_TERM: &str = "dumb";

/// A live agent process plus the invocation that produced it.
#[derive(Debug)]
pub struct SpawnedAgent {
    /// Child handle; `kill_on_drop` is set.
    pub child: Child,
    /// OS process id, when available.
    pub pid: Option<u32>,
    /// ISO-8601 spawn timestamp.
    pub started_at: String,
    /// Final executable (the wrapper when TTY wrapping applied).
    pub command: String,
    /// Final argument vector.
    pub args: Vec<String>,
    /// Prompt delivery mode the process was started with.
    pub prompt_mode: PromptMode,
}

/// Spawn the agent process for `request`.
///
/// In stdin delivery mode the prompt is written to the child's standard
/// input and the stream is closed before returning. In argv mode stdin is
/// kept open so later `stdin`/`prompt` control feeds can reach the process.
///
/// # Errors
///
/// Returns `AppError::Spawn` when the process cannot be started. The
/// "argument list too long" case is retried once via stdin mode for the
/// default backend before the error propagates.
pub async fn spawn_agent(
    request: &SpawnRequest,
    overrides: &RunnerOverrides,
) -> Result<SpawnedAgent> {
    let is_default_backend = Backend::for_model(&request.agent.model) == Backend::Codex;

    match spawn_with_mode(request, overrides, None).await {
        Ok(agent) => Ok(agent),
        Err(err) if is_default_backend && is_arg_list_too_long(&err) => {
            warn!(
                agent_id = request.agent.id,
                "spawn args exceeded system limits; retrying via stdin"
            );
            spawn_with_mode(request, overrides, Some(PromptMode::Stdin))
                .await
                .map_err(|err| AppError::Spawn(err.to_string()))
        }
        Err(err) => Err(AppError::Spawn(err.to_string())),
    }
}

async fn spawn_with_mode(
    request: &SpawnRequest,
    overrides: &RunnerOverrides,
    mode_override: Option<PromptMode>,
) -> std::io::Result<SpawnedAgent> {
    let built = build_command(request, overrides, mode_override);
    let started_at = now_iso();

    let has_exec = built.args.iter().any(|arg| arg == "exec");
    let use_wrapper = match overrides.tty_mode {
        TtyMode::Script => true,
        TtyMode::Auto => has_exec,
        TtyMode::Never => false,
    };
    // `script` only exists on unix-likes; on Windows the command runs bare.
    let wrap = use_wrapper && cfg!(unix);

    let (command, args) = if wrap {
        let line = command_line(&built.command, &built.args);
        if cfg!(target_os = "macos") {
            // BSD script: script -q /dev/null sh -c '<command>'
            (
                "script".to_owned(),
                vec![
                    "-q".to_owned(),
                    "/dev/null".to_owned(),
                    "sh".to_owned(),
                    "-c".to_owned(),
                    line,
                ],
            )
        } else {
            // GNU script: script -q -c '<command>' /dev/null
            (
                "script".to_owned(),
                vec![
                    "-q".to_owned(),
                    "-c".to_owned(),
                    line,
                    "/dev/null".to_owned(),
                ],
            )
        }
    } else {
        (built.command.clone(), built.args.clone())
    };

    let mut cmd = Command::new(&command);
    cmd.args(&args)
        .env("AGENT_LINK_AGENT_ID", &request.agent.id)
        .env("AGENT_LINK_AGENT_NAME", &request.agent.name)
        .env("AGENT_LINK_AGENT_MODEL", &request.agent.model)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if wrap {
        cmd.env(
            "TERM",
            overrides.tty_term.as_deref().unwrap_or(DEFAULT_TTY_TERM),
        );
    }
    if let Some(dir) = &overrides.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();

    if built.prompt_mode == PromptMode::Stdin {
        // Deliver the prompt and close the stream right away.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }
    }

    debug!(
        agent_id = request.agent.id,
        pid = pid.unwrap_or(0),
        command,
        prompt_mode = built.prompt_mode.as_str(),
        "agent process spawned"
    );

    Ok(SpawnedAgent {
        child,
        pid,
        started_at,
        command,
        args,
        prompt_mode: built.prompt_mode,
    })
}

/// Whether a spawn error is the OS argument-length limit (`E2BIG`).
fn is_arg_list_too_long(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        // E2BIG is 7 on every supported unix.
        err.raw_os_error() == Some(7)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}
