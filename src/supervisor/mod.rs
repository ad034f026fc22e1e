//! Control dispatch and agent process registry.
//!
//! The supervisor owns every live agent: it resolves a backend for each
//! `spawn`, starts the process, wires the output pipes, feeds stdin, and
//! reports lifecycle transitions back through the transport. One instance
//! serves the whole client; control messages arrive sequentially from the
//! transport's control channel.

pub mod pipe;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compact::{compact, CompactionAction, CompactionPolicy};
use crate::config::{PromptMode, RunnerOverrides};
use crate::log_buffer::LogBuffer;
use crate::protocol::{AgentState, ControlAction, ControlMessage, ControlPayload, LogStream};
use crate::runner::command::{AgentSpec, Backend, SpawnRequest};
use crate::runner::discovery::{find_agents_on_path, resolve_agent_binary};
use crate::runner::spawn::spawn_agent;
use crate::transport::TransportHandle;

/// Model used when a spawn request names none.
const DEFAULT_MODEL: &str = "codex-cli";

// ── Registry ──────────────────────────────────────────────────────────────

/// Book-keeping for one running agent process.
///
/// The `Child` itself lives inside the exit-monitor task; stopping an
/// agent goes through its cancellation token, and the monitor owns the
/// kill, the registry removal, and the final status report.
#[derive(Debug)]
pub struct AgentHandle {
    /// Backend name the process was resolved to.
    pub backend: String,
    /// Model the invocation targets.
    pub model: String,
    /// OS process id, when available.
    pub pid: Option<u32>,
    /// ISO-8601 spawn timestamp.
    pub started_at: String,
    /// How the prompt was delivered.
    pub prompt_mode: PromptMode,
    /// Write half of the child's stdin; `None` once closed.
    stdin: Option<ChildStdin>,
    /// Cancelling this kills the process.
    kill: CancellationToken,
}

type Registry = Arc<Mutex<HashMap<String, AgentHandle>>>;

// ── Supervisor ────────────────────────────────────────────────────────────

/// Shared state for control handling; cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    transport: TransportHandle,
    buffer: Arc<Mutex<LogBuffer>>,
    overrides: Arc<RunnerOverrides>,
    policy: Arc<CompactionPolicy>,
    /// Backend forced from the command line, if any.
    preferred_agent: Option<String>,
    /// Extra argv entries applied when a spawn carries none.
    default_args: Vec<String>,
    active: Registry,
}

impl Supervisor {
    /// Build a supervisor around the shared buffer and transport handle.
    #[must_use]
    pub fn new(
        transport: TransportHandle,
        buffer: Arc<Mutex<LogBuffer>>,
        overrides: RunnerOverrides,
        policy: CompactionPolicy,
        preferred_agent: Option<String>,
        default_args: Vec<String>,
    ) -> Self {
        Self {
            transport,
            buffer,
            overrides: Arc::new(overrides),
            policy: Arc::new(policy),
            preferred_agent,
            default_args,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of live agents.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Dispatch one control message.
    pub async fn handle_control(&self, message: ControlMessage) {
        let Some(agent_id) = message.agent_id.clone() else {
            debug!(action = ?message.action, "control message without agent id, ignoring");
            return;
        };

        match message.action {
            ControlAction::Spawn | ControlAction::Start => {
                self.handle_spawn(&agent_id, message.payload.unwrap_or_default())
                    .await;
            }
            ControlAction::Stop => self.handle_stop(&agent_id).await,
            ControlAction::Stdin | ControlAction::Prompt => {
                let data = message
                    .data
                    .or_else(|| message.payload.and_then(|payload| payload.prompt));
                if let Some(data) = data {
                    self.feed_stdin(&agent_id, &data).await;
                }
            }
            ControlAction::Ping => {}
        }
    }

    /// Kill every live agent and wait for their monitors to clean up.
    pub async fn shutdown(&self) {
        let tokens: Vec<CancellationToken> = {
            let active = self.active.lock().await;
            active.values().map(|handle| handle.kill.clone()).collect()
        };
        for token in tokens {
            token.cancel();
        }
    }

    // ── Spawn ─────────────────────────────────────────────────────────

    #[allow(clippy::too_many_lines)] // Resolve → compact → spawn → wire is inherently sequential.
    async fn handle_spawn(&self, agent_id: &str, payload: ControlPayload) {
        // A second spawn for a live agent is a prompt feed, not a restart.
        if self.active.lock().await.contains_key(agent_id) {
            if let Some(prompt) = payload.prompt {
                info!(agent_id, "agent already running, feeding prompt");
                self.feed_stdin(agent_id, &prompt).await;
            } else {
                debug!(agent_id, "agent already running, spawn ignored");
            }
            return;
        }

        let model = payload
            .model
            .clone()
            .or_else(|| model_from_args(payload.args.as_deref()));
        let preferred = self.pick_backend(model.as_deref(), payload.name.as_deref());

        let discovered = find_agents_on_path();
        let Some(candidate) =
            resolve_agent_binary(Some(preferred.as_str()), &self.overrides, &discovered)
        else {
            error!(agent_id, backend = %preferred, "no agent binary found");
            self.transport.send_status(agent_id, AgentState::Error);
            return;
        };

        let raw_prompt = payload.prompt.unwrap_or_default();
        let compacted = compact(&raw_prompt, &self.policy);
        if compacted.action != CompactionAction::None {
            warn!(
                agent_id,
                reason = compacted.reason.unwrap_or("unknown"),
                original_chars = compacted.original_len,
                final_chars = compacted.final_len,
                "prompt compacted before spawn"
            );
        }

        let request = SpawnRequest {
            agent: AgentSpec {
                id: agent_id.to_owned(),
                name: candidate.name.clone(),
                model: model.unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            },
            prompt: compacted.prompt,
            extra_args: payload
                .args
                .unwrap_or_else(|| self.default_args.clone()),
            executable_path: Some(candidate.path.clone()),
        };

        let mut spawned = match spawn_agent(&request, &self.overrides).await {
            Ok(spawned) => spawned,
            Err(err) => {
                error!(agent_id, %err, "agent spawn failed");
                self.transport.send_status(agent_id, AgentState::Error);
                return;
            }
        };

        info!(
            agent_id,
            backend = %candidate.name,
            model = %request.agent.model,
            pid = spawned.pid,
            command = %spawned.command,
            "agent started"
        );

        if let Some(stdout) = spawned.child.stdout.take() {
            drop(pipe::spawn_pipe(
                agent_id.to_owned(),
                LogStream::Stdout,
                stdout,
                Arc::clone(&self.buffer),
                self.transport.clone(),
            ));
        } else {
            warn!(agent_id, "child has no stdout pipe");
        }
        if let Some(stderr) = spawned.child.stderr.take() {
            drop(pipe::spawn_pipe(
                agent_id.to_owned(),
                LogStream::Stderr,
                stderr,
                Arc::clone(&self.buffer),
                self.transport.clone(),
            ));
        } else {
            warn!(agent_id, "child has no stderr pipe");
        }

        let kill = CancellationToken::new();
        let handle = AgentHandle {
            backend: candidate.name,
            model: request.agent.model.clone(),
            pid: spawned.pid,
            started_at: spawned.started_at.clone(),
            prompt_mode: spawned.prompt_mode,
            stdin: spawned.child.stdin.take(),
            kill: kill.clone(),
        };
        self.active
            .lock()
            .await
            .insert(agent_id.to_owned(), handle);

        self.transport.send_status(agent_id, AgentState::Running);

        drop(spawn_exit_monitor(
            agent_id.to_owned(),
            spawned.child,
            kill,
            Arc::clone(&self.active),
            self.transport.clone(),
        ));
    }

    /// Resolve which backend a spawn should use.
    ///
    /// The command-line preference wins outright; otherwise the model
    /// prefix decides, then a recognized payload name, then the default.
    fn pick_backend(&self, model: Option<&str>, name: Option<&str>) -> String {
        if let Some(preferred) = &self.preferred_agent {
            return preferred.clone();
        }
        if let Some(model) = model {
            if model.starts_with("gemini-") {
                return Backend::Gemini.command_name().to_owned();
            }
            if model.starts_with("claude-") {
                return Backend::Claude.command_name().to_owned();
            }
            if model.contains("codex") || model.starts_with("gpt-") {
                return Backend::Codex.command_name().to_owned();
            }
        }
        if let Some(name @ ("codex" | "gemini" | "claude")) = name {
            name.to_owned()
        } else {
            Backend::Codex.command_name().to_owned()
        }
    }

    // ── Stop and feeds ────────────────────────────────────────────────

    async fn handle_stop(&self, agent_id: &str) {
        let active = self.active.lock().await;
        if let Some(handle) = active.get(agent_id) {
            info!(agent_id, pid = handle.pid, "stopping agent");
            handle.kill.cancel();
        } else {
            debug!(agent_id, "stop for unknown agent, ignoring");
        }
    }

    /// Write `data` (compacted, newline-terminated) to the agent's stdin.
    async fn feed_stdin(&self, agent_id: &str, data: &str) {
        let mut active = self.active.lock().await;
        let Some(handle) = active.get_mut(agent_id) else {
            debug!(agent_id, "stdin feed for unknown agent, dropping");
            return;
        };
        let Some(stdin) = handle.stdin.as_mut() else {
            debug!(agent_id, "stdin already closed, dropping feed");
            return;
        };

        let compacted = compact(data, &self.policy);
        if compacted.action != CompactionAction::None {
            warn!(
                agent_id,
                reason = compacted.reason.unwrap_or("unknown"),
                original_chars = compacted.original_len,
                final_chars = compacted.final_len,
                "stdin feed compacted"
            );
        }
        let mut line = compacted.prompt;
        if !line.ends_with('\n') {
            line.push('\n');
        }
        if let Err(err) = stdin.write_all(line.as_bytes()).await {
            warn!(agent_id, %err, "stdin write failed, closing");
            handle.stdin = None;
        }
    }
}

// ── Exit monitoring ───────────────────────────────────────────────────────

/// Wait for the child to exit (or for a stop request), then clean up and
/// report the terminal state.
fn spawn_exit_monitor(
    agent_id: String,
    mut child: tokio::process::Child,
    kill: CancellationToken,
    active: Registry,
    transport: TransportHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            () = kill.cancelled() => {
                if let Err(err) = child.start_kill() {
                    warn!(agent_id, %err, "kill failed");
                }
                child.wait().await
            }
        };

        match status {
            Ok(status) => info!(agent_id, code = status.code(), "agent exited"),
            Err(err) => warn!(agent_id, %err, "wait on agent failed"),
        }

        active.lock().await.remove(&agent_id);
        transport.send_status(&agent_id, AgentState::Exited);
    })
}

/// Recover a model name from a raw argument vector (`--model` / `-m`).
fn model_from_args(args: Option<&[String]>) -> Option<String> {
    let args = args?;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--model" || arg == "-m" {
            return iter.next().cloned();
        }
    }
    None
}
