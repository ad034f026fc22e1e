//! Per-backend command synthesis.
//!
//! [`build_command`] is a pure function of the spawn request and the
//! startup-resolved [`RunnerOverrides`]: it never reads ambient process
//! state and never touches the OS, which is what makes every backend
//! convention unit-testable. The spawner ([`super::spawn`]) owns the
//! process side.

use crate::config::{PromptMode, RunnerOverrides};

/// Built-in base arguments of the default backend.
const DEFAULT_CODEX_ARGS: &str = "exec --skip-git-repo-check";
/// Built-in prompt flag of the gemini backend.
const DEFAULT_GEMINI_PROMPT_FLAG: &str = "-p";
/// Placeholder substituted with the prompt text when present in a base arg.
const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Supported backend conventions, selected by model-name prefix.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Backend {
    /// `gemini-*` models.
    Gemini,
    /// `claude-*` models.
    Claude,
    /// Everything else: the general-purpose codex convention.
    Codex,
}

impl Backend {
    /// Dispatch by model-name prefix, checked in this order: `gemini-*`,
    /// `claude-*`, default.
    #[must_use]
    pub fn for_model(model: &str) -> Self {
        if model.starts_with("gemini-") {
            Self::Gemini
        } else if model.starts_with("claude-") {
            Self::Claude
        } else {
            Self::Codex
        }
    }

    /// Bare command name used when no override resolves a path.
    #[must_use]
    pub fn command_name(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

/// Identity of the agent an invocation is built for.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    /// Session id assigned by the server.
    pub id: String,
    /// Backend name (`codex`, `gemini`, `claude`).
    pub name: String,
    /// Target model.
    pub model: String,
}

/// One agent invocation request, constructed per control message and
/// consumed by the builder.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Agent identity.
    pub agent: AgentSpec,
    /// Prompt text (already compacted by the caller).
    pub prompt: String,
    /// Caller-supplied extra argv entries.
    pub extra_args: Vec<String>,
    /// Explicit executable path; wins over every other resolution step.
    pub executable_path: Option<String>,
}

/// Concrete invocation produced by [`build_command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCommand {
    /// Executable path or bare command name.
    pub command: String,
    /// Argument vector.
    pub args: Vec<String>,
    /// How the prompt is delivered.
    pub prompt_mode: PromptMode,
}

/// Produce the executable, argv, and prompt-delivery mode for a request.
///
/// Executable resolution order per backend — explicit path, then env-derived
/// override, then bare command name — must be preserved: it is the only way
/// callers can redirect execution in constrained environments.
///
/// `mode_override` forces the default backend into a specific delivery mode
/// (used by the argument-length fallback); gemini and claude always use
/// argv delivery.
#[must_use]
pub fn build_command(
    request: &SpawnRequest,
    overrides: &RunnerOverrides,
    mode_override: Option<PromptMode>,
) -> BuiltCommand {
    match Backend::for_model(&request.agent.model) {
        Backend::Gemini => build_gemini(request, overrides),
        Backend::Claude => build_claude(request, overrides),
        Backend::Codex => build_codex(request, overrides, mode_override),
    }
}

fn build_gemini(request: &SpawnRequest, overrides: &RunnerOverrides) -> BuiltCommand {
    let command = resolve_command(request, overrides.gemini_bin.as_deref(), Backend::Gemini);
    let mut args = split_args(overrides.gemini_args.as_deref().unwrap_or(""));

    args.extend(request.extra_args.iter().cloned());

    if !has_any(&args, &["--model", "-m"]) {
        args.push("--model".into());
        args.push(request.agent.model.clone());
    }
    if !has_any(&args, &["--approval-mode"]) {
        args.push("--approval-mode".into());
        args.push("auto_edit".into());
    }

    let prompt_flag = overrides
        .gemini_prompt_flag
        .as_deref()
        .unwrap_or(DEFAULT_GEMINI_PROMPT_FLAG);
    args.push(prompt_flag.into());
    args.push(request.prompt.clone());

    BuiltCommand {
        command,
        args,
        prompt_mode: PromptMode::Args,
    }
}

fn build_claude(request: &SpawnRequest, overrides: &RunnerOverrides) -> BuiltCommand {
    let command = resolve_command(request, overrides.claude_bin.as_deref(), Backend::Claude);
    // Fixed argument shape. Extra args are dropped on purpose: the claude
    // flag surface is not safe to extend generically.
    let args = vec![
        "-p".into(),
        request.prompt.clone(),
        "--model".into(),
        request.agent.model.clone(),
    ];

    BuiltCommand {
        command,
        args,
        prompt_mode: PromptMode::Args,
    }
}

fn build_codex(
    request: &SpawnRequest,
    overrides: &RunnerOverrides,
    mode_override: Option<PromptMode>,
) -> BuiltCommand {
    let command = resolve_command(request, overrides.codex_bin.as_deref(), Backend::Codex);
    let mut args = split_args(overrides.codex_args.as_deref().unwrap_or(DEFAULT_CODEX_ARGS));
    let prompt_mode = mode_override.unwrap_or(overrides.prompt_mode);

    let extra: Vec<&String> = request
        .extra_args
        .iter()
        .filter(|arg| !arg.trim().is_empty())
        .collect();
    args.extend(extra.into_iter().cloned());

    if !has_any(&args, &["--model", "-m"]) {
        args.push("--model".into());
        args.push(request.agent.model.clone());
    }

    if prompt_mode == PromptMode::Args {
        if let Some(slot) = args.iter_mut().find(|arg| arg.contains(PROMPT_PLACEHOLDER)) {
            *slot = slot.replacen(PROMPT_PLACEHOLDER, &request.prompt, 1);
        } else {
            if let Some(flag) = overrides.codex_prompt_flag.as_deref() {
                if !flag.is_empty() {
                    args.push(flag.into());
                }
            }
            args.push(request.prompt.clone());
        }
    }
    // Stdin mode: the prompt never enters argv; the spawner writes it to the
    // child's standard input and closes the stream.

    BuiltCommand {
        command,
        args,
        prompt_mode,
    }
}

fn resolve_command(
    request: &SpawnRequest,
    bin_override: Option<&str>,
    backend: Backend,
) -> String {
    request
        .executable_path
        .clone()
        .or_else(|| bin_override.map(str::to_owned))
        .unwrap_or_else(|| backend.command_name().to_owned())
}

fn has_any(args: &[String], flags: &[&str]) -> bool {
    args.iter().any(|arg| flags.contains(&arg.as_str()))
}

/// Split a raw override string into argv entries on whitespace.
#[must_use]
pub fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_owned).collect()
}

/// Quote one token for `sh -c`: wrap in single quotes, escaping embedded
/// single quotes by closing the quote, inserting an escaped literal quote,
/// and reopening.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Render a full command line with every token shell-quoted.
#[must_use]
pub fn command_line(command: &str, args: &[String]) -> String {
    std::iter::once(command.to_owned())
        .chain(args.iter().cloned())
        .map(|token| shell_quote(&token))
        .collect::<Vec<_>>()
        .join(" ")
}
