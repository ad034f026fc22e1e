//! Client configuration: the persisted pairing state and the environment
//! overrides resolved once at startup.
//!
//! Two distinct concerns live here:
//!
//! - [`ClientConfig`] — identity and server coordinates persisted as TOML
//!   under the config home (`$AGENT_LINK_HOME`, legacy alias
//!   `$REMOTE_AGENT_CLIENT_HOME`, default `~/.agent-link`). The refresh
//!   token is never written to the file; it lives in the OS keychain with
//!   an environment-variable fallback.
//! - [`RunnerOverrides`] — every per-backend environment override, resolved
//!   exactly once into a plain struct that is passed by value into the
//!   command builder and spawner. No component re-reads ambient process
//!   state at call time.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{AppError, Result};

/// Keychain service name for stored credentials.
const KEYRING_SERVICE: &str = "agent-link";
/// Keychain entry / env fallback for the refresh token.
const KEYRING_REFRESH_TOKEN: &str = "refresh_token";
const ENV_REFRESH_TOKEN: &str = "AGENT_LINK_REFRESH_TOKEN";

const ENV_HOME: [&str; 2] = ["AGENT_LINK_HOME", "REMOTE_AGENT_CLIENT_HOME"];

const ENV_CODEX_BIN: [&str; 2] = ["AGENT_LINK_CODEX_BIN", "CODEX_BIN"];
const ENV_CODEX_ARGS: [&str; 2] = ["AGENT_LINK_CODEX_ARGS", "CODEX_ARGS"];
const ENV_CODEX_PROMPT_FLAG: [&str; 2] = ["AGENT_LINK_CODEX_PROMPT_FLAG", "CODEX_PROMPT_FLAG"];
const ENV_PROMPT_MODE: [&str; 2] = ["AGENT_LINK_PROMPT_MODE", "CODEX_PROMPT_MODE"];
const ENV_TTY_MODE: [&str; 2] = ["AGENT_LINK_TTY_MODE", "CODEX_TTY_MODE"];
const ENV_TTY_TERM: [&str; 2] = ["AGENT_LINK_TTY_TERM", "CODEX_TTY_TERM"];
const ENV_CWD: [&str; 2] = ["AGENT_LINK_CWD", "CODEX_CWD"];
const ENV_GEMINI_BIN: [&str; 2] = ["AGENT_LINK_GEMINI_BIN", "GEMINI_BIN"];
const ENV_GEMINI_ARGS: [&str; 2] = ["AGENT_LINK_GEMINI_ARGS", "GEMINI_ARGS"];
const ENV_GEMINI_PROMPT_FLAG: [&str; 2] = ["AGENT_LINK_GEMINI_PROMPT_FLAG", "GEMINI_PROMPT_FLAG"];
const ENV_CLAUDE_BIN: [&str; 2] = ["AGENT_LINK_CLAUDE_BIN", "CLAUDE_BIN"];

/// Persisted client identity and server coordinates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// Stable identifier minted at first run, reported in `hello` envelopes.
    pub client_id: String,
    /// Base HTTP(S) URL of the orchestration server.
    #[serde(default)]
    pub server_url: Option<String>,
    /// Preferred agent binary name or path, if pinned.
    #[serde(default)]
    pub agent_binary: Option<String>,
    /// Long-lived refresh token. Kept out of the TOML file; stored in the
    /// OS keychain instead.
    #[serde(skip)]
    pub refresh_token: Option<String>,
}

impl ClientConfig {
    /// Fresh config with a newly minted client id.
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            server_url: None,
            agent_binary: None,
            refresh_token: None,
        }
    }

    /// Directory holding `config.toml`, honoring the home overrides.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when no home directory can be determined.
    pub fn config_dir() -> Result<PathBuf> {
        if let Some(dir) = ENV_HOME.iter().find_map(|key| env::var_os(key)) {
            return Ok(PathBuf::from(dir));
        }
        let home = env::var_os("HOME")
            .or_else(|| env::var_os("USERPROFILE"))
            .ok_or_else(|| AppError::Config("cannot determine home directory".into()))?;
        Ok(PathBuf::from(home).join(".agent-link"))
    }

    /// Default path of the persisted config file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when no home directory can be determined.
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load the config from `path`, or mint a fresh one when the file is
    /// missing or unreadable.
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(config) => config,
                Err(err) => {
                    warn!(%err, path = %path.display(), "config file invalid, starting fresh");
                    Self::fresh()
                }
            },
            Err(_) => Self::fresh(),
        }
    }

    /// Persist the config as TOML, creating parent directories as needed.
    /// The refresh token is skipped by serialization.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on serialization failure or `AppError::Io`
    /// on write failure.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }

    /// Populate `refresh_token` from the OS keychain, falling back to the
    /// `AGENT_LINK_REFRESH_TOKEN` environment variable. Absence is not an
    /// error — an unpaired client simply runs offline.
    pub async fn load_credentials(&mut self) {
        self.refresh_token = load_refresh_token().await;
    }
}

/// Load the refresh token from keychain or env, if present.
async fn load_refresh_token() -> Option<String> {
    let keychain = tokio::task::spawn_blocking(|| {
        keyring::Entry::new(KEYRING_SERVICE, KEYRING_REFRESH_TOKEN)
            .and_then(|entry| entry.get_password())
    })
    .await;

    match keychain {
        Ok(Ok(value)) if !value.is_empty() => return Some(value),
        Ok(Ok(_)) | Ok(Err(keyring::Error::NoEntry)) => {}
        Ok(Err(err)) => {
            warn!(%err, "keychain lookup failed, trying env var");
        }
        Err(err) => {
            warn!(%err, "keychain task panicked, trying env var");
        }
    }

    env::var(ENV_REFRESH_TOKEN).ok().filter(|v| !v.is_empty())
}

/// Store the refresh token in the OS keychain.
///
/// # Errors
///
/// Returns `AppError::Config` when the keychain rejects the write; the
/// caller may still proceed with the in-memory token.
pub async fn store_refresh_token(token: &str) -> Result<()> {
    let token = token.to_owned();
    tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, KEYRING_REFRESH_TOKEN)
            .and_then(|entry| entry.set_password(&token))
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?
    .map_err(|err| AppError::Config(format!("cannot store refresh token: {err}")))
}

/// How the prompt reaches the agent process.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum PromptMode {
    /// Prompt text embedded in the argument vector.
    #[default]
    Args,
    /// Prompt written to the child's standard input, then the stream closed.
    Stdin,
}

impl PromptMode {
    /// Lowercase name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Args => "args",
            Self::Stdin => "stdin",
        }
    }
}

/// Whether to wrap `exec`-style invocations in a pseudo-terminal.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum TtyMode {
    /// Wrap only when the argv contains the `exec` token.
    #[default]
    Auto,
    /// Always wrap.
    Script,
    /// Never wrap.
    Never,
}

/// All per-backend environment overrides, resolved once at startup.
///
/// Every setting checks its new `AGENT_LINK_*` name first, then the legacy
/// alias (`CODEX_*`, `GEMINI_*`, `CLAUDE_*`).
#[derive(Debug, Clone, Default)]
pub struct RunnerOverrides {
    /// Default-backend binary override.
    pub codex_bin: Option<String>,
    /// Default-backend base arguments (whitespace-separated); `None` keeps
    /// the built-in `exec --skip-git-repo-check`.
    pub codex_args: Option<String>,
    /// Optional flag placed before the prompt in argv mode.
    pub codex_prompt_flag: Option<String>,
    /// Prompt delivery mode for the default backend.
    pub prompt_mode: PromptMode,
    /// TTY wrapping behavior.
    pub tty_mode: TtyMode,
    /// `TERM` value set when the wrapper is active; `None` keeps `dumb`.
    pub tty_term: Option<String>,
    /// Working directory for spawned agents; `None` keeps the current dir.
    pub working_dir: Option<PathBuf>,
    /// Gemini binary override.
    pub gemini_bin: Option<String>,
    /// Gemini base arguments; `None` keeps the empty default.
    pub gemini_args: Option<String>,
    /// Gemini prompt flag; `None` keeps `-p`.
    pub gemini_prompt_flag: Option<String>,
    /// Claude binary override.
    pub claude_bin: Option<String>,
}

impl RunnerOverrides {
    /// Resolve all overrides from process environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::resolve(|key| env::var(key).ok())
    }

    /// Resolve all overrides from an arbitrary key lookup.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |keys: &[&str; 2]| keys.iter().find_map(|key| lookup(key));

        let prompt_mode = if get(&ENV_PROMPT_MODE).as_deref() == Some("stdin") {
            PromptMode::Stdin
        } else {
            PromptMode::Args
        };
        let tty_mode = match get(&ENV_TTY_MODE).as_deref() {
            Some("script") => TtyMode::Script,
            Some("never" | "off") => TtyMode::Never,
            _ => TtyMode::Auto,
        };

        Self {
            codex_bin: get(&ENV_CODEX_BIN),
            codex_args: get(&ENV_CODEX_ARGS),
            codex_prompt_flag: get(&ENV_CODEX_PROMPT_FLAG),
            prompt_mode,
            tty_mode,
            tty_term: get(&ENV_TTY_TERM),
            working_dir: get(&ENV_CWD).map(PathBuf::from),
            gemini_bin: get(&ENV_GEMINI_BIN),
            gemini_args: get(&ENV_GEMINI_ARGS),
            gemini_prompt_flag: get(&ENV_GEMINI_PROMPT_FLAG),
            claude_bin: get(&ENV_CLAUDE_BIN),
        }
    }
}
