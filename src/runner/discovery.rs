//! PATH discovery of installed agent binaries.
//!
//! Scans `PATH` for the known backend CLIs and resolves the caller's
//! preference (name, path, or nothing) against what is installed and the
//! per-backend binary overrides.

use std::env;
use std::path::{Path, PathBuf};

use crate::config::RunnerOverrides;
use crate::runner::command::Backend;

/// Backend names probed on `PATH`, in preference order.
const AGENT_NAMES: [&str; 3] = ["codex", "gemini", "claude"];

/// One discovered (or overridden) agent binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCandidate {
    /// Backend name (`codex`, `gemini`, `claude`).
    pub name: String,
    /// Executable path (or bare override value).
    pub path: String,
}

/// Scan `PATH` for the supported agent CLIs.
///
/// Returns the first executable hit per name, in [`AGENT_NAMES`] order.
#[must_use]
pub fn find_agents_on_path() -> Vec<AgentCandidate> {
    let path_var = env::var_os("PATH").unwrap_or_default();
    let dirs: Vec<PathBuf> = env::split_paths(&path_var).collect();

    let mut found = Vec::new();
    for name in AGENT_NAMES {
        for dir in &dirs {
            let candidate = executable_in(dir, name);
            if let Some(path) = candidate {
                found.push(AgentCandidate {
                    name: name.to_owned(),
                    path: path.to_string_lossy().into_owned(),
                });
                break;
            }
        }
    }
    found
}

/// Resolve the agent binary for a spawn.
///
/// Lookup order, preserved exactly: per-backend binary override for the
/// preferred name; the preferred value taken as a literal path when it
/// exists on disk; the preferred name among `discovered`; otherwise the
/// first discovered agent. Returns `None` when nothing matches.
#[must_use]
pub fn resolve_agent_binary(
    preferred: Option<&str>,
    overrides: &RunnerOverrides,
    discovered: &[AgentCandidate],
) -> Option<AgentCandidate> {
    if let Some(name) = preferred {
        let bin_override = match name {
            "codex" => overrides.codex_bin.as_deref(),
            "gemini" => overrides.gemini_bin.as_deref(),
            "claude" => overrides.claude_bin.as_deref(),
            _ => None,
        };
        if let Some(path) = bin_override {
            return Some(AgentCandidate {
                name: name.to_owned(),
                path: path.to_owned(),
            });
        }

        if Path::new(name).exists() {
            return Some(AgentCandidate {
                name: infer_name_from_path(name),
                path: name.to_owned(),
            });
        }

        return discovered.iter().find(|agent| agent.name == name).cloned();
    }

    discovered.first().cloned()
}

/// Classify an arbitrary executable path by its file name.
#[must_use]
pub fn infer_name_from_path(agent_path: &str) -> String {
    let base = Path::new(agent_path)
        .file_name()
        .map_or_else(String::new, |name| name.to_string_lossy().to_lowercase());
    if base.contains("gemini") {
        Backend::Gemini.command_name().to_owned()
    } else if base.contains("claude") {
        Backend::Claude.command_name().to_owned()
    } else {
        Backend::Codex.command_name().to_owned()
    }
}

#[cfg(unix)]
fn executable_in(dir: &Path, name: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let full = dir.join(name);
    let meta = std::fs::metadata(&full).ok()?;
    if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
        Some(full)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn executable_in(dir: &Path, name: &str) -> Option<PathBuf> {
    for candidate in [dir.join(format!("{name}.exe")), dir.join(name)] {
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
