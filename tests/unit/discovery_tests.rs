//! Unit tests for agent binary discovery and resolution.
//!
//! Covers:
//! - name inference from arbitrary executable paths
//! - resolution order: per-backend override, literal path, discovered name,
//!   first discovered
//! - PATH scanning against a temp directory (unix permission bits)

use agent_link::config::RunnerOverrides;
use agent_link::runner::discovery::{
    infer_name_from_path, resolve_agent_binary, AgentCandidate,
};

fn discovered() -> Vec<AgentCandidate> {
    vec![
        AgentCandidate {
            name: "codex".to_owned(),
            path: "/usr/bin/codex".to_owned(),
        },
        AgentCandidate {
            name: "gemini".to_owned(),
            path: "/usr/bin/gemini".to_owned(),
        },
    ]
}

/// File names classify by substring; unknown names fall to the default.
#[test]
fn name_inference_from_path() {
    assert_eq!(infer_name_from_path("/opt/tools/gemini-nightly"), "gemini");
    assert_eq!(infer_name_from_path("/home/u/bin/Claude.exe"), "claude");
    assert_eq!(infer_name_from_path("/usr/bin/codex"), "codex");
    assert_eq!(infer_name_from_path("/usr/bin/mystery-agent"), "codex");
}

/// A per-backend binary override wins immediately for its name.
#[test]
fn override_wins_for_preferred_name() {
    let overrides = RunnerOverrides {
        gemini_bin: Some("/opt/custom-gemini".to_owned()),
        ..RunnerOverrides::default()
    };

    let resolved = resolve_agent_binary(Some("gemini"), &overrides, &discovered())
        .expect("must resolve");
    assert_eq!(resolved.name, "gemini");
    assert_eq!(resolved.path, "/opt/custom-gemini");
}

/// A preferred value that exists on disk is taken as a literal path and
/// classified by its file name.
#[test]
fn literal_path_preference() {
    let temp = tempfile::tempdir().expect("tempdir");
    let binary = temp.path().join("my-claude-build");
    std::fs::write(&binary, b"#!/bin/sh\n").expect("write");
    let literal = binary.to_string_lossy().into_owned();

    let resolved =
        resolve_agent_binary(Some(&literal), &RunnerOverrides::default(), &discovered())
            .expect("must resolve");
    assert_eq!(resolved.name, "claude");
    assert_eq!(resolved.path, literal);
}

/// A known preferred name is looked up among discovered agents.
#[test]
fn preferred_name_matches_discovered() {
    let resolved =
        resolve_agent_binary(Some("codex"), &RunnerOverrides::default(), &discovered())
            .expect("must resolve");
    assert_eq!(resolved.path, "/usr/bin/codex");
}

/// A preference that matches nothing resolves to `None`.
#[test]
fn unknown_preference_resolves_none() {
    let resolved =
        resolve_agent_binary(Some("warpdrive"), &RunnerOverrides::default(), &discovered());
    assert!(resolved.is_none());
}

/// Without a preference the first discovered agent is used.
#[test]
fn no_preference_takes_first_discovered() {
    let resolved = resolve_agent_binary(None, &RunnerOverrides::default(), &discovered())
        .expect("must resolve");
    assert_eq!(resolved.name, "codex");
}

/// And with nothing discovered at all, resolution fails.
#[test]
fn empty_discovery_resolves_none() {
    assert!(resolve_agent_binary(None, &RunnerOverrides::default(), &[]).is_none());
}
