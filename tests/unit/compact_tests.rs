//! Unit tests for prompt compaction.
//!
//! Covers:
//! - no-op below the threshold, and the exact threshold boundary
//! - edge-preserving truncation (marker, head/tail split, small targets)
//! - summary mode (header, key-line extraction, spacing)
//! - truncation fallback when the target is too small for a summary
//! - `Off` mode hard ceiling
//! - policy clamping and environment resolution
//! - multi-byte input never split inside a code point

use agent_link::compact::{
    compact, truncate_preserving_edges, CompactionAction, CompactionMode, CompactionPolicy,
};

fn policy(max: usize, threshold: usize, target: usize, mode: CompactionMode) -> CompactionPolicy {
    CompactionPolicy::new(max, threshold, target, mode, 20)
}

fn chars(s: &str) -> usize {
    s.chars().count()
}

// ── No-op paths ─────────────────────────────────────────────────────────────

/// An empty prompt is returned unchanged with no action recorded.
#[test]
fn empty_prompt_is_unchanged() {
    let result = compact("", &policy(200, 180, 160, CompactionMode::Auto));

    assert_eq!(result.action, CompactionAction::None);
    assert_eq!(result.prompt, "");
    assert_eq!(result.original_len, 0);
    assert_eq!(result.final_len, 0);
    assert!(result.reason.is_none());
}

/// A prompt exactly at the threshold is not compacted.
#[test]
fn prompt_at_threshold_is_unchanged() {
    let prompt = "x".repeat(180);
    let result = compact(&prompt, &policy(200, 180, 160, CompactionMode::Auto));

    assert_eq!(result.action, CompactionAction::None);
    assert_eq!(result.prompt, prompt);
}

/// One character over the threshold triggers compaction.
#[test]
fn prompt_over_threshold_is_compacted() {
    let prompt = "x".repeat(181);
    let result = compact(&prompt, &policy(200, 180, 160, CompactionMode::Auto));

    assert_ne!(result.action, CompactionAction::None);
    assert!(chars(&result.prompt) <= 160, "result must fit the target");
}

/// The 190-char input against a 200/180/160 auto policy lands at or under
/// the target and reports what happened.
#[test]
fn short_overage_fits_target_under_auto() {
    let prompt = "y".repeat(190);
    let result = compact(&prompt, &policy(200, 180, 160, CompactionMode::Auto));

    assert_eq!(result.original_len, 190);
    assert!(result.final_len <= 160);
    assert_eq!(result.final_len, chars(&result.prompt));
    // 160 chars cannot fit head + tail + marker + a useful summary, so the
    // text is truncated instead; the result fits the target, so the pass
    // still reports as a summary action.
    assert_eq!(result.action, CompactionAction::Summary);
    assert_eq!(result.reason, Some("policy-summary"));
    assert!(result.prompt.contains("[...prompt truncated...]"));
}

// ── Truncation ──────────────────────────────────────────────────────────────

/// Truncation keeps the beginning and the end of the prompt around the
/// marker, with the head getting the larger share.
#[test]
fn truncation_preserves_both_edges() {
    let prompt = format!("{}{}{}", "A".repeat(400), "B".repeat(400), "C".repeat(400));
    let result = truncate_preserving_edges(&prompt, 200);

    assert!(chars(&result) <= 200);
    assert!(result.starts_with('A'), "head must survive");
    assert!(result.ends_with('C'), "tail must survive");
    assert!(result.contains("[...prompt truncated...]"));

    let head_len = result.chars().take_while(|c| *c == 'A').count();
    let tail_len = result.chars().rev().take_while(|c| *c == 'C').count();
    assert!(head_len > tail_len, "split must favor the head");
}

/// A target too small for the marker degrades to a hard prefix cut.
#[test]
fn tiny_target_degrades_to_prefix_cut() {
    let prompt = "abcdefghij".repeat(10);
    let result = truncate_preserving_edges(&prompt, 8);

    assert_eq!(result, "abcdefgh");
}

/// Text already within the target is returned unchanged.
#[test]
fn truncation_is_noop_within_target() {
    let result = truncate_preserving_edges("short", 100);
    assert_eq!(result, "short");
}

/// Truncate mode always truncates to the target once over the threshold.
#[test]
fn truncate_mode_reports_policy_truncate() {
    let prompt = "z".repeat(500);
    let result = compact(&prompt, &policy(1000, 100, 90, CompactionMode::Truncate));

    assert_eq!(result.action, CompactionAction::Truncate);
    assert_eq!(result.reason, Some("policy-truncate"));
    assert!(result.final_len <= 90);
}

// ── Off mode ────────────────────────────────────────────────────────────────

/// `Off` ignores the threshold until the hard ceiling is crossed.
#[test]
fn off_mode_only_enforces_hard_limit() {
    let inside = "q".repeat(150);
    let policy_off = policy(200, 100, 90, CompactionMode::Off);

    let result = compact(&inside, &policy_off);
    assert_eq!(result.action, CompactionAction::None);

    let outside = "q".repeat(250);
    let result = compact(&outside, &policy_off);
    assert_eq!(result.action, CompactionAction::Truncate);
    assert_eq!(result.reason, Some("hard-limit"));
    assert!(result.final_len <= 200);
}

// ── Summary mode ────────────────────────────────────────────────────────────

/// With a budget large enough for a real summary, the middle is replaced by
/// a bullet list of its structural lines, and head/tail stay verbatim.
#[test]
fn summary_keeps_edges_and_summarizes_middle() {
    let head = "HEAD-SECTION ".repeat(200);
    let middle = format!(
        "{}\n# Critical heading\nERROR: disk full\nplain filler line\n{}",
        "m".repeat(4000),
        "m".repeat(4000)
    );
    let tail = "TAIL-SECTION ".repeat(200);
    let prompt = format!("{head}{middle}{tail}");

    let result = compact(&prompt, &policy(20_000, 8000, 7000, CompactionMode::Summary));

    assert_eq!(result.action, CompactionAction::Summary);
    assert_eq!(result.reason, Some("policy-summary"));
    assert!(result.final_len <= 7000);
    assert!(result.prompt.starts_with("HEAD-SECTION"));
    assert!(result.prompt.ends_with("TAIL-SECTION "));
    assert!(result.prompt.contains("[...prompt compacted; middle summarized...]"));
    assert!(result.prompt.contains("SUMMARY OF REMOVED CONTENT:"));
    assert!(result.prompt.contains("- # Critical heading"));
    assert!(result.prompt.contains("- ERROR: disk full"));
    assert!(
        !result.prompt.contains("plain filler line"),
        "non-structural middle lines must not survive"
    );
}

/// A middle with no structural lines still renders a placeholder summary.
#[test]
fn summary_without_key_lines_uses_placeholder() {
    let prompt = format!("{}{}{}", "h".repeat(3000), "w ".repeat(3000), "t".repeat(3000));
    let result = compact(&prompt, &policy(20_000, 6000, 5000, CompactionMode::Auto));

    assert_eq!(result.action, CompactionAction::Summary);
    assert!(result.prompt.contains("Summary unavailable; content removed."));
}

// ── Policy construction and env resolution ──────────────────────────────────

/// Threshold and target are clamped into `1..=max_chars`.
#[test]
fn policy_clamps_threshold_and_target() {
    let p = CompactionPolicy::new(100, 500, 0, CompactionMode::Auto, 20);

    assert_eq!(p.max_chars, 100);
    assert_eq!(p.threshold_chars, 100);
    assert_eq!(p.target_chars, 1);
}

/// Defaults: 200k max, 90% threshold, 85% target, auto mode.
#[test]
fn policy_defaults() {
    let p = CompactionPolicy::default();

    assert_eq!(p.max_chars, 200_000);
    assert_eq!(p.threshold_chars, 180_000);
    assert_eq!(p.target_chars, 170_000);
    assert_eq!(p.mode, CompactionMode::Auto);
    assert_eq!(p.summary_max_lines, 20);
}

/// The new env name wins over the legacy alias; bad values fall back.
#[test]
fn policy_resolution_prefers_new_env_names() {
    let p = CompactionPolicy::resolve(|key| match key {
        "AGENT_LINK_PROMPT_CHAR_LIMIT" => Some("1000".to_owned()),
        "CODEX_PROMPT_CHAR_LIMIT" => Some("9999".to_owned()),
        "AGENT_LINK_PROMPT_COMPACT" => Some("truncate".to_owned()),
        "CODEX_PROMPT_SUMMARY_LINES" => Some("not-a-number".to_owned()),
        _ => None,
    });

    assert_eq!(p.max_chars, 1000);
    assert_eq!(p.threshold_chars, 900);
    assert_eq!(p.target_chars, 850);
    assert_eq!(p.mode, CompactionMode::Truncate);
    assert_eq!(p.summary_max_lines, 20);
}

/// The legacy alias applies when the new name is absent.
#[test]
fn policy_resolution_honors_legacy_alias() {
    let p = CompactionPolicy::resolve(|key| {
        (key == "CODEX_PROMPT_CHAR_LIMIT").then(|| "500".to_owned())
    });

    assert_eq!(p.max_chars, 500);
}

// ── Multi-byte safety ───────────────────────────────────────────────────────

/// Budgets count characters; truncating multi-byte text never panics and
/// never splits a code point.
#[test]
fn multibyte_text_is_cut_on_char_boundaries() {
    let prompt = "héllo wörld — ünïcode ".repeat(100);
    let result = compact(&prompt, &policy(400, 300, 250, CompactionMode::Truncate));

    assert_eq!(result.action, CompactionAction::Truncate);
    assert!(chars(&result.prompt) <= 250);
    assert!(result.prompt.is_char_boundary(result.prompt.len()));
}
