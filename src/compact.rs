//! Prompt compaction — character-budget enforcement for agent prompts.
//!
//! Backends reject or silently mangle oversized prompts, so every prompt
//! passes through [`compact`] before delivery. Depending on the
//! [`CompactionPolicy`] the result is the original text, an edge-preserving
//! truncation, or a rewrite that keeps the head and tail verbatim and
//! replaces the middle with a bullet summary of its most signal-bearing
//! lines.
//!
//! All sizes are measured in characters, not bytes, so multi-byte input
//! never gets cut inside a code point. Compaction is deterministic, pure,
//! and bounded by the input length; the caller is responsible for logging
//! the returned report.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

/// Marker inserted where edge-preserving truncation removed text.
const TRUNCATION_MARKER: &str = "\n\n[...prompt truncated...]\n\n";
/// Marker inserted before the summary of a removed middle section.
const SUMMARY_MARKER: &str = "\n\n[...prompt compacted; middle summarized...]\n\n";
/// Spacer between the rendered summary and the preserved tail.
const SUMMARY_SPACER: &str = "\n\n";
/// Below this many characters a summary is useless; fall back to truncation.
const MIN_SUMMARY_BUDGET: usize = 50;
/// Key lines longer than this are noise, not structure.
const MAX_KEY_LINE_CHARS: usize = 160;

const DEFAULT_MAX_CHARS: usize = 200_000;
const DEFAULT_SUMMARY_MAX_LINES: usize = 20;

/// Environment keys (new name first, legacy alias second) for each setting.
const ENV_CHAR_LIMIT: [&str; 2] = ["AGENT_LINK_PROMPT_CHAR_LIMIT", "CODEX_PROMPT_CHAR_LIMIT"];
const ENV_CHAR_THRESHOLD: [&str; 2] = [
    "AGENT_LINK_PROMPT_CHAR_THRESHOLD",
    "CODEX_PROMPT_CHAR_THRESHOLD",
];
const ENV_CHAR_TARGET: [&str; 2] = ["AGENT_LINK_PROMPT_CHAR_TARGET", "CODEX_PROMPT_CHAR_TARGET"];
const ENV_MODE: [&str; 2] = ["AGENT_LINK_PROMPT_COMPACT", "CODEX_PROMPT_COMPACT"];
const ENV_SUMMARY_LINES: [&str; 2] = [
    "AGENT_LINK_PROMPT_SUMMARY_LINES",
    "CODEX_PROMPT_SUMMARY_LINES",
];

/// How aggressively prompts are reduced once over the threshold.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum CompactionMode {
    /// Summarize, falling back to truncation on overflow.
    #[default]
    Auto,
    /// Same pipeline as `Auto`; kept as an explicit opt-in name.
    Summary,
    /// Always truncate to the target, never summarize.
    Truncate,
    /// Only the hard `max_chars` ceiling is enforced.
    Off,
}

impl CompactionMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "summary" => Some(Self::Summary),
            "truncate" => Some(Self::Truncate),
            "off" => Some(Self::Off),
            _ => None,
        }
    }
}

/// Size thresholds governing compaction.
///
/// Constructed values always satisfy `1 <= threshold_chars <= max_chars`
/// and `1 <= target_chars <= max_chars`; the compaction algorithm itself
/// never re-validates.
#[derive(Debug, Clone)]
pub struct CompactionPolicy {
    /// Hard ceiling enforced even in `Off` mode.
    pub max_chars: usize,
    /// Below or at this length no action is taken regardless of mode.
    pub threshold_chars: usize,
    /// Budget that truncation and summarization aim for.
    pub target_chars: usize,
    /// Active mode.
    pub mode: CompactionMode,
    /// Maximum bullet lines kept in a rendered summary.
    pub summary_max_lines: usize,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_CHARS,
            DEFAULT_MAX_CHARS * 9 / 10,
            DEFAULT_MAX_CHARS * 85 / 100,
            CompactionMode::Auto,
            DEFAULT_SUMMARY_MAX_LINES,
        )
    }
}

impl CompactionPolicy {
    /// Build a policy, clamping `threshold_chars` and `target_chars` into
    /// `1..=max_chars`.
    #[must_use]
    pub fn new(
        max_chars: usize,
        threshold_chars: usize,
        target_chars: usize,
        mode: CompactionMode,
        summary_max_lines: usize,
    ) -> Self {
        let max_chars = max_chars.max(1);
        Self {
            max_chars,
            threshold_chars: threshold_chars.clamp(1, max_chars),
            target_chars: target_chars.clamp(1, max_chars),
            mode,
            summary_max_lines,
        }
    }

    /// Resolve the policy from process environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Resolve the policy from an arbitrary key lookup.
    ///
    /// Each setting checks its new `AGENT_LINK_*` name first, then the
    /// legacy `CODEX_*` alias. Unparseable or non-positive values are
    /// ignored in favor of the defaults: max 200 000 chars, threshold 90%
    /// of max, target 85% of max, mode `auto`, 20 summary lines.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |keys: &[&str; 2]| keys.iter().find_map(|key| lookup(key));
        let int = |keys: &[&str; 2]| {
            get(keys)
                .and_then(|raw| raw.trim().parse::<usize>().ok())
                .filter(|value| *value > 0)
        };

        let max_chars = int(&ENV_CHAR_LIMIT).unwrap_or(DEFAULT_MAX_CHARS);
        let threshold_chars = int(&ENV_CHAR_THRESHOLD).unwrap_or(max_chars * 9 / 10);
        let target_chars = int(&ENV_CHAR_TARGET).unwrap_or(max_chars * 85 / 100);
        let mode = get(&ENV_MODE)
            .and_then(|raw| CompactionMode::parse(&raw))
            .unwrap_or_default();
        let summary_max_lines = int(&ENV_SUMMARY_LINES).unwrap_or(DEFAULT_SUMMARY_MAX_LINES);

        Self::new(max_chars, threshold_chars, target_chars, mode, summary_max_lines)
    }
}

/// What [`compact`] did to the prompt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CompactionAction {
    /// Prompt returned unchanged.
    None,
    /// Middle replaced with a rendered summary.
    Summary,
    /// Edge-preserving truncation applied.
    Truncate,
}

/// Result of a compaction pass: the (possibly reduced) prompt plus a
/// machine-readable report of what happened.
#[derive(Debug, Clone)]
pub struct Compacted {
    /// Final prompt text.
    pub prompt: String,
    /// Character count before compaction.
    pub original_len: usize,
    /// Character count after compaction.
    pub final_len: usize,
    /// Action taken.
    pub action: CompactionAction,
    /// Why the action fired: `hard-limit`, `policy-truncate`,
    /// `policy-summary`, or `summary-overflow`.
    pub reason: Option<&'static str>,
}

impl Compacted {
    fn unchanged(prompt: &str, len: usize) -> Self {
        Self {
            prompt: prompt.to_owned(),
            original_len: len,
            final_len: len,
            action: CompactionAction::None,
            reason: None,
        }
    }

    fn reduced(
        prompt: String,
        original_len: usize,
        action: CompactionAction,
        reason: &'static str,
    ) -> Self {
        let final_len = char_len(&prompt);
        Self {
            prompt,
            original_len,
            final_len,
            action,
            reason: Some(reason),
        }
    }
}

/// Enforce the policy on `prompt`.
///
/// Ordered algorithm: empty or at-or-below `threshold_chars` → unchanged;
/// `Off` → only the `max_chars` ceiling; `Truncate` → edge-preserving
/// truncation to `target_chars`; `Auto`/`Summary` → summarizing compaction,
/// falling back to truncation when the summary itself overflows the target.
#[must_use]
pub fn compact(prompt: &str, policy: &CompactionPolicy) -> Compacted {
    let original_len = char_len(prompt);
    if original_len == 0 || original_len <= policy.threshold_chars {
        return Compacted::unchanged(prompt, original_len);
    }

    match policy.mode {
        CompactionMode::Off => {
            if original_len <= policy.max_chars {
                return Compacted::unchanged(prompt, original_len);
            }
            let truncated = truncate_preserving_edges(prompt, policy.max_chars);
            Compacted::reduced(truncated, original_len, CompactionAction::Truncate, "hard-limit")
        }
        CompactionMode::Truncate => {
            let truncated = truncate_preserving_edges(prompt, policy.target_chars);
            Compacted::reduced(
                truncated,
                original_len,
                CompactionAction::Truncate,
                "policy-truncate",
            )
        }
        CompactionMode::Auto | CompactionMode::Summary => {
            let summarized =
                compact_with_summary(prompt, policy.target_chars, policy.summary_max_lines);
            if char_len(&summarized) <= policy.target_chars {
                return Compacted::reduced(
                    summarized,
                    original_len,
                    CompactionAction::Summary,
                    "policy-summary",
                );
            }
            let truncated = truncate_preserving_edges(&summarized, policy.target_chars);
            Compacted::reduced(
                truncated,
                original_len,
                CompactionAction::Truncate,
                "summary-overflow",
            )
        }
    }
}

/// Shorten `text` to at most `target_chars`, keeping both its start and its
/// end joined by [`TRUNCATION_MARKER`].
///
/// The beginning and end of a prompt carry the instructions and the
/// conclusions; the split is 60% head, 40% tail. When the target is too
/// small to fit the marker plus any content, a hard prefix cut is used
/// instead.
#[must_use]
pub fn truncate_preserving_edges(text: &str, target_chars: usize) -> String {
    let len = char_len(text);
    if len <= target_chars {
        return text.to_owned();
    }

    let marker_len = char_len(TRUNCATION_MARKER);
    if target_chars <= marker_len + 1 {
        return prefix_chars(text, target_chars).to_owned();
    }

    let available = target_chars - marker_len;
    let head_len = available * 6 / 10;
    let tail_len = available - head_len;
    format!(
        "{}{}{}",
        prefix_chars(text, head_len),
        TRUNCATION_MARKER,
        suffix_chars(text, tail_len)
    )
}

/// Summarizing compaction: keep ~30% head and ~30% tail verbatim and spend
/// the rest of the budget on a bullet summary of the removed middle.
///
/// When the target cannot fit the edges plus a summary of at least
/// [`MIN_SUMMARY_BUDGET`] characters, the result is a plain edge-preserving
/// truncation to the target instead.
fn compact_with_summary(text: &str, target_chars: usize, max_lines: usize) -> String {
    let len = char_len(text);
    if len <= target_chars {
        return text.to_owned();
    }

    let marker_len = char_len(SUMMARY_MARKER);
    let spacer_len = char_len(SUMMARY_SPACER);
    let head_budget = target_chars * 3 / 10;
    let tail_budget = target_chars * 3 / 10;

    let overhead = head_budget + tail_budget + marker_len + spacer_len;
    let summary_budget = target_chars.saturating_sub(overhead);
    if summary_budget < MIN_SUMMARY_BUDGET {
        return truncate_preserving_edges(text, target_chars);
    }

    let head = prefix_chars(text, head_budget);
    let tail = suffix_chars(text, tail_budget);
    let removed = middle_chars(text, head_budget, tail_budget);
    let summary = build_summary(removed, summary_budget, max_lines);

    format!("{head}{SUMMARY_MARKER}{summary}{SUMMARY_SPACER}{tail}")
}

/// Render the summary of a removed section within `max_chars`.
fn build_summary(removed: &str, max_chars: usize, max_lines: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }

    let lines = extract_key_lines(removed, max_lines);
    let body = if lines.is_empty() {
        "Summary unavailable; content removed.".to_owned()
    } else {
        lines
            .iter()
            .map(|line| format!("- {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut summary = format!("SUMMARY OF REMOVED CONTENT:\n{body}");
    if char_len(&summary) > max_chars {
        let cut = prefix_chars(&summary, max_chars.saturating_sub(3));
        summary = format!("{}...", cut.trim_end());
    }
    summary
}

/// Pick the most signal-bearing lines of `text`, in document order.
///
/// A line qualifies when it looks like structure (markdown heading, bullet,
/// or a short capitalized label ending in a colon) or contains a signal
/// word (`ERROR`, `WARN`, `TODO`, ...). Exact duplicates and lines over
/// [`MAX_KEY_LINE_CHARS`] are skipped; at most `max_lines` are returned.
fn extract_key_lines(text: &str, max_lines: usize) -> Vec<String> {
    static HEADING: OnceLock<Regex> = OnceLock::new();
    static SIGNAL: OnceLock<Regex> = OnceLock::new();
    let heading = HEADING.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // Literal pattern, cannot fail to compile.
        Regex::new(r"^(#+\s+|[*-]\s+|[A-Z][\w\s-]{0,40}:)").unwrap()
    });
    let signal = SIGNAL.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // Literal pattern, cannot fail to compile.
        Regex::new(r"(?i)(ERROR|WARN|WARNING|TODO|FIXME|NOTE|IMPORTANT)").unwrap()
    });

    let mut picked = Vec::new();
    let mut seen = HashSet::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if !heading.is_match(line) && !signal.is_match(line) {
            continue;
        }
        if char_len(line) > MAX_KEY_LINE_CHARS {
            continue;
        }
        if !seen.insert(line.to_owned()) {
            continue;
        }
        picked.push(line.to_owned());
        if picked.len() >= max_lines {
            break;
        }
    }

    picked
}

// ── Character-indexed slicing helpers ────────────────────────────────────────

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `n`-th character, or `s.len()` past the end.
fn byte_at_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(idx, _)| idx)
}

fn prefix_chars(s: &str, n: usize) -> &str {
    &s[..byte_at_char(s, n)]
}

fn suffix_chars(s: &str, n: usize) -> &str {
    let len = char_len(s);
    if n >= len {
        s
    } else {
        &s[byte_at_char(s, len - n)..]
    }
}

fn middle_chars(s: &str, head: usize, tail: usize) -> &str {
    let len = char_len(s);
    if head + tail >= len {
        return "";
    }
    &s[byte_at_char(s, head)..byte_at_char(s, len - tail)]
}
