//! Inline directive extraction (`/think`, `/verbose`).
//!
//! Directives modify the current turn only. They are recognized
//! case-insensitively when preceded by start-of-string or whitespace, with
//! an optional colon, and each is stripped at most once per invocation.
//! An unrecognized argument leaves the directive in the text and reports no
//! level. This parser never fails.

use regex::Regex;
use std::sync::OnceLock;

/// Reasoning effort requested by a `/think` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkLevel {
    Off,
    Low,
    Medium,
    High,
    Max,
}

impl ThinkLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Max => "max",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "min" | "minimal" | "low" => Some(Self::Low),
            "thinkhard" | "think-hard" | "medium" | "mid" | "med" => Some(Self::Medium),
            "thinkharder" | "high" => Some(Self::High),
            "ultra" | "ultrathink" | "max" => Some(Self::Max),
            _ => None,
        }
    }
}

/// Verbosity requested by a `/verbose` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerboseLevel {
    On,
    Off,
}

impl VerboseLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "on" | "true" | "yes" | "1" | "full" => Some(Self::On),
            "off" | "false" | "no" | "0" => Some(Self::Off),
            _ => None,
        }
    }
}

/// Result of one extraction pass over user text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDirectives {
    pub cleaned_text: String,
    pub think_level: Option<ThinkLevel>,
    pub verbose_level: Option<VerboseLevel>,
    pub has_directives: bool,
}

fn think_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(^|\s)/(?:thinking|think|t):?(\s+\S+)?").unwrap())
}

fn verbose_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(^|\s)/(?:verbose|v):?(\s+\S+)?").unwrap())
}

/// Strip recognized directives from `text` and report the effective levels.
pub fn parse_directives(text: &str) -> ParsedDirectives {
    let mut cleaned = text.to_string();
    let mut think_level = None;
    let mut verbose_level = None;
    let mut stripped_any = false;

    if let Some((next, level)) = strip_one(&cleaned, think_pattern(), ThinkLevel::parse) {
        cleaned = next;
        think_level = Some(level);
        stripped_any = true;
    }
    if let Some((next, level)) = strip_one(&cleaned, verbose_pattern(), VerboseLevel::parse) {
        cleaned = next;
        verbose_level = Some(level);
        stripped_any = true;
    }

    if stripped_any {
        cleaned = crate::util::collapse_whitespace(&cleaned);
    }

    ParsedDirectives {
        cleaned_text: cleaned,
        think_level,
        verbose_level,
        has_directives: stripped_any,
    }
}

/// Strip the first occurrence whose argument parses to a level. Returns the
/// rewritten text and the level, or None when nothing strippable was found.
fn strip_one<L>(
    text: &str,
    pattern: &Regex,
    parse: impl Fn(&str) -> Option<L>,
) -> Option<(String, L)> {
    let caps = pattern.captures(text)?;
    let level = parse(caps.get(2)?.as_str().trim())?;

    let whole = caps.get(0).unwrap();
    let lead = caps.get(1).map_or("", |m| m.as_str());
    let mut next = String::with_capacity(text.len());
    next.push_str(&text[..whole.start()]);
    next.push_str(lead);
    next.push_str(&text[whole.end()..]);
    Some((next, level))
}
