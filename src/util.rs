//! Small helpers shared across the gateway.

use anyhow::{Context, Result};
use std::path::Path;

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Safe for multi-byte UTF-8 (emoji, CJK) because it cuts on character
/// boundaries, never byte indices.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Collapse runs of whitespace into single spaces and trim the edges.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Write `payload` to `path` atomically: temp file in the same directory,
/// rename into place, then a best-effort `.bak` copy of the final file.
///
/// A write into a missing parent directory gets one mkdir+retry; persistent
/// IO failures surface to the caller so in-memory state stays authoritative.
pub fn write_atomic(path: &Path, payload: &str) -> Result<()> {
    let tmp = tmp_path(path);
    if let Err(err) = std::fs::write(&tmp, payload) {
        if err.kind() == std::io::ErrorKind::NotFound {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create parent directory: {}", parent.display())
                })?;
            }
            std::fs::write(&tmp, payload)
                .with_context(|| format!("Failed to write temp file: {}", tmp.display()))?;
        } else {
            return Err(err)
                .with_context(|| format!("Failed to write temp file: {}", tmp.display()));
        }
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename into place: {}", path.display()))?;

    let bak = path.with_extension(format!(
        "{}.bak",
        path.extension().and_then(|e| e.to_str()).unwrap_or("json")
    ));
    if let Err(err) = std::fs::copy(path, &bak) {
        tracing::debug!("Backup copy failed for {}: {err}", bak.display());
    }
    Ok(())
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let pid = std::process::id();
    let nonce: u32 = rand::random();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("store");
    path.with_file_name(format!("{name}.{pid}.{nonce:08x}.tmp"))
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(raw: &str) -> std::path::PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(dirs) = directories::UserDirs::new() {
            return dirs.home_dir().join(rest);
        }
    } else if raw == "~" {
        if let Some(dirs) = directories::UserDirs::new() {
            return dirs.home_dir().to_path_buf();
        }
    }
    std::path::PathBuf::from(raw)
}

/// Parse a human-friendly interval like `30m`, `1h`, `90s` into a duration.
pub fn parse_interval(raw: &str) -> Result<std::time::Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        anyhow::bail!("Empty interval");
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let (value, unit): (&str, char) = match unit.chars().next() {
        Some(u) if u.is_ascii_alphabetic() => (digits, u.to_ascii_lowercase()),
        _ => (raw, 's'),
    };
    let n: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("Invalid interval: {raw}"))?;
    let secs = match unit {
        's' => n,
        'm' => n * 60,
        'h' => n * 3600,
        'd' => n * 86_400,
        other => anyhow::bail!("Invalid interval unit '{other}' in: {raw}"),
    };
    if secs == 0 {
        anyhow::bail!("Interval must be positive: {raw}");
    }
    Ok(std::time::Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_handles_multibyte_input() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
        assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
        assert_eq!(truncate_with_ellipsis("", 10), "");
        let s = "日本語のテキスト";
        let cut = truncate_with_ellipsis(s, 3);
        assert!(cut.ends_with("..."));
        assert!(cut.is_char_boundary(cut.len() - 3));
    }

    #[test]
    fn collapse_whitespace_squeezes_runs() {
        assert_eq!(collapse_whitespace("  a\t b \n c  "), "a b c");
        assert_eq!(collapse_whitespace(""), "");
    }

    #[test]
    fn write_atomic_creates_parent_and_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("store.json");

        write_atomic(&path, "{\"v\":1}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"v\":1}");

        write_atomic(&path, "{\"v\":2}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"v\":2}");
        let bak = path.with_extension("json.bak");
        assert_eq!(std::fs::read_to_string(&bak).unwrap(), "{\"v\":2}");
    }

    #[test]
    fn write_atomic_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("store.json");
        write_atomic(&path, "x").unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn parse_interval_accepts_common_units() {
        assert_eq!(
            parse_interval("30m").unwrap(),
            std::time::Duration::from_secs(1800)
        );
        assert_eq!(
            parse_interval("1h").unwrap(),
            std::time::Duration::from_secs(3600)
        );
        assert_eq!(
            parse_interval("60s").unwrap(),
            std::time::Duration::from_secs(60)
        );
        assert_eq!(
            parse_interval("45").unwrap(),
            std::time::Duration::from_secs(45)
        );
        assert!(parse_interval("").is_err());
        assert!(parse_interval("10x").is_err());
        assert!(parse_interval("0s").is_err());
    }
}
