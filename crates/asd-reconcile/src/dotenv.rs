//! Project dotenv reader/writer: `KEY=VALUE` lines, last-write-wins on
//! read, read-modify-write on write — preserving unrelated keys, blank
//! lines, and comments (spec.md §6's "writes preserve existing unrelated
//! keys and comments when possible").

use std::collections::HashMap;
use std::path::Path;

pub fn read_lines(path: &Path) -> std::io::Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn parse_kv(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let mut chars = key.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key, value))
}

/// Folds `lines` into a key/value map, last occurrence wins.
pub fn to_map(lines: &[String]) -> HashMap<String, String> {
    lines
        .iter()
        .filter_map(|l| parse_kv(l).map(|(k, v)| (k.to_string(), v.to_string())))
        .collect()
}

/// Applies `updates` to the dotenv at `path`: existing unrelated lines
/// (including comments and blank lines) are left untouched; a key already
/// present is rewritten in place; a new key is appended. Pairs whose value
/// already matches are skipped entirely (key-level idempotence). Returns
/// the keys that were actually written, in the order given.
pub fn apply_updates(path: &Path, updates: &[(String, String)]) -> std::io::Result<Vec<String>> {
    let mut lines = read_lines(path)?;
    let current = to_map(&lines);
    let mut written = Vec::new();

    for (key, value) in updates {
        if current.get(key).map(String::as_str) == Some(value.as_str()) {
            continue;
        }

        let rendered = format!("{key}={value}");
        let mut replaced = false;
        for line in lines.iter_mut() {
            if let Some((k, _)) = parse_kv(line) {
                if k == key {
                    *line = rendered.clone();
                    replaced = true;
                }
            }
        }
        if !replaced {
            lines.push(rendered);
        }
        written.push(key.clone());
    }

    if !written.is_empty() {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file_name = path
            .file_name()
            .map(|n| format!("{}.tmp", n.to_string_lossy()))
            .unwrap_or_else(|| ".env.tmp".to_string());
        let tmp_path = path.with_file_name(file_name);

        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, path)?;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_new_key_and_preserves_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "# header comment\nEXISTING=1\n\nOTHER=keep-me\n").unwrap();

        let written = apply_updates(&path, &[("NEW_KEY".to_string(), "value".to_string())]).unwrap();
        assert_eq!(written, vec!["NEW_KEY".to_string()]);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("# header comment"));
        assert!(content.contains("OTHER=keep-me"));
        assert!(content.contains("NEW_KEY=value"));
    }

    #[test]
    fn rewrites_existing_key_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "A=old\nB=unchanged\n").unwrap();

        apply_updates(&path, &[("A".to_string(), "new".to_string())]).unwrap();

        let lines = read_lines(&path).unwrap();
        assert_eq!(lines[0], "A=new");
        assert_eq!(lines[1], "B=unchanged");
    }

    #[test]
    fn idempotent_when_value_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "A=same\n").unwrap();
        let before = std::fs::metadata(&path).unwrap().modified().unwrap();

        let written = apply_updates(&path, &[("A".to_string(), "same".to_string())]).unwrap();
        assert!(written.is_empty());

        let after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn creates_file_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        assert!(!path.exists());

        apply_updates(&path, &[("A".to_string(), "1".to_string())]).unwrap();
        assert_eq!(to_map(&read_lines(&path).unwrap()).get("A"), Some(&"1".to_string()));
    }
}
