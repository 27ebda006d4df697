//! Text normalization and unified-diff patching.
//!
//! All text blobs are sanitized before hashing and comparison: carriage
//! returns are stripped and a trailing newline is enforced. Diffs are
//! generated with the `similar` crate and applied by a small unified-diff
//! interpreter; a context mismatch during application is a change
//! conflict.

use similar::TextDiff;

use crate::error::{Error, Result};

/// Normalize text: remove `\r` and append `\n` on the last line if the
/// text is non-empty and does not end with one. Idempotent.
pub fn sanitize(text: &str) -> String {
    let mut out = if text.contains('\r') {
        text.replace('\r', "")
    } else {
        text.to_string()
    };
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Render the difference between two texts as a unified diff with three
/// lines of context.
pub fn unified_diff(old: &str, new: &str, old_label: &str, new_label: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    let mut unified = diff.unified_diff();
    unified.context_radius(3).header(old_label, new_label).to_string()
}

struct Hunk {
    old_start: usize,
    old_count: usize,
    lines: Vec<(char, String)>,
}

fn parse_hunk_header(line: &str) -> Result<(usize, usize)> {
    // "@@ -l[,s] +l[,s] @@"
    let malformed = || Error::conflict(format!("malformed hunk header: {line}"));
    let body = line.trim_start_matches('@').trim_end_matches('@').trim();
    let mut parts = body.split_whitespace();
    let old_part = parts.next().ok_or_else(malformed)?;
    let old_part = old_part.strip_prefix('-').ok_or_else(malformed)?;

    let (start, count) = match old_part.split_once(',') {
        Some((s, c)) => (s, c),
        None => (old_part, "1"),
    };
    let start = start.parse::<usize>().map_err(|_| malformed())?;
    let count = count.parse::<usize>().map_err(|_| malformed())?;
    Ok((start, count))
}

fn parse_unified(patch: &str) -> Result<Vec<Hunk>> {
    let mut hunks: Vec<Hunk> = Vec::new();
    for line in patch.lines() {
        if line.starts_with("---") || line.starts_with("+++") {
            continue;
        }
        if line.starts_with("@@") {
            let (old_start, old_count) = parse_hunk_header(line)?;
            hunks.push(Hunk { old_start, old_count, lines: Vec::new() });
            continue;
        }
        let Some(hunk) = hunks.last_mut() else {
            if line.trim().is_empty() {
                continue;
            }
            return Err(Error::conflict(format!("unexpected patch line: {line}")));
        };
        match line.chars().next() {
            Some(tag @ (' ' | '+' | '-')) => hunk.lines.push((tag, line[1..].to_string())),
            // "\ No newline at end of file"
            Some('\\') => {}
            None => hunk.lines.push((' ', String::new())),
            Some(_) => return Err(Error::conflict(format!("unexpected patch line: {line}"))),
        }
    }
    Ok(hunks)
}

fn split_lines(text: &str) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    lines
}

/// Apply a unified diff to the given text.
///
/// Fails with a change conflict when a hunk's context does not match the
/// input. The result joins lines with `\n` and carries a trailing newline
/// unless it is empty.
pub fn apply_patch(old: &str, patch: &str) -> Result<String> {
    let hunks = parse_unified(patch)?;
    let old_lines = split_lines(old);
    let mut out: Vec<String> = Vec::new();
    let mut cursor = 0usize;

    for hunk in &hunks {
        // A zero-count hunk inserts after the named line; otherwise the
        // hunk starts at the named (1-based) line.
        let start = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start
                .checked_sub(1)
                .ok_or_else(|| Error::conflict("hunk start out of range"))?
        };
        if start < cursor || start > old_lines.len() {
            return Err(Error::conflict(format!(
                "hunk out of range at line {}",
                hunk.old_start
            )));
        }
        out.extend(old_lines[cursor..start].iter().map(|s| s.to_string()));
        cursor = start;

        for (tag, text) in &hunk.lines {
            match tag {
                ' ' | '-' => {
                    if old_lines.get(cursor) != Some(&text.as_str()) {
                        return Err(Error::conflict(format!(
                            "patch context mismatch at line {}: expected {:?}, found {:?}",
                            cursor + 1,
                            text,
                            old_lines.get(cursor).copied().unwrap_or("<eof>")
                        )));
                    }
                    if *tag == ' ' {
                        out.push(text.clone());
                    }
                    cursor += 1;
                }
                '+' => out.push(text.clone()),
                _ => unreachable!(),
            }
        }
    }

    out.extend(old_lines[cursor..].iter().map(|s| s.to_string()));
    if out.is_empty() {
        Ok(String::new())
    } else {
        Ok(out.join("\n") + "\n")
    }
}
