//! Commit-message trailer rewriting.
//!
//! Pure string manipulation: the worktree rewrites commits by feeding their
//! messages through [`add_trailers`]. The output is deterministic (values
//! sorted and de-duplicated, existing block preserved) so re-applying the
//! same trailers is a no-op and rewritten commits keep stable hashes.

/// A line is a trailer if it looks like `Key: value` with a token key.
fn is_trailer_line(line: &str) -> bool {
    match line.split_once(':') {
        Some((key, value)) => {
            !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !value.trim().is_empty()
        }
        None => false,
    }
}

fn trailer_key(line: &str) -> Option<&str> {
    line.split_once(':').map(|(key, _)| key)
}

fn trailer_value(line: &str) -> Option<&str> {
    line.split_once(':').map(|(_, value)| value.trim())
}

/// Split a message into (head lines, trailer block lines).
///
/// The trailer block is the final paragraph when every one of its lines
/// parses as a trailer; a message without a blank line has no block (the
/// subject alone is never a block).
fn split_message(message: &str) -> (Vec<&str>, Vec<&str>) {
    let lines: Vec<&str> = message.trim_end().lines().collect();

    let last_blank = lines.iter().rposition(|l| l.trim().is_empty());
    if let Some(idx) = last_blank {
        let tail = &lines[idx + 1..];
        if !tail.is_empty() && tail.iter().all(|l| is_trailer_line(l)) {
            let mut head: Vec<&str> = lines[..idx].to_vec();
            while head.last().is_some_and(|l| l.trim().is_empty()) {
                head.pop();
            }
            return (head, tail.to_vec());
        }
    }
    (lines, Vec::new())
}

/// Add `name: value` trailers to a commit message.
///
/// Existing trailers with other names (Signed-off-by and friends) are kept in
/// place; existing values for `name` are merged with `values`, sorted and
/// de-duplicated. Always returns a message with a trailing newline.
pub fn add_trailers(message: &str, name: &str, values: &[String]) -> String {
    let (head, block) = split_message(message);

    let mut merged: Vec<String> = block
        .iter()
        .filter(|l| trailer_key(l) == Some(name))
        .filter_map(|l| trailer_value(l).map(str::to_string))
        .collect();
    merged.extend(values.iter().map(|v| v.trim().to_string()));
    merged.sort();
    merged.dedup();

    let mut out_block: Vec<String> = block
        .iter()
        .filter(|l| trailer_key(l) != Some(name))
        .map(|l| l.to_string())
        .collect();
    out_block.extend(merged.into_iter().map(|v| format!("{}: {}", name, v)));

    let mut out = head.join("\n");
    if !out_block.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&out_block.join("\n"));
    }
    out.push('\n');
    out
}
