//! Line-based unified diff between two candidate texts.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op<'a> {
    Equal(&'a str),
    Delete(&'a str),
    Insert(&'a str),
}

/// Longest-common-subsequence edit script over lines.
fn edit_script<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<Op<'a>> {
    let (n, m) = (old.len(), new.len());
    // lcs[i][j] = LCS length of old[i..] and new[j..]
    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }
    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push(Op::Equal(old[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            ops.push(Op::Delete(old[i]));
            i += 1;
        } else {
            ops.push(Op::Insert(new[j]));
            j += 1;
        }
    }
    ops.extend(old[i..].iter().copied().map(Op::Delete));
    ops.extend(new[j..].iter().copied().map(Op::Insert));
    ops
}

/// Render a unified diff with `context` lines around each change. Returns
/// an empty string when the texts are identical.
pub fn unified_diff(old: &str, new: &str, old_label: &str, new_label: &str, context: usize) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let ops = edit_script(&old_lines, &new_lines);
    if ops.iter().all(|op| matches!(op, Op::Equal(_))) {
        return String::new();
    }

    // Group changed op indices into hunks, merging hunks whose context overlaps.
    let changed: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Equal(_)))
        .map(|(i, _)| i)
        .collect();
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for idx in changed {
        let start = idx.saturating_sub(context);
        let end = (idx + context + 1).min(ops.len());
        match ranges.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => ranges.push((start, end)),
        }
    }

    let mut out = format!("--- {}\n+++ {}\n", old_label, new_label);
    for (start, end) in ranges {
        // Line numbers (1-based) at the start of the hunk.
        let mut old_no = 1;
        let mut new_no = 1;
        for op in &ops[..start] {
            match op {
                Op::Equal(_) => {
                    old_no += 1;
                    new_no += 1;
                }
                Op::Delete(_) => old_no += 1,
                Op::Insert(_) => new_no += 1,
            }
        }
        let hunk = &ops[start..end];
        let old_len = hunk.iter().filter(|o| !matches!(o, Op::Insert(_))).count();
        let new_len = hunk.iter().filter(|o| !matches!(o, Op::Delete(_))).count();
        let old_start = if old_len == 0 { old_no - 1 } else { old_no };
        let new_start = if new_len == 0 { new_no - 1 } else { new_no };
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            old_start, old_len, new_start, new_len
        ));
        for op in hunk {
            let (prefix, line) = match op {
                Op::Equal(l) => (' ', l),
                Op::Delete(l) => ('-', l),
                Op::Insert(l) => ('+', l),
            };
            out.push(prefix);
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}
