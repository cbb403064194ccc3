//! Line diffs for `assert_no_diff` diagnostics.

use std::fmt::Write as _;

/// Lines of context around each change.
const CONTEXT: usize = 3;

/// How lines are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffMode {
    /// Every line counts, including a missing final newline.
    #[default]
    Exact,
    /// Lines that are empty after trimming are dropped from both sides.
    IgnoreBlankLines,
}

impl DiffMode {
    pub fn from_flag(ignore_blank_lines: bool) -> Self {
        if ignore_blank_lines {
            DiffMode::IgnoreBlankLines
        } else {
            DiffMode::Exact
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Keep,
    Remove,
    Add,
}

#[derive(Debug)]
struct Line<'a> {
    edit: Edit,
    /// Index into the old side (next old line for additions).
    old: usize,
    /// Index into the new side (next new line for removals).
    new: usize,
    text: &'a str,
}

/// Unified-style diff of `expected` against `actual`, `None` when they agree.
pub fn unified_diff(
    expected: &str,
    actual: &str,
    mode: DiffMode,
    expected_label: &str,
    actual_label: &str,
) -> Option<String> {
    let old = lines(expected, mode);
    let new = lines(actual, mode);
    let script = edit_script(&old, &new);

    let changed: Vec<usize> = script
        .iter()
        .enumerate()
        .filter(|(_, line)| line.edit != Edit::Keep)
        .map(|(index, _)| index)
        .collect();

    let mut out = format!("--- {expected_label}\n+++ {actual_label}\n");
    if changed.is_empty() {
        if mode == DiffMode::Exact && expected != actual {
            out.push_str("\\ final newline differs\n");
            return Some(out);
        }
        return None;
    }

    let mut k = 0;
    while k < changed.len() {
        let start = changed[k].saturating_sub(CONTEXT);
        let mut end = changed[k];
        while k + 1 < changed.len() && changed[k + 1] - end <= 2 * CONTEXT + 1 {
            k += 1;
            end = changed[k];
        }
        let stop = (end + CONTEXT + 1).min(script.len());
        render_hunk(&script[start..stop], &mut out);
        k += 1;
    }
    Some(out)
}

fn lines(text: &str, mode: DiffMode) -> Vec<&str> {
    match mode {
        DiffMode::Exact => text.lines().collect(),
        DiffMode::IgnoreBlankLines => text.lines().filter(|line| !line.trim().is_empty()).collect(),
    }
}

/// Longest-common-subsequence edit script.
fn edit_script<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<Line<'a>> {
    let (n, m) = (old.len(), new.len());
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

    let mut script = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n || j < m {
        if i < n && j < m && old[i] == new[j] {
            script.push(Line { edit: Edit::Keep, old: i, new: j, text: old[i] });
            i += 1;
            j += 1;
        } else if j == m || (i < n && lcs[i + 1][j] >= lcs[i][j + 1]) {
            script.push(Line { edit: Edit::Remove, old: i, new: j, text: old[i] });
            i += 1;
        } else {
            script.push(Line { edit: Edit::Add, old: i, new: j, text: new[j] });
            j += 1;
        }
    }
    script
}

fn render_hunk(hunk: &[Line<'_>], out: &mut String) {
    let old_count = hunk.iter().filter(|line| line.edit != Edit::Add).count();
    let new_count = hunk.iter().filter(|line| line.edit != Edit::Remove).count();
    let first = &hunk[0];
    // An empty range names the line before it, as diff(1) does.
    let old_start = if old_count == 0 { first.old } else { first.old + 1 };
    let new_start = if new_count == 0 { first.new } else { first.new + 1 };

    let _ = writeln!(out, "@@ -{old_start},{old_count} +{new_start},{new_count} @@");
    for line in hunk {
        let marker = match line.edit {
            Edit::Keep => ' ',
            Edit::Remove => '-',
            Edit::Add => '+',
        };
        let _ = writeln!(out, "{marker}{}", line.text);
    }
}
