use std::fmt::Write;

use phabreview_core::ChangeGroup;

/// Render the grouped change summary shown before the review.
///
/// One block per file with at least one added or removed line:
///
/// ```text
/// foo.py
///   - Added lines 3-4:
///       import sys
///       import re
/// ```
///
/// Files without changed lines (pure renames, binaries) and unparsed text
/// are left out.
///
/// # Examples
///
/// ```
/// use phabreview_difflens::{parser::summarize, summary::render_summary};
///
/// let diff = "--- a/x.py\n+++ b/x.py\n@@ -1 +1 @@\n-a\n+b\n";
/// let text = render_summary(&summarize(diff));
/// assert_eq!(text, "x.py\n  - Removed line 1:\n      a\n  - Added line 1:\n      b");
/// ```
pub fn render_summary(groups: &[ChangeGroup]) -> String {
    let mut lines: Vec<String> = Vec::new();

    for group in groups {
        let runs = group.change_runs();
        if runs.is_empty() {
            continue;
        }
        let mut title = group.path.clone();
        if let Some(old) = &group.old_path {
            let _ = write!(title, " (renamed from {old})");
        }
        lines.push(title);

        for run in runs {
            lines.push(format!("  - {} {}:", run.kind, run.lines.label()));
            lines.extend(run.content.iter().map(|c| format!("      {c}")));
        }
    }

    lines.join("\n")
}
