use phabreview_core::{ChangeGroup, LineKind, LineRef};

/// Extract a numbered snippet of the new file around `lines` in `path`.
///
/// Only lines that exist on the new side (context and added lines) are
/// considered. Lines inside `lines` are marked with `>`, the surrounding
/// `context` lines with a blank marker. Returns `None` when no diff line
/// falls in the window, e.g. for a path that is not part of the diff.
///
/// # Examples
///
/// ```
/// use phabreview_core::LineRef;
/// use phabreview_difflens::{parser::summarize, snippet::extract_snippet};
///
/// let diff = "diff --git a/a.py b/a.py\n--- a/a.py\n+++ b/a.py\n\
///             @@ -1,2 +1,3 @@\n\x20x = 1\n+y = 2\n\x20z = 3\n";
/// let groups = summarize(diff);
/// let snippet = extract_snippet(&groups, "a.py", LineRef::single(2), 1).unwrap();
/// assert_eq!(snippet, "  1: x = 1\n> 2: y = 2\n  3: z = 3");
/// ```
pub fn extract_snippet(
    groups: &[ChangeGroup],
    path: &str,
    lines: LineRef,
    context: u32,
) -> Option<String> {
    let group = groups.iter().find(|g| g.path == path)?;
    let from = lines.start.saturating_sub(context);
    let to = lines.end.saturating_add(context);

    let collected: Vec<String> = group
        .hunks
        .iter()
        .flat_map(|h| h.numbered_lines())
        .filter(|l| matches!(l.kind, LineKind::Context | LineKind::Added))
        .filter_map(|l| {
            let n = l.new?;
            if n < from || n > to {
                return None;
            }
            let marker = if n >= lines.start && n <= lines.end {
                '>'
            } else {
                ' '
            };
            Some(format!("{marker} {n}: {}", l.text))
        })
        .collect();

    if collected.is_empty() {
        None
    } else {
        Some(collected.join("\n"))
    }
}
