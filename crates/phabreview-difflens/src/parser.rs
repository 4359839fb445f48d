use std::collections::HashMap;

use phabreview_core::{ChangeGroup, ChangeKind, DiffLine, Hunk, LineKind};

/// Split a raw unified diff into one [`ChangeGroup`] per file path.
///
/// Groups keep the order in which paths first appear; a path that shows up
/// in several sections is merged into a single group. Hunk bodies are read
/// using the line counts of their `@@` header, so removed lines beginning
/// with `--` are never mistaken for file headers.
///
/// Nothing is dropped: text that cannot be structured (malformed hunk
/// headers, stray lines, binary patch payloads) is kept verbatim in
/// [`ChangeGroup::unparsed`]. Text before the first file header ends up in a
/// leading group of kind [`ChangeKind::Unparsed`] with an empty path.
///
/// # Examples
///
/// ```
/// use phabreview_difflens::parser::summarize;
///
/// let diff = "diff --git a/foo.py b/foo.py\n\
///             --- a/foo.py\n\
///             +++ b/foo.py\n\
///             @@ -1,2 +1,3 @@\n\
///             \x20import os\n\
///             +import sys\n\
///             \x20print os.name\n";
/// let groups = summarize(diff);
/// assert_eq!(groups.len(), 1);
/// assert_eq!(groups[0].path, "foo.py");
/// assert_eq!(groups[0].hunks[0].lines.len(), 3);
/// ```
pub fn summarize(raw: &str) -> Vec<ChangeGroup> {
    let mut parser = Parser::default();
    let mut lines = split_lines(raw).peekable();
    while let Some(line) = lines.next() {
        parser.feed(line, lines.peek().copied());
    }
    parser.finish()
}

/// Split on `\n` only; a `\r` before it stays part of the line.
fn split_lines(raw: &str) -> impl Iterator<Item = &str> {
    raw.split_inclusive('\n')
        .map(|line| line.strip_suffix('\n').unwrap_or(line))
}

#[derive(Debug, Default)]
struct FileHeader {
    old_path: Option<String>,
    new_path: Option<String>,
    saw_old_marker: bool,
    is_new_file: bool,
    is_deleted_file: bool,
    is_rename: bool,
    is_binary: bool,
}

#[derive(Debug)]
struct OpenHunk {
    hunk: Hunk,
    old_left: u32,
    new_left: u32,
}

#[derive(Debug, Default)]
struct Parser {
    groups: Vec<ChangeGroup>,
    by_path: HashMap<String, usize>,
    header: Option<FileHeader>,
    current: Option<usize>,
    hunk: Option<OpenHunk>,
}

impl Parser {
    /// Consume one line. `next` is the following line, if any; a `--- `
    /// line only starts a file header when `+++ ` comes right after it.
    fn feed(&mut self, line: &str, next: Option<&str>) {
        if self.feed_hunk(line) {
            return;
        }

        // Header matching ignores a CRLF line ending; stored text keeps it.
        let bare = line.strip_suffix('\r').unwrap_or(line);

        if let Some(rest) = bare.strip_prefix("diff --git ") {
            self.start_file();
            let (old, new) = split_git_paths(rest);
            self.header = Some(FileHeader {
                old_path: old,
                new_path: new,
                ..FileHeader::default()
            });
            return;
        }

        let old_marker = bare
            .strip_prefix("--- ")
            .filter(|_| next.is_some_and(|n| n.starts_with("+++ ")));
        if let Some(path) = old_marker {
            let fresh = self.header.as_ref().map_or(true, |h| h.saw_old_marker);
            if fresh {
                // Plain patch without a `diff --git` line.
                self.start_file();
                self.header = Some(FileHeader::default());
            }
            if let Some(header) = self.header.as_mut() {
                let path = parse_path(path);
                if path == "/dev/null" {
                    header.is_new_file = true;
                } else {
                    header.old_path = Some(path);
                }
                header.saw_old_marker = true;
            }
            return;
        }

        if self.header.is_some() && self.feed_header(bare) {
            return;
        }

        if bare.starts_with("@@ ") {
            if let Some((old_start, old_lines, new_start, new_lines, heading)) =
                parse_hunk_header(bare)
            {
                let group = self.current_group();
                self.current = Some(group);
                self.hunk = Some(OpenHunk {
                    hunk: Hunk {
                        old_start,
                        old_lines,
                        new_start,
                        new_lines,
                        heading,
                        lines: Vec::new(),
                    },
                    old_left: old_lines,
                    new_left: new_lines,
                });
                return;
            }
            tracing::debug!(line, "malformed hunk header kept as raw text");
        }

        let group = self.current_group();
        self.groups[group].unparsed.push(line.to_string());
    }

    /// Consume `line` as part of the open hunk. Returns `false` when the
    /// line does not belong to it, closing the hunk.
    fn feed_hunk(&mut self, line: &str) -> bool {
        let Some(open) = self.hunk.as_mut() else {
            return false;
        };

        let first = match line.as_bytes() {
            [b'\r'] => None,
            bytes => bytes.first().copied(),
        };
        let kind = match first {
            Some(b'\\') => Some(LineKind::NoNewline),
            Some(b' ') | None if open.old_left > 0 && open.new_left > 0 => {
                open.old_left -= 1;
                open.new_left -= 1;
                Some(LineKind::Context)
            }
            Some(b'-') if open.old_left > 0 => {
                open.old_left -= 1;
                Some(LineKind::Removed)
            }
            Some(b'+') if open.new_left > 0 => {
                open.new_left -= 1;
                Some(LineKind::Added)
            }
            _ => None,
        };

        match kind {
            Some(kind) => {
                open.hunk.lines.push(DiffLine {
                    kind,
                    raw: line.to_string(),
                });
                true
            }
            None => {
                self.close_hunk();
                false
            }
        }
    }

    /// Apply an extended header line to the pending file header.
    fn feed_header(&mut self, line: &str) -> bool {
        let Some(header) = self.header.as_mut() else {
            return false;
        };

        if let Some(path) = line.strip_prefix("+++ ") {
            let path = parse_path(path);
            if path == "/dev/null" {
                header.is_deleted_file = true;
            } else {
                header.new_path = Some(path);
            }
        } else if line.starts_with("new file mode") {
            header.is_new_file = true;
        } else if line.starts_with("deleted file mode") {
            header.is_deleted_file = true;
        } else if let Some(path) = line
            .strip_prefix("rename from ")
            .or_else(|| line.strip_prefix("copy from "))
        {
            header.is_rename = true;
            header.old_path = Some(path.trim_matches('"').to_string());
        } else if let Some(path) = line
            .strip_prefix("rename to ")
            .or_else(|| line.strip_prefix("copy to "))
        {
            header.is_rename = true;
            header.new_path = Some(path.trim_matches('"').to_string());
        } else if (line.starts_with("Binary files ") && line.ends_with(" differ"))
            || line == "GIT binary patch"
        {
            header.is_binary = true;
        } else if !["index ", "old mode", "new mode", "similarity index", "dissimilarity index"]
            .iter()
            .any(|prefix| line.starts_with(prefix))
        {
            return false;
        }
        true
    }

    /// Index of the group receiving hunks and raw text, attaching the
    /// pending header or opening the leading unparsed group if needed.
    fn current_group(&mut self) -> usize {
        if let Some(header) = self.header.take() {
            let idx = self.attach(header);
            self.current = Some(idx);
            return idx;
        }
        if let Some(idx) = self.current {
            return idx;
        }
        let idx = self.group_for(String::new(), ChangeKind::Unparsed);
        self.current = Some(idx);
        idx
    }

    fn attach(&mut self, header: FileHeader) -> usize {
        let old = header.old_path.filter(|p| p != "/dev/null");
        let new = header.new_path.filter(|p| p != "/dev/null");
        let is_deleted = header.is_deleted_file || (new.is_none() && old.is_some());
        let is_new = header.is_new_file && !is_deleted;

        let path = if is_deleted {
            old.clone().or_else(|| new.clone())
        } else {
            new.clone().or_else(|| old.clone())
        }
        .unwrap_or_default();

        let renamed_from = match (&old, &new) {
            (Some(o), Some(n)) if header.is_rename && o != n => Some(o.clone()),
            _ => None,
        };

        let kind = if is_deleted {
            ChangeKind::Delete
        } else if is_new {
            ChangeKind::Add
        } else if renamed_from.is_some() {
            ChangeKind::Rename
        } else {
            ChangeKind::Modify
        };

        let idx = self.group_for(path, kind);
        let group = &mut self.groups[idx];
        group.is_binary |= header.is_binary;
        if group.old_path.is_none() {
            group.old_path = renamed_from;
        }
        idx
    }

    fn group_for(&mut self, path: String, kind: ChangeKind) -> usize {
        if let Some(&idx) = self.by_path.get(&path) {
            return idx;
        }
        let idx = self.groups.len();
        self.by_path.insert(path.clone(), idx);
        self.groups.push(ChangeGroup::new(path, kind));
        idx
    }

    fn close_hunk(&mut self) {
        if let Some(open) = self.hunk.take() {
            if open.old_left > 0 || open.new_left > 0 {
                tracing::debug!(
                    header = %open.hunk.header(),
                    old_left = open.old_left,
                    new_left = open.new_left,
                    "hunk shorter than its header announced"
                );
            }
            let idx = self.current_group();
            self.groups[idx].hunks.push(open.hunk);
        }
    }

    /// Close everything belonging to the previous file.
    fn start_file(&mut self) {
        self.close_hunk();
        if let Some(header) = self.header.take() {
            self.attach(header);
        }
        self.current = None;
    }

    fn finish(mut self) -> Vec<ChangeGroup> {
        self.start_file();
        self.groups
    }
}

/// Split the remainder of a `diff --git` line into old and new paths.
fn split_git_paths(rest: &str) -> (Option<String>, Option<String>) {
    let split = rest
        .find(" \"b/")
        .or_else(|| rest.find(" b/"))
        .or_else(|| rest.find(' '));
    match split {
        Some(idx) => (
            Some(parse_path(&rest[..idx])),
            Some(parse_path(&rest[idx + 1..])),
        ),
        None => (None, None),
    }
}

fn parse_path(raw: &str) -> String {
    // `+++ b/file\t2024-01-01 ...` carries a timestamp after a tab.
    let raw = raw.split('\t').next().unwrap_or(raw).trim_end();
    let normalized = raw.trim_matches('"');

    if normalized == "/dev/null" {
        return normalized.to_string();
    }

    normalized
        .strip_prefix("a/")
        .or_else(|| normalized.strip_prefix("b/"))
        .unwrap_or(normalized)
        .to_string()
}

fn parse_hunk_header(line: &str) -> Option<(u32, u32, u32, u32, String)> {
    let rest = line.strip_prefix("@@ ")?;
    let end = rest.find(" @@")?;
    let heading = rest[end + 3..].trim().to_string();

    let (old, new) = rest[..end].split_once(' ')?;
    let (old_start, old_lines) = parse_range(old.strip_prefix('-')?)?;
    let (new_start, new_lines) = parse_range(new.strip_prefix('+')?)?;

    Some((old_start, old_lines, new_start, new_lines, heading))
}

/// Parse `start[,count]`. Ranges whose end does not fit in a `u32` are
/// rejected so the hunk is kept as raw text.
fn parse_range(range: &str) -> Option<(u32, u32)> {
    let (start, count): (u32, u32) = match range.split_once(',') {
        Some((start, count)) => (start.parse().ok()?, count.parse().ok()?),
        None => (range.parse().ok()?, 1),
    };
    start.checked_add(count)?;
    Some((start, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lines that carry no content of their own.
    fn is_header(line: &str) -> bool {
        [
            "diff --git ",
            "--- ",
            "+++ ",
            "index ",
            "new file mode",
            "deleted file mode",
            "similarity index",
            "rename from ",
            "rename to ",
            "Binary files ",
        ]
        .iter()
        .any(|p| line.starts_with(p))
            || (line.starts_with("@@ ") && parse_hunk_header(line).is_some())
    }

    fn all_content(groups: &[ChangeGroup]) -> Vec<String> {
        let mut lines: Vec<String> = groups
            .iter()
            .flat_map(|g| g.content_lines().map(str::to_string))
            .collect();
        lines.sort();
        lines
    }

    #[test]
    fn empty_diff_returns_no_groups() {
        assert!(summarize("").is_empty());
    }

    #[test]
    fn two_files_keep_diff_order() {
        let diff = "\
diff --git a/foo.py b/foo.py
index 1111111..2222222 100644
--- a/foo.py
+++ b/foo.py
@@ -1,3 +1,4 @@
 def main():
-    print 'a'
+    print 'b'
+    print 'c'
     return 0
diff --git a/bar.css b/bar.css
--- a/bar.css
+++ b/bar.css
@@ -10,2 +10,2 @@ .header {
-  color: #fff;
+  color: @white;
 }
";
        let groups = summarize(diff);
        let paths: Vec<&str> = groups.iter().map(|g| g.path.as_str()).collect();
        assert_eq!(paths, vec!["foo.py", "bar.css"]);
        assert_eq!(groups[0].kind, ChangeKind::Modify);
        assert_eq!(groups[0].added(), 2);
        assert_eq!(groups[0].removed(), 1);
        assert_eq!(groups[1].hunks[0].heading, ".header {");
        assert_eq!(groups[1].hunks[0].new_start, 10);
        assert!(groups.iter().all(|g| g.unparsed.is_empty()));
    }

    #[test]
    fn order_is_insertion_not_sorted() {
        let diff = "\
diff --git a/z.js b/z.js
--- a/z.js
+++ b/z.js
@@ -1 +1 @@
-a
+b
diff --git a/a.js b/a.js
--- a/a.js
+++ b/a.js
@@ -1 +1 @@
-a
+b
";
        let groups = summarize(diff);
        assert_eq!(groups[0].path, "z.js");
        assert_eq!(groups[1].path, "a.js");
    }

    #[test]
    fn repeated_path_is_merged() {
        let diff = "\
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -1 +1 @@
-x
+y
diff --git a/b.py b/b.py
--- a/b.py
+++ b/b.py
@@ -1 +1 @@
-x
+y
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -20 +20 @@
-p
+q
";
        let groups = summarize(diff);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].path, "a.py");
        assert_eq!(groups[0].hunks.len(), 2);
        assert_eq!(groups[0].hunks[1].old_start, 20);
    }

    #[test]
    fn new_file() {
        let diff = "\
diff --git a/new.html b/new.html
new file mode 100644
--- /dev/null
+++ b/new.html
@@ -0,0 +1,2 @@
+<div>
+</div>
";
        let groups = summarize(diff);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].path, "new.html");
        assert_eq!(groups[0].kind, ChangeKind::Add);
        assert_eq!(groups[0].added(), 2);
    }

    #[test]
    fn deleted_file_uses_old_path() {
        let diff = "\
diff --git a/old.js b/old.js
deleted file mode 100644
--- a/old.js
+++ /dev/null
@@ -1,3 +0,0 @@
-$(function () {
-  init();
-});
";
        let groups = summarize(diff);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].path, "old.js");
        assert_eq!(groups[0].kind, ChangeKind::Delete);
        assert!(groups[0].is_pure_deletion());
        assert_eq!(groups[0].added(), 0);
    }

    #[test]
    fn rename_without_content_change() {
        let diff = "\
diff --git a/templates/old.html b/templates/new.html
similarity index 100%
rename from templates/old.html
rename to templates/new.html
";
        let groups = summarize(diff);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].path, "templates/new.html");
        assert_eq!(groups[0].old_path.as_deref(), Some("templates/old.html"));
        assert_eq!(groups[0].kind, ChangeKind::Rename);
        assert!(groups[0].hunks.is_empty());
    }

    #[test]
    fn rename_with_edits() {
        let diff = "\
diff --git a/a/util.py b/a/helpers.py
similarity index 90%
rename from a/util.py
rename to a/helpers.py
--- a/a/util.py
+++ b/a/helpers.py
@@ -1 +1 @@
-def f(): pass
+def g(): pass
";
        let groups = summarize(diff);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].path, "a/helpers.py");
        assert_eq!(groups[0].old_path.as_deref(), Some("a/util.py"));
        assert_eq!(groups[0].kind, ChangeKind::Rename);
        assert_eq!(groups[0].hunks.len(), 1);
    }

    #[test]
    fn removed_sql_comment_is_not_a_file_header() {
        let diff = "\
diff --git a/q.sql b/q.sql
--- a/q.sql
+++ b/q.sql
@@ -1,2 +1,1 @@
--- drop this comment
 SELECT 1;
";
        let groups = summarize(diff);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].removed(), 1);
        assert_eq!(groups[0].hunks[0].lines[0].text(), "-- drop this comment");
    }

    #[test]
    fn blank_line_inside_hunk_is_context() {
        let diff = "diff --git a/a.py b/a.py\n--- a/a.py\n+++ b/a.py\n@@ -1,3 +1,4 @@\n x = 1\n\n+y = 2\n z = 3\n";
        let groups = summarize(diff);
        let hunk = &groups[0].hunks[0];
        assert_eq!(hunk.lines.len(), 4);
        assert_eq!(hunk.lines[1].kind, LineKind::Context);
        assert_eq!(hunk.numbered_lines()[2].new, Some(3));
        assert!(groups[0].unparsed.is_empty());
    }

    #[test]
    fn no_newline_marker_is_kept_in_hunk() {
        let diff = "\
diff --git a/f.less b/f.less
--- a/f.less
+++ b/f.less
@@ -1 +1 @@
-old
\\ No newline at end of file
+new
\\ No newline at end of file
";
        let groups = summarize(diff);
        let kinds: Vec<LineKind> = groups[0].hunks[0].lines.iter().map(|l| l.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LineKind::Removed,
                LineKind::NoNewline,
                LineKind::Added,
                LineKind::NoNewline
            ]
        );
    }

    #[test]
    fn malformed_hunk_is_passed_through() {
        let diff = "\
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -x,3 +y,4 @@
 context
+added
diff --git a/b.py b/b.py
--- a/b.py
+++ b/b.py
@@ -1 +1 @@
-a
+b
";
        let groups = summarize(diff);
        assert_eq!(groups.len(), 2);
        assert!(groups[0].hunks.is_empty());
        assert_eq!(
            groups[0].unparsed,
            vec!["@@ -x,3 +y,4 @@", " context", "+added"]
        );
        assert_eq!(groups[1].hunks.len(), 1);
    }

    #[test]
    fn overlong_hunk_body_spills_into_unparsed() {
        let diff = "\
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -1 +1 @@
-a
+b
+c
";
        let groups = summarize(diff);
        assert_eq!(groups[0].hunks[0].lines.len(), 2);
        assert_eq!(groups[0].unparsed, vec!["+c"]);
    }

    #[test]
    fn preamble_becomes_leading_unparsed_group() {
        let diff = "\
Summary: tweak things
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -1 +1 @@
-a
+b
";
        let groups = summarize(diff);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].kind, ChangeKind::Unparsed);
        assert_eq!(groups[0].path, "");
        assert_eq!(groups[0].unparsed, vec!["Summary: tweak things"]);
        assert_eq!(groups[1].path, "a.py");
    }

    #[test]
    fn binary_file_has_no_hunks() {
        let diff = "\
diff --git a/img/logo.png b/img/logo.png
index 1234567..89abcde 100644
Binary files a/img/logo.png and b/img/logo.png differ
diff --git a/a.css b/a.css
--- a/a.css
+++ b/a.css
@@ -1 +1 @@
-a{}
+b{}
";
        let groups = summarize(diff);
        assert_eq!(groups.len(), 2);
        assert!(groups[0].is_binary);
        assert!(groups[0].hunks.is_empty());
        assert_eq!(groups[1].path, "a.css");
    }

    #[test]
    fn patch_without_git_header() {
        let diff = "\
--- a/app.js\t2024-01-01 00:00:00
+++ b/app.js\t2024-01-02 00:00:00
@@ -1 +1,2 @@
 var a = 1;
+var b = 2;
--- a/lib.js
+++ b/lib.js
@@ -3 +3 @@
-x
+y
";
        let groups = summarize(diff);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].path, "app.js");
        assert_eq!(groups[1].path, "lib.js");
        assert_eq!(groups[1].hunks[0].old_start, 3);
    }

    #[test]
    fn summarization_is_lossless() {
        let diff = "\
preamble text
diff --git a/foo.py b/foo.py
--- a/foo.py
+++ b/foo.py
@@ -1,3 +1,3 @@ class Foo:
 a
-b
+c
 d
stray line
@@ -10,2 +10,0 @@
-gone1
-gone2
@@ broken @@
+orphan
diff --git a/bar.css b/bar.css
deleted file mode 100644
--- a/bar.css
+++ /dev/null
@@ -1 +0,0 @@
-.x { color: #000; }
\\ No newline at end of file
";
        assert_lossless(diff, 3);
        assert_lossless(&diff.replace('\n', "\r\n"), 3);
    }

    fn assert_lossless(diff: &str, group_count: usize) {
        let mut expected: Vec<String> = diff
            .split_terminator('\n')
            .filter(|l| !is_header(l))
            .map(str::to_string)
            .collect();
        expected.sort();

        let groups = summarize(diff);
        assert_eq!(all_content(&groups), expected);
        assert_eq!(groups.len(), group_count);
    }

    #[test]
    fn crlf_lines_keep_their_carriage_returns() {
        let diff = "diff --git a/a.py b/a.py\r\n--- a/a.py\r\n+++ b/a.py\r\n\
                    @@ -1,3 +1,3 @@ def f():\r\n-a\r\n+b\r\n\r\n x\r\n";
        let groups = summarize(diff);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].path, "a.py");
        assert!(groups[0].unparsed.is_empty());

        let hunk = &groups[0].hunks[0];
        assert_eq!(hunk.heading, "def f():");
        let raw: Vec<&str> = hunk.lines.iter().map(|l| l.raw.as_str()).collect();
        assert_eq!(raw, vec!["-a\r", "+b\r", "\r", " x\r"]);
        assert_eq!(hunk.lines[2].kind, LineKind::Context);
    }

    #[test]
    fn removed_comment_after_overlong_hunk_stays_in_its_file() {
        let diff = "\
diff --git a/q.sql b/q.sql
--- a/q.sql
+++ b/q.sql
@@ -1 +1 @@
-a
+b
--- legacy comment
+c
";
        let groups = summarize(diff);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].path, "q.sql");
        assert_eq!(groups[0].kind, ChangeKind::Modify);
        assert_eq!(groups[0].unparsed, vec!["--- legacy comment", "+c"]);
    }

    #[test]
    fn hunk_header_past_u32_max_stays_raw() {
        let diff = "\
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -4294967295,2 +4294967295,2 @@
 x
 y
";
        let groups = summarize(diff);
        assert_eq!(groups.len(), 1);
        assert!(groups[0].hunks.is_empty());
        assert_eq!(
            groups[0].unparsed,
            vec!["@@ -4294967295,2 +4294967295,2 @@", " x", " y"]
        );
        assert!(groups[0].change_runs().is_empty());
    }

    #[test]
    fn parse_path_handles_quotes_and_prefixes() {
        assert_eq!(parse_path("\"a/src/my file.py\""), "src/my file.py");
        assert_eq!(parse_path("b/x.js"), "x.js");
        assert_eq!(parse_path("/dev/null"), "/dev/null");
    }

    #[test]
    fn hunk_header_with_heading() {
        assert_eq!(
            parse_hunk_header("@@ -3,4 +5 @@ function init() {"),
            Some((3, 4, 5, 1, "function init() {".to_string()))
        );
        assert_eq!(parse_hunk_header("@@ -a +b @@"), None);
        assert_eq!(parse_hunk_header("@@ missing end"), None);
    }
}
