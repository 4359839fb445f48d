use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PhabReviewError;

/// A validated Phabricator revision identifier.
///
/// Accepts `D33113`, `d33113` or a bare `33113` (surrounding whitespace is
/// ignored) and always displays in the canonical `D<number>` form.
///
/// # Examples
///
/// ```
/// use phabreview_core::RevisionId;
///
/// let id = RevisionId::parse(" d42 ").unwrap();
/// assert_eq!(id.number(), 42);
/// assert_eq!(id.to_string(), "D42");
/// assert!(RevisionId::parse("T42").is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevisionId(u64);

impl RevisionId {
    /// Parse a revision identifier.
    ///
    /// # Errors
    ///
    /// Returns [`PhabReviewError::InvalidIdentifier`] unless the input is an
    /// optional `D`/`d` followed by ASCII digits that fit in a `u64`.
    pub fn parse(input: &str) -> Result<Self, PhabReviewError> {
        let trimmed = input.trim();
        let digits = trimmed
            .strip_prefix('D')
            .or_else(|| trimmed.strip_prefix('d'))
            .unwrap_or(trimmed);

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PhabReviewError::InvalidIdentifier(input.to_string()));
        }

        digits
            .parse()
            .map(Self)
            .map_err(|_| PhabReviewError::InvalidIdentifier(input.to_string()))
    }

    /// Numeric part of the identifier, as used by Conduit constraints.
    pub fn number(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.0)
    }
}

impl FromStr for RevisionId {
    type Err = PhabReviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A revision fetched from Phabricator, together with its raw diff.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    /// Revision identifier.
    pub id: RevisionId,
    /// Revision title.
    pub title: String,
    /// Author username, or the author PHID when it could not be resolved.
    pub author: String,
    /// Human-readable status (e.g. "Needs Review").
    pub status: String,
    /// Web URI of the revision.
    pub uri: String,
    /// Revision description.
    pub summary: String,
    /// Numeric ID of the diff the raw text was taken from.
    pub diff_id: u64,
    /// Raw unified diff text.
    pub raw_diff: String,
}

/// What happened to a file in a diff.
///
/// # Examples
///
/// ```
/// use phabreview_core::ChangeKind;
///
/// assert_eq!(ChangeKind::Delete.to_string(), "delete");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// File created.
    Add,
    /// File edited in place.
    Modify,
    /// File removed.
    Delete,
    /// File moved, possibly with edits.
    Rename,
    /// Text that could not be attributed to any file.
    Unparsed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Add => write!(f, "add"),
            ChangeKind::Modify => write!(f, "modify"),
            ChangeKind::Delete => write!(f, "delete"),
            ChangeKind::Rename => write!(f, "rename"),
            ChangeKind::Unparsed => write!(f, "unparsed"),
        }
    }
}

/// Role of a single line inside a hunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    /// Unchanged line (` ` prefix).
    Context,
    /// Added line (`+` prefix).
    Added,
    /// Removed line (`-` prefix).
    Removed,
    /// `\ No newline at end of file` marker.
    NoNewline,
}

/// One line of a hunk, kept exactly as it appeared in the raw diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    /// Line role.
    pub kind: LineKind,
    /// Raw text including the diff prefix.
    pub raw: String,
}

impl DiffLine {
    /// Line content without the diff prefix.
    pub fn text(&self) -> &str {
        match self.kind {
            LineKind::NoNewline => &self.raw,
            _ => self.raw.get(1..).unwrap_or(""),
        }
    }
}

/// A hunk line annotated with its old/new line numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberedLine<'a> {
    /// Line role.
    pub kind: LineKind,
    /// Line number in the old file (context and removed lines).
    pub old: Option<u32>,
    /// Line number in the new file (context and added lines).
    pub new: Option<u32>,
    /// Content without the diff prefix.
    pub text: &'a str,
}

/// A contiguous block of changes inside one file.
///
/// # Examples
///
/// ```
/// use phabreview_core::{DiffLine, Hunk, LineKind};
///
/// let hunk = Hunk {
///     old_start: 10,
///     old_lines: 1,
///     new_start: 10,
///     new_lines: 2,
///     heading: String::new(),
///     lines: vec![
///         DiffLine { kind: LineKind::Context, raw: " a".into() },
///         DiffLine { kind: LineKind::Added, raw: "+b".into() },
///     ],
/// };
/// assert_eq!(hunk.header(), "@@ -10,1 +10,2 @@");
/// assert_eq!(hunk.numbered_lines()[1].new, Some(11));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hunk {
    /// Starting line in the old version.
    pub old_start: u32,
    /// Number of lines in the old version.
    pub old_lines: u32,
    /// Starting line in the new version.
    pub new_start: u32,
    /// Number of lines in the new version.
    pub new_lines: u32,
    /// Section heading printed after the closing `@@`, if any.
    pub heading: String,
    /// Hunk body in diff order.
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    /// Render the `@@` header line.
    pub fn header(&self) -> String {
        let mut header = format!(
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_lines, self.new_start, self.new_lines
        );
        if !self.heading.is_empty() {
            header.push(' ');
            header.push_str(&self.heading);
        }
        header
    }

    /// Body lines annotated with old/new line numbers.
    pub fn numbered_lines(&self) -> Vec<NumberedLine<'_>> {
        let mut old = self.old_start;
        let mut new = self.new_start;
        let mut out = Vec::with_capacity(self.lines.len());

        for line in &self.lines {
            let (o, n) = match line.kind {
                LineKind::Context => {
                    let pair = (Some(old), Some(new));
                    old = old.saturating_add(1);
                    new = new.saturating_add(1);
                    pair
                }
                LineKind::Added => {
                    let pair = (None, Some(new));
                    new = new.saturating_add(1);
                    pair
                }
                LineKind::Removed => {
                    let pair = (Some(old), None);
                    old = old.saturating_add(1);
                    pair
                }
                LineKind::NoNewline => (None, None),
            };
            out.push(NumberedLine {
                kind: line.kind,
                old: o,
                new: n,
                text: line.text(),
            });
        }
        out
    }

    /// Number of added lines.
    pub fn added(&self) -> usize {
        self.count(LineKind::Added)
    }

    /// Number of removed lines.
    pub fn removed(&self) -> usize {
        self.count(LineKind::Removed)
    }

    fn count(&self, kind: LineKind) -> usize {
        self.lines.iter().filter(|l| l.kind == kind).count()
    }
}

/// All changes to one file path, in the order they appear in the diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeGroup {
    /// File path as it appears in the diff header (new side unless deleted).
    pub path: String,
    /// Previous path for renames and copies.
    pub old_path: Option<String>,
    /// What happened to the file.
    pub kind: ChangeKind,
    /// Whether git reported the file as binary.
    pub is_binary: bool,
    /// Parsed hunks.
    pub hunks: Vec<Hunk>,
    /// Lines that could not be structured, kept verbatim.
    pub unparsed: Vec<String>,
}

impl ChangeGroup {
    /// Create an empty group for `path`.
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            old_path: None,
            kind,
            is_binary: false,
            hunks: Vec::new(),
            unparsed: Vec::new(),
        }
    }

    /// Lowercased file extension of [`ChangeGroup::path`], without the dot.
    pub fn extension(&self) -> Option<String> {
        let name = self.path.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    /// Total added lines across all hunks.
    pub fn added(&self) -> usize {
        self.hunks.iter().map(Hunk::added).sum()
    }

    /// Total removed lines across all hunks.
    pub fn removed(&self) -> usize {
        self.hunks.iter().map(Hunk::removed).sum()
    }

    /// `true` when the change only removes code.
    pub fn is_pure_deletion(&self) -> bool {
        self.kind == ChangeKind::Delete || (self.added() == 0 && self.removed() > 0)
    }

    /// Every body line of the group: hunk lines first, then unparsed text.
    pub fn content_lines(&self) -> impl Iterator<Item = &str> {
        self.hunks
            .iter()
            .flat_map(|h| h.lines.iter().map(|l| l.raw.as_str()))
            .chain(self.unparsed.iter().map(String::as_str))
    }

    /// Collapse added/removed lines into runs with consecutive line numbers.
    ///
    /// # Examples
    ///
    /// ```
    /// use phabreview_core::{ChangeGroup, ChangeKind, DiffLine, Hunk, LineKind, RunKind};
    ///
    /// let mut group = ChangeGroup::new("a.py", ChangeKind::Modify);
    /// group.hunks.push(Hunk {
    ///     old_start: 1,
    ///     old_lines: 1,
    ///     new_start: 1,
    ///     new_lines: 2,
    ///     heading: String::new(),
    ///     lines: vec![
    ///         DiffLine { kind: LineKind::Added, raw: "+x = 1".into() },
    ///         DiffLine { kind: LineKind::Added, raw: "+y = 2".into() },
    ///         DiffLine { kind: LineKind::Context, raw: " z".into() },
    ///     ],
    /// });
    /// let runs = group.change_runs();
    /// assert_eq!(runs.len(), 1);
    /// assert_eq!(runs[0].kind, RunKind::Added);
    /// assert_eq!(runs[0].lines.to_string(), "1-2");
    /// ```
    pub fn change_runs(&self) -> Vec<ChangeRun> {
        let mut runs: Vec<ChangeRun> = Vec::new();

        for hunk in &self.hunks {
            for line in hunk.numbered_lines() {
                let (kind, number) = match (line.kind, line.old, line.new) {
                    (LineKind::Added, _, Some(n)) => (RunKind::Added, n),
                    (LineKind::Removed, Some(o), _) => (RunKind::Removed, o),
                    _ => continue,
                };
                let content = line.text.trim();
                let content = if content.is_empty() { "(empty)" } else { content };

                match runs.last_mut() {
                    Some(run)
                        if run.kind == kind && run.lines.end.checked_add(1) == Some(number) =>
                    {
                        run.lines.end = number;
                        run.content.push(content.to_string());
                    }
                    _ => runs.push(ChangeRun {
                        kind,
                        lines: LineRef::single(number),
                        content: vec![content.to_string()],
                    }),
                }
            }
        }
        runs
    }
}

/// Direction of a [`ChangeRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    /// Lines added (numbered on the new side).
    Added,
    /// Lines removed (numbered on the old side).
    Removed,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Added => write!(f, "Added"),
            RunKind::Removed => write!(f, "Removed"),
        }
    }
}

/// Consecutive added or removed lines with consecutive line numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRun {
    /// Added or removed.
    pub kind: RunKind,
    /// Line range covered by the run.
    pub lines: LineRef,
    /// Trimmed line contents; blank lines read `(empty)`.
    pub content: Vec<String>,
}

/// A single line or an inclusive line range.
///
/// # Examples
///
/// ```
/// use phabreview_core::LineRef;
///
/// let range: LineRef = "15-20".parse().unwrap();
/// assert_eq!((range.start, range.end), (15, 20));
/// assert_eq!(range.label(), "lines 15-20");
/// assert_eq!(LineRef::single(7).label(), "line 7");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRef {
    /// First line.
    pub start: u32,
    /// Last line (equal to `start` for a single line).
    pub end: u32,
}

impl LineRef {
    /// Reference to a single line.
    pub fn single(line: u32) -> Self {
        Self {
            start: line,
            end: line,
        }
    }

    /// Human-readable label: `line 7` or `lines 15-20`.
    pub fn label(&self) -> String {
        if self.start == self.end {
            format!("line {}", self.start)
        } else {
            format!("lines {}-{}", self.start, self.end)
        }
    }
}

impl fmt::Display for LineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for LineRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid line reference: {s}"))
        };
        match s.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if end < start {
                    return Err(format!("invalid line reference: {s}"));
                }
                Ok(Self { start, end })
            }
            None => parse(s).map(Self::single),
        }
    }
}
