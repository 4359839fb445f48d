use std::collections::BTreeSet;
use std::fmt::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use phabreview_core::{ChangeGroup, PhabReviewError, Revision, RevisionId};
use phabreview_difflens::snippet::extract_snippet;
use phabreview_difflens::summary::render_summary;
use serde::Serialize;

use crate::guidance::GuidanceTag;
use crate::prompt::ReviewFindings;

/// Context lines shown around a requested change in the saved report.
const SNIPPET_CONTEXT: u32 = 2;

/// Outcome of a completed review run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewReport {
    /// The reviewed revision.
    pub revision: Revision,
    /// Change groups derived from the raw diff.
    pub groups: Vec<ChangeGroup>,
    /// Guidance blocks that were sent with the prompt.
    pub guidance: BTreeSet<GuidanceTag>,
    /// Model that produced the review.
    pub model: String,
    /// The model's answer, unmodified.
    pub raw_response: String,
    /// Parsed summary and requested changes.
    pub findings: ReviewFindings,
    /// When the response was received.
    pub generated_at: DateTime<Utc>,
    /// Report file, once saved.
    pub saved_to: Option<PathBuf>,
}

impl ReviewReport {
    /// Terminal output for the review.
    ///
    /// With `only_review` this is exactly [`ReviewReport::review_section`];
    /// otherwise the revision header and the grouped change summary come
    /// first, so the short form is always contained in the long one.
    pub fn render(&self, only_review: bool) -> String {
        let review = self.review_section();
        if only_review {
            return review;
        }

        let rev = &self.revision;
        let mut out = format!("Revision {}: {}\n", rev.id, rev.title);
        let _ = writeln!(out, "Author: {} | Status: {}", rev.author, rev.status);
        if !rev.uri.is_empty() {
            let _ = writeln!(out, "{}", rev.uri);
        }

        out.push_str("\nChanges\n");
        let summary = render_summary(&self.groups);
        if summary.is_empty() {
            out.push_str("(no added or removed lines)\n");
        } else {
            out.push_str(&summary);
            out.push('\n');
        }

        out.push('\n');
        out.push_str(&review);
        out
    }

    /// The summary bullets and requested changes.
    pub fn review_section(&self) -> String {
        let mut out = String::from("Review Summary\n");
        if self.findings.summary.is_empty() {
            out.push_str("  (no summary)\n");
        }
        for bullet in &self.findings.summary {
            let _ = writeln!(out, "  - {bullet}");
        }

        out.push_str("\nRequested Changes\n");
        if self.findings.requested_changes.is_empty() {
            out.push_str("  None.");
            return out;
        }

        let changes: Vec<String> = self
            .findings
            .requested_changes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let location = match c.line {
                    Some(line) => format!("{} ({})", c.path, line.label()),
                    None => c.path.clone(),
                };
                format!("  {}. {location}\n     {}", i + 1, c.change)
            })
            .collect();
        out.push_str(&changes.join("\n"));
        out
    }

    /// Render the saved markdown report.
    ///
    /// Each requested change is followed by the matching lines of the new
    /// file when they are part of the diff.
    pub fn to_markdown(&self) -> String {
        let rev = &self.revision;
        let mut out = format!("# Review of {}: {}\n\n", rev.id, rev.title);
        let _ = writeln!(out, "- **Author:** {}", rev.author);
        let _ = writeln!(out, "- **Status:** {}", rev.status);
        if !rev.uri.is_empty() {
            let _ = writeln!(out, "- **URI:** {}", rev.uri);
        }
        let _ = writeln!(out, "- **Model:** `{}`", self.model);
        let _ = writeln!(
            out,
            "- **Generated:** {}",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );

        out.push_str("\n## Summary\n\n");
        if self.findings.summary.is_empty() {
            out.push_str("_No summary._\n");
        }
        for bullet in &self.findings.summary {
            let _ = writeln!(out, "- {bullet}");
        }

        out.push_str("\n## Requested Changes\n\n");
        if self.findings.requested_changes.is_empty() {
            out.push_str("No changes requested.\n");
        }
        for (i, change) in self.findings.requested_changes.iter().enumerate() {
            let _ = write!(out, "### {}. `{}`", i + 1, change.path);
            if let Some(line) = change.line {
                let _ = write!(out, " ({})", line.label());
            }
            let _ = write!(out, "\n\n{}\n\n", change.change);

            let snippet = change.line.and_then(|line| {
                extract_snippet(&self.groups, &change.path, line, SNIPPET_CONTEXT)
            });
            if let Some(snippet) = snippet {
                let _ = write!(out, "```\n{snippet}\n```\n\n");
            }
        }

        let summary = render_summary(&self.groups);
        if !summary.is_empty() {
            let _ = write!(out, "## Changes\n\n```\n{summary}\n```\n");
        }
        out
    }

    /// Write the markdown report to `<dir>/D<n>.md`, replacing any earlier
    /// report for the same revision, and remember the path.
    ///
    /// The file is written next to its destination and renamed into place,
    /// so an interrupted run never leaves a partial report.
    ///
    /// # Errors
    ///
    /// Returns [`PhabReviewError::Io`] if the directory or file cannot be
    /// written.
    pub fn save(&mut self, dir: &Path) -> Result<PathBuf, PhabReviewError> {
        std::fs::create_dir_all(dir)?;
        let path = report_path(dir, self.revision.id);
        let tmp = dir.join(format!(".{}.md.tmp", self.revision.id));

        let written =
            std::fs::write(&tmp, self.to_markdown()).and_then(|()| std::fs::rename(&tmp, &path));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        tracing::info!(path = %path.display(), "review report saved");
        self.saved_to = Some(path.clone());
        Ok(path)
    }
}

/// Location of the report for `id` inside `dir`.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use phabreview_core::RevisionId;
/// use phabreview_review::report::report_path;
///
/// let id = RevisionId::parse("33113").unwrap();
/// assert_eq!(report_path(Path::new("/tmp/r"), id), Path::new("/tmp/r/D33113.md"));
/// ```
pub fn report_path(dir: &Path, id: RevisionId) -> PathBuf {
    dir.join(format!("{id}.md"))
}
