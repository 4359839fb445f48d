//! Diff summarization for Phabricator raw diffs.
//!
//! Turns the unified diff returned by `differential.getrawdiff` into
//! per-file [`ChangeGroup`](phabreview_core::ChangeGroup)s, renders the
//! grouped change summary, and extracts numbered code snippets by file and
//! line.

pub mod parser;
pub mod snippet;
pub mod summary;
