//! Review orchestration for Phabricator revisions.
//!
//! Provides the review pipeline: Conduit client, OpenRouter client,
//! technology guidance, prompt construction, the staged orchestrator, and
//! markdown report output.

pub mod conduit;
pub mod guidance;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod report;
