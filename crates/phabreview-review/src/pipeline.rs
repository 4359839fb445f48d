use std::fmt;
use std::path::PathBuf;

use chrono::Utc;
use miette::Diagnostic;
use phabreview_core::{Credentials, PhabReviewError, RevisionId};
use phabreview_difflens::parser::summarize;

use crate::conduit::ConduitClient;
use crate::guidance::select_guidance;
use crate::llm::{LlmClient, LlmConfig};
use crate::prompt::{self, ComposeOptions};
use crate::report::ReviewReport;

/// Step of a review run, reported to a [`StageObserver`] as it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Fetching revision metadata and the raw diff from Conduit.
    Fetching,
    /// Grouping the raw diff by file.
    Summarizing,
    /// Selecting guidance and assembling the prompt.
    Composing,
    /// Waiting for the model.
    Requesting,
    /// Building the report and saving it if requested.
    Rendering,
    /// Finished successfully.
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetching => "fetching",
            Stage::Summarizing => "summarizing",
            Stage::Composing => "composing",
            Stage::Requesting => "requesting",
            Stage::Rendering => "rendering",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Receives stage transitions of a review run.
///
/// The unit type ignores every transition.
pub trait StageObserver {
    /// Called when `stage` starts for `revision`.
    fn on_stage(&self, revision: RevisionId, stage: Stage);
}

impl StageObserver for () {
    fn on_stage(&self, _revision: RevisionId, _stage: Stage) {}
}

/// A review run that stopped at `stage`.
///
/// # Examples
///
/// ```
/// use phabreview_core::PhabReviewError;
/// use phabreview_review::pipeline::{ReviewFailure, Stage};
///
/// let failure = ReviewFailure {
///     stage: Stage::Fetching,
///     error: PhabReviewError::NotFound("revision D42".into()),
/// };
/// assert_eq!(failure.kind(), "NotFound");
/// assert_eq!(failure.to_string(), "review failed while fetching [NotFound]");
/// ```
#[derive(Debug, thiserror::Error)]
#[error("review failed while {stage} [{}]", .error.kind())]
pub struct ReviewFailure {
    /// Stage that was running when the error happened.
    pub stage: Stage,
    /// The underlying error.
    #[source]
    pub error: PhabReviewError,
}

impl ReviewFailure {
    /// Error kind of the underlying error.
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }
}

impl Diagnostic for ReviewFailure {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        self.error.code()
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        self.error.help()
    }
}

/// Per-run settings.
#[derive(Debug, Clone, Default)]
pub struct ReviewOptions {
    /// Model override; falls back to the configured model.
    pub model: Option<String>,
    /// Print only the review section.
    pub only_review: bool,
    /// Write the markdown report after a successful run.
    pub save_review: bool,
    /// Directory the report is written to.
    pub reports_dir: PathBuf,
    /// Token budget for the diff part of the prompt.
    pub max_diff_tokens: Option<usize>,
}

/// Review orchestrator: fetch, summarize, compose, request, render.
///
/// Every step runs once, in order; nothing is retried.
pub struct ReviewPipeline {
    conduit: ConduitClient,
    credentials: Credentials,
}

impl ReviewPipeline {
    /// Create a pipeline from resolved credentials.
    ///
    /// # Errors
    ///
    /// Returns [`PhabReviewError::Network`] if the HTTP client cannot be built.
    pub fn new(credentials: Credentials) -> Result<Self, PhabReviewError> {
        let conduit = ConduitClient::new(
            &credentials.phabricator_url,
            &credentials.phabricator_token,
        )?;
        Ok(Self {
            conduit,
            credentials,
        })
    }

    /// Review one revision.
    ///
    /// The identifier is validated before any request is made. The report
    /// is only written once the model's full answer has been received.
    ///
    /// # Errors
    ///
    /// Returns a [`ReviewFailure`] carrying the stage that failed and the
    /// underlying error.
    pub async fn review(
        &self,
        revision_id: &str,
        options: &ReviewOptions,
        observer: &dyn StageObserver,
    ) -> Result<ReviewReport, ReviewFailure> {
        let fail = |stage: Stage| {
            move |error: PhabReviewError| {
                tracing::debug!(%stage, kind = error.kind(), "review stage failed");
                ReviewFailure { stage, error }
            }
        };

        let id = RevisionId::parse(revision_id).map_err(fail(Stage::Fetching))?;
        let enter = |stage: Stage| {
            tracing::info!(revision = %id, %stage, "review stage");
            observer.on_stage(id, stage);
        };

        enter(Stage::Fetching);
        let revision = self
            .conduit
            .fetch_revision(id)
            .await
            .map_err(fail(Stage::Fetching))?;

        enter(Stage::Summarizing);
        let groups = summarize(&revision.raw_diff);
        tracing::debug!(files = groups.len(), "diff summarized");

        enter(Stage::Composing);
        let guidance = select_guidance(&groups);
        let compose_options = ComposeOptions {
            max_diff_tokens: options.max_diff_tokens,
        };
        let review_prompt = prompt::compose(&revision, &groups, &guidance, &compose_options);
        tracing::debug!(
            tokens = review_prompt.estimated_tokens(),
            guidance = guidance.len(),
            "prompt composed"
        );

        enter(Stage::Requesting);
        let llm_config = LlmConfig::from_credentials(&self.credentials, options.model.as_deref());
        let llm = LlmClient::new(&llm_config).map_err(fail(Stage::Requesting))?;
        let raw_response = llm
            .chat(review_prompt.messages())
            .await
            .map_err(fail(Stage::Requesting))?;

        enter(Stage::Rendering);
        let findings = prompt::parse_review_response(&raw_response);
        let mut report = ReviewReport {
            revision,
            groups,
            guidance,
            model: llm.model().to_string(),
            raw_response,
            findings,
            generated_at: Utc::now(),
            saved_to: None,
        };
        if options.save_review {
            report
                .save(&options.reports_dir)
                .map_err(fail(Stage::Rendering))?;
        }

        enter(Stage::Done);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_are_lowercase() {
        assert_eq!(Stage::Requesting.to_string(), "requesting");
        assert_eq!(Stage::Done.to_string(), "done");
    }

    #[test]
    fn failure_forwards_diagnostic_code() {
        let failure = ReviewFailure {
            stage: Stage::Requesting,
            error: PhabReviewError::LlmEmptyResponse {
                model: "m".into(),
            },
        };
        let code = failure.code().map(|c| c.to_string());
        assert_eq!(code.as_deref(), Some("phabreview::llm_empty_response"));
        assert!(failure.help().is_some());
        assert_eq!(
            failure.to_string(),
            "review failed while requesting [LLMEmptyResponse]"
        );
    }
}
