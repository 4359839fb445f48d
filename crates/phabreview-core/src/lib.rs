//! Core types, configuration, and error handling for phabreview.
//!
//! This crate provides the shared foundation used by the other crates:
//! - [`PhabReviewError`] — unified error type using `thiserror` and `miette`
//! - [`Credentials`] — layered lookup over env, `./.env` and the persisted file
//! - Shared types: [`RevisionId`], [`Revision`], [`ChangeGroup`], [`Hunk`],
//!   [`ChangeRun`], [`LineRef`]

mod config;
mod error;
mod types;

pub use config::{
    config_path, default_reports_dir, mask_secret, read_env_file, ConfigLayers, Credentials,
    StoredConfig, CONFIG_DIR_NAME, CONFIG_FILE_NAME, CONFIG_KEYS, DEFAULT_MODEL,
    OPENROUTER_API_KEY, OPENROUTER_BASE_URL, OPENROUTER_BASE_URL_KEY, PHABRICATOR_API_TOKEN,
    PHABRICATOR_URL, REPORTS_DIR_NAME, REVIEW_MODEL,
};
pub use error::PhabReviewError;
pub use types::{
    ChangeGroup, ChangeKind, ChangeRun, DiffLine, Hunk, LineKind, LineRef, NumberedLine,
    Revision, RevisionId, RunKind,
};

/// A convenience `Result` type for phabreview operations.
pub type Result<T> = std::result::Result<T, PhabReviewError>;
