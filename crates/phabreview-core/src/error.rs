use miette::Diagnostic;

/// Errors that can occur while reviewing a revision.
///
/// Every variant maps to one error kind reported to the user (see
/// [`PhabReviewError::kind`]). Library crates return this type directly; the
/// binary converts it to a `miette::Report` at the boundary.
///
/// # Examples
///
/// ```
/// use phabreview_core::PhabReviewError;
///
/// let err = PhabReviewError::NotFound("revision D42".into());
/// assert_eq!(err.kind(), "NotFound");
/// assert!(err.to_string().contains("D42"));
/// ```
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum PhabReviewError {
    /// The revision identifier does not look like `D123` or `123`.
    #[error("invalid revision identifier '{0}': expected a 'D' followed by digits, e.g. D33113")]
    #[diagnostic(code(phabreview::invalid_identifier))]
    InvalidIdentifier(String),

    /// Phabricator or OpenRouter rejected the credentials.
    #[error("authentication failed: {0}")]
    #[diagnostic(
        code(phabreview::auth),
        help("check PHABRICATOR_API_TOKEN / OPENROUTER_API_KEY or run 'phabreview config'")
    )]
    Auth(String),

    /// The requested revision or diff does not exist.
    #[error("not found: {0}")]
    #[diagnostic(code(phabreview::not_found))]
    NotFound(String),

    /// Transport failure, timeout, or an unexpected HTTP response.
    #[error("network error: {0}")]
    #[diagnostic(code(phabreview::network))]
    Network(String),

    /// Conduit answered with an error envelope that is not an auth failure.
    #[error("Phabricator error ({code}): {info}")]
    #[diagnostic(code(phabreview::conduit))]
    Conduit {
        /// Conduit `error_code`.
        code: String,
        /// Conduit `error_info`.
        info: String,
    },

    /// The LLM endpoint returned a non-success response.
    #[error("LLM error: {0}")]
    #[diagnostic(code(phabreview::llm))]
    Llm(String),

    /// The LLM call succeeded but carried no review text.
    #[error("model '{model}' returned an empty response")]
    #[diagnostic(
        code(phabreview::llm_empty_response),
        help("try again or pick another model with --model")
    )]
    LlmEmptyResponse {
        /// Model that produced the empty answer.
        model: String,
    },

    /// Missing or unreadable configuration.
    #[error("configuration error: {0}")]
    #[diagnostic(code(phabreview::config))]
    Config(String),

    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    #[diagnostic(code(phabreview::io))]
    Io(#[from] std::io::Error),
}

impl PhabReviewError {
    /// Short, stable name of the error kind, printed on failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier(_) => "InvalidIdentifier",
            Self::Auth(_) => "AuthError",
            Self::NotFound(_) => "NotFound",
            Self::Network(_) => "NetworkError",
            Self::Conduit { .. } => "ConduitError",
            Self::Llm(_) => "LLMError",
            Self::LlmEmptyResponse { .. } => "LLMEmptyResponse",
            Self::Config(_) => "ConfigError",
            Self::Io(_) => "IoError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: PhabReviewError = io_err.into();
        assert!(err.to_string().contains("nope"));
        assert_eq!(err.kind(), "IoError");
    }

    #[test]
    fn config_error_displays_message() {
        let err = PhabReviewError::Config("missing PHABRICATOR_URL".into());
        assert_eq!(
            err.to_string(),
            "configuration error: missing PHABRICATOR_URL"
        );
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn conduit_error_shows_code_and_info() {
        let err = PhabReviewError::Conduit {
            code: "ERR-CONDUIT-CORE".into(),
            info: "boom".into(),
        };
        assert_eq!(err.to_string(), "Phabricator error (ERR-CONDUIT-CORE): boom");
    }

    #[test]
    fn kinds_match_error_names() {
        assert_eq!(
            PhabReviewError::InvalidIdentifier("x".into()).kind(),
            "InvalidIdentifier"
        );
        assert_eq!(PhabReviewError::Auth("x".into()).kind(), "AuthError");
        assert_eq!(PhabReviewError::Network("x".into()).kind(), "NetworkError");
        assert_eq!(PhabReviewError::Llm("x".into()).kind(), "LLMError");
        assert_eq!(
            PhabReviewError::LlmEmptyResponse { model: "m".into() }.kind(),
            "LLMEmptyResponse"
        );
    }
}
