use std::time::Duration;

use phabreview_core::{PhabReviewError, Revision, RevisionId};
use serde::de::DeserializeOwned;
use serde::Deserialize;

const CONDUIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Envelope error codes that mean the token was rejected.
const AUTH_ERROR_CODES: [&str; 3] = [
    "ERR-INVALID-AUTH",
    "ERR-INVALID-SESSION",
    "ERR-INVALID-TOKEN",
];

/// Phabricator Conduit client for fetching revisions and their raw diffs.
///
/// # Examples
///
/// ```
/// use phabreview_review::conduit::ConduitClient;
///
/// let client = ConduitClient::new("https://phab.example.com/", "api-xyz").unwrap();
/// assert_eq!(client.base_url(), "https://phab.example.com/api");
/// ```
pub struct ConduitClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: Option<T>,
    error_code: Option<String>,
    error_info: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct SearchPage<T> {
    #[serde(default)]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RevisionItem {
    fields: RevisionFields,
}

#[derive(Debug, Deserialize)]
struct RevisionFields {
    #[serde(default)]
    title: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    status: Option<RevisionStatus>,
    #[serde(rename = "authorPHID")]
    author_phid: Option<String>,
    #[serde(rename = "diffPHID")]
    diff_phid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RevisionStatus {
    name: Option<String>,
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserItem {
    fields: UserFields,
}

#[derive(Debug, Deserialize)]
struct UserFields {
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiffItem {
    id: u64,
}

impl ConduitClient {
    /// Create a client for the Phabricator instance at `base_url`.
    ///
    /// Trailing slashes are dropped and `/api` is appended when missing.
    ///
    /// # Errors
    ///
    /// Returns [`PhabReviewError::Network`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, token: &str) -> Result<Self, PhabReviewError> {
        let http = reqwest::Client::builder()
            .timeout(CONDUIT_TIMEOUT)
            .build()
            .map_err(|e| PhabReviewError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: normalize_base_url(base_url),
            token: token.to_string(),
        })
    }

    /// Conduit API root all method calls are made against.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch a revision's metadata and the raw text of its current diff.
    ///
    /// # Errors
    ///
    /// Returns [`PhabReviewError::NotFound`] if the revision or its diff does
    /// not exist, [`PhabReviewError::Auth`] if the token is rejected, and
    /// [`PhabReviewError::Network`] or [`PhabReviewError::Conduit`] for
    /// transport and API failures.
    pub async fn fetch_revision(&self, id: RevisionId) -> Result<Revision, PhabReviewError> {
        let page: SearchPage<RevisionItem> = self
            .call(
                "differential.revision.search",
                &[("constraints[ids][0]", id.number().to_string())],
            )
            .await?;
        let fields = page
            .data
            .into_iter()
            .next()
            .map(|item| item.fields)
            .ok_or_else(|| PhabReviewError::NotFound(format!("revision {id}")))?;

        let author = match fields.author_phid.as_deref() {
            Some(phid) => self.resolve_author(phid).await,
            None => "unknown".to_string(),
        };

        let diff_phid = fields
            .diff_phid
            .as_deref()
            .ok_or_else(|| PhabReviewError::NotFound(format!("diff for revision {id}")))?;
        let diff_id = self.diff_id(diff_phid).await?;
        let raw_diff = self.raw_diff(diff_id).await?;

        let status = fields
            .status
            .and_then(|s| s.name.or(s.value))
            .unwrap_or_else(|| "Unknown".to_string());

        tracing::info!(revision = %id, diff_id, bytes = raw_diff.len(), "fetched revision");

        Ok(Revision {
            id,
            title: fields.title,
            author,
            status,
            uri: fields.uri,
            summary: fields.summary,
            diff_id,
            raw_diff,
        })
    }

    /// Resolve a user PHID to a username, falling back to the PHID itself
    /// when the lookup is empty or fails.
    async fn resolve_author(&self, phid: &str) -> String {
        let page: Result<SearchPage<UserItem>, _> = self
            .call("user.search", &[("constraints[phids][0]", phid.to_string())])
            .await;

        match page {
            Ok(page) => page
                .data
                .into_iter()
                .find_map(|u| u.fields.username)
                .unwrap_or_else(|| phid.to_string()),
            Err(e) => {
                tracing::warn!(
                    %phid,
                    kind = e.kind(),
                    error = %e,
                    "author lookup failed, using PHID"
                );
                phid.to_string()
            }
        }
    }

    async fn diff_id(&self, diff_phid: &str) -> Result<u64, PhabReviewError> {
        let page: SearchPage<DiffItem> = self
            .call(
                "differential.diff.search",
                &[("constraints[phids][0]", diff_phid.to_string())],
            )
            .await?;
        page.data
            .first()
            .map(|d| d.id)
            .ok_or_else(|| PhabReviewError::NotFound(format!("diff {diff_phid}")))
    }

    async fn raw_diff(&self, diff_id: u64) -> Result<String, PhabReviewError> {
        self.call("differential.getrawdiff", &[("diffID", diff_id.to_string())])
            .await
    }

    /// POST one Conduit method and unwrap its result envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<T, PhabReviewError> {
        let url = format!("{}/{method}", self.base_url);
        let mut form: Vec<(&str, &str)> = vec![("api.token", self.token.as_str())];
        form.extend(params.iter().map(|(k, v)| (*k, v.as_str())));

        tracing::debug!(%method, "calling Conduit");
        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| PhabReviewError::Network(format!("{method} request failed: {e}")))?;

        let status = response.status();
        tracing::debug!(%method, %status, "Conduit responded");
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(PhabReviewError::Auth(format!(
                "Phabricator rejected the API token ({status})"
            )));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PhabReviewError::NotFound(format!(
                "Conduit method {method} at {url}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PhabReviewError::Network(format!(
                "Conduit {method} returned {status}: {body}"
            )));
        }

        let envelope: Envelope<T> = response.json().await.map_err(|e| {
            PhabReviewError::Network(format!("invalid Conduit response for {method}: {e}"))
        })?;

        if let Some(code) = envelope.error_code {
            let info = envelope.error_info.unwrap_or_default();
            if AUTH_ERROR_CODES.contains(&code.as_str()) {
                return Err(PhabReviewError::Auth(format!("{code}: {info}")));
            }
            return Err(PhabReviewError::Conduit { code, info });
        }

        envelope
            .result
            .ok_or_else(|| PhabReviewError::Network(format!("Conduit {method} returned no result")))
    }
}

/// Normalize a Phabricator URL to its Conduit API root.
///
/// # Examples
///
/// ```
/// use phabreview_review::conduit::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://phab.io"), "https://phab.io/api");
/// assert_eq!(normalize_base_url("https://phab.io/api/"), "https://phab.io/api");
/// ```
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.ends_with("/api") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/api")
    }
}
