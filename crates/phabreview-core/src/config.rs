use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::PhabReviewError;

/// Model used when neither `--model` nor `REVIEW_MODEL` is set.
pub const DEFAULT_MODEL: &str = "xiaomi/mimo-v2-flash:free";

/// OpenRouter's OpenAI-compatible API root.
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Directory under the user config root holding the persisted file.
pub const CONFIG_DIR_NAME: &str = "phab-reviewer";

/// Name of the persisted `KEY=VALUE` file.
pub const CONFIG_FILE_NAME: &str = "config.env";

/// Directory under the user's documents folder receiving saved reports.
pub const REPORTS_DIR_NAME: &str = "Phabreview";

/// Base URL of the Phabricator install.
pub const PHABRICATOR_URL: &str = "PHABRICATOR_URL";
/// Conduit API token.
pub const PHABRICATOR_API_TOKEN: &str = "PHABRICATOR_API_TOKEN";
/// OpenRouter API key.
pub const OPENROUTER_API_KEY: &str = "OPENROUTER_API_KEY";
/// Model used when `--model` is not given.
pub const REVIEW_MODEL: &str = "REVIEW_MODEL";
/// Override for the OpenRouter endpoint base.
pub const OPENROUTER_BASE_URL_KEY: &str = "OPENROUTER_BASE_URL";

/// Every key read from the environment and the config files.
pub const CONFIG_KEYS: [&str; 5] = [
    PHABRICATOR_URL,
    PHABRICATOR_API_TOKEN,
    OPENROUTER_API_KEY,
    REVIEW_MODEL,
    OPENROUTER_BASE_URL_KEY,
];

/// The three configuration sources, highest precedence first.
///
/// # Examples
///
/// ```
/// use phabreview_core::ConfigLayers;
///
/// let mut layers = ConfigLayers::default();
/// layers.persisted.insert("REVIEW_MODEL".into(), "from-file".into());
/// layers.env.insert("REVIEW_MODEL".into(), "from-env".into());
/// assert_eq!(layers.lookup("REVIEW_MODEL"), Some("from-env"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    /// Process environment.
    pub env: HashMap<String, String>,
    /// `./.env` in the working directory.
    pub local: HashMap<String, String>,
    /// The persisted per-user config file.
    pub persisted: HashMap<String, String>,
}

impl ConfigLayers {
    /// Gather all three layers: process environment, `local_env` and
    /// `persisted`. Missing files contribute nothing.
    ///
    /// # Errors
    ///
    /// Returns [`PhabReviewError::Config`] if a file exists but cannot be
    /// parsed.
    pub fn gather(local_env: &Path, persisted: &Path) -> Result<Self, PhabReviewError> {
        let env = CONFIG_KEYS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
            .collect();
        Ok(Self {
            env,
            local: read_env_file(local_env)?,
            persisted: read_env_file(persisted)?,
        })
    }

    /// First non-empty value for `key`, searching env, then local, then
    /// persisted.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        [&self.env, &self.local, &self.persisted]
            .into_iter()
            .filter_map(|layer| layer.get(key))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
    }
}

/// Credentials and endpoints resolved once at startup.
///
/// Secrets are redacted from the `Debug` output.
#[derive(Clone)]
pub struct Credentials {
    /// Phabricator base URL (with or without the trailing `/api`).
    pub phabricator_url: String,
    /// Conduit API token.
    pub phabricator_token: String,
    /// OpenRouter API key.
    pub openrouter_key: String,
    /// Default model name, if configured.
    pub model: Option<String>,
    /// OpenRouter API root.
    pub openrouter_base_url: String,
}

impl Credentials {
    /// Resolve credentials from explicit layers.
    ///
    /// # Errors
    ///
    /// Returns [`PhabReviewError::Config`] naming every missing required key.
    ///
    /// # Examples
    ///
    /// ```
    /// use phabreview_core::{ConfigLayers, Credentials};
    ///
    /// let mut layers = ConfigLayers::default();
    /// layers.local.insert("PHABRICATOR_URL".into(), "https://phab.example.com".into());
    /// layers.local.insert("PHABRICATOR_API_TOKEN".into(), "api-xyz".into());
    /// layers.persisted.insert("OPENROUTER_API_KEY".into(), "sk-or-1".into());
    ///
    /// let creds = Credentials::resolve(&layers).unwrap();
    /// assert_eq!(creds.model(), phabreview_core::DEFAULT_MODEL);
    /// ```
    pub fn resolve(layers: &ConfigLayers) -> Result<Self, PhabReviewError> {
        let mut missing = Vec::new();
        let mut required = |key: &'static str| match layers.lookup(key) {
            Some(v) => v.to_string(),
            None => {
                missing.push(key);
                String::new()
            }
        };

        let phabricator_url = required(PHABRICATOR_URL);
        let phabricator_token = required(PHABRICATOR_API_TOKEN);
        let openrouter_key = required(OPENROUTER_API_KEY);

        if !missing.is_empty() {
            return Err(PhabReviewError::Config(format!(
                "missing required configuration: {}; run 'phabreview config' to set them",
                missing.join(", ")
            )));
        }

        Ok(Self {
            phabricator_url,
            phabricator_token,
            openrouter_key,
            model: layers.lookup(REVIEW_MODEL).map(str::to_string),
            openrouter_base_url: layers
                .lookup(OPENROUTER_BASE_URL_KEY)
                .unwrap_or(OPENROUTER_BASE_URL)
                .to_string(),
        })
    }

    /// Load credentials from the environment, `./.env` and the persisted
    /// config file.
    ///
    /// # Errors
    ///
    /// Returns [`PhabReviewError::Config`] if a required value is missing or
    /// a config file is malformed.
    pub fn load() -> Result<Self, PhabReviewError> {
        let persisted = config_path()?;
        let layers = ConfigLayers::gather(Path::new(".env"), &persisted)?;
        tracing::debug!(
            config = %persisted.display(),
            env = layers.env.len(),
            local = layers.local.len(),
            persisted = layers.persisted.len(),
            "configuration layers gathered"
        );
        Self::resolve(&layers)
    }

    /// Configured default model, or [`DEFAULT_MODEL`].
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("phabricator_url", &self.phabricator_url)
            .field("phabricator_token", &mask_secret(&self.phabricator_token))
            .field("openrouter_key", &mask_secret(&self.openrouter_key))
            .field("model", &self.model)
            .field("openrouter_base_url", &self.openrouter_base_url)
            .finish()
    }
}

/// Values written by `phabreview config`. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredConfig {
    /// Stored as `PHABRICATOR_URL`.
    pub phabricator_url: Option<String>,
    /// Stored as `PHABRICATOR_API_TOKEN`.
    pub phabricator_token: Option<String>,
    /// Stored as `OPENROUTER_API_KEY`.
    pub openrouter_key: Option<String>,
    /// Stored as `REVIEW_MODEL`.
    pub model: Option<String>,
}

impl StoredConfig {
    /// Read the persisted file. A missing file yields an empty config.
    pub fn load(path: &Path) -> Result<Self, PhabReviewError> {
        let mut values = read_env_file(path)?;
        let mut take = |key: &str| values.remove(key).filter(|v| !v.trim().is_empty());
        Ok(Self {
            phabricator_url: take(PHABRICATOR_URL),
            phabricator_token: take(PHABRICATOR_API_TOKEN),
            openrouter_key: take(OPENROUTER_API_KEY),
            model: take(REVIEW_MODEL),
        })
    }

    /// Overlay every value set in `other`.
    pub fn merge(&mut self, other: StoredConfig) {
        if other.phabricator_url.is_some() {
            self.phabricator_url = other.phabricator_url;
        }
        if other.phabricator_token.is_some() {
            self.phabricator_token = other.phabricator_token;
        }
        if other.openrouter_key.is_some() {
            self.openrouter_key = other.openrouter_key;
        }
        if other.model.is_some() {
            self.model = other.model;
        }
    }

    /// `true` when no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Serialize as `KEY=VALUE` lines.
    pub fn to_env_string(&self) -> String {
        let entries = [
            (PHABRICATOR_URL, &self.phabricator_url),
            (PHABRICATOR_API_TOKEN, &self.phabricator_token),
            (OPENROUTER_API_KEY, &self.openrouter_key),
            (REVIEW_MODEL, &self.model),
        ];
        entries
            .iter()
            .filter_map(|(key, value)| {
                value
                    .as_deref()
                    .map(|v| format!("{key}={}\n", quote_env_value(v)))
            })
            .collect()
    }

    /// Write to `path`, creating the parent directory. On Unix the
    /// directory is `0700` and the file `0600`.
    ///
    /// # Errors
    ///
    /// Returns [`PhabReviewError::Io`] if the directory or file cannot be
    /// written.
    pub fn save(&self, path: &Path) -> Result<(), PhabReviewError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
            #[cfg(unix)]
            set_mode(dir, 0o700)?;
        }
        write_private(path, self.to_env_string().as_bytes())?;
        tracing::info!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Write `contents` to a file that is `0600` from the moment it exists.
fn write_private(path: &Path, contents: &[u8]) -> Result<(), PhabReviewError> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    // `mode` only applies on creation; tighten files left by older writes.
    #[cfg(unix)]
    set_mode(path, 0o600)?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), PhabReviewError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Location of the persisted config file:
/// `$XDG_CONFIG_HOME/phab-reviewer/config.env`, falling back to
/// `~/.config/phab-reviewer/config.env`.
///
/// # Errors
///
/// Returns [`PhabReviewError::Config`] if no home directory can be found.
pub fn config_path() -> Result<PathBuf, PhabReviewError> {
    let xdg = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    let root = match xdg {
        Some(dir) => dir,
        None => dirs::home_dir()
            .ok_or_else(|| PhabReviewError::Config("cannot determine home directory".into()))?
            .join(".config"),
    };
    Ok(root.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Default directory for saved reports: `~/Documents/Phabreview`.
///
/// # Errors
///
/// Returns [`PhabReviewError::Config`] if no home directory can be found.
pub fn default_reports_dir() -> Result<PathBuf, PhabReviewError> {
    let documents = match dirs::document_dir() {
        Some(dir) => dir,
        None => dirs::home_dir()
            .ok_or_else(|| PhabReviewError::Config("cannot determine home directory".into()))?
            .join("Documents"),
    };
    Ok(documents.join(REPORTS_DIR_NAME))
}

/// Parse a dotenv-style file. A missing file yields an empty map.
///
/// # Errors
///
/// Returns [`PhabReviewError::Config`] if the file exists but is malformed.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>, PhabReviewError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let iter = dotenvy::from_path_iter(path).map_err(|e| {
        PhabReviewError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    iter.map(|item| {
        item.map_err(|e| {
            PhabReviewError::Config(format!("failed to parse {}: {e}", path.display()))
        })
    })
    .collect()
}

/// Redact a secret for display, keeping the last four characters.
///
/// # Examples
///
/// ```
/// use phabreview_core::mask_secret;
///
/// assert_eq!(mask_secret("api-abcdef123456"), "****3456");
/// assert_eq!(mask_secret("abc"), "****");
/// ```
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".into();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

fn quote_env_value(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@+=%?&,~".contains(c));
    if plain {
        value.to_string()
    } else if !value.contains('\'') {
        format!("'{value}'")
    } else {
        let escaped = value
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('$', "\\$");
        format!("\"{escaped}\"")
    }
}
