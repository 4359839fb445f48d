use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use phabreview_core::{
    config_path, default_reports_dir, mask_secret, ConfigLayers, Credentials, RevisionId,
    StoredConfig, CONFIG_KEYS, OPENROUTER_API_KEY, PHABRICATOR_API_TOKEN,
};
use phabreview_review::pipeline::{
    ReviewFailure, ReviewOptions, ReviewPipeline, Stage, StageObserver,
};

#[derive(Parser)]
#[command(
    name = "phabreview",
    version,
    about = "Review Phabricator revisions with an LLM",
    long_about = "Fetches a Phabricator revision over Conduit, summarizes its diff, and asks a\n\
                   model on OpenRouter for a structured code review.\n\n\
                   Examples:\n  \
                     phabreview config --phabricator-url https://phab.example.com \\\n      \
                       --phabricator-token api-xxxx --openrouter-key sk-or-xxxx\n  \
                     phabreview review D33113\n  \
                     phabreview review D33113 --only-review --save-review\n  \
                     phabreview review 33113 --model openai/gpt-4o-mini"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging on stderr
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Review a revision and print the result
    #[command(long_about = "Review a revision and print the result.\n\n\
        The identifier may be written D33113, d33113 or 33113. With --save-review the\n\
        markdown report is written to <reports-dir>/D<n>.md, replacing an earlier one.\n\n\
        Examples:\n  phabreview review D33113\n  phabreview review D33113 --save-review --reports-dir ./reviews")]
    Review {
        /// Revision identifier, e.g. D33113
        revision: String,

        /// Print only the review, without the revision header and change summary
        #[arg(long)]
        only_review: bool,

        /// Save the review as markdown
        #[arg(long)]
        save_review: bool,

        /// Model to use (default: REVIEW_MODEL or xiaomi/mimo-v2-flash:free)
        #[arg(long)]
        model: Option<String>,

        /// Approximate token budget for the diff part of the prompt
        #[arg(long)]
        max_diff_tokens: Option<usize>,

        /// Directory for saved reports (default: ~/Documents/Phabreview)
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
    /// Store credentials in the per-user config file, or show them
    #[command(long_about = "Store credentials in the per-user config file, or show them.\n\n\
        Given values are merged into $XDG_CONFIG_HOME/phab-reviewer/config.env\n\
        (~/.config/phab-reviewer/config.env by default). Without flags, prints the\n\
        config path and the values in effect, with secrets masked.\n\n\
        Examples:\n  phabreview config --openrouter-key sk-or-xxxx\n  phabreview config")]
    Config {
        /// Phabricator base URL
        #[arg(long)]
        phabricator_url: Option<String>,

        /// Conduit API token
        #[arg(long)]
        phabricator_token: Option<String>,

        /// OpenRouter API key
        #[arg(long)]
        openrouter_key: Option<String>,

        /// Default model
        #[arg(long)]
        model: Option<String>,
    },
}

/// Drives a stderr spinner from the pipeline's stage transitions.
struct SpinnerObserver {
    bar: Option<ProgressBar>,
}

impl SpinnerObserver {
    fn new() -> Self {
        if !std::io::stderr().is_terminal() {
            return Self { bar: None };
        }
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar: Some(bar) }
    }

    fn clear(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

impl StageObserver for SpinnerObserver {
    fn on_stage(&self, revision: RevisionId, stage: Stage) {
        let Some(bar) = &self.bar else {
            return;
        };
        let message = match stage {
            Stage::Fetching => format!("Fetching {revision} from Phabricator..."),
            Stage::Summarizing => format!("Summarizing the diff of {revision}..."),
            Stage::Composing => "Composing the prompt...".to_string(),
            Stage::Requesting => "Waiting for the review...".to_string(),
            Stage::Rendering => "Rendering the review...".to_string(),
            Stage::Done => {
                bar.finish_and_clear();
                return;
            }
        };
        bar.set_message(message);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "warn,phabreview=debug,phabreview_core=debug,phabreview_difflens=debug,phabreview_review=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

async fn run_review(revision: &str, options: ReviewOptions) -> Result<()> {
    // Reject malformed identifiers before touching the configuration.
    RevisionId::parse(revision).map_err(|error| ReviewFailure {
        stage: Stage::Fetching,
        error,
    })?;

    let credentials = Credentials::load()?;
    tracing::debug!(?credentials, "credentials resolved");
    let pipeline = ReviewPipeline::new(credentials)?;

    let spinner = SpinnerObserver::new();
    let result = pipeline.review(revision, &options, &spinner).await;
    spinner.clear();
    let report = result?;

    println!("{}", report.render(options.only_review));
    if let Some(path) = &report.saved_to {
        eprintln!("Review saved to {}", path.display());
    }
    Ok(())
}

fn run_config(updates: StoredConfig) -> Result<()> {
    let path = config_path()?;

    if updates.is_empty() {
        show_config(&path)?;
        return Ok(());
    }

    let mut stored = StoredConfig::load(&path)?;
    stored.merge(updates);
    stored.save(&path)?;
    println!("Configuration saved to {}", path.display());
    Ok(())
}

fn show_config(path: &Path) -> Result<()> {
    let layers = ConfigLayers::gather(Path::new(".env"), path)?;
    let exists = if path.exists() { "" } else { " (not created yet)" };
    println!("Config file: {}{exists}", path.display());

    for key in CONFIG_KEYS {
        let value = match layers.lookup(key) {
            Some(v) if key == PHABRICATOR_API_TOKEN || key == OPENROUTER_API_KEY => mask_secret(v),
            Some(v) => v.to_string(),
            None => "(not set)".to_string(),
        };
        println!("  {key}={value}");
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .into_diagnostic()?;
    human_panic::setup_panic!();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Review {
            revision,
            only_review,
            save_review,
            model,
            max_diff_tokens,
            reports_dir,
        } => {
            let reports_dir = match reports_dir {
                Some(dir) => dir,
                None if save_review => default_reports_dir()?,
                None => PathBuf::new(),
            };
            let options = ReviewOptions {
                model,
                only_review,
                save_review,
                reports_dir,
                max_diff_tokens,
            };
            run_review(&revision, options).await
        }
        Command::Config {
            phabricator_url,
            phabricator_token,
            openrouter_key,
            model,
        } => run_config(StoredConfig {
            phabricator_url,
            phabricator_token,
            openrouter_key,
            model,
        }),
    }
}
