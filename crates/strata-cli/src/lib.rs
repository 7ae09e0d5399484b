// Target-specific transitive dependency split (mio/crossterm stack) is accepted for now.
#![allow(clippy::multiple_crate_versions)]

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand, ValueEnum};
use minus::{ExitStrategy, Pager, page_all};
use strata_domain::RunOutcome;
use strata_engine::{
    CancelHandle, FileStateStore, Plan, Reconciler, execute, plan, plan_destroy,
};
use strata_report::{
    ColorChoice, OutputFormat, RenderOptions, redact_sensitive, render_plan, render_run,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod error;

pub use error::CliError;

const LOG_ENV: &str = "STRATA_LOG";
const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Parser)]
#[command(
    name = "strata",
    version,
    about = "Declarative infrastructure reconciler"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show the changes needed to reach the configured state.
    Plan {
        source: PathBuf,
        #[command(flatten)]
        flags: RunFlags,
    },
    /// Reconcile the environment toward the configuration.
    Apply {
        source: PathBuf,
        #[command(flatten)]
        flags: RunFlags,
        #[arg(long)]
        execute: bool,
    },
    /// Delete every resource recorded for the environment.
    Destroy {
        source: PathBuf,
        #[command(flatten)]
        flags: RunFlags,
        #[arg(long)]
        execute: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Args)]
struct RunFlags {
    /// Directory holding one state snapshot per environment.
    #[arg(long, env = "STRATA_STATE_DIR")]
    state_dir: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = FormatArg::Text)]
    format: FormatArg,
    #[arg(long, value_enum, default_value_t = ColorArg::Auto)]
    color: ColorArg,
    #[arg(long)]
    verbose: bool,
    /// Maximum number of provider calls in flight.
    #[arg(long)]
    concurrency: Option<usize>,
    /// Stop starting new nodes after the first failure.
    #[arg(long)]
    fail_fast: bool,
}

impl RunFlags {
    fn render_options(&self, command: &str, target: &Path) -> RenderOptions {
        RenderOptions {
            color: self.color.into(),
            verbose: self.verbose,
            command: Some(command.to_string()),
            target: Some(target.display().to_string()),
        }
    }

    fn state_store(&self) -> std::result::Result<FileStateStore, CliError> {
        let dir = match &self.state_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_local_dir()
                .map(|base| base.join("strata").join("state"))
                .ok_or(CliError::StateDirUnavailable)?,
        };
        debug!(dir = %dir.display(), "using state directory");
        Ok(FileStateStore::new(dir))
    }
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Text => Self::Text,
            FormatArg::Json => Self::Json,
        }
    }
}

impl From<ColorArg> for ColorChoice {
    fn from(value: ColorArg) -> Self {
        match value {
            ColorArg::Auto => Self::Auto,
            ColorArg::Always => Self::Always,
            ColorArg::Never => Self::Never,
        }
    }
}

impl Commands {
    fn flags(&self) -> &RunFlags {
        match self {
            Self::Plan { flags, .. } | Self::Apply { flags, .. } | Self::Destroy { flags, .. } => {
                flags
            }
        }
    }
}

/// Run the CLI using process arguments.
///
/// # Errors
///
/// Returns an error when argument parsing fails (excluding help/version) or command
/// execution fails.
pub fn run() -> std::result::Result<i32, CliError> {
    run_from(std::env::args_os())
}

fn run_from<I, T>(args: I) -> std::result::Result<i32, CliError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(parsed) => parsed,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(error.into()),
        },
    };
    init_logging(cli.command.flags().verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| CliError::Runtime { source })?;
    runtime.block_on(dispatch(cli.command))
}

async fn dispatch(command: Commands) -> std::result::Result<i32, CliError> {
    match command {
        Commands::Plan { source, flags } => {
            let store = flags.state_store()?;
            let plan = plan(&source, &store).await?;
            show_plan(&plan, "plan", &source, &flags, false)
        }
        Commands::Apply {
            source,
            flags,
            execute,
        } => {
            let store = flags.state_store()?;
            let plan = plan(&source, &store).await?;
            if !execute {
                return show_plan(&plan, "apply", &source, &flags, true);
            }
            run_plan(plan, "apply", &source, &flags, &store).await
        }
        Commands::Destroy {
            source,
            flags,
            execute,
        } => {
            let store = flags.state_store()?;
            let plan = plan_destroy(&source, &store).await?;
            if !execute {
                return show_plan(&plan, "destroy", &source, &flags, true);
            }
            run_plan(plan, "destroy", &source, &flags, &store).await
        }
    }
}

fn show_plan(
    plan: &Plan,
    command: &str,
    source: &Path,
    flags: &RunFlags,
    hint: bool,
) -> std::result::Result<i32, CliError> {
    let output_format: OutputFormat = flags.format.into();
    let rendered = render_plan(
        &plan.changeset,
        output_format,
        &flags.render_options(command, source),
    )?;
    emit_output(&rendered, output_format, &plan.sensitive_values);

    let has_changes = plan.changeset.has_changes();
    if hint && has_changes && output_format == OutputFormat::Text {
        eprintln!("hint: re-run with --execute to apply changes");
    }
    Ok(if has_changes { 2 } else { 0 })
}

async fn run_plan(
    plan: Plan,
    command: &str,
    source: &Path,
    flags: &RunFlags,
    store: &FileStateStore,
) -> std::result::Result<i32, CliError> {
    let mut options = plan.options();
    if let Some(concurrency) = flags.concurrency {
        options.concurrency = concurrency;
    }
    options.fail_fast |= flags.fail_fast;

    let cancel = CancelHandle::new();
    let reconciler = Reconciler::new(plan.registry(), options).with_cancel(cancel.clone());
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, waiting for in-flight operations to finish");
            cancel.cancel();
        }
    });
    let outcome = execute(plan, &reconciler, store).await;
    interrupt.abort();
    let outcome = outcome?;

    let output_format: OutputFormat = flags.format.into();
    let rendered = render_run(
        &outcome.report,
        output_format,
        &flags.render_options(command, source),
    )?;
    emit_output(&rendered, output_format, &outcome.sensitive_values);

    Ok(match outcome.report.outcome() {
        RunOutcome::Succeeded => 0,
        RunOutcome::PartiallyFailed => 1,
        RunOutcome::Cancelled => EXIT_CANCELLED,
    })
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn emit_output(rendered: &str, format: OutputFormat, sensitive_values: &BTreeSet<String>) {
    let redacted = redact_sensitive(rendered, sensitive_values);

    if format == OutputFormat::Text && should_use_pager() && page_output(&redacted).is_ok() {
        return;
    }

    if redacted.ends_with('\n') {
        print!("{redacted}");
    } else {
        println!("{redacted}");
    }
}

fn should_use_pager() -> bool {
    std::io::stdout().is_terminal() && std::env::var_os("NO_PAGER").is_none()
}

fn page_output(rendered: &str) -> std::result::Result<(), minus::MinusError> {
    let pager = Pager::new();
    pager.set_exit_strategy(ExitStrategy::PagerQuit)?;
    pager.set_text(rendered)?;
    page_all(pager)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::ffi::OsString;
    use std::fs;

    use super::{CliError, run_from};

    const CONFIG: &str = "version: v1\nresources: {}\n";

    #[test]
    fn help_exits_zero() {
        assert_eq!(run_from(["strata", "--help"]).expect("help"), 0);
    }

    #[test]
    fn unknown_subcommand_is_an_argument_error() {
        let error = run_from(["strata", "frobnicate"]).expect_err("bad subcommand");
        assert!(matches!(error, CliError::ArgumentParse(_)), "{error}");
    }

    #[test]
    fn empty_configuration_plans_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = temp.path().join("main.yml");
        fs::write(&config, CONFIG).expect("write config");

        let args: Vec<OsString> = vec![
            "strata".into(),
            "plan".into(),
            config.into_os_string(),
            "--state-dir".into(),
            temp.path().join("state").into_os_string(),
            "--format".into(),
            "json".into(),
        ];
        assert_eq!(run_from(args).expect("plan"), 0);
    }

    #[test]
    fn missing_source_is_a_pipeline_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let args: Vec<OsString> = vec![
            "strata".into(),
            "plan".into(),
            temp.path().join("nope").into_os_string(),
            "--state-dir".into(),
            temp.path().join("state").into_os_string(),
        ];
        let error = run_from(args).expect_err("missing source");
        assert!(matches!(error, CliError::Pipeline(_)), "{error}");
    }
}
