use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    ArgumentParse(#[from] clap::Error),
    #[error("failed to start async runtime")]
    Runtime {
        #[source]
        source: std::io::Error,
    },
    #[error("no state directory: pass --state-dir or set STRATA_STATE_DIR")]
    StateDirUnavailable,
    #[error(transparent)]
    Pipeline(#[from] strata_engine::PipelineError),
    #[error(transparent)]
    Report(#[from] strata_report::ReportError),
}
