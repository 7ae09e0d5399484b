use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to encode {what} as JSON")]
    JsonSerialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
