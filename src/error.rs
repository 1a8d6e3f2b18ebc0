use crate::spreadsheet::SpreadsheetError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid: {0}")]
    Invalid(String),

    #[error("no file uploaded")]
    MissingFile,

    #[error("bad format: {0}")]
    BadFormat(String),

    #[error("unreadable spreadsheet: {0}")]
    Spreadsheet(#[from] SpreadsheetError),

    #[error("no latest table found")]
    NoLatestTable,

    #[error("Cache error: {0}")]
    Cache(String),

    /// A storage step of ingest or query failed; `context` names the step.
    #[error("{context}: {source}")]
    Failed {
        context: &'static str,
        #[source]
        source: Box<SheetError>,
    },
}

impl SheetError {
    pub fn failed(context: &'static str, source: SheetError) -> Self {
        SheetError::Failed {
            context,
            source: Box::new(source),
        }
    }

    /// True for errors caused by the caller's input rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SheetError::MissingFile | SheetError::BadFormat(_) | SheetError::Spreadsheet(_)
        )
    }
}
