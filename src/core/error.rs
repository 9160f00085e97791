use serde::{Deserialize, Serialize};

/// Why a single transfer attempt failed.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    #[error("unknown failure")]
    Unknown,
    #[error("output file could not be created")]
    CreateFile,
    #[error("output file could not be opened")]
    OpenFile,
    #[error("connection too small for a video")]
    TooSmall,
    #[error("server returned non-video content")]
    WrongContent,
    #[error("connection error")]
    ConnectionError,
    #[error("storage location unavailable")]
    StorageUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    Done,
    Stopped,
    Failed(FailureKind),
}

impl TransferOutcome {
    /// Done and Stopped both end the mirror loop.
    pub fn ends_fallback(&self) -> bool {
        !matches!(self, TransferOutcome::Failed(_))
    }

    /// Logical result code: positive for success, negative for errors.
    pub fn code(&self) -> i32 {
        match self {
            TransferOutcome::Done => 1,
            TransferOutcome::Stopped => 2,
            TransferOutcome::Failed(FailureKind::CreateFile) => -2,
            TransferOutcome::Failed(FailureKind::OpenFile) => -3,
            TransferOutcome::Failed(FailureKind::TooSmall) => -4,
            TransferOutcome::Failed(FailureKind::WrongContent) => -5,
            TransferOutcome::Failed(FailureKind::ConnectionError) => -6,
            TransferOutcome::Failed(FailureKind::StorageUnavailable) => -7,
            TransferOutcome::Failed(FailureKind::Unknown) => -10,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("record {namespace}/{key} has schema version {found}, expected {expected}")]
    SchemaMismatch {
        namespace: &'static str,
        key: String,
        found: u32,
        expected: u32,
    },

    #[error("record {namespace}/{key} is malformed: {source}")]
    Codec {
        namespace: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}
