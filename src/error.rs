use thiserror::Error;

/// Error taxonomy for the reconciliation engine.
///
/// Each variant corresponds to one row of the error-policy table: some are
/// always fatal (the process aborts once they bubble up to `main`), others
/// are caught close to their source and only logged. The type itself makes
/// no decision about that — callers match on the variant.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("failed to connect to server {server}: {source}")]
    ConnectFailure {
        server: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("folder {folder:?} unavailable on server {server}: {source}")]
    FolderMissing {
        server: String,
        folder: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("IMAP mutation failed on server {server}: {source}")]
    ImapMutation {
        server: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("index insert failed after file write for fingerprint {fingerprint}: {source}")]
    IndexAfterWrite {
        fingerprint: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether this error class always terminates the process once it
    /// reaches `main` (see spec §7). `Other` is a passthrough for leaf
    /// helpers and is fatal by default unless the call site already turned
    /// the underlying condition into a logged skip before propagating.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ConfigInvalid(_)
                | EngineError::ConnectFailure { .. }
                | EngineError::ImapMutation { .. }
                | EngineError::IndexAfterWrite { .. }
                | EngineError::Other(_)
        )
    }

    /// Maps an error to the process exit code mandated by §6: 0 on success,
    /// non-zero on any fatal condition. All fatal kinds currently share a
    /// single non-zero code; the distinction is carried in the message.
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() { 1 } else { 0 }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
