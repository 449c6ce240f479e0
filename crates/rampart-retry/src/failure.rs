/// Why a retried open ended without a document.
///
/// Every call to [`open_with_retry`](crate::open_with_retry) that does not
/// return a document returns exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenFailure {
    /// The stored record is newer than this server understands.
    /// Never retried.
    #[error("backwards compatibility: {0}")]
    BackwardsCompatibility(String),

    /// The backend service kept failing until the attempts ran out.
    #[error("backend service failed after {attempts} attempts: {detail}")]
    BackendService { attempts: u32, detail: String },

    /// Unclassified failures until the attempts ran out.
    #[error("open failed after {attempts} attempts: {detail}")]
    ExhaustedRetries { attempts: u32, detail: String },

    /// The store shut down before the open could start. Not the player's
    /// fault, and nothing to report.
    #[error("document store is shut down")]
    ShuttingDown,

    /// A failure retrying cannot fix, such as an abandoned open.
    #[error("{0}")]
    Other(String),
}

impl OpenFailure {
    /// `true` if the policy gave up because it ran out of attempts.
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            Self::BackendService { .. } | Self::ExhaustedRetries { .. }
        )
    }

    /// The underlying error text, without the attempt count.
    pub fn detail(&self) -> &str {
        match self {
            Self::BackwardsCompatibility(detail)
            | Self::BackendService { detail, .. }
            | Self::ExhaustedRetries { detail, .. }
            | Self::Other(detail) => detail,
            Self::ShuttingDown => "document store is shut down",
        }
    }
}
