//! Error types for the backend client and the lifecycle manager.

/// Errors raised by a sandbox provisioning backend.
///
/// Backends map their transport and API failures into these variants.
/// `NotFound` is the only one the manager treats specially.
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("provision failed: {0}")]
    Provision(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("timeout")]
    Timeout,

    #[error("serialization: {0}")]
    Serde(String),
}

/// Errors surfaced by [`crate::manager::ContainerManager`].
#[derive(thiserror::Error, Debug)]
pub enum AllocatorError {
    #[error("user id must not be empty")]
    InvalidUserId,

    #[error("provisioning error: {0}")]
    Provisioning(#[from] BackendError),

    #[error("user {user_id} is mapped to sandbox {sandbox_id}, which the backend no longer recognizes")]
    InconsistentState { user_id: String, sandbox_id: String },

    /// The create call did not finish before the deadline. The sandbox may
    /// or may not exist at the backend.
    #[error("create of sandbox {sandbox_id} timed out; outcome unknown")]
    CreateOutcomeUnknown { sandbox_id: String },

    #[error("release of sandbox {sandbox_id} failed: {source}")]
    Release {
        sandbox_id: String,
        #[source]
        source: BackendError,
    },
}
