//! Error taxonomy for driver operations.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KilnError`].
pub type KilnResult<T> = Result<T, KilnError>;

/// Coarse classification of a [`KilnError`].
///
/// Pipelines use this to decide whether a failure aborts the build
/// or can be corrected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A referenced container, image or tag does not exist.
    NotFound,
    /// The backing runtime cannot be reached or is unusable.
    RuntimeUnavailable,
    /// Authentication failed or is missing.
    Auth,
    /// The operation collides with existing state.
    Conflict,
    /// Reading or writing an archive stream failed.
    Io,
    /// Invalid caller-supplied configuration.
    Config,
    /// Any other failure reported by the runtime.
    Runtime,
}

impl ErrorKind {
    /// Whether the caller can fix the failure without touching the runtime.
    #[must_use]
    pub const fn is_caller_correctable(self) -> bool {
        matches!(self, Self::Auth | Self::Conflict | Self::Config)
    }
}

/// Errors returned by driver operations.
#[derive(Error, Diagnostic, Debug)]
pub enum KilnError {
    /// Container not found.
    #[error("Container not found: {id}")]
    #[diagnostic(code(kiln::container::not_found))]
    ContainerNotFound {
        /// The container ID that was not found.
        id: String,
    },

    /// Container exists but is not running.
    #[error("Container is not running: {id}")]
    #[diagnostic(code(kiln::container::not_running))]
    ContainerNotRunning {
        /// The container ID.
        id: String,
    },

    /// Container has no network attachment.
    #[error("Container has no network address: {id}")]
    #[diagnostic(
        code(kiln::container::no_address),
        help("Start the container on a network that assigns addresses")
    )]
    NoNetworkAddress {
        /// The container ID.
        id: String,
    },

    /// Image not found.
    #[error("Image not found: {reference}")]
    #[diagnostic(code(kiln::image::not_found))]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(kiln::container::invalid_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// Invalid digest format.
    #[error("Invalid digest: {value}")]
    #[diagnostic(code(kiln::image::invalid_digest), help("Digests look like 'sha256:<hex>'"))]
    InvalidDigest {
        /// The invalid value.
        value: String,
    },

    /// Unparseable runtime version.
    #[error("Invalid runtime version: {value}")]
    #[diagnostic(code(kiln::runtime::invalid_version))]
    InvalidVersion {
        /// The invalid value.
        value: String,
    },

    /// The runtime cannot be reached.
    #[error("Container runtime unavailable: {message}")]
    #[diagnostic(
        code(kiln::runtime::unavailable),
        help("Check that the runtime is installed and its daemon is running")
    )]
    RuntimeUnavailable {
        /// What went wrong.
        message: String,
    },

    /// The runtime is older than required.
    #[error("Runtime version {found} is older than the required {required}")]
    #[diagnostic(code(kiln::runtime::unsupported_version))]
    UnsupportedVersion {
        /// Version reported by the runtime.
        found: String,
        /// Minimum version configured.
        required: String,
    },

    /// Registry authentication failed or is required.
    #[error("Authentication failed for registry {registry}: {message}")]
    #[diagnostic(
        code(kiln::registry::auth),
        help("Call login for this registry before pushing or pulling")
    )]
    Auth {
        /// Registry host.
        registry: String,
        /// Runtime or registry message.
        message: String,
    },

    /// A tag already points at another image.
    #[error("Reference {reference} already points at {existing}")]
    #[diagnostic(code(kiln::image::tag_conflict), help("Pass force to rebind the reference"))]
    TagConflict {
        /// The reference that was requested.
        reference: String,
        /// Image currently bound to the reference.
        existing: String,
    },

    /// A registry session is already open.
    #[error("A registry session is already open for {registry}")]
    #[diagnostic(
        code(kiln::session::active),
        help("Logout must be called before logging in again")
    )]
    SessionActive {
        /// Registry of the open session.
        registry: String,
    },

    /// Logout without a session.
    #[error("No registry session is open (logout requested for {registry})")]
    #[diagnostic(code(kiln::session::none))]
    NoSession {
        /// Registry named by the logout.
        registry: String,
    },

    /// An operation targets a different registry than the open session.
    #[error("Registry session is open for {active}, not {requested}")]
    #[diagnostic(code(kiln::session::mismatch))]
    SessionMismatch {
        /// Registry of the open session.
        active: String,
        /// Registry the operation targets.
        requested: String,
    },

    /// Image cannot be removed while something depends on it.
    #[error("Image {reference} is in use: {message}")]
    #[diagnostic(code(kiln::image::in_use))]
    ImageInUse {
        /// The image reference.
        reference: String,
        /// Runtime message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(kiln::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(kiln::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(kiln::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// The runtime reported a failure that fits no other kind.
    #[error("Runtime command `{command}` failed ({}): {stderr}", exit_label(.status))]
    #[diagnostic(code(kiln::runtime::command))]
    Runtime {
        /// The runtime subcommand.
        command: String,
        /// Exit code, if the process exited normally.
        status: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(kiln::internal), help("This is a bug, please report it"))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl KilnError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ContainerNotFound { .. }
            | Self::ContainerNotRunning { .. }
            | Self::NoNetworkAddress { .. }
            | Self::ImageNotFound { .. } => ErrorKind::NotFound,
            Self::RuntimeUnavailable { .. } | Self::UnsupportedVersion { .. } => {
                ErrorKind::RuntimeUnavailable
            }
            Self::Auth { .. } => ErrorKind::Auth,
            Self::TagConflict { .. }
            | Self::SessionActive { .. }
            | Self::NoSession { .. }
            | Self::SessionMismatch { .. }
            | Self::ImageInUse { .. } => ErrorKind::Conflict,
            Self::Io(_) => ErrorKind::Io,
            Self::InvalidContainerId { .. }
            | Self::InvalidDigest { .. }
            | Self::Config { .. } => ErrorKind::Config,
            Self::InvalidVersion { .. }
            | Self::Serialization(_)
            | Self::Runtime { .. }
            | Self::Internal { .. } => ErrorKind::Runtime,
        }
    }
}

#[allow(clippy::ref_option)]
fn exit_label(status: &Option<i32>) -> String {
    status.map_or_else(|| "signal".to_string(), |code| format!("exit {code}"))
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
