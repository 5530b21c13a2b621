use reqwest::StatusCode;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a modelpack-related operation.
pub type ModelpackResult<T> = Result<T, ModelpackError>;

/// An error that occurred while pulling, staging, or serving model artifacts.
#[derive(Debug, Error)]
pub enum ModelpackError {
    /// An error that occurred during a file system operation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error returned by the HTTP client.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// An error that occurred while encoding or decoding JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The user-provided model reference could not be parsed.
    #[error("invalid model reference: {0}")]
    InvalidReference(String),

    /// The registry returned an auth challenge this client cannot satisfy.
    #[error("unsupported auth challenge: {0}")]
    AuthChallenge(String),

    /// The token endpoint answered without a usable token.
    #[error("no token in auth response")]
    TokenMissing,

    /// A registry endpoint answered with a status the caller cannot proceed from.
    #[error("unexpected status {context}: {status}")]
    UnexpectedStatus {
        /// What the client was doing when the status arrived.
        context: &'static str,
        /// The HTTP status that was returned.
        status: StatusCode,
    },

    /// The manifest endpoint returned a media type that is neither a manifest
    /// nor an index, and body auto-detection failed.
    #[error("unsupported manifest type: {media_type}; body: {body_prefix}")]
    UnsupportedManifestType {
        /// The effective content type of the response.
        media_type: String,
        /// The first 256 bytes of the response body.
        body_prefix: String,
    },

    /// An image index contained no manifest for the requested platform.
    #[error("no manifest for platform {0} found in index")]
    NoPlatformMatch(String),

    /// A descriptor digest uses an algorithm other than sha256.
    #[error("unsupported digest: {0}")]
    UnsupportedDigest(String),

    /// The streamed blob content did not hash to its descriptor digest.
    #[error("sha256 mismatch for {digest}: got {actual}")]
    DigestMismatch {
        /// The digest the descriptor promised.
        digest: String,
        /// The digest the downloaded bytes actually produced.
        actual: String,
    },

    /// A blob endpoint answered with a non-success status.
    #[error("blob fetch failed ({digest}): {status}")]
    BlobFetchFailed {
        /// The digest of the blob being fetched.
        digest: String,
        /// The HTTP status that was returned.
        status: StatusCode,
    },

    /// A header value could not be constructed from the given string.
    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    /// An error that occurred while writing the output archive.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// A requested download name would escape the downloads directory.
    #[error("path escapes downloads directory: {0}")]
    PathTraversal(String),

    /// No download task exists with the given id.
    #[error("download task not found: {0}")]
    TaskNotFound(String),

    /// The requested action is not legal from the task's current state.
    #[error("cannot {action} task in state {state}")]
    InvalidTaskTransition {
        /// The action that was attempted.
        action: &'static str,
        /// The state the task was in.
        state: String,
    },

    /// The operation was canceled by a pause or cancel request.
    #[error("operation canceled")]
    Canceled,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ModelpackError {
    /// Returns true when the error represents cancellation rather than failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ModelpackError::Canceled)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `ModelpackResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> ModelpackResult<T> {
    Result::Ok(value)
}
