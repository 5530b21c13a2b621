//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default registry base URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.ollama.ai";

/// The default repository namespace prepended to single-segment model names.
pub const DEFAULT_REPO_NAMESPACE: &str = "library";

/// The default reference tag used when a model reference carries none.
pub const DEFAULT_TAG: &str = "latest";

/// The default number of concurrent blob downloads per pull.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// The default number of retry attempts beyond the first for transient errors.
pub const DEFAULT_RETRIES: u32 = 3;

/// The default directory where archives and staging directories are kept.
pub const DEFAULT_OUTPUT_DIR: &str = "downloaded-models";

/// The User-Agent header sent with every registry request.
pub const USER_AGENT: &str = "modelpack/0.2";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the default pull platform for the host, e.g. `linux/amd64`.
pub fn default_platform() -> String {
    format!("linux/{}", arch_name(std::env::consts::ARCH))
}

/// Maps a Rust architecture name onto the OCI platform vocabulary.
pub fn arch_name(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
