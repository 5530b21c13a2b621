use std::path::PathBuf;

use clap::Parser;

use crate::{
    cli::styles,
    config::{default_platform, DEFAULT_CONCURRENCY, DEFAULT_OUTPUT_DIR, DEFAULT_REGISTRY, DEFAULT_RETRIES},
};

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// `modelpack` pulls OCI-hosted model distributions into portable zip archives
#[derive(Debug, Parser)]
#[command(name = "modelpack", author, version, styles = styles::styles())]
pub struct ModelpackArgs {
    /// Model reference to pull (`name[:tag]`, `owner/name[:tag]`, or
    /// `name@sha256:<hex>`). Starts the web interface when omitted.
    #[arg(value_name = "MODEL")]
    pub model: Option<String>,

    /// Registry base URL
    #[arg(long, default_value = DEFAULT_REGISTRY)]
    pub registry: String,

    /// Target platform used to select a manifest from an index
    #[arg(long, default_value_t = default_platform())]
    pub platform: String,

    /// Number of concurrent blob downloads
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Retry attempts for transient errors
    #[arg(long, default_value_t = DEFAULT_RETRIES)]
    pub retries: u32,

    /// Overall request timeout in seconds (0 = no limit)
    #[arg(long, default_value_t = 0)]
    pub timeout: u64,

    /// Skip TLS verification (NOT recommended)
    #[arg(long)]
    pub insecure: bool,

    /// Keep the staging directory (do not delete after the archive is written)
    #[arg(long = "keep-staging")]
    pub keep_staging: bool,

    /// Directory to save downloaded models
    #[arg(long = "output-dir", default_value = DEFAULT_OUTPUT_DIR, value_name = "DIR")]
    pub output_dir: PathBuf,

    /// Output zip path (default: `<output-dir>/<session-id>.zip`)
    #[arg(short = 'o', value_name = "PATH")]
    pub out_zip: Option<PathBuf>,

    /// Port for the web interface (0 = ephemeral)
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = ModelpackArgs::parse_from(["modelpack"]);
        assert!(args.model.is_none());
        assert_eq!(args.registry, DEFAULT_REGISTRY);
        assert_eq!(args.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(args.retries, DEFAULT_RETRIES);
        assert_eq!(args.timeout, 0);
        assert_eq!(args.port, 0);
        assert!(!args.insecure);
        assert!(!args.keep_staging);
        assert_eq!(args.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
    }

    #[test]
    fn test_pull_invocation() {
        let args = ModelpackArgs::parse_from([
            "modelpack",
            "--registry",
            "http://127.0.0.1:5000",
            "--concurrency",
            "2",
            "-o",
            "out/model.zip",
            "llama3:8b",
        ]);
        assert_eq!(args.model.as_deref(), Some("llama3:8b"));
        assert_eq!(args.registry, "http://127.0.0.1:5000");
        assert_eq!(args.concurrency, 2);
        assert_eq!(args.out_zip, Some(PathBuf::from("out/model.zip")));
    }
}
