use std::{process, sync::Arc, time::Duration};

use clap::Parser;
use modelpack::{
    cli::ModelpackArgs,
    config::PullConfig,
    manager::{DownloadManager, ManagerConfig},
    pull::{Progress, PullEngine},
    server::{self, ServerState},
    ModelpackResult,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ModelpackResult<()> {
    let args = ModelpackArgs::parse();

    let default_filter = if args.verbose { "modelpack=debug,info" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.model.clone() {
        Some(model) => run_pull(args, model).await,
        None => run_server(args).await,
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// One-shot CLI pull: resolve, download, archive, exit.
async fn run_pull(args: ModelpackArgs, model: String) -> ModelpackResult<()> {
    let mut config = PullConfig::new(model, &args.output_dir);
    config
        .set_registry(args.registry)
        .set_platform(args.platform)
        .set_concurrency(args.concurrency)
        .set_retries(args.retries)
        .set_timeout((args.timeout > 0).then(|| Duration::from_secs(args.timeout)))
        .set_insecure(args.insecure)
        .set_keep_staging(args.keep_staging);
    if let Some(out_zip) = args.out_zip {
        config.set_out_zip(out_zip);
    }

    let progress = Arc::new(Progress::new(0));
    let cancel = CancellationToken::new();
    let render = progress.start_render(cancel.clone());

    let engine = PullEngine::new(&config)?;
    let result = engine.run(&progress, &cancel).await;

    cancel.cancel();
    let _ = render.await;
    if progress.total() > 0 {
        eprintln!();
    }

    match result {
        Ok(()) => {
            println!("OK: {}", config.get_out_zip().display());
            Ok(())
        }
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(1);
        }
    }
}

/// Web-server mode: seed recovered sessions, start the worker, serve the
/// control plane.
async fn run_server(args: ModelpackArgs) -> ModelpackResult<()> {
    tokio::fs::create_dir_all(&args.output_dir).await?;

    let mut config = ManagerConfig::new(&args.output_dir);
    config
        .set_registry(args.registry)
        .set_platform(args.platform)
        .set_concurrency(args.concurrency)
        .set_retries(args.retries)
        .set_timeout((args.timeout > 0).then(|| Duration::from_secs(args.timeout)))
        .set_insecure(args.insecure)
        .set_keep_staging(args.keep_staging);

    let manager = Arc::new(DownloadManager::new(config));
    manager.seed_from_disk().await;
    let _worker = manager.start();

    let state = ServerState::new(manager, &args.output_dir);
    server::serve(state, args.port).await
}
