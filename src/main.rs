//! CLI entry point for rangefetch.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use rangefetch_core::{
    Database, DownloadEngine, DownloadStatus, EngineConfig, ProgressSnapshot, RetryPolicy,
};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // RUST_LOG wins over the verbosity flags
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let db = Database::new(&args.db_path)
        .await
        .with_context(|| format!("opening task registry {}", args.db_path.display()))?;
    let config = EngineConfig::default()
        .with_save_dir(&args.save_dir)
        .with_thread_count(usize::from(args.threads))
        .with_retry_policy(RetryPolicy::with_max_attempts(u32::from(args.max_retries)));
    let engine = DownloadEngine::from_database(config, db)?;

    if args.list {
        list(&engine, args.json).await?;
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(url) = &args.delete {
        engine.delete(url).await?;
        info!(url = %url, "download deleted");
        return Ok(ExitCode::SUCCESS);
    }

    match &args.url {
        Some(url) => download(&engine, url, args.json).await,
        None => Ok(ExitCode::SUCCESS),
    }
}

async fn list(engine: &DownloadEngine, json: bool) -> Result<()> {
    for task in engine.list().await? {
        if json {
            println!("{}", serde_json::to_string(&task)?);
            continue;
        }
        let total = task
            .content_length()
            .map_or_else(|| "?".to_string(), |len| len.to_string());
        println!(
            "{:<10} {:>12}/{:<12} {}  {}/{}",
            task.status_str, task.downloaded_bytes, total, task.url, task.save_dir, task.save_name
        );
    }
    Ok(())
}

async fn download(engine: &DownloadEngine, url: &str, json: bool) -> Result<ExitCode> {
    let task = engine.prepare(url).await?;
    info!(url = %task.url, file = %task.save_name, "starting download");

    let mut handle = engine.start(&task)?;
    let control = handle.control();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut reported_decile = None;
    let mut last = None;

    loop {
        tokio::select! {
            signal = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                match signal {
                    Ok(()) => {
                        warn!("interrupted, pausing download");
                        control.pause();
                    }
                    Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
                }
            }
            snapshot = handle.progress().recv() => match snapshot {
                Some(snapshot) => {
                    if json {
                        println!("{}", serde_json::to_string(&snapshot)?);
                    }
                    report_progress(&snapshot, &mut reported_decile);
                    last = Some(snapshot);
                }
                None => break,
            },
        }
    }

    let Some(last) = last else {
        warn!("download ended without a status");
        return Ok(ExitCode::FAILURE);
    };
    if last.status == DownloadStatus::Completed {
        if !json
            && let Some(paths) = engine.files(url).await?
        {
            println!("{}", paths.final_path.display());
        }
        info!(bytes = last.downloaded_bytes, "download complete");
        return Ok(ExitCode::SUCCESS);
    }

    match &last.failure {
        Some(failure) => warn!(status = %last.status, error = %failure, "download did not complete"),
        None => warn!(
            status = %last.status,
            downloaded = last.downloaded_bytes,
            "download did not complete"
        ),
    }
    Ok(ExitCode::FAILURE)
}

/// Logs each 10% step once.
fn report_progress(snapshot: &ProgressSnapshot, reported_decile: &mut Option<u64>) {
    debug!(
        status = %snapshot.status,
        downloaded = snapshot.downloaded_bytes,
        total = ?snapshot.total_bytes,
        "progress"
    );
    let Some(percent) = snapshot.percent() else {
        return;
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let decile = (percent / 10.0).floor() as u64;
    if *reported_decile != Some(decile) {
        *reported_decile = Some(decile);
        info!(
            percent = decile * 10,
            downloaded = snapshot.downloaded_bytes,
            "downloading"
        );
    }
}
