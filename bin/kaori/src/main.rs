mod args;

use std::time::Instant;

use anyhow::bail;
use args::KaoriArgs;
use clap::Parser;
use kaori::{
    util::{format_duration, format_size},
    HttpClient, M3u8PlaylistResolver, TaskOrchestrator,
};
use tokio_util::sync::CancellationToken;

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .try_from_env()
                .unwrap_or_else(|_| level.to_string().to_lowercase().into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// First Ctrl-C cancels every task, the second one exits at once.
fn handle_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("Interrupted, stopping all tasks. Press Ctrl-C again to force exit.");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = KaoriArgs::parse();
    init_tracing(args.verbose);

    let config = args.config()?;
    let requests = args.requests(&config)?;

    let client = HttpClient::from_config(&config)?;
    let cookies = args.cookies();
    if !cookies.is_empty() {
        for request in &requests {
            client.add_cookies(cookies.clone(), request.url.as_str())?;
        }
    }

    let cancel = CancellationToken::new();
    let resolver = M3u8PlaylistResolver::new(client.clone())
        .with_retry(config.retry_policy()?)
        .with_cancellation(cancel.clone());
    let max_concurrent = config.max_concurrent_tasks.get();
    let orchestrator =
        TaskOrchestrator::with_resolver(config, client, resolver)?.with_cancellation(cancel.clone());
    handle_interrupt(cancel);

    let started_at = Instant::now();
    let results = orchestrator.run_batch(requests, max_concurrent).await;
    let elapsed = started_at.elapsed();

    let mut names: Vec<_> = results.keys().collect();
    names.sort();
    for name in names {
        let result = &results[name];
        match (&result.output_path, &result.error) {
            (Some(output), _) => {
                let size = tokio::fs::metadata(output)
                    .await
                    .map(|m| format_size(m.len()))
                    .unwrap_or_else(|_| "unknown size".to_string());
                tracing::info!("[{name}] {} ({size})", output.display());
            }
            (None, Some(failure)) => tracing::error!("[{name}] {failure}"),
            (None, None) => tracing::error!("[{name}] failed"),
        }
    }

    let summary = orchestrator.progress().summary();
    tracing::info!(
        "{} task(s) in {}: {} completed, {} failed.",
        summary.total,
        format_duration(elapsed),
        summary.completed,
        summary.failed
    );

    if summary.failed > 0 || results.values().any(|r| !r.success) {
        bail!("{} task(s) failed.", results.values().filter(|r| !r.success).count());
    }
    Ok(())
}
