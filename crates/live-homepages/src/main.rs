mod config;
mod coordinator;
mod decode;
mod fetch;
mod runlog;
#[cfg(test)]
mod testing;
mod variants;
mod worker;

use anyhow::Result;
use clap::Parser;
use config::{read_domains, CrawlConfig, Opt};
use coordinator::{progress_bar, RunContext};
use crawl_common::{sanitize_filename, write_ndjson, Event};
use fetch::{FetchOptions, HttpFetcher};
use runlog::RunLog;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::parse();
    if let Err(e) = run(&opt).await {
        tracing::error!(error = %format!("{:#}", e), "run aborted");
        write_ndjson(&Event::Error {
            code: "E_RUN".to_string(),
            message: format!("{:#}", e),
            path_or_url: Some(opt.domains_file.display().to_string()),
        })?;
        return Err(e);
    }
    Ok(())
}

async fn run(opt: &Opt) -> Result<()> {
    // Everything that can fail the whole run happens before dispatch.
    let config = CrawlConfig::from_opt(opt)?;
    let domains = read_domains(&config.domains_file, config.limit)?;
    let handled = worker::handled_stems(&config.worker.out_dir)?;
    let pending = domains
        .iter()
        .filter(|d| !handled.contains(&sanitize_filename(d)))
        .count();
    tracing::info!(
        total = domains.len(),
        already_handled = handled.len(),
        pending,
        "domain list loaded"
    );

    let fetcher = HttpFetcher::new(&FetchOptions {
        max_bytes: config.max_bytes,
        ipv4: config.ipv4,
    })?;
    let log = match &config.log {
        Some(path) => RunLog::open(path),
        None => RunLog::disabled(),
    };
    let ctx = RunContext::new(
        Arc::new(fetcher),
        config.worker.clone(),
        config.workers,
        log,
        progress_bar(domains.len() as u64, config.quiet),
    );

    let cancel = ctx.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after in-flight writes");
            cancel.cancel();
        }
    });

    let summary = ctx.run(domains).await;
    tracing::info!(
        succeeded = summary.succeeded,
        skipped_existing = summary.skipped_existing,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "done"
    );
    write_ndjson(&summary.to_event())?;

    Ok(())
}
