//! Domain Worker: resume check, sequential variant passes, and the single
//! output artifact per domain.

use crate::config::WorkerSettings;
use crate::decode;
use crate::fetch::{FetchOutcome, Fetcher};
use crate::variants::url_variants;
use crawl_common::{sanitize_filename, Event};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const NO_VARIANT_SUCCEEDED: &str = "no_variant_succeeded";
pub const DOMAIN_TIMEOUT: &str = "domain_timeout";
pub const IO_ERROR: &str = "io_error";
pub const TRUNCATED: &str = "truncated";
pub const DEGRADED_DECODE: &str = "degraded_decode";

const VARIANTS_PER_PASS: u32 = 4;

/// Output paths owned by one domain.
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub html: PathBuf,
    pub error: PathBuf,
}

impl Artifacts {
    pub fn new(out_dir: &Path, domain: &str) -> Self {
        let stem = sanitize_filename(domain);
        Self {
            html: out_dir.join(format!("{stem}.html")),
            error: out_dir.join(format!("{stem}.error")),
        }
    }

    /// The artifact a previous run left behind, if any.
    async fn existing(&self) -> Option<PathBuf> {
        for path in [&self.html, &self.error] {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Some(path.clone());
            }
        }
        None
    }
}

/// Sanitized names that already have an `.html` or `.error` file.
pub fn handled_stems(out_dir: &Path) -> std::io::Result<HashSet<String>> {
    let mut done = HashSet::new();
    for entry in std::fs::read_dir(out_dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name
            .strip_suffix(".html")
            .or_else(|| name.strip_suffix(".error"))
        {
            done.insert(stem.to_string());
        }
    }
    Ok(done)
}

/// Terminal outcome for one domain.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainResult {
    Written { path: PathBuf, bytes: usize },
    ErrorRecorded { path: PathBuf, tag: String },
    /// An artifact from an earlier run exists; nothing was fetched.
    SkippedExisting { path: PathBuf },
    /// The artifact itself could not be written.
    WriteFailed { tag: String },
    /// Interrupted before reaching a terminal state; no artifact written.
    Cancelled,
}

impl DomainResult {
    pub fn outcome(&self) -> &'static str {
        match self {
            DomainResult::Written { .. } => "ok",
            DomainResult::SkippedExisting { .. } => "skip-existing",
            DomainResult::ErrorRecorded { .. } | DomainResult::WriteFailed { .. } => "fail",
            DomainResult::Cancelled => "cancelled",
        }
    }
}

/// What the coordinator learns about one finished domain.
#[derive(Debug, Clone)]
pub struct DomainReport {
    pub domain: String,
    pub result: DomainResult,
    pub attempts: u32,
    /// Variant URL that produced the page.
    pub variant: Option<String>,
    pub final_url: Option<String>,
    /// Decompression or charset decoding needed a fallback.
    pub degraded: bool,
    /// The saved page was cut at the body size cap.
    pub truncated: bool,
    pub elapsed: Duration,
}

impl DomainReport {
    pub fn to_event(&self) -> Event {
        let tag = match &self.result {
            DomainResult::ErrorRecorded { tag, .. } | DomainResult::WriteFailed { tag } => {
                Some(tag.clone())
            }
            DomainResult::Written { .. } if self.truncated => Some(TRUNCATED.to_string()),
            DomainResult::Written { .. } if self.degraded => Some(DEGRADED_DECODE.to_string()),
            _ => None,
        };
        Event::Result {
            domain: self.domain.clone(),
            outcome: self.result.outcome().to_string(),
            elapsed_ms: self.elapsed.as_millis() as u64,
            attempts: self.attempts,
            variant: self.variant.clone(),
            final_url: self.final_url.clone(),
            tag,
        }
    }
}

enum State {
    CheckingExisting,
    Fetching { pass: u32 },
    Retry { pass: u32 },
    Exhausted,
    Done(DomainResult),
}

#[derive(Default)]
struct Progress {
    attempts: u32,
    last_fail: Option<String>,
    variant: Option<String>,
    final_url: Option<String>,
    degraded: bool,
    truncated: bool,
}

#[derive(Clone)]
pub struct DomainWorker {
    fetcher: Arc<dyn Fetcher>,
    settings: Arc<WorkerSettings>,
    cancel: CancellationToken,
}

impl DomainWorker {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        settings: Arc<WorkerSettings>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            settings,
            cancel,
        }
    }

    pub async fn run(&self, domain: &str) -> DomainReport {
        let started = Instant::now();
        let artifacts = Artifacts::new(&self.settings.out_dir, domain);
        let mut progress = Progress::default();
        let deadline = self.settings.max_domain_time.map(|limit| started + limit);

        let result = self
            .drive(domain, &artifacts, deadline, &mut progress)
            .await;

        match &result {
            DomainResult::Written { path, bytes } => tracing::debug!(
                domain,
                path = %path.display(),
                bytes,
                attempts = progress.attempts,
                "homepage saved"
            ),
            DomainResult::ErrorRecorded { path, tag } => tracing::debug!(
                domain,
                path = %path.display(),
                tag = %tag,
                attempts = progress.attempts,
                "domain failed"
            ),
            DomainResult::WriteFailed { tag } => {
                tracing::warn!(domain, tag = %tag, "domain failed without an artifact")
            }
            DomainResult::SkippedExisting { path } => {
                tracing::debug!(domain, path = %path.display(), "already handled")
            }
            DomainResult::Cancelled => tracing::debug!(domain, "cancelled"),
        }

        DomainReport {
            domain: domain.to_string(),
            result,
            attempts: progress.attempts,
            variant: progress.variant,
            final_url: progress.final_url,
            degraded: progress.degraded,
            truncated: progress.truncated,
            elapsed: started.elapsed(),
        }
    }

    /// The deadline only interrupts fetching and retry pauses. Artifact writes
    /// always run to completion so a domain never ends with two files.
    async fn drive(
        &self,
        domain: &str,
        artifacts: &Artifacts,
        deadline: Option<Instant>,
        p: &mut Progress,
    ) -> DomainResult {
        let variants = url_variants(domain);
        let max_attempts = VARIANTS_PER_PASS * self.settings.retries;
        let mut state = State::CheckingExisting;

        loop {
            state = match state {
                State::CheckingExisting => match artifacts.existing().await {
                    Some(path) => State::Done(DomainResult::SkippedExisting { path }),
                    None => State::Fetching { pass: 1 },
                },

                State::Fetching { pass } => {
                    for url in &variants {
                        debug_assert!(p.attempts < max_attempts, "attempt budget exceeded");
                        p.attempts += 1;

                        let outcome = tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return DomainResult::Cancelled,
                            _ = until(deadline) => return self.deadline_hit(domain, artifacts).await,
                            outcome = self.fetcher.fetch(url, self.settings.timeout) => outcome,
                        };

                        match outcome {
                            FetchOutcome::Success {
                                body,
                                final_url,
                                content_type,
                                degraded,
                                truncated,
                            } => {
                                p.variant = Some(url.clone());
                                p.final_url = Some(final_url);
                                let charset = decode::parse_charset(&content_type);
                                let text = decode::decode_text(&body, charset.as_deref());
                                tracing::trace!(
                                    url = %url,
                                    encoding = text.encoding.name(),
                                    degraded = text.degraded,
                                    "body decoded"
                                );
                                p.degraded = degraded || text.degraded;
                                p.truncated = truncated;
                                return self.write_html(artifacts, &text.text).await;
                            }
                            FetchOutcome::Skip { reason } => {
                                tracing::trace!(url = %url, reason = %reason, "variant skipped");
                            }
                            FetchOutcome::Fail { tag } => {
                                tracing::trace!(url = %url, tag = %tag, "variant failed");
                                p.last_fail = Some(tag);
                            }
                        }
                    }
                    // Skips and failures alike lead to another pass while the
                    // budget lasts.
                    if pass < self.settings.retries {
                        State::Retry { pass }
                    } else {
                        State::Exhausted
                    }
                }

                State::Retry { pass } => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return DomainResult::Cancelled,
                        _ = until(deadline) => return self.deadline_hit(domain, artifacts).await,
                        _ = tokio::time::sleep(self.settings.retry_pause) => {}
                    }
                    State::Fetching { pass: pass + 1 }
                }

                State::Exhausted => {
                    let tag = p
                        .last_fail
                        .clone()
                        .unwrap_or_else(|| NO_VARIANT_SUCCEEDED.to_string());
                    State::Done(self.record_error(artifacts, &tag).await)
                }

                State::Done(result) => return result,
            };
        }
    }

    async fn deadline_hit(&self, domain: &str, artifacts: &Artifacts) -> DomainResult {
        tracing::debug!(domain, "domain deadline reached");
        self.record_error(artifacts, DOMAIN_TIMEOUT).await
    }

    /// Write via a `.part` file and rename so an interrupted run never
    /// leaves a truncated `.html` that would be taken as complete.
    async fn write_html(&self, artifacts: &Artifacts, text: &str) -> DomainResult {
        let mut part = artifacts.html.clone().into_os_string();
        part.push(".part");
        let part = PathBuf::from(part);

        let written = async {
            tokio::fs::write(&part, text.as_bytes()).await?;
            tokio::fs::rename(&part, &artifacts.html).await
        }
        .await;

        match written {
            Ok(()) => DomainResult::Written {
                path: artifacts.html.clone(),
                bytes: text.len(),
            },
            Err(e) => {
                tracing::warn!(path = %artifacts.html.display(), error = %e, "cannot write homepage");
                tokio::fs::remove_file(&part).await.ok();
                self.record_error(artifacts, IO_ERROR).await
            }
        }
    }

    async fn record_error(&self, artifacts: &Artifacts, tag: &str) -> DomainResult {
        match tokio::fs::write(&artifacts.error, format!("{tag}\n")).await {
            Ok(()) => DomainResult::ErrorRecorded {
                path: artifacts.error.clone(),
                tag: tag.to_string(),
            },
            Err(e) => {
                tracing::warn!(path = %artifacts.error.display(), error = %e, "cannot write error file");
                DomainResult::WriteFailed {
                    tag: tag.to_string(),
                }
            }
        }
    }
}

/// Resolves at `deadline`, or never when there is none.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
