//! Concurrency Coordinator: fans domains out to Domain Workers under a fixed
//! worker budget and folds their reports into the run log and summary.

use crate::config::WorkerSettings;
use crate::fetch::Fetcher;
use crate::runlog::RunLog;
use crate::worker::{DomainReport, DomainResult, DomainWorker};
use crawl_common::Event;
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Aggregate counts for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub total: u64,
    pub succeeded: u64,
    pub skipped_existing: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    fn add(&mut self, result: &DomainResult) {
        match result {
            DomainResult::Written { .. } => self.succeeded += 1,
            DomainResult::SkippedExisting { .. } => self.skipped_existing += 1,
            DomainResult::ErrorRecorded { .. } | DomainResult::WriteFailed { .. } => {
                self.failed += 1
            }
            DomainResult::Cancelled => self.cancelled += 1,
        }
    }

    pub fn to_event(&self) -> Event {
        Event::Summary {
            tool: "live-homepages".to_string(),
            total: self.total,
            succeeded: self.succeeded,
            skipped_existing: self.skipped_existing,
            failed: self.failed,
            cancelled: self.cancelled,
            elapsed_ms: self.elapsed.as_millis() as u64,
        }
    }
}

/// Progress bar for `len` domains; hidden when `quiet`.
pub fn progress_bar(len: u64, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Everything one invocation shares between its workers. Created per run
/// and dropped with it; nothing here outlives the run.
pub struct RunContext {
    fetcher: Arc<dyn Fetcher>,
    settings: Arc<WorkerSettings>,
    budget: Arc<Semaphore>,
    log: RunLog,
    progress: ProgressBar,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        settings: WorkerSettings,
        workers: usize,
        log: RunLog,
        progress: ProgressBar,
    ) -> Self {
        Self {
            fetcher,
            settings: Arc::new(settings),
            budget: Arc::new(Semaphore::new(workers.max(1))),
            log,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops dispatch and aborts in-flight attempts.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process every domain. Each spawned worker holds a budget permit for
    /// its whole life, so at most `workers` fetches are ever outstanding.
    pub async fn run(&self, domains: Vec<String>) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary {
            total: domains.len() as u64,
            ..Default::default()
        };

        let mut pending = domains.into_iter();
        let mut next = pending.next();
        let mut tasks = FuturesUnordered::new();

        loop {
            tokio::select! {
                biased;
                Some((domain, joined)) = tasks.next(), if !tasks.is_empty() => {
                    let report = match joined {
                        Ok(report) => report,
                        Err(e) => {
                            tracing::error!(domain = %domain, error = %e, "domain worker crashed");
                            crashed_report(domain)
                        }
                    };
                    self.record(&report, &mut summary);
                }
                _ = self.cancel.cancelled(), if next.is_some() => {
                    let undispatched = 1 + pending.len() as u64;
                    tracing::warn!(undispatched, "run interrupted; not starting remaining domains");
                    summary.cancelled += undispatched;
                    next = None;
                }
                Ok(permit) = self.budget.clone().acquire_owned(), if next.is_some() => {
                    if let Some(domain) = next.take() {
                        next = pending.next();
                        let worker = DomainWorker::new(
                            self.fetcher.clone(),
                            self.settings.clone(),
                            self.cancel.clone(),
                        );
                        let name = domain.clone();
                        let handle = tokio::spawn(async move {
                            let _permit = permit;
                            worker.run(&domain).await
                        });
                        tasks.push(async move { (name, handle.await) });
                    }
                }
                else => break,
            }
        }

        self.progress.finish_and_clear();
        summary.elapsed = started.elapsed();
        summary
    }

    fn record(&self, report: &DomainReport, summary: &mut RunSummary) {
        summary.add(&report.result);
        self.log.append(&report.to_event());
        self.progress.inc(1);
        self.progress.set_message(format!(
            "ok:{} fail:{} skip:{}",
            summary.succeeded, summary.failed, summary.skipped_existing
        ));
    }
}

fn crashed_report(domain: String) -> DomainReport {
    DomainReport {
        domain,
        result: DomainResult::WriteFailed {
            tag: "worker_panic".to_string(),
        },
        attempts: 0,
        variant: None,
        final_url: None,
        degraded: false,
        truncated: false,
        elapsed: Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchOutcome;
    use crate::testing::{html, FakeFetcher};
    use std::io::Write;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn rows(&self) -> Vec<serde_json::Value> {
            let text = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
        }
    }

    fn settings(dir: &Path) -> WorkerSettings {
        let mut s = WorkerSettings::new(dir);
        s.retry_pause = Duration::ZERO;
        s
    }

    fn context(fetcher: Arc<FakeFetcher>, dir: &Path, workers: usize, log: RunLog) -> RunContext {
        RunContext::new(fetcher, settings(dir), workers, log, ProgressBar::hidden())
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(|url| match url {
            "https://a.test/" => html(url, "<html>a page</html>"),
            u if u.contains("a.test") => FetchOutcome::fail("dns"),
            _ => FetchOutcome::fail("timeout"),
        }));
        let buf = SharedBuf::default();
        let ctx = context(fetcher.clone(), dir.path(), 4, RunLog::from_writer(buf.clone()));

        let summary = ctx.run(vec!["a.test".into(), "b.test".into()]).await;

        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.test.html")).unwrap(),
            "<html>a page</html>"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("b.test.error")).unwrap().trim(),
            "timeout"
        );
        assert!(!dir.path().join("a.test.error").exists());
        assert!(!dir.path().join("b.test.html").exists());

        let rows = buf.rows();
        assert_eq!(rows.len(), 2);
        let b = rows.iter().find(|r| r["domain"] == "b.test").unwrap();
        assert_eq!(b["outcome"], "fail");
        assert_eq!(b["attempts"], 12);
        let a = rows.iter().find(|r| r["domain"] == "a.test").unwrap();
        assert_eq!(a["outcome"], "ok");
        assert_eq!(a["variant"], "https://a.test/");

        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        // 2 attempts for a.test, 4 * 3 for b.test
        assert_eq!(fetcher.calls().len(), 14);
    }

    #[tokio::test]
    async fn test_concurrency_stays_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(
            FakeFetcher::new(|url| html(url, "<html></html>")).with_delay(Duration::from_millis(20)),
        );
        let ctx = context(fetcher.clone(), dir.path(), 3, RunLog::disabled());

        let domains: Vec<String> = (0..20).map(|i| format!("d{i}.test")).collect();
        let summary = ctx.run(domains).await;

        assert_eq!(summary.succeeded, 20);
        assert!(fetcher.max_in_flight() <= 3, "max in flight {}", fetcher.max_in_flight());
        assert!(fetcher.max_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_single_worker_is_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(
            FakeFetcher::new(|_| FetchOutcome::fail("timeout")).with_delay(Duration::from_millis(2)),
        );
        let ctx = context(fetcher.clone(), dir.path(), 1, RunLog::disabled());

        ctx.run(vec!["x.test".into(), "y.test".into()]).await;
        assert_eq!(fetcher.max_in_flight(), 1);
        assert_eq!(fetcher.calls().len(), 24);
    }

    #[tokio::test]
    async fn test_rerun_only_fills_gaps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("done.test.html"), "kept").unwrap();
        let fetcher = Arc::new(FakeFetcher::new(|url| html(url, "<html>fresh</html>")));
        let buf = SharedBuf::default();
        let ctx = context(fetcher.clone(), dir.path(), 2, RunLog::from_writer(buf.clone()));

        let summary = ctx.run(vec!["done.test".into(), "new.test".into()]).await;

        assert_eq!(summary.skipped_existing, 1);
        assert_eq!(summary.succeeded, 1);
        assert!(fetcher.calls().iter().all(|u| u.contains("new.test")));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("done.test.html")).unwrap(),
            "kept"
        );
        let rows = buf.rows();
        let done = rows.iter().find(|r| r["domain"] == "done.test").unwrap();
        assert_eq!(done["outcome"], "skip-existing");
        assert_eq!(done["attempts"], 0);
    }

    #[tokio::test]
    async fn test_broken_log_does_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(|url| html(url, "<html></html>")));
        let ctx = context(fetcher, dir.path(), 2, RunLog::open(dir.path()));

        let summary = ctx.run(vec!["a.test".into(), "b.test".into()]).await;
        assert_eq!(summary.succeeded, 2);
        assert!(dir.path().join("a.test.html").exists());
        assert!(dir.path().join("b.test.html").exists());
    }

    #[tokio::test]
    async fn test_cancellation_keeps_completed_work() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(|url| {
            if url.contains("fast") {
                html(url, "<html>fast</html>")
            } else {
                FetchOutcome::fail("timeout")
            }
        }));
        // Slow domains spend their time in the retry pause.
        let mut s = settings(dir.path());
        s.retry_pause = Duration::from_secs(30);
        let ctx = RunContext::new(fetcher, s, 2, RunLog::disabled(), ProgressBar::hidden());
        let token = ctx.cancel_token();

        let domains: Vec<String> = std::iter::once("fast.test".to_string())
            .chain((0..5).map(|i| format!("slow{i}.test")))
            .collect();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let summary = tokio::time::timeout(Duration::from_secs(5), ctx.run(domains))
            .await
            .expect("run did not stop after cancellation");

        assert_eq!(summary.total, 6);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.succeeded + summary.cancelled, 6);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("fast.test.html")).unwrap(),
            "<html>fast</html>"
        );
        let errors = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".error")
            })
            .count();
        assert_eq!(errors, 0);
    }

    #[test]
    fn test_summary_event() {
        let summary = RunSummary {
            total: 3,
            succeeded: 1,
            skipped_existing: 1,
            failed: 1,
            cancelled: 0,
            elapsed: Duration::from_secs(2),
        };
        match summary.to_event() {
            Event::Summary {
                tool,
                total,
                elapsed_ms,
                ..
            } => {
                assert_eq!(tool, "live-homepages");
                assert_eq!(total, 3);
                assert_eq!(elapsed_ms, 2000);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
