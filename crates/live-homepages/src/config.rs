//! Command-line options, validated run configuration, and domain list loading.

use anyhow::{Context, Result};
use clap::Parser;
use crawl_common::sanitize_filename;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "live-homepages",
    about = "Download decoded homepage HTML for a list of domains"
)]
pub struct Opt {
    /// Domain list, one hostname per line ('#' starts a comment line)
    pub domains_file: PathBuf,
    /// Output directory for <domain>.html / <domain>.error files
    pub out_dir: PathBuf,
    /// Maximum number of domains processed concurrently
    #[arg(long, default_value_t = 32)]
    pub workers: usize,
    /// Per-request timeout (e.g., 5, 5s, 500ms)
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// Full passes over the URL variants before a domain is given up
    #[arg(long, default_value_t = 3)]
    pub retries: u32,
    /// Pause between passes (e.g., 1s, 250ms)
    #[arg(long, default_value = "1s")]
    pub retry_pause: String,
    /// Append one NDJSON row per finished domain to this file
    #[arg(long)]
    pub log: Option<PathBuf>,
    /// Only process the first N domains of the list
    #[arg(long)]
    pub limit: Option<usize>,
    /// Max bytes to read per response (e.g., 10MB)
    #[arg(long, default_value = "10MB")]
    pub max_bytes: String,
    /// Hard deadline for all attempts of one domain (e.g., 60s)
    #[arg(long)]
    pub max_domain_time: Option<String>,
    /// Only connect over IPv4
    #[arg(long, default_value_t = false)]
    pub ipv4: bool,
    /// Hide the progress bar
    #[arg(long, default_value_t = false)]
    pub quiet: bool,
}

/// Settings every Domain Worker needs.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub out_dir: PathBuf,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_pause: Duration,
    pub max_domain_time: Option<Duration>,
}

#[cfg(test)]
impl WorkerSettings {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            timeout: Duration::from_secs(5),
            retries: 3,
            retry_pause: Duration::from_secs(1),
            max_domain_time: None,
        }
    }
}

/// Fully validated configuration for one run.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub domains_file: PathBuf,
    pub workers: usize,
    pub max_bytes: usize,
    pub log: Option<PathBuf>,
    pub limit: Option<usize>,
    pub ipv4: bool,
    pub quiet: bool,
    pub worker: WorkerSettings,
}

impl CrawlConfig {
    /// Validate options and prepare the output directory. Nothing here
    /// touches the network.
    pub fn from_opt(opt: &Opt) -> Result<Self> {
        if opt.workers == 0 {
            anyhow::bail!("--workers must be at least 1");
        }
        if opt.retries == 0 {
            anyhow::bail!("--retries must be at least 1");
        }
        let timeout = parse_duration(&opt.timeout).context("invalid --timeout")?;
        if timeout.is_zero() {
            anyhow::bail!("--timeout must be greater than zero");
        }
        let retry_pause = parse_duration(&opt.retry_pause).context("invalid --retry-pause")?;
        let max_bytes = parse_size(&opt.max_bytes).context("invalid --max-bytes")?;
        let max_domain_time = opt
            .max_domain_time
            .as_deref()
            .map(parse_duration)
            .transpose()
            .context("invalid --max-domain-time")?;

        if !opt.domains_file.is_file() {
            anyhow::bail!("domain list not found: {}", opt.domains_file.display());
        }
        prepare_out_dir(&opt.out_dir)?;

        Ok(Self {
            domains_file: opt.domains_file.clone(),
            workers: opt.workers,
            max_bytes,
            log: opt.log.clone(),
            limit: opt.limit,
            ipv4: opt.ipv4,
            quiet: opt.quiet,
            worker: WorkerSettings {
                out_dir: opt.out_dir.clone(),
                timeout,
                retries: opt.retries,
                retry_pause,
                max_domain_time,
            },
        })
    }
}

/// Create the output directory if needed and check that we can write to it.
fn prepare_out_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create output directory {}", dir.display()))?;
    let probe = dir.join(format!(".live-homepages-probe-{}", std::process::id()));
    std::fs::write(&probe, b"")
        .with_context(|| format!("output directory {} is not writable", dir.display()))?;
    std::fs::remove_file(&probe).ok();
    Ok(())
}

/// Parse a domain list: trimmed, lowercased, blank and `#` lines dropped.
/// Domains whose sanitized names collide are kept only once so that every
/// output file has a single owner.
pub fn parse_domains(text: &str, limit: Option<usize>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut domains = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let domain = line.to_lowercase();
        if seen.insert(sanitize_filename(&domain)) {
            domains.push(domain);
        }
    }
    if let Some(n) = limit {
        domains.truncate(n);
    }
    domains
}

pub fn read_domains(path: &Path, limit: Option<usize>) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read domain list {}", path.display()))?;
    Ok(parse_domains(&text, limit))
}

/// Parse a human-readable size string (e.g., "10MB", "1GB").
pub fn parse_size(s: &str) -> Result<usize> {
    let s = s.trim().to_uppercase();
    let (num_part, unit) = if let Some(pos) = s.find(|c: char| c.is_alphabetic()) {
        (&s[..pos], &s[pos..])
    } else {
        (s.as_str(), "")
    };

    let num: usize = num_part.trim().parse()?;
    let multiplier: usize = match unit {
        "B" | "" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        _ => anyhow::bail!("Unknown size unit: {}", unit),
    };

    num.checked_mul(multiplier)
        .with_context(|| format!("size too large: {}", s))
}

/// Parse a human-readable duration string (e.g., "15s", "1m", "250ms").
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    let (num_part, unit) = if let Some(pos) = s.find(|c: char| c.is_alphabetic()) {
        (&s[..pos], &s[pos..])
    } else {
        (s.as_str(), "s")
    };

    let num: u64 = num_part.trim().parse()?;
    let secs_per_unit: u64 = match unit {
        "ms" => return Ok(Duration::from_millis(num)),
        "s" | "sec" => 1,
        "m" | "min" => 60,
        "h" | "hour" => 3600,
        _ => anyhow::bail!("Unknown duration unit: {}", unit),
    };

    let secs = num
        .checked_mul(secs_per_unit)
        .with_context(|| format!("duration too large: {}", s))?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(domains_file: PathBuf, out_dir: PathBuf) -> Opt {
        Opt::parse_from([
            "live-homepages".into(),
            domains_file.into_os_string(),
            out_dir.into_os_string(),
        ])
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1KB").unwrap(), 1024);
        assert_eq!(parse_size("10MB").unwrap(), 10 * 1024 * 1024);
        assert!(parse_size("3TB").is_err());
        assert!(parse_size("99999999999GB").is_err());
        assert!(parse_size("18446744073709551615KB").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("99999999999999999h").is_err());
        assert!(parse_duration("18446744073709551615m").is_err());
    }

    #[test]
    fn test_parse_domains_filters_and_lowercases() {
        let text = "# top sites\nExample.COM\n\n  foo.org  \n#bar.net\nexample.com\n";
        assert_eq!(parse_domains(text, None), vec!["example.com", "foo.org"]);
    }

    #[test]
    fn test_parse_domains_drops_sanitized_collisions() {
        let text = "a+b.test\na_b.test\nc.test\n";
        assert_eq!(parse_domains(text, None), vec!["a+b.test", "c.test"]);
    }

    #[test]
    fn test_parse_domains_limit_applies_after_filtering() {
        let text = "# c\na.test\nb.test\nc.test\n";
        assert_eq!(parse_domains(text, Some(2)), vec!["a.test", "b.test"]);
    }

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("domains.txt");
        std::fs::write(&list, "example.com\n").unwrap();
        let cfg = CrawlConfig::from_opt(&opt(list, dir.path().join("out"))).unwrap();
        assert_eq!(cfg.workers, 32);
        assert_eq!(cfg.worker.timeout, Duration::from_secs(5));
        assert_eq!(cfg.worker.retries, 3);
        assert_eq!(cfg.max_bytes, 10 * 1024 * 1024);
        assert!(cfg.worker.out_dir.is_dir());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("domains.txt");
        std::fs::write(&list, "example.com\n").unwrap();
        let mut o = opt(list, dir.path().join("out"));
        o.workers = 0;
        assert!(CrawlConfig::from_opt(&o).is_err());
    }

    #[test]
    fn test_rejects_missing_domain_list() {
        let dir = tempfile::tempdir().unwrap();
        let o = opt(dir.path().join("nope.txt"), dir.path().join("out"));
        let err = CrawlConfig::from_opt(&o).unwrap_err();
        assert!(format!("{err:#}").contains("domain list not found"));
    }

    #[test]
    fn test_rejects_out_dir_that_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("domains.txt");
        std::fs::write(&list, "example.com\n").unwrap();
        let o = opt(list.clone(), list);
        assert!(CrawlConfig::from_opt(&o).is_err());
    }
}
