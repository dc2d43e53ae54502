use anyhow::Result;
use serde::Serialize;
use std::io::Write;

/// NDJSON event skeleton shared across tools.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum Event {
    /// One row of the run log: the terminal outcome of one domain.
    #[serde(rename = "result")]
    Result {
        domain: String,
        outcome: String,
        elapsed_ms: u64,
        attempts: u32,
        variant: Option<String>,
        final_url: Option<String>,
        tag: Option<String>,
    },
    /// A failure that stops the tool before or outside the per-domain rows.
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        path_or_url: Option<String>,
    },
    #[serde(rename = "summary")]
    Summary {
        tool: String,
        total: u64,
        succeeded: u64,
        skipped_existing: u64,
        failed: u64,
        cancelled: u64,
        elapsed_ms: u64,
    },
}

/// Write a single JSON object as a line (NDJSON). Flushes immediately.
pub fn write_ndjson<T: Serialize>(value: &T) -> Result<()> {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    write_ndjson_to(&mut lock, value)
}

/// Same as [`write_ndjson`] for an arbitrary sink. The line is serialized
/// up front and written with one call, so a failed serialization never
/// leaves a partial line behind.
pub fn write_ndjson_to<W: Write, T: Serialize>(w: &mut W, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    w.write_all(&line)?;
    w.flush()?;
    Ok(())
}

/// Map a domain to a filesystem-safe file stem.
///
/// Every char outside `[A-Za-z0-9.-]` becomes `_`, one for one, so the
/// result has the same char count as the input and the mapping is stable
/// across runs.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Heuristic binary detector (small sample, NUL byte check).
pub fn is_probably_binary(buf: &[u8]) -> bool {
    const N: usize = 1024;
    buf.iter().take(buf.len().min(N)).any(|&b| b == 0)
}

/// Fraction of bytes in `sample` that can appear in text: anything except
/// ASCII control characters other than tab, newline, form feed and carriage
/// return. Bytes >= 0x80 count as text so multi-byte charsets are not
/// penalised.
pub fn text_byte_ratio(sample: &[u8]) -> f64 {
    if sample.is_empty() {
        return 0.0;
    }
    let text = sample
        .iter()
        .filter(|&&b| (b >= 32 && b != 127) || matches!(b, b'\t' | b'\n' | b'\x0c' | b'\r'))
        .count();
    text as f64 / sample.len() as f64
}
