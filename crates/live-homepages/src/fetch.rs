//! HTTP fetching: one GET per call, classified as success, skip or failure.

use crate::decode;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use crawl_common::{is_probably_binary, text_byte_ratio};
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONTENT_ENCODING,
    CONTENT_TYPE, USER_AGENT,
};
use reqwest::Client;
use std::error::Error as _;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:126.0) Gecko/20100101 Firefox/126.0",
];

const SNIFF_LEN: usize = 4096;
const MIN_TEXT_RATIO: f64 = 0.6;
const HTML_MARKERS: [&[u8]; 6] = [
    b"<!doctype", b"<html", b"<head", b"<title", b"<meta", b"<body",
];

/// Classified result of one attempt against one URL.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success {
        /// Body with any transport compression removed.
        body: Bytes,
        final_url: String,
        content_type: String,
        /// Decompression needed a fallback or kept a partial stream.
        degraded: bool,
        /// The body hit the size cap and was cut short.
        truncated: bool,
    },
    Skip {
        reason: String,
    },
    Fail {
        tag: String,
    },
}

impl FetchOutcome {
    pub fn fail(tag: impl Into<String>) -> Self {
        FetchOutcome::Fail { tag: tag.into() }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        FetchOutcome::Skip {
            reason: reason.into(),
        }
    }
}

/// Performs exactly one request per call and never retries internally.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> FetchOutcome;
}

pub struct FetchOptions {
    pub max_bytes: usize,
    pub ipv4: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024, // 10MB
            ipv4: false,
        }
    }
}

/// [`Fetcher`] backed by a shared reqwest client.
pub struct HttpFetcher {
    client: Client,
    max_bytes: usize,
    next_agent: AtomicUsize,
}

impl HttpFetcher {
    pub fn new(opts: &FetchOptions) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en;q=0.9"));

        // Decompression is done by `decode::decompress` so a broken stream
        // can fall back to the raw body instead of failing the read.
        let mut builder = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .default_headers(headers)
            .no_gzip()
            .no_brotli()
            .no_deflate();
        if opts.ipv4 {
            builder = builder.local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }

        Ok(Self {
            client: builder.build()?,
            max_bytes: opts.max_bytes,
            next_agent: AtomicUsize::new(0),
        })
    }

    fn user_agent(&self) -> &'static str {
        let i = self.next_agent.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[i % USER_AGENTS.len()]
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> FetchOutcome {
        let resp = match self
            .client
            .get(url)
            .header(USER_AGENT, self.user_agent())
            .timeout(timeout)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return FetchOutcome::fail(classify_error(&e)),
        };

        let status = resp.status();
        if !status.is_success() {
            return FetchOutcome::fail(format!("http_{}", status.as_u16()));
        }

        let final_url = resp.url().to_string();
        let content_type = header_str(resp.headers(), CONTENT_TYPE).unwrap_or_default();
        let content_encoding = header_str(resp.headers(), CONTENT_ENCODING);

        let (raw, truncated) = match read_capped(resp, self.max_bytes).await {
            Ok(read) => read,
            Err(e) => return FetchOutcome::fail(classify_error(&e)),
        };
        let body = decode::decompress(raw, content_encoding.as_deref());

        if !looks_like_html(&content_type, &body.bytes) {
            return FetchOutcome::skip("not_html");
        }

        FetchOutcome::Success {
            body: body.bytes,
            final_url,
            content_type,
            degraded: body.degraded,
            truncated,
        }
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Read the body, keeping at most `max_bytes`. The flag is set when bytes
/// past the cap were dropped.
async fn read_capped(
    mut resp: reqwest::Response,
    max_bytes: usize,
) -> reqwest::Result<(Bytes, bool)> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = resp.chunk().await? {
        let room = max_bytes - buf.len();
        if chunk.len() > room {
            buf.extend_from_slice(&chunk[..room]);
            tracing::debug!(url = %resp.url(), max_bytes, "body truncated");
            return Ok((buf.freeze(), true));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok((buf.freeze(), false))
}

/// Short failure tag for a transport error.
fn classify_error(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        return "timeout";
    }
    if err.is_redirect() {
        return "redirect";
    }
    if err.is_builder() {
        return "invalid_url";
    }
    if err.is_body() || err.is_decode() {
        return "body";
    }

    // The top-level message embeds the URL, so only the sources are inspected.
    let mut chain = String::new();
    let mut source = err.source();
    while let Some(e) = source {
        chain.push_str(": ");
        chain.push_str(&e.to_string());
        source = e.source();
    }
    tag_from_chain(err.is_connect(), &chain.to_lowercase())
}

fn tag_from_chain(connect: bool, chain: &str) -> &'static str {
    const DNS: [&str; 5] = [
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "no such host",
        "nodename nor servname",
    ];
    const TLS: [&str; 5] = ["certificate", "tls", "ssl", "handshake", "invalid peer"];

    if DNS.iter().any(|m| chain.contains(m)) {
        "dns"
    } else if TLS.iter().any(|m| chain.contains(m)) {
        "tls"
    } else if connect || chain.contains("connection") {
        "connection"
    } else {
        "request"
    }
}

/// Decide whether a (decompressed) body is worth keeping as a homepage.
///
/// Empty bodies, bodies with a NUL in the first KiB, and bodies whose first
/// 4 KiB are mostly control bytes are rejected. Otherwise an HTML content
/// type is enough; without one the body must start with `<` and mention a
/// document-level tag near the top.
pub fn looks_like_html(content_type: &str, body: &[u8]) -> bool {
    if body.is_empty() || is_probably_binary(body) {
        return false;
    }
    let sample = &body[..body.len().min(SNIFF_LEN)];
    if text_byte_ratio(sample) < MIN_TEXT_RATIO {
        return false;
    }
    if content_type.to_ascii_lowercase().contains("html") {
        return true;
    }

    let sample = sample.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(sample);
    match sample.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(&b'<') => {}
        _ => return false,
    }
    let lower = sample.to_ascii_lowercase();
    HTML_MARKERS
        .iter()
        .any(|marker| lower.windows(marker.len()).any(|w| w == *marker))
}
