//! Transport decompression and charset decoding for fetched bodies.
//!
//! Neither step can fail: malformed input falls back to the raw bytes or to
//! replacement characters, and the result carries a `degraded` flag instead.

use bytes::Bytes;
use encoding_rs::Encoding;
use regex::bytes::Regex;
use std::io::Read;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coding {
    Gzip,
    Zlib,
    RawDeflate,
    Brotli,
}

/// Body after undoing `Content-Encoding`.
#[derive(Debug, Clone)]
pub struct Decompressed {
    pub bytes: Bytes,
    /// A fallback decoder was used, the stream was cut short, or the raw
    /// bytes were kept because nothing could decode them.
    pub degraded: bool,
}

/// Undo the transport encoding named by a `Content-Encoding` header.
pub fn decompress(raw: Bytes, content_encoding: Option<&str>) -> Decompressed {
    let header = content_encoding.unwrap_or("").to_ascii_lowercase();
    // Codings are listed in the order they were applied.
    let codings: Vec<&str> = header
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty() && *t != "identity")
        .collect();

    let mut bytes = raw;
    let mut degraded = false;
    for token in codings.iter().rev() {
        let step = decompress_one(&bytes, token);
        degraded |= step.degraded;
        bytes = step.bytes;
    }
    Decompressed { bytes, degraded }
}

fn decompress_one(raw: &Bytes, token: &str) -> Decompressed {
    let chain: &[Coding] = match token {
        "gzip" | "x-gzip" => &[Coding::Gzip, Coding::Zlib],
        "deflate" => &[Coding::Zlib, Coding::RawDeflate],
        "br" | "brotli" => &[Coding::Brotli, Coding::Gzip],
        other => {
            tracing::debug!(coding = other, "unknown content-encoding, keeping raw body");
            return Decompressed {
                bytes: raw.clone(),
                degraded: true,
            };
        }
    };

    // A clean decode anywhere in the chain beats a partial one.
    let mut partial = None;
    for (i, coding) in chain.iter().enumerate() {
        match inflate(*coding, raw) {
            Some((out, true)) => {
                return Decompressed {
                    bytes: Bytes::from(out),
                    degraded: i > 0,
                }
            }
            Some((out, false)) if partial.is_none() => partial = Some(out),
            _ => {}
        }
    }

    Decompressed {
        bytes: partial.map(Bytes::from).unwrap_or_else(|| raw.clone()),
        degraded: true,
    }
}

/// Run one decoder. Returns the output and whether the stream ended cleanly;
/// `None` when the decoder produced nothing at all.
fn inflate(coding: Coding, raw: &[u8]) -> Option<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    let res = match coding {
        Coding::Gzip => flate2::read::MultiGzDecoder::new(raw).read_to_end(&mut out),
        Coding::Zlib => flate2::read::ZlibDecoder::new(raw).read_to_end(&mut out),
        Coding::RawDeflate => flate2::read::DeflateDecoder::new(raw).read_to_end(&mut out),
        Coding::Brotli => brotli::Decompressor::new(raw, 4096).read_to_end(&mut out),
    };
    match res {
        Ok(_) => Some((out, true)),
        // Truncated streams (e.g. a capped body) still yield a usable prefix.
        Err(_) if !out.is_empty() => Some((out, false)),
        Err(_) => None,
    }
}

/// Text produced by [`decode_text`].
#[derive(Debug, Clone)]
pub struct DecodedText {
    pub text: String,
    pub encoding: &'static Encoding,
    /// The preferred encoding did not decode the input cleanly.
    pub degraded: bool,
}

/// Decode bytes to UTF-8.
///
/// Preference: byte-order mark, then the header charset, then an in-document
/// `<meta>` declaration, then detection. A strict decode with the preferred
/// encoding is tried first, then a strict decode with the detected one, and
/// finally a lossy decode that substitutes U+FFFD for malformed sequences.
pub fn decode_text(bytes: &[u8], header_charset: Option<&str>) -> DecodedText {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, had_errors) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        return DecodedText {
            text: text.into_owned(),
            encoding,
            degraded: had_errors,
        };
    }

    let hinted = header_charset
        .and_then(|cs| Encoding::for_label(cs.trim().as_bytes()))
        .or_else(|| meta_charset(bytes));
    let detected = detect(bytes);
    let preferred = hinted.unwrap_or(detected);

    if let Some(text) = preferred.decode_without_bom_handling_and_without_replacement(bytes) {
        return DecodedText {
            text: text.into_owned(),
            encoding: preferred,
            degraded: false,
        };
    }

    if detected != preferred {
        if let Some(text) = detected.decode_without_bom_handling_and_without_replacement(bytes) {
            return DecodedText {
                text: text.into_owned(),
                encoding: detected,
                degraded: true,
            };
        }
    }

    let (text, _) = preferred.decode_without_bom_handling(bytes);
    DecodedText {
        text: text.into_owned(),
        encoding: preferred,
        degraded: true,
    }
}

fn detect(bytes: &[u8]) -> &'static Encoding {
    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(bytes, true);
    detector.guess(None, true)
}

/// Look for `<meta charset=...>` or an `http-equiv` content type in the
/// first KiB of the document.
fn meta_charset(bytes: &[u8]) -> Option<&'static Encoding> {
    static META: OnceLock<Option<Regex>> = OnceLock::new();
    let re = META
        .get_or_init(|| {
            Regex::new(r#"(?i)<meta[^>]*?charset\s*=\s*["']?\s*([a-z0-9_\-:.]+)"#).ok()
        })
        .as_ref()?;
    let head = &bytes[..bytes.len().min(1024)];
    let label = re.captures(head)?.get(1)?.as_bytes();
    Encoding::for_label(label)
}

/// Parse charset from Content-Type header.
pub fn parse_charset(content_type: &str) -> Option<String> {
    if let Ok(mime) = content_type.parse::<mime::Mime>() {
        mime.get_param(mime::CHARSET)
            .map(|cs| cs.as_str().to_string())
    } else {
        None
    }
}
