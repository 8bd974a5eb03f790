//! Byte decoding for listing pages whose charset metadata cannot be trusted.
//!
//! Candidates come from the HTTP header, the document's own `<meta>`
//! declaration, a statistical guess and a fixed fallback list. Each is tried as
//! a strict decode and scored by how much of the result is Japanese script.

use chardetng::EncodingDetector;
use encoding_rs::Encoding;
use regex::bytes::Regex as BytesRegex;
use serde::Serialize;
use std::sync::LazyLock;

/// Tried after every signalled charset, in this order.
pub const FALLBACK_ENCODINGS: &[&str] = &["utf-8", "shift_jis", "euc-jp", "iso-2022-jp"];

/// How far into the document a `<meta charset>` declaration is looked for.
const DECLARED_CHARSET_SNIFF_BYTES: usize = 4096;

/// Upper bound of the replacement-character penalty.
const MAX_REPLACEMENT_PENALTY: f64 = 0.5;

static META_CHARSET_RE: LazyLock<BytesRegex> = LazyLock::new(|| {
    BytesRegex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?\s*([A-Za-z0-9_:.\-]+)"#)
        .expect("meta charset pattern")
});

/// Out-of-band signals about a response body.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeHints<'a> {
    /// `charset` parameter of the `Content-Type` header.
    pub header_charset: Option<&'a str>,
    /// Top-level domain of the origin, e.g. `"jp"`; sharpens the statistical guess.
    pub tld: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Header,
    Document,
    Detector,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateScore {
    pub encoding: String,
    pub source: CandidateSource,
    /// `None` when the strict decode failed.
    pub score: Option<f64>,
}

/// Result of decoding one response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedPage {
    pub text: String,
    pub encoding: String,
    pub score: f64,
    /// False when no candidate decoded cleanly and lossy substitution was used.
    pub confident: bool,
    pub candidates: Vec<CandidateScore>,
}

/// Extracts the `charset` parameter from a `Content-Type` header value.
pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|part| {
            let (key, value) = part.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| value.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        })
        .filter(|charset| !charset.is_empty())
}

/// Charset named by a `<meta>` tag near the top of the raw document.
pub fn declared_charset(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(DECLARED_CHARSET_SNIFF_BYTES)];
    let caps = META_CHARSET_RE.captures(head)?;
    std::str::from_utf8(&caps[1]).ok().map(str::to_string)
}

/// Fraction of characters in Hiragana, Katakana or CJK ideograph ranges,
/// minus a penalty for replacement characters.
pub fn japanese_density(text: &str) -> f64 {
    let mut total = 0usize;
    let mut japanese = 0usize;
    let mut replacements = 0usize;

    for c in text.chars() {
        total += 1;
        match c as u32 {
            0x3040..=0x309F | 0x30A0..=0x30FF | 0x31F0..=0x31FF | 0x4E00..=0x9FFF => {
                japanese += 1
            }
            0xFFFD => replacements += 1,
            _ => {}
        }
    }

    if total == 0 {
        return 0.0;
    }
    let ratio = japanese as f64 / total as f64;
    let penalty = (replacements as f64 / total as f64).min(MAX_REPLACEMENT_PENALTY);
    (ratio - penalty).max(0.0)
}

fn candidate_list(
    bytes: &[u8],
    hints: &DecodeHints<'_>,
) -> Vec<(&'static Encoding, CandidateSource)> {
    let mut candidates: Vec<(&'static Encoding, CandidateSource)> = Vec::new();
    let mut push = |encoding: Option<&'static Encoding>, source: CandidateSource| {
        if let Some(encoding) = encoding {
            if !candidates.iter().any(|(seen, _)| *seen == encoding) {
                candidates.push((encoding, source));
            }
        }
    };

    push(
        hints
            .header_charset
            .and_then(|label| Encoding::for_label(label.trim().as_bytes())),
        CandidateSource::Header,
    );

    // A document cannot meaningfully declare itself UTF-16; follow the HTML
    // prescan rule and read such declarations as UTF-8.
    push(
        declared_charset(bytes)
            .and_then(|label| Encoding::for_label(label.as_bytes()))
            .map(Encoding::output_encoding),
        CandidateSource::Document,
    );

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    push(
        Some(detector.guess(hints.tld.map(str::as_bytes), true)),
        CandidateSource::Detector,
    );

    for label in FALLBACK_ENCODINGS {
        push(Encoding::for_label(label.as_bytes()), CandidateSource::Fallback);
    }

    candidates
}

/// Decodes `bytes` with the best-scoring candidate encoding. Never fails.
pub fn decode_bytes(bytes: &[u8], hints: &DecodeHints<'_>) -> DecodedPage {
    let candidates = candidate_list(bytes, hints);
    decode_with_candidates(bytes, &candidates)
}

pub(crate) fn decode_with_candidates(
    bytes: &[u8],
    candidates: &[(&'static Encoding, CandidateSource)],
) -> DecodedPage {
    let mut scores = Vec::with_capacity(candidates.len());
    let mut best: Option<(&'static Encoding, String, f64)> = None;

    for (encoding, source) in candidates {
        let decoded = encoding.decode_without_bom_handling_and_without_replacement(bytes);
        let score = decoded.as_ref().map(|text| japanese_density(text));
        scores.push(CandidateScore {
            encoding: encoding.name().to_string(),
            source: *source,
            score,
        });

        if let (Some(text), Some(score)) = (decoded, score) {
            // Strictly greater: earlier candidates win ties.
            if best.as_ref().is_none_or(|(_, _, best_score)| score > *best_score) {
                best = Some((encoding, text.into_owned(), score));
            }
        }
    }

    match best {
        Some((encoding, text, score)) => {
            log::debug!("decoded page as {} (score {:.4})", encoding.name(), score);
            DecodedPage {
                text: strip_bom(text),
                encoding: encoding.name().to_string(),
                score,
                confident: true,
                candidates: scores,
            }
        }
        None => {
            let encoding = candidates
                .first()
                .map(|(encoding, _)| *encoding)
                .unwrap_or(encoding_rs::UTF_8);
            let (text, _) = encoding.decode_without_bom_handling(bytes);
            let text = text.into_owned();
            let score = japanese_density(&text);
            log::warn!(
                "no candidate decoded strictly; using lossy {} (score {:.4})",
                encoding.name(),
                score
            );
            DecodedPage {
                text: strip_bom(text),
                encoding: encoding.name().to_string(),
                score,
                confident: false,
                candidates: scores,
            }
        }
    }
}

fn strip_bom(text: String) -> String {
    match text.strip_prefix('\u{FEFF}') {
        Some(rest) => rest.to_string(),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "<html><body><p>中古車の一覧です。トヨタ プリウス 支払総額 288.4万円</p></body></html>";

    #[test]
    fn test_charset_from_content_type() {
        assert_eq!(
            charset_from_content_type("text/html; charset=\"Shift_JIS\""),
            Some("Shift_JIS".to_string())
        );
        assert_eq!(charset_from_content_type("text/html"), None);
    }

    #[test]
    fn test_declared_charset() {
        let html = br#"<html><head><meta http-equiv="Content-Type" content="text/html; charset=EUC-JP"></head>"#;
        assert_eq!(declared_charset(html), Some("EUC-JP".to_string()));
        assert_eq!(declared_charset(br#"<meta charset="utf-8">"#), Some("utf-8".to_string()));
    }

    #[test]
    fn test_utf8_with_header() {
        let page = decode_bytes(
            SAMPLE.as_bytes(),
            &DecodeHints {
                header_charset: Some("utf-8"),
                tld: Some("jp"),
            },
        );
        assert_eq!(page.text, SAMPLE);
        assert_eq!(page.encoding, "UTF-8");
        assert!(page.confident);
    }

    #[test]
    fn test_shift_jis_without_hints() {
        let (bytes, _, _) = encoding_rs::SHIFT_JIS.encode(SAMPLE);
        let page = decode_bytes(&bytes, &DecodeHints::default());
        assert_eq!(page.text, SAMPLE);
        assert_eq!(page.encoding, "Shift_JIS");
    }

    #[test]
    fn test_mislabeled_header_loses_to_better_candidate() {
        let (bytes, _, _) = encoding_rs::EUC_JP.encode(SAMPLE);
        let page = decode_bytes(
            &bytes,
            &DecodeHints {
                header_charset: Some("iso-8859-1"),
                tld: None,
            },
        );
        assert_eq!(page.text, SAMPLE);
        assert_eq!(page.encoding, "EUC-JP");
        assert!(page.candidates.iter().any(|c| c.source == CandidateSource::Header));
    }

    #[test]
    fn test_decoding_is_idempotent() {
        let (bytes, _, _) = encoding_rs::SHIFT_JIS.encode(SAMPLE);
        let hints = DecodeHints {
            header_charset: Some("utf-8"),
            tld: Some("jp"),
        };
        let first = decode_bytes(&bytes, &hints);
        let second = decode_bytes(&bytes, &hints);
        assert_eq!(first, second);
    }

    #[test]
    fn test_lossy_fallback_is_not_confident() {
        let candidates = [
            (encoding_rs::UTF_8, CandidateSource::Header),
            (encoding_rs::EUC_JP, CandidateSource::Fallback),
        ];
        let page = decode_with_candidates(&[0xFF, 0xFF, b'A'], &candidates);
        assert!(!page.confident);
        assert_eq!(page.encoding, "UTF-8");
        assert_eq!(page.text, "\u{FFFD}\u{FFFD}A");
        assert!(page.candidates.iter().all(|c| c.score.is_none()));
    }

    #[test]
    fn test_density_penalizes_replacement_chars() {
        assert!(japanese_density("中古車") > japanese_density("中古\u{FFFD}"));
        assert_eq!(japanese_density(""), 0.0);
    }
}
