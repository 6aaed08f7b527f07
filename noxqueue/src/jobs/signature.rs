//! Deterministic job signatures.
//!
//! `signature = "v1:" + sha256(canonical_json({tool, params, checksum | url}))`
//! where `params` drops top-level nulls and every object is serialized with
//! sorted keys and no whitespace. Two submissions of the same tool over the
//! same input with the same effective parameters always share a signature.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use url::Url;

use crate::database::models::JobTool;
use crate::{Error, Result};

pub const SIGNATURE_VERSION: &str = "v1";

const YOUTUBE_WATCH_HOSTS: &[&str] = &["www.youtube.com", "youtube.com", "m.youtube.com"];
const YOUTUBE_SHORT_HOSTS: &[&str] = &["youtu.be"];

/// Query parameters that never change what a URL points at.
const TRACKING_PARAMS: &[&str] = &["si", "feature", "fbclid", "gclid"];

/// Identity of a job's input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFingerprint {
    /// Content checksum of an uploaded artifact.
    Checksum(String),
    /// Normalized remote URL.
    Url(String),
    /// The tool takes no input.
    None,
}

/// Build the signature for `(tool, params, input)`.
pub fn build_signature(
    tool: JobTool,
    params: &Map<String, Value>,
    input: &InputFingerprint,
) -> String {
    let effective: Map<String, Value> = params
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let mut payload = Map::new();
    payload.insert("tool".to_string(), Value::from(tool.as_str()));
    payload.insert("params".to_string(), Value::Object(effective));
    match input {
        InputFingerprint::Checksum(checksum) => {
            payload.insert("checksum".to_string(), Value::from(checksum.as_str()));
        }
        InputFingerprint::Url(url) => {
            payload.insert("url".to_string(), Value::from(url.as_str()));
        }
        InputFingerprint::None => {}
    }

    let canonical = canonical_json(&Value::Object(payload));
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{SIGNATURE_VERSION}:{}", hex::encode(digest))
}

/// Compact JSON with object keys sorted at every depth.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        Value::String(key.clone()),
                        canonical_json(&map[key.as_str()])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        scalar => scalar.to_string(),
    }
}

/// Normalize a remote URL so trivially different spellings dedupe together.
///
/// YouTube video links collapse to `https://www.youtube.com/watch?v=<id>`.
/// Everything else is lowercased (scheme and host), loses its fragment,
/// default port and tracking parameters, and has its query pairs sorted.
pub fn normalize_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let mut url =
        Url::parse(trimmed).map_err(|e| Error::validation(format!("Invalid URL '{trimmed}': {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::validation(format!(
            "Unsupported URL scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(Error::validation("URL has no host"));
    }

    if is_youtube_host(&url) {
        return canonical_youtube_url(&url);
    }

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Ok(url.to_string())
}

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

fn is_youtube_host(url: &Url) -> bool {
    url.host_str().is_some_and(|host| {
        YOUTUBE_WATCH_HOSTS.contains(&host) || YOUTUBE_SHORT_HOSTS.contains(&host)
    })
}

fn canonical_youtube_url(url: &Url) -> Result<String> {
    let host = url.host_str().unwrap_or_default();
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    let video_id = if YOUTUBE_SHORT_HOSTS.contains(&host) {
        segments.first().map(|s| s.to_string())
    } else if let Some((_, v)) = url.query_pairs().find(|(key, _)| key == "v") {
        Some(v.into_owned())
    } else {
        match segments.as_slice() {
            ["embed" | "shorts", id, ..] => Some(id.to_string()),
            _ => None,
        }
    };

    match video_id.filter(|id| !id.is_empty()) {
        Some(id) => Ok(format!("https://www.youtube.com/watch?v={id}")),
        None => Err(Error::validation(
            "Unable to determine YouTube video id from URL",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_signature_is_versioned_sha256() {
        let sig = build_signature(
            JobTool::Transcode,
            &params(json!({"q": 1})),
            &InputFingerprint::Checksum("c1".into()),
        );
        let (version, digest) = sig.split_once(':').unwrap();
        assert_eq!(version, "v1");
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn test_signature_ignores_key_order_and_nulls() {
        let input = InputFingerprint::Checksum("c1".into());
        let a = build_signature(
            JobTool::Separate,
            &params(json!({"model": "htdemucs", "stems": 4, "device": null})),
            &input,
        );
        let b = build_signature(
            JobTool::Separate,
            &params(json!({"stems": 4, "model": "htdemucs"})),
            &input,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_sorts_nested_objects() {
        let input = InputFingerprint::None;
        let a = build_signature(
            JobTool::Analyze,
            &params(json!({"opts": {"b": 1, "a": 2}})),
            &input,
        );
        let b = build_signature(
            JobTool::Analyze,
            &params(json!({"opts": {"a": 2, "b": 1}})),
            &input,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_distinguishes_inputs() {
        let p = params(json!({"q": 1}));
        let c1 = build_signature(JobTool::Transcode, &p, &InputFingerprint::Checksum("c1".into()));
        let c2 = build_signature(JobTool::Transcode, &p, &InputFingerprint::Checksum("c2".into()));
        let other_tool =
            build_signature(JobTool::Analyze, &p, &InputFingerprint::Checksum("c1".into()));
        let url = build_signature(JobTool::Transcode, &p, &InputFingerprint::Url("c1".into()));
        assert_ne!(c1, c2);
        assert_ne!(c1, other_tool);
        assert_ne!(c1, url);
    }

    #[test]
    fn test_canonical_json_matches_compact_sorted_form() {
        let value = json!({"tool": "x", "params": {"z": [1, {"b": true, "a": null}], "a": "s"}});
        assert_eq!(
            canonical_json(&value),
            r#"{"params":{"a":"s","z":[1,{"a":null,"b":true}]},"tool":"x"}"#
        );
    }

    #[test]
    fn test_normalize_generic_url() {
        let normalized =
            normalize_url("HTTPS://Example.COM:443/a/b?utm_source=x&z=2&a=1#frag").unwrap();
        assert_eq!(normalized, "https://example.com/a/b?a=1&z=2");

        assert_eq!(
            normalize_url("http://example.com/file.mp3?si=abc").unwrap(),
            "http://example.com/file.mp3"
        );
    }

    #[test]
    fn test_normalize_youtube_variants() {
        let expected = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
        for raw in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=RD123&t=42",
            "https://youtu.be/dQw4w9WgXcQ?si=tracking",
            "https://m.youtube.com/watch?feature=share&v=dQw4w9WgXcQ",
            "https://youtube.com/shorts/dQw4w9WgXcQ",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
        ] {
            assert_eq!(normalize_url(raw).unwrap(), expected, "{raw}");
        }
    }

    #[test]
    fn test_normalize_rejects_bad_urls() {
        assert!(normalize_url("not a url").is_err());
        assert!(normalize_url("ftp://example.com/file").is_err());
        assert!(normalize_url("https://www.youtube.com/feed/trending").is_err());
    }
}
