//! Document URI handling: sanitization, docKey derivation, cache paths.
//!
//! The docKey is the canonical identity of a document within the process:
//! the percent-encoded path component of the sanitized public URI. Two
//! URIs with the same docKey share one broker.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{BrokerError, Result};

/// Characters re-encoded when deriving a docKey from a decoded path.
/// `/` stays literal so the key remains readable as a path.
const DOC_KEY_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}')
    .add(b'#')
    .add(b'?');

/// The kit cannot open files with `#` or `%` in the name; those are
/// escaped when composing the jailed file URI.
const JAIL_SET: &AsciiSet = &CONTROLS.add(b'#').add(b'%');

/// Sanitize an incoming document URI.
///
/// The URI arrives url-encoded; it is decoded once, parsed, and relative
/// or `file` URIs are normalized to local paths. The `access_token` query
/// value was encoded a second time before embedding and is decoded in
/// place.
pub fn sanitize_uri(raw: &str) -> Result<Url> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| BrokerError::InvalidUri(e.to_string()))?;

    let mut uri = match Url::parse(&decoded) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse("file:///")
            .expect("static base URI")
            .join(&decoded)
            .map_err(|e| BrokerError::InvalidUri(e.to_string()))?,
        Err(e) => return Err(BrokerError::InvalidUri(e.to_string())),
    };

    if uri.path().is_empty() {
        return Err(BrokerError::InvalidUri("empty path".into()));
    }

    if uri.query().is_some() {
        let pairs: Vec<(String, String)> = uri
            .query_pairs()
            .map(|(k, v)| {
                if k == "access_token" {
                    let once_more = percent_decode_str(&v).decode_utf8_lossy().into_owned();
                    (k.into_owned(), once_more)
                } else {
                    (k.into_owned(), v.into_owned())
                }
            })
            .collect();
        uri.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Ok(uri)
}

/// Derive the docKey for a sanitized URI.
///
/// Host names are deliberately excluded: aliased hosts must resolve to the
/// same document, or concurrent edits through different aliases would load
/// separate copies and overwrite each other on save.
pub fn doc_key(uri: &Url) -> String {
    let path = percent_decode_str(uri.path()).decode_utf8_lossy();
    utf8_percent_encode(&path, DOC_KEY_SET).to_string()
}

/// Tile-cache directory for a document URI.
///
/// `<cache_root>/<h0>/<h1>/<h2>/<rest>` where `h` is the lowercase hex
/// SHA-1 of the URI bytes, fanned out on its first three nibbles.
pub fn cache_path(cache_root: &Path, uri: &str) -> PathBuf {
    let mut hasher = Sha1::new();
    hasher.update(uri.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    cache_root
        .join(&hex[..1])
        .join(&hex[1..2])
        .join(&hex[2..3])
        .join(&hex[3..])
}

/// Compose the `file://` URI for the jailed local copy.
pub fn jailed_uri(local_path: &Path) -> String {
    let encoded = utf8_percent_encode(&local_path.to_string_lossy(), JAIL_SET).to_string();
    format!("file://{}", encoded)
}
