//! Audio asset descriptors and byte sources
//!
//! An asset is known by a stable name and carries exactly one of a remote
//! reference (fetched through an [`AssetFetcher`]) or an inline
//! `data:audio/<format>;base64,` payload. The format is inferred from the
//! reference's file extension or the payload's declared MIME type.

use crate::error::DecodeError;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

/// Container/codec of an encoded asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Ogg,
    Webm,
    Aac,
    Unknown,
}

impl AudioFormat {
    pub fn from_extension(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let extension = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("wav") | Some("wave") => AudioFormat::Wav,
            Some("mp3") => AudioFormat::Mp3,
            Some("ogg") | Some("oga") => AudioFormat::Ogg,
            Some("webm") => AudioFormat::Webm,
            Some("aac") | Some("m4a") => AudioFormat::Aac,
            _ => AudioFormat::Unknown,
        }
    }

    pub fn from_mime_type(mime: &str) -> Self {
        match mime.to_ascii_lowercase().as_str() {
            "audio/wav" | "audio/wave" | "audio/x-wav" => AudioFormat::Wav,
            "audio/mp3" | "audio/mpeg" => AudioFormat::Mp3,
            "audio/ogg" => AudioFormat::Ogg,
            "audio/webm" => AudioFormat::Webm,
            "audio/aac" | "audio/mp4" => AudioFormat::Aac,
            _ => AudioFormat::Unknown,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Ogg => "audio/ogg",
            AudioFormat::Webm => "audio/webm",
            AudioFormat::Aac => "audio/aac",
            AudioFormat::Unknown => "application/octet-stream",
        }
    }
}

/// Where an asset's bytes come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum AssetSource {
    /// A URL or path resolved by an [`AssetFetcher`]
    Url(String),
    /// A `data:audio/<format>;base64,<payload>` string
    Inline(String),
}

/// A named, not-yet-decoded audio asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioAsset {
    pub name: String,
    pub source: AssetSource,
}

impl AudioAsset {
    pub fn url(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: AssetSource::Url(url.into()),
        }
    }

    pub fn inline(name: impl Into<String>, data_uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: AssetSource::Inline(data_uri.into()),
        }
    }

    /// Inline asset built from raw bytes
    pub fn from_bytes(name: impl Into<String>, format: AudioFormat, bytes: &[u8]) -> Self {
        let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
        Self::inline(name, format!("data:{};base64,{}", format.mime_type(), payload))
    }

    pub fn format(&self) -> AudioFormat {
        match &self.source {
            AssetSource::Url(url) => AudioFormat::from_extension(url),
            AssetSource::Inline(uri) => parse_data_uri_header(uri)
                .map(|(mime, _)| AudioFormat::from_mime_type(mime))
                .unwrap_or(AudioFormat::Unknown),
        }
    }
}

fn parse_data_uri_header(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    Some((mime, payload))
}

/// Decode an inline `data:audio/...;base64,` payload into its format and bytes.
pub fn decode_data_uri(uri: &str) -> Result<(AudioFormat, Vec<u8>), DecodeError> {
    let (mime, payload) =
        parse_data_uri_header(uri).ok_or_else(|| DecodeError::InvalidDataUri(truncate(uri)))?;
    if !mime.starts_with("audio/") {
        return Err(DecodeError::InvalidDataUri(format!(
            "expected an audio MIME type, found {}",
            mime
        )));
    }
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload.trim())?;
    Ok((AudioFormat::from_mime_type(mime), bytes))
}

fn truncate(uri: &str) -> String {
    uri.chars().take(48).collect()
}

// =============================================================================
// Fetchers
// =============================================================================

/// Completion callback for a fetch
pub type FetchCallback = Box<dyn FnOnce(Result<Vec<u8>, DecodeError>)>;

/// Resolves a remote reference to bytes.
///
/// Implementations may complete synchronously or hold the callback and
/// complete later; callers must not assume either.
pub trait AssetFetcher {
    fn fetch(&self, url: &str, on_complete: FetchCallback);
}

/// Reads references as paths relative to a root directory.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetFetcher for FileFetcher {
    fn fetch(&self, url: &str, on_complete: FetchCallback) {
        let path = self.root.join(url);
        let result = std::fs::read(&path).map_err(|e| DecodeError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        });
        on_complete(result);
    }
}

/// Serves references from an in-memory table.
///
/// When deferred, completions are held until [`MemoryFetcher::flush`], which
/// models a network round trip that outlives the requesting call.
#[derive(Clone, Default)]
pub struct MemoryFetcher {
    files: Rc<RefCell<HashMap<String, Vec<u8>>>>,
    deferred: bool,
    pending: Rc<RefCell<Vec<(String, FetchCallback)>>>,
    fetch_count: Rc<RefCell<usize>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deferred() -> Self {
        Self {
            deferred: true,
            ..Self::default()
        }
    }

    pub fn insert(&self, url: impl Into<String>, bytes: Vec<u8>) {
        self.files.borrow_mut().insert(url.into(), bytes);
    }

    /// Complete every held fetch. Returns the number completed.
    pub fn flush(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        let count = pending.len();
        for (url, callback) in pending {
            callback(self.lookup(&url));
        }
        count
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetch_count.borrow()
    }

    fn lookup(&self, url: &str) -> Result<Vec<u8>, DecodeError> {
        self.files
            .borrow()
            .get(url)
            .cloned()
            .ok_or_else(|| DecodeError::Fetch {
                url: url.to_string(),
                reason: "not found".into(),
            })
    }
}

impl AssetFetcher for MemoryFetcher {
    fn fetch(&self, url: &str, on_complete: FetchCallback) {
        *self.fetch_count.borrow_mut() += 1;
        if self.deferred {
            self.pending
                .borrow_mut()
                .push((url.to_string(), on_complete));
        } else {
            on_complete(self.lookup(url));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(AudioFormat::from_extension("sounds/boop.WAV"), AudioFormat::Wav);
        assert_eq!(AudioFormat::from_extension("a/b.mp3?v=2"), AudioFormat::Mp3);
        assert_eq!(AudioFormat::from_extension("noext"), AudioFormat::Unknown);
    }

    #[test]
    fn test_inline_round_trip() {
        let asset = AudioAsset::from_bytes("click", AudioFormat::Wav, &[1, 2, 3, 250]);
        assert_eq!(asset.format(), AudioFormat::Wav);
        let AssetSource::Inline(uri) = &asset.source else {
            panic!("expected inline source");
        };
        let (format, bytes) = decode_data_uri(uri).unwrap();
        assert_eq!(format, AudioFormat::Wav);
        assert_eq!(bytes, vec![1, 2, 3, 250]);
    }

    #[test]
    fn test_malformed_data_uri() {
        assert!(matches!(
            decode_data_uri("data:audio/mp3,raw"),
            Err(DecodeError::InvalidDataUri(_))
        ));
        assert!(matches!(
            decode_data_uri("data:image/png;base64,AAAA"),
            Err(DecodeError::InvalidDataUri(_))
        ));
        assert!(matches!(
            decode_data_uri("data:audio/mpeg;base64,@@@"),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn test_deferred_memory_fetcher() {
        let fetcher = MemoryFetcher::deferred();
        fetcher.insert("a.wav", vec![9]);
        let got = Rc::new(RefCell::new(None));
        let g = Rc::clone(&got);
        fetcher.fetch("a.wav", Box::new(move |r| *g.borrow_mut() = Some(r)));
        assert!(got.borrow().is_none());
        assert_eq!(fetcher.flush(), 1);
        assert_eq!(got.borrow().clone(), Some(Ok(vec![9])));
    }

    #[test]
    fn test_asset_serialization() {
        let asset = AudioAsset::url("boop", "sounds/boop.mp3");
        let json = serde_json::to_string(&asset).unwrap();
        assert!(json.contains("\"type\":\"url\""));
        let back: AudioAsset = serde_json::from_str(&json).unwrap();
        assert_eq!(back, asset);
    }
}
