//! Asset decode cache
//!
//! Every asset is decoded at most once per cache. Requests that arrive while
//! a decode is in flight are queued and fanned out in registration order when
//! it completes; requests after completion are answered from the cache.

use crate::asset::{decode_data_uri, AssetFetcher, AssetSource, AudioAsset, AudioFormat};
use crate::buffer::{AudioBuffer, WrappedAudioBuffer};
use crate::context::AudioContext;
use crate::error::DecodeError;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, error};

/// Called with the decoded buffer
pub type SuccessCallback = Box<dyn FnOnce(&AudioBuffer)>;

/// Called with the decode failure
pub type ErrorCallback = Box<dyn FnOnce(&DecodeError)>;

enum CacheEntry {
    Pending {
        successes: Vec<SuccessCallback>,
        errors: Vec<ErrorCallback>,
    },
    Ready(AudioBuffer),
    Failed(DecodeError),
}

struct CacheInner {
    fetcher: Rc<dyn AssetFetcher>,
    sound_supported: bool,
    entries: RefCell<HashMap<String, CacheEntry>>,
    placeholder: RefCell<Option<AudioBuffer>>,
}

/// Decodes assets into shared buffers, once per asset name.
#[derive(Clone)]
pub struct DecodeCache {
    inner: Rc<CacheInner>,
}

impl DecodeCache {
    pub fn new(fetcher: Rc<dyn AssetFetcher>) -> Self {
        Self::with_support(fetcher, true)
    }

    /// A cache for a platform that may not support sound at all. When
    /// unsupported, every request is answered with one shared silent buffer.
    pub fn with_support(fetcher: Rc<dyn AssetFetcher>, sound_supported: bool) -> Self {
        Self {
            inner: Rc::new(CacheInner {
                fetcher,
                sound_supported,
                entries: RefCell::new(HashMap::new()),
                placeholder: RefCell::new(None),
            }),
        }
    }

    /// Request the decoded buffer for `asset`.
    ///
    /// Exactly one of the callbacks is eventually invoked, unless the fetch
    /// never completes.
    pub fn decode(
        &self,
        asset: &AudioAsset,
        context: &AudioContext,
        on_success: impl FnOnce(&AudioBuffer) + 'static,
        on_error: impl FnOnce(&DecodeError) + 'static,
    ) {
        if !self.inner.sound_supported {
            let buffer = self.placeholder(context);
            on_success(&buffer);
            return;
        }

        enum Lookup {
            Ready(AudioBuffer),
            Failed(DecodeError),
            Queued,
            Start,
        }

        let mut on_success: Option<SuccessCallback> = Some(Box::new(on_success));
        let mut on_error: Option<ErrorCallback> = Some(Box::new(on_error));

        let lookup = {
            let mut entries = self.inner.entries.borrow_mut();
            match entries.get_mut(&asset.name) {
                Some(CacheEntry::Ready(buffer)) => Lookup::Ready(buffer.clone()),
                Some(CacheEntry::Failed(e)) => Lookup::Failed(e.clone()),
                Some(CacheEntry::Pending { successes, errors }) => {
                    successes.extend(on_success.take());
                    errors.extend(on_error.take());
                    Lookup::Queued
                }
                None => {
                    entries.insert(
                        asset.name.clone(),
                        CacheEntry::Pending {
                            successes: on_success.take().into_iter().collect(),
                            errors: on_error.take().into_iter().collect(),
                        },
                    );
                    Lookup::Start
                }
            }
        };

        match lookup {
            Lookup::Ready(buffer) => {
                if let Some(callback) = on_success {
                    callback(&buffer);
                }
            }
            Lookup::Failed(e) => {
                if let Some(callback) = on_error {
                    callback(&e);
                }
            }
            Lookup::Queued => debug!(asset = %asset.name, "joining in-flight decode"),
            Lookup::Start => self.start(asset, context),
        }
    }

    fn start(&self, asset: &AudioAsset, context: &AudioContext) {
        debug!(asset = %asset.name, "decoding asset");
        let name = asset.name.clone();
        match &asset.source {
            AssetSource::Inline(uri) => match decode_data_uri(uri) {
                Ok((format, bytes)) => self.submit(name, bytes, format, context),
                Err(e) => self.complete(&name, Err(e)),
            },
            AssetSource::Url(url) => {
                let format = AudioFormat::from_extension(url);
                let cache = self.clone();
                let context = context.clone();
                self.inner.fetcher.fetch(
                    url,
                    Box::new(move |result| match result {
                        Ok(bytes) => cache.submit(name, bytes, format, &context),
                        Err(e) => cache.complete(&name, Err(e)),
                    }),
                );
            }
        }
    }

    fn submit(&self, name: String, bytes: Vec<u8>, format: AudioFormat, context: &AudioContext) {
        let format = match format {
            AudioFormat::Unknown if bytes.starts_with(b"RIFF") => AudioFormat::Wav,
            other => other,
        };
        let cache = self.clone();
        context.decode_audio_data(
            bytes,
            format,
            Box::new(move |result| cache.complete(&name, result)),
        );
    }

    fn complete(&self, name: &str, result: Result<AudioBuffer, DecodeError>) {
        let new_entry = match &result {
            Ok(buffer) => CacheEntry::Ready(buffer.clone()),
            Err(e) => CacheEntry::Failed(e.clone()),
        };
        let previous = self
            .inner
            .entries
            .borrow_mut()
            .insert(name.to_string(), new_entry);

        let (successes, errors) = match previous {
            Some(CacheEntry::Pending { successes, errors }) => (successes, errors),
            _ => (Vec::new(), Vec::new()),
        };

        match result {
            Ok(buffer) => {
                debug!(asset = name, waiters = successes.len(), "asset decoded");
                for callback in successes {
                    callback(&buffer);
                }
            }
            Err(e) => {
                error!(asset = name, error = %e, "unable to decode audio asset");
                for callback in errors {
                    callback(&e);
                }
            }
        }
    }

    fn placeholder(&self, context: &AudioContext) -> AudioBuffer {
        self.inner
            .placeholder
            .borrow_mut()
            .get_or_insert_with(|| AudioBuffer::silent(1, context.sample_rate()))
            .clone()
    }

    pub fn is_ready(&self, name: &str) -> bool {
        matches!(
            self.inner.entries.borrow().get(name),
            Some(CacheEntry::Ready(_))
        )
    }

    pub fn is_pending(&self, name: &str) -> bool {
        matches!(
            self.inner.entries.borrow().get(name),
            Some(CacheEntry::Pending { .. })
        )
    }

    pub fn cached(&self, name: &str) -> Option<AudioBuffer> {
        match self.inner.entries.borrow().get(name) {
            Some(CacheEntry::Ready(buffer)) => Some(buffer.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Create an empty wrapper for `asset` and fill it when its decode lands.
///
/// Failed decodes leave the wrapper empty forever; the failure is logged by
/// the cache.
pub fn load_sound(cache: &DecodeCache, asset: &AudioAsset, context: &AudioContext) -> WrappedAudioBuffer {
    let wrapped = WrappedAudioBuffer::new();
    let target = wrapped.clone();
    cache.decode(
        asset,
        context,
        move |buffer| target.set(buffer.clone()),
        |_| {},
    );
    wrapped
}
