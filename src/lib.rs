//! # Sonify: Sound for Interactive Simulations
//!
//! `sonify` produces the sound of an interactive simulation: decoded clips,
//! procedurally synthesized tones and noise, and value-driven sonification,
//! all mixed through one session that follows the host application's state.
//!
//! ## Architecture
//!
//! The library is organized in three layers:
//!
//! - **Infrastructure** - An automatable audio graph ([`context`]), asset
//!   fetching and single-decode caching, session state fan-out, and
//!   observable properties
//! - **Generators** - Everything audible shares a [`generator::GeneratorCore`]:
//!   an output gain, enable conditions, and tracked connections. Clips,
//!   multi-clips, noise, oscillators, pops, additive tones and chords build
//!   on it
//! - **Mixing Session** - [`manager::SoundManager`] owns the bus graph,
//!   gates the mix on host conditions, ducks under narration and resumes
//!   the audio session on user gestures
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sonify::prelude::*;
//!
//! let context = AudioContext::new(44100.0);
//! let host = HostState::default();
//! let manager = SoundManager::new(&context, host.clone());
//! manager
//!     .initialize(SoundManagerConfig {
//!         categories: vec!["user-interface".into()],
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//! let click = AudioBuffer::from_channels(vec![vec![0.5; 441]], 44100.0);
//! let clip = SoundClip::new(&context, WrappedAudioBuffer::ready(click), SoundClipOptions::default());
//! manager
//!     .add_sound_generator(&clip, SoundGeneratorAddOptions::category("user-interface"))
//!     .unwrap();
//!
//! // Deferred until the session runs
//! clip.play(0.0);
//! host.user_gesture.emit(&());
//! ```

pub mod amplitude_modulator;
pub mod asset;
pub mod bin_mapper;
pub mod buffer;
pub mod chord;
pub mod clip;
pub mod clock;
pub mod context;
pub mod decoder;
mod deferred;
pub mod error;
pub mod fourier;
pub mod generator;
pub mod host;
pub mod manager;
pub mod multi_clip;
pub mod noise;
pub mod oscillator;
pub mod pitched_pop;
pub mod player;
pub mod property;
pub mod session_monitor;
pub mod sound_utils;
pub mod value_change;

/// Prelude module for convenient imports
pub mod prelude {
    // Infrastructure
    pub use crate::asset::{AssetFetcher, AssetSource, AudioAsset, AudioFormat, FileFetcher, MemoryFetcher};
    pub use crate::buffer::{AudioBuffer, WrappedAudioBuffer};
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::context::{
        AudioContext, ContextState, FilterType, NodeId, OscillatorType, ParamHandle, ParamName,
    };
    pub use crate::decoder::{load_sound, DecodeCache};
    pub use crate::error::{DecodeError, SessionError, SoundError};
    pub use crate::property::{ConditionSet, DerivedProperty, Emitter, Property, ReadOnlyProperty};

    // Analysis
    pub use crate::bin_mapper::{BinMapper, BinMapperOptions, ValueRange};
    pub use crate::sound_utils::{detect_sound_bounds, SoundBounds, DEFAULT_SILENCE_THRESHOLD};

    // Generators
    pub use crate::amplitude_modulator::{AmplitudeModulator, AmplitudeModulatorOptions};
    pub use crate::chord::{SoundClipChord, SoundClipChordOptions};
    pub use crate::clip::{SoundClip, SoundClipOptions};
    pub use crate::fourier::{FourierToneGenerator, FourierToneOptions};
    pub use crate::generator::{
        GeneratorCore, GeneratorId, GeneratorOptions, SonificationLevel, SoundGenerator,
    };
    pub use crate::multi_clip::{
        DiscreteSoundGenerator, DiscreteSoundGeneratorOptions, MultiClip, PropertyMultiClip,
    };
    pub use crate::noise::{NoiseGenerator, NoiseGeneratorOptions, NoiseType};
    pub use crate::oscillator::{OscillatorOptions, OscillatorSoundGenerator};
    pub use crate::pitched_pop::{PitchedPopGenerator, PitchedPopGeneratorOptions};

    // Sonification policy
    pub use crate::player::{NullSoundPlayer, SoundPlayer};
    pub use crate::value_change::{
        ThresholdSpacing, ValueChangeSoundPlayer, ValueChangeSoundPlayerOptions,
    };

    // Mixing session
    pub use crate::host::HostState;
    pub use crate::manager::{SoundGeneratorAddOptions, SoundManager, SoundManagerConfig};
}

// Re-export key types at crate root for convenience
pub use prelude::*;
