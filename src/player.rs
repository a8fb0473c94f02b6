//! Minimal playback interface shared by clips and policy layers.

/// Something that can be told to play and stop.
pub trait SoundPlayer {
    fn play(&self);

    fn stop(&self);

    /// Players without rate control ignore this.
    fn set_playback_rate(&self, _rate: f64) {}
}

/// A player that makes no sound, for policy slots that should stay silent.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSoundPlayer;

impl SoundPlayer for NullSoundPlayer {
    fn play(&self) {}

    fn stop(&self) {}
}
