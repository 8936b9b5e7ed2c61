//! Microphone capture, gapless playback scheduling, and PCM helpers.

pub mod capture;
pub mod pcm;
pub mod playback;
