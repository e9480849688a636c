//! audio - Capture and PCM16 wire-format helpers
//!
//! The capture side runs on a dedicated OS thread and hands fixed-size f32
//! frames to the session, which converts them to PCM16 for the realtime
//! channel.

pub mod capture;
pub mod pcm;
pub mod source;

pub use capture::{AudioFrame, CaptureConfig, CaptureSystem, CaptureWorker};
pub use source::{AudioSource, MemorySource, WavSource};
