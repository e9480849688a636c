//! Sample sources that drive the capture thread.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::Result;

use super::pcm::pcm16_to_float;

/// Something that produces interleaved f32 samples, block by block.
pub trait AudioSource: Send {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Fill `out` with interleaved samples. Returns how many were written;
    /// `0` means end of stream.
    fn read(&mut self, out: &mut [f32]) -> Result<usize>;
}

enum WavSamples {
    Float(hound::WavIntoSamples<BufReader<File>, f32>),
    Int {
        samples: hound::WavIntoSamples<BufReader<File>, i32>,
        bits: u16,
    },
}

/// Reads a WAV file as if it were a microphone.
pub struct WavSource {
    samples: WavSamples,
    sample_rate: u32,
    channels: u16,
}

impl WavSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let reader = hound::WavReader::open(path.as_ref())?;
        let spec = reader.spec();

        log::info!(
            "WAV source: {}, rate={}Hz, ch={}, bits={}, format={:?}",
            path.as_ref().display(),
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample,
            spec.sample_format,
        );

        let samples = match spec.sample_format {
            hound::SampleFormat::Float => WavSamples::Float(reader.into_samples::<f32>()),
            hound::SampleFormat::Int => WavSamples::Int {
                samples: reader.into_samples::<i32>(),
                bits: spec.bits_per_sample,
            },
        };

        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }
}

impl AudioSource for WavSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        let mut written = 0;
        while written < out.len() {
            let next = match &mut self.samples {
                WavSamples::Float(it) => it.next().transpose()?,
                WavSamples::Int { samples, bits } => match samples.next().transpose()? {
                    Some(v) if *bits == 16 => Some(pcm16_to_float(v as i16)),
                    Some(v) => Some(v as f32 / (1i64 << (*bits - 1)) as f32),
                    None => None,
                },
            };
            match next {
                Some(s) => {
                    out[written] = s;
                    written += 1;
                }
                None => break,
            }
        }
        Ok(written)
    }
}

/// In-memory interleaved samples.
pub struct MemorySource {
    samples: Vec<f32>,
    position: usize,
    sample_rate: u32,
    channels: u16,
}

impl MemorySource {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            position: 0,
            sample_rate,
            channels,
        }
    }
}

impl AudioSource for MemorySource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        let remaining = &self.samples[self.position..];
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }
}
