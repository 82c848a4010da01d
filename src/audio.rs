//! Audio frame format and the device capabilities the call pipeline consumes.

use std::f32::consts::TAU;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Shape of every PCM frame exchanged in a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(48_000, 1, 20)
    }
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, frame_duration_ms: u32) -> Self {
        Self { sample_rate, channels, frame_duration_ms }
    }

    /// Samples per channel in one frame; also the timestamp increment per packet
    pub fn samples_per_channel(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    /// Interleaved samples in one frame
    pub fn frame_len(&self) -> usize {
        self.samples_per_channel() * self.channels as usize
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.channels == 0 || self.frame_duration_ms == 0 {
            bail!("audio format fields must be positive: {:?}", self);
        }
        if self.frame_len() == 0 {
            bail!("frame of {} ms at {} Hz holds no samples", self.frame_duration_ms, self.sample_rate);
        }
        Ok(())
    }
}

/// Microphone side: yields one frame per call, blocking until it is available.
///
/// `Ok(None)` means the source is exhausted (end of a file).
pub trait AudioSource: Send {
    fn produce_frame(&mut self) -> Result<Option<Vec<i16>>>;
}

/// Speaker side: consumes one frame per playout tick
pub trait AudioSink: Send {
    fn consume_frame(&mut self, frame: &[i16]) -> Result<()>;

    /// Flush anything buffered; called once when the call ends
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Sleeps until each frame's real-time deadline, imitating a capture device
struct FrameClock {
    period: Duration,
    next: Option<Instant>,
}

impl FrameClock {
    fn new(period: Duration) -> Self {
        Self { period, next: None }
    }

    fn wait(&mut self) {
        let now = Instant::now();
        let deadline = *self.next.get_or_insert(now);
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        self.next = Some(deadline + self.period);
    }
}

/// Reads 16-bit PCM frames from a WAV file at real-time pace
pub struct WavFileSource {
    reader: WavReader<BufReader<File>>,
    format: AudioFormat,
    clock: Option<FrameClock>,
    exhausted: bool,
}

impl WavFileSource {
    pub fn open(path: impl AsRef<Path>, format: AudioFormat) -> Result<Self> {
        let path = path.as_ref();
        let reader = WavReader::open(path)
            .with_context(|| format!("Failed to open WAV input {:?}", path))?;
        let spec = reader.spec();
        if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
            bail!("WAV input must be 16-bit integer PCM, got {:?}", spec);
        }
        if spec.sample_rate != format.sample_rate || spec.channels != format.channels {
            bail!("WAV input is {} Hz / {} ch, call uses {} Hz / {} ch",
                  spec.sample_rate, spec.channels, format.sample_rate, format.channels);
        }
        info!("Reading call audio from {:?} ({} samples)", path, reader.len());

        Ok(Self {
            reader,
            format,
            clock: Some(FrameClock::new(format.frame_duration())),
            exhausted: false,
        })
    }

    /// Produce frames as fast as they are requested
    pub fn unpaced(mut self) -> Self {
        self.clock = None;
        self
    }
}

impl AudioSource for WavFileSource {
    fn produce_frame(&mut self) -> Result<Option<Vec<i16>>> {
        if self.exhausted {
            return Ok(None);
        }
        if let Some(clock) = self.clock.as_mut() {
            clock.wait();
        }

        let frame_len = self.format.frame_len();
        let mut frame = Vec::with_capacity(frame_len);
        for sample in self.reader.samples::<i16>().take(frame_len) {
            frame.push(sample.context("Failed to read WAV sample")?);
        }

        if frame.is_empty() {
            self.exhausted = true;
            debug!("WAV input exhausted");
            return Ok(None);
        }
        if frame.len() < frame_len {
            self.exhausted = true;
            frame.resize(frame_len, 0);
        }
        Ok(Some(frame))
    }
}

/// Sine tone generator, useful when no input file is given
pub struct ToneSource {
    format: AudioFormat,
    frequency: f32,
    amplitude: f32,
    phase: f32,
    clock: Option<FrameClock>,
}

impl ToneSource {
    pub fn new(format: AudioFormat, frequency: f32) -> Self {
        Self {
            format,
            frequency,
            amplitude: 0.25,
            phase: 0.0,
            clock: Some(FrameClock::new(format.frame_duration())),
        }
    }

    pub fn unpaced(mut self) -> Self {
        self.clock = None;
        self
    }
}

impl AudioSource for ToneSource {
    fn produce_frame(&mut self) -> Result<Option<Vec<i16>>> {
        if let Some(clock) = self.clock.as_mut() {
            clock.wait();
        }

        let step = TAU * self.frequency / self.format.sample_rate as f32;
        let channels = self.format.channels as usize;
        let mut frame = Vec::with_capacity(self.format.frame_len());
        for _ in 0..self.format.samples_per_channel() {
            let sample = (self.phase.sin() * self.amplitude * i16::MAX as f32) as i16;
            frame.extend(std::iter::repeat_n(sample, channels));
            self.phase = (self.phase + step) % TAU;
        }
        Ok(Some(frame))
    }
}

/// Writes received audio to a WAV file
pub struct WavFileSink {
    writer: Option<WavWriter<BufWriter<File>>>,
    frames_written: u64,
}

impl WavFileSink {
    pub fn create(path: impl AsRef<Path>, format: AudioFormat) -> Result<Self> {
        let path = path.as_ref();
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec)
            .with_context(|| format!("Failed to create WAV output {:?}", path))?;
        info!("Recording received audio to {:?}", path);
        Ok(Self { writer: Some(writer), frames_written: 0 })
    }
}

impl AudioSink for WavFileSink {
    fn consume_frame(&mut self, frame: &[i16]) -> Result<()> {
        let writer = self.writer.as_mut()
            .ok_or_else(|| anyhow!("WAV output already finalized"))?;
        for &sample in frame {
            writer.write_sample(sample)?;
        }
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().context("Failed to finalize WAV output")?;
            info!("WAV output finalized ({} frames)", self.frames_written);
        }
        Ok(())
    }
}

/// Discards everything it is given
#[derive(Debug, Default)]
pub struct NullSink {
    pub frames: u64,
}

impl AudioSink for NullSink {
    fn consume_frame(&mut self, _frame: &[i16]) -> Result<()> {
        self.frames += 1;
        Ok(())
    }
}

/// Keeps received frames in memory behind a shared handle
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<Vec<i16>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Vec<i16>> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AudioSink for MemorySink {
    fn consume_frame(&mut self, frame: &[i16]) -> Result<()> {
        self.frames.lock()
            .map_err(|_| anyhow!("memory sink poisoned"))?
            .push(frame.to_vec());
        Ok(())
    }
}
