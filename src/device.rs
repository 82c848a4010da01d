use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use log::{debug, error, info};
use ringbuf::{HeapCons, HeapProd, HeapRb, traits::*};

use crate::audio::{AudioFormat, AudioSink, AudioSource};

/// Frames of slack between the device callback and the call pipeline
const RING_BUFFER_FRAMES: usize = 16;
const CAPTURE_POLL: Duration = Duration::from_millis(2);
/// A capture device that delivers nothing for this long is treated as gone
const CAPTURE_STALL: Duration = Duration::from_secs(2);

fn stream_config(format: AudioFormat) -> StreamConfig {
    StreamConfig {
        channels: format.channels,
        sample_rate: SampleRate(format.sample_rate),
        buffer_size: BufferSize::Default,
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

/// Input callback body; returns how many samples did not fit
fn capture_samples(data: &[f32], producer: &mut HeapProd<i16>) -> usize {
    let pushed = producer.push_iter(data.iter().map(|&s| to_i16(s)));
    data.len() - pushed
}

/// Output callback body; fills with silence what the ring cannot supply and
/// returns how many samples were missing
fn render_samples(consumer: &mut HeapCons<i16>, data: &mut [f32]) -> usize {
    let mut missing = 0;
    for slot in data.iter_mut() {
        *slot = match consumer.try_pop() {
            Some(sample) => to_f32(sample),
            None => {
                missing += 1;
                0.0
            }
        };
    }
    missing
}

/// One whole frame, once enough samples are buffered
fn take_frame(consumer: &mut HeapCons<i16>, frame_len: usize) -> Option<Vec<i16>> {
    if consumer.occupied_len() < frame_len {
        return None;
    }
    let mut frame = vec![0i16; frame_len];
    consumer.pop_slice(&mut frame);
    Some(frame)
}

/// Owns a playing cpal stream on a dedicated thread. cpal streams may not
/// leave the thread that built them; dropping this stops the stream.
struct StreamThread {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    failed: Arc<AtomicBool>,
}

impl StreamThread {
    fn spawn<F>(name: &str, build: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) -> Result<Stream> + Send + 'static,
    {
        let failed = Arc::new(AtomicBool::new(false));
        let stream_failed = failed.clone();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build(stream_failed).and_then(|stream| {
                    stream.play().context("Failed to start audio stream")?;
                    Ok(stream)
                }) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Returns once the owner drops the sender
                let _ = stop_rx.recv();
                drop(stream);
            })
            .context("Failed to spawn audio device thread")?;

        ready_rx.recv().context("Audio device thread exited before starting")??;
        Ok(Self { stop: Some(stop_tx), thread: Some(thread), failed })
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Audio device thread panicked");
            }
        }
    }
}

/// Default microphone, delivered as whole frames
pub struct CpalSource {
    samples: HeapCons<i16>,
    frame_len: usize,
    stream: StreamThread,
}

impl CpalSource {
    pub fn open(format: AudioFormat) -> Result<Self> {
        format.validate()?;
        let frame_len = format.frame_len();
        let (mut producer, consumer) = HeapRb::<i16>::new(frame_len * RING_BUFFER_FRAMES).split();

        let stream = StreamThread::spawn("parley-capture", move |failed| {
            let device = cpal::default_host().default_input_device()
                .ok_or_else(|| anyhow!("No default input device available"))?;
            info!("Input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

            let stream = device.build_input_stream(
                &stream_config(format),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Buffer full: the pipeline is behind, newest samples are dropped
                    capture_samples(data, &mut producer);
                },
                move |err| {
                    error!("Audio input stream error: {}", err);
                    failed.store(true, Ordering::Relaxed);
                },
                None,
            )?;
            Ok(stream)
        })?;

        Ok(Self { samples: consumer, frame_len, stream })
    }
}

impl AudioSource for CpalSource {
    fn produce_frame(&mut self) -> Result<Option<Vec<i16>>> {
        let started = Instant::now();
        loop {
            if self.stream.failed() {
                bail!("Audio input device failed");
            }
            if let Some(frame) = take_frame(&mut self.samples, self.frame_len) {
                return Ok(Some(frame));
            }
            if started.elapsed() > CAPTURE_STALL {
                bail!("Audio input device delivered no samples for {:?}", CAPTURE_STALL);
            }
            thread::sleep(CAPTURE_POLL);
        }
    }
}

/// Default speaker; frames queue in a ring drained by the device callback
pub struct CpalSink {
    samples: HeapProd<i16>,
    stream: StreamThread,
    dropped: u64,
}

impl CpalSink {
    pub fn open(format: AudioFormat) -> Result<Self> {
        format.validate()?;
        let (producer, mut consumer) = HeapRb::<i16>::new(format.frame_len() * RING_BUFFER_FRAMES).split();

        let stream = StreamThread::spawn("parley-playback", move |failed| {
            let device = cpal::default_host().default_output_device()
                .ok_or_else(|| anyhow!("No default output device available"))?;
            info!("Output device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

            let stream = device.build_output_stream(
                &stream_config(format),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    render_samples(&mut consumer, data);
                },
                move |err| {
                    error!("Audio output stream error: {}", err);
                    failed.store(true, Ordering::Relaxed);
                },
                None,
            )?;
            Ok(stream)
        })?;

        Ok(Self { samples: producer, stream, dropped: 0 })
    }
}

impl AudioSink for CpalSink {
    fn consume_frame(&mut self, frame: &[i16]) -> Result<()> {
        if self.stream.failed() {
            bail!("Audio output device failed");
        }
        let pushed = self.samples.push_slice(frame);
        if pushed < frame.len() {
            self.dropped += (frame.len() - pushed) as u64;
            debug!("Playback ring full, dropped {} samples", frame.len() - pushed);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.dropped > 0 {
            info!("Playback dropped {} samples in total", self.dropped);
        }
        Ok(())
    }
}
