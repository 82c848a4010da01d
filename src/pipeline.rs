//! Per-call audio pipeline: capture, send, receive and paced playout.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::{AudioFormat, AudioSink, AudioSource};
use crate::codec::AudioCodec;
use crate::crypto::CryptoSession;
use crate::error::SessionError;
use crate::jitter_buffer::{JitterBuffer, JitterBufferConfig, JitterBufferStats, Playout};
use crate::pacing::{IntervalPacer, Pacer};
use crate::transport::{AudioTransport, TransportStats};

/// How long teardown waits for each task before aborting it
const TASK_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Compressed frames queued between the capture thread and the send task
const SEND_QUEUE_DEPTH: usize = 8;

/// Everything needed to start media once keys are installed
#[derive(Debug)]
pub struct MediaParams {
    pub remote_media: SocketAddr,
    pub crypto: CryptoSession,
}

/// Media side of a call as seen by the session controller
#[async_trait]
pub trait MediaEngine: Send {
    /// Acquire the local data endpoint; called on entry to Connecting
    async fn bind(&mut self, ip: IpAddr) -> Result<SocketAddr, SessionError>;

    /// Start exchanging audio with the peer
    async fn start(&mut self, params: MediaParams) -> Result<(), SessionError>;

    /// Stop all media tasks and release the endpoint. Idempotent.
    async fn stop(&mut self);

    fn stats(&self) -> Option<PipelineStats> {
        None
    }
}

/// Devices and codecs driving one call
pub struct MediaDevices {
    pub source: Box<dyn AudioSource>,
    pub sink: Box<dyn AudioSink>,
    pub encoder: Box<dyn AudioCodec>,
    pub decoder: Box<dyn AudioCodec>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub transport: TransportStats,
    pub jitter: Option<JitterBufferStats>,
    pub frames_captured: u64,
    pub frames_played: u64,
    pub frames_concealed: u64,
}

#[derive(Debug, Default)]
struct PipelineCounters {
    frames_captured: AtomicU64,
    frames_played: AtomicU64,
    frames_concealed: AtomicU64,
}

/// Running tasks of one active call
pub struct AudioPipeline {
    transport: Arc<AudioTransport>,
    counters: Arc<PipelineCounters>,
    shutdown_tx: watch::Sender<bool>,
    stopped: Arc<AtomicBool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl AudioPipeline {
    pub fn start(transport: Arc<AudioTransport>, devices: MediaDevices, pacer: Box<dyn Pacer>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stopped = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(PipelineCounters::default());
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(SEND_QUEUE_DEPTH);

        let MediaDevices { source, sink, encoder, decoder } = devices;

        let recv_task = tokio::spawn(transport.clone().recv_loop(shutdown_rx.clone()));

        let capture_task = {
            let stopped = stopped.clone();
            let counters = counters.clone();
            tokio::task::spawn_blocking(move || {
                capture_loop(source, encoder, frame_tx, stopped, counters)
            })
        };

        let send_task = tokio::spawn(send_loop(transport.clone(), frame_rx, shutdown_rx.clone()));

        let playout_task = tokio::spawn(playout_loop(
            transport.jitter_buffer(),
            pacer,
            decoder,
            sink,
            counters.clone(),
            shutdown_rx,
        ));

        info!("Audio pipeline started towards {}", transport.remote_addr());

        Self {
            transport,
            counters,
            shutdown_tx,
            stopped,
            tasks: vec![
                ("receive", recv_task),
                ("capture", capture_task),
                ("send", send_task),
                ("playout", playout_task),
            ],
        }
    }

    pub fn stats(&self) -> PipelineStats {
        let jitter = self.transport.jitter_buffer().lock().ok().map(|b| b.stats());
        PipelineStats {
            transport: self.transport.stats(),
            jitter,
            frames_captured: self.counters.frames_captured.load(Ordering::Relaxed),
            frames_played: self.counters.frames_played.load(Ordering::Relaxed),
            frames_concealed: self.counters.frames_concealed.load(Ordering::Relaxed),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Signal every task to stop, then join them with a bounded wait
    pub async fn shutdown(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        for (name, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!("Audio {} task finished", name),
                Ok(Err(e)) => warn!("Audio {} task ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("Audio {} task did not stop in time, aborting", name);
                    handle.abort();
                }
            }
        }

        let stats = self.stats();
        info!("Audio pipeline stopped: sent={} received={} played={} concealed={}",
              stats.transport.datagrams_sent, stats.transport.accepted,
              stats.frames_played, stats.frames_concealed);
    }
}

fn capture_loop(
    mut source: Box<dyn AudioSource>,
    mut encoder: Box<dyn AudioCodec>,
    frames: mpsc::Sender<Vec<u8>>,
    stopped: Arc<AtomicBool>,
    counters: Arc<PipelineCounters>,
) {
    while !stopped.load(Ordering::SeqCst) {
        let pcm = match source.produce_frame() {
            Ok(Some(pcm)) => pcm,
            Ok(None) => {
                info!("Audio source exhausted");
                break;
            }
            Err(e) => {
                error!("Audio capture failed: {:#}", e);
                break;
            }
        };
        counters.frames_captured.fetch_add(1, Ordering::Relaxed);

        let payload = match encoder.compress(&pcm) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Dropping captured frame: {}", e);
                continue;
            }
        };
        if frames.blocking_send(payload).is_err() {
            break;
        }
    }
    debug!("Capture loop stopped");
}

async fn send_loop(
    transport: Arc<AudioTransport>,
    mut frames: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(payload) => {
                    if let Err(e) = transport.send_frame(&payload).await {
                        debug!("{:#}", e);
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("Send loop stopped");
}

async fn playout_loop(
    buffer: Arc<std::sync::Mutex<JitterBuffer>>,
    mut pacer: Box<dyn Pacer>,
    mut decoder: Box<dyn AudioCodec>,
    mut sink: Box<dyn AudioSink>,
    counters: Arc<PipelineCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let now = tokio::select! {
            tick = pacer.tick() => match tick {
                Some(now) => now,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let playout = match buffer.lock() {
            Ok(mut buffer) => buffer.dequeue(now),
            Err(_) => {
                error!("Jitter buffer poisoned, stopping playout");
                break;
            }
        };

        let frame = match playout {
            Some(Playout::Frame(entry)) => match decoder.decompress(&entry.payload) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Concealing undecodable frame {}: {}", entry.sequence_number, e);
                    counters.frames_concealed.fetch_add(1, Ordering::Relaxed);
                    conceal(decoder.as_mut())
                }
            },
            Some(Playout::Gap { sequence_number, count }) => {
                debug!("Concealing {} lost frame(s) from {}", count, sequence_number);
                counters.frames_concealed.fetch_add(1, Ordering::Relaxed);
                conceal(decoder.as_mut())
            }
            None => continue,
        };

        if frame.is_empty() {
            continue;
        }
        if let Err(e) = sink.consume_frame(&frame) {
            error!("Audio playback failed: {:#}", e);
            break;
        }
        counters.frames_played.fetch_add(1, Ordering::Relaxed);
    }

    if let Err(e) = sink.finish() {
        warn!("Failed to finish audio output: {:#}", e);
    }
    debug!("Playout loop stopped");
}

fn conceal(decoder: &mut dyn AudioCodec) -> Vec<i16> {
    decoder.conceal().unwrap_or_else(|e| {
        debug!("Concealment failed: {}", e);
        Vec::new()
    })
}

pub type PacerFactory = Box<dyn FnMut(Duration) -> Box<dyn Pacer> + Send>;

/// Media engine over a UDP socket per call
pub struct UdpMediaEngine {
    format: AudioFormat,
    jitter_config: JitterBufferConfig,
    devices: Option<MediaDevices>,
    socket: Option<UdpSocket>,
    pacer_factory: PacerFactory,
    pipeline: Option<AudioPipeline>,
    final_stats: Option<PipelineStats>,
}

impl UdpMediaEngine {
    pub fn new(format: AudioFormat, jitter_config: JitterBufferConfig, devices: MediaDevices) -> Self {
        let jitter_config = JitterBufferConfig {
            clock_rate: format.sample_rate,
            ..jitter_config
        };
        Self {
            format,
            jitter_config,
            devices: Some(devices),
            socket: None,
            pacer_factory: Box::new(|period| Box::new(IntervalPacer::new(period))),
            pipeline: None,
            final_stats: None,
        }
    }

    /// Replace the real-time playout clock
    pub fn with_pacer_factory(mut self, factory: PacerFactory) -> Self {
        self.pacer_factory = factory;
        self
    }

    pub fn is_running(&self) -> bool {
        self.pipeline.is_some()
    }

}

#[async_trait]
impl MediaEngine for UdpMediaEngine {
    async fn bind(&mut self, ip: IpAddr) -> Result<SocketAddr, SessionError> {
        let socket = UdpSocket::bind(SocketAddr::new(ip, 0)).await
            .map_err(|e| SessionError::Resource(format!("media socket: {}", e)))?;
        let local = socket.local_addr()
            .map_err(|e| SessionError::Resource(format!("media socket: {}", e)))?;
        debug!("Media endpoint bound on {}", local);
        self.socket = Some(socket);
        Ok(local)
    }

    async fn start(&mut self, params: MediaParams) -> Result<(), SessionError> {
        let socket = self.socket.take()
            .ok_or_else(|| SessionError::Resource("media endpoint not bound".into()))?;
        let devices = self.devices.take()
            .ok_or_else(|| SessionError::Resource("audio devices already in use".into()))?;
        let buffer = JitterBuffer::new(self.jitter_config)
            .map_err(|e| SessionError::Resource(format!("jitter buffer: {:#}", e)))?;

        let transport = Arc::new(AudioTransport::new(
            socket,
            params.remote_media,
            params.crypto,
            buffer,
            self.format.samples_per_channel() as u32,
        ));
        let pacer = (self.pacer_factory)(self.format.frame_duration());
        self.pipeline = Some(AudioPipeline::start(transport, devices, pacer));
        Ok(())
    }

    async fn stop(&mut self) {
        self.socket = None;
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.shutdown().await;
            self.final_stats = Some(pipeline.stats());
        }
    }

    /// Live statistics while running, final statistics after stop
    fn stats(&self) -> Option<PipelineStats> {
        self.pipeline.as_ref().map(|p| p.stats()).or_else(|| self.final_stats.clone())
    }
}
