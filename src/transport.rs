use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::crypto::{CryptoError, CryptoSession};
use crate::error::ErrorClass;
use crate::jitter_buffer::{JitterBuffer, Rejection};
use crate::packet::{self, AudioPacket, DecodeError, MAX_DATAGRAM_LEN};

/// Why an incoming datagram never reached the jitter buffer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportDrop {
    #[error("datagram from unexpected source {0}")]
    ForeignSource(SocketAddr),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Auth(#[from] CryptoError),
    #[error("rejected by jitter buffer: {0}")]
    Rejected(#[from] Rejection),
}

impl TransportDrop {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportDrop::ForeignSource(_) | TransportDrop::Decode(_) => ErrorClass::Decode,
            TransportDrop::Auth(_) => ErrorClass::Auth,
            TransportDrop::Rejected(_) => ErrorClass::TransientNetworkLoss,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    datagrams_sent: AtomicU64,
    send_errors: AtomicU64,
    receive_errors: AtomicU64,
    datagrams_received: AtomicU64,
    accepted: AtomicU64,
    foreign_source: AtomicU64,
    malformed: AtomicU64,
    auth_failures: AtomicU64,
    rejected: AtomicU64,
}

const RECEIVE_BACKOFF_START: Duration = Duration::from_millis(5);
const RECEIVE_BACKOFF_MAX: Duration = Duration::from_millis(500);
const RECEIVE_ERROR_REPORT_EVERY: u32 = 100;

/// Pause and log throttling for consecutive socket receive errors
#[derive(Debug, Default)]
struct ReceiveBackoff {
    consecutive: u32,
}

impl ReceiveBackoff {
    /// Record an error; returns how long to pause and whether to log at warn level
    fn on_error(&mut self) -> (Duration, bool) {
        self.consecutive = self.consecutive.saturating_add(1);
        let doublings = (self.consecutive - 1).min(16);
        let pause = RECEIVE_BACKOFF_START
            .saturating_mul(1 << doublings)
            .min(RECEIVE_BACKOFF_MAX);
        let report = self.consecutive == 1 || self.consecutive % RECEIVE_ERROR_REPORT_EVERY == 0;
        (pause, report)
    }

    fn consecutive(&self) -> u32 {
        self.consecutive
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// Snapshot of transport counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub datagrams_sent: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
    pub datagrams_received: u64,
    pub accepted: u64,
    pub foreign_source: u64,
    pub malformed: u64,
    pub auth_failures: u64,
    pub rejected: u64,
}

struct SendState {
    sequence_number: u32,
    timestamp: u32,
}

/// Datagram endpoint of one active call
pub struct AudioTransport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    crypto: Mutex<CryptoSession>,
    buffer: Arc<Mutex<JitterBuffer>>,
    send_state: Mutex<SendState>,
    samples_per_frame: u32,
    counters: Counters,
}

impl AudioTransport {
    pub fn new(
        socket: UdpSocket,
        remote: SocketAddr,
        crypto: CryptoSession,
        buffer: JitterBuffer,
        samples_per_frame: u32,
    ) -> Self {
        // Start low in the sequence space so the first rollover is far away
        let send_state = SendState {
            sequence_number: rand::random::<u16>() as u32,
            timestamp: rand::random::<u32>(),
        };

        Self {
            socket: Arc::new(socket),
            remote,
            crypto: Mutex::new(crypto),
            buffer: Arc::new(Mutex::new(buffer)),
            send_state: Mutex::new(send_state),
            samples_per_frame,
            counters: Counters::default(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("Failed to read media socket address")
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn jitter_buffer(&self) -> Arc<Mutex<JitterBuffer>> {
        self.buffer.clone()
    }

    fn next_header(&self) -> Result<(u32, u32)> {
        let mut state = self.send_state.lock()
            .map_err(|_| anyhow!("send state poisoned"))?;
        let header = (state.sequence_number, state.timestamp);
        state.sequence_number = state.sequence_number.wrapping_add(1);
        state.timestamp = state.timestamp.wrapping_add(self.samples_per_frame);
        Ok(header)
    }

    /// Build the datagram for one compressed frame
    pub fn packetize(&self, frame: &[u8]) -> Result<bytes::Bytes> {
        let (sequence_number, timestamp) = self.next_header()?;
        let ciphertext = self.crypto.lock()
            .map_err(|_| anyhow!("crypto session poisoned"))?
            .encrypt(sequence_number, frame)?;
        Ok(packet::encode(&AudioPacket::new(sequence_number, timestamp, ciphertext)))
    }

    /// Encrypt, frame and transmit one compressed audio frame
    pub async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let datagram = self.packetize(frame)?;
        match self.socket.send_to(&datagram, self.remote).await {
            Ok(_) => {
                self.counters.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e).context("Failed to send audio datagram")
            }
        }
    }

    /// Validate one received datagram and hand it to the jitter buffer
    pub fn handle_datagram(
        &self,
        datagram: &[u8],
        from: SocketAddr,
        arrival_time: Instant,
    ) -> Result<(), TransportDrop> {
        self.counters.datagrams_received.fetch_add(1, Ordering::Relaxed);
        let result = self.admit(datagram, from, arrival_time);

        let counter = match &result {
            Ok(()) => &self.counters.accepted,
            Err(TransportDrop::ForeignSource(_)) => &self.counters.foreign_source,
            Err(TransportDrop::Decode(_)) => &self.counters.malformed,
            Err(TransportDrop::Auth(_)) => &self.counters.auth_failures,
            Err(TransportDrop::Rejected(_)) => &self.counters.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Err(ref reason) = result {
            debug!("Dropped datagram from {}: {}", from, reason);
        }
        result
    }

    fn admit(&self, datagram: &[u8], from: SocketAddr, arrival_time: Instant) -> Result<(), TransportDrop> {
        if from != self.remote {
            return Err(TransportDrop::ForeignSource(from));
        }

        let packet = packet::decode(datagram)?;
        let plaintext = {
            let mut crypto = self.crypto.lock()
                .map_err(|_| TransportDrop::Auth(CryptoError::Auth))?;
            crypto.decrypt(packet.sequence_number, &packet.payload)?
        };

        let mut buffer = self.buffer.lock()
            .map_err(|_| TransportDrop::Rejected(Rejection::Overflow))?;
        buffer.enqueue(
            AudioPacket::new(packet.sequence_number, packet.timestamp, plaintext),
            arrival_time,
        )?;
        Ok(())
    }

    /// Receive datagrams until shutdown is signalled
    pub async fn recv_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let mut backoff = ReceiveBackoff::default();
        info!("Audio receive loop started on {:?}", self.socket.local_addr().ok());

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        backoff.reset();
                        let _ = self.handle_datagram(&buf[..len], from, Instant::now());
                    }
                    Err(e) => {
                        // ICMP unreachable surfaces here on some platforms; keep going
                        self.counters.receive_errors.fetch_add(1, Ordering::Relaxed);
                        let (pause, report) = backoff.on_error();
                        if report {
                            warn!("Audio socket receive error ({} in a row): {}", backoff.consecutive(), e);
                        } else {
                            debug!("Audio socket receive error: {}", e);
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(pause) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        debug!("Audio receive loop stopped");
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            datagrams_sent: c.datagrams_sent.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            receive_errors: c.receive_errors.load(Ordering::Relaxed),
            datagrams_received: c.datagrams_received.load(Ordering::Relaxed),
            accepted: c.accepted.load(Ordering::Relaxed),
            foreign_source: c.foreign_source.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            auth_failures: c.auth_failures.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_backoff_grows_and_throttles_warnings() {
        let mut backoff = ReceiveBackoff::default();

        let (first, report) = backoff.on_error();
        assert_eq!(first, RECEIVE_BACKOFF_START);
        assert!(report);

        let (second, report) = backoff.on_error();
        assert_eq!(second, RECEIVE_BACKOFF_START * 2);
        assert!(!report);

        let mut warnings = 1;
        let mut pause = second;
        for _ in 2..1000 {
            let (next, report) = backoff.on_error();
            assert!(next >= pause);
            pause = next;
            warnings += report as u32;
        }
        assert_eq!(pause, RECEIVE_BACKOFF_MAX);
        assert_eq!(backoff.consecutive(), 1000);
        assert_eq!(warnings, 1 + 1000 / RECEIVE_ERROR_REPORT_EVERY);

        backoff.reset();
        assert_eq!(backoff.on_error(), (RECEIVE_BACKOFF_START, true));
    }
}
