#[cfg(test)]
mod transport_tests {
    use crate::crypto::{ChaChaCipher, CryptoError, CryptoSession, IdentityKey, KeyAgreement, Role};
    use crate::error::ErrorClass;
    use crate::jitter_buffer::{JitterBuffer, JitterBufferConfig, Playout, Rejection};
    use crate::packet::{self, DecodeError};
    use crate::transport::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::net::UdpSocket;
    use tokio::sync::watch;
    use uuid::Uuid;

    const FRAME_SAMPLES: u32 = 960;

    fn crypto_pair() -> (CryptoSession, CryptoSession) {
        let session_id = Uuid::new_v4();
        let mut alice = KeyAgreement::new(IdentityKey::generate(), Role::Initiator, session_id);
        let mut bob = KeyAgreement::new(IdentityKey::generate(), Role::Responder, session_id);
        let (a, b) = (alice.local_payload(), bob.local_payload());
        (
            alice.complete(&b, Arc::new(ChaChaCipher)).unwrap(),
            bob.complete(&a, Arc::new(ChaChaCipher)).unwrap(),
        )
    }

    /// Two transports on loopback addressed at each other
    async fn transport_pair() -> (AudioTransport, AudioTransport) {
        let alice_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bob_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let alice_addr = alice_socket.local_addr().unwrap();
        let bob_addr = bob_socket.local_addr().unwrap();
        let (alice_crypto, bob_crypto) = crypto_pair();

        let buffer = || JitterBuffer::new(JitterBufferConfig::default()).unwrap();
        (
            AudioTransport::new(alice_socket, bob_addr, alice_crypto, buffer(), FRAME_SAMPLES),
            AudioTransport::new(bob_socket, alice_addr, bob_crypto, buffer(), FRAME_SAMPLES),
        )
    }

    fn play_all(transport: &AudioTransport, now: Instant) -> Vec<Playout> {
        let buffer = transport.jitter_buffer();
        let mut buffer = buffer.lock().unwrap();
        std::iter::from_fn(|| buffer.dequeue(now)).collect()
    }

    #[tokio::test]
    async fn test_packetized_frames_reach_jitter_buffer() {
        let (alice, bob) = transport_pair().await;
        let from = alice.local_addr().unwrap();
        let t0 = Instant::now();

        for i in 0..3u8 {
            let datagram = alice.packetize(&[i; 10]).unwrap();
            bob.handle_datagram(&datagram, from, t0).unwrap();
        }
        assert_eq!(bob.jitter_buffer().lock().unwrap().len(), 3);

        let played = play_all(&bob, t0 + Duration::from_millis(200));
        let frames: Vec<_> = played.iter()
            .map(|p| match p {
                Playout::Frame(entry) => entry.clone(),
                Playout::Gap { .. } => panic!("unexpected gap"),
            })
            .collect();
        assert_eq!(frames.len(), 3);
        for (i, entry) in frames.iter().enumerate() {
            assert_eq!(&entry.payload[..], &[i as u8; 10]);
        }
        assert_eq!(frames[1].sequence_number, frames[0].sequence_number.wrapping_add(1));
        assert_eq!(frames[1].timestamp, frames[0].timestamp.wrapping_add(FRAME_SAMPLES));

        let stats = bob.stats();
        assert_eq!(stats.datagrams_received, 3);
        assert_eq!(stats.accepted, 3);
    }

    #[tokio::test]
    async fn test_datagram_carries_ciphertext() {
        let (alice, _bob) = transport_pair().await;
        let frame = [0x55u8; 32];
        let datagram = alice.packetize(&frame).unwrap();

        let decoded = packet::decode(&datagram).unwrap();
        assert_eq!(decoded.payload.len(), frame.len() + 16);
        assert_ne!(&decoded.payload[..frame.len()], &frame[..]);
    }

    #[tokio::test]
    async fn test_corrupted_datagram_never_played() {
        let (alice, bob) = transport_pair().await;
        let from = alice.local_addr().unwrap();
        let t0 = Instant::now();

        let first = alice.packetize(b"first").unwrap();
        bob.handle_datagram(&first, from, t0).unwrap();
        play_all(&bob, t0 + Duration::from_millis(100));
        let played_ts = bob.jitter_buffer().lock().unwrap().last_played_timestamp();
        assert!(played_ts.is_some());

        let mut corrupted = alice.packetize(b"second").unwrap().to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;

        let result = bob.handle_datagram(&corrupted, from, t0 + Duration::from_millis(110));
        assert_eq!(result, Err(TransportDrop::Auth(CryptoError::Auth)));
        assert_eq!(result.unwrap_err().class(), ErrorClass::Auth);

        assert!(bob.jitter_buffer().lock().unwrap().is_empty());
        assert_eq!(bob.jitter_buffer().lock().unwrap().last_played_timestamp(), played_ts);
        assert_eq!(bob.stats().auth_failures, 1);
        assert_eq!(bob.stats().accepted, 1);
    }

    #[tokio::test]
    async fn test_foreign_and_truncated_datagrams_dropped() {
        let (alice, bob) = transport_pair().await;
        let from = alice.local_addr().unwrap();
        let stranger = SocketAddr::from(([127, 0, 0, 1], 9));
        let now = Instant::now();

        let datagram = alice.packetize(b"audio").unwrap();
        assert_eq!(
            bob.handle_datagram(&datagram, stranger, now),
            Err(TransportDrop::ForeignSource(stranger))
        );
        assert_eq!(
            bob.handle_datagram(&[1, 2, 3], from, now),
            Err(TransportDrop::Decode(DecodeError::Truncated { len: 3 }))
        );

        let stats = bob.stats();
        assert_eq!(stats.datagrams_received, 2);
        assert_eq!(stats.foreign_source, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.accepted, 0);
        assert!(bob.jitter_buffer().lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_datagram_rejected() {
        let (alice, bob) = transport_pair().await;
        let from = alice.local_addr().unwrap();
        let now = Instant::now();

        let datagram = alice.packetize(b"once").unwrap();
        bob.handle_datagram(&datagram, from, now).unwrap();
        let again = bob.handle_datagram(&datagram, from, now);

        assert_eq!(again, Err(TransportDrop::Rejected(Rejection::Duplicate)));
        assert_eq!(again.unwrap_err().class(), ErrorClass::TransientNetworkLoss);
        assert_eq!(bob.stats().rejected, 1);
        assert_eq!(bob.jitter_buffer().lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_frames_cross_loopback_socket() {
        let (alice, bob) = transport_pair().await;
        let bob = Arc::new(bob);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let receiver = tokio::spawn(bob.clone().recv_loop(shutdown_rx));

        for i in 0..5u8 {
            alice.send_frame(&[i; 20]).await.unwrap();
        }
        assert_eq!(alice.stats().datagrams_sent, 5);

        let deadline = Instant::now() + Duration::from_secs(5);
        while bob.stats().accepted < 5 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bob.stats().accepted, 5);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), receiver).await.unwrap().unwrap();
    }
}
