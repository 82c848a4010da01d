#[cfg(test)]
mod signaling_tests {
    use crate::signaling::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use uuid::Uuid;

    fn media(port: u16) -> MediaDescription {
        MediaDescription {
            media_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            codec: "pcm".into(),
            sample_rate: 48000,
            channels: 1,
            frame_duration_ms: 20,
        }
    }

    async fn next(channel: &mut SignalingChannel) -> SignalingEvent {
        tokio::time::timeout(Duration::from_secs(5), channel.recv())
            .await
            .expect("timed out waiting for signaling event")
    }

    #[test]
    fn test_message_wire_shape() {
        let session_id = Uuid::new_v4();
        let message = SignalingMessage::new(session_id, "alice", MessageBody::Bye {
            reason: "done".into(),
            ack: false,
        });

        let json: serde_json::Value = serde_json::to_value(&message).unwrap();
        assert_eq!(json["session_id"], session_id.to_string());
        assert_eq!(json["sender"], "alice");
        assert_eq!(json["body"]["kind"], "bye");
        assert_eq!(json["body"]["ack"], false);
        assert!(json.get("recipient").is_none());

        let addressed = message.clone().to(Some("bob".into()));
        let json = serde_json::to_value(&addressed).unwrap();
        assert_eq!(json["recipient"], "bob");

        let decoded: SignalingMessage = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, addressed);
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let bodies = [
            MessageBody::Hello { display_name: None },
            MessageBody::Offer { media: media(1) },
            MessageBody::Answer { media: media(2) },
            MessageBody::Bye { reason: String::new(), ack: true },
            MessageBody::Reject { reason: "busy".into() },
            MessageBody::Error { reason: "x".into() },
        ];
        for body in bodies {
            let json = serde_json::to_value(&body).unwrap();
            assert_eq!(json["kind"], body.kind());
        }
    }

    #[tokio::test]
    async fn test_frames_round_trip_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let offer = SignalingMessage::new(Uuid::new_v4(), "alice", MessageBody::Offer { media: media(4000) });

        write_frame(&mut client, &offer).await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(read_frame(&mut server).await.unwrap(), Some(offer));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();

        assert!(matches!(
            read_frame(&mut server).await,
            Err(SignalingError::FrameTooLarge(len)) if len == MAX_FRAME_LEN + 1
        ));
    }

    #[tokio::test]
    async fn test_channel_preserves_order() {
        let (a, b) = tokio::io::duplex(4096);
        let alice = SignalingChannel::from_stream(a);
        let mut bob = SignalingChannel::from_stream(b);
        let session_id = Uuid::new_v4();

        alice.send(SignalingMessage::new(session_id, "alice", MessageBody::Offer { media: media(4000) })).unwrap();
        alice.send(SignalingMessage::new(session_id, "alice", MessageBody::Bye { reason: "r".into(), ack: false })).unwrap();

        let SignalingEvent::Message(first) = next(&mut bob).await else { panic!("expected message") };
        let SignalingEvent::Message(second) = next(&mut bob).await else { panic!("expected message") };
        assert_eq!(first.body.kind(), "offer");
        assert_eq!(second.body.kind(), "bye");
    }

    #[tokio::test]
    async fn test_malformed_frame_reported_and_channel_survives() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let mut channel = SignalingChannel::from_stream(b);

        let garbage = b"{\"not\": \"a message\"}";
        raw.write_u32(garbage.len() as u32).await.unwrap();
        raw.write_all(garbage).await.unwrap();
        let hello = SignalingMessage::new(Uuid::nil(), "bob", MessageBody::Hello { display_name: None });
        write_frame(&mut raw, &hello).await.unwrap();

        assert!(matches!(next(&mut channel).await, SignalingEvent::Invalid(_)));
        assert_eq!(next(&mut channel).await, SignalingEvent::Message(hello));
    }

    #[tokio::test]
    async fn test_closed_reported_once() {
        let (a, b) = tokio::io::duplex(1024);
        let mut alice = SignalingChannel::from_stream(a);
        let mut bob = SignalingChannel::from_stream(b);

        alice.close();
        assert!(!alice.is_open());
        assert!(alice.send(SignalingMessage::new(Uuid::nil(), "alice", MessageBody::Error { reason: "x".into() })).is_err());

        assert_eq!(next(&mut bob).await, SignalingEvent::Closed);
        let again = tokio::time::timeout(Duration::from_millis(50), bob.recv()).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_close_flushes_queued_messages() {
        let (a, b) = tokio::io::duplex(4096);
        let mut alice = SignalingChannel::from_stream(a);
        let mut bob = SignalingChannel::from_stream(b);
        let bye = SignalingMessage::new(Uuid::new_v4(), "alice", MessageBody::Bye { reason: "done".into(), ack: false });

        alice.send(bye.clone()).unwrap();
        alice.close();

        assert_eq!(next(&mut bob).await, SignalingEvent::Message(bye));
        assert_eq!(next(&mut bob).await, SignalingEvent::Closed);
    }

    #[tokio::test]
    async fn test_tcp_channel_addresses() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(SignalingChannel::connect(addr), listener.accept());
        let client = client.unwrap();
        let (stream, _) = accepted.unwrap();
        let server = SignalingChannel::from_tcp(stream);

        assert_eq!(client.peer_addr(), Some(addr));
        assert_eq!(server.local_addr(), Some(addr));
        assert!(client.is_open());
    }
}
