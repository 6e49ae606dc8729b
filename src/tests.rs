use crate::connection::{Connection, Role};
use crate::error::{Error, ProtocolError};
use crate::frame::{FrameHeader, OpCode};
use crate::handshake::{accept_with_options, client_with_options, AcceptOptions, ConnectOptions};
use crate::mask::apply_mask;
use crate::message::{Message, MessageType};
use crate::stream::ByteStream;
use crate::{CloseCode, CompressionOptions};
use bytes::BytesMut;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{timeout, Duration};

const TICK: Duration = Duration::from_secs(10);

async fn pair(
    server_options: AcceptOptions,
    client_options: ConnectOptions,
) -> (Connection<DuplexStream>, Connection<DuplexStream>) {
    let (client_stream, server_stream) = duplex(256 * 1024);
    let server = tokio::spawn(accept_with_options(server_stream, server_options));
    let client = client_with_options(client_stream, "ws://example.com/chat", client_options)
        .await
        .unwrap();
    let server = server.await.unwrap().unwrap();
    (client, server)
}

async fn plain_pair() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
    pair(AcceptOptions::default(), ConnectOptions::default()).await
}

async fn compressed_pair(
    options: CompressionOptions,
) -> (Connection<DuplexStream>, Connection<DuplexStream>) {
    pair(
        AcceptOptions {
            compression: Some(options),
            ..Default::default()
        },
        ConnectOptions {
            compression: Some(options),
            ..Default::default()
        },
    )
    .await
}

/// Writes one frame the way a client would, masked with a fixed key.
async fn write_client_frame(stream: &mut DuplexStream, fin: bool, opcode: OpCode, payload: &[u8]) {
    let mut header = FrameHeader::new(fin, false, opcode, payload.len() as u64);
    header.masked = true;
    header.mask_key = [0x11, 0x22, 0x33, 0x44];

    let mut buf = BytesMut::new();
    header.encode(&mut buf);
    let mut masked = payload.to_vec();
    apply_mask(header.mask_key, &mut masked, 0);
    buf.extend_from_slice(&masked);
    stream.write_all(&buf).await.unwrap();
}

fn close_code(error: Error) -> CloseCode {
    match error {
        Error::ConnectionClosed(frame) => frame.code,
        other => panic!("expected a close error, got {other:?}"),
    }
}

#[tokio::test]
async fn echo_round_trip() {
    let (client, server) = plain_pair().await;

    client.write("hello").await.unwrap();
    let received = server.read().await.unwrap();
    assert_eq!(received, Message::Text("hello".into()));

    server.write(received).await.unwrap();
    assert_eq!(
        client.read().await.unwrap(),
        Message::Text("hello".into())
    );

    client.write(vec![0u8, 1, 2, 255]).await.unwrap();
    assert_eq!(
        server.read().await.unwrap(),
        Message::Binary(vec![0, 1, 2, 255])
    );
}

#[tokio::test]
async fn empty_messages_round_trip() {
    let (client, server) = plain_pair().await;

    client.write(Message::Binary(Vec::new())).await.unwrap();
    assert_eq!(server.read().await.unwrap(), Message::Binary(Vec::new()));

    server.write(Message::Text(String::new())).await.unwrap();
    assert_eq!(client.read().await.unwrap(), Message::Text(String::new()));
}

#[tokio::test]
async fn streaming_writer_fragments_reassemble() {
    let (client, server) = plain_pair().await;

    let mut writer = client.writer(MessageType::Text).await.unwrap();
    writer.write(b"Hel").await.unwrap();
    writer.write(b"lo").await.unwrap();
    writer.finish().await.unwrap();

    assert_eq!(
        server.read().await.unwrap(),
        Message::Text("Hello".into())
    );
}

#[tokio::test]
async fn raw_fragmented_text_reassembles() {
    let (near, mut far) = duplex(64 * 1024);
    let server = Connection::new(near, Role::Server, None, None, Vec::new());

    write_client_frame(&mut far, false, OpCode::Text, b"Hel").await;
    write_client_frame(&mut far, true, OpCode::Continue, b"lo").await;

    assert_eq!(
        server.read().await.unwrap(),
        Message::Text("Hello".into())
    );
}

#[tokio::test]
async fn streaming_reader_delivers_chunks() {
    let (client, server) = plain_pair().await;

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let send = payload.clone();
    let client_task = tokio::spawn(async move { client.write(send).await });

    let (kind, mut reader) = server.reader().await.unwrap();
    assert_eq!(kind, MessageType::Binary);
    let mut received = Vec::new();
    let mut chunk = [0u8; 257];
    loop {
        let n = reader.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(received, payload);
    client_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn large_messages_use_the_wide_length_form() {
    let (client, server) = plain_pair().await;
    client.set_read_limit(1 << 20);
    server.set_read_limit(1 << 20);

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
    let expected = payload.clone();

    let echo = tokio::spawn(async move {
        let message = server.read().await.unwrap();
        server.write(message).await.unwrap();
    });

    client.write(payload).await.unwrap();
    assert_eq!(
        client.read().await.unwrap(),
        Message::Binary(expected)
    );
    echo.await.unwrap();
}

#[tokio::test]
async fn subprotocol_negotiation_picks_the_servers_first_match() {
    let (client, server) = pair(
        AcceptOptions {
            subprotocols: vec!["chat".into(), "echo".into()],
            ..Default::default()
        },
        ConnectOptions {
            subprotocols: vec!["echo".into(), "chat".into()],
            ..Default::default()
        },
    )
    .await;

    assert_eq!(client.subprotocol(), Some("chat"));
    assert_eq!(server.subprotocol(), Some("chat"));
}

#[tokio::test]
async fn compression_round_trips_in_every_takeover_mode() {
    let modes = [
        (false, false),
        (true, false),
        (false, true),
        (true, true),
    ];
    for (client_reset, server_reset) in modes {
        let options = CompressionOptions {
            client_no_context_takeover: client_reset,
            server_no_context_takeover: server_reset,
        };
        let (client, server) = compressed_pair(options).await;
        assert_eq!(client.compression(), Some(options));
        assert_eq!(server.compression(), Some(options));

        // Repeated content exercises the shared window when takeover is on.
        for round in 0..3 {
            let text = format!("compressible compressible compressible {round}");
            client.write(text.as_str()).await.unwrap();
            assert_eq!(
                server.read().await.unwrap(),
                Message::Text(text.clone()),
                "client to server, round {round}, modes {client_reset}/{server_reset}"
            );

            server.write(text.as_str()).await.unwrap();
            assert_eq!(
                client.read().await.unwrap(),
                Message::Text(text),
                "server to client, round {round}, modes {client_reset}/{server_reset}"
            );
        }

        // Fragmented compressed messages reassemble too.
        let mut writer = client.writer(MessageType::Binary).await.unwrap();
        writer.write(b"first piece ").await.unwrap();
        writer.write(b"second piece").await.unwrap();
        writer.finish().await.unwrap();
        assert_eq!(
            server.read().await.unwrap(),
            Message::Binary(b"first piece second piece".to_vec())
        );
    }
}

#[tokio::test]
async fn ping_correlation_resolves_concurrent_pings() {
    let (client, server) = plain_pair().await;

    // Pongs only get noticed while each side is reading.
    let server_pump = tokio::spawn(async move { while server.read().await.is_ok() {} });
    let client_pump = {
        let client = client.clone();
        tokio::spawn(async move { while client.read().await.is_ok() {} })
    };

    let (first, second) = timeout(TICK, async {
        tokio::join!(
            client.ping_with(b"abc".to_vec()),
            client.ping_with(b"xyz".to_vec())
        )
    })
    .await
    .unwrap();
    first.unwrap();
    second.unwrap();

    client.close(CloseCode::NORMAL, "").await.unwrap();
    let _ = timeout(TICK, async {
        let _ = client_pump.await;
        let _ = server_pump.await;
    })
    .await;
}

#[tokio::test]
async fn received_ping_is_answered_with_identical_pong() {
    let (near, mut far) = duplex(64 * 1024);
    let server = Connection::new(near, Role::Server, None, None, Vec::new());

    let pump = tokio::spawn(async move { server.read().await });

    write_client_frame(&mut far, true, OpCode::Ping, b"abc").await;

    // The reply arrives unmasked, as all server frames do.
    let header = FrameHeader::read_from(&mut far, Role::Client, false)
        .await
        .unwrap();
    assert_eq!(header.opcode, OpCode::Pong);
    assert!(header.fin);
    assert_eq!(header.payload_len, 3);
    let mut payload = [0u8; 3];
    far.read_exact(&mut payload).await.unwrap();
    assert_eq!(&payload, b"abc");

    // And the parked reader is still waiting for a data message.
    write_client_frame(&mut far, true, OpCode::Text, b"after").await;
    assert_eq!(
        pump.await.unwrap().unwrap(),
        Message::Text("after".into())
    );
}

#[tokio::test]
async fn unsolicited_pong_is_ignored() {
    let (near, mut far) = duplex(64 * 1024);
    let server = Connection::new(near, Role::Server, None, None, Vec::new());

    write_client_frame(&mut far, true, OpCode::Pong, b"nobody asked").await;
    write_client_frame(&mut far, true, OpCode::Text, b"payload").await;

    assert_eq!(
        server.read().await.unwrap(),
        Message::Text("payload".into())
    );
}

#[tokio::test]
async fn ping_interleaves_inside_a_fragmented_write() {
    let (client, server) = plain_pair().await;

    let server_task = tokio::spawn(async move { server.read().await });
    let client_pump = {
        let client = client.clone();
        tokio::spawn(async move {
            let _ = client.read().await;
        })
    };

    let mut writer = client.writer(MessageType::Binary).await.unwrap();
    writer.write(b"part one ").await.unwrap();

    // The ping goes out between the fragments and must resolve while the
    // message writer is still open.
    timeout(TICK, client.ping_with(b"tick".to_vec()))
        .await
        .unwrap()
        .unwrap();

    writer.write(b"part two").await.unwrap();
    writer.finish().await.unwrap();

    assert_eq!(
        timeout(TICK, server_task).await.unwrap().unwrap().unwrap(),
        Message::Binary(b"part one part two".to_vec())
    );
    client_pump.abort();
}

#[tokio::test]
async fn read_limit_boundary() {
    let (client, server) = plain_pair().await;
    server.set_read_limit(8);

    client.write(vec![7u8; 8]).await.unwrap();
    assert_eq!(server.read().await.unwrap(), Message::Binary(vec![7u8; 8]));

    client.write(vec![7u8; 9]).await.unwrap();
    assert!(matches!(
        server.read().await,
        Err(Error::MessageTooBig(8))
    ));

    // The peer sees the 1009 close.
    let error = timeout(TICK, client.read()).await.unwrap().unwrap_err();
    assert_eq!(close_code(error), CloseCode::MESSAGE_TOO_BIG);
}

#[tokio::test]
async fn fragments_count_against_the_same_limit() {
    let (client, server) = plain_pair().await;
    server.set_read_limit(10);

    let mut writer = client.writer(MessageType::Binary).await.unwrap();
    writer.write(&[1u8; 6]).await.unwrap();
    writer.write(&[2u8; 6]).await.unwrap();
    let reader_result = server.read().await;
    assert!(matches!(reader_result, Err(Error::MessageTooBig(10))));
    drop(writer);
}

#[tokio::test]
async fn close_race_completes_on_both_sides() {
    let (client, server) = plain_pair().await;

    let (client_result, server_result) = timeout(TICK, async {
        tokio::join!(
            client.close(CloseCode::NORMAL, "done"),
            server.close(CloseCode::NORMAL, "done")
        )
    })
    .await
    .unwrap();
    client_result.unwrap();
    server_result.unwrap();

    // Both connections are down and report the close.
    assert!(matches!(
        client.read().await,
        Err(Error::ConnectionClosed(_))
    ));
    assert!(matches!(
        server.write("nope").await,
        Err(Error::ConnectionClosed(_))
    ));
}

#[tokio::test]
async fn close_unblocks_a_parked_reader() {
    let (client, server) = plain_pair().await;

    let parked = tokio::spawn(async move { client.read().await });
    // Give the reader a moment to park on the transport.
    tokio::time::sleep(Duration::from_millis(20)).await;

    timeout(TICK, server.close(CloseCode::NORMAL, "bye"))
        .await
        .unwrap()
        .unwrap();

    let error = timeout(TICK, parked).await.unwrap().unwrap().unwrap_err();
    match error {
        Error::ConnectionClosed(frame) => {
            assert_eq!(frame.code, CloseCode::NORMAL);
            assert_eq!(frame.reason, "bye");
        }
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn close_is_idempotent() {
    let (client, server) = plain_pair().await;
    let pump = tokio::spawn(async move { server.read().await });

    timeout(TICK, client.close(CloseCode::NORMAL, "first"))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        client.close(CloseCode::NORMAL, "second").await,
        Err(Error::ConnectionClosed(_))
    ));
    let _ = timeout(TICK, pump).await;
}

#[tokio::test]
async fn close_reason_boundary() {
    let (client, server) = plain_pair().await;
    let pump = tokio::spawn(async move { server.read().await });

    // 124 bytes is rejected locally and the connection stays usable.
    assert!(matches!(
        client.close(CloseCode::NORMAL, &"x".repeat(124)).await,
        Err(Error::CloseReasonTooLong)
    ));

    // Exactly 123 goes through.
    timeout(TICK, client.close(CloseCode::NORMAL, &"x".repeat(123)))
        .await
        .unwrap()
        .unwrap();
    let error = timeout(TICK, pump).await.unwrap().unwrap().unwrap_err();
    match error {
        Error::ConnectionClosed(frame) => assert_eq!(frame.reason.len(), 123),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn unsendable_close_code_goes_out_as_internal_error() {
    let (client, server) = plain_pair().await;
    let pump = tokio::spawn(async move { server.read().await });

    timeout(TICK, client.close(CloseCode::new(1006), ""))
        .await
        .unwrap()
        .unwrap();
    let error = timeout(TICK, pump).await.unwrap().unwrap().unwrap_err();
    assert_eq!(close_code(error), CloseCode::INTERNAL_ERROR);
}

#[tokio::test]
async fn close_read_allows_writes_and_polices_data() {
    let (client, server) = plain_pair().await;

    let drain = server.close_read();

    // Writing is still allowed after reads are closed.
    server.write("still talking").await.unwrap();
    assert_eq!(
        client.read().await.unwrap(),
        Message::Text("still talking".into())
    );

    // A data message from the peer is a policy violation.
    client.write("not allowed").await.unwrap();
    let error = timeout(TICK, client.read()).await.unwrap().unwrap_err();
    assert_eq!(close_code(error), CloseCode::POLICY_VIOLATION);

    timeout(TICK, drain).await.unwrap().unwrap();
    assert!(matches!(server.read().await, Err(Error::PolicyViolation)));
}

#[tokio::test]
async fn reader_not_drained_is_reported() {
    let (client, server) = plain_pair().await;

    client.write(vec![1u8; 64]).await.unwrap();
    client.write(vec![2u8; 64]).await.unwrap();

    let (_, reader) = server.reader().await.unwrap();
    drop(reader);

    assert!(matches!(server.reader().await, Err(Error::ReaderNotDrained)));
}

#[tokio::test]
async fn dropped_read_mid_frame_closes_the_connection() {
    let (client, server) = plain_pair().await;

    // Nothing arrives, so the read is dropped while parked on the header.
    let result = timeout(Duration::from_millis(50), server.read()).await;
    assert!(result.is_err());

    assert!(matches!(server.read().await, Err(Error::Cancelled)));
    assert!(matches!(server.write("late").await, Err(Error::Cancelled)));
    drop(client);
}

#[tokio::test]
async fn invalid_utf8_in_text_is_surfaced() {
    let (near, mut far) = duplex(64 * 1024);
    let server = Connection::new(near, Role::Server, None, None, Vec::new());

    write_client_frame(&mut far, true, OpCode::Text, &[0xff, 0xfe, 0xfd]).await;
    assert!(matches!(
        server.read().await,
        Err(Error::FromUtf8Error { .. })
    ));
}

#[tokio::test]
async fn unexpected_continuation_fails_with_protocol_error() {
    let (near, mut far) = duplex(64 * 1024);
    let server = Connection::new(near, Role::Server, None, None, Vec::new());

    write_client_frame(&mut far, true, OpCode::Continue, b"stray").await;
    assert!(matches!(
        server.read().await,
        Err(Error::Protocol(ProtocolError::InvalidContinuationFrame))
    ));

    // The failure was announced with a 1002 close frame.
    let header = FrameHeader::read_from(&mut far, Role::Client, false)
        .await
        .unwrap();
    assert_eq!(header.opcode, OpCode::Close);
    let mut payload = vec![0u8; header.payload_len as usize];
    far.read_exact(&mut payload).await.unwrap();
    assert_eq!(
        u16::from_be_bytes([payload[0], payload[1]]),
        CloseCode::PROTOCOL_ERROR.as_u16()
    );
}

#[tokio::test]
async fn byte_stream_adapter_round_trips() {
    let (client, server) = plain_pair().await;

    let echo = tokio::spawn(async move {
        while let Ok(message) = server.read().await {
            if server.write(message).await.is_err() {
                break;
            }
        }
    });

    let mut stream = ByteStream::new(client);
    stream.write_all(b"through the pipe").await.unwrap();
    let mut buf = [0u8; 16];
    timeout(TICK, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"through the pipe");

    timeout(TICK, stream.shutdown()).await.unwrap().unwrap();
    let _ = timeout(TICK, echo).await;
}

#[tokio::test]
async fn byte_stream_rejects_text_messages() {
    let (client, server) = plain_pair().await;

    server.write("words").await.unwrap();

    let mut stream = ByteStream::new(client);
    let mut buf = [0u8; 8];
    let error = timeout(TICK, stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(error.kind(), std::io::ErrorKind::Other);
}

#[tokio::test]
async fn origin_mismatch_is_rejected_with_403() {
    let (mut raw_client, server_stream) = duplex(64 * 1024);
    let accept_task = tokio::spawn(accept_with_options(
        server_stream,
        AcceptOptions::default(),
    ));

    let request = "GET /chat HTTP/1.1\r\n\
                   Host: example.com\r\n\
                   Connection: Upgrade\r\n\
                   Upgrade: websocket\r\n\
                   Sec-WebSocket-Version: 13\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                   Origin: http://evil.com\r\n\r\n";
    raw_client.write_all(request.as_bytes()).await.unwrap();

    let mut response = vec![0u8; 64];
    let n = raw_client.read(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response[..n]).to_string();
    assert!(response.starts_with("HTTP/1.1 403"), "{response}");

    assert!(matches!(
        accept_task.await.unwrap(),
        Err(Error::OriginNotAllowed(origin)) if origin == "http://evil.com"
    ));
}

#[tokio::test]
async fn matching_origin_is_accepted() {
    let (client_stream, server_stream) = duplex(64 * 1024);
    let accept_task = tokio::spawn(accept_with_options(
        server_stream,
        AcceptOptions::default(),
    ));
    let client = client_with_options(
        client_stream,
        "ws://example.com/chat",
        ConnectOptions {
            origin: Some("http://example.com".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let server = accept_task.await.unwrap().unwrap();

    client.write("hi").await.unwrap();
    assert_eq!(server.read().await.unwrap(), Message::Text("hi".into()));
}

#[tokio::test]
async fn unsupported_version_is_rejected_with_400() {
    let (mut raw_client, server_stream) = duplex(64 * 1024);
    let accept_task = tokio::spawn(accept_with_options(
        server_stream,
        AcceptOptions::default(),
    ));

    let request = "GET / HTTP/1.1\r\n\
                   Host: example.com\r\n\
                   Connection: Upgrade\r\n\
                   Upgrade: websocket\r\n\
                   Sec-WebSocket-Version: 8\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
    raw_client.write_all(request.as_bytes()).await.unwrap();

    let mut response = vec![0u8; 256];
    let n = raw_client.read(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response[..n]).to_string();
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(response.contains("Sec-WebSocket-Version: 13"), "{response}");

    assert!(matches!(
        accept_task.await.unwrap(),
        Err(Error::UnsupportedWebsocketVersion)
    ));
}
