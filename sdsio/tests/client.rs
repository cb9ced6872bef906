mod common;

use std::time::{Duration, Instant};

use common::*;
use embedded_io_async::{Read, Write};
use sdsio::io::OpenMode;
use sdsio::{
    Command, Frame, KVBuffers, Mode, SdsioClient, SdsioConfig, SdsioError, SdsioStream,
    SocketTransport,
};
use serial_test::serial;

async fn read_to_eos(client: &SdsioClient, id: sdsio::StreamId) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 700];
    loop {
        match client.read(id, &mut buf).await {
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(SdsioError::Eos) => return out,
            Err(e) => panic!("read failed: {e}"),
        }
    }
}

#[tokio::test]
#[serial]
async fn test_round_trip_then_eos() {
    init_tracing();
    let (transport, _harness) = spawn_server();
    let client = SdsioClient::init(transport, client_config()).await.unwrap();
    let data = pattern(10_000, 7);

    let id = client.open("x", Mode::Write).await.unwrap();
    assert_eq!(client.write(id, &data).await, Ok(data.len()));
    client.close(id).await.unwrap();

    let id = client.open("x", Mode::Read).await.unwrap();
    assert_eq!(read_to_eos(&client, id).await, data);
    let mut buf = [0u8; 16];
    assert_eq!(client.read(id, &mut buf).await, Err(SdsioError::Eos));
    client.close(id).await.unwrap();

    client.uninit().await;
}

#[tokio::test]
#[serial]
async fn test_interleaved_streams_stay_separate() {
    init_tracing();
    let (transport, harness) = spawn_server();
    let client = SdsioClient::init(transport, client_config()).await.unwrap();

    let a = client.open("a", Mode::Write).await.unwrap();
    let b = client.open("b", Mode::Write).await.unwrap();
    let mut expect_a = Vec::new();
    let mut expect_b = Vec::new();
    for round in 0..50u8 {
        let chunk_a = vec![b'a'; 1 + usize::from(round)];
        let chunk_b = pattern(2000, round);
        client.write(a, &chunk_a).await.unwrap();
        client.write(b, &chunk_b).await.unwrap();
        expect_a.extend(chunk_a);
        expect_b.extend(chunk_b);
    }
    client.close(a).await.unwrap();
    client.close(b).await.unwrap();
    client.uninit().await;

    let server = harness.task.await.unwrap();
    let stored_a = server.kv().open("a.0.sds", OpenMode::Read).await.unwrap();
    let stored_b = server.kv().open("b.0.sds", OpenMode::Read).await.unwrap();
    assert_eq!(&*stored_a.lock(), expect_a.as_slice());
    assert_eq!(&*stored_b.lock(), expect_b.as_slice());
}

#[tokio::test]
#[serial]
async fn test_parameter_errors() {
    init_tracing();
    let (transport, _harness) = spawn_server();
    let client = SdsioClient::init(transport, client_config()).await.unwrap();

    assert_eq!(client.open("", Mode::Write).await, Err(SdsioError::Parameter));
    let id = client.open("p", Mode::Write).await.unwrap();
    assert_eq!(client.write(id, &[]).await, Err(SdsioError::Parameter));
    let mut buf = [0u8; 4];
    assert_eq!(client.read(id, &mut buf).await, Err(SdsioError::Parameter));
    client.close(id).await.unwrap();

    // Stale handle, even after the table entry is reused.
    assert_eq!(client.write(id, b"late").await, Err(SdsioError::Parameter));
    assert_eq!(client.close(id).await, Err(SdsioError::Parameter));
    let reused = client.open("p", Mode::Write).await.unwrap();
    assert_ne!(reused, id);
    assert_eq!(client.write(id, b"late").await, Err(SdsioError::Parameter));
    client.close(reused).await.unwrap();

    // Unknown stream on the server side.
    assert_eq!(client.open("missing", Mode::Read).await, Err(SdsioError::Error));
    client.uninit().await;
}

#[tokio::test]
#[serial]
async fn test_single_live_context() {
    init_tracing();
    let (first, _h1) = spawn_server();
    let (second, _h2) = spawn_server();
    let client = SdsioClient::init(first, client_config()).await.unwrap();
    assert!(matches!(
        SdsioClient::init(second, client_config()).await,
        Err(SdsioError::Error)
    ));
    client.uninit().await;
    client.uninit().await;

    let (third, _h3) = spawn_server();
    let again = SdsioClient::init(third, client_config()).await.unwrap();
    drop(again);
}

#[tokio::test]
#[serial]
async fn test_stream_table_limit() {
    init_tracing();
    let (transport, _harness) = spawn_server();
    let config = SdsioConfig {
        max_streams: 2,
        ..client_config()
    };
    let client = SdsioClient::init(transport, config).await.unwrap();
    let a = client.open("a", Mode::Write).await.unwrap();
    let _b = client.open("b", Mode::Write).await.unwrap();
    assert_eq!(client.open("c", Mode::Write).await, Err(SdsioError::Error));
    client.close(a).await.unwrap();
    client.open("c", Mode::Write).await.unwrap();
    client.uninit().await;
}

#[tokio::test]
#[serial]
async fn test_disconnected_peer_is_no_server() {
    init_tracing();
    let (transport, peer) = silent_peer();
    drop(peer);
    let client = SdsioClient::init(transport, client_config()).await.unwrap();
    let started = Instant::now();
    let result = client.open("x", Mode::Write).await;
    assert!(matches!(result, Err(SdsioError::NoServer | SdsioError::Timeout)));
    assert!(started.elapsed() < Duration::from_millis(500) + Duration::from_millis(250));
    client.uninit().await;
}

#[tokio::test]
#[serial]
async fn test_silent_peer_times_out() {
    init_tracing();
    let (transport, _peer) = silent_peer();
    let config = SdsioConfig {
        open_timeout_ms: 100,
        ..client_config()
    };
    let client = SdsioClient::init(transport, config).await.unwrap();
    let started = Instant::now();
    assert_eq!(client.open("x", Mode::Write).await, Err(SdsioError::Timeout));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(100) + Duration::from_millis(250));
    client.uninit().await;
}

#[tokio::test]
#[serial]
async fn test_unreachable_socket_is_no_server() {
    init_tracing();
    // Bind and drop to get a port with no listener.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let result = SdsioClient::init(SocketTransport::new(&addr.to_string()), client_config()).await;
    assert!(matches!(result, Err(SdsioError::NoServer)));
}

#[tokio::test]
#[serial]
async fn test_round_trip_over_tcp() {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut server = sdsio::SdsioServer::new(sdsio::MemKV::new(), MAX_PAYLOAD);
        server.serve(reader, writer).await.unwrap();
        server
    });

    let client = SdsioClient::init(SocketTransport::new(&addr.to_string()), client_config())
        .await
        .unwrap();
    let id = client.open("tcp", Mode::Write).await.unwrap();
    client.write(id, b"over the wire").await.unwrap();
    client.close(id).await.unwrap();
    client.uninit().await;

    let server = server.await.unwrap();
    let stored = server.kv().open("tcp.0.sds", OpenMode::Read).await.unwrap();
    assert_eq!(&*stored.lock(), b"over the wire");
}

#[tokio::test]
#[serial]
async fn test_read_timeout_poisons_stream() {
    init_tracing();
    let (transport, _peer) = spawn_peer(|frame| match frame.command {
        Command::Open => Some(Frame::open_reply(9, frame.argument)),
        Command::Close => Some(Frame::close_reply(frame.stream, 0)),
        _ => None,
    });
    let config = SdsioConfig {
        read_timeout_ms: 50,
        ..client_config()
    };
    let client = SdsioClient::init(transport, config).await.unwrap();
    let id = client.open("slow", Mode::Read).await.unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(client.read(id, &mut buf).await, Err(SdsioError::Timeout));
    assert_eq!(client.read(id, &mut buf).await, Err(SdsioError::Error));
    assert_eq!(client.close(id).await, Ok(()));
    client.uninit().await;
}

#[tokio::test]
#[serial]
async fn test_unexpected_frame_closes_only_that_stream() {
    init_tracing();
    let (transport, harness) = spawn_server();
    let client = SdsioClient::init(transport, client_config()).await.unwrap();
    let a = client.open("a", Mode::Write).await.unwrap();
    let b = client.open("b", Mode::Write).await.unwrap();

    // Server ids are handed out in open order, so "a" is 1.
    harness.inject.send(Frame::read_reply(1, 0, b"junk".to_vec())).unwrap();
    tokio::time::sleep(SHORT).await;

    assert_eq!(client.write(a, b"more").await, Err(SdsioError::Interface));
    assert_eq!(client.write(b, b"fine").await, Ok(4));
    assert_eq!(client.close(a).await, Err(SdsioError::Interface));
    assert_eq!(client.close(b).await, Ok(()));
    client.uninit().await;
}

#[tokio::test]
#[serial]
async fn test_embedded_io_adapter() {
    init_tracing();
    let (transport, _harness) = spawn_server();
    let client = SdsioClient::init(transport, client_config()).await.unwrap();

    let id = client.open("adapter", Mode::Write).await.unwrap();
    let mut writer = SdsioStream::new(&client, id);
    writer.write_all(b"through embedded-io").await.unwrap();
    writer.flush().await.unwrap();
    client.close(id).await.unwrap();

    let id = client.open("adapter", Mode::Read).await.unwrap();
    let mut reader = SdsioStream::new(&client, id);
    let mut out = Vec::new();
    let mut buf = [0u8; 5];
    loop {
        let n = reader.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    assert_eq!(out, b"through embedded-io");
    client.close(id).await.unwrap();
    client.uninit().await;
}

#[tokio::test]
#[serial]
async fn test_stalled_peer_bounds_every_call() {
    init_tracing();
    let (transport, peer) = stalling_peer(4096, 1);
    let config = SdsioConfig {
        tx_queue_depth: 4,
        ..client_config()
    };
    let client = SdsioClient::init(transport, config).await.unwrap();
    let a = client.open("a", Mode::Write).await.unwrap();

    // Fill the pipe, then the frame queue, until Write gives up.
    let chunk = pattern(MAX_PAYLOAD, 1);
    let mut result = Ok(0);
    for _ in 0..64 {
        result = client.write(a, &chunk).await;
        if result.is_err() {
            break;
        }
    }
    assert_eq!(result, Err(SdsioError::Timeout));

    let limit = Duration::from_millis(500) + Duration::from_millis(250);
    let started = Instant::now();
    assert_eq!(client.open("b", Mode::Write).await, Err(SdsioError::Timeout));
    assert!(started.elapsed() < limit);

    let started = Instant::now();
    assert_eq!(client.close(a).await, Err(SdsioError::Timeout));
    assert!(started.elapsed() < limit);
    assert_eq!(client.write(a, b"late").await, Err(SdsioError::Parameter));

    let started = Instant::now();
    client.uninit().await;
    assert!(started.elapsed() < limit);
    peer.abort();
}
