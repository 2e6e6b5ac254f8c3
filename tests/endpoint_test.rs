//! Endpoint-layer integration tests over real localhost sockets.

use someip::codec::{Message, CLIENT_COOKIE};
use someip::endpoint::{
    Endpoint, EndpointEvent, EndpointOptions, Peer, TcpClientEndpoint, TcpServerEndpoint,
    UdpEndpoint,
};
use someip::types::MessageType;
use someip::Error;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn options(max: usize, flush_ms: u64) -> EndpointOptions {
    EndpointOptions {
        max_message_size: max,
        queue_limit: 64,
        flush_timeout: Duration::from_millis(flush_ms),
        connect_timeout: Duration::from_millis(50),
        max_connect_timeout: Duration::from_millis(800),
        magic_cookies: false,
        command_framing: false,
    }
}

async fn read_exact_with_deadline(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("read deadline")
        .expect("read");
    buf
}

#[tokio::test]
async fn batching_waits_for_flush_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();
    let (events, _rx) = mpsc::channel(16);
    let endpoint = TcpClientEndpoint::start(remote, options(100, 300), events);
    assert_eq!(endpoint.peer(), Peer::Ip(remote));
    let (mut accepted, _) = listener.accept().await.unwrap();

    // 60 + 60 > 100: the first 60 become a queued packet, the second 60
    // stay in the packetizer until the flush timer fires.
    endpoint.send(&[0xAA; 60], false).unwrap();
    endpoint.send(&[0xBB; 60], false).unwrap();

    let first = read_exact_with_deadline(&mut accepted, 60).await;
    assert_eq!(first, vec![0xAA; 60]);

    // The second part only arrives after the flush timeout.
    let mut probe = [0u8; 1];
    assert!(
        timeout(Duration::from_millis(100), accepted.read_exact(&mut probe)).await.is_err(),
        "second batch must wait for the flush timer"
    );
    let second = read_exact_with_deadline(&mut accepted, 60).await;
    assert_eq!(second, vec![0xBB; 60]);
    endpoint.stop();
}

#[tokio::test]
async fn explicit_flush_writes_one_combined_packet() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();
    let (events, _rx) = mpsc::channel(16);
    let endpoint = TcpClientEndpoint::start(remote, options(100, 5000), events);
    let (mut accepted, _) = listener.accept().await.unwrap();

    endpoint.send(&[0x11; 30], false).unwrap();
    endpoint.send(&[0x22; 30], true).unwrap();

    // Both halves arrive promptly, well before the 5 s flush timeout.
    let bytes = read_exact_with_deadline(&mut accepted, 60).await;
    assert_eq!(&bytes[..30], &[0x11; 30]);
    assert_eq!(&bytes[30..], &[0x22; 30]);
    endpoint.stop();
}

#[tokio::test]
async fn wire_order_equals_submission_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();
    let (events, _rx) = mpsc::channel(16);
    let endpoint = TcpClientEndpoint::start(remote, options(64, 20), events);
    let (mut accepted, _) = listener.accept().await.unwrap();

    let mut expected = Vec::new();
    for i in 0..50u8 {
        let chunk = vec![i; (i as usize % 40) + 1];
        expected.extend_from_slice(&chunk);
        // Mixed flush decisions; order must be preserved regardless.
        endpoint.send(&chunk, i % 3 == 0).unwrap();
    }
    endpoint.send(&[0xFF], true).unwrap();
    expected.push(0xFF);

    let bytes = read_exact_with_deadline(&mut accepted, expected.len()).await;
    assert_eq!(bytes, expected);
    endpoint.stop();
}

#[tokio::test]
async fn reconnect_after_initial_failure() {
    // Reserve a port with no listener behind it.
    let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = holder.local_addr().unwrap();
    drop(holder);

    let (events, mut rx) = mpsc::channel(16);
    let endpoint = TcpClientEndpoint::start(remote, options(100, 100), events);

    // Let a few backoff cycles fail, then appear.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!endpoint.is_connected());
    let listener = TcpListener::bind(remote).await.unwrap();

    let event = timeout(Duration::from_secs(5), rx.recv()).await.expect("event").unwrap();
    assert!(matches!(event, EndpointEvent::Connected { .. }));
    let _ = listener.accept().await.unwrap();
    assert!(endpoint.is_connected());
    endpoint.stop();
}

#[tokio::test]
async fn reconnect_after_peer_drops() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();
    let (events, mut rx) = mpsc::channel(16);
    let endpoint = TcpClientEndpoint::start(remote, options(100, 100), events);

    let (accepted, _) = listener.accept().await.unwrap();
    let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, EndpointEvent::Connected { .. }));

    drop(accepted);
    let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, EndpointEvent::Disconnected { .. }));

    // The endpoint dials again on its own.
    let (_accepted, _) = timeout(Duration::from_secs(5), listener.accept()).await.unwrap().unwrap();
    let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, EndpointEvent::Connected { .. }));
    endpoint.stop();
}

#[tokio::test]
async fn queued_sends_survive_reconnect() {
    let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = holder.local_addr().unwrap();
    drop(holder);

    let (events, _rx) = mpsc::channel(16);
    let endpoint = TcpClientEndpoint::start(remote, options(100, 100), events);
    endpoint.send(b"queued-before-connect", true).unwrap();

    let listener = TcpListener::bind(remote).await.unwrap();
    let (mut accepted, _) = listener.accept().await.unwrap();
    let bytes = read_exact_with_deadline(&mut accepted, 21).await;
    assert_eq!(&bytes, b"queued-before-connect");
    endpoint.stop();
}

#[tokio::test]
async fn queue_full_fails_newest_send() {
    let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = holder.local_addr().unwrap();
    drop(holder);

    let (events, _rx) = mpsc::channel(16);
    let mut opts = options(100, 1000);
    opts.queue_limit = 4;
    let endpoint = TcpClientEndpoint::start(remote, opts, events);

    let mut last = Ok(());
    for _ in 0..8 {
        last = endpoint.send(&[0u8; 10], true);
        if last.is_err() {
            break;
        }
    }
    assert!(matches!(last, Err(Error::QueueFull(4))));
    endpoint.stop();
}

#[tokio::test]
async fn oversized_send_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (events, _rx) = mpsc::channel(16);
    let endpoint = TcpClientEndpoint::start(listener.local_addr().unwrap(), options(100, 100), events);
    assert!(matches!(
        endpoint.send(&[0u8; 101], true),
        Err(Error::MessageTooLarge { size: 101, limit: 100 })
    ));
    endpoint.stop();
}

#[tokio::test]
async fn server_delivers_frames_and_replies() {
    let (events, mut rx) = mpsc::channel(64);
    let server = TcpServerEndpoint::bind("127.0.0.1:0".parse().unwrap(), options(1400, 100), events)
        .await
        .unwrap();
    let local = server.local_addr().unwrap();

    let mut client = TcpStream::connect(local).await.unwrap();
    let request = Message::new(0x1234, 0x0001, MessageType::Request, vec![1, 2, 3]).encode();
    client.write_all(&request).await.unwrap();

    let (peer, bytes) = loop {
        match timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap() {
            EndpointEvent::Frame { peer, bytes, .. } => break (peer, bytes),
            _ => continue,
        }
    };
    assert_eq!(bytes, request);
    assert_eq!(server.connected_peers(), vec![peer]);

    // Reply over the per-peer send path.
    let response = Message::new(0x1234, 0x0001, MessageType::Response, vec![9]).encode();
    server.send_to(peer, &response, true).unwrap();
    let mut buf = vec![0u8; response.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(buf, response);
    server.stop();
}

#[tokio::test]
async fn magic_cookie_resync_on_server() {
    let (events, mut rx) = mpsc::channel(64);
    let opts = options(1400, 100).with_magic_cookies(true);
    let server =
        TcpServerEndpoint::bind("127.0.0.1:0".parse().unwrap(), opts, events).await.unwrap();
    let local = server.local_addr().unwrap();

    let valid = Message::new(0x1234, 0x0001, MessageType::Request, vec![0xAB; 24]).encode();
    assert_eq!(valid.len(), 40);

    let mut client = TcpStream::connect(local).await.unwrap();
    let mut stream_bytes = vec![0x55u8; 37]; // garbage with an absurd length field
    stream_bytes.extend_from_slice(&CLIENT_COOKIE);
    stream_bytes.extend_from_slice(&valid);
    client.write_all(&stream_bytes).await.unwrap();

    // Exactly the valid message comes up; garbage and cookie are gone.
    let bytes = loop {
        match timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap() {
            EndpointEvent::Frame { bytes, .. } => break bytes,
            _ => continue,
        }
    };
    assert_eq!(bytes, valid);
    assert!(rx.try_recv().is_err());
    server.stop();
}

#[tokio::test]
async fn udp_flush_emits_single_datagram() {
    let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote = receiver.local_addr().unwrap();
    let (events, _rx) = mpsc::channel(16);
    let endpoint = UdpEndpoint::client(remote, options(1400, 5000), events).unwrap();

    let a = Message::new(0x1234, 0x0001, MessageType::RequestNoReturn, vec![1]).encode();
    let b = Message::new(0x1234, 0x0002, MessageType::RequestNoReturn, vec![2, 3]).encode();
    endpoint.send(&a, false).unwrap();
    endpoint.send(&b, true).unwrap();

    // One datagram carrying both messages back to back.
    let mut buf = vec![0u8; 2048];
    let (n, _) = timeout(Duration::from_secs(5), receiver.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, a.len() + b.len());
    assert_eq!(&buf[..a.len()], a.as_slice());
    assert_eq!(&buf[a.len()..n], b.as_slice());
    endpoint.stop();
}

#[tokio::test]
async fn udp_receive_splits_datagram_into_frames() {
    let (events, mut rx) = mpsc::channel(16);
    let endpoint =
        UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), options(1400, 100), events).unwrap();
    let local = endpoint.local_addr();

    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let a = Message::new(0x1111, 0x0001, MessageType::RequestNoReturn, vec![7; 5]).encode();
    let b = Message::new(0x2222, 0x0002, MessageType::Notification, vec![8; 9]).encode();
    let mut dgram = a.clone();
    dgram.extend_from_slice(&b);
    sender.send_to(&dgram, local).await.unwrap();

    let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    match (first, second) {
        (
            EndpointEvent::Frame { bytes: f1, peer: Peer::Ip(p1), .. },
            EndpointEvent::Frame { bytes: f2, peer: Peer::Ip(p2), .. },
        ) => {
            assert_eq!(f1, a);
            assert_eq!(f2, b);
            assert_eq!(p1, sender.local_addr().unwrap());
            assert_eq!(p1, p2);
        }
        other => panic!("expected two frames, got {other:?}"),
    }
    endpoint.stop();
}

#[cfg(unix)]
#[tokio::test]
async fn local_stream_command_framing() {
    use someip::codec::{CommandHeader, SendCommand};
    use someip::endpoint::LocalServerEndpoint;
    use someip::types::{Command, COMMAND_HEADER_SIZE};

    let dir = std::env::temp_dir().join(format!("someip-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("routing.sock");

    let (events, mut rx) = mpsc::channel(64);
    let opts = {
        let mut o = options(65536, 100);
        o.command_framing = true;
        o
    };
    let server = LocalServerEndpoint::bind(&path, opts, events).unwrap();

    let mut client = tokio::net::UnixStream::connect(&path).await.unwrap();
    let inner = Message::new(0x1234, 0x0001, MessageType::Request, vec![5; 4]).encode();
    let frame = SendCommand { instance: 0x0001, flush: true, frame: inner.clone() }.encode(0x0042);
    client.write_all(&frame).await.unwrap();

    let bytes = loop {
        match timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap() {
            EndpointEvent::Frame { bytes, .. } => break bytes,
            _ => continue,
        }
    };
    let header = CommandHeader::decode(&bytes).unwrap();
    assert_eq!(header.command, Command::Send);
    assert_eq!(header.client, 0x0042);
    let send = SendCommand::decode(&bytes[COMMAND_HEADER_SIZE..]).unwrap();
    assert_eq!(send.frame, inner);

    server.stop();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn stop_clears_queue_and_halts() {
    let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote: SocketAddr = holder.local_addr().unwrap();
    drop(holder);

    let (events, _rx) = mpsc::channel(16);
    let endpoint = TcpClientEndpoint::start(remote, options(100, 100), events);
    endpoint.send(&[1u8; 10], true).unwrap();
    endpoint.stop();

    // A listener appearing afterwards must never see the cleared bytes.
    let listener = TcpListener::bind(remote).await.unwrap();
    let accepted = timeout(Duration::from_millis(500), listener.accept()).await;
    if let Ok(Ok((mut stream, _))) = accepted {
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_millis(300), stream.read(&mut buf)).await;
        match read {
            Ok(Ok(0)) | Err(_) => {}
            other => panic!("stopped endpoint leaked data: {other:?}"),
        }
    }
}
