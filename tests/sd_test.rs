//! Service-discovery integration tests.
//!
//! The engine is driven over unicast: a plain UDP socket plays the
//! remote peer, sending crafted SD datagrams to the engine's socket and
//! reading its unicast answers. The engine's own multicast emissions
//! are irrelevant here (the phase schedules are covered by unit tests).

use someip::codec::Message;
use someip::endpoint::EndpointManager;
use someip::routing::Router;
use someip::sd::{Entry, EntryType, L4Proto, SdCommand, SdEngine, SdMessage, SdOption};
use someip::types::{MessageType, MAX_MESSAGE_SIZE_UNRELIABLE};
use someip::Config;
use serde_json::json;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// The engine ignores frames from its own unicast address, so the fake
/// peer must not share it. 127.0.0.2 stays on the loopback net.
const OUR_UNICAST: &str = "127.0.0.2";

fn config() -> Arc<Config> {
    Arc::new(
        Config::from_tree(&json!({
            "unicast": OUR_UNICAST,
            "services": [
                {
                    "service": "0x1234", "instance": "0x0001",
                    "unreliable": 41000,
                    "events": ["0x8001"],
                    "eventgroups": [
                        { "eventgroup": "0x0005", "events": ["0x8001"] }
                    ]
                }
            ],
            "service-discovery": {
                "enabled": true,
                "port": 0,
                "initial-delay-min": 0,
                "initial-delay-max": 0,
                "repetitions-base-delay": 10,
                "repetitions-max": 3,
                "ttl": 5,
                "cyclic-offer-delay": 200,
                "request-response-delay": 20
            }
        }))
        .unwrap(),
    )
}

struct Harness {
    router: Arc<Router>,
    sd: someip::SdHandle,
    peer: UdpSocket,
    engine_addr: SocketAddr,
    session: u16,
}

impl Harness {
    async fn new() -> Self {
        let config = config();
        let (events, _rx) = mpsc::channel(64);
        let manager = Arc::new(EndpointManager::new(events));
        let router = Arc::new(Router::new(Arc::clone(&config), Arc::clone(&manager)));
        let sd = SdEngine::spawn(config, Arc::clone(&router), manager).unwrap();
        let engine_addr = SocketAddr::new("127.0.0.2".parse().unwrap(), sd.local_addr().port());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self { router, sd, peer, engine_addr, session: 0 }
    }

    /// Send entries to the engine as one SD datagram from the peer.
    async fn send_sd(&mut self, entries: Vec<Entry>) {
        self.session += 1;
        let mut message = SdMessage::new(true, true);
        message.entries = entries;
        let wire = message.to_someip(self.session).encode();
        self.peer.send_to(&wire, self.engine_addr).await.unwrap();
    }

    /// Send with full control over flags and session (reboot tests).
    async fn send_sd_raw(&self, entries: Vec<Entry>, reboot: bool, session: u16) {
        let mut message = SdMessage::new(reboot, true);
        message.entries = entries;
        let wire = message.to_someip(session).encode();
        self.peer.send_to(&wire, self.engine_addr).await.unwrap();
    }

    /// Await one SD message unicast back to the peer socket.
    async fn recv_sd(&self) -> SdMessage {
        let mut buf = vec![0u8; 2048];
        let (n, _) = timeout(Duration::from_secs(5), self.peer.recv_from(&mut buf))
            .await
            .expect("sd answer deadline")
            .unwrap();
        let message = Message::decode(&buf[..n], MAX_MESSAGE_SIZE_UNRELIABLE as usize).unwrap();
        SdMessage::decode(&message.payload).unwrap()
    }

    fn peer_endpoint_option(&self) -> SdOption {
        let addr = match self.peer.local_addr().unwrap() {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => unreachable!("peer socket is v4"),
        };
        SdOption::ipv4(addr, L4Proto::Udp, self.peer.local_addr().unwrap().port())
    }
}

#[tokio::test]
async fn remote_offer_creates_route_and_ttl_expires_it() {
    let mut h = Harness::new().await;

    let offer = Entry::offer(0x5678, 0x0001, 1, 0, 1)
        .with_options(vec![SdOption::ipv4(Ipv4Addr::new(127, 0, 0, 1), L4Proto::Udp, 45000)]);
    h.send_sd(vec![offer]).await;

    // Route appears.
    timeout(Duration::from_secs(5), async {
        while !h.router.has_remote_service(0x5678, 0x0001) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("remote service should become reachable");

    // TTL 1 s without refresh: the route disappears.
    timeout(Duration::from_secs(5), async {
        while h.router.has_remote_service(0x5678, 0x0001) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("remote service should expire");
}

#[tokio::test]
async fn stop_offer_removes_route() {
    let mut h = Harness::new().await;

    let offer = Entry::offer(0x5678, 0x0001, 1, 0, 100)
        .with_options(vec![SdOption::ipv4(Ipv4Addr::new(127, 0, 0, 1), L4Proto::Udp, 45000)]);
    h.send_sd(vec![offer.clone()]).await;
    timeout(Duration::from_secs(5), async {
        while !h.router.has_remote_service(0x5678, 0x0001) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let mut stop = offer;
    stop.ttl = 0;
    stop.options.clear();
    h.send_sd(vec![stop]).await;
    timeout(Duration::from_secs(5), async {
        while h.router.has_remote_service(0x5678, 0x0001) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("stop offer should remove the route");
}

#[tokio::test]
async fn find_is_answered_with_offer() {
    let mut h = Harness::new().await;
    h.sd.send(SdCommand::OfferService { service: 0x1234, instance: 0x0001 }).await.unwrap();
    // Give the offer command time to land before asking.
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.send_sd(vec![Entry::find(0x1234, 0x0001, 0xFF, 5)]).await;

    let answer = h.recv_sd().await;
    let entry = answer
        .entries
        .iter()
        .find(|e| e.entry_type == EntryType::OfferService)
        .expect("find must be answered with an offer");
    assert_eq!(entry.service, 0x1234);
    assert_eq!(entry.instance, 0x0001);
    assert!(entry.ttl > 0);
    // The offer names our configured unreliable endpoint.
    assert!(entry.options.iter().any(|o| matches!(
        o,
        SdOption::Ipv4Endpoint { l4: L4Proto::Udp, port: 41000, .. }
    )));
}

#[tokio::test]
async fn subscribe_is_acked_and_fans_out() {
    let mut h = Harness::new().await;
    h.sd.send(SdCommand::OfferService { service: 0x1234, instance: 0x0001 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let option = h.peer_endpoint_option();
    let subscribe = Entry::subscribe(0x1234, 0x0001, 1, 0x0005, 1, 3).with_options(vec![option]);
    h.send_sd(vec![subscribe]).await;

    let answer = h.recv_sd().await;
    let ack = answer
        .entries
        .iter()
        .find(|e| e.entry_type == EntryType::SubscribeEventgroupAck)
        .expect("subscribe must be answered");
    assert_eq!(ack.ttl, 3, "ack grants the requested ttl");
    assert_eq!(ack.eventgroup(), Some(0x0005));

    // Fanout targets were installed before the ack went out, so a
    // single publish must reach the subscriber's endpoint.
    let event = Message::new(0x1234, 0x8001, MessageType::Notification, vec![0xEE; 4]);
    h.router.route(event, 0x0001, someip::routing::Origin::Local, true).unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, _) = timeout(Duration::from_secs(5), h.peer.recv_from(&mut buf))
        .await
        .expect("notification deadline")
        .unwrap();
    let received = Message::decode(&buf[..n], 1400).unwrap();
    assert_eq!(received.method, 0x8001);
    assert_eq!(received.payload, vec![0xEE; 4]);
}

#[tokio::test]
async fn subscriber_removed_after_ttl_without_refresh() {
    let mut h = Harness::new().await;
    h.sd.send(SdCommand::OfferService { service: 0x1234, instance: 0x0001 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let option = h.peer_endpoint_option();
    let subscribe = Entry::subscribe(0x1234, 0x0001, 1, 0x0005, 1, 1).with_options(vec![option]);
    h.send_sd(vec![subscribe]).await;
    let _ack = h.recv_sd().await;

    // Wait past the 1 s TTL, then publish: nothing may arrive.
    tokio::time::sleep(Duration::from_millis(2200)).await;
    let event = Message::new(0x1234, 0x8001, MessageType::Notification, vec![1]);
    let _ = h.router.route(event, 0x0001, someip::routing::Origin::Local, true);

    let mut buf = vec![0u8; 2048];
    assert!(
        timeout(Duration::from_millis(500), h.peer.recv_from(&mut buf)).await.is_err(),
        "expired subscriber must not be notified"
    );
}

#[tokio::test]
async fn unknown_eventgroup_is_nacked() {
    let mut h = Harness::new().await;
    h.sd.send(SdCommand::OfferService { service: 0x1234, instance: 0x0001 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let option = h.peer_endpoint_option();
    let subscribe = Entry::subscribe(0x1234, 0x0001, 1, 0x0099, 0, 3).with_options(vec![option]);
    h.send_sd(vec![subscribe]).await;

    let answer = h.recv_sd().await;
    let ack = answer
        .entries
        .iter()
        .find(|e| e.entry_type == EntryType::SubscribeEventgroupAck)
        .expect("subscribe must be answered");
    assert!(ack.is_nack(), "unknown eventgroup gets ttl-0 ack");
}

#[tokio::test]
async fn peer_reboot_invalidates_its_state() {
    let h = Harness::new().await;

    // Peer offers with an advancing session and the reboot flag set
    // (normal after its boot).
    let offer = Entry::offer(0x5678, 0x0001, 1, 0, 100)
        .with_options(vec![SdOption::ipv4(Ipv4Addr::new(127, 0, 0, 1), L4Proto::Udp, 45000)]);
    h.send_sd_raw(vec![offer.clone()], true, 40).await;
    timeout(Duration::from_secs(5), async {
        while !h.router.has_remote_service(0x5678, 0x0001) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    // Session regression with the flag still set: reboot. Everything
    // learned from the peer is dropped, then relearned from the new
    // offer in the same datagram.
    h.send_sd_raw(vec![Entry::offer(0x9999, 0x0001, 1, 0, 100)], true, 2).await;

    timeout(Duration::from_secs(5), async {
        while h.router.has_remote_service(0x5678, 0x0001) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("reboot must invalidate the peer's earlier offers");
}
