mod common;

use parking_lot::Mutex;
use socks6::{
    Addr, Client, ClientConfig, Error, Filtering, OptionSet, ReplyCode, ServerConfig,
    Socks6Server, UdpMessage,
    stack_options::{Parity, PortParity, StackOption, StackOptionData, StackOptionInfo},
    udp_assoc::{IcmpBridge, IcmpReport},
    udp_message::UdpErrorCode,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::UdpSocket, sync::mpsc};

fn remote_option(data: StackOptionData) -> OptionSet {
    let mut options = OptionSet::new();
    options.add(StackOption::new(true, false, data).into_option());
    options
}

#[tokio::test]
async fn datagram_channel_echo() {
    let (addr, _cancel) = common::start_default().await;
    let echo = common::udp_echo().await;

    let assoc = Client::new(addr)
        .udp_associate(&Addr::new("127.0.0.1:0").unwrap(), OptionSet::new())
        .await
        .unwrap();
    assert!(!assoc.is_udp_over_tcp());

    assoc.send_to(b"ping", &Addr::from(echo)).await.unwrap();
    let mut buf = [0u8; 64];
    let (len, from) = assoc.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"ping");
    assert_eq!(from, Addr::from(echo));
}

#[tokio::test]
async fn udp_over_tcp_echo() {
    let (addr, _cancel) = common::start_default().await;
    let echo = common::udp_echo().await;

    let client = Client::new(addr).with_config(ClientConfig {
        udp_over_tcp: true,
        ..ClientConfig::default()
    });
    let assoc = client
        .udp_associate(&Addr::new("127.0.0.1:0").unwrap(), OptionSet::new())
        .await
        .unwrap();
    assert!(assoc.is_udp_over_tcp());

    for payload in [&b"one"[..], &b"two"[..]] {
        assoc.send_to(payload, &Addr::from(echo)).await.unwrap();
        let message = assoc.recv_message().await.unwrap();
        match message {
            UdpMessage::Datagram {
                assoc_id,
                endpoint,
                data,
            } => {
                assert_eq!(assoc_id, assoc.assoc_id());
                assert_eq!(endpoint, Addr::from(echo));
                assert_eq!(data, payload);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

/// free_even_port finds an even loopback UDP port whose odd neighbour is
/// free too
async fn free_even_port() -> u16 {
    loop {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        if port % 2 == 0 && UdpSocket::bind(("127.0.0.1", port + 1)).await.is_ok() {
            return port;
        }
    }
}

fn even_with_reservation() -> OptionSet {
    remote_option(StackOptionData::PortParity(PortParity {
        parity: Parity::Even,
        reserve: true,
    }))
}

#[tokio::test]
async fn port_parity_and_reservation() {
    let (addr, _cancel) = common::start_default().await;
    let client = Client::new(addr).with_config(ClientConfig {
        use_session: true,
        ..ClientConfig::default()
    });

    let port = free_even_port().await;
    let first = client
        .udp_associate(&Addr::new(&format!("127.0.0.1:{port}")).unwrap(), even_with_reservation())
        .await
        .unwrap();
    assert_eq!(first.bound_addr().port, port);
    let (_, remote) = StackOptionInfo::from_options(first.reply_options());
    let granted = remote.port_parity().expect("parity reflected");
    assert_eq!(granted.parity, Parity::Even);
    assert!(granted.reserve);

    let neighbour = Addr::new(&format!("127.0.0.1:{}", port + 1)).unwrap();

    // another client may not claim the reserved port
    let stranger = Client::new(addr);
    assert!(matches!(
        stranger.udp_associate(&neighbour, OptionSet::new()).await,
        Err(Error::OperationFailed(ReplyCode::ConnectionRefused))
    ));

    let second = client
        .udp_associate(&neighbour, OptionSet::new())
        .await
        .unwrap();
    assert_eq!(second.bound_addr(), &neighbour);
}

#[tokio::test]
async fn taken_neighbour_is_reported_unreserved() {
    let (addr, _cancel) = common::start_default().await;
    let client = Client::new(addr).with_config(ClientConfig {
        use_session: true,
        ..ClientConfig::default()
    });

    let port = free_even_port().await;
    let _holder = UdpSocket::bind(("127.0.0.1", port + 1)).await.unwrap();

    let assoc = client
        .udp_associate(&Addr::new(&format!("127.0.0.1:{port}")).unwrap(), even_with_reservation())
        .await
        .unwrap();
    assert_eq!(assoc.bound_addr().port, port);
    let (_, remote) = StackOptionInfo::from_options(assoc.reply_options());
    let granted = remote.port_parity().expect("parity reflected");
    assert_eq!(granted.parity, Parity::Even);
    assert!(!granted.reserve);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn address_dependent_filtering_drops_strangers() {
    let config = ServerConfig {
        filtering: Filtering::AddressDependent,
        ..ServerConfig::default()
    };
    let (addr, _cancel) = common::start(Socks6Server::new("127.0.0.1:0").with_config(config)).await;
    let echo = common::udp_echo().await;

    let assoc = Client::new(addr)
        .udp_associate(&Addr::new("127.0.0.1:0").unwrap(), OptionSet::new())
        .await
        .unwrap();
    let relay = assoc.bound_addr().socket_addr().unwrap();

    // 127.0.0.2 is another loopback host the client never talked to
    let stranger = UdpSocket::bind("127.0.0.2:0").await.unwrap();
    stranger.send_to(b"spam", relay).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assoc.send_to(b"ping", &Addr::from(echo)).await.unwrap();
    let mut buf = [0u8; 64];
    let (len, from) = assoc.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"ping");
    assert_eq!(from, Addr::from(echo));
}

/// ScriptedIcmp hands out channels the test feeds by hand
#[derive(Default)]
struct ScriptedIcmp {
    subscribers: Mutex<Vec<(SocketAddr, mpsc::Sender<IcmpReport>)>>,
}

impl IcmpBridge for ScriptedIcmp {
    fn subscribe(&self, local: SocketAddr) -> mpsc::Receiver<IcmpReport> {
        let (tx, rx) = mpsc::channel(4);
        self.subscribers.lock().push((local, tx));
        rx
    }
}

#[tokio::test]
async fn icmp_reports_reach_the_client() {
    let bridge = Arc::new(ScriptedIcmp::default());
    let server = Socks6Server::new("127.0.0.1:0").with_icmp_bridge(bridge.clone());
    let (addr, _cancel) = common::start(server).await;

    let client = Client::new(addr).with_config(ClientConfig {
        udp_over_tcp: true,
        ..ClientConfig::default()
    });
    let assoc = client
        .udp_associate(
            &Addr::new("127.0.0.1:0").unwrap(),
            remote_option(StackOptionData::UdpError(true)),
        )
        .await
        .unwrap();
    let (_, remote) = StackOptionInfo::from_options(assoc.reply_options());
    assert_eq!(remote.udp_error(), Some(true));

    let (local, tx) = bridge.subscribers.lock().pop().expect("association subscribed");
    assert_eq!(local, assoc.bound_addr().socket_addr().unwrap());
    let destination: SocketAddr = "192.0.2.1:9".parse().unwrap();
    tx.send(IcmpReport {
        destination,
        reporter: "198.51.100.1".parse().unwrap(),
        code: UdpErrorCode::HostUnreachable,
    })
    .await
    .unwrap();

    match assoc.recv_message().await.unwrap() {
        UdpMessage::Error { endpoint, code, .. } => {
            assert_eq!(endpoint, Addr::from(destination));
            assert_eq!(code, UdpErrorCode::HostUnreachable);
        }
        other => panic!("unexpected {other:?}"),
    }
}
