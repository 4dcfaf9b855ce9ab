mod common;

use socks6::{Addr, Client, ClientConfig, Error, ReplyCode};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

#[tokio::test]
async fn connect_relays_both_ways() {
    let (addr, _cancel) = common::start_default().await;
    let echo = common::tcp_echo().await;

    let mut stream = Client::new(addr).connect(&Addr::from(echo)).await.unwrap();
    stream.write_all(b"hello over socks6").await.unwrap();
    let mut buf = [0u8; 17];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello over socks6");
}

#[tokio::test]
async fn connect_carries_initial_data() {
    let (addr, _cancel) = common::start_default().await;
    let echo = common::tcp_echo().await;

    let mut stream = Client::new(addr)
        .connect_with_data(&Addr::from(echo), b"early")
        .await
        .unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"early");
}

#[tokio::test]
async fn connect_reports_refused_destination() {
    let (addr, _cancel) = common::start_default().await;
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let result = Client::new(addr).connect(&Addr::from(closed)).await;
    assert!(matches!(
        result,
        Err(Error::OperationFailed(ReplyCode::ConnectionRefused))
    ));
}

#[tokio::test]
async fn bind_accepts_one_connection() {
    let (addr, _cancel) = common::start_default().await;
    let client = Client::new(addr);

    let handle = client
        .bind(&Addr::new("127.0.0.1:0").unwrap())
        .await
        .unwrap();
    let bound = handle.bound_addr().socket_addr().unwrap();
    assert_ne!(bound.port(), 0);

    let mut remote = TcpStream::connect(bound).await.unwrap();
    let remote_local = remote.local_addr().unwrap();
    remote.write_all(b"knock").await.unwrap();

    let (mut stream, peer) = handle.accept().await.unwrap();
    assert_eq!(peer, Addr::from(remote_local));
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"knock");

    stream.write_all(b"who's there").await.unwrap();
    let mut buf = [0u8; 11];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"who's there");
}

#[tokio::test]
async fn bind_backlog_hands_out_queued_connections() {
    let (addr, _cancel) = common::start_default().await;
    let client = Client::new(addr).with_config(ClientConfig {
        use_session: true,
        ..ClientConfig::default()
    });

    let mut handle = client
        .bind_backlog(&Addr::new("127.0.0.1:0").unwrap(), 10)
        .await
        .unwrap();
    let bound = handle.bound_addr().socket_addr().unwrap();

    for greeting in [&b"first"[..], &b"other"[..]] {
        let mut remote = TcpStream::connect(bound).await.unwrap();
        let remote_local = remote.local_addr().unwrap();
        remote.write_all(greeting).await.unwrap();

        let (mut stream, peer) = handle.accept().await.unwrap();
        assert_eq!(peer, Addr::from(remote_local));
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], greeting);
    }
}

#[tokio::test]
async fn bind_backlog_needs_a_session() {
    let (addr, _cancel) = common::start_default().await;
    let result = Client::new(addr)
        .bind_backlog(&Addr::new("127.0.0.1:0").unwrap(), 4)
        .await;
    assert!(matches!(result, Err(Error::UnexpectedMessage(_))));
}
