#![allow(dead_code)]

use socks6::Socks6Server;
use std::net::SocketAddr;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

/// start binds `server` on its listen address and runs it in the
/// background
pub async fn start(mut server: Socks6Server) -> (SocketAddr, CancellationToken) {
    let addr = server.bind().await.unwrap();
    let cancel = server.cancel_token();
    tokio::spawn(async move { server.run().await });
    (addr, cancel)
}

pub async fn start_default() -> (SocketAddr, CancellationToken) {
    start(Socks6Server::new("127.0.0.1:0")).await
}

/// tcp_echo serves every connection by writing back what it reads
pub async fn tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// udp_echo sends every datagram back to its sender
pub async fn udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..len], from).await;
        }
    });
    addr
}
