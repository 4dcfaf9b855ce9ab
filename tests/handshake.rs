mod common;

use socks6::{
    Addr, AuthenticationReply, Client, ClientConfig, Command, Error, OperationReply, ReplyCode,
    Request, ServerConfig, Socks6Server,
    auth::{FAKE_ECHO_METHOD, FakeEchoClient, FakeEchoMethod, ServerAuthenticator, UserPass},
    options::{OptionData, kind},
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};

const NOOP_REQUEST: [u8; 12] = [6, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0];

/// exchange writes `first` and collects everything the server sends back
/// until it closes the stream
async fn exchange(addr: SocketAddr, first: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(first).await.unwrap();
    let mut answer = Vec::new();
    stream.read_to_end(&mut answer).await.unwrap();
    answer
}

/// closed_within reports whether the server closes `stream` before the
/// deadline runs out
async fn closed_within(stream: &mut TcpStream, deadline: Duration) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match timeout(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
            Err(_) => return false,
        }
    }
}

#[tokio::test]
async fn noop_on_the_wire() {
    let (addr, _cancel) = common::start_default().await;
    let answer = exchange(addr, &NOOP_REQUEST).await;
    assert_eq!(
        answer,
        vec![
            6, 0, 0, 0, // authentication reply: success, no options
            6, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, // operation reply: success, 0.0.0.0:0
        ]
    );
}

#[tokio::test]
async fn older_protocols_get_their_own_refusal() {
    let (addr, _cancel) = common::start_default().await;
    assert_eq!(exchange(addr, &[5]).await, vec![0x05, 0xff]);
    assert_eq!(exchange(addr, &[4]).await, vec![0x00, 0x5b]);
    let http = exchange(addr, b"G").await;
    assert!(http.starts_with(b"HTTP/1.0 400 Bad Request"));
}

#[tokio::test]
async fn password_authentication() {
    let server = Socks6Server::new("127.0.0.1:0").with_auth(Some(UserPass::new("alice", "secret")));
    let (addr, _cancel) = common::start(server).await;

    let good = Client::new(addr).with_password(UserPass::new("alice", "secret"));
    let reply = good.noop().await.unwrap();
    assert_eq!(reply.code, ReplyCode::Success);

    let bad = Client::new(addr).with_password(UserPass::new("alice", "guess"));
    assert!(matches!(bad.noop().await, Err(Error::AuthenticationFailed(2))));

    let anonymous = Client::new(addr);
    assert!(matches!(anonymous.noop().await, Err(Error::AuthenticationFailed(0xff))));
}

#[tokio::test]
async fn two_stage_authentication() {
    let mut authenticator = ServerAuthenticator::new();
    authenticator.add_method(Arc::new(FakeEchoMethod));
    let server = Socks6Server::new("127.0.0.1:0").with_authenticator(authenticator);
    let (addr, _cancel) = common::start(server).await;

    let client = Client::new(addr).with_auth(Arc::new(FakeEchoClient::new("open sesame")));
    let reply = client.noop().await.unwrap();
    assert_eq!(reply.code, ReplyCode::Success);

    // without the method the server has nothing acceptable
    assert!(Client::new(addr).noop().await.is_err());
}

#[tokio::test]
async fn rule_turns_requests_away() {
    let server = Socks6Server::new("127.0.0.1:0").with_rule(|conn| conn.request.command != Command::Connect);
    let (addr, _cancel) = common::start(server).await;
    let client = Client::new(addr);

    assert!(client.noop().await.is_ok());
    let echo = common::tcp_echo().await;
    assert!(matches!(
        client.connect(&Addr::from(echo)).await,
        Err(Error::OperationFailed(ReplyCode::NotAllowedByRule))
    ));
}

#[tokio::test]
async fn unknown_command_is_not_supported() {
    let (addr, _cancel) = common::start_default().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    Request::new(Command::Unknown(0x09), Addr::unspecified())
        .write_to(&mut stream)
        .await
        .unwrap();
    let auth = AuthenticationReply::read_from(&mut stream).await.unwrap();
    assert!(auth.success());
    let reply = OperationReply::read_from(&mut stream).await.unwrap();
    assert_eq!(reply.code, ReplyCode::CommandNotSupported);
}

/// raw_session_request sends a NOOP presenting a session id and
/// optionally a token
async fn raw_session_request(
    addr: std::net::SocketAddr,
    session: &[u8],
    token: Option<u32>,
) -> AuthenticationReply {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = Request::new(Command::Noop, Addr::unspecified());
    request.options.add_data(OptionData::SessionId(session.to_vec()));
    if let Some(token) = token {
        request.options.add_data(OptionData::IdempotenceExpenditure(token));
    }
    request.write_to(&mut stream).await.unwrap();
    AuthenticationReply::read_from(&mut stream).await.unwrap()
}

#[tokio::test]
async fn sessions_and_tokens() {
    let server = Socks6Server::new("127.0.0.1:0").with_auth(Some(UserPass::new("bob", "hunter2")));
    let (addr, _cancel) = common::start(server).await;
    let client = Client::new(addr)
        .with_password(UserPass::new("bob", "hunter2"))
        .with_config(ClientConfig {
            use_session: true,
            use_token: true,
            token_window: 16,
            ..ClientConfig::default()
        });

    client.noop().await.unwrap();
    let session = client.session_id().expect("session granted");
    assert_eq!(session.len(), 8);
    let (first_base, size) = client.idempotence_window().expect("window granted");
    assert_eq!(size, 16);

    // spend well past the first window; fresh windows are piggybacked
    for _ in 0..40 {
        client.noop().await.unwrap();
    }
    assert_eq!(client.session_id(), Some(session.clone()));
    let (base, _) = client.idempotence_window().unwrap();
    assert_ne!(base, first_base);

    // a token spent before is refused
    let replay = raw_session_request(addr, &session, Some(first_base)).await;
    assert!(!replay.success());
    assert!(replay.options.has(kind::IDEMPOTENCE_REJECTED));

    // without a token the session alone still authenticates
    let plain = raw_session_request(addr, &session, None).await;
    assert!(plain.success());
    assert!(plain.options.has(kind::SESSION_OK));

    client.teardown_session().await.unwrap();
    assert_eq!(client.session_id(), None);
    let gone = raw_session_request(addr, &session, None).await;
    assert!(!gone.success());
    assert!(gone.options.has(kind::SESSION_INVALID));
}

#[tokio::test]
async fn unknown_session_is_invalid() {
    let (addr, _cancel) = common::start_default().await;
    let reply = raw_session_request(addr, &[7; 8], None).await;
    assert!(!reply.success());
    assert!(reply.options.has(kind::SESSION_INVALID));
}

#[tokio::test]
async fn shutdown_closes_stalled_handshakes() {
    let (addr, cancel) = common::start_default().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    // version byte only, the rest of the request never comes
    stream.write_all(&[6]).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    cancel.cancel();
    assert!(closed_within(&mut stream, Duration::from_secs(3)).await);
}

#[tokio::test]
async fn slow_requests_hit_the_handshake_deadline() {
    let config = ServerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    let (addr, _cancel) = common::start(Socks6Server::new("127.0.0.1:0").with_config(config)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&NOOP_REQUEST[..5]).await.unwrap();
    assert!(closed_within(&mut stream, Duration::from_secs(3)).await);

    // a prompt client is unaffected
    assert!(Client::new(addr).noop().await.is_ok());
}

#[tokio::test]
async fn stalled_second_stage_hits_the_handshake_deadline() {
    let mut authenticator = ServerAuthenticator::new();
    authenticator.add_method(Arc::new(FakeEchoMethod));
    let config = ServerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    let server = Socks6Server::new("127.0.0.1:0")
        .with_authenticator(authenticator)
        .with_config(config);
    let (addr, _cancel) = common::start(server).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = Request::new(Command::Noop, Addr::unspecified());
    request.options.add_data(OptionData::AuthMethodAdvertisement {
        initial_data_len: 0,
        methods: vec![FAKE_ECHO_METHOD],
    });
    request.options.add_data(OptionData::AuthData {
        method: FAKE_ECHO_METHOD,
        data: vec![2, b'o', b'k'],
    });
    request.write_to(&mut stream).await.unwrap();

    // stage 1 asks for more, and the client never answers
    let first = AuthenticationReply::read_from(&mut stream).await.unwrap();
    assert!(!first.success());
    assert!(closed_within(&mut stream, Duration::from_secs(3)).await);
}

/// split_exchange sends `parts` with a pause between them and collects
/// whatever comes back before the server closes the stream
async fn split_exchange(addr: SocketAddr, parts: &[&[u8]]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    for part in parts {
        if stream.write_all(part).await.is_err() {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    let mut answer = Vec::new();
    let _ = timeout(Duration::from_secs(3), stream.read_to_end(&mut answer)).await;
    answer
}

#[tokio::test]
async fn single_packet_mode_drops_split_requests() {
    let config = ServerConfig {
        single_packet: true,
        ..ServerConfig::default()
    };
    let (addr, _cancel) = common::start(Socks6Server::new("127.0.0.1:0").with_config(config)).await;

    let split = split_exchange(addr, &[&NOOP_REQUEST[..1], &NOOP_REQUEST[1..]]).await;
    assert!(split.is_empty(), "split request was answered: {split:?}");

    let whole = split_exchange(addr, &[&NOOP_REQUEST[..]]).await;
    assert_eq!(
        whole,
        vec![6, 0, 0, 0, 6, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0]
    );
}
