//! Integration tests for slsk-client.
//!
//! Every network endpoint here is an in-process socket: a mock server for
//! login and relayed messages, plain TCP streams standing in for peers,
//! parents, and children.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use slsk_client::SoulseekClient;
use slsk_client::config::ClientOptions;
use slsk_client::error::Error;
use slsk_client::events::{ClientEvent, DiagnosticLevel};
use slsk_client::messages::distributed::{DistributedMessage, SearchRequest};
use slsk_client::messages::peer::{FileEntry, PeerMessage};
use slsk_client::messages::peer_init::PeerInitMessage;
use slsk_client::messages::server::ServerCode;
use slsk_client::protocol::{MessageWrite, ProtocolRead, ProtocolWrite, login_hash, zlib_compress, zlib_decompress};
use slsk_client::resolvers::{
    EnqueueDownloadAction, Resolvers, SearchReply, SearchResponseResolver, UserEndPointCache,
};

/// A closed port that nothing can bind without privileges; direct connection
/// attempts against it fail immediately.
const DEAD_PORT: u16 = 1;

async fn read_frame(stream: &mut TcpStream) -> Option<Bytes> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.ok()?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.ok()?;
    let mut frame = BytesMut::with_capacity(4 + len);
    frame.put_slice(&len_buf);
    frame.put_slice(&body);
    Some(frame.freeze())
}

fn server_frame(code: ServerCode, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    out.put_u32_le(4 + payload.len() as u32);
    out.put_u32_le(code as u32);
    out.put_slice(payload);
    out.freeze()
}

fn login_success_frame() -> Bytes {
    let mut payload = BytesMut::new();
    true.write_to(&mut payload);
    "Welcome".write_to(&mut payload);
    Ipv4Addr::new(127, 0, 0, 1).write_to(&mut payload);
    "0123456789abcdef0123456789abcdef".write_to(&mut payload);
    false.write_to(&mut payload);
    server_frame(ServerCode::Login, &payload)
}

fn peer_address_frame(username: &str, ip: Ipv4Addr, port: u32) -> Bytes {
    let mut payload = BytesMut::new();
    username.write_to(&mut payload);
    ip.write_to(&mut payload);
    port.write_to(&mut payload);
    server_frame(ServerCode::GetPeerAddress, &payload)
}

fn net_info_frame(username: &str, ip: Ipv4Addr, port: u32) -> Bytes {
    let mut payload = BytesMut::new();
    payload.put_u32_le(1);
    username.write_to(&mut payload);
    ip.write_to(&mut payload);
    port.write_to(&mut payload);
    server_frame(ServerCode::NetInfo, &payload)
}

/// Read the client's Login frame off a freshly accepted server socket,
/// verify its layout, and answer with a success response.
async fn expect_login(stream: &mut TcpStream) -> (String, String, u32) {
    let frame = read_frame(stream).await.expect("no login frame");
    let declared = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    assert_eq!(declared + 4, frame.len(), "length prefix disagrees");

    let mut body = frame.slice(4..);
    let code = u32::read_from(&mut body).unwrap();
    assert_eq!(code, ServerCode::Login as u32);
    let username = String::read_from(&mut body).unwrap();
    let password = String::read_from(&mut body).unwrap();
    let version = u32::read_from(&mut body).unwrap();
    let hash = String::read_from(&mut body).unwrap();
    let _minor = u32::read_from(&mut body).unwrap();
    assert_eq!(hash, login_hash(&username, &password));

    stream.write_all(&login_success_frame()).await.unwrap();
    (username, password, version)
}

async fn wait_for_event(
    events: &mut UnboundedReceiver<ClientEvent>,
    what: &str,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

struct StaticEndpoints(HashMap<String, SocketAddr>);

#[async_trait]
impl UserEndPointCache for StaticEndpoints {
    async fn get(&self, username: &str) -> Option<SocketAddr> {
        self.0.get(username).copied()
    }

    async fn set(&self, _username: &str, _endpoint: SocketAddr, _ttl: Duration) {}
}

struct RejectingEnqueue;

#[async_trait]
impl EnqueueDownloadAction for RejectingEnqueue {
    async fn enqueue(
        &self,
        _username: &str,
        _remote: Option<SocketAddr>,
        _filename: &str,
    ) -> slsk_client::Result<()> {
        Err(Error::DownloadEnqueue("no such file".to_string()))
    }
}

struct CountingSearchResolver {
    invocations: Arc<AtomicUsize>,
    seen: Arc<std::sync::Mutex<Vec<(String, u32, String)>>>,
}

#[async_trait]
impl SearchResponseResolver for CountingSearchResolver {
    async fn resolve(&self, username: &str, token: u32, query: &str) -> Option<SearchReply> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((username.to_string(), token, query.to_string()));
        Some(SearchReply {
            files: sample_files(),
            slot_free: true,
            avg_speed: 100_000,
            queue_length: 0,
        })
    }
}

fn sample_files() -> Vec<FileEntry> {
    ["a.flac", "b.flac", "c.flac"]
        .iter()
        .map(|name| FileEntry {
            filename: format!("Music/{name}"),
            size: 1024,
            extension: "flac".to_string(),
            attributes: vec![],
        })
        .collect()
}

fn test_options() -> ClientOptions {
    let mut options = ClientOptions::default();
    options.server_host = "127.0.0.1".to_string();
    options.listen_port = 0;
    options.minimum_diagnostic_level = DiagnosticLevel::Debug;
    options
}

mod codec {
    use super::*;

    #[test]
    fn test_primitive_roundtrips() {
        let mut buf = BytesMut::new();
        255u8.write_to(&mut buf);
        65535u16.write_to(&mut buf);
        0xDEADBEEFu32.write_to(&mut buf);
        (-12345i32).write_to(&mut buf);
        0xDEADBEEFCAFEBABEu64.write_to(&mut buf);
        true.write_to(&mut buf);
        "hello world".write_to(&mut buf);
        "日本語テスト 🎵".write_to(&mut buf);
        Ipv4Addr::new(192, 168, 1, 100).write_to(&mut buf);

        let mut frozen = buf.freeze();
        assert_eq!(u8::read_from(&mut frozen).unwrap(), 255);
        assert_eq!(u16::read_from(&mut frozen).unwrap(), 65535);
        assert_eq!(u32::read_from(&mut frozen).unwrap(), 0xDEADBEEF);
        assert_eq!(i32::read_from(&mut frozen).unwrap(), -12345);
        assert_eq!(u64::read_from(&mut frozen).unwrap(), 0xDEADBEEFCAFEBABE);
        assert!(bool::read_from(&mut frozen).unwrap());
        assert_eq!(String::read_from(&mut frozen).unwrap(), "hello world");
        assert_eq!(String::read_from(&mut frozen).unwrap(), "日本語テスト 🎵");
        assert_eq!(
            Ipv4Addr::read_from(&mut frozen).unwrap(),
            Ipv4Addr::new(192, 168, 1, 100)
        );
        assert!(!frozen.has_remaining());
    }

    #[test]
    fn test_buffer_underflow() {
        let mut buf = Bytes::from_static(&[0, 1, 2]);
        assert!(u32::read_from(&mut buf).is_err());
    }

    #[test]
    fn test_zlib_roundtrip() {
        let original: Vec<u8> = (0..10000).map(|i| (i % 256) as u8).collect();
        let compressed = zlib_compress(&original).unwrap();
        let decompressed = zlib_decompress(&compressed).unwrap();
        assert_eq!(decompressed, original);
        assert!(compressed.len() < original.len());
    }

    #[test]
    fn test_login_hash_known_value() {
        assert_eq!(
            login_hash("username", "password"),
            "d51c9a7e9353746a6020f9602d452929"
        );
    }

    #[test]
    fn test_peer_message_frame_structure() {
        let msg = PeerMessage::QueueDownload {
            filename: "x".to_string(),
        };
        let frame = msg.encode();
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len + 4, frame.len());
        match PeerMessage::decode(frame).unwrap() {
            PeerMessage::QueueDownload { filename } => assert_eq!(filename, "x"),
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_peer_frame_rejected() {
        let msg = PeerMessage::QueueDownload {
            filename: "something long enough".to_string(),
        };
        let frame = msg.encode();
        let truncated = frame.slice(..frame.len() - 3);
        assert!(PeerMessage::decode(truncated).is_err());
    }
}

/// Scenario: login wire bytes, answered by a mock server.
#[tokio::test]
async fn test_login_wire_format_and_success() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let mock = tokio::spawn(async move {
        let (mut stream, _) = server.accept().await.unwrap();
        let (username, password, version) = expect_login(&mut stream).await;
        assert_eq!(username, "u");
        assert_eq!(password, "p");
        assert_eq!(version, 157);
        // Hold the connection open so the session stays up.
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let mut options = test_options();
    options.server_port = server_addr.port();
    options.client_version = 157;
    options.client_minor_version = 0;
    options.enable_listener = false;
    let (client, _events) = SoulseekClient::new(options).unwrap();
    client.login("u", "p").await.unwrap();
    assert!(client.is_logged_in());

    mock.await.unwrap();
}

#[tokio::test]
async fn test_login_rejection_surfaces_reason() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = server.accept().await.unwrap();
        let _ = read_frame(&mut stream).await;
        let mut payload = BytesMut::new();
        false.write_to(&mut payload);
        "INVALIDPASS".write_to(&mut payload);
        stream
            .write_all(&server_frame(ServerCode::Login, &payload))
            .await
            .unwrap();
    });

    let mut options = test_options();
    options.server_port = server_addr.port();
    options.enable_listener = false;
    let (client, _events) = SoulseekClient::new(options).unwrap();
    match client.login("u", "wrong").await {
        Err(Error::LoginFailed { reason }) => assert!(reason.contains("INVALIDPASS")),
        other => panic!("expected login failure, got {:?}", other),
    }
    assert!(!client.is_logged_in());
}

/// Scenario: the acceptor classifies an inbound `PeerInit { "P" }` and hands
/// the socket to the peer manager.
#[tokio::test]
async fn test_listener_classifies_incoming_peer_message() {
    let (client, mut events) = SoulseekClient::new(test_options()).unwrap();
    let port = client.start_listener().await.unwrap();

    let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let init = PeerInitMessage::PeerInit {
        username: "alice".to_string(),
        connection_type: slsk_client::constants::ConnectionType::Peer,
        token: 0,
    };
    peer.write_all(&init.to_frame_u8()).await.unwrap();

    wait_for_event(&mut events, "alice's connection", |event| {
        matches!(
            event,
            ClientEvent::ConnectionStateChanged { username, connected: true, .. }
                if username == "alice"
        )
    })
    .await;
    wait_for_event(&mut events, "handed-off diagnostic", |event| {
        matches!(
            event,
            ClientEvent::Diagnostic { message, .. } if message.contains("handed off")
        )
    })
    .await;
}

/// Scenario: an unknown PierceFirewall token gets the socket dropped.
#[tokio::test]
async fn test_listener_rejects_unknown_solicitation() {
    let (client, _events) = SoulseekClient::new(test_options()).unwrap();
    let port = client.start_listener().await.unwrap();

    let mut stray = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let pierce = PeerInitMessage::PierceFirewall { token: 999_999 };
    stray.write_all(&pierce.to_frame_u8()).await.unwrap();

    // The acceptor closes the socket; our read sees EOF.
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), stray.read(&mut buf))
        .await
        .expect("socket was not closed")
        .unwrap();
    assert_eq!(n, 0);
}

/// Scenario: `getOrAddMessageConnection` falls back to the indirect path and
/// resolves when the solicited PierceFirewall arrives.
#[tokio::test]
async fn test_firewall_pierced_connection() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let mut options = test_options();
    options.server_port = server_addr.port();
    let (client, _events) = SoulseekClient::new(options).unwrap();
    let listen_port = client.start_listener().await.unwrap();

    let mock = tokio::spawn(async move {
        let (mut stream, _) = server.accept().await.unwrap();
        expect_login(&mut stream).await;
        loop {
            let Some(frame) = read_frame(&mut stream).await else {
                break;
            };
            let mut body = frame.slice(4..);
            let code = u32::read_from(&mut body).unwrap();
            if code == ServerCode::GetPeerAddress as u32 {
                let username = String::read_from(&mut body).unwrap();
                assert_eq!(username, "carol");
                // Carol's advertised endpoint refuses direct connections.
                stream
                    .write_all(&peer_address_frame(
                        "carol",
                        Ipv4Addr::new(127, 0, 0, 1),
                        DEAD_PORT as u32,
                    ))
                    .await
                    .unwrap();
            } else if code == ServerCode::ConnectToPeer as u32 {
                let token = u32::read_from(&mut body).unwrap();
                let username = String::read_from(&mut body).unwrap();
                let ctype = String::read_from(&mut body).unwrap();
                assert_eq!(username, "carol");
                assert_eq!(ctype, "P");
                // Play carol: pierce back into the client's listener.
                tokio::spawn(async move {
                    let mut carol = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
                    let pierce = PeerInitMessage::PierceFirewall { token };
                    carol.write_all(&pierce.to_frame_u8()).await.unwrap();

                    let frame = read_frame(&mut carol).await.expect("no browse request");
                    match PeerMessage::decode(frame).unwrap() {
                        PeerMessage::SharesRequest => {}
                        other => panic!("expected SharesRequest, got {:?}", other),
                    }
                    let response = PeerMessage::SharesResponse {
                        directories: vec![],
                        private_directories: vec![],
                    };
                    carol.write_all(&response.encode()).await.unwrap();
                    tokio::time::sleep(Duration::from_secs(5)).await;
                });
            }
        }
    });

    client.login("me", "pw").await.unwrap();

    let cancel = CancellationToken::new();
    let (directories, private) = client.browse("carol", &cancel).await.unwrap();
    assert!(directories.is_empty());
    assert!(private.is_empty());

    client.disconnect().await;
    mock.abort();
}

/// Scenario: the enqueue callback's rejection message is forwarded verbatim
/// in a QueueFailed frame.
#[tokio::test]
async fn test_enqueue_rejection_sends_queue_failed() {
    let mut options = test_options();
    options.resolvers = Arc::new(Resolvers {
        enqueue_download: Box::new(RejectingEnqueue),
        ..Resolvers::default()
    });
    let (client, _events) = SoulseekClient::new(options).unwrap();
    let port = client.start_listener().await.unwrap();

    let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let init = PeerInitMessage::PeerInit {
        username: "bob".to_string(),
        connection_type: slsk_client::constants::ConnectionType::Peer,
        token: 0,
    };
    peer.write_all(&init.to_frame_u8()).await.unwrap();
    let queue = PeerMessage::QueueDownload {
        filename: "x".to_string(),
    };
    peer.write_all(&queue.encode()).await.unwrap();

    let frame = read_frame(&mut peer).await.expect("no refusal frame");
    match PeerMessage::decode(frame).unwrap() {
        PeerMessage::QueueFailed { filename, reason } => {
            assert_eq!(filename, "x");
            assert_eq!(reason, "no such file");
        }
        other => panic!("expected QueueFailed, got {:?}", other),
    }
}

/// Scenario: search requests from the parent are forwarded to both children
/// exactly once (dedup), resolved locally once, and answered to the
/// requester's peer connection.
#[tokio::test]
async fn test_distributed_search_forwarding_and_dedup() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let parent_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let parent_addr = parent_listener.local_addr().unwrap();
    let bob_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bob_addr = bob_listener.local_addr().unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut options = test_options();
    options.server_port = server_addr.port();
    options.resolvers = Arc::new(Resolvers {
        search: Box::new(CountingSearchResolver {
            invocations: Arc::clone(&invocations),
            seen: Arc::clone(&seen),
        }),
        endpoint_cache: Box::new(StaticEndpoints(HashMap::from([(
            "bob".to_string(),
            bob_addr,
        )]))),
        ..Resolvers::default()
    });
    let (client, mut events) = SoulseekClient::new(options).unwrap();
    let listen_port = client.start_listener().await.unwrap();

    // Mock server: complete the login handshake concurrently with the
    // client's login call, then just let the client's status frames buffer.
    let (mut server_stream, login_result) = tokio::join!(
        async {
            let (mut stream, _) = server.accept().await.unwrap();
            expect_login(&mut stream).await;
            stream
        },
        client.login("searcher", "pw")
    );
    login_result.unwrap();

    // Attach two distributed children through the acceptor.
    let mut children = Vec::new();
    for name in ["child-one", "child-two"] {
        let mut child = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
        let init = PeerInitMessage::PeerInit {
            username: name.to_string(),
            connection_type: slsk_client::constants::ConnectionType::Distributed,
            token: 0,
        };
        child.write_all(&init.to_frame_u8()).await.unwrap();
        children.push(child);
    }
    // Adoption is signalled by the branch-level frame each child receives.
    for child in &mut children {
        let frame = read_frame(child).await.expect("child got no branch level");
        assert!(matches!(
            DistributedMessage::decode(frame).unwrap(),
            DistributedMessage::BranchLevel(_)
        ));
    }

    // Advertise a parent candidate; the client connects directly.
    server_stream
        .write_all(&net_info_frame(
            "patriarch",
            Ipv4Addr::new(127, 0, 0, 1),
            parent_addr.port() as u32,
        ))
        .await
        .unwrap();
    let (mut parent, _) = parent_listener.accept().await.unwrap();
    let frame = read_frame(&mut parent).await.expect("no PeerInit from client");
    let mut body = frame.slice(4..);
    assert_eq!(u8::read_from(&mut body).unwrap(), 1); // PeerInit
    assert_eq!(String::read_from(&mut body).unwrap(), "searcher");
    assert_eq!(String::read_from(&mut body).unwrap(), "D");

    wait_for_event(&mut events, "parent adoption", |event| {
        matches!(
            event,
            ClientEvent::Diagnostic { message, .. } if message.contains("adopted distributed parent")
        )
    })
    .await;

    // The same search frame twice, back to back.
    let search = DistributedMessage::SearchRequest(SearchRequest {
        origin: "bob".to_string(),
        token: 42,
        query: "flac".to_string(),
    });
    let search_frame = search.encode();
    parent.write_all(&search_frame).await.unwrap();
    parent.write_all(&search_frame).await.unwrap();

    // Bob receives the locally resolved response on a fresh peer connection.
    let (mut bob, _) = bob_listener.accept().await.unwrap();
    let init_frame = read_frame(&mut bob).await.expect("no PeerInit for bob");
    let mut body = init_frame.slice(4..);
    assert_eq!(u8::read_from(&mut body).unwrap(), 1);
    assert_eq!(String::read_from(&mut body).unwrap(), "searcher");
    assert_eq!(String::read_from(&mut body).unwrap(), "P");

    let response_frame = read_frame(&mut bob).await.expect("no search response");
    match PeerMessage::decode(response_frame).unwrap() {
        PeerMessage::SearchResponse {
            username,
            token,
            results,
            ..
        } => {
            assert_eq!(username, "searcher");
            assert_eq!(token, 42);
            assert_eq!(results.len(), 3);
        }
        other => panic!("expected SearchResponse, got {:?}", other),
    }

    // Each child saw the search exactly once.
    for child in &mut children {
        let mut searches = 0;
        loop {
            let frame = match tokio::time::timeout(Duration::from_millis(300), read_frame(child)).await {
                Ok(Some(frame)) => frame,
                _ => break,
            };
            if matches!(
                DistributedMessage::decode(frame).unwrap(),
                DistributedMessage::SearchRequest(_)
            ) {
                searches += 1;
            }
        }
        assert_eq!(searches, 1, "child saw {} search frames", searches);
    }

    // And the resolver ran once, with the requester's parameters.
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("bob".to_string(), 42, "flac".to_string())]
    );

    client.disconnect().await;
}

/// Scenario: the child limit bounds adoption; sockets beyond it are closed.
#[tokio::test]
async fn test_distributed_child_limit_enforced() {
    let mut options = test_options();
    options.distributed_child_limit = 1;
    let (client, _events) = SoulseekClient::new(options).unwrap();
    let port = client.start_listener().await.unwrap();

    let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let init = PeerInitMessage::PeerInit {
        username: "kept".to_string(),
        connection_type: slsk_client::constants::ConnectionType::Distributed,
        token: 0,
    };
    first.write_all(&init.to_frame_u8()).await.unwrap();
    // Adopted: receives our branch level.
    let frame = read_frame(&mut first).await.expect("first child rejected");
    assert!(matches!(
        DistributedMessage::decode(frame).unwrap(),
        DistributedMessage::BranchLevel(_)
    ));

    let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let init = PeerInitMessage::PeerInit {
        username: "rejected".to_string(),
        connection_type: slsk_client::constants::ConnectionType::Distributed,
        token: 0,
    };
    second.write_all(&init.to_frame_u8()).await.unwrap();

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
        .await
        .expect("second child socket was not closed")
        .unwrap();
    assert_eq!(n, 0);
}

/// Scenario: a full download negotiation against a peer that connected to us.
#[tokio::test]
async fn test_download_from_inbound_peer() {
    let (client, _events) = SoulseekClient::new(test_options()).unwrap();
    let client = Arc::new(client);
    let port = client.start_listener().await.unwrap();

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let payload_len = payload.len() as u64;

    // The seeding peer introduces itself first.
    let mut seed = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let init = PeerInitMessage::PeerInit {
        username: "seed".to_string(),
        connection_type: slsk_client::constants::ConnectionType::Peer,
        token: 0,
    };
    seed.write_all(&init.to_frame_u8()).await.unwrap();
    // Give the acceptor a beat to install the connection.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let download = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let mut sink = Vec::new();
            let cancel = CancellationToken::new();
            let summary = client
                .download("seed", "Music/song.mp3", 0, &mut sink, &cancel)
                .await?;
            Ok::<(Vec<u8>, u64), Error>((sink, summary.bytes_transferred))
        })
    };

    // Queue request arrives on the message connection.
    let frame = read_frame(&mut seed).await.expect("no queue request");
    match PeerMessage::decode(frame).unwrap() {
        PeerMessage::QueueDownload { filename } => assert_eq!(filename, "Music/song.mp3"),
        other => panic!("expected QueueDownload, got {:?}", other),
    }

    // Our turn: offer the transfer.
    let request = PeerMessage::TransferRequest {
        direction: slsk_client::constants::TransferDirection::Upload,
        token: 77,
        filename: "Music/song.mp3".to_string(),
        file_size: Some(payload_len),
    };
    seed.write_all(&request.encode()).await.unwrap();

    let frame = read_frame(&mut seed).await.expect("no transfer response");
    match PeerMessage::decode(frame).unwrap() {
        PeerMessage::TransferResponse { token, allowed, .. } => {
            assert_eq!(token, 77);
            assert!(allowed);
        }
        other => panic!("expected TransferResponse, got {:?}", other),
    }

    // Open the transfer connection, identify it, honor the offset, stream.
    let mut transfer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let init = PeerInitMessage::PeerInit {
        username: "seed".to_string(),
        connection_type: slsk_client::constants::ConnectionType::File,
        token: 77,
    };
    transfer.write_all(&init.to_frame_u8()).await.unwrap();
    transfer.write_all(&77u32.to_le_bytes()).await.unwrap();

    let mut offset_buf = [0u8; 8];
    transfer.read_exact(&mut offset_buf).await.unwrap();
    assert_eq!(u64::from_le_bytes(offset_buf), 0);

    transfer.write_all(&payload).await.unwrap();
    transfer.flush().await.unwrap();

    let (sink, transferred) = download.await.unwrap().unwrap();
    assert_eq!(transferred, payload_len);
    assert_eq!(sink, payload);
}

/// Scenario: a full upload negotiation, with the peer's endpoint supplied by
/// the injected cache.
#[tokio::test]
async fn test_upload_to_peer() {
    let seed_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seed_addr = seed_listener.local_addr().unwrap();

    let mut options = test_options();
    options.resolvers = Arc::new(Resolvers {
        endpoint_cache: Box::new(StaticEndpoints(HashMap::from([(
            "lee".to_string(),
            seed_addr,
        )]))),
        ..Resolvers::default()
    });
    let (client, _events) = SoulseekClient::new(options).unwrap();
    let client = Arc::new(client);
    client.start_listener().await.unwrap();

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();
    let payload_len = payload.len() as u64;

    let upload = {
        let client = Arc::clone(&client);
        let payload = payload.clone();
        tokio::spawn(async move {
            let mut content: &[u8] = &payload;
            let cancel = CancellationToken::new();
            let summary = client
                .upload("lee", "Music/tune.flac", payload_len, &mut content, &cancel)
                .await?;
            Ok::<u64, Error>(summary.bytes_transferred)
        })
    };

    // Message connection: PeerInit then the transfer request.
    let (mut msg_conn, _) = seed_listener.accept().await.unwrap();
    let frame = read_frame(&mut msg_conn).await.expect("no PeerInit");
    let mut body = frame.slice(4..);
    assert_eq!(u8::read_from(&mut body).unwrap(), 1);
    let _username = String::read_from(&mut body).unwrap();
    assert_eq!(String::read_from(&mut body).unwrap(), "P");

    let frame = read_frame(&mut msg_conn).await.expect("no transfer request");
    let token = match PeerMessage::decode(frame).unwrap() {
        PeerMessage::TransferRequest {
            direction,
            token,
            filename,
            file_size,
        } => {
            assert_eq!(direction, slsk_client::constants::TransferDirection::Upload);
            assert_eq!(filename, "Music/tune.flac");
            assert_eq!(file_size, Some(payload_len));
            token
        }
        other => panic!("expected TransferRequest, got {:?}", other),
    };
    let response = PeerMessage::TransferResponse {
        token,
        allowed: true,
        file_size: None,
        reason: None,
    };
    msg_conn.write_all(&response.encode()).await.unwrap();

    // Transfer connection: PeerInit(F), token, then we announce offset 0 and
    // receive the bytes.
    let (mut transfer, _) = seed_listener.accept().await.unwrap();
    let frame = read_frame(&mut transfer).await.expect("no transfer PeerInit");
    let mut body = frame.slice(4..);
    assert_eq!(u8::read_from(&mut body).unwrap(), 1);
    let _username = String::read_from(&mut body).unwrap();
    assert_eq!(String::read_from(&mut body).unwrap(), "F");

    let mut token_buf = [0u8; 4];
    transfer.read_exact(&mut token_buf).await.unwrap();
    assert_eq!(u32::from_le_bytes(token_buf), token);

    transfer.write_all(&0u64.to_le_bytes()).await.unwrap();

    let mut received = vec![0u8; payload.len()];
    transfer.read_exact(&mut received).await.unwrap();
    assert_eq!(received, payload);

    let transferred = upload.await.unwrap().unwrap();
    assert_eq!(transferred, payload_len);
}

/// Scenario: a rejected transfer surfaces as `TransferRejected`.
#[tokio::test]
async fn test_upload_rejection_surfaces_reason() {
    let seed_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seed_addr = seed_listener.local_addr().unwrap();

    let mut options = test_options();
    options.resolvers = Arc::new(Resolvers {
        endpoint_cache: Box::new(StaticEndpoints(HashMap::from([(
            "lee".to_string(),
            seed_addr,
        )]))),
        ..Resolvers::default()
    });
    let (client, _events) = SoulseekClient::new(options).unwrap();
    let client = Arc::new(client);
    client.start_listener().await.unwrap();

    let upload = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let mut content: &[u8] = b"data";
            let cancel = CancellationToken::new();
            client
                .upload("lee", "gone.mp3", 4, &mut content, &cancel)
                .await
        })
    };

    let (mut msg_conn, _) = seed_listener.accept().await.unwrap();
    let _ = read_frame(&mut msg_conn).await.expect("no PeerInit");
    let frame = read_frame(&mut msg_conn).await.expect("no transfer request");
    let token = match PeerMessage::decode(frame).unwrap() {
        PeerMessage::TransferRequest { token, .. } => token,
        other => panic!("expected TransferRequest, got {:?}", other),
    };
    let response = PeerMessage::TransferResponse {
        token,
        allowed: false,
        file_size: None,
        reason: Some(slsk_client::constants::TransferRejectionReason::Banned),
    };
    msg_conn.write_all(&response.encode()).await.unwrap();

    match upload.await.unwrap() {
        Err(Error::TransferRejected(reason)) => assert_eq!(reason, "Banned"),
        other => panic!("expected rejection, got {:?}", other.map(|s| s.bytes_transferred)),
    }
}
