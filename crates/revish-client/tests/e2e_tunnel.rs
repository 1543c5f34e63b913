//! End-to-end tunnel tests over loopback
//!
//! Each test runs a real server on an ephemeral port and drives the client
//! registration sequence against it over SSH.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use russh_keys::key::{KeyPair, PublicKey};
use tokio_util::sync::CancellationToken;

use revish_client::shell::ShellServer;
use revish_client::tunnel::SshDialer;
use revish_client::{Phase, TunnelClient, TunnelSettings};
use revish_core::config::{ClientConfig, ServerConfig};
use revish_core::credentials::{ServiceCredentials, SharedSecret, StaticCredentials};
use revish_core::keys::AuthorizedKeys;
use revish_core::{HostIdentity, TunnelError};
use revish_server::{ServerState, SshServer};

const SERVICE_USER: &str = "revish";
const SERVICE_PASSWORD: &str = "correct-horse";

struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    cancel: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_server(no_shell: bool, operator_keys: AuthorizedKeys) -> TestServer {
    let config = ServerConfig {
        listen: "127.0.0.1".to_string(),
        port: 0,
        no_shell,
        proxy_user: "proxy".to_string(),
        auth_rejection_time: Duration::from_millis(10),
        ..Default::default()
    };
    let state = Arc::new(ServerState::new(
        config,
        Arc::new(SharedSecret::from_password(SERVICE_USER, SERVICE_PASSWORD)),
        operator_keys,
    ));

    let cancel = CancellationToken::new();
    let host_key = KeyPair::generate_ed25519().unwrap();
    let server = SshServer::bind(host_key, Arc::clone(&state), cancel.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    TestServer {
        addr,
        state,
        cancel,
    }
}

fn client_config(server: &TestServer) -> ClientConfig {
    ClientConfig {
        server_address: server.addr.to_string(),
        remote_bind_host: "127.0.0.1".to_string(),
        remote_port: 0,
        connect_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn tunnel_client(server: &TestServer, password: &str) -> TunnelClient<SshDialer> {
    let config = client_config(server);
    TunnelClient::new(
        SshDialer::new(&config),
        Arc::new(StaticCredentials::new(ServiceCredentials::new(
            SERVICE_USER,
            password,
        ))),
        HostIdentity::new("alice", "alicebox"),
        TunnelSettings::from_config(&config),
    )
}

/// Operator-side SSH client that trusts any host key
struct Operator;

#[async_trait]
impl client::Handler for Operator {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn operator_key() -> (Arc<KeyPair>, AuthorizedKeys) {
    let key = KeyPair::generate_ed25519().unwrap();
    let mut authorized = AuthorizedKeys::new();
    authorized.add_key(&key.clone_public_key().unwrap(), Some("operator".to_string()));
    (Arc::new(key), authorized)
}

async fn operator_login(addr: SocketAddr, key: Arc<KeyPair>) -> client::Handle<Operator> {
    let mut handle = client::connect(Arc::new(client::Config::default()), addr, Operator)
        .await
        .unwrap();
    assert!(handle.authenticate_publickey("operator", key).await.unwrap());
    handle
}

/// Collect channel messages until the channel closes
async fn drain(channel: &mut russh::Channel<client::Msg>) -> Vec<ChannelMsg> {
    let mut messages = Vec::new();
    let collect = async {
        while let Some(msg) = channel.wait().await {
            let done = matches!(msg, ChannelMsg::Failure | ChannelMsg::Close);
            messages.push(msg);
            if done {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(5), collect).await;
    messages
}

#[tokio::test]
async fn test_register_and_unregister_round_trip() {
    let server = start_server(false, AuthorizedKeys::new()).await;
    let mut directory = server.state.registry.subscribe();
    assert!(directory.recv().await.unwrap().is_empty());

    let tunnel = tunnel_client(&server, SERVICE_PASSWORD)
        .establish()
        .await
        .unwrap();
    assert_eq!(tunnel.phase(), Phase::Active);

    let snapshot = server.state.registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].user, "alice");
    assert_eq!(snapshot[0].hostname, "alicebox");
    assert_eq!(snapshot[0].listening_address, tunnel.listening_address());
    assert!(server
        .state
        .forwards
        .holder(tunnel.listening_address())
        .is_some());

    let published = directory.recv().await.unwrap();
    assert_eq!(published.len(), 1);

    tunnel.shutdown().await.unwrap();

    let published = directory.recv().await.unwrap();
    assert!(published.is_empty());
    assert!(server.state.registry.is_empty());
}

#[tokio::test]
async fn test_wrong_password_exhausts_attempts() {
    let server = start_server(false, AuthorizedKeys::new()).await;

    let result = tunnel_client(&server, "wrong").establish().await;

    assert!(matches!(result, Err(TunnelError::Authentication(_))));
    assert!(server.state.registry.is_empty());
}

#[tokio::test]
async fn test_no_shell_server_still_brokers_registration() {
    let (key, authorized) = operator_key();
    let server = start_server(true, authorized).await;

    let tunnel = tunnel_client(&server, SERVICE_PASSWORD)
        .establish()
        .await
        .unwrap();
    assert_eq!(server.state.registry.len(), 1);

    let operator = operator_login(server.addr, key).await;

    let mut channel = operator.channel_open_session().await.unwrap();
    channel.request_shell(true).await.unwrap();
    let messages = drain(&mut channel).await;
    assert!(messages.iter().any(|m| matches!(m, ChannelMsg::Failure)));

    let mut channel = operator.channel_open_session().await.unwrap();
    channel.exec(true, "id").await.unwrap();
    let messages = drain(&mut channel).await;
    assert!(messages.iter().any(|m| matches!(m, ChannelMsg::Failure)));

    let mut channel = operator.channel_open_session().await.unwrap();
    channel.request_subsystem(true, "sftp").await.unwrap();
    let messages = drain(&mut channel).await;
    assert!(messages.iter().any(|m| matches!(m, ChannelMsg::Failure)));

    let forward = operator
        .channel_open_direct_tcpip("127.0.0.1", 22, "127.0.0.1", 0)
        .await;
    assert!(forward.is_err());

    tunnel.shutdown().await.unwrap();
    assert!(server.state.registry.is_empty());
}

#[tokio::test]
async fn test_operator_reaches_client_through_tunnel() {
    let (key, authorized) = operator_key();
    let server = start_server(false, authorized.clone()).await;

    let tunnel = tunnel_client(&server, SERVICE_PASSWORD)
        .establish()
        .await
        .unwrap();
    let target: SocketAddr = tunnel.listening_address().parse().unwrap();

    let shells = ShellServer::new(
        KeyPair::generate_ed25519().unwrap(),
        Arc::new(authorized),
        "/bin/sh".to_string(),
    );
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let serving = tokio::spawn(tunnel.serve(
        move |stream| {
            let shells = shells.clone();
            async move {
                let _ = shells.serve(stream).await;
            }
        },
        async move {
            let _ = stop_rx.await;
        },
    ));

    // Hop through the server into the client's own SSH server
    let operator = operator_login(server.addr, Arc::clone(&key)).await;
    let hop = operator
        .channel_open_direct_tcpip(target.ip().to_string(), u32::from(target.port()), "127.0.0.1", 0)
        .await
        .unwrap();
    let mut inner = client::connect_stream(
        Arc::new(client::Config::default()),
        hop.into_stream(),
        Operator,
    )
    .await
    .unwrap();
    assert!(inner.authenticate_publickey("operator", key).await.unwrap());

    // No PTY was requested, so the client refuses to run anything
    let mut channel = inner.channel_open_session().await.unwrap();
    channel.exec(true, "id").await.unwrap();
    let messages = drain(&mut channel).await;

    assert!(messages.iter().any(|m| matches!(m, ChannelMsg::Failure)));

    stop_tx.send(()).unwrap();
    serving.await.unwrap().unwrap();
    assert!(server.state.registry.is_empty());
}
