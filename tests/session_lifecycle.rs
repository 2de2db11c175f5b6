//! Client/Relay Session Lifecycle
//!
//! Session establishment, uniqueness, keep-alive probes, relay metrics and
//! recovery after a relay goes away.
//!
//! Run with: cargo test -p dmsg-tests --test session_lifecycle

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dmsg_client::{Client, ClientCallbacks, ClientError};
use dmsg_core::{Addr, ClientConfig, ServerConfig};
use dmsg_crypto::Keypair;
use dmsg_disc::{DiscoveryClient, MemoryDiscovery};
use dmsg_network::get_server_entry;
use dmsg_relay::{CounterMetrics, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use common::{
    eventually, fast_client_config, relay_sessions, start_client, start_client_with,
    start_relay, within,
};

#[tokio::test]
async fn test_client_entry_lists_relay() -> anyhow::Result<()> {
    let disc = Arc::new(MemoryDiscovery::new());
    let relay = start_relay(&disc).await?;
    let client = start_client(&disc).await?;

    let entry = disc.entry(&client.local_pk()).await?;
    let delegated = entry.client.map(|c| c.delegated_servers).unwrap_or_default();
    assert_eq!(delegated, vec![relay.local_pk()]);
    assert_eq!(client.connected_servers().len(), 1);

    client.close().await?;
    // The entry is removed on close.
    assert!(disc.entry(&client.local_pk()).await.is_err());
    relay.close().await;
    Ok(())
}

#[tokio::test]
async fn test_session_is_unique_per_relay() -> anyhow::Result<()> {
    let disc = Arc::new(MemoryDiscovery::new());
    let relay = start_relay(&disc).await?;
    let client = start_client(&disc).await?;
    relay_sessions(&relay, 1).await?;

    let entry = get_server_entry(disc.as_ref(), &relay.local_pk()).await?;
    client.ensure_session(&entry).await?;
    let session = client.ensure_and_obtain_session(&relay.local_pk()).await?;

    assert_eq!(session.remote_pk(), relay.local_pk());
    assert_eq!(client.all_sessions().len(), 1);
    assert_eq!(relay.session_count(), 1);

    client.close().await?;
    relay.close().await;
    Ok(())
}

#[tokio::test]
async fn test_ping_relay() -> anyhow::Result<()> {
    let disc = Arc::new(MemoryDiscovery::new());
    let relay = start_relay(&disc).await?;
    let client = start_client(&disc).await?;
    relay_sessions(&relay, 1).await?;

    let session = client
        .session(&relay.local_pk())
        .ok_or_else(|| anyhow::anyhow!("no session with relay"))?;
    within("first ping", session.ping()).await??;
    within("second ping", session.ping()).await??;
    assert!(!session.is_closed());

    client.close().await?;
    relay.close().await;
    Ok(())
}

#[tokio::test]
async fn test_relay_metrics_count_sessions_and_streams() -> anyhow::Result<()> {
    dmsg_logging::try_init_for_tests();
    let disc = Arc::new(MemoryDiscovery::new());
    let metrics = Arc::new(CounterMetrics::new());
    let relay = Server::new(
        Keypair::generate(),
        disc.clone(),
        ServerConfig::default(),
        metrics.clone(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let serving = relay.clone();
    tokio::spawn(async move { serving.serve(listener, None).await });
    within("relay ready", relay.ready()).await?;

    let alice = start_client(&disc).await?;
    let bob = start_client(&disc).await?;
    relay_sessions(&relay, 2).await?;

    let bob_listener = bob.listen(5)?;
    let mut outbound = within("dial", alice.dial(Addr::new(bob.local_pk(), 5))).await??;
    let mut inbound = within("accept", bob_listener.accept()).await??;
    outbound.write_all(b"x").await?;
    outbound.flush().await?;
    let mut buf = [0u8; 1];
    within("read", inbound.read_exact(&mut buf)).await??;

    let snap = metrics.snapshot();
    assert_eq!(snap.active_sessions, 2);
    assert_eq!(snap.active_streams, 1);
    assert_eq!(snap.total_streams, 1);

    // A rejected dial is counted as a failed stream.
    assert!(alice.dial(Addr::new(bob.local_pk(), 6)).await.is_err());
    eventually("failed stream recorded", || metrics.snapshot().failed_streams == 1).await?;

    alice.close().await?;
    bob.close().await?;
    relay.close().await;
    assert_eq!(metrics.snapshot().active_sessions, 0);
    Ok(())
}

struct DisconnectCounter(AtomicUsize);

impl ClientCallbacks for DisconnectCounter {
    fn on_session_disconnect(&self, _: &str, _: &str, _: &ClientError) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_client_moves_to_new_relay_after_loss() -> anyhow::Result<()> {
    let disc = Arc::new(MemoryDiscovery::new());
    let first = start_relay(&disc).await?;

    let disconnects = Arc::new(DisconnectCounter(AtomicUsize::new(0)));
    let client = Client::with_callbacks(
        Keypair::generate(),
        disc.clone(),
        fast_client_config(),
        disconnects.clone(),
    );
    let serving = client.clone();
    tokio::spawn(async move { serving.serve().await });
    within("client ready", client.ready()).await?;
    assert!(client.session(&first.local_pk()).is_some());

    first.close().await;
    eventually("session loss noticed", || client.session(&first.local_pk()).is_none()).await?;
    eventually("disconnect callback", || disconnects.0.load(Ordering::SeqCst) >= 1).await?;

    let second = start_relay(&disc).await?;
    eventually("session with the new relay", || {
        client.session(&second.local_pk()).is_some()
    })
    .await?;

    within("entry lists the new relay", async {
        loop {
            let entry = disc.entry(&client.local_pk()).await?;
            let delegated = entry.client.map(|c| c.delegated_servers).unwrap_or_default();
            if delegated == vec![second.local_pk()] {
                return Ok::<_, anyhow::Error>(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await??;

    client.close().await?;
    second.close().await;
    Ok(())
}

#[tokio::test]
async fn test_client_picks_up_new_relay_on_refresh() -> anyhow::Result<()> {
    let disc = Arc::new(MemoryDiscovery::new());
    let first = start_relay(&disc).await?;
    let config = ClientConfig {
        min_sessions: 0,
        update_interval: Duration::from_millis(100),
        ..fast_client_config()
    };
    let client = start_client_with(&disc, config).await?;
    assert!(client.session(&first.local_pk()).is_some());
    assert_eq!(client.connected_servers().len(), 1);

    // No session is lost, so only the periodic refresh can find it.
    let second = start_relay(&disc).await?;
    eventually("session with the second relay", || {
        client.session(&second.local_pk()).is_some()
    })
    .await?;
    assert_eq!(client.all_sessions().len(), 2);

    client.close().await?;
    first.close().await;
    second.close().await;
    Ok(())
}
