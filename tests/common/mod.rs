#![allow(dead_code)] // Not every scenario file uses every helper

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use dmsg_client::Client;
use dmsg_core::{BackoffConfig, ClientConfig, RetryConfig, ServerConfig};
use dmsg_crypto::Keypair;
use dmsg_disc::MemoryDiscovery;
use dmsg_relay::{NoopMetrics, Server};
use tokio::net::TcpListener;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Fail instead of hanging when `fut` does not finish in time.
pub async fn within<F: Future>(what: &str, fut: F) -> anyhow::Result<F::Output> {
    tokio::time::timeout(STEP_TIMEOUT, fut)
        .await
        .map_err(|_| anyhow!("timed out waiting for {what}"))
}

/// Poll `cond` until it holds.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) -> anyhow::Result<()> {
    within(what, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
}

pub fn fast_client_config() -> ClientConfig {
    ClientConfig {
        backoff: BackoffConfig::new(Duration::from_millis(50), Duration::from_millis(500), 2.0),
        retry: RetryConfig {
            backoff: BackoffConfig::new(Duration::from_millis(20), Duration::from_millis(200), 2.0),
            tries: 0,
        },
        ..ClientConfig::default()
    }
}

pub async fn start_relay(disc: &Arc<MemoryDiscovery>) -> anyhow::Result<Server> {
    dmsg_logging::try_init_for_tests();
    let server = Server::new(
        Keypair::generate(),
        disc.clone(),
        ServerConfig::default(),
        Arc::new(NoopMetrics),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let serving = server.clone();
    tokio::spawn(async move {
        if let Err(e) = serving.serve(listener, None).await {
            tracing::warn!(error = %e, "Relay stopped");
        }
    });
    within("relay ready", server.ready()).await?;
    Ok(server)
}

/// Start a client and wait until its entry lists a relay.
pub async fn start_client(disc: &Arc<MemoryDiscovery>) -> anyhow::Result<Client> {
    start_client_with(disc, fast_client_config()).await
}

pub async fn start_client_with(
    disc: &Arc<MemoryDiscovery>,
    config: ClientConfig,
) -> anyhow::Result<Client> {
    dmsg_logging::try_init_for_tests();
    let client = Client::new(Keypair::generate(), disc.clone(), config);
    let serving = client.clone();
    tokio::spawn(async move { serving.serve().await });
    within("client ready", client.ready())
        .await
        .context("client never published a delegated server")?;
    Ok(client)
}

/// Wait until the relay has registered `n` client sessions.
pub async fn relay_sessions(relay: &Server, n: usize) -> anyhow::Result<()> {
    eventually("relay sessions", || relay.session_count() == n).await
}
