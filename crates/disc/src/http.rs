use std::time::Duration;

use async_trait::async_trait;
use dmsg_core::PublicKey;
use dmsg_crypto::Keypair;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::client::{put_entry_iteration, DiscoveryClient};
use crate::entry::Entry;
use crate::error::{DiscError, Result};

/// Error body returned by the discovery service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpMessage {
    pub message: String,
    #[serde(default)]
    pub code: u16,
}

/// [`DiscoveryClient`] talking to a dmsg-discovery HTTP service.
pub struct HttpDiscovery {
    client: reqwest::Client,
    address: String,
    update_mx: Mutex<()>,
}

impl HttpDiscovery {
    pub fn new(address: &str) -> Result<Self> {
        Self::with_timeout(address, Duration::from_secs(30))
    }

    pub fn with_timeout(address: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let address = address.trim_end_matches('/').to_string();
        debug!(addr = %address, "Created HTTP discovery client");
        Ok(Self {
            client,
            address,
            update_mx: Mutex::new(()),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/dmsg-discovery/{}", self.address, path)
    }

    /// Non-200 responses carry an [`HttpMessage`] naming the error.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message: HttpMessage = resp.json().await?;
        error!(status = status.as_u16(), body = %message.message, "Discovery request failed");
        Err(DiscError::from_message(&message.message))
    }
}

#[async_trait]
impl DiscoveryClient for HttpDiscovery {
    async fn entry(&self, pk: &PublicKey) -> Result<Entry> {
        let resp = self.client.get(self.endpoint(&format!("entry/{pk}"))).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn post_entry(&self, entry: &Entry) -> Result<()> {
        let resp = self
            .client
            .post(self.endpoint("entry/"))
            .query(&[("timeout", "true")])
            .json(entry)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn del_entry(&self, entry: &Entry) -> Result<()> {
        let resp = self
            .client
            .delete(self.endpoint("entry"))
            .json(entry)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn available_servers(&self) -> Result<Vec<Entry>> {
        let resp = self.client.get(self.endpoint("available_servers")).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn all_servers(&self) -> Result<Vec<Entry>> {
        let resp = self.client.get(self.endpoint("all_servers")).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn all_entries(&self) -> Result<Vec<String>> {
        let resp = self.client.get(self.endpoint("entries")).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn put_entry(&self, keypair: &Keypair, entry: &mut Entry) -> Result<()> {
        // Serialises sequence bumps from this process.
        let _guard = self.update_mx.lock().await;
        put_entry_iteration(self, keypair, entry).await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::error::ValidationError;

    fn signed_server(kp: &Keypair) -> Entry {
        let mut entry = Entry::new_server(kp.public_key(), 0, "127.0.0.1:8081", 7);
        entry.sign(kp).unwrap();
        entry
    }

    #[tokio::test]
    async fn test_get_entry() {
        let server = MockServer::start().await;
        let kp = Keypair::generate();
        let entry = signed_server(&kp);

        Mock::given(method("GET"))
            .and(path(format!("/dmsg-discovery/entry/{}", kp.public_key())))
            .respond_with(ResponseTemplate::new(200).set_body_json(&entry))
            .mount(&server)
            .await;

        let disc = HttpDiscovery::new(&server.uri()).unwrap();
        assert_eq!(disc.entry(&kp.public_key()).await.unwrap(), entry);
    }

    #[tokio::test]
    async fn test_error_message_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(HttpMessage {
                message: "entry of public key is not found".to_string(),
                code: 404,
            }))
            .mount(&server)
            .await;

        let disc = HttpDiscovery::new(&server.uri()).unwrap();
        let err = disc.entry(&Keypair::generate().public_key()).await.unwrap_err();
        assert!(matches!(err, DiscError::KeyNotFound));
    }

    #[tokio::test]
    async fn test_post_entry_sends_timeout_flag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/dmsg-discovery/entry/"))
            .and(query_param("timeout", "true"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let disc = HttpDiscovery::new(&server.uri()).unwrap();
        disc.post_entry(&signed_server(&Keypair::generate())).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_entry_restores_sequence_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_json(HttpMessage {
                message: DiscError::Validation(ValidationError::OutdatedTime).to_string(),
                code: 422,
            }))
            .mount(&server)
            .await;

        let kp = Keypair::generate();
        let mut entry = signed_server(&kp);
        let disc = HttpDiscovery::new(&server.uri()).unwrap();

        let err = disc.put_entry(&kp, &mut entry).await.unwrap_err();
        assert!(matches!(
            err,
            DiscError::Validation(ValidationError::OutdatedTime)
        ));
        assert_eq!(entry.sequence, 0);
    }

    #[tokio::test]
    async fn test_available_servers() {
        let server = MockServer::start().await;
        let entries = vec![
            signed_server(&Keypair::generate()),
            signed_server(&Keypair::generate()),
        ];
        Mock::given(method("GET"))
            .and(path("/dmsg-discovery/available_servers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&entries))
            .mount(&server)
            .await;

        let disc = HttpDiscovery::new(&format!("{}/", server.uri())).unwrap();
        assert_eq!(disc.available_servers().await.unwrap(), entries);
    }
}
