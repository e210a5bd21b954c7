//! Relay credential endpoint client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Server entry as returned by the endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawIceServer {
    /// A single URL or a list of them
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Body of `POST /turn-token`
///
/// Either `ice_servers` is present, or raw `username`/`password` are and
/// the caller synthesizes the relay URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialResponse {
    #[serde(default)]
    pub ice_servers: Option<Vec<RawIceServer>>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, alias = "credential")]
    pub password: Option<String>,
    /// Relay host for synthesized URLs
    #[serde(default)]
    pub host: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub ttl: Option<u64>,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// Where relay credentials come from
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, auth_token: &str) -> Result<CredentialResponse>;

    /// Host used when the response has raw credentials but no host
    fn default_relay_host(&self) -> Option<String> {
        None
    }
}

/// `POST <token_url>` with bearer auth
pub struct HttpCredentialSource {
    client: Client,
    url: String,
}

impl HttpCredentialSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self, auth_token: &str) -> Result<CredentialResponse> {
        debug!(url = %self.url, "Fetching relay credentials");

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", auth_token))
            .send()
            .await
            .map_err(|e| Error::credential_fetch(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::credential_fetch(format!("HTTP {}: {}", status, body)));
        }

        response
            .json::<CredentialResponse>()
            .await
            .map_err(|e| Error::credential_fetch(format!("invalid response body: {}", e)))
    }

    fn default_relay_host(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serves one HTTP exchange and hands back the raw request head
    async fn serve_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/turn-token", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let _ = tx.send(String::from_utf8_lossy(&request).into_owned());

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        (url, rx)
    }

    #[tokio::test]
    async fn test_fetch_posts_with_bearer_token() {
        let (url, request) = serve_once(
            "200 OK",
            r#"{"ice_servers":[{"urls":"turn:relay.test:3478","username":"u","credential":"p"}],"ttl":3600}"#,
        )
        .await;

        let source = HttpCredentialSource::new(url, Duration::from_secs(5)).unwrap();
        let response = source.fetch("node-secret").await.unwrap();

        let head = request.await.unwrap();
        assert!(head.starts_with("POST /turn-token HTTP/1.1\r\n"));
        assert!(head
            .lines()
            .any(|line| line.eq_ignore_ascii_case("authorization: Bearer node-secret")));

        let servers = response.ice_servers.unwrap();
        assert_eq!(servers[0].urls, vec!["turn:relay.test:3478"]);
        assert_eq!(servers[0].credential.as_deref(), Some("p"));
        assert_eq!(response.ttl, Some(3600));
    }

    #[tokio::test]
    async fn test_fetch_maps_http_error_status() {
        let (url, _request) = serve_once("401 Unauthorized", r#"{"error":"bad token"}"#).await;

        let source = HttpCredentialSource::new(url, Duration::from_secs(5)).unwrap();
        let err = source.fetch("wrong").await.unwrap_err();

        assert!(matches!(err, Error::CredentialFetch { .. }));
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn test_parse_ice_servers_response() {
        let body = r#"{
            "ice_servers": [
                {"urls": "stun:relay.test:3478"},
                {"urls": ["turn:relay.test:3478?transport=udp"], "username": "u", "credential": "p"}
            ],
            "ttl": 86400
        }"#;
        let parsed: CredentialResponse = serde_json::from_str(body).unwrap();
        let servers = parsed.ice_servers.unwrap();
        assert_eq!(servers[0].urls, vec!["stun:relay.test:3478"]);
        assert_eq!(servers[1].username.as_deref(), Some("u"));
        assert_eq!(parsed.ttl, Some(86400));
    }

    #[test]
    fn test_parse_raw_credentials() {
        let parsed: CredentialResponse =
            serde_json::from_str(r#"{"username":"1700000000:node","password":"secret","ttl":600}"#).unwrap();
        assert!(parsed.ice_servers.is_none());
        assert_eq!(parsed.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_default_relay_host_from_url() {
        let source =
            HttpCredentialSource::new("https://relay.example.net/turn-token", Duration::from_secs(5)).unwrap();
        assert_eq!(source.default_relay_host().as_deref(), Some("relay.example.net"));
    }
}
