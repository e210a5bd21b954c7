//! ICE server resolution with a shared in-flight fetch

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::IceSettings;
use crate::error::{Error, Result};

use super::{CredentialResponse, CredentialSource, HttpCredentialSource};

/// Lifetime assumed when the endpoint omits `ttl`
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// One server entry handed to a peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.credential.is_some()
    }
}

/// Relay servers issued together; replaced, never mutated, on refresh
#[derive(Debug, Clone)]
pub struct IceServerSet {
    servers: Vec<IceServer>,
    issued_at: Instant,
    ttl: Duration,
}

impl IceServerSet {
    pub fn new(servers: Vec<IceServer>, ttl: Duration) -> Self {
        Self {
            servers,
            issued_at: Instant::now(),
            ttl,
        }
    }

    pub fn servers(&self) -> &[IceServer] {
        &self.servers
    }

    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.ttl
    }

    /// True once `ratio` of the lifetime has elapsed
    pub fn refresh_due(&self, ratio: f64, now: Instant) -> bool {
        now.duration_since(self.issued_at) >= self.ttl.mul_f64(ratio)
    }

    /// Normalize an endpoint response
    ///
    /// Raw username/password without `ice_servers` expand to the standard
    /// UDP, TCP and TLS relay URLs on `fallback_host`.
    pub fn from_response(response: CredentialResponse, fallback_host: Option<&str>) -> Result<Self> {
        let ttl = response.ttl.map(Duration::from_secs).unwrap_or(DEFAULT_TTL);

        let servers: Vec<IceServer> = match response.ice_servers {
            Some(raw) => raw
                .into_iter()
                .map(|s| IceServer {
                    urls: s.urls,
                    username: s.username,
                    credential: s.credential,
                })
                .collect(),
            None => match (response.username, response.password) {
                (Some(username), Some(password)) => {
                    let host = response
                        .host
                        .as_deref()
                        .or(fallback_host)
                        .ok_or_else(|| Error::credential_fetch("raw credentials without a relay host"))?;
                    vec![IceServer {
                        urls: vec![
                            format!("turn:{}:3478?transport=udp", host),
                            format!("turn:{}:3478?transport=tcp", host),
                            format!("turns:{}:5349?transport=tcp", host),
                        ],
                        username: Some(username),
                        credential: Some(password),
                    }]
                }
                _ => Vec::new(),
            },
        };

        if !servers.iter().any(IceServer::has_credentials) {
            return Err(Error::credential_fetch("response contained no relay servers"));
        }

        Ok(Self::new(servers, ttl))
    }
}

type SharedFetch = Shared<BoxFuture<'static, std::result::Result<Arc<IceServerSet>, String>>>;

#[derive(Default)]
struct ResolverState {
    cached: Option<Arc<IceServerSet>>,
    in_flight: Option<(u64, SharedFetch)>,
    generation: u64,
}

/// Builds the STUN/relay server list for new connections
pub struct IceConfigResolver {
    stun_servers: Vec<String>,
    refresh_ratio: f64,
    source: Option<Arc<dyn CredentialSource>>,
    state: Mutex<ResolverState>,
}

impl IceConfigResolver {
    pub fn new(
        stun_servers: Vec<String>,
        refresh_ratio: f64,
        source: Option<Arc<dyn CredentialSource>>,
    ) -> Self {
        Self {
            stun_servers,
            refresh_ratio,
            source,
            state: Mutex::new(ResolverState::default()),
        }
    }

    /// Resolver for `[ice]`; STUN only when no token URL is configured
    pub fn from_settings(settings: &IceSettings) -> Result<Self> {
        let source: Option<Arc<dyn CredentialSource>> = match settings.token_url {
            Some(ref url) => Some(Arc::new(HttpCredentialSource::new(
                url.clone(),
                Duration::from_millis(settings.fetch_timeout_ms),
            )?)),
            None => None,
        };
        Ok(Self::new(
            settings.stun_servers.clone(),
            settings.refresh_ratio,
            source,
        ))
    }

    pub fn stun_only(&self) -> Vec<IceServer> {
        self.stun_servers.iter().cloned().map(IceServer::stun).collect()
    }

    /// Servers for the next connection attempt
    ///
    /// Never fails: without credentials the list degrades to STUN only.
    pub async fn get_ice_servers(&self, auth_token: Option<&str>) -> Vec<IceServer> {
        let (Some(_), Some(token)) = (&self.source, auth_token) else {
            return self.stun_only();
        };

        match self.get_credentials(token).await {
            Ok(set) => {
                let mut servers = self.stun_only();
                servers.extend(set.servers().iter().cloned());
                servers
            }
            Err(e) => {
                warn!(error = %e, "Relay credentials unavailable, continuing with STUN only");
                self.stun_only()
            }
        }
    }

    /// Cached relay credentials, fetching when missing or due for refresh
    ///
    /// Concurrent callers share one fetch.
    pub async fn get_credentials(&self, auth_token: &str) -> Result<Arc<IceServerSet>> {
        let (generation, fetch) = {
            let mut state = self.state.lock();

            if let Some(ref cached) = state.cached {
                if !cached.refresh_due(self.refresh_ratio, Instant::now()) {
                    return Ok(Arc::clone(cached));
                }
            }

            match state.in_flight {
                Some((generation, ref fetch)) => (generation, fetch.clone()),
                None => {
                    let source = self
                        .source
                        .clone()
                        .ok_or_else(|| Error::credential_fetch("no credential endpoint configured"))?;
                    let fetch = start_fetch(source, auth_token.to_string());
                    let generation = state.generation;
                    state.in_flight = Some((generation, fetch.clone()));
                    (generation, fetch)
                }
            }
        };

        let result = fetch.await;

        let mut state = self.state.lock();
        if matches!(state.in_flight, Some((g, _)) if g == generation) {
            state.in_flight = None;
            if let Ok(ref set) = result {
                info!(
                    servers = set.servers().len(),
                    ttl_secs = set.ttl.as_secs(),
                    "Relay credentials refreshed"
                );
                state.cached = Some(Arc::clone(set));
            }
        }

        result.map_err(Error::credential_fetch)
    }

    /// Drop the cache and fetch a new set
    pub async fn force_refresh(&self, auth_token: &str) -> Result<Arc<IceServerSet>> {
        self.clear_cache();
        self.get_credentials(auth_token).await
    }

    /// Forget cached credentials and detach any in-flight fetch
    pub fn clear_cache(&self) {
        let mut state = self.state.lock();
        state.cached = None;
        state.in_flight = None;
        state.generation += 1;
        debug!("ICE credential cache cleared");
    }
}

fn start_fetch(source: Arc<dyn CredentialSource>, token: String) -> SharedFetch {
    async move {
        let response = source.fetch(&token).await.map_err(|e| e.to_string())?;
        let host = source.default_relay_host();
        IceServerSet::from_response(response, host.as_deref())
            .map(Arc::new)
            .map_err(|e| e.to_string())
    }
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::RawIceServer;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        calls: AtomicUsize,
        fail: bool,
        ttl: u64,
    }

    impl FakeSource {
        fn new(ttl: u64) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), fail: false, ttl })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), fail: true, ttl: 0 })
        }
    }

    #[async_trait]
    impl CredentialSource for FakeSource {
        async fn fetch(&self, _token: &str) -> Result<CredentialResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(Error::credential_fetch("HTTP 503"));
            }
            Ok(CredentialResponse {
                ice_servers: Some(vec![RawIceServer {
                    urls: vec![format!("turn:relay.test:3478?gen={}", n)],
                    username: Some("user".into()),
                    credential: Some("pass".into()),
                }]),
                ttl: Some(self.ttl),
                ..Default::default()
            })
        }
    }

    fn resolver(source: Arc<dyn CredentialSource>) -> IceConfigResolver {
        IceConfigResolver::new(vec!["stun:stun.test:19302".into()], 0.8, Some(source))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_fetch() {
        let source = FakeSource::new(100);
        let resolver = resolver(source.clone());

        let (a, b, c) = tokio::join!(
            resolver.get_credentials("tok"),
            resolver.get_credentials("tok"),
            resolver.get_credentials("tok"),
        );

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert!(c.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuse_until_eighty_percent_of_ttl() {
        let source = FakeSource::new(100);
        let resolver = resolver(source.clone());

        resolver.get_credentials("tok").await.unwrap();
        tokio::time::sleep(Duration::from_secs(79)).await;
        resolver.get_credentials("tok").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let (a, b) = tokio::join!(resolver.get_credentials("tok"), resolver.get_credentials("tok"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(a.unwrap().servers()[0].urls[0].ends_with("gen=1"));
        assert!(b.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_falls_back_to_stun() {
        let resolver = resolver(FakeSource::failing());

        let servers = resolver.get_ice_servers(Some("tok")).await;
        assert_eq!(servers, vec![IceServer::stun("stun:stun.test:19302")]);

        let err = resolver.get_credentials("tok").await.unwrap_err();
        assert!(matches!(err, Error::CredentialFetch { .. }));
    }

    #[tokio::test]
    async fn test_no_token_means_stun_only() {
        let source = FakeSource::new(100);
        let resolver = resolver(source.clone());

        let servers = resolver.get_ice_servers(None).await;
        assert_eq!(servers.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_ice_servers_merges_stun_and_relay() {
        let resolver = resolver(FakeSource::new(100));
        let servers = resolver.get_ice_servers(Some("tok")).await;
        assert_eq!(servers.len(), 2);
        assert!(servers[1].has_credentials());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_and_clear_cache() {
        let source = FakeSource::new(1000);
        let resolver = resolver(source.clone());

        resolver.get_credentials("tok").await.unwrap();
        resolver.force_refresh("tok").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        resolver.clear_cache();
        resolver.get_credentials("tok").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_raw_credentials_synthesize_relay_urls() {
        let response = CredentialResponse {
            username: Some("u".into()),
            password: Some("p".into()),
            ttl: Some(600),
            ..Default::default()
        };
        let set = IceServerSet::from_response(response, Some("relay.test")).unwrap();
        assert_eq!(
            set.servers()[0].urls,
            vec![
                "turn:relay.test:3478?transport=udp",
                "turn:relay.test:3478?transport=tcp",
                "turns:relay.test:5349?transport=tcp",
            ]
        );
    }

    #[test]
    fn test_empty_response_is_an_error() {
        let err = IceServerSet::from_response(CredentialResponse::default(), Some("relay.test")).unwrap_err();
        assert!(matches!(err, Error::CredentialFetch { .. }));

        // STUN-only entries do not count as relay servers
        let response = CredentialResponse {
            ice_servers: Some(vec![RawIceServer {
                urls: vec!["stun:relay.test".into()],
                username: None,
                credential: None,
            }]),
            ..Default::default()
        };
        assert!(IceServerSet::from_response(response, None).is_err());
    }
}
