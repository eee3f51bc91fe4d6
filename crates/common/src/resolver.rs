// Notebook Relay - Endpoint Resolver Module
// Turns explicit flags, discovery lookups or saved state into an endpoint

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::discovery::{DiscoveryService, Lookup};
use crate::error::{Error, Result};
use crate::state::StateStore;
use crate::types::{ConnectionMode, DiscoveryRecord, EndpointDescriptor};

/// Discovery attempt budget with linear backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `n` (1-based): `backoff * n`
    pub fn delay_before(&self, n: u32) -> Duration {
        self.backoff * n
    }

    fn budget(&self) -> u32 {
        self.attempts.max(1)
    }
}

/// Everything the resolver may draw an endpoint from
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub mode: ConnectionMode,
    /// `host[:port]` for public mode
    pub explicit_host: Option<&'a str>,
    /// Share token for private mode
    pub explicit_token: Option<&'a str>,
    /// Environment name to look up on the discovery service
    pub discovery_name: &'a str,
    /// Endpoint of the previously saved profile, if any
    pub saved: Option<&'a EndpointDescriptor>,
}

/// Where a resolved endpoint came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Explicit,
    Discovered,
    /// Last successful lookup, used while the service is unreachable
    Cached,
    Saved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub endpoint: EndpointDescriptor,
    pub source: ResolutionSource,
}

enum DiscoveryOutcome {
    Found(DiscoveryRecord),
    NotFound { attempts: u32 },
    /// At least one attempt failed at transport level
    Unreachable(Error),
}

pub struct EndpointResolver {
    store: StateStore,
    discovery: Option<Box<dyn DiscoveryService>>,
    policy: RetryPolicy,
}

impl EndpointResolver {
    pub fn new(store: StateStore, policy: RetryPolicy) -> Self {
        Self {
            store,
            discovery: None,
            policy,
        }
    }

    /// Enable auto-discovery through the given service
    pub fn with_discovery(mut self, discovery: Box<dyn DiscoveryService>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn has_discovery(&self) -> bool {
        self.discovery.is_some()
    }

    /// Produce the endpoint for `request`
    ///
    /// Explicit values win without any network call. Otherwise the discovery
    /// service is queried within the retry budget, and only when no service
    /// is configured does the saved endpoint of the same mode apply. Modes
    /// never fall back into each other.
    pub async fn resolve(&self, request: ResolveRequest<'_>) -> Result<Resolution> {
        if let Some(endpoint) = explicit_endpoint(&request)? {
            debug!("Using explicit endpoint {}", endpoint.summary());
            return Ok(Resolution {
                endpoint,
                source: ResolutionSource::Explicit,
            });
        }

        let saved = request.saved.filter(|e| e.mode() == request.mode);

        let Some(discovery) = self.discovery.as_deref() else {
            return match saved {
                Some(endpoint) => {
                    debug!("Using saved endpoint {}", endpoint.summary());
                    Ok(Resolution {
                        endpoint: endpoint.clone(),
                        source: ResolutionSource::Saved,
                    })
                }
                None => Err(Error::InvalidArguments(match request.mode {
                    ConnectionMode::Public => {
                        "no endpoint known: pass --host or an account token for discovery"
                            .to_string()
                    }
                    ConnectionMode::Private => {
                        "no endpoint known: pass --token or an account token for discovery"
                            .to_string()
                    }
                })),
            };
        };

        match self
            .discover(discovery, request.discovery_name, request.mode)
            .await?
        {
            DiscoveryOutcome::Found(record) => {
                if let Err(e) = self.store.cache_discovery(&record) {
                    warn!("Failed to cache discovery result: {}", e);
                }
                Ok(Resolution {
                    endpoint: record.endpoint,
                    source: ResolutionSource::Discovered,
                })
            }
            DiscoveryOutcome::NotFound { attempts } => Err(Error::EndpointNotFound {
                profile: request.discovery_name.to_string(),
                attempts,
            }),
            DiscoveryOutcome::Unreachable(err) => {
                let cached = self
                    .store
                    .cached_discovery(request.discovery_name)?
                    .filter(|r| r.endpoint.mode() == request.mode);

                if let Some(record) = cached {
                    warn!(
                        "Discovery service unreachable, using cached endpoint {}",
                        record.endpoint.summary()
                    );
                    return Ok(Resolution {
                        endpoint: record.endpoint,
                        source: ResolutionSource::Cached,
                    });
                }
                if let Some(endpoint) = saved {
                    warn!(
                        "Discovery service unreachable, using saved endpoint {}",
                        endpoint.summary()
                    );
                    return Ok(Resolution {
                        endpoint: endpoint.clone(),
                        source: ResolutionSource::Saved,
                    });
                }
                Err(err)
            }
        }
    }

    async fn discover(
        &self,
        discovery: &dyn DiscoveryService,
        name: &str,
        mode: ConnectionMode,
    ) -> Result<DiscoveryOutcome> {
        let budget = self.policy.budget();
        let mut transport_error = None;

        for attempt in 1..=budget {
            debug!("Discovery attempt {}/{} for '{}'", attempt, budget, name);

            match discovery.lookup(name, mode).await {
                Ok(Lookup::Found(record)) => {
                    info!(
                        "Discovered {} endpoint for '{}' on attempt {}",
                        mode, name, attempt
                    );
                    return Ok(DiscoveryOutcome::Found(record));
                }
                Ok(Lookup::NotFound) => {
                    debug!("No {} endpoint published for '{}' yet", mode, name);
                }
                Err(e @ Error::AuthenticationRejected(_)) => return Err(e),
                Err(e) => {
                    warn!("Discovery attempt {} failed: {}", attempt, e);
                    transport_error = Some(e);
                }
            }

            if attempt < budget {
                tokio::time::sleep(self.policy.delay_before(attempt)).await;
            }
        }

        Ok(match transport_error {
            Some(err) => DiscoveryOutcome::Unreachable(err),
            None => DiscoveryOutcome::NotFound { attempts: budget },
        })
    }
}

fn explicit_endpoint(request: &ResolveRequest<'_>) -> Result<Option<EndpointDescriptor>> {
    match (request.explicit_host, request.explicit_token) {
        (Some(_), Some(_)) => Err(Error::InvalidArguments(
            "--host and --token are mutually exclusive".to_string(),
        )),
        (Some(host), None) => {
            if request.mode != ConnectionMode::Public {
                return Err(Error::InvalidArguments(
                    "--host requires public mode".to_string(),
                ));
            }
            EndpointDescriptor::public_from_str(host).map(Some)
        }
        (None, Some(token)) => {
            if request.mode != ConnectionMode::Private {
                return Err(Error::InvalidArguments(
                    "--token requires private mode".to_string(),
                ));
            }
            EndpointDescriptor::private_from_token(token).map(Some)
        }
        (None, None) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Scripted discovery service counting its calls
    struct ScriptedDiscovery {
        calls: Arc<AtomicU32>,
        /// Calls answered with `failure` before the record is returned
        failures_before_success: u32,
        failure: fn() -> Result<Lookup>,
        token: &'static str,
    }

    #[async_trait]
    impl DiscoveryService for ScriptedDiscovery {
        async fn lookup(&self, name: &str, _mode: ConnectionMode) -> Result<Lookup> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures_before_success {
                return (self.failure)();
            }
            Ok(Lookup::Found(DiscoveryRecord {
                profile_name: name.to_string(),
                endpoint: EndpointDescriptor::Private {
                    share_token: self.token.to_string(),
                },
                created_at: None,
            }))
        }
    }

    fn not_found() -> Result<Lookup> {
        Ok(Lookup::NotFound)
    }

    fn offline() -> Result<Lookup> {
        Err(Error::Discovery("connection refused".to_string()))
    }

    fn rejected() -> Result<Lookup> {
        Err(Error::AuthenticationRejected("401".to_string()))
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 5,
            backoff: Duration::ZERO,
        }
    }

    fn resolver_with(
        dir: &TempDir,
        failures_before_success: u32,
        failure: fn() -> Result<Lookup>,
    ) -> (EndpointResolver, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let discovery = ScriptedDiscovery {
            calls: Arc::clone(&calls),
            failures_before_success,
            failure,
            token: "found123",
        };
        let store = StateStore::new(dir.path().join("state.toml"));
        let resolver =
            EndpointResolver::new(store, fast_policy()).with_discovery(Box::new(discovery));
        (resolver, calls)
    }

    fn discovery_request() -> ResolveRequest<'static> {
        ResolveRequest {
            mode: ConnectionMode::Private,
            explicit_host: None,
            explicit_token: None,
            discovery_name: "kaggle_server",
            saved: None,
        }
    }

    #[test]
    fn test_backoff_increases_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), Duration::from_secs(2));
        assert_eq!(policy.delay_before(3), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_explicit_value_skips_discovery() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, calls) = resolver_with(&temp_dir, 0, not_found);

        let resolution = resolver
            .resolve(ResolveRequest {
                explicit_token: Some("xyz789"),
                ..discovery_request()
            })
            .await
            .unwrap();

        assert_eq!(resolution.source, ResolutionSource::Explicit);
        assert_eq!(
            resolution.endpoint,
            EndpointDescriptor::Private {
                share_token: "xyz789".to_string()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_explicit_value_must_match_mode() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _) = resolver_with(&temp_dir, 0, not_found);

        let result = resolver
            .resolve(ResolveRequest {
                explicit_host: Some("example.com"),
                ..discovery_request()
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidArguments(_))));

        let result = resolver
            .resolve(ResolveRequest {
                explicit_host: Some("example.com"),
                explicit_token: Some("xyz789"),
                ..discovery_request()
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn test_succeeds_after_k_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, calls) = resolver_with(&temp_dir, 3, not_found);

        let resolution = resolver.resolve(discovery_request()).await.unwrap();
        assert_eq!(resolution.source, ResolutionSource::Discovered);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        // Successful lookups are cached for offline retries
        let store = StateStore::new(temp_dir.path().join("state.toml"));
        assert!(store.cached_discovery("kaggle_server").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_always_not_found_exhausts_budget() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, calls) = resolver_with(&temp_dir, u32::MAX, not_found);

        let result = resolver.resolve(discovery_request()).await;
        assert!(matches!(
            result,
            Err(Error::EndpointNotFound { attempts: 5, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_authentication_rejected_is_not_retried() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, calls) = resolver_with(&temp_dir, u32::MAX, rejected);

        let result = resolver.resolve(discovery_request()).await;
        assert!(matches!(result, Err(Error::AuthenticationRejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_offline_falls_back_to_cache() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.toml"));
        store
            .cache_discovery(&DiscoveryRecord {
                profile_name: "kaggle_server".to_string(),
                endpoint: EndpointDescriptor::Private {
                    share_token: "cached1".to_string(),
                },
                created_at: None,
            })
            .unwrap();

        let (resolver, calls) = resolver_with(&temp_dir, u32::MAX, offline);
        let resolution = resolver.resolve(discovery_request()).await.unwrap();

        assert_eq!(resolution.source, ResolutionSource::Cached);
        assert_eq!(
            resolution.endpoint,
            EndpointDescriptor::Private {
                share_token: "cached1".to_string()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_offline_without_cache_reports_discovery_error() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _) = resolver_with(&temp_dir, u32::MAX, offline);

        let result = resolver.resolve(discovery_request()).await;
        assert!(matches!(result, Err(Error::Discovery(_))));
    }

    #[tokio::test]
    async fn test_saved_endpoint_used_only_for_same_mode() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.toml"));
        let resolver = EndpointResolver::new(store, fast_policy());

        let saved = EndpointDescriptor::Public {
            host: "abc123.share.example.io".to_string(),
            port: 22,
        };

        let resolution = resolver
            .resolve(ResolveRequest {
                mode: ConnectionMode::Public,
                saved: Some(&saved),
                ..discovery_request()
            })
            .await
            .unwrap();
        assert_eq!(resolution.source, ResolutionSource::Saved);
        assert_eq!(resolution.endpoint, saved);

        // A saved public host never satisfies a private request
        let result = resolver
            .resolve(ResolveRequest {
                saved: Some(&saved),
                ..discovery_request()
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidArguments(_))));
    }
}
