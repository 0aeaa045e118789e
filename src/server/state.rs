//! Shared application state for the serving process.

use crate::common::{AppError, ServerConfig, TransferSettings};
use crate::crypto::keys::{self, EncryptionKey, SALT_LEN};
use crate::crypto::Token;
use crate::host::SessionStore;
use crate::metrics::MetricSink;
use crate::transfer::{BufferPools, ChecksumCache, LimiterRegistry, ProgressAggregator};
use dashmap::DashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// PAKE sessions die this long after init.
pub const PAKE_EXPIRY: Duration = Duration::from_secs(60);
/// Failed handshakes allowed per client address.
pub const MAX_PAKE_FAILURES: u32 = 5;

/// Server-side PAKE handshake awaiting confirmation, keyed by peer address.
pub struct PakeSession {
    pub key: [u8; 32],
    /// The peer's public message (their X)
    pub client_message: Vec<u8>,
    /// Our public message (Y)
    pub server_message: Vec<u8>,
    pub expires_at: Instant,
}

impl PakeSession {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Handshake registry plus per-address failure accounting.
#[derive(Default)]
pub struct PakeRegistry {
    pub sessions: DashMap<String, PakeSession>,
    failures: DashMap<String, u32>,
}

impl PakeRegistry {
    pub fn too_many_failures(&self, ip: &str) -> bool {
        self.failures.get(ip).map(|f| *f).unwrap_or(0) >= MAX_PAKE_FAILURES
    }

    pub fn record_failure(&self, ip: &str) {
        *self.failures.entry(ip.to_string()).or_insert(0) += 1;
    }
}

/// Cheaply cloned handle to server state stored behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub config: ServerConfig,
    pub token: Token,
    pub settings: TransferSettings,
    /// Announced via /d/encrypt-info when a password is configured
    pub salt: Option<[u8; SALT_LEN]>,
    /// token -> key currently armed for the download path
    pub keys: DashMap<String, EncryptionKey>,
    pub sessions: SessionStore,
    pub progress: ProgressAggregator,
    pub pools: BufferPools,
    pub checksums: ChecksumCache,
    pub limiters: Option<Arc<LimiterRegistry>>,
    pub pake: PakeRegistry,
    pub metrics: Arc<dyn MetricSink>,
}

impl Deref for AppState {
    type Target = AppStateInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl AppState {
    pub fn new(config: ServerConfig, metrics: Arc<dyn MetricSink>) -> Self {
        let token = Token::generate();
        let progress = ProgressAggregator::new();
        let keys = DashMap::new();

        // Password mode: seed the token with the derived key so downloads
        // encrypt even before any PAKE handshake rebinds it
        let salt = config.password.as_ref().map(|password| {
            let salt = keys::random_salt();
            keys.insert(
                token.as_str().to_string(),
                EncryptionKey::derive(password, &salt),
            );
            salt
        });

        let limiters = config
            .rate_limit_mbps
            .map(|mbps| Arc::new(LimiterRegistry::new(mbps)));

        Self {
            inner: Arc::new(AppStateInner {
                token,
                settings: TransferSettings::default(),
                salt,
                keys,
                sessions: SessionStore::new(progress.clone()),
                progress,
                pools: BufferPools::new(),
                checksums: ChecksumCache::new(),
                limiters,
                pake: PakeRegistry::default(),
                metrics,
                config,
            }),
        }
    }

    /// Gate every privileged URL: the path token must byte-match ours
    /// before the handler touches anything on disk.
    pub fn authorize(&self, candidate: &str) -> Result<(), AppError> {
        if self.token.matches(candidate) {
            Ok(())
        } else {
            tracing::warn!("rejected request with mismatched token");
            Err(AppError::Forbidden("invalid token".to_string()))
        }
    }

    /// Key currently bound to our token, if encryption is armed.
    pub fn active_key(&self) -> Option<EncryptionKey> {
        self.keys.get(self.token.as_str()).map(|k| k.value().clone())
    }

    /// Rebind the token to a PAKE-agreed key; the download path picks it
    /// up on the next request.
    pub fn bind_key(&self, key: EncryptionKey) {
        self.keys.insert(self.token.as_str().to_string(), key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ServerConfig;
    use crate::metrics::NoopMetrics;

    fn state_with(config: ServerConfig) -> AppState {
        AppState::new(config, Arc::new(NoopMetrics))
    }

    #[test]
    fn authorize_requires_exact_token() {
        let state = state_with(ServerConfig::send_text("hello".into()));
        let token = state.token.as_str().to_string();

        assert!(state.authorize(&token).is_ok());
        assert!(state.authorize(&format!("{}!", token)).is_err());
        assert!(state.authorize("").is_err());
    }

    #[test]
    fn password_arms_encryption() {
        let mut config = ServerConfig::send_text("hello".into());
        config.password = Some("secret".into());
        let state = state_with(config);

        assert!(state.salt.is_some());
        assert!(state.active_key().is_some());

        // A PAKE rebinding replaces the derived key
        let fresh = EncryptionKey::random();
        state.bind_key(fresh.clone());
        assert_eq!(state.active_key().unwrap(), fresh);
    }

    #[test]
    fn no_password_means_no_key() {
        let state = state_with(ServerConfig::send_text("hello".into()));
        assert!(state.salt.is_none());
        assert!(state.active_key().is_none());
    }

    #[test]
    fn pake_failure_accounting() {
        let state = state_with(ServerConfig::send_text("hello".into()));
        let ip = "10.1.1.1";
        assert!(!state.pake.too_many_failures(ip));
        for _ in 0..MAX_PAKE_FAILURES {
            state.pake.record_failure(ip);
        }
        assert!(state.pake.too_many_failures(ip));
        assert!(!state.pake.too_many_failures("10.1.1.2"));
    }
}
