//! Configuration loading and representation.
//!
//! Everything is read once from environment-style key/value lookups. The lookup
//! is injectable so tests build configs from a map instead of mutating the
//! process environment.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_contract::TransportConfigPresence;
use courier_core::Vendor;

use crate::jobs::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
    #[error("TLS identity: {0}")]
    Tls(String),
    #[error("HTTP client: {0}")]
    HttpClient(String),
}

impl ConfigError {
    pub fn invalid(key: &'static str, value: &str, reason: impl fmt::Display) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Webhook authentication mode.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum WebhookAuthMode {
    #[default]
    None,
    ApiKey,
    Bearer,
    Hmac,
}

impl WebhookAuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ApiKey => "api_key",
            Self::Bearer => "bearer",
            Self::Hmac => "hmac",
        }
    }

    pub fn needs_secret(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for WebhookAuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookAuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "" | "none" => Ok(Self::None),
            "api_key" | "apikey" => Ok(Self::ApiKey),
            "bearer" => Ok(Self::Bearer),
            "hmac" => Ok(Self::Hmac),
            other => Err(format!("expected none, api_key, bearer or hmac, got '{other}'")),
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct VendorSettings {
    pub base_url: Option<String>,
    pub token: Option<String>,
}

impl fmt::Debug for VendorSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VendorSettings")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Raw transport settings. Any of them may be missing; transports for
/// incomplete routes are simply not built.
#[derive(Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub webhook_url: Option<String>,
    pub webhook_auth_mode: WebhookAuthMode,
    pub webhook_api_key_header: String,
    pub webhook_secret: Option<String>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub mllp_host: Option<String>,
    pub mllp_port: Option<u16>,
    pub vendors: BTreeMap<Vendor, VendorSettings>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_auth_mode: WebhookAuthMode::None,
            webhook_api_key_header: "x-api-key".to_string(),
            webhook_secret: None,
            client_cert_path: None,
            client_key_path: None,
            mllp_host: None,
            mllp_port: None,
            vendors: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("webhook_url", &self.webhook_url)
            .field("webhook_auth_mode", &self.webhook_auth_mode)
            .field("webhook_api_key_header", &self.webhook_api_key_header)
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .field("client_cert_path", &self.client_cert_path)
            .field("client_key_path", &self.client_key_path)
            .field("mllp_host", &self.mllp_host)
            .field("mllp_port", &self.mllp_port)
            .field("vendors", &self.vendors)
            .finish()
    }
}

impl TransportConfig {
    /// Which settings are present for `vendor`. Secrets are reduced to booleans.
    pub fn presence_for(&self, vendor: Vendor) -> TransportConfigPresence {
        let vendor_settings = self.vendors.get(&vendor);
        TransportConfigPresence {
            webhook_url: self.webhook_url.is_some(),
            webhook_auth_required: self.webhook_auth_mode.needs_secret(),
            webhook_auth_secret: self.webhook_secret.is_some(),
            mtls_cert: self.client_cert_path.is_some(),
            mtls_key: self.client_key_path.is_some(),
            mllp_host: self.mllp_host.is_some(),
            mllp_port: self.mllp_port.is_some(),
            vendor_base_url: vendor_settings.is_some_and(|v| v.base_url.is_some()),
            vendor_token: vendor_settings.is_some_and(|v| v.token.is_some()),
        }
    }

    fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mut vendors = BTreeMap::new();
        for (vendor, base_key, token_key) in [
            (Vendor::Epic, "DISPATCH_VENDOR_EPIC_BASE_URL", "DISPATCH_VENDOR_EPIC_TOKEN"),
            (Vendor::Cerner, "DISPATCH_VENDOR_CERNER_BASE_URL", "DISPATCH_VENDOR_CERNER_TOKEN"),
            (Vendor::Athena, "DISPATCH_VENDOR_ATHENA_BASE_URL", "DISPATCH_VENDOR_ATHENA_TOKEN"),
        ] {
            let settings = VendorSettings {
                base_url: non_empty(lookup, base_key),
                token: non_empty(lookup, token_key),
            };
            if settings != VendorSettings::default() {
                vendors.insert(vendor, settings);
            }
        }

        Ok(Self {
            webhook_url: non_empty(lookup, "DISPATCH_WEBHOOK_URL"),
            webhook_auth_mode: parsed(lookup, "DISPATCH_WEBHOOK_AUTH_MODE", WebhookAuthMode::None)?,
            webhook_api_key_header: non_empty(lookup, "DISPATCH_WEBHOOK_API_KEY_HEADER")
                .unwrap_or(defaults.webhook_api_key_header),
            webhook_secret: non_empty(lookup, "DISPATCH_WEBHOOK_SECRET"),
            client_cert_path: non_empty(lookup, "DISPATCH_WEBHOOK_CLIENT_CERT_PATH").map(PathBuf::from),
            client_key_path: non_empty(lookup, "DISPATCH_WEBHOOK_CLIENT_KEY_PATH").map(PathBuf::from),
            mllp_host: non_empty(lookup, "DISPATCH_MLLP_HOST"),
            mllp_port: optional_parsed(lookup, "DISPATCH_MLLP_PORT")?,
            vendors,
        })
    }
}

/// Engine-wide dispatch configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    /// Upper bound on one attempt, transport I/O included.
    pub attempt_timeout: Duration,
    /// How long a claim keeps other workers off a job.
    pub claim_lease: Duration,
    /// Attempts run in parallel per scheduler cycle.
    pub concurrency: usize,
    /// `attempt_count` a replayed job restarts from.
    pub replay_reset_attempts: u32,
    /// Attempt delivery right after enqueue instead of waiting for the scheduler.
    pub fast_path: bool,
    pub transport: TransportConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_millis(5_000),
            attempt_timeout: Duration::from_millis(15_000),
            claim_lease: Duration::from_millis(60_000),
            concurrency: 8,
            replay_reset_attempts: 0,
            fast_path: true,
            transport: TransportConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let jitter: f64 = parsed(&lookup, "DISPATCH_JITTER_RATIO", defaults.retry.jitter)?;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::invalid(
                "DISPATCH_JITTER_RATIO",
                &jitter.to_string(),
                "must be between 0 and 1",
            ));
        }
        let max_attempts: u32 = parsed(&lookup, "DISPATCH_MAX_ATTEMPTS", defaults.retry.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::invalid("DISPATCH_MAX_ATTEMPTS", "0", "must be at least 1"));
        }

        let retry = RetryPolicy {
            max_attempts,
            base_delay: millis(&lookup, "DISPATCH_BACKOFF_BASE_MS", defaults.retry.base_delay)?,
            max_delay: millis(&lookup, "DISPATCH_BACKOFF_MAX_MS", defaults.retry.max_delay)?,
            jitter,
        };

        let config = Self {
            retry,
            connect_timeout: millis(&lookup, "DISPATCH_CONNECT_TIMEOUT_MS", defaults.connect_timeout)?,
            attempt_timeout: millis(&lookup, "DISPATCH_ATTEMPT_TIMEOUT_MS", defaults.attempt_timeout)?,
            claim_lease: millis(&lookup, "DISPATCH_CLAIM_LEASE_MS", defaults.claim_lease)?,
            concurrency: parsed(&lookup, "DISPATCH_CONCURRENCY", defaults.concurrency)?,
            replay_reset_attempts: parsed(
                &lookup,
                "DISPATCH_REPLAY_RESET_ATTEMPTS",
                defaults.replay_reset_attempts,
            )?,
            fast_path: boolean(&lookup, "DISPATCH_FAST_PATH", defaults.fast_path)?,
            transport: TransportConfig::from_lookup(&lookup)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.claim_lease <= self.attempt_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "claim lease ({}ms) must exceed the attempt timeout ({}ms)",
                self.claim_lease.as_millis(),
                self.attempt_timeout.as_millis()
            )));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::Inconsistent(
                "backoff max delay is shorter than the base delay".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Inconsistent("concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn optional_parsed<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    non_empty(lookup, key)
        .map(|raw| raw.parse().map_err(|e| ConfigError::invalid(key, &raw, e)))
        .transpose()
}

fn parsed<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    Ok(optional_parsed(lookup, key)?.unwrap_or(default))
}

fn millis<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(optional_parsed::<_, u64>(lookup, key)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

fn boolean<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::invalid(key, &v, "expected true or false")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = DispatchConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, DispatchConfig::default());
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.fast_path);
    }

    #[test]
    fn reads_retry_and_transport_settings() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("DISPATCH_MAX_ATTEMPTS", "3"),
            ("DISPATCH_BACKOFF_BASE_MS", "1000"),
            ("DISPATCH_JITTER_RATIO", "0"),
            ("DISPATCH_FAST_PATH", "false"),
            ("DISPATCH_WEBHOOK_URL", "https://hooks.example/notes"),
            ("DISPATCH_WEBHOOK_AUTH_MODE", "HMAC"),
            ("DISPATCH_WEBHOOK_SECRET", "s3cret"),
            ("DISPATCH_MLLP_HOST", "mllp.example"),
            ("DISPATCH_MLLP_PORT", "2575"),
            ("DISPATCH_VENDOR_EPIC_BASE_URL", "https://epic.example/api"),
        ]))
        .unwrap();

        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(1));
        assert!(!config.fast_path);
        assert_eq!(config.transport.webhook_auth_mode, WebhookAuthMode::Hmac);
        assert_eq!(config.transport.mllp_port, Some(2575));

        let presence = config.transport.presence_for(Vendor::Epic);
        assert!(presence.webhook_url && presence.webhook_auth_required && presence.webhook_auth_secret);
        assert!(presence.vendor_base_url);
        assert!(!presence.vendor_token);
        assert!(!config.transport.presence_for(Vendor::Cerner).vendor_base_url);
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(matches!(
            DispatchConfig::from_lookup(lookup(&[("DISPATCH_MLLP_PORT", "not-a-port")])),
            Err(ConfigError::Invalid { key: "DISPATCH_MLLP_PORT", .. })
        ));
        assert!(matches!(
            DispatchConfig::from_lookup(lookup(&[("DISPATCH_JITTER_RATIO", "1.5")])),
            Err(ConfigError::Invalid { key: "DISPATCH_JITTER_RATIO", .. })
        ));
        assert!(matches!(
            DispatchConfig::from_lookup(lookup(&[("DISPATCH_WEBHOOK_AUTH_MODE", "basic")])),
            Err(ConfigError::Invalid { key: "DISPATCH_WEBHOOK_AUTH_MODE", .. })
        ));
    }

    #[test]
    fn claim_lease_must_outlast_attempt_timeout() {
        let result = DispatchConfig::from_lookup(lookup(&[
            ("DISPATCH_ATTEMPT_TIMEOUT_MS", "30000"),
            ("DISPATCH_CLAIM_LEASE_MS", "10000"),
        ]));
        assert!(matches!(result, Err(ConfigError::Inconsistent(_))));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("DISPATCH_WEBHOOK_SECRET", "s3cret"),
            ("DISPATCH_VENDOR_ATHENA_TOKEN", "tok-123"),
        ]))
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("s3cret"));
        assert!(!debug.contains("tok-123"));
    }
}
