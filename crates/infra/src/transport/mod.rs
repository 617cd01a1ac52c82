//! Delivery transports.
//!
//! A transport makes exactly one delivery attempt and reports how it went. It
//! never touches the job store; turning an outcome into a state transition is
//! the executor's job.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use courier_core::{Clock, DispatchTarget, Vendor};

use crate::config::{ConfigError, DispatchConfig};
use crate::error::DispatchError;
use crate::jobs::DispatchJob;

pub mod http;
pub mod mllp;
pub mod vendor;
pub mod webhook;

pub use mllp::MllpTransport;
pub use vendor::VendorApiTransport;
pub use webhook::{WebhookAuth, WebhookTransport};

/// Why an attempt did not deliver.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No answer within the attempt or ACK timeout.
    Timeout,
    /// Connect failure or reset.
    Connection,
    /// 408, 425 or 429.
    Throttled,
    /// 5xx.
    ServerError,
    /// MLLP application error ACK (AE/CE).
    Nak,
    /// Unparseable or truncated response.
    Protocol,
    /// 4xx other than the throttling codes.
    ClientError,
    /// 3xx; redirects are not followed.
    Redirect,
    /// MLLP application reject ACK (AR/CR).
    Rejected,
    /// Payload does not satisfy the route's contract.
    Contract,
    /// The request could not be built (bad URL, bad header value).
    InvalidRequest,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Connection
                | Self::Throttled
                | Self::ServerError
                | Self::Nak
                | Self::Protocol
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Throttled => "throttled",
            Self::ServerError => "server_error",
            Self::Nak => "nak",
            Self::Protocol => "protocol",
            Self::ClientError => "client_error",
            Self::Redirect => "redirect",
            Self::Rejected => "rejected",
            Self::Contract => "contract",
            Self::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed attempt, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TransportFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The counterparty accepted the payload; the id is the proof of delivery.
    Delivered { external_message_id: String },
    Failed(TransportFailure),
}

impl DeliveryOutcome {
    pub fn delivered(external_message_id: impl Into<String>) -> Self {
        Self::Delivered {
            external_message_id: external_message_id.into(),
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed(TransportFailure::new(kind, message))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn target(&self) -> DispatchTarget;

    /// Whether this transport can reach `vendor`. Transports that do not care
    /// about the vendor accept all of them.
    fn supports(&self, vendor: Vendor) -> bool {
        let _ = vendor;
        true
    }

    async fn deliver(&self, job: &DispatchJob) -> DeliveryOutcome;
}

/// Transports by target.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: BTreeMap<DispatchTarget, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport under its own target, replacing any previous one.
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.target(), transport);
    }

    pub fn with(mut self, transport: Arc<dyn Transport>) -> Self {
        self.register(transport);
        self
    }

    /// Build every transport the configuration has enough settings for.
    ///
    /// `clock` stamps signed webhook requests.
    pub fn from_config(config: &DispatchConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        let transport = &config.transport;

        match WebhookTransport::from_config(transport, config.connect_timeout, config.attempt_timeout, clock)? {
            Some(webhook) => registry.register(Arc::new(webhook)),
            None => tracing::warn!(transport = "webhook", "transport not configured; jobs routed there will not be attempted"),
        }
        match MllpTransport::from_config(transport, config.connect_timeout, config.attempt_timeout) {
            Some(mllp) => registry.register(Arc::new(mllp)),
            None => tracing::warn!(transport = "mllp", "transport not configured; jobs routed there will not be attempted"),
        }
        match VendorApiTransport::from_config(transport, config.connect_timeout, config.attempt_timeout)? {
            Some(vendor) => registry.register(Arc::new(vendor)),
            None => tracing::warn!(transport = "vendor_api", "transport not configured; jobs routed there will not be attempted"),
        }

        Ok(registry)
    }

    /// The transport for a job's route.
    pub fn resolve(
        &self,
        target: DispatchTarget,
        vendor: Vendor,
    ) -> Result<Arc<dyn Transport>, DispatchError> {
        self.transports
            .get(&target)
            .filter(|t| t.supports(vendor))
            .cloned()
            .ok_or(DispatchError::TransportNotConfigured { target, vendor })
    }

    pub fn targets(&self) -> impl Iterator<Item = DispatchTarget> + '_ {
        self.transports.keys().copied()
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("targets", &self.transports.keys().collect::<Vec<_>>())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use testing::ScriptedTransport;

    #[test]
    fn retryable_classification() {
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::ServerError.is_retryable());
        assert!(FailureKind::Throttled.is_retryable());
        assert!(!FailureKind::ClientError.is_retryable());
        assert!(!FailureKind::Rejected.is_retryable());
        assert!(!FailureKind::Contract.is_retryable());
    }

    #[test]
    fn failure_display_leads_with_kind() {
        let failure = TransportFailure::timeout("no response within 15000ms");
        assert_eq!(failure.to_string(), "timeout: no response within 15000ms");
    }

    #[test]
    fn resolve_reports_unconfigured_target() {
        let registry = TransportRegistry::new().with(ScriptedTransport::always(
            DispatchTarget::Webhook,
            DeliveryOutcome::delivered("x"),
        ));

        assert!(registry.resolve(DispatchTarget::Webhook, Vendor::Generic).is_ok());
        assert!(matches!(
            registry.resolve(DispatchTarget::Mllp, Vendor::Generic),
            Err(DispatchError::TransportNotConfigured {
                target: DispatchTarget::Mllp,
                vendor: Vendor::Generic
            })
        ));
    }
}
