//! Sandbox readiness: is a route configured well enough to attempt delivery?
//!
//! Only presence is checked. Whether a URL resolves or a secret is correct is
//! left to the first real attempt.

use serde::{Deserialize, Serialize};

use courier_core::{DispatchTarget, Vendor};

use crate::profile::profile_for;

/// Which transport/auth settings are present for one vendor.
///
/// Built by the configuration layer; secrets themselves never pass through here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfigPresence {
    pub webhook_url: bool,
    /// The configured webhook auth mode needs a secret (api key, token, HMAC key).
    pub webhook_auth_required: bool,
    pub webhook_auth_secret: bool,
    pub mtls_cert: bool,
    pub mtls_key: bool,
    pub mllp_host: bool,
    pub mllp_port: bool,
    pub vendor_base_url: bool,
    pub vendor_token: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxReadiness {
    pub target: DispatchTarget,
    pub vendor: Vendor,
    pub ready: bool,
    pub missing: Vec<String>,
}

pub fn sandbox_readiness(
    target: DispatchTarget,
    vendor: Vendor,
    presence: &TransportConfigPresence,
) -> SandboxReadiness {
    let mut missing: Vec<&'static str> = Vec::new();

    if profile_for(target, vendor).is_none() {
        missing.push("contract_profile");
    }

    match target {
        DispatchTarget::Webhook => {
            if !presence.webhook_url {
                missing.push("webhook_url");
            }
            if presence.webhook_auth_required && !presence.webhook_auth_secret {
                missing.push("webhook_auth_secret");
            }
            // mTLS is optional, but half a key pair is a misconfiguration.
            if presence.mtls_cert != presence.mtls_key {
                missing.push(if presence.mtls_cert { "mtls_client_key" } else { "mtls_client_cert" });
            }
        }
        DispatchTarget::Mllp => {
            if !presence.mllp_host {
                missing.push("mllp_host");
            }
            if !presence.mllp_port {
                missing.push("mllp_port");
            }
        }
        DispatchTarget::VendorApi => {
            if vendor != Vendor::Generic {
                if !presence.vendor_base_url {
                    missing.push("vendor_base_url");
                }
                if !presence.vendor_token {
                    missing.push("vendor_token");
                }
            }
        }
    }

    SandboxReadiness {
        target,
        vendor,
        ready: missing.is_empty(),
        missing: missing.into_iter().map(String::from).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_configuration_is_not_ready() {
        let r = sandbox_readiness(DispatchTarget::Mllp, Vendor::Epic, &TransportConfigPresence::default());
        assert!(!r.ready);
        assert_eq!(r.missing, vec!["mllp_host", "mllp_port"]);
    }

    #[test]
    fn webhook_without_auth_needs_only_url() {
        let presence = TransportConfigPresence {
            webhook_url: true,
            ..Default::default()
        };
        assert!(sandbox_readiness(DispatchTarget::Webhook, Vendor::Generic, &presence).ready);
    }

    #[test]
    fn webhook_auth_mode_requires_secret() {
        let presence = TransportConfigPresence {
            webhook_url: true,
            webhook_auth_required: true,
            ..Default::default()
        };
        let r = sandbox_readiness(DispatchTarget::Webhook, Vendor::Generic, &presence);
        assert_eq!(r.missing, vec!["webhook_auth_secret"]);
    }

    #[test]
    fn half_configured_mtls_is_reported() {
        let presence = TransportConfigPresence {
            webhook_url: true,
            mtls_cert: true,
            ..Default::default()
        };
        let r = sandbox_readiness(DispatchTarget::Webhook, Vendor::Epic, &presence);
        assert_eq!(r.missing, vec!["mtls_client_key"]);
    }

    #[test]
    fn unsupported_route_is_never_ready() {
        let presence = TransportConfigPresence {
            vendor_base_url: true,
            vendor_token: true,
            ..Default::default()
        };
        let r = sandbox_readiness(DispatchTarget::VendorApi, Vendor::Generic, &presence);
        assert_eq!(r.missing, vec!["contract_profile"]);
        assert!(sandbox_readiness(DispatchTarget::VendorApi, Vendor::Athena, &presence).ready);
    }
}
