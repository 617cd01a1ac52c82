//! `courier-contract`: payload contracts per (target, vendor) route.
//!
//! Pure functions only: no network I/O, no storage. The engine calls
//! [`validate`] before a job is created and again before every attempt, and
//! operators call [`sandbox_readiness`] before enabling real delivery.

pub mod fhir;
pub mod hl7;
pub mod profile;
pub mod readiness;
pub mod vendor;
pub mod violation;

pub use profile::{ContractProfile, profile_for};
pub use readiness::{SandboxReadiness, TransportConfigPresence, sandbox_readiness};
pub use vendor::{MappingError, VendorRequest, map_vendor_request};
pub use violation::{ContractViolation, ValidationReport};

use courier_core::{DispatchTarget, Vendor};
use serde_json::Value;

/// Validate a payload against the profile of its route.
///
/// An unsupported (target, vendor) pair is reported as a violation rather
/// than an error so callers handle every rejection through one path.
pub fn validate(target: DispatchTarget, vendor: Vendor, payload: &Value) -> ValidationReport {
    match profile_for(target, vendor) {
        Some(profile) => profile.check(payload),
        None => ValidationReport::rejected(
            None,
            vec![ContractViolation::new(
                "",
                format!("no contract profile for {}/{}", target, vendor),
            )],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::ContractType;
    use serde_json::json;

    #[test]
    fn generic_webhook_accepts_any_document() {
        let report = validate(DispatchTarget::Webhook, Vendor::Generic, &json!({"note": "x"}));
        assert!(report.ok);
        assert_eq!(report.contract_type, Some(ContractType::None));
    }

    #[test]
    fn vendor_api_without_vendor_has_no_profile() {
        let report = validate(DispatchTarget::VendorApi, Vendor::Generic, &json!({}));
        assert!(!report.ok);
        assert_eq!(report.contract_type, None);
        assert!(report.errors[0].message.contains("vendor_api/generic"));
    }
}
