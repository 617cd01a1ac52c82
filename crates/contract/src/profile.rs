//! Route → contract profile table.

use serde_json::Value;

use courier_core::{ContractType, DispatchTarget, Vendor};

use crate::violation::{ContractViolation, ValidationReport};
use crate::{fhir, hl7, vendor};

/// Schema/mapping profile for one (target, vendor) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractProfile {
    pub target: DispatchTarget,
    pub vendor: Vendor,
    pub contract_type: ContractType,
}

/// Look up the profile for a route. `None` means the route is unsupported.
pub fn profile_for(target: DispatchTarget, vendor: Vendor) -> Option<ContractProfile> {
    let contract_type = match (target, vendor) {
        (DispatchTarget::Webhook, Vendor::Generic) => ContractType::None,
        (DispatchTarget::Webhook, _) => ContractType::FhirR4Bundle,
        (DispatchTarget::Mllp, _) => ContractType::Hl7V2,
        (DispatchTarget::VendorApi, Vendor::Generic) => return None,
        (DispatchTarget::VendorApi, _) => ContractType::VendorNote,
    };

    Some(ContractProfile {
        target,
        vendor,
        contract_type,
    })
}

impl ContractProfile {
    pub fn check(&self, payload: &Value) -> ValidationReport {
        let errors = match self.contract_type {
            ContractType::None => check_none(payload),
            ContractType::FhirR4Bundle => fhir::check_bundle(payload),
            ContractType::Hl7V2 => hl7::check_payload(payload),
            ContractType::VendorNote => vendor::check_fields(self.vendor, payload),
        };
        ValidationReport::from_errors(self.contract_type, errors)
    }
}

fn check_none(payload: &Value) -> Vec<ContractViolation> {
    if payload.is_null() {
        vec![ContractViolation::new("", "payload must not be null")]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_pair_except_generic_vendor_api_has_a_profile() {
        for target in DispatchTarget::ALL {
            for vendor in Vendor::ALL {
                let supported = profile_for(target, vendor).is_some();
                let expected = !(target == DispatchTarget::VendorApi && vendor == Vendor::Generic);
                assert_eq!(supported, expected, "{target}/{vendor}");
            }
        }
    }

    #[test]
    fn mllp_always_uses_hl7() {
        for vendor in Vendor::ALL {
            let profile = profile_for(DispatchTarget::Mllp, vendor).unwrap();
            assert_eq!(profile.contract_type, ContractType::Hl7V2);
        }
    }
}
