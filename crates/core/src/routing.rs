//! Routing metadata attached to every dispatch job.
//!
//! `DispatchTarget` picks the transport family, `Vendor` picks the contract
//! profile and field mapping, and `ContractType` records which payload shape
//! the job was validated against.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Transport family used to deliver a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchTarget {
    /// Generic HTTP webhook.
    Webhook,
    /// HL7 v2 over MLLP-framed TCP.
    Mllp,
    /// Vendor-specific HTTP API.
    VendorApi,
}

impl DispatchTarget {
    pub const ALL: [DispatchTarget; 3] = [Self::Webhook, Self::Mllp, Self::VendorApi];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Mllp => "mllp",
            Self::VendorApi => "vendor_api",
        }
    }
}

/// Vendor profile of the receiving system.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    #[default]
    Generic,
    Epic,
    Cerner,
    Athena,
}

impl Vendor {
    pub const ALL: [Vendor; 4] = [Self::Generic, Self::Epic, Self::Cerner, Self::Athena];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Epic => "epic",
            Self::Cerner => "cerner",
            Self::Athena => "athena",
        }
    }
}

/// Payload shape a job was validated against.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    /// No-op profile: any JSON document is accepted.
    None,
    /// FHIR R4 `Bundle` resource.
    FhirR4Bundle,
    /// Pipe-delimited HL7 v2 message.
    Hl7V2,
    /// Vendor-specific note submission.
    VendorNote,
}

impl ContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::FhirR4Bundle => "fhir_r4_bundle",
            Self::Hl7V2 => "hl7_v2",
            Self::VendorNote => "vendor_note",
        }
    }
}

macro_rules! impl_str_enum {
    ($t:ty, $kind:literal, [$($variant:expr),+ $(,)?]) => {
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let needle = s.trim().to_ascii_lowercase();
                [$($variant),+]
                    .into_iter()
                    .find(|v: &$t| v.as_str() == needle)
                    .ok_or_else(|| DomainError::unknown($kind, s))
            }
        }
    };
}

impl_str_enum!(DispatchTarget, "target", [DispatchTarget::Webhook, DispatchTarget::Mllp, DispatchTarget::VendorApi]);
impl_str_enum!(Vendor, "vendor", [Vendor::Generic, Vendor::Epic, Vendor::Cerner, Vendor::Athena]);
impl_str_enum!(
    ContractType,
    "contract type",
    [ContractType::None, ContractType::FhirR4Bundle, ContractType::Hl7V2, ContractType::VendorNote]
);
