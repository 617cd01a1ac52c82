use serde::{Deserialize, Serialize};

use courier_core::ContractType;

/// A single reason a payload does not satisfy its contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractViolation {
    /// JSON pointer (or HL7 segment) the violation refers to; empty for the whole payload.
    pub path: String,
    pub message: String,
}

impl ContractViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl core::fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

impl std::error::Error for ContractViolation {}

/// Outcome of validating a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub ok: bool,
    /// Contract the payload was checked against, when the route has one.
    pub contract_type: Option<ContractType>,
    pub errors: Vec<ContractViolation>,
}

impl ValidationReport {
    pub fn from_errors(contract_type: ContractType, errors: Vec<ContractViolation>) -> Self {
        Self {
            ok: errors.is_empty(),
            contract_type: Some(contract_type),
            errors,
        }
    }

    pub fn rejected(contract_type: Option<ContractType>, errors: Vec<ContractViolation>) -> Self {
        Self {
            ok: false,
            contract_type,
            errors,
        }
    }

    /// All violations joined into one line (used for `last_error`).
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}
