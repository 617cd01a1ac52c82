//! Vendor note profiles: required fields and request mapping.
//!
//! The workflow hands over one normalized bundle; each vendor API expects
//! its own body. [`map_vendor_request`] produces that body, and
//! [`check_fields`] guarantees the mapping has everything it needs.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use thiserror::Error;

use courier_core::Vendor;

use crate::violation::ContractViolation;

/// A vendor-shaped HTTP request, relative to the vendor's configured base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct VendorRequest {
    pub path: String,
    pub body: Value,
    /// Response body keys holding the vendor's id for the created record, in priority order.
    pub external_id_keys: &'static [&'static str],
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("vendor '{0}' has no API mapping")]
    Unsupported(Vendor),
    #[error("payload does not satisfy the {0} note contract")]
    Invalid(Vendor),
}

fn required_fields(vendor: Vendor) -> &'static [&'static str] {
    match vendor {
        Vendor::Generic => &[],
        Vendor::Epic => &["/patient/id", "/encounter/id", "/note/content", "/note/type"],
        Vendor::Cerner => &["/patient/id", "/encounter/id", "/note/content"],
        Vendor::Athena => &["/patient/id", "/departmentId", "/note/content"],
    }
}

pub fn check_fields(vendor: Vendor, payload: &Value) -> Vec<ContractViolation> {
    if vendor == Vendor::Generic {
        return vec![ContractViolation::new("", "generic vendor has no API profile")];
    }
    if !payload.is_object() {
        return vec![ContractViolation::new("", "vendor payload must be a JSON object")];
    }

    required_fields(vendor)
        .iter()
        .filter(|ptr| !is_present(payload.pointer(ptr)))
        .map(|ptr| ContractViolation::new(*ptr, "is required"))
        .collect()
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Number(_)) => true,
        Some(_) => false,
    }
}

fn text(payload: &Value, ptr: &str) -> Option<String> {
    match payload.pointer(ptr)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Build the vendor-specific request for a validated payload.
pub fn map_vendor_request(vendor: Vendor, payload: &Value) -> Result<VendorRequest, MappingError> {
    if vendor == Vendor::Generic {
        return Err(MappingError::Unsupported(vendor));
    }
    if !check_fields(vendor, payload).is_empty() {
        return Err(MappingError::Invalid(vendor));
    }
    let field = |ptr: &str| text(payload, ptr).ok_or(MappingError::Invalid(vendor));

    let request = match vendor {
        Vendor::Epic => VendorRequest {
            path: "clinical-notes".to_string(),
            body: json!({
                "PatientID": field("/patient/id")?,
                "PatientIDType": "FHIR",
                "EncounterID": field("/encounter/id")?,
                "NoteType": field("/note/type")?,
                "NoteText": field("/note/content")?,
                "Status": "Signed",
            }),
            external_id_keys: &["NoteID", "id"],
        },
        Vendor::Cerner => VendorRequest {
            path: "DocumentReference".to_string(),
            body: json!({
                "resourceType": "DocumentReference",
                "status": "current",
                "docStatus": "final",
                "subject": { "reference": format!("Patient/{}", field("/patient/id")?) },
                "context": {
                    "encounter": [{ "reference": format!("Encounter/{}", field("/encounter/id")?) }]
                },
                "content": [{
                    "attachment": {
                        "contentType": "text/plain",
                        "data": BASE64.encode(field("/note/content")?),
                    }
                }],
            }),
            external_id_keys: &["id"],
        },
        Vendor::Athena => VendorRequest {
            path: format!("patients/{}/documents/clinicaldocument", field("/patient/id")?),
            body: json!({
                "departmentid": field("/departmentId")?,
                "documentsubclass": "CLINICALDOCUMENT",
                "internalnote": field("/note/content")?,
            }),
            external_id_keys: &["clinicaldocumentid", "documentid"],
        },
        Vendor::Generic => return Err(MappingError::Unsupported(vendor)),
    };

    Ok(request)
}
