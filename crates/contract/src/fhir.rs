//! FHIR R4 `Bundle` shape checks.
//!
//! Structural only: resource types, bundle type and the presence of the
//! resources a finalized encounter document needs. No terminology binding.

use serde_json::Value;

use crate::violation::ContractViolation;

const BUNDLE_TYPES: &[&str] = &["document", "message", "transaction", "batch", "collection"];

pub fn check_bundle(payload: &Value) -> Vec<ContractViolation> {
    let mut errors = Vec::new();

    let Some(obj) = payload.as_object() else {
        errors.push(ContractViolation::new("", "FHIR payload must be a JSON object"));
        return errors;
    };

    if obj.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        errors.push(ContractViolation::new("/resourceType", "must be \"Bundle\""));
    }

    let bundle_type = obj.get("type").and_then(Value::as_str);
    match bundle_type {
        Some(t) if BUNDLE_TYPES.contains(&t) => {}
        Some(t) => errors.push(ContractViolation::new(
            "/type",
            format!("unsupported bundle type '{t}'"),
        )),
        None => errors.push(ContractViolation::new("/type", "is required")),
    }

    let entries = match obj.get("entry").and_then(Value::as_array) {
        Some(entries) if !entries.is_empty() => entries,
        _ => {
            errors.push(ContractViolation::new("/entry", "must be a non-empty array"));
            return errors;
        }
    };

    let mut resource_types = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        match entry.pointer("/resource/resourceType").and_then(Value::as_str) {
            Some(rt) if !rt.is_empty() => resource_types.push(rt),
            _ => errors.push(ContractViolation::new(
                format!("/entry/{idx}/resource/resourceType"),
                "is required",
            )),
        }
    }

    // R4: a document bundle starts with its Composition.
    let first_type = entries
        .first()
        .and_then(|e| e.pointer("/resource/resourceType"))
        .and_then(Value::as_str);
    if bundle_type == Some("document") && first_type != Some("Composition") {
        errors.push(ContractViolation::new(
            "/entry/0/resource",
            "document bundle must start with a Composition",
        ));
    }

    if !resource_types.contains(&"Patient") {
        errors.push(ContractViolation::new("/entry", "must include a Patient resource"));
    }

    errors
}
