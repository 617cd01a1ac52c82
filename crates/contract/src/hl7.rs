//! HL7 v2 segment presence checks and minimal segment/field access.

use serde_json::Value;

use crate::violation::ContractViolation;

/// Segments carrying the clinical document body; at least one is required.
const CONTENT_SEGMENTS: &[&str] = &["TXA", "OBX"];

/// Extract the pipe-delimited message from a payload.
///
/// Accepts either a bare JSON string or an object with an `hl7` field.
pub fn message_text(payload: &Value) -> Option<&str> {
    payload
        .as_str()
        .or_else(|| payload.get("hl7").and_then(Value::as_str))
}

/// Split a message into segments. Accepts `\r` (standard) and `\n` separators.
pub fn segments(message: &str) -> Vec<&str> {
    message
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Three-letter id of a segment (`MSH`, `PID`, ...).
pub fn segment_id(segment: &str) -> &str {
    segment.get(..3).unwrap_or(segment)
}

/// HL7 field `n` of a segment (1-based, as numbered in the standard).
///
/// MSH is special: MSH-1 is the field separator itself, so the split is offset by one.
pub fn field(segment: &str, n: usize) -> Option<&str> {
    let is_msh = segment_id(segment) == "MSH";
    if is_msh && n == 1 {
        return Some("|");
    }
    let idx = if is_msh { n.checked_sub(1)? } else { n };
    segment.split('|').nth(idx).filter(|f| !f.is_empty())
}

pub fn check_payload(payload: &Value) -> Vec<ContractViolation> {
    match message_text(payload) {
        Some(message) => check_message(message),
        None => vec![ContractViolation::new(
            "/hl7",
            "HL7 payload must be a string or an object with an 'hl7' string field",
        )],
    }
}

pub fn check_message(message: &str) -> Vec<ContractViolation> {
    let segs = segments(message);
    let mut errors = Vec::new();

    let Some(msh) = segs.first().filter(|s| s.starts_with("MSH|")) else {
        errors.push(ContractViolation::new("MSH", "message must start with an MSH segment"));
        return errors;
    };

    if field(msh, 2).map(str::len) != Some(4) {
        errors.push(ContractViolation::new("MSH-2", "encoding characters must be four characters"));
    }
    if field(msh, 9).is_none() {
        errors.push(ContractViolation::new("MSH-9", "message type is required"));
    }
    if field(msh, 10).is_none() {
        errors.push(ContractViolation::new("MSH-10", "message control id is required"));
    }
    match field(msh, 12) {
        Some(v) if v.starts_with("2.") => {}
        Some(v) => errors.push(ContractViolation::new(
            "MSH-12",
            format!("unsupported version '{v}'"),
        )),
        None => errors.push(ContractViolation::new("MSH-12", "version id is required")),
    }

    let ids: Vec<&str> = segs.iter().map(|s| segment_id(s)).collect();
    if !ids.contains(&"PID") {
        errors.push(ContractViolation::new("PID", "patient identification segment is required"));
    }
    if !CONTENT_SEGMENTS.iter().any(|c| ids.contains(c)) {
        errors.push(ContractViolation::new(
            "TXA|OBX",
            "at least one document content segment is required",
        ));
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MDM: &str = "MSH|^~\\&|COURIER|CLINIC|EHR|HOSP|20260101120000||MDM^T02|MSG0001|P|2.5.1\rPID|1||12345^^^MRN\rTXA|1|CN|TX\rOBX|1|TX|NOTE||Follow up in two weeks";

    #[test]
    fn accepts_mdm_message() {
        assert!(check_payload(&json!({"hl7": MDM})).is_empty());
        assert!(check_payload(&json!(MDM)).is_empty());
    }

    #[test]
    fn msh_fields_are_offset_by_one() {
        let msh = segments(MDM)[0];
        assert_eq!(field(msh, 1), Some("|"));
        assert_eq!(field(msh, 2), Some("^~\\&"));
        assert_eq!(field(msh, 9), Some("MDM^T02"));
        assert_eq!(field(msh, 10), Some("MSG0001"));
        assert_eq!(field(msh, 12), Some("2.5.1"));
    }

    #[test]
    fn missing_segments_are_reported() {
        let errors = check_message("MSH|^~\\&|A|B|C|D|20260101||ORU^R01|1|P|2.3");
        let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["PID", "TXA|OBX"]);
    }

    #[test]
    fn rejects_payload_without_message() {
        let errors = check_payload(&json!({"note": "plain"}));
        assert_eq!(errors[0].path, "/hl7");
    }

    #[test]
    fn rejects_message_not_starting_with_msh() {
        let errors = check_message("PID|1||12345");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "MSH");
    }
}
