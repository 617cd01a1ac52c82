//! HL7 v2 over MLLP.
//!
//! Frame: `0x0B <message> 0x1C 0x0D`. One connection per attempt; the
//! receiver's ACK is read back within the attempt timeout and judged by `MSA-1`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use courier_contract::hl7;
use courier_core::DispatchTarget;

use crate::config::TransportConfig;
use crate::jobs::DispatchJob;

use super::{DeliveryOutcome, FailureKind, Transport};

pub const START_BLOCK: u8 = 0x0B;
pub const END_BLOCK: u8 = 0x1C;
pub const CARRIAGE_RETURN: u8 = 0x0D;

/// Bound on an ACK frame; anything larger is treated as a protocol error.
const MAX_ACK_BYTES: usize = 64 * 1024;

/// Wrap an HL7 message in an MLLP frame.
///
/// The message is sent byte for byte. Only LF and CRLF segment separators are
/// rewritten to the CR the protocol requires; segment content, including
/// leading and trailing whitespace, is never touched.
pub fn encode_frame(message: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(message.len() + 3);
    frame.push(START_BLOCK);
    let mut bytes = message.bytes().peekable();
    while let Some(byte) = bytes.next() {
        match byte {
            b'\r' if bytes.peek() == Some(&b'\n') => {
                bytes.next();
                frame.push(CARRIAGE_RETURN);
            }
            b'\n' => frame.push(CARRIAGE_RETURN),
            other => frame.push(other),
        }
    }
    frame.push(END_BLOCK);
    frame.push(CARRIAGE_RETURN);
    frame
}

/// Message body of a complete frame, or `None` if the frame is not complete yet.
///
/// Anything before the start block is line noise and is skipped.
pub fn decode_frame(buf: &[u8]) -> Option<&[u8]> {
    let start = buf.iter().position(|&b| b == START_BLOCK)?;
    let body = &buf[start + 1..];
    let end = body.windows(2).position(|w| w == [END_BLOCK, CARRIAGE_RETURN])?;
    Some(&body[..end])
}

/// Judge an ACK message. `fallback_id` is used when the ACK carries no control id.
pub fn interpret_ack(ack: &str, fallback_id: &str) -> DeliveryOutcome {
    let segments = hl7::segments(ack);
    let Some(msa) = segments.iter().find(|s| hl7::segment_id(s) == "MSA") else {
        return DeliveryOutcome::failed(FailureKind::Protocol, "ACK has no MSA segment");
    };
    let code = hl7::field(msa, 1).unwrap_or("").trim();
    let detail = hl7::field(msa, 3)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| {
            segments
                .iter()
                .find(|s| hl7::segment_id(s) == "ERR")
                .and_then(|err| hl7::field(err, 3).or_else(|| hl7::field(err, 1)))
        })
        .unwrap_or("no detail");

    match code {
        "AA" | "CA" => {
            let id = hl7::field(msa, 2)
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .unwrap_or(fallback_id);
            DeliveryOutcome::delivered(id)
        }
        "AE" | "CE" => DeliveryOutcome::failed(FailureKind::Nak, format!("MSA-1 {code}: {detail}")),
        "AR" | "CR" => DeliveryOutcome::failed(FailureKind::Rejected, format!("MSA-1 {code}: {detail}")),
        other => DeliveryOutcome::failed(FailureKind::Protocol, format!("unknown MSA-1 code '{other}'")),
    }
}

#[derive(Debug, Clone)]
pub struct MllpTransport {
    addr: String,
    connect_timeout: Duration,
    ack_timeout: Duration,
}

impl MllpTransport {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration, ack_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            ack_timeout,
        }
    }

    pub fn from_config(
        config: &TransportConfig,
        connect_timeout: Duration,
        ack_timeout: Duration,
    ) -> Option<Self> {
        let host = config.mllp_host.as_deref()?;
        let port = config.mllp_port?;
        Some(Self::new(format!("{host}:{port}"), connect_timeout, ack_timeout))
    }

    async fn exchange(&self, frame: &[u8]) -> Result<String, DeliveryOutcome> {
        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(DeliveryOutcome::failed(
                    FailureKind::Connection,
                    format!("connection to {} failed: {e}", self.addr),
                ));
            }
            Err(_) => {
                return Err(DeliveryOutcome::failed(
                    FailureKind::Timeout,
                    format!("connect to {} timed out", self.addr),
                ));
            }
        };

        match timeout(self.ack_timeout, write_and_read_ack(&mut stream, frame)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryOutcome::failed(
                FailureKind::Timeout,
                format!("no ACK from {} within {}ms", self.addr, self.ack_timeout.as_millis()),
            )),
        }
    }
}

async fn write_and_read_ack(stream: &mut TcpStream, frame: &[u8]) -> Result<String, DeliveryOutcome> {
    let io_failure = |e: std::io::Error| DeliveryOutcome::failed(FailureKind::Connection, format!("connection error: {e}"));

    stream.write_all(frame).await.map_err(io_failure)?;
    stream.flush().await.map_err(io_failure)?;

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(body) = decode_frame(&buf) {
            return Ok(String::from_utf8_lossy(body).into_owned());
        }
        if buf.len() > MAX_ACK_BYTES {
            return Err(DeliveryOutcome::failed(FailureKind::Protocol, "ACK frame too large"));
        }
        let n = stream.read(&mut chunk).await.map_err(io_failure)?;
        if n == 0 {
            return Err(DeliveryOutcome::failed(
                FailureKind::Connection,
                "connection closed before a complete ACK frame",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[async_trait]
impl Transport for MllpTransport {
    fn target(&self) -> DispatchTarget {
        DispatchTarget::Mllp
    }

    async fn deliver(&self, job: &DispatchJob) -> DeliveryOutcome {
        let Some(message) = hl7::message_text(job.payload().value()) else {
            return DeliveryOutcome::failed(FailureKind::Contract, "payload carries no HL7 message");
        };
        let control_id = hl7::segments(message)
            .first()
            .and_then(|msh| hl7::field(msh, 10))
            .unwrap_or_default()
            .to_owned();

        let frame = encode_frame(message);
        match self.exchange(&frame).await {
            Ok(ack) => {
                let fallback = if control_id.is_empty() { job.id.to_string() } else { control_id };
                interpret_ack(&ack, &fallback)
            }
            Err(outcome) => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACK_AA: &str = "MSH|^~\\&|EHR|HOSP|COURIER|CLINIC|20260101120001||ACK^T02|ACK0001|P|2.5.1\rMSA|AA|MSG0001";

    fn body(frame: &[u8]) -> &[u8] {
        assert_eq!(frame.first(), Some(&START_BLOCK));
        assert!(frame.ends_with(&[END_BLOCK, CARRIAGE_RETURN]));
        &frame[1..frame.len() - 2]
    }

    #[test]
    fn frame_carries_the_message_byte_for_byte() {
        let message = "MSH|^~\\&|COURIER|CLINIC|EHR|HOSP|20260301090000||MDM^T02|MSG0001|P|2.5.1\rOBX|1|TX|NOTE||  indented text  \r";
        assert_eq!(body(&encode_frame(message)), message.as_bytes());
    }

    #[test]
    fn frame_rewrites_only_line_feed_separators() {
        let frame = encode_frame("MSH|^~\\&|A\nPID|1 \r\nOBX|1|TX|  note  ");
        assert_eq!(body(&frame), b"MSH|^~\\&|A\rPID|1 \rOBX|1|TX|  note  ");
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let mut buf = vec![START_BLOCK];
        buf.extend_from_slice(b"MSA|AA|1\r");
        assert_eq!(decode_frame(&buf), None);
        buf.extend_from_slice(&[END_BLOCK, CARRIAGE_RETURN]);
        assert_eq!(decode_frame(&buf), Some(&b"MSA|AA|1\r"[..]));
    }

    #[test]
    fn decode_skips_noise_before_start_block() {
        let mut buf = b"\r\nnoise".to_vec();
        assert_eq!(decode_frame(&buf), None);
        buf.push(START_BLOCK);
        buf.extend_from_slice(b"MSA|AA|1");
        buf.extend_from_slice(&[END_BLOCK, CARRIAGE_RETURN]);
        assert_eq!(decode_frame(&buf), Some(&b"MSA|AA|1"[..]));
    }

    #[test]
    fn decode_needs_end_block_followed_by_carriage_return() {
        let mut buf = vec![START_BLOCK];
        buf.extend_from_slice(b"MSA|AA|1");
        buf.push(END_BLOCK);
        assert_eq!(decode_frame(&buf), None);
        buf.push(CARRIAGE_RETURN);
        assert_eq!(decode_frame(&buf), Some(&b"MSA|AA|1"[..]));
    }

    #[test]
    fn accept_ack_yields_control_id() {
        assert_eq!(interpret_ack(ACK_AA, "fallback"), DeliveryOutcome::delivered("MSG0001"));
    }

    #[test]
    fn error_ack_is_retryable_and_reject_is_not() {
        let ae = interpret_ack("MSH|^~\\&|X\rMSA|AE|MSG0001|Database busy", "f");
        let DeliveryOutcome::Failed(failure) = ae else { panic!("expected failure") };
        assert_eq!(failure.kind, FailureKind::Nak);
        assert!(failure.is_retryable());
        assert!(failure.message.contains("Database busy"));

        let ar = interpret_ack("MSH|^~\\&|X\rMSA|AR|MSG0001", "f");
        let DeliveryOutcome::Failed(failure) = ar else { panic!("expected failure") };
        assert_eq!(failure.kind, FailureKind::Rejected);
        assert!(!failure.is_retryable());
    }

    #[test]
    fn ack_without_msa_is_protocol_error() {
        let outcome = interpret_ack("MSH|^~\\&|X", "f");
        assert!(matches!(outcome, DeliveryOutcome::Failed(f) if f.kind == FailureKind::Protocol));
    }
}
