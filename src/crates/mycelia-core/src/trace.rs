//! Remote-parent trace propagation across broker hops
//!
//! A [`TraceContext`] is the W3C traceparent carried as hex bytes of the
//! form `version || trace_id || span_id || flags` concatenated without
//! separators (52 ASCII characters). Empty bytes mean "no parent". The
//! engine only propagates the context; exporting spans is the host
//! application's concern.

use crate::error::{Error, Result};

const VERSION: u8 = 0x00;
const FLAG_SAMPLED: u8 = 0x01;
const ENCODED_LENGTH: usize = 2 * (1 + 16 + 8 + 1);

/// A propagated trace parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    pub version: u8,
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub flags: u8,
}

impl TraceContext {
    /// Mint a fresh root context with random trace and span ids
    pub fn root() -> Self {
        Self {
            version: VERSION,
            trace_id: rand::random(),
            span_id: rand::random(),
            flags: FLAG_SAMPLED,
        }
    }

    /// Derive a child context: same trace id, fresh span id
    pub fn child(&self) -> Self {
        Self {
            span_id: rand::random(),
            ..*self
        }
    }

    /// Serialize to the concatenated-hex wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(1 + 16 + 8 + 1);
        raw.push(self.version);
        raw.extend_from_slice(&self.trace_id);
        raw.extend_from_slice(&self.span_id);
        raw.push(self.flags);
        hex::encode(raw).into_bytes()
    }

    /// Parse the wire form; empty bytes decode to `None`
    pub fn from_bytes(bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.is_empty() {
            return Ok(None);
        }

        if bytes.len() != ENCODED_LENGTH {
            return Err(Error::Codec(format!(
                "trace context has {} bytes, expected {ENCODED_LENGTH}",
                bytes.len()
            )));
        }

        let raw = hex::decode(bytes)
            .map_err(|error| Error::Codec(format!("bad trace context hex: {error}")))?;

        let mut trace_id = [0u8; 16];
        trace_id.copy_from_slice(&raw[1..17]);
        let mut span_id = [0u8; 8];
        span_id.copy_from_slice(&raw[17..25]);

        Ok(Some(Self {
            version: raw[0],
            trace_id,
            span_id,
            flags: raw[25],
        }))
    }

    /// Format the standard `traceparent` header value
    pub fn traceparent(&self) -> String {
        format!(
            "{:02x}-{}-{}-{:02x}",
            self.version,
            hex::encode(self.trace_id),
            hex::encode(self.span_id),
            self.flags
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let context = TraceContext::root();
        let decoded = TraceContext::from_bytes(&context.to_bytes()).unwrap().unwrap();
        assert_eq!(decoded, context);
    }

    #[test]
    fn empty_bytes_mean_no_parent() {
        assert_eq!(TraceContext::from_bytes(b"").unwrap(), None);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(TraceContext::from_bytes(b"00ff").is_err());
    }

    #[test]
    fn child_keeps_the_trace_id() {
        let parent = TraceContext::root();
        let child = parent.child();
        assert_eq!(child.trace_id, parent.trace_id);
        assert_ne!(child.span_id, parent.span_id);
    }

    #[test]
    fn traceparent_has_the_header_shape() {
        let context = TraceContext::root();
        let header = context.traceparent();
        let parts: Vec<&str> = header.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "00");
        assert_eq!(parts[1].len(), 32);
        assert_eq!(parts[2].len(), 16);
        assert_eq!(parts[3], "01");
    }
}
