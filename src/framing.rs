use crate::error::{DhtError, Result};
use crate::protocol::Envelope;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Serialize one envelope into one datagram.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(envelope)?;
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(DhtError::InvalidMessage(format!(
            "envelope of {} bytes exceeds datagram limit",
            bytes.len()
        )));
    }
    Ok(bytes)
}

pub fn decode_envelope(data: &[u8]) -> Result<Envelope> {
    if data.len() > MAX_DATAGRAM_SIZE {
        return Err(DhtError::InvalidMessage(format!(
            "datagram of {} bytes exceeds limit",
            data.len()
        )));
    }
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response};

    #[test]
    fn oversized_envelopes_are_refused() {
        let envelope = Envelope::Response(Response::ok(
            "x".into(),
            serde_json::Value::String("a".repeat(MAX_DATAGRAM_SIZE)),
        ));
        assert!(matches!(
            encode_envelope(&envelope),
            Err(DhtError::InvalidMessage(_))
        ));
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        assert!(matches!(
            decode_envelope(b"not json"),
            Err(DhtError::Serialization(_))
        ));
    }

    #[test]
    fn request_survives_encoding() {
        let envelope = Envelope::Request(Request {
            id: "abc".into(),
            method: "PING".into(),
            params: None,
            from: None,
        });
        let bytes = encode_envelope(&envelope).unwrap();
        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded.id(), "abc");
        assert!(matches!(decoded, Envelope::Request(_)));
    }
}
