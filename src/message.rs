use serde::{Deserialize, Serialize};

/// Per-connection, per-direction monotonically increasing request id.
pub type Seq = u64;

/// Magic number that must prefix every handshake `Option` record.
pub const MAGIC_NUMBER: u64 = 0x3bef5c;

/// Name of the codec implemented by this crate (a length-framed,
/// bincode-encoded binary codec — the Gob-equivalent default).
pub const DEFAULT_CODEC: &str = "application/bincode";

/// Reserved but unimplemented per spec.md §4.1 — the codec registry
/// recognizes the name but has no constructor registered for it.
pub const JSON_CODEC: &str = "application/json";

/// Fixed-shape metadata prefix of every message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub service_method: String,
    pub seq: Seq,
    pub error: String,
}

impl Header {
    pub fn request(service_method: impl Into<String>, seq: Seq) -> Self {
        Header {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    pub fn response_ok(seq: Seq) -> Self {
        Header {
            service_method: String::new(),
            seq,
            error: String::new(),
        }
    }

    pub fn response_error(seq: Seq, error: impl Into<String>) -> Self {
        Header {
            service_method: String::new(),
            seq,
            error: error.into(),
        }
    }

    /// Splits `service_method` on its last `.`. Errors with a message
    /// matching the `"ill-formed"` taxonomy entry of spec.md §4.2 when
    /// there is no `.`.
    pub fn split_service_method(&self) -> Result<(&str, &str), crate::Error> {
        split_service_method(&self.service_method)
    }
}

/// Free-standing form of [`Header::split_service_method`], usable when
/// only the dotted name (not a whole `Header`) is at hand.
pub fn split_service_method(service_method: &str) -> Result<(&str, &str), crate::Error> {
    let pos = service_method
        .rfind('.')
        .ok_or_else(|| crate::Error::Resolution(format!("ill-formed service_method: {}", service_method)))?;
    Ok((&service_method[..pos], &service_method[pos + 1..]))
}

/// Placeholder body written on an error reply — the wire still carries a
/// frame here, it's simply empty, preserving framing (spec.md §3, §4.1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct EmptyBody;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_service_method_ok() {
        let h = Header::request("Foo.Sum", 1);
        assert_eq!(h.split_service_method().unwrap(), ("Foo", "Sum"));
    }

    #[test]
    fn split_service_method_ill_formed() {
        let h = Header::request("NoDot", 1);
        let err = h.split_service_method().unwrap_err();
        assert!(err.to_string().contains("ill-formed"));
    }

    #[test]
    fn split_service_method_last_dot() {
        let h = Header::request("pkg.Foo.Sum", 1);
        assert_eq!(h.split_service_method().unwrap(), ("pkg.Foo", "Sum"));
    }
}
