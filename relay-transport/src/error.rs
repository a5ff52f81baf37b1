use std::error::Error as _;

/// Transport-layer failure taxonomy (§4.B, §7).
///
/// `Http` covers any non-200 status; `Request` covers DNS/TLS/timeout and
/// other failures reqwest itself detects, with `tls_verification_failed` set
/// when the underlying cause was certificate verification, so higher layers
/// can surface "bad certificate" separately from a generic connection
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("server responded with HTTP {code}")]
    Http { code: u16, body: Vec<u8> },
    #[error("request failed: {source}")]
    Request {
        #[source]
        source: reqwest::Error,
        tls_verification_failed: bool,
    },
}

impl TransportError {
    /// True when the failure was a TLS certificate verification error,
    /// distinguished so the caller can report "bad certificate" instead of a
    /// generic network error (§4.B).
    pub fn is_tls_verification_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Request {
                tls_verification_failed: true,
                ..
            }
        )
    }

    pub(crate) fn from_reqwest(source: reqwest::Error) -> Self {
        let tls_verification_failed = source
            .source()
            .map(|e| e.to_string().to_lowercase())
            .map(|s| {
                s.contains("certificate")
                    || s.contains("invalid cert")
                    || s.contains("self signed")
                    || s.contains("unknown issuer")
            })
            .unwrap_or(false);
        TransportError::Request {
            source,
            tls_verification_failed,
        }
    }
}
