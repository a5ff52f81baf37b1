use std::time::Duration;

use crate::error::TransportError;

const MAX_REDIRECTS: usize = 5;

/// Builds the shared `reqwest::Client`, following the teacher's
/// `ClientBuilder` idiom (`libs/sourcify/src/client.rs`): timeouts and
/// redirect policy are fixed once at construction, the proxy environment
/// variables are honored implicitly by `reqwest` itself (§6.3).
#[derive(Clone)]
pub struct Transport {
    http: reqwest::Client,
    product: String,
}

/// Connect and total low-speed timeouts (§5: "HTTP transport has a connect
/// timeout and a total low-speed timeout (defaults: 30 s, 600 s)").
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    pub product: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(600),
            product: "relay-agent/0.1".to_string(),
        }
    }
}

impl Transport {
    pub fn new(settings: TransportSettings) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.total_timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(TransportError::from_reqwest)?;
        Ok(Self {
            http,
            product: settings.product,
        })
    }

    /// Single POST of an opaque payload (§4.B). `computer_id` and
    /// `exchange_token` become the `X-Computer-ID`/`X-Exchange-Token`
    /// headers when present; `api_version` always becomes `X-Message-API`.
    pub async fn exchange(
        &self,
        url: &str,
        payload: Vec<u8>,
        computer_id: Option<&str>,
        exchange_token: Option<&str>,
        api_version: &str,
    ) -> Result<Vec<u8>, TransportError> {
        let mut request = self
            .http
            .post(url)
            .header("X-Message-API", api_version)
            .header("User-Agent", &self.product)
            .header("Content-Type", "application/octet-stream");
        if let Some(id) = computer_id {
            request = request.header("X-Computer-ID", id);
        }
        if let Some(token) = exchange_token {
            request = request.header("X-Exchange-Token", token);
        }
        let response = request
            .body(payload)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        Self::into_body(response).await
    }

    /// The Pinger's lightweight form-encoded probe (§4.H). Shares the same
    /// underlying client (connection pool, proxy settings, timeouts) as
    /// `exchange`.
    pub async fn ping(&self, url: &str, insecure_id: &str) -> Result<Vec<u8>, TransportError> {
        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(format!(
                "insecure_id={}",
                urlencoding_minimal(insecure_id)
            ))
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        Self::into_body(response).await
    }

    async fn into_body(response: reqwest::Response) -> Result<Vec<u8>, TransportError> {
        let status = response.status();
        if status.as_u16() != 200 {
            let code = status.as_u16();
            let body = response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .unwrap_or_default();
            return Err(TransportError::Http { code, body });
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(TransportError::from_reqwest)
    }
}

/// Percent-encodes the handful of characters that can appear in an
/// identifier we control; not a general-purpose `application/x-www-form-urlencoded`
/// encoder since the only value ever sent here is a server-issued numeric id.
fn urlencoding_minimal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
