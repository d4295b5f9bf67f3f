use crate::config::ExchangeConfig;
use crate::error::{KeeperError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// API credentials for signed REST requests
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

impl ApiCredentials {
    pub fn new(api_key: String, secret: String, passphrase: String) -> Self {
        Self {
            api_key,
            secret,
            passphrase,
        }
    }

    pub fn from_config(config: &ExchangeConfig) -> Result<Self> {
        let missing: Vec<&str> = [
            ("exchange.api_key", &config.api_key),
            ("exchange.secret_key", &config.secret_key),
            ("exchange.passphrase", &config.passphrase),
        ]
        .iter()
        .filter(|(_, v)| v.is_empty())
        .map(|(k, _)| *k)
        .collect();
        if !missing.is_empty() {
            return Err(KeeperError::Config(::config::ConfigError::NotFound(
                missing.join(", "),
            )));
        }
        Ok(Self::new(
            config.api_key.clone(),
            config.secret_key.clone(),
            config.passphrase.clone(),
        ))
    }
}

/// OKX v5 request signer: base64(HMAC-SHA256(secret, ts + METHOD + path + body))
#[derive(Clone, Debug)]
pub struct OkxSigner {
    credentials: ApiCredentials,
    simulated: bool,
}

impl OkxSigner {
    pub fn new(credentials: ApiCredentials, simulated: bool) -> Self {
        Self {
            credentials,
            simulated,
        }
    }

    /// ISO-8601 with milliseconds, as the exchange expects
    fn timestamp(now: DateTime<Utc>) -> String {
        now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    fn build_message(timestamp: &str, method: &str, path: &str, body: &str) -> String {
        format!("{}{}{}{}", timestamp, method.to_uppercase(), path, body)
    }

    fn sign(&self, message: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.secret.as_bytes())
            .map_err(|e| KeeperError::Signature(format!("HMAC init failed: {}", e)))?;
        mac.update(message.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Headers for a request. `path` includes the query string.
    pub fn build_headers(&self, method: &str, path: &str, body: &str) -> Result<HeaderMap> {
        self.build_headers_at(Utc::now(), method, path, body)
    }

    fn build_headers_at(
        &self,
        now: DateTime<Utc>,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<HeaderMap> {
        let timestamp = Self::timestamp(now);
        let signature = self.sign(&Self::build_message(&timestamp, method, path, body))?;
        tracing::trace!(method, path, %timestamp, "signed request");

        let header = |name: &str, value: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| KeeperError::Signature(format!("Invalid {} header: {}", name, e)))
        };

        let mut headers = HeaderMap::new();
        headers.insert("ok-access-key", header("key", &self.credentials.api_key)?);
        headers.insert("ok-access-sign", header("sign", &signature)?);
        headers.insert("ok-access-timestamp", header("timestamp", &timestamp)?);
        headers.insert(
            "ok-access-passphrase",
            header("passphrase", &self.credentials.passphrase)?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if self.simulated {
            headers.insert("x-simulated-trading", HeaderValue::from_static("1"));
        }
        Ok(headers)
    }
}
