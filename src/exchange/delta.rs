// =============================================================================
// Delta Exchange REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized — see the redacting
// `Debug` impl at the bottom of this file. Every signed request carries the
// `api-key`, `signature`, and `timestamp` headers; the signature covers
// `method || timestamp || path || querystring || body`, with the querystring
// sorted lexicographically by key before signing.
// =============================================================================

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

use crate::errors::{EngineError, EngineResult};

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Clone)]
pub struct DeltaExchangeClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl DeltaExchangeClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: base_url.into(),
            client,
        }
    }

    pub fn current_timestamp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_secs() as i64
    }

    /// Sorts `query` pairs lexicographically by key and renders them as
    /// `a=1&b=2`. An empty slice renders as an empty string.
    fn sorted_querystring(query: &[(&str, String)]) -> String {
        let mut pairs = query.to_vec();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn sign(&self, method: &str, timestamp: i64, path: &str, querystring: &str, body: &str) -> String {
        let payload = format!("{method}{timestamp}{path}{querystring}{body}");
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_headers(&self, method: &str, path: &str, querystring: &str, body: &str) -> (HeaderMap, i64) {
        let timestamp = Self::current_timestamp();
        let signature = self.sign(method, timestamp, path, querystring, body);

        let mut headers = HeaderMap::new();
        headers.insert("api-key", HeaderValue::from_str(&self.api_key).expect("api key is valid header value"));
        headers.insert("signature", HeaderValue::from_str(&signature).expect("signature is hex"));
        headers.insert("timestamp", HeaderValue::from_str(&timestamp.to_string()).expect("timestamp is numeric"));
        (headers, timestamp)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        let querystring = Self::sorted_querystring(query);
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let (headers, _ts) = self.signed_headers(method.as_str(), path, &querystring, &body_str);

        let mut url = format!("{}{}", self.base_url, path);
        if !querystring.is_empty() {
            url.push('?');
            url.push_str(&querystring);
        }

        let mut req = self.client.request(method, &url).headers(headers);
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EngineError::Transient(format!("request to {path} failed: {e}")))?;

        let status = resp.status();
        let parsed: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Transient(format!("failed to parse response from {path}: {e}")))?;

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::Transient(format!("{path} returned {status}: {parsed}")));
        }
        if !status.is_success() || parsed.get("success").and_then(|v| v.as_bool()) == Some(false) {
            return Err(EngineError::ExchangeSemantic(format!("{path} returned {status}: {parsed}")));
        }

        Ok(parsed)
    }

    #[instrument(skip(self), name = "delta::get_products")]
    pub async fn get_products(&self) -> EngineResult<serde_json::Value> {
        self.send(reqwest::Method::GET, "/v2/products", &[], None).await
    }

    #[instrument(skip(self), name = "delta::get_history_candles")]
    pub async fn get_history_candles(
        &self,
        symbol: &str,
        resolution: &str,
        start: i64,
        end: i64,
    ) -> EngineResult<serde_json::Value> {
        let query = [
            ("symbol", symbol.to_string()),
            ("resolution", resolution.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
        ];
        debug!(symbol, resolution, start, end, "fetching historical candles");
        self.send(reqwest::Method::GET, "/v2/history/candles", &query, None).await
    }

    #[instrument(skip(self, body), name = "delta::place_order")]
    pub async fn place_order(&self, body: serde_json::Value) -> EngineResult<serde_json::Value> {
        self.send(reqwest::Method::POST, "/v2/orders", &[], Some(&body)).await
    }

    #[instrument(skip(self), name = "delta::cancel_order")]
    pub async fn cancel_order(&self, order_id: i64, product_id: i64) -> EngineResult<serde_json::Value> {
        let body = serde_json::json!({ "id": order_id, "product_id": product_id });
        self.send(reqwest::Method::DELETE, &format!("/v2/orders/{order_id}"), &[], Some(&body))
            .await
    }

    #[instrument(skip(self), name = "delta::cancel_all_orders")]
    pub async fn cancel_all_orders(&self, product_id: i64) -> EngineResult<serde_json::Value> {
        let body = serde_json::json!({ "product_id": product_id });
        self.send(reqwest::Method::DELETE, "/v2/orders/all", &[], Some(&body)).await
    }

    #[instrument(skip(self), name = "delta::get_orders")]
    pub async fn get_orders(&self, product_id: Option<i64>) -> EngineResult<serde_json::Value> {
        let query: Vec<(&str, String)> = match product_id {
            Some(id) => vec![("product_id", id.to_string())],
            None => vec![],
        };
        self.send(reqwest::Method::GET, "/v2/orders", &query, None).await
    }

    #[instrument(skip(self), name = "delta::get_positions")]
    pub async fn get_positions(&self) -> EngineResult<serde_json::Value> {
        self.send(reqwest::Method::GET, "/v2/positions", &[], None).await
    }

    #[instrument(skip(self), name = "delta::get_margined_positions")]
    pub async fn get_margined_positions(&self) -> EngineResult<serde_json::Value> {
        self.send(reqwest::Method::GET, "/v2/positions/margined", &[], None).await
    }

    #[instrument(skip(self), name = "delta::get_wallet_balances")]
    pub async fn get_wallet_balances(&self) -> EngineResult<serde_json::Value> {
        self.send(reqwest::Method::GET, "/v2/wallet/balances", &[], None).await
    }
}

impl std::fmt::Debug for DeltaExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaExchangeClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn querystring_is_sorted_lexicographically() {
        let query = [
            ("symbol", "SOLUSD".to_string()),
            ("end", "200".to_string()),
            ("resolution", "15m".to_string()),
        ];
        let qs = DeltaExchangeClient::sorted_querystring(&query);
        assert_eq!(qs, "end=200&resolution=15m&symbol=SOLUSD");
    }

    #[test]
    fn empty_query_renders_empty_string() {
        assert_eq!(DeltaExchangeClient::sorted_querystring(&[]), "");
    }

    #[test]
    fn debug_impl_redacts_credentials() {
        let client = DeltaExchangeClient::new("my-api-key", "my-secret", "https://api.delta.exchange");
        let debugged = format!("{client:?}");
        assert!(!debugged.contains("my-api-key"));
        assert!(!debugged.contains("my-secret"));
        assert!(debugged.contains("<redacted>"));
    }

    #[test]
    fn signature_changes_with_any_signed_component() {
        let client = DeltaExchangeClient::new("k", "s", "https://api.delta.exchange");
        let sig1 = client.sign("GET", 1000, "/v2/orders", "a=1", "");
        let sig2 = client.sign("GET", 1000, "/v2/orders", "a=2", "");
        let sig3 = client.sign("POST", 1000, "/v2/orders", "a=1", "");
        assert_ne!(sig1, sig2);
        assert_ne!(sig1, sig3);
    }
}
