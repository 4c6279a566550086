//! Number rental vendor adapter (`handler_api` text protocol over HTTPS).
//!
//! `otp-core` only sees `StatusQuery`; everything vendor specific (query
//! strings, reply tokens, retries) stays here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::time::sleep;
use tracing::{debug, warn};

use otp_core::{
    config::VendorConfig,
    domain::OrderId,
    errors::Error,
    ports::{StatusQuery, StatusReply},
    Result,
};

pub mod parse;

pub use parse::{classify_status, Rental, Service};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// `setStatus` codes understood by `handler_api`.
const SET_STATUS_RESEND: &str = "3";
const SET_STATUS_CANCEL: &str = "8";

#[derive(Clone, Debug)]
pub struct VendorClient {
    cfg: VendorConfig,
    http: reqwest::Client,
}

impl VendorClient {
    pub fn new(cfg: VendorConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(20);

        if let Some(url) = &cfg.proxy_url {
            let proxy = reqwest::Proxy::all(url)
                .map_err(|e| Error::Config(format!("invalid PROXY_URL: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("http client build failed: {e}")))?;

        Ok(Self { cfg, http })
    }

    pub async fn get_balance(&self) -> Result<f64> {
        let raw = self
            .call(&[("action", "getBalance".to_string())], self.cfg.max_retries)
            .await?;
        parse::parse_balance(&raw)
    }

    pub async fn get_services(&self) -> Result<Vec<Service>> {
        let raw = self
            .call(
                &[
                    ("action", "getServices".to_string()),
                    ("country", self.cfg.country.to_string()),
                ],
                self.cfg.max_retries,
            )
            .await?;
        parse::parse_services(&raw)
    }

    /// Rent a number. Not retried: a retry after a lost reply could rent twice.
    pub async fn rent_number(&self, service: &str, operator: &str) -> Result<Rental> {
        let raw = self
            .call(
                &[
                    ("action", "getNumberV2".to_string()),
                    ("service", service.to_string()),
                    ("country", self.cfg.country.to_string()),
                    ("operator", operator.to_string()),
                ],
                0,
            )
            .await?;
        parse::parse_rental(&raw)
    }

    /// Raw `getStatus` answer. Single attempt; the watcher schedule is the retry layer.
    pub async fn get_status(&self, order_id: &OrderId) -> Result<String> {
        self.call(
            &[
                ("action", "getStatus".to_string()),
                ("id", order_id.0.clone()),
            ],
            0,
        )
        .await
    }

    pub async fn cancel(&self, order_id: &OrderId) -> Result<()> {
        let raw = self.set_status(order_id, SET_STATUS_CANCEL).await?;
        parse::expect_token(&raw, &["ACCESS_CANCEL"])
    }

    /// Ask the vendor to deliver another SMS to the same number.
    pub async fn request_resend(&self, order_id: &OrderId) -> Result<()> {
        let raw = self.set_status(order_id, SET_STATUS_RESEND).await?;
        parse::expect_token(&raw, &["ACCESS_RETRY_GET", "ACCESS_READY"])
    }

    async fn set_status(&self, order_id: &OrderId, status: &str) -> Result<String> {
        self.call(
            &[
                ("action", "setStatus".to_string()),
                ("id", order_id.0.clone()),
                ("status", status.to_string()),
            ],
            0,
        )
        .await
    }

    async fn call(&self, params: &[(&str, String)], max_retries: u32) -> Result<String> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(params).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    let wait = retry_backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        "vendor call failed, retrying in {}s: {e}",
                        wait.as_secs()
                    );
                    attempt += 1;
                    sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(&self, params: &[(&str, String)]) -> Result<String> {
        let resp = self
            .http
            .get(&self.cfg.base_url)
            .query(params)
            .query(&[
                ("api_key", self.cfg.api_key.as_str()),
                ("lang", self.cfg.lang.as_str()),
            ])
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(map_status(status));
        }

        let text = resp.text().await.map_err(map_reqwest_err)?;
        debug!(
            action = params.first().map(|(_, v)| v.as_str()).unwrap_or(""),
            "vendor replied: {}",
            text.chars().take(80).collect::<String>()
        );
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl StatusQuery for VendorClient {
    async fn query(&self, order_id: &OrderId) -> StatusReply {
        match self.get_status(order_id).await {
            Ok(raw) => classify_status(&raw),
            Err(e) => StatusReply::TransientError {
                message: e.to_string(),
            },
        }
    }
}

/// 1s, 2s, 4s, 8s, ... capped at 30s.
fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64.checked_shl(attempt).unwrap_or(u64::MAX).min(30))
}

fn map_reqwest_err(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        return Error::Transient(format!("request timed out: {e}"));
    }
    if e.is_connect() {
        return Error::Transient(format!("failed to connect: {e}"));
    }
    if e.is_request() || e.is_body() || e.is_decode() {
        return Error::Transient(format!("request failed: {e}"));
    }
    Error::External(format!("vendor request error: {e}"))
}

fn map_status(status: StatusCode) -> Error {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Error::Transient("rate limited (429)".to_string());
    }
    if status.is_server_error() {
        return Error::Transient(format!("server error ({})", status.as_u16()));
    }
    Error::External(format!("vendor http error ({})", status.as_u16()))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    fn test_config(base_url: String, max_retries: u32) -> VendorConfig {
        VendorConfig {
            api_key: "k".to_string(),
            base_url,
            country: 10,
            lang: "en".to_string(),
            request_timeout: Duration::from_secs(2),
            max_retries,
            proxy_url: None,
        }
    }

    /// Loopback server that answers every request with 503 and counts hits.
    async fn overloaded_vendor() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let _ = sock
                        .write_all(
                            b"HTTP/1.1 503 Service Unavailable\r\n\
                              Content-Length: 0\r\n\
                              Connection: close\r\n\r\n",
                        )
                        .await;
                    let _ = sock.shutdown().await;
                });
            }
        });

        (format!("http://{addr}/stubs/handler_api"), hits)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let secs: Vec<u64> = (0..7).map(|a| retry_backoff(a).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(retry_backoff(80).as_secs(), 30);
    }

    #[test]
    fn http_status_mapping() {
        assert!(map_status(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(map_status(StatusCode::BAD_GATEWAY).is_transient());
        assert!(!map_status(StatusCode::FORBIDDEN).is_transient());
    }

    #[tokio::test]
    async fn unreachable_vendor_is_a_transient_status() {
        // Port 9 (discard) on loopback: refused immediately.
        let client = VendorClient::new(test_config(
            "http://127.0.0.1:9/stubs/handler_api".to_string(),
            0,
        ))
        .unwrap();

        let reply = client.query(&OrderId("1".to_string())).await;
        assert!(matches!(reply, StatusReply::TransientError { .. }));
    }

    #[tokio::test]
    async fn status_polls_are_not_retried_but_listings_are() {
        let (base_url, hits) = overloaded_vendor().await;
        let client = VendorClient::new(test_config(base_url, 2)).unwrap();
        let order = OrderId("900100".to_string());

        let reply = client.query(&order).await;
        assert!(matches!(
            &reply,
            StatusReply::TransientError { message } if message.contains("server error (503)")
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(client.get_status(&order).await.unwrap_err().is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // One attempt plus `max_retries` retries (1s + 2s of backoff).
        assert!(client.get_balance().await.unwrap_err().is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }
}
