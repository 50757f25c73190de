// ===============================
// src/fetch.rs (valuation snapshot fetch)
// ===============================
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::domain::PortfolioSnapshot;
use crate::error::FetchError;
use crate::metrics::SNAPSHOT_FETCHES;
use crate::token::TokenSource;

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Authoritative snapshot source: `GET {api_base}/api/portfolios/{id}/analytics`.
#[derive(Clone)]
pub struct ValuationClient {
    http: reqwest::Client,
    api_base: Url,
    tokens: Arc<dyn TokenSource>,
}

impl ValuationClient {
    pub fn new(api_base: Url, tokens: Arc<dyn TokenSource>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(?e, "http client builder failed, using defaults");
                reqwest::Client::new()
            });
        Self { http, api_base, tokens }
    }

    pub fn analytics_url(&self, portfolio_id: &str) -> Result<Url, FetchError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(["api", "portfolios", portfolio_id, "analytics"]);
        Ok(url)
    }

    /// Fetch the full snapshot. A missing or rejected credential is discarded
    /// from the token source before the error is returned.
    pub async fn fetch(&self, portfolio_id: &str) -> Result<PortfolioSnapshot, FetchError> {
        let out = self.fetch_inner(portfolio_id).await;
        let outcome = match &out {
            Ok(_) => "ok",
            Err(e) if e.is_auth() => "unauthorized",
            Err(_) => "error",
        };
        SNAPSHOT_FETCHES.with_label_values(&[outcome]).inc();
        if let Err(e) = &out {
            if e.is_auth() {
                self.tokens.discard();
            }
        }
        out
    }

    async fn fetch_inner(&self, portfolio_id: &str) -> Result<PortfolioSnapshot, FetchError> {
        let token = self.tokens.current().ok_or(FetchError::MissingCredential)?;
        let url = self.analytics_url(portfolio_id)?;
        debug!(%url, "fetching valuation snapshot");
        let rsp = self.http.get(url).bearer_auth(token).send().await?;
        let status = rsp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(FetchError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(rsp.json::<PortfolioSnapshot>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::StaticTokenSource;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    // Answers exactly one request with `status` and `body`, returning the raw request.
    async fn one_shot(status: &str, body: &str) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let reply = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (Url::parse(&format!("http://{addr}")).unwrap(), task)
    }

    const BODY: &str = r#"{"portfolioId":"p-9","portfolioName":"Core","totalValue":1000,"totalPurchaseCost":"1000.00",
        "totalGainLoss":0,"totalGainLossPercent":0,"assets":[{"assetId":"a1","symbol":"AAPL","quantity":10,
        "purchasePrice":100,"totalCost":1000,"currentPrice":100,"marketValue":1000,"gainLoss":0,"gainLossPercent":0}]}"#;

    #[test]
    fn analytics_url_joins_path() {
        let c = ValuationClient::new(Url::parse("http://api.test:8000/").unwrap(), Arc::new(StaticTokenSource::default()));
        assert_eq!(c.analytics_url("p 1").unwrap().as_str(), "http://api.test:8000/api/portfolios/p%201/analytics");
    }

    #[tokio::test]
    async fn fetch_sends_bearer_and_decodes() {
        let (base, server) = one_shot("200 OK", BODY).await;
        let tokens = Arc::new(StaticTokenSource::new(Some("jwt-1".into())));
        let snap = ValuationClient::new(base, tokens).fetch("p-9").await.unwrap();
        assert_eq!(snap.portfolio_name, "Core");
        assert_eq!(snap.total_purchase_cost, 1000.0);
        assert_eq!(snap.assets[0].id, "a1");
        let req = server.await.unwrap();
        assert!(req.starts_with("GET /api/portfolios/p-9/analytics "));
        assert!(req.to_ascii_lowercase().contains("authorization: bearer jwt-1"));
    }

    #[tokio::test]
    async fn rejected_credential_is_discarded() {
        let (base, _server) = one_shot("403 Forbidden", "{}").await;
        let tokens = Arc::new(StaticTokenSource::new(Some("stale".into())));
        let err = ValuationClient::new(base, tokens.clone()).fetch("p-9").await.unwrap_err();
        assert!(matches!(err, FetchError::Unauthorized(403)));
        assert_eq!(tokens.current(), None);
    }

    #[tokio::test]
    async fn server_error_keeps_credential() {
        let (base, _server) = one_shot("500 Internal Server Error", "{}").await;
        let tokens = Arc::new(StaticTokenSource::new(Some("good".into())));
        let err = ValuationClient::new(base, tokens.clone()).fetch("p-9").await.unwrap_err();
        assert!(matches!(err, FetchError::Status(500)));
        assert_eq!(tokens.current().as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn missing_credential_short_circuits() {
        let c = ValuationClient::new(Url::parse("http://127.0.0.1:9").unwrap(), Arc::new(StaticTokenSource::default()));
        assert!(matches!(c.fetch("p").await, Err(FetchError::MissingCredential)));
    }
}
