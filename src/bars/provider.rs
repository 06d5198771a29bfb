//! Aggregates endpoint client.
//!
//! `HttpBarProvider` speaks the Polygon-style aggregates API
//! (`/v2/aggs/ticker/{ticker}/range/{multiplier}/{unit}/{from}/{to}`) with a
//! request timeout, exponential backoff retries and a direct rate limiter.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio_retry::{strategy::ExponentialBackoff, Retry};
use tracing::{debug, instrument};

use super::Resolution;
use crate::config::MarketDataConfig;
use crate::types::PriceBar;

/// Source of OHLCV bars.
#[async_trait]
pub trait BarProvider: Send + Sync {
    /// Bars for `ticker` between two session dates, inclusive.
    async fn get_aggregates(
        &self,
        ticker: &str,
        multiplier: u32,
        resolution: Resolution,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<PriceBar>>;
}

#[derive(Debug, Deserialize)]
struct AggregatesResponse {
    #[serde(default)]
    results: Option<Vec<PriceBar>>,
}

pub struct HttpBarProvider {
    http_client: Client,
    limiter: DefaultDirectRateLimiter,
    config: MarketDataConfig,
}

impl HttpBarProvider {
    pub fn new(http_client: Client, config: MarketDataConfig) -> Self {
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            http_client,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            config,
        }
    }

    fn aggregates_url(
        &self,
        ticker: &str,
        multiplier: u32,
        resolution: Resolution,
        from: NaiveDate,
        to: NaiveDate,
    ) -> String {
        format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            ticker,
            multiplier.max(1),
            resolution.as_str(),
            from,
            to,
        )
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<PriceBar>> {
        self.limiter.until_ready().await;

        let mut request = self
            .http_client
            .get(url)
            .query(&[("adjusted", "true"), ("sort", "asc"), ("limit", "50000")])
            .timeout(Duration::from_secs(self.config.request_timeout_secs));
        if let Some(key) = &self.config.api_key {
            request = request.query(&[("apiKey", key.as_str())]);
        }

        let response = request.send().await.context("Failed to fetch aggregates")?;
        if !response.status().is_success() {
            return Err(anyhow!("Failed to fetch aggregates: {}", response.status()));
        }

        let body: AggregatesResponse = response
            .json()
            .await
            .context("Failed to parse aggregates response")?;
        Ok(body.results.unwrap_or_default())
    }
}

/// Delays between attempts after the first one fails.
fn retry_delays(attempts: usize) -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(100)
        .max_delay(Duration::from_secs(5))
        .take(attempts)
}

#[async_trait]
impl BarProvider for HttpBarProvider {
    #[instrument(skip(self), fields(resolution = %resolution))]
    async fn get_aggregates(
        &self,
        ticker: &str,
        multiplier: u32,
        resolution: Resolution,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        let url = self.aggregates_url(ticker, multiplier, resolution, from, to);
        let mut bars = Retry::start(retry_delays(self.config.retry_attempts), || self.fetch_once(&url)).await?;
        bars.sort_by_key(|bar| bar.t);
        debug!("Fetched {} {} bars for {}..{}", bars.len(), resolution, from, to);
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregates_url() {
        let config = MarketDataConfig {
            base_url: "https://api.polygon.io/".to_string(),
            ..MarketDataConfig::default()
        };
        let provider = HttpBarProvider::new(Client::new(), config);
        let day = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();

        assert_eq!(
            provider.aggregates_url("I:SPX", 1, Resolution::Second, day, day),
            "https://api.polygon.io/v2/aggs/ticker/I:SPX/range/1/second/2026-03-10/2026-03-10"
        );
    }

    #[test]
    fn test_retry_delays_are_capped() {
        let delays: Vec<Duration> = retry_delays(3).collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(100), Duration::from_secs(5), Duration::from_secs(5)]
        );
        assert_eq!(retry_delays(0).count(), 0);
    }

    #[test]
    fn test_missing_results_parse_as_empty() {
        let body: AggregatesResponse =
            serde_json::from_str(r#"{"status":"OK","resultsCount":0}"#).unwrap();
        assert!(body.results.unwrap_or_default().is_empty());

        let body: AggregatesResponse = serde_json::from_str(
            r#"{"results":[{"t":1773149400000,"o":5000.5,"h":5001,"l":4999.25,"c":5000}]}"#,
        )
        .unwrap();
        let bars = body.results.unwrap_or_default();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].v, 0.0);
    }
}
