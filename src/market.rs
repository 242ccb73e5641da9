use std::collections::BTreeMap;
use std::env;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, info};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::llm::ApiClient;
use crate::retry::RetryPolicy;

const DEFAULT_BASE_URL: &str = "https://api.marketdata.example.com";

// Fallback values, also served verbatim in mock mode.
const SP500_TR_FALLBACK: f64 = 12.3;
const UST10Y_FALLBACK: f64 = 4.25;
const DXY_FALLBACK: f64 = -2.1;
const VIX_PEAK_FALLBACK: f64 = 28.7;
const GDP_FALLBACK: f64 = 2.4;
const INFLATION_FALLBACK: f64 = 3.2;
const UNEMPLOYMENT_FALLBACK: f64 = 4.1;
const INTEREST_RATE_FALLBACK: f64 = 5.25;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketData {
    pub period: String,
    pub sp500_tr: f64,
    pub ust10y_yield: f64,
    pub dxy_chg: f64,
    pub vix_peak: f64,
    #[serde(default)]
    pub market_cap: f64,
    #[serde(default)]
    pub trading_volume: f64,
    #[serde(default)]
    pub volatility_index: f64,
    #[serde(default)]
    pub sector_performance: BTreeMap<String, f64>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomicIndicators {
    pub period: String,
    pub gdp_growth: f64,
    pub inflation_rate: f64,
    pub unemployment_rate: f64,
    pub interest_rate: f64,
    pub timestamp: f64,
}

/// Client for the external market data feed. Metrics are fetched
/// concurrently; a metric that fails past its retries degrades to a
/// documented fallback value rather than failing the whole snapshot.
pub struct MarketDataClient {
    api: ApiClient,
    use_mock_data: bool,
}

impl MarketDataClient {
    pub fn new(use_mock_data: bool, policy: RetryPolicy) -> Result<Self> {
        let base_url =
            env::var("MARKET_DATA_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            api: ApiClient::new(base_url, policy)?,
            use_mock_data,
        })
    }

    pub async fn get_market_data(&self, period: &str) -> MarketData {
        info!("fetching market data for {period}");

        if self.use_mock_data {
            return self.mock_market_data(period).await;
        }

        let (sp500_tr, ust10y_yield, dxy_chg, vix_peak) = tokio::join!(
            self.get_sp500_tr(period),
            self.get_ust10y(period),
            self.get_dxy(period),
            self.get_vix_peak(period),
        );

        MarketData {
            period: period.to_string(),
            sp500_tr,
            ust10y_yield,
            dxy_chg,
            vix_peak,
            market_cap: 0.0,
            trading_volume: 0.0,
            volatility_index: 0.0,
            sector_performance: BTreeMap::new(),
            timestamp: unix_timestamp(),
        }
    }

    pub async fn get_economic_indicators(&self, period: &str) -> EconomicIndicators {
        info!("fetching economic indicators for {period}");

        if self.use_mock_data {
            tokio::time::sleep(Duration::from_millis(50)).await;
            return EconomicIndicators {
                period: period.to_string(),
                gdp_growth: GDP_FALLBACK,
                inflation_rate: INFLATION_FALLBACK,
                unemployment_rate: UNEMPLOYMENT_FALLBACK,
                interest_rate: INTEREST_RATE_FALLBACK,
                timestamp: unix_timestamp(),
            };
        }

        let (gdp_growth, inflation_rate, unemployment_rate, interest_rate) = tokio::join!(
            self.fetch_with_fallback("/economic/gdp", period, "growth_rate", GDP_FALLBACK, 6),
            self.fetch_with_fallback("/economic/inflation", period, "rate", INFLATION_FALLBACK, 6),
            self.fetch_with_fallback(
                "/economic/unemployment",
                period,
                "rate",
                UNEMPLOYMENT_FALLBACK,
                6
            ),
            self.fetch_with_fallback(
                "/economic/fed-funds",
                period,
                "rate",
                INTEREST_RATE_FALLBACK,
                6
            ),
        );

        EconomicIndicators {
            period: period.to_string(),
            gdp_growth,
            inflation_rate,
            unemployment_rate,
            interest_rate,
            timestamp: unix_timestamp(),
        }
    }

    async fn get_sp500_tr(&self, period: &str) -> f64 {
        self.fetch_with_fallback(
            "/sp500/total-return",
            period,
            "total_return",
            SP500_TR_FALLBACK,
            8,
        )
        .await
    }

    async fn get_ust10y(&self, period: &str) -> f64 {
        self.fetch_with_fallback("/treasury/10y", period, "yield", UST10Y_FALLBACK, 8)
            .await
    }

    async fn get_dxy(&self, period: &str) -> f64 {
        self.fetch_with_fallback(
            "/currency/dxy/change",
            period,
            "change_percent",
            DXY_FALLBACK,
            8,
        )
        .await
    }

    async fn get_vix_peak(&self, period: &str) -> f64 {
        self.fetch_with_fallback(
            "/volatility/vix/peak",
            period,
            "peak_value",
            VIX_PEAK_FALLBACK,
            8,
        )
        .await
    }

    async fn fetch_with_fallback(
        &self,
        prefix: &str,
        period: &str,
        field: &str,
        fallback: f64,
        timeout_secs: u64,
    ) -> f64 {
        let path = format!("{prefix}/{period}");
        let result: Result<Value> = self
            .api
            .request(
                Method::GET,
                &path,
                &[],
                None,
                Duration::from_secs(timeout_secs),
            )
            .await;

        match result {
            Ok(value) => value.get(field).and_then(Value::as_f64).unwrap_or(fallback),
            Err(e) => {
                error!("error fetching {path}: {e}");
                fallback
            }
        }
    }

    async fn mock_market_data(&self, period: &str) -> MarketData {
        // Short delay keeps mock timing closer to a network call.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut sector_performance = BTreeMap::new();
        sector_performance.insert("technology".to_string(), 12.3);
        sector_performance.insert("healthcare".to_string(), 8.7);
        sector_performance.insert("financials".to_string(), -2.1);

        MarketData {
            period: period.to_string(),
            sp500_tr: SP500_TR_FALLBACK,
            ust10y_yield: UST10Y_FALLBACK,
            dxy_chg: DXY_FALLBACK,
            vix_peak: VIX_PEAK_FALLBACK,
            market_cap: 45_000_000_000.0,
            trading_volume: 2_500_000.0,
            volatility_index: 18.5,
            sector_performance,
            timestamp: unix_timestamp(),
        }
    }
}

/// Flatten market and economic data into the key-stats map fed to the
/// drafting prompt.
pub fn normalize_market_data(
    market: &MarketData,
    economic: &EconomicIndicators,
) -> BTreeMap<String, f64> {
    let mut normalized = BTreeMap::new();
    normalized.insert("sp500_tr".to_string(), market.sp500_tr);
    normalized.insert("ust10y_yield".to_string(), market.ust10y_yield);
    normalized.insert("dxy_chg".to_string(), market.dxy_chg);
    normalized.insert("vix_peak".to_string(), market.vix_peak);
    normalized.insert("gdp_growth".to_string(), economic.gdp_growth);
    normalized.insert("inflation_rate".to_string(), economic.inflation_rate);
    normalized.insert("unemployment_rate".to_string(), economic.unemployment_rate);
    normalized.insert("interest_rate".to_string(), economic.interest_rate);
    normalized.insert("market_cap".to_string(), market.market_cap);
    normalized.insert("trading_volume".to_string(), market.trading_volume);
    normalized.insert("volatility_index".to_string(), market.volatility_index);

    for (sector, performance) in &market.sector_performance {
        normalized.insert(format!("{sector}_performance"), *performance);
    }

    normalized
}

pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_market_data_is_deterministic() {
        let client = MarketDataClient::new(true, RetryPolicy::default()).unwrap();
        let data = client.get_market_data("2025-Q2").await;

        assert_eq!(data.period, "2025-Q2");
        assert_eq!(data.sp500_tr, 12.3);
        assert_eq!(data.ust10y_yield, 4.25);
        assert_eq!(data.dxy_chg, -2.1);
        assert_eq!(data.vix_peak, 28.7);
        assert_eq!(data.sector_performance["technology"], 12.3);
    }

    #[tokio::test]
    async fn mock_economic_indicators_are_deterministic() {
        let client = MarketDataClient::new(true, RetryPolicy::default()).unwrap();
        let data = client.get_economic_indicators("2025-Q2").await;

        assert_eq!(data.gdp_growth, 2.4);
        assert_eq!(data.inflation_rate, 3.2);
        assert_eq!(data.unemployment_rate, 4.1);
        assert_eq!(data.interest_rate, 5.25);
    }

    #[tokio::test]
    async fn normalization_flattens_sector_performance() {
        let client = MarketDataClient::new(true, RetryPolicy::default()).unwrap();
        let market = client.get_market_data("2025-Q2").await;
        let economic = client.get_economic_indicators("2025-Q2").await;

        let normalized = normalize_market_data(&market, &economic);
        assert_eq!(normalized["sp500_tr"], 12.3);
        assert_eq!(normalized["gdp_growth"], 2.4);
        assert_eq!(normalized["technology_performance"], 12.3);
        assert_eq!(normalized["financials_performance"], -2.1);
    }
}
