//! Binance USDⓈ-M futures REST client.

use super::error::GatewayError;
use super::traits::{ExecutionGateway, GatewayResult, MarketDataGate};
use super::types::*;
use crate::config::ExchangeConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use sha2::Sha256;

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Binance error code returned when the requested margin type is already set.
const NO_NEED_TO_CHANGE_MARGIN_TYPE: i64 = -4046;

/// Binance API client for perpetual futures.
pub struct BinanceClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    hedge_mode: bool,
    recv_window_ms: u64,
}

// ==================== Wire types ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    contract_type: String,
    status: String,
    #[serde(default)]
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
enum SymbolFilter {
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    Price {
        #[serde(with = "rust_decimal::serde::str")]
        tick_size: Decimal,
    },
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        #[serde(with = "rust_decimal::serde::str")]
        step_size: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        min_qty: Decimal,
    },
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional {
        #[serde(with = "rust_decimal::serde::str")]
        notional: Decimal,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    position_amt: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    entry_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    mark_price: Decimal,
    position_side: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOpenOrder {
    order_id: i64,
    symbol: String,
    side: OrderSide,
    #[serde(with = "rust_decimal::serde::str")]
    orig_qty: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOrderResponse {
    order_id: i64,
    symbol: String,
    side: OrderSide,
    #[serde(with = "rust_decimal::serde::str")]
    orig_qty: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    avg_price: Option<Decimal>,
    update_time: i64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

impl BinanceClient {
    /// Create a new Binance client from configuration.
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let base_url = if config.sandbox {
            FUTURES_TESTNET_URL
        } else {
            FUTURES_BASE_URL
        };
        Self::with_base_url(config, base_url)
    }

    /// Create a client against a custom base URL.
    pub fn with_base_url(config: &ExchangeConfig, base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            hedge_mode: config.hedge_mode,
            recv_window_ms: config.recv_window_ms,
        })
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty()
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Get current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    fn encode_params(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> GatewayResult<T> {
        let query = Self::encode_params(params);
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let response = self.http.get(&url).send().await?;
        Self::parse_response(response).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> GatewayResult<T> {
        if !self.has_credentials() {
            return Err(GatewayError::Auth("API credentials are not configured".into()));
        }

        params.push(("recvWindow", self.recv_window_ms.to_string()));
        params.push(("timestamp", Self::timestamp().to_string()));
        let query = Self::encode_params(&params);
        let signature = self.sign(&query);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> GatewayResult<T> {
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()));
        }

        let api_error = serde_json::from_str::<ApiErrorBody>(&body).ok();
        Err(Self::classify_error(status, api_error, body))
    }

    fn classify_error(status: StatusCode, api_error: Option<ApiErrorBody>, body: String) -> GatewayError {
        let (code, message) = api_error
            .map(|e| (e.code, e.msg))
            .unwrap_or((i64::from(status.as_u16()), body));

        match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => GatewayError::RateLimited(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Auth(message),
            s if s.is_server_error() => GatewayError::Unavailable(message),
            // Invalid key / signature / IP whitelist
            _ if matches!(code, -2014 | -2015 | -1022) => GatewayError::Auth(message),
            _ => GatewayError::Rejected { code, message },
        }
    }

    fn parse_kline(row: &[serde_json::Value]) -> Option<Candle> {
        let num = |idx: usize| -> Option<f64> {
            match row.get(idx)? {
                serde_json::Value::String(s) => s.parse().ok(),
                serde_json::Value::Number(n) => n.as_f64(),
                _ => None,
            }
        };

        Some(Candle {
            timestamp: row.first()?.as_i64()?,
            open: num(1)?,
            high: num(2)?,
            low: num(3)?,
            close: num(4)?,
            volume: num(5)?,
        })
    }

    fn spec_from_symbol(info: SymbolInfo) -> InstrumentSpec {
        let mut spec = InstrumentSpec {
            instrument: Instrument::new(info.symbol),
            price_step: Decimal::ZERO,
            amount_step: Decimal::ONE,
            min_amount: Decimal::ZERO,
            min_notional: Decimal::ZERO,
            // USDⓈ-M contracts are quoted in units of the base asset
            contract_multiplier: Decimal::ONE,
        };

        for filter in info.filters {
            match filter {
                SymbolFilter::Price { tick_size } => spec.price_step = tick_size,
                SymbolFilter::LotSize { step_size, min_qty } => {
                    spec.amount_step = step_size;
                    spec.min_amount = min_qty;
                }
                SymbolFilter::MinNotional { notional } => spec.min_notional = notional,
                SymbolFilter::Other => {}
            }
        }

        spec
    }

    fn position_from_wire(p: PositionRisk) -> Option<LivePosition> {
        if p.position_amt.is_zero() {
            return None;
        }

        let side = match p.position_side.as_str() {
            "LONG" => PositionSide::Long,
            "SHORT" => PositionSide::Short,
            // One-way mode reports BOTH with a signed amount
            _ if p.position_amt > Decimal::ZERO => PositionSide::Long,
            _ => PositionSide::Short,
        };

        Some(LivePosition {
            instrument: Instrument::new(p.symbol),
            side,
            contracts: p.position_amt.abs(),
            entry_price: p.entry_price,
            mark_price: p.mark_price,
        })
    }
}

#[async_trait]
impl MarketDataGate for BinanceClient {
    #[instrument(skip(self))]
    async fn fetch_instruments(&self) -> GatewayResult<Vec<InstrumentSpec>> {
        let info: ExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;

        let specs: Vec<InstrumentSpec> = info
            .symbols
            .into_iter()
            .filter(|s| s.contract_type == "PERPETUAL" && s.status == "TRADING")
            .map(Self::spec_from_symbol)
            .collect();

        debug!(count = specs.len(), "Loaded perpetual instrument specs");
        Ok(specs)
    }

    #[instrument(skip(self, instrument), fields(instrument = %instrument))]
    async fn fetch_candles(
        &self,
        instrument: &Instrument,
        timeframe: &str,
        limit: usize,
    ) -> GatewayResult<CandleSeries> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .public_get(
                "/fapi/v1/klines",
                &[
                    ("symbol", instrument.symbol().to_string()),
                    ("interval", timeframe.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let candles = rows
            .iter()
            .map(|row| Self::parse_kline(row))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| GatewayError::Decode(format!("malformed kline row for {}", instrument)))?;

        Ok(CandleSeries::new(instrument.clone(), timeframe, candles))
    }

    #[instrument(skip(self, instrument), fields(instrument = %instrument))]
    async fn fetch_ticker(&self, instrument: &Instrument) -> GatewayResult<Ticker> {
        let ticker: TickerPrice = self
            .public_get(
                "/fapi/v1/ticker/price",
                &[("symbol", instrument.symbol().to_string())],
            )
            .await?;

        Ok(Ticker {
            instrument: Instrument::new(ticker.symbol),
            last_price: ticker.price,
        })
    }
}

#[async_trait]
impl ExecutionGateway for BinanceClient {
    #[instrument(skip(self))]
    async fn fetch_positions(&self, filter: &PositionFilter) -> GatewayResult<Vec<LivePosition>> {
        let raw: Vec<PositionRisk> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", Vec::new())
            .await?;

        Ok(raw
            .into_iter()
            .filter_map(Self::position_from_wire)
            .filter(|p| filter.matches(&p.instrument))
            .collect())
    }

    #[instrument(skip(self))]
    async fn fetch_open_orders(&self) -> GatewayResult<Vec<OpenOrder>> {
        let raw: Vec<WireOpenOrder> = self
            .signed(Method::GET, "/fapi/v1/openOrders", Vec::new())
            .await?;

        Ok(raw
            .into_iter()
            .map(|o| OpenOrder {
                order_id: o.order_id.to_string(),
                instrument: Instrument::new(o.symbol),
                side: o.side,
                quantity: o.orig_qty,
            })
            .collect())
    }

    #[instrument(skip(self, instrument), fields(instrument = %instrument))]
    async fn cancel_order(&self, order_id: &str, instrument: &Instrument) -> GatewayResult<()> {
        let _: serde_json::Value = self
            .signed(
                Method::DELETE,
                "/fapi/v1/order",
                vec![
                    ("symbol", instrument.symbol().to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self, order), fields(instrument = %order.instrument))]
    async fn place_market_order(&self, order: &MarketOrder) -> GatewayResult<OrderReceipt> {
        let mut params = vec![
            ("symbol", order.instrument.symbol().to_string()),
            ("side", order.side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", order.quantity.normalize().to_string()),
            ("newOrderRespType", "RESULT".to_string()),
        ];

        if self.hedge_mode {
            // Hedge mode closes by trading against the held side; reduceOnly is refused there
            let side = match order.position_side {
                PositionSide::Long => "LONG",
                PositionSide::Short => "SHORT",
            };
            params.push(("positionSide", side.to_string()));
        } else if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        debug!(?order, "Placing market order");

        let response: WireOrderResponse = self.signed(Method::POST, "/fapi/v1/order", params).await?;

        Ok(OrderReceipt {
            order_id: response.order_id.to_string(),
            instrument: Instrument::new(response.symbol),
            side: response.side,
            quantity: response.orig_qty,
            avg_price: response.avg_price.filter(|p| !p.is_zero()),
            timestamp: Utc
                .timestamp_millis_opt(response.update_time)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }

    #[instrument(skip(self, instrument), fields(instrument = %instrument))]
    async fn set_leverage(
        &self,
        instrument: &Instrument,
        leverage: u8,
        margin_mode: MarginMode,
    ) -> GatewayResult<()> {
        let margin_type = match margin_mode {
            MarginMode::Isolated => "ISOLATED",
            MarginMode::Cross => "CROSSED",
        };

        let margin_result: GatewayResult<serde_json::Value> = self
            .signed(
                Method::POST,
                "/fapi/v1/marginType",
                vec![
                    ("symbol", instrument.symbol().to_string()),
                    ("marginType", margin_type.to_string()),
                ],
            )
            .await;

        match margin_result {
            Ok(_) => {}
            Err(GatewayError::Rejected { code, .. }) if code == NO_NEED_TO_CHANGE_MARGIN_TYPE => {}
            Err(e) => warn!(%instrument, error = %e, "Failed to set margin type"),
        }

        let _: serde_json::Value = self
            .signed(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", instrument.symbol().to_string()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_config() -> ExchangeConfig {
        ExchangeConfig {
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            sandbox: true,
            hedge_mode: true,
            recv_window_ms: 5000,
        }
    }

    #[test]
    fn test_signature_is_hex_sha256() {
        let client = BinanceClient::new(&test_config()).unwrap();
        let signature = client.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(signature, client.sign("symbol=BTCUSDT&timestamp=1"));
    }

    #[test]
    fn test_sandbox_selects_testnet() {
        let client = BinanceClient::new(&test_config()).unwrap();
        assert_eq!(client.base_url, FUTURES_TESTNET_URL);
    }

    #[test]
    fn test_parse_kline_accepts_string_numbers() {
        let row: Vec<serde_json::Value> = serde_json::from_str(
            r#"[1700000000000,"100.5","101","99.5","100.75","1234.5",1700003599999,"0",10,"0","0","0"]"#,
        )
        .unwrap();
        let candle = BinanceClient::parse_kline(&row).unwrap();
        assert_eq!(candle.timestamp, 1_700_000_000_000);
        assert_eq!(candle.close, 100.75);
        assert_eq!(candle.volume, 1234.5);
    }

    #[test]
    fn test_parse_kline_rejects_short_rows() {
        let row: Vec<serde_json::Value> = serde_json::from_str(r#"[1700000000000,"1"]"#).unwrap();
        assert!(BinanceClient::parse_kline(&row).is_none());
    }

    #[test]
    fn test_one_way_position_side_from_sign() {
        let wire = PositionRisk {
            symbol: "ETHUSDT".into(),
            position_amt: dec!(-1.5),
            entry_price: dec!(2000),
            mark_price: dec!(2010),
            position_side: "BOTH".into(),
        };
        let position = BinanceClient::position_from_wire(wire).unwrap();
        assert_eq!(position.side, PositionSide::Short);
        assert_eq!(position.contracts, dec!(1.5));
    }

    #[test]
    fn test_zero_positions_are_dropped() {
        let wire = PositionRisk {
            symbol: "ETHUSDT".into(),
            position_amt: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            mark_price: dec!(2010),
            position_side: "LONG".into(),
        };
        assert!(BinanceClient::position_from_wire(wire).is_none());
    }

    #[test]
    fn test_error_classification() {
        let auth = BinanceClient::classify_error(
            StatusCode::BAD_REQUEST,
            Some(ApiErrorBody { code: -2015, msg: "Invalid API-key".into() }),
            String::new(),
        );
        assert!(matches!(auth, GatewayError::Auth(_)));

        let limited = BinanceClient::classify_error(StatusCode::TOO_MANY_REQUESTS, None, "slow down".into());
        assert!(limited.is_transient());

        let rejected = BinanceClient::classify_error(
            StatusCode::BAD_REQUEST,
            Some(ApiErrorBody { code: -2019, msg: "Margin is insufficient.".into() }),
            String::new(),
        );
        assert_eq!(
            rejected,
            GatewayError::Rejected { code: -2019, message: "Margin is insufficient.".into() }
        );
    }

    mod http {
        use super::*;
        use serde_json::json;
        use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        async fn client_for(server: &MockServer, config: ExchangeConfig) -> BinanceClient {
            BinanceClient::with_base_url(&config, &server.uri()).unwrap()
        }

        #[tokio::test]
        async fn test_fetch_instruments_keeps_trading_perpetuals() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/fapi/v1/exchangeInfo"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "symbols": [
                        {
                            "symbol": "BTCUSDT",
                            "contractType": "PERPETUAL",
                            "status": "TRADING",
                            "filters": [
                                {"filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "556.80"},
                                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "1000"},
                                {"filterType": "MIN_NOTIONAL", "notional": "100"},
                                {"filterType": "PERCENT_PRICE", "multiplierUp": "1.05"}
                            ]
                        },
                        {"symbol": "BTCUSDT_261225", "contractType": "CURRENT_QUARTER", "status": "TRADING", "filters": []},
                        {"symbol": "OLDUSDT", "contractType": "PERPETUAL", "status": "SETTLING", "filters": []}
                    ]
                })))
                .expect(1)
                .mount(&server)
                .await;

            let client = client_for(&server, test_config()).await;
            let specs = client.fetch_instruments().await.unwrap();

            assert_eq!(specs.len(), 1);
            let spec = &specs[0];
            assert_eq!(spec.instrument, Instrument::new("BTCUSDT"));
            assert_eq!(spec.price_step, dec!(0.10));
            assert_eq!(spec.amount_step, dec!(0.001));
            assert_eq!(spec.min_amount, dec!(0.001));
            assert_eq!(spec.min_notional, dec!(100));
            assert_eq!(spec.contract_multiplier, Decimal::ONE);
        }

        #[tokio::test]
        async fn test_fetch_candles_sends_interval_and_limit() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/fapi/v1/klines"))
                .and(query_param("symbol", "ETHUSDT"))
                .and(query_param("interval", "1h"))
                .and(query_param("limit", "2"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                    [1700000000000i64, "2000", "2010", "1990", "2005", "150.5", 1700003599999i64, "0", 10, "0", "0", "0"],
                    [1700003600000i64, "2005", "2020", "2000", "2015", "98.25", 1700007199999i64, "0", 12, "0", "0", "0"]
                ])))
                .mount(&server)
                .await;

            let client = client_for(&server, test_config()).await;
            let series = client
                .fetch_candles(&Instrument::new("ETHUSDT"), "1h", 2)
                .await
                .unwrap();

            assert_eq!(series.len(), 2);
            assert!(series.is_strictly_increasing());
            assert_eq!(series.closes(), vec![2005.0, 2015.0]);
        }

        #[tokio::test]
        async fn test_malformed_kline_is_decode_error() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/fapi/v1/klines"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!([[1700000000000i64, "1"]])))
                .mount(&server)
                .await;

            let client = client_for(&server, test_config()).await;
            let err = client
                .fetch_candles(&Instrument::new("ETHUSDT"), "1h", 1)
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::Decode(_)));
        }

        #[tokio::test]
        async fn test_rate_limit_and_server_errors_are_transient() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/fapi/v1/ticker/price"))
                .and(query_param("symbol", "BTCUSDT"))
                .respond_with(
                    ResponseTemplate::new(429)
                        .set_body_json(json!({"code": -1003, "msg": "Too many requests"})),
                )
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/fapi/v1/ticker/price"))
                .and(query_param("symbol", "ETHUSDT"))
                .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
                .mount(&server)
                .await;

            let client = client_for(&server, test_config()).await;

            let limited = client.fetch_ticker(&Instrument::new("BTCUSDT")).await.unwrap_err();
            assert_eq!(limited, GatewayError::RateLimited("Too many requests".into()));
            assert!(limited.is_transient());

            let unavailable = client.fetch_ticker(&Instrument::new("ETHUSDT")).await.unwrap_err();
            assert!(matches!(unavailable, GatewayError::Unavailable(_)));
            assert!(unavailable.is_transient());
        }

        #[tokio::test]
        async fn test_signed_request_without_credentials_fails_locally() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/fapi/v2/positionRisk"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
                .expect(0)
                .mount(&server)
                .await;

            let config = ExchangeConfig {
                api_key: String::new(),
                secret_key: String::new(),
                ..test_config()
            };
            let client = client_for(&server, config).await;

            let err = client.fetch_positions(&PositionFilter::All).await.unwrap_err();
            assert!(matches!(err, GatewayError::Auth(_)));
        }

        #[tokio::test]
        async fn test_unauthorized_maps_to_auth() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/fapi/v2/positionRisk"))
                .respond_with(
                    ResponseTemplate::new(401)
                        .set_body_json(json!({"code": -2015, "msg": "Invalid API-key, IP, or permissions for action."})),
                )
                .mount(&server)
                .await;

            let client = client_for(&server, test_config()).await;
            let err = client.fetch_positions(&PositionFilter::All).await.unwrap_err();
            assert!(matches!(err, GatewayError::Auth(_)));
            assert!(!err.is_transient());
        }

        #[tokio::test]
        async fn test_fetch_positions_signs_and_filters() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/fapi/v2/positionRisk"))
                .and(header("X-MBX-APIKEY", "key"))
                .and(query_param("recvWindow", "5000"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                    {"symbol": "BTCUSDT", "positionAmt": "0.010", "entryPrice": "60000", "markPrice": "60100", "positionSide": "LONG"},
                    {"symbol": "BTCUSDT", "positionAmt": "0.000", "entryPrice": "0", "markPrice": "60100", "positionSide": "SHORT"},
                    {"symbol": "ETHUSDT", "positionAmt": "-2", "entryPrice": "3000", "markPrice": "2990", "positionSide": "SHORT"}
                ])))
                .mount(&server)
                .await;

            let client = client_for(&server, test_config()).await;

            let all = client.fetch_positions(&PositionFilter::All).await.unwrap();
            assert_eq!(all.len(), 2);

            let eth = client
                .fetch_positions(&PositionFilter::Instruments(vec![Instrument::new("ETHUSDT")]))
                .await
                .unwrap();
            assert_eq!(eth.len(), 1);
            assert_eq!(eth[0].side, PositionSide::Short);
            assert_eq!(eth[0].contracts, dec!(2));
            assert_eq!(eth[0].mark_price, dec!(2990));
        }

        #[tokio::test]
        async fn test_hedge_mode_order_sends_position_side() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/fapi/v1/order"))
                .and(query_param("symbol", "SOLUSDT"))
                .and(query_param("side", "SELL"))
                .and(query_param("type", "MARKET"))
                .and(query_param("quantity", "1.5"))
                .and(query_param("positionSide", "LONG"))
                .and(query_param_is_missing("reduceOnly"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "orderId": 42,
                    "symbol": "SOLUSDT",
                    "side": "SELL",
                    "origQty": "1.5",
                    "avgPrice": "150.25",
                    "updateTime": 1700000000000i64
                })))
                .expect(1)
                .mount(&server)
                .await;

            let client = client_for(&server, test_config()).await;
            let receipt = client
                .place_market_order(&MarketOrder {
                    instrument: Instrument::new("SOLUSDT"),
                    side: OrderSide::Sell,
                    quantity: dec!(1.500),
                    margin_mode: MarginMode::Cross,
                    reduce_only: true,
                    position_side: PositionSide::Long,
                    reference_price: dec!(150),
                })
                .await
                .unwrap();

            assert_eq!(receipt.order_id, "42");
            assert_eq!(receipt.quantity, dec!(1.5));
            assert_eq!(receipt.avg_price, Some(dec!(150.25)));
            assert_eq!(receipt.timestamp.timestamp_millis(), 1_700_000_000_000);
        }

        #[tokio::test]
        async fn test_one_way_close_sends_reduce_only() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/fapi/v1/order"))
                .and(query_param("reduceOnly", "true"))
                .and(query_param_is_missing("positionSide"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "orderId": 7,
                    "symbol": "ETHUSDT",
                    "side": "BUY",
                    "origQty": "2",
                    "avgPrice": "0.00",
                    "updateTime": 1700000000000i64
                })))
                .expect(1)
                .mount(&server)
                .await;

            let config = ExchangeConfig {
                hedge_mode: false,
                ..test_config()
            };
            let client = client_for(&server, config).await;
            let receipt = client
                .place_market_order(&MarketOrder {
                    instrument: Instrument::new("ETHUSDT"),
                    side: OrderSide::Buy,
                    quantity: dec!(2),
                    margin_mode: MarginMode::Cross,
                    reduce_only: true,
                    position_side: PositionSide::Short,
                    reference_price: dec!(3000),
                })
                .await
                .unwrap();

            assert_eq!(receipt.avg_price, None);
        }

        #[tokio::test]
        async fn test_order_rejection_keeps_code() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/fapi/v1/order"))
                .respond_with(
                    ResponseTemplate::new(400)
                        .set_body_json(json!({"code": -2019, "msg": "Margin is insufficient."})),
                )
                .mount(&server)
                .await;

            let client = client_for(&server, test_config()).await;
            let err = client
                .place_market_order(&MarketOrder {
                    instrument: Instrument::new("ETHUSDT"),
                    side: OrderSide::Buy,
                    quantity: dec!(1),
                    margin_mode: MarginMode::Cross,
                    reduce_only: false,
                    position_side: PositionSide::Long,
                    reference_price: dec!(3000),
                })
                .await
                .unwrap_err();

            assert!(!err.outcome_unknown());
            assert!(matches!(err, GatewayError::Rejected { code: -2019, .. }));
        }

        #[tokio::test]
        async fn test_set_leverage_tolerates_unchanged_margin_type() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/fapi/v1/marginType"))
                .and(query_param("marginType", "CROSSED"))
                .respond_with(
                    ResponseTemplate::new(400)
                        .set_body_json(json!({"code": -4046, "msg": "No need to change margin type."})),
                )
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/fapi/v1/leverage"))
                .and(query_param("leverage", "5"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "leverage": 5, "maxNotionalValue": "1000000", "symbol": "BTCUSDT"
                })))
                .expect(1)
                .mount(&server)
                .await;

            let client = client_for(&server, test_config()).await;
            client
                .set_leverage(&Instrument::new("BTCUSDT"), 5, MarginMode::Cross)
                .await
                .unwrap();
        }
    }
}
