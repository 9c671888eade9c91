//! StandX gateway
//!
//! REST under `{base_url}/api` with bearer-token auth plus ed25519 body
//! signatures on trading endpoints; one WebSocket stream for price, order,
//! and position channels, reconnecting forever with exponential backoff.
//! Everything leaving this module is already normalized into the records the
//! engine understands.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use reqwest::Method;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use super::{
    AccountInfo, EventSender, ExchangeGateway, GatewayEvent, Order, OrderSpec, OrderStatus,
    Position, Side, Trade,
};
use crate::config::GatewaySettings;
use crate::errors::{GridError, GridResult};
use crate::indicators::Candle;
use crate::quantize::{fmt_step, tick_ladder};

const SIGN_VERSION: &str = "v1";
const CANCEL_VERIFY_POLLS: usize = 3;
const CANCEL_VERIFY_DELAY: Duration = Duration::from_millis(250);
const RECONNECT_CAP: Duration = Duration::from_secs(60);
const CLOSE_DEADLINE: Duration = Duration::from_secs(5);

pub struct StandXGateway {
    cfg: GatewaySettings,
    http: reqwest::Client,
    signing_key: SigningKey,
    /// Working price tick; promoted when a fallback candidate succeeds
    price_tick: Mutex<Decimal>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    ws_task: Mutex<Option<JoinHandle<()>>>,
}

impl StandXGateway {
    pub fn new(cfg: GatewaySettings) -> GridResult<Self> {
        if cfg.api_token.is_empty() {
            return Err(GridError::Config(
                "STANDX_API_TOKEN is not configured".into(),
            ));
        }
        let signing_key = parse_signing_key(&cfg.signing_key)?;

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(cfg.http_timeout_secs));
        if let Some(proxy) = &cfg.proxy_url {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy)
                    .map_err(|e| GridError::Config(format!("bad proxy url: {e}")))?,
            );
        }
        let http = builder.build()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let price_tick = Mutex::new(cfg.price_tick);
        Ok(Self {
            cfg,
            http,
            signing_key,
            price_tick,
            shutdown_tx,
            shutdown_rx,
            ws_task: Mutex::new(None),
        })
    }

    fn sign_headers(&self, body: &str) -> Vec<(&'static str, String)> {
        let request_id = Uuid::new_v4().to_string();
        let timestamp = Utc::now().timestamp_millis();
        let message = sign_message(SIGN_VERSION, &request_id, timestamp, body);
        let signature = self.signing_key.sign(message.as_bytes());
        vec![
            ("x-request-sign-version", SIGN_VERSION.to_string()),
            ("x-request-id", request_id),
            ("x-request-timestamp", timestamp.to_string()),
            ("x-request-signature", BASE64.encode(signature.to_bytes())),
        ]
    }

    /// One REST round trip. Wire-level failures error; application-level
    /// failures come back as a body with a `code` for the caller to inspect.
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: Option<&[(&str, String)]>,
        payload: Option<Value>,
        session_id: Option<&str>,
    ) -> GridResult<Value> {
        let url = format!("{}/api{}", self.cfg.base_url, endpoint);
        let mut req = self
            .http
            .request(method, &url)
            .header("Authorization", format!("Bearer {}", self.cfg.api_token))
            .header("Accept", "application/json");
        if let Some(params) = params {
            req = req.query(params);
        }
        if let Some(session_id) = session_id {
            req = req.header("x-session-id", session_id);
        }
        if let Some(payload) = payload {
            let body = payload.to_string();
            for (name, value) in self.sign_headers(&body) {
                req = req.header(name, value);
            }
            req = req.header("Content-Type", "application/json").body(body);
        }

        let response = req.send().await?;
        let status = response.status();
        let text = response.text().await?;

        let mut value: Value = if text.is_empty() {
            json!({})
        } else {
            serde_json::from_str(&text).unwrap_or_else(|_| json!({ "text": text }))
        };
        if !status.is_success() {
            warn!("StandX {endpoint} -> {status}");
            if value.get("code").is_none() {
                value["code"] = json!(status.as_u16());
                value["message"] = json!(status.to_string());
            }
        }
        Ok(value)
    }

    /// Check the body code and unwrap `result`.
    fn ensure_ok(value: Value, endpoint: &str) -> GridResult<Value> {
        match response_code(&value) {
            0 | 200 => Ok(unwrap_result(value)),
            401 | 403 => Err(GridError::AuthRejected(format!("{endpoint}: {value}"))),
            code => Err(GridError::Gateway(format!("{endpoint} -> code {code}: {value}"))),
        }
    }

    async fn query(&self, endpoint: &str, params: &[(&str, String)]) -> GridResult<Value> {
        let value = self
            .request(Method::GET, endpoint, Some(params), None, None)
            .await?;
        Self::ensure_ok(value, endpoint)
    }

    async fn open_order_ids(&self) -> GridResult<Vec<String>> {
        let orders = self.get_orders_by_rest().await?;
        let mut ids = Vec::with_capacity(orders.len() * 2);
        for order in orders {
            if !order.id.is_empty() {
                ids.push(order.id);
            }
            if !order.client_order_id.is_empty() {
                ids.push(order.client_order_id);
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl ExchangeGateway for StandXGateway {
    async fn initialize(&self) -> GridResult<()> {
        // A balance query exercises both connectivity and the bearer token.
        let value = self
            .request(Method::GET, "/query_balance", None, None, None)
            .await?;
        match response_code(&value) {
            0 | 200 => {
                info!("StandX gateway ready for {}", self.cfg.symbol);
                Ok(())
            }
            401 | 403 => Err(GridError::AuthRejected("token rejected at startup".into())),
            code => Err(GridError::Gateway(format!(
                "balance probe failed with code {code}"
            ))),
        }
    }

    async fn subscribe(&self, events: EventSender) -> GridResult<()> {
        let mut guard = self.ws_task.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let cfg = self.cfg.clone();
        let shutdown = self.shutdown_rx.clone();
        *guard = Some(tokio::spawn(stream_events(cfg, events, shutdown)));
        Ok(())
    }

    async fn get_orders_by_rest(&self) -> GridResult<Vec<Order>> {
        let params = [("symbol", self.cfg.symbol.clone())];
        let value = self.query("/query_open_orders", &params).await?;
        let rows = value.as_array().cloned().unwrap_or_default();
        Ok(rows.iter().map(normalize_order).collect())
    }

    async fn get_trades_by_rest(&self, side_filter: u8, limit: usize) -> GridResult<Vec<Trade>> {
        let params = [
            ("symbol", self.cfg.symbol.clone()),
            ("page", "1".to_string()),
            ("page_size", limit.max(1).to_string()),
        ];
        let value = self.query("/query_trades", &params).await?;
        let rows = value.as_array().cloned().unwrap_or_default();
        let trades = rows
            .iter()
            .map(normalize_trade)
            .filter(|t| match side_filter {
                1 => t.side == Side::Buy,
                2 => t.side == Side::Sell,
                _ => true,
            })
            .collect();
        Ok(trades)
    }

    async fn get_account_info(&self) -> GridResult<AccountInfo> {
        let balance = match self.query("/query_balance", &[]).await {
            Ok(value) => value,
            // Deployments differ on the endpoint name.
            Err(_) => self.query("/query_balances", &[]).await?,
        };
        let account_row = match &balance {
            Value::Array(rows) => rows.first().cloned().unwrap_or(json!({})),
            other => other.clone(),
        };
        let total_equity = value_decimal(
            &account_row,
            &["total_equity", "equity", "balance", "available_balance"],
        );

        let params = [("symbol", self.cfg.symbol.clone())];
        let positions_value = self.query("/query_positions", &params).await?;
        let rows = positions_value.as_array().cloned().unwrap_or_default();
        let mut positions = std::collections::HashMap::new();
        for row in &rows {
            let position = normalize_position(row, &self.cfg.symbol);
            positions.insert(position.symbol.clone(), position);
        }

        Ok(AccountInfo {
            total_equity,
            positions,
        })
    }

    async fn place_single_order(
        &self,
        is_ask: bool,
        price: Decimal,
        size: Decimal,
        client_id: Option<String>,
    ) -> GridResult<String> {
        let configured = *self.price_tick.lock().await;
        let ladder = tick_ladder(configured);
        let base_id =
            client_id.unwrap_or_else(|| format!("grid_{}", Utc::now().timestamp_millis()));
        let session_id = Uuid::new_v4().to_string();

        for (attempt, tick) in ladder.iter().enumerate() {
            let suffix = Uuid::new_v4().simple().to_string();
            let cl_ord_id = format!("{base_id}_{attempt}_{}", &suffix[..4]);
            let payload = json!({
                "symbol": self.cfg.symbol,
                "side": if is_ask { "sell" } else { "buy" },
                "order_type": "limit",
                "qty": fmt_step(size, self.cfg.qty_step),
                "price": fmt_step(price, *tick),
                "time_in_force": "alo",
                "reduce_only": false,
                "cl_ord_id": cl_ord_id,
            });
            let value = self
                .request(
                    Method::POST,
                    "/new_order",
                    None,
                    Some(payload),
                    Some(&session_id),
                )
                .await?;

            match response_code(&value) {
                0 | 200 => {
                    if *tick != configured {
                        warn!("Promoted price tick from {configured} to {tick}");
                        *self.price_tick.lock().await = *tick;
                    }
                    return Ok(cl_ord_id);
                }
                401 | 403 => {
                    return Err(GridError::AuthRejected(format!("new_order: {value}")))
                }
                _ if is_tick_error(&value) => {
                    warn!("Price tick {tick} rejected, walking the candidate ladder");
                }
                code => {
                    return Err(GridError::Gateway(format!(
                        "new_order -> code {code}: {value}"
                    )))
                }
            }
        }
        Err(GridError::TickMismatch {
            attempts: ladder.len(),
        })
    }

    async fn place_single_market_order(&self, is_ask: bool, size: Decimal) -> GridResult<String> {
        let suffix = Uuid::new_v4().simple().to_string();
        let cl_ord_id = format!("grid_mkt_{}_{}", Utc::now().timestamp_millis(), &suffix[..6]);
        let payload = json!({
            "symbol": self.cfg.symbol,
            "side": if is_ask { "sell" } else { "buy" },
            "order_type": "market",
            "qty": fmt_step(size, self.cfg.qty_step),
            "time_in_force": "ioc",
            "reduce_only": false,
            "cl_ord_id": cl_ord_id,
        });
        let session_id = Uuid::new_v4().to_string();
        let value = self
            .request(
                Method::POST,
                "/new_order",
                None,
                Some(payload),
                Some(&session_id),
            )
            .await?;
        Self::ensure_ok(value, "new_order(market)")?;
        Ok(cl_ord_id)
    }

    async fn place_multi_orders(&self, orders: &[OrderSpec]) -> GridResult<Vec<String>> {
        let mut placed: Vec<String> = Vec::with_capacity(orders.len());
        for (index, spec) in orders.iter().enumerate() {
            match self
                .place_single_order(spec.is_ask, spec.price, spec.size, None)
                .await
            {
                Ok(id) => placed.push(id),
                Err(e) => {
                    error!("Batch placement failed at {index}: {e}");
                    if !placed.is_empty() {
                        if let Err(cancel_err) = self.cancel_grid_orders(&placed).await {
                            warn!("Rollback cancel failed: {cancel_err}");
                        }
                    }
                    return Err(GridError::PartialPlacement {
                        placed: index,
                        requested: orders.len(),
                    });
                }
            }
        }
        Ok(placed)
    }

    async fn cancel_grid_orders(&self, order_ids: &[String]) -> GridResult<bool> {
        if order_ids.is_empty() {
            return Ok(true);
        }
        let session_id = Uuid::new_v4().to_string();

        let numeric: Vec<i64> = order_ids
            .iter()
            .filter_map(|id| id.parse::<i64>().ok())
            .collect();
        let client_ids: Vec<&String> = order_ids
            .iter()
            .filter(|id| id.parse::<i64>().is_err())
            .collect();

        // Best-guess identifier first, the other as fallback.
        let prefer_exchange_ids = numeric.len() == order_ids.len();
        let field_order: [&str; 2] = if prefer_exchange_ids {
            ["order_id_list", "cl_ord_id_list"]
        } else {
            ["cl_ord_id_list", "order_id_list"]
        };

        let mut accepted = false;
        for field in field_order {
            let payload = match field {
                "order_id_list" => {
                    if numeric.is_empty() {
                        continue;
                    }
                    json!({ field: numeric })
                }
                _ => {
                    if client_ids.is_empty() && prefer_exchange_ids {
                        continue;
                    }
                    let ids: Vec<&String> = if client_ids.is_empty() {
                        order_ids.iter().collect()
                    } else {
                        client_ids.clone()
                    };
                    json!({ field: ids })
                }
            };
            let value = self
                .request(
                    Method::POST,
                    "/cancel_orders",
                    None,
                    Some(payload),
                    Some(&session_id),
                )
                .await?;
            if matches!(response_code(&value), 0 | 200) {
                accepted = true;
                break;
            }
            warn!("cancel_orders via {field} rejected: {value}");
        }

        if !accepted {
            // Last resort: cancel one by one.
            let mut all_ok = true;
            for id in order_ids {
                let payload = match id.parse::<i64>() {
                    Ok(numeric_id) => json!({ "order_id": numeric_id }),
                    Err(_) => json!({ "cl_ord_id": id }),
                };
                let value = self
                    .request(
                        Method::POST,
                        "/cancel_order",
                        None,
                        Some(payload),
                        Some(&session_id),
                    )
                    .await?;
                if !matches!(response_code(&value), 0 | 200) {
                    error!("Failed to cancel {id}: {value}");
                    all_ok = false;
                }
            }
            if !all_ok {
                return Ok(false);
            }
        }

        // Verify the orders actually left the book; acceptance alone has
        // produced false positives.
        for _ in 0..CANCEL_VERIFY_POLLS {
            let open = self.open_order_ids().await?;
            let remaining: Vec<&String> =
                order_ids.iter().filter(|id| open.contains(id)).collect();
            if remaining.is_empty() {
                return Ok(true);
            }
            tokio::time::sleep(CANCEL_VERIFY_DELAY).await;
        }
        warn!("Cancel unverified, orders still visible: {order_ids:?}");
        Ok(false)
    }

    async fn modify_grid_order(
        &self,
        order_id: &str,
        _price: Decimal,
        _size: Decimal,
    ) -> GridResult<bool> {
        // Modification is cancel + create, which needs the original side; the
        // wire does not return it here. Callers that know the side re-place
        // themselves.
        error!("modify_grid_order refused for {order_id}: original side unknown");
        Ok(false)
    }

    async fn candle_stick(
        &self,
        market_id: u32,
        resolution: &str,
        count_back: usize,
    ) -> GridResult<Vec<Candle>> {
        let seconds = resolution_to_seconds(resolution)?;
        let end_time = Utc::now().timestamp();
        let start_time = end_time - (seconds * count_back as i64);
        let params = [
            ("market_id", market_id.to_string()),
            ("resolution", resolution.to_string()),
            ("start_timestamp", start_time.to_string()),
            ("end_timestamp", end_time.to_string()),
            ("count_back", count_back.to_string()),
        ];
        let value = self
            .request(Method::GET, "/v1/candles", Some(&params), None, None)
            .await?;
        if !matches!(response_code(&value), 0 | 200) {
            return Err(GridError::Gateway(format!(
                "candles -> {}",
                value_str(&value, &["message"])
            )));
        }
        let rows = value
            .get("c")
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(rows.iter().map(normalize_candle).collect())
    }

    async fn close(&self) -> GridResult<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(mut task) = self.ws_task.lock().await.take() {
            if timeout(CLOSE_DEADLINE, &mut task).await.is_err() {
                warn!("Stream task still running after {CLOSE_DEADLINE:?}, aborting");
                task.abort();
            }
        }
        Ok(())
    }
}

/// Outer stream loop: reconnect with exponential backoff until shutdown.
async fn stream_events(
    cfg: GatewaySettings,
    events: EventSender,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        if *shutdown.borrow() {
            break;
        }
        match run_stream(&cfg, &events, &mut shutdown).await {
            Ok(()) => break,
            Err(e) => {
                warn!("Market stream dropped: {e}; reconnecting in {backoff:?}");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
                backoff = (backoff * 2).min(RECONNECT_CAP);
            }
        }
    }
    info!("Market stream stopped");
}

/// One connection lifetime: auth, subscribe, pump messages.
async fn run_stream(
    cfg: &GatewaySettings,
    events: &EventSender,
    shutdown: &mut watch::Receiver<bool>,
) -> GridResult<()> {
    let (mut ws, _) = connect_async(cfg.ws_url.as_str())
        .await
        .map_err(|e| GridError::WebSocket(e.to_string()))?;
    debug!("Connected to {}", cfg.ws_url);

    let auth = json!({
        "auth": {
            "token": cfg.api_token,
            "streams": [
                { "channel": "order" },
                { "channel": "position" },
                { "channel": "balance" },
            ],
        }
    });
    ws.send(Message::Text(auth.to_string()))
        .await
        .map_err(|e| GridError::WebSocket(e.to_string()))?;

    let subscriptions = [
        json!({ "subscribe": { "channel": "price", "symbol": cfg.symbol } }),
        json!({ "subscribe": { "channel": "order" } }),
        json!({ "subscribe": { "channel": "position" } }),
    ];
    for sub in subscriptions {
        ws.send(Message::Text(sub.to_string()))
            .await
            .map_err(|e| GridError::WebSocket(e.to_string()))?;
    }

    loop {
        tokio::select! {
            message = ws.next() => {
                let Some(message) = message else {
                    return Err(GridError::WebSocket("stream ended".into()));
                };
                let message = message.map_err(|e| GridError::WebSocket(e.to_string()))?;
                match message {
                    // The venue pings every ~10 s and drops silent clients.
                    Message::Ping(data) => {
                        ws.send(Message::Pong(data))
                            .await
                            .map_err(|e| GridError::WebSocket(e.to_string()))?;
                    }
                    Message::Text(text) => {
                        if let Err(e) = dispatch_message(&text, events) {
                            debug!("Unparsed stream message: {e}");
                        }
                    }
                    Message::Close(_) => {
                        return Err(GridError::WebSocket("server closed the stream".into()));
                    }
                    _ => {}
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = ws.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

fn dispatch_message(text: &str, events: &EventSender) -> GridResult<()> {
    let value: Value = serde_json::from_str(text)?;
    let Some(channel) = value.get("channel").and_then(|c| c.as_str()) else {
        return Ok(());
    };
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    match channel {
        "price" => {
            let mark = value_decimal(&data, &["mark_price", "last_price"]);
            if mark > Decimal::ZERO {
                events
                    .send(GatewayEvent::Price(mark))
                    .map_err(|_| GridError::ChannelClosed)?;
            }
        }
        "order" => {
            let rows = as_rows(data);
            let orders: Vec<Order> = rows.iter().map(normalize_order).collect();
            if !orders.is_empty() {
                events
                    .send(GatewayEvent::Orders(orders))
                    .map_err(|_| GridError::ChannelClosed)?;
            }
        }
        "position" => {
            let rows = as_rows(data);
            let positions: Vec<Position> =
                rows.iter().map(|row| normalize_position(row, "")).collect();
            if !positions.is_empty() {
                events
                    .send(GatewayEvent::Positions(positions))
                    .map_err(|_| GridError::ChannelClosed)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn as_rows(data: Value) -> Vec<Value> {
    match data {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        single => vec![single],
    }
}

fn sign_message(version: &str, request_id: &str, timestamp: i64, body: &str) -> String {
    format!("{version},{request_id},{timestamp},{body}")
}

fn parse_signing_key(raw: &str) -> GridResult<SigningKey> {
    let cleaned = raw.trim().trim_start_matches("0x");
    if cleaned.is_empty() {
        return Err(GridError::Config(
            "STANDX_REQUEST_SIGN_PRIVATE_KEY is not configured".into(),
        ));
    }

    if cleaned.chars().all(|c| c.is_ascii_hexdigit()) && matches!(cleaned.len(), 64 | 128) {
        let bytes = hex::decode(cleaned)
            .map_err(|e| GridError::Config(format!("bad hex signing key: {e}")))?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes[..32]);
        return Ok(SigningKey::from_bytes(&key));
    }

    if let Ok(decoded) = BASE64.decode(cleaned) {
        if matches!(decoded.len(), 32 | 64) {
            let mut key = [0u8; 32];
            key.copy_from_slice(&decoded[..32]);
            return Ok(SigningKey::from_bytes(&key));
        }
    }

    Err(GridError::Config(
        "signing key must be raw hex (64 chars) or base64 (32 bytes)".into(),
    ))
}

fn unwrap_result(value: Value) -> Value {
    match value {
        Value::Object(mut map) => map.remove("result").unwrap_or(Value::Object(map)),
        other => other,
    }
}

fn response_code(value: &Value) -> i64 {
    let direct = value.get("code");
    let nested = value.get("result").and_then(|r| r.get("code"));
    match direct.or(nested) {
        None => 0,
        Some(code) => {
            if let Some(n) = code.as_i64() {
                n
            } else if let Some(s) = code.as_str() {
                s.parse().unwrap_or(-1)
            } else {
                -1
            }
        }
    }
}

fn is_tick_error(value: &Value) -> bool {
    let message = value_str(value, &["message"]).to_ascii_lowercase();
    message.contains("price tick")
}

fn resolution_to_seconds(resolution: &str) -> GridResult<i64> {
    let seconds = match resolution {
        "1m" => 60,
        "3m" => 180,
        "5m" => 300,
        "15m" => 900,
        "30m" => 1_800,
        "1h" => 3_600,
        "4h" => 14_400,
        "1d" => 86_400,
        other => {
            return Err(GridError::Gateway(format!(
                "unsupported candle resolution: {other}"
            )))
        }
    };
    Ok(seconds)
}

fn value_str(value: &Value, keys: &[&str]) -> String {
    for key in keys {
        if let Some(field) = value.get(key) {
            if let Some(s) = field.as_str() {
                return s.to_string();
            }
            if field.is_number() {
                return field.to_string();
            }
        }
    }
    String::new()
}

fn value_decimal(value: &Value, keys: &[&str]) -> Decimal {
    for key in keys {
        if let Some(field) = value.get(key) {
            if let Some(s) = field.as_str() {
                if let Ok(d) = s.parse::<Decimal>() {
                    return d;
                }
            }
            if let Some(f) = field.as_f64() {
                if let Some(d) = Decimal::from_f64(f) {
                    return d;
                }
            }
        }
    }
    Decimal::ZERO
}

fn value_f64(value: &Value, keys: &[&str]) -> f64 {
    for key in keys {
        if let Some(field) = value.get(key) {
            if let Some(f) = field.as_f64() {
                return f;
            }
            if let Some(s) = field.as_str() {
                if let Ok(f) = s.parse::<f64>() {
                    return f;
                }
            }
        }
    }
    0.0
}

fn value_i64(value: &Value, keys: &[&str]) -> i64 {
    for key in keys {
        if let Some(field) = value.get(key) {
            if let Some(n) = field.as_i64() {
                return n;
            }
            if let Some(s) = field.as_str() {
                if let Ok(n) = s.parse::<i64>() {
                    return n;
                }
            }
        }
    }
    0
}

/// Epoch milliseconds from either a numeric field or an ISO-8601 string.
fn value_timestamp_millis(value: &Value, keys: &[&str]) -> i64 {
    for key in keys {
        if let Some(field) = value.get(key) {
            if let Some(n) = field.as_i64() {
                return n;
            }
            if let Some(s) = field.as_str() {
                if let Ok(n) = s.parse::<i64>() {
                    return n;
                }
                if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                    return dt.timestamp_millis();
                }
            }
        }
    }
    0
}

fn normalize_order(row: &Value) -> Order {
    let status_raw = value_str(row, &["status", "state"]);
    Order {
        id: value_str(row, &["id", "order_id"]),
        client_order_id: value_str(row, &["cl_ord_id", "clientOrderId", "client_order_id"]),
        side: Side::from(value_str(row, &["side"]).as_str()),
        price: value_decimal(row, &["price", "limit_price"]),
        size: value_decimal(row, &["qty", "amount", "size"]),
        filled_size: value_decimal(row, &["fill_qty", "filled", "filled_size"]),
        status: OrderStatus::from_wire(&status_raw),
    }
}

fn normalize_trade(row: &Value) -> Trade {
    let trade_id = {
        let id = value_str(row, &["id", "trade_id"]);
        (!id.is_empty()).then_some(id)
    };
    Trade {
        trade_id,
        order_ref: value_str(row, &["cl_ord_id", "order_id", "clientOrderId"]),
        side: Side::from(value_str(row, &["side"]).as_str()),
        price: value_decimal(row, &["price", "fill_price"]),
        size: value_decimal(row, &["qty", "size", "amount"]),
        ts: value_timestamp_millis(row, &["created_at", "time", "timestamp"]),
    }
}

fn normalize_position(row: &Value, default_symbol: &str) -> Position {
    let qty_signed = value_decimal(row, &["position", "size", "qty", "amount"]);
    let side_raw = value_str(row, &["side"]).to_ascii_lowercase();
    let mut sign: i8 = match qty_signed.cmp(&Decimal::ZERO) {
        std::cmp::Ordering::Greater => 1,
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
    };
    if side_raw == "sell" {
        sign = -1;
    } else if side_raw == "buy" {
        sign = 1;
    }
    let symbol = {
        let s = value_str(row, &["symbol"]);
        if s.is_empty() {
            default_symbol.to_string()
        } else {
            s
        }
    };
    Position {
        symbol,
        qty: qty_signed.abs(),
        sign,
        entry_price: value_decimal(row, &["entry_price", "avg_entry_price"]),
        unrealized_pnl: value_decimal(row, &["unrealized_pnl", "pnl"]),
    }
}

fn normalize_candle(row: &Value) -> Candle {
    Candle {
        time: value_i64(row, &["t", "time"]),
        open: value_f64(row, &["o", "open"]),
        high: value_f64(row, &["h", "high"]),
        low: value_f64(row, &["l", "low"]),
        close: value_f64(row, &["c", "close"]),
        volume: value_f64(row, &["v", "volume"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Verifier, VerifyingKey};
    use rust_decimal_macros::dec;

    #[test]
    fn test_normalize_order_from_wire_row() {
        let row = json!({
            "id": 98765,
            "cl_ord_id": "grid_1700000000000_0_ab12",
            "symbol": "ETH-USD",
            "side": "sell",
            "order_type": "limit",
            "status": "new",
            "price": "3001.5",
            "qty": "0.01",
            "fill_qty": "0",
            "created_at": "2025-08-11T03:35:25.559151Z"
        });
        let order = normalize_order(&row);
        assert_eq!(order.id, "98765");
        assert_eq!(order.client_order_id, "grid_1700000000000_0_ab12");
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.price, dec!(3001.5));
        assert_eq!(order.size, dec!(0.01));
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.key(), "grid_1700000000000_0_ab12");
    }

    #[test]
    fn test_normalize_trade_timestamp_formats() {
        let iso = json!({
            "id": "t1",
            "order_id": "o1",
            "side": "buy",
            "price": "2998.5",
            "qty": "0.01",
            "created_at": "2025-08-11T03:35:25.559Z"
        });
        let trade = normalize_trade(&iso);
        assert_eq!(trade.trade_id.as_deref(), Some("t1"));
        assert_eq!(trade.order_ref, "o1");
        assert!(trade.ts > 1_700_000_000_000);

        let numeric = json!({
            "order_id": "o2",
            "side": "sell",
            "price": 3000.5,
            "qty": 0.01,
            "time": 1_754_000_000_123i64
        });
        let trade = normalize_trade(&numeric);
        assert!(trade.trade_id.is_none());
        assert_eq!(trade.ts, 1_754_000_000_123);
        assert_eq!(trade.price, dec!(3000.5));
    }

    #[test]
    fn test_normalize_position_signs() {
        let short_row = json!({
            "symbol": "ETH-USD",
            "position": "-0.05",
            "entry_price": "3000.0",
            "unrealized_pnl": "-1.5"
        });
        let position = normalize_position(&short_row, "ETH-USD");
        assert_eq!(position.qty, dec!(0.05));
        assert_eq!(position.sign, -1);

        let sided_row = json!({
            "size": "0.05",
            "side": "sell"
        });
        let position = normalize_position(&sided_row, "ETH-USD");
        assert_eq!(position.sign, -1);
        assert_eq!(position.symbol, "ETH-USD");
    }

    #[test]
    fn test_response_code_variants() {
        assert_eq!(response_code(&json!({})), 0);
        assert_eq!(response_code(&json!({"code": 200})), 200);
        assert_eq!(response_code(&json!({"code": "408"})), 408);
        assert_eq!(response_code(&json!({"result": {"code": 7}})), 7);
    }

    #[test]
    fn test_unwrap_result() {
        let wrapped = json!({"result": [1, 2, 3]});
        assert_eq!(unwrap_result(wrapped), json!([1, 2, 3]));
        let bare = json!([4, 5]);
        assert_eq!(unwrap_result(bare.clone()), bare);
    }

    #[test]
    fn test_is_tick_error() {
        assert!(is_tick_error(&json!({
            "code": 400, "message": "price does not follow price tick"
        })));
        assert!(!is_tick_error(&json!({"code": 400, "message": "margin"})));
    }

    #[test]
    fn test_resolution_mapping() {
        assert_eq!(resolution_to_seconds("1m").unwrap(), 60);
        assert_eq!(resolution_to_seconds("15m").unwrap(), 900);
        assert_eq!(resolution_to_seconds("1d").unwrap(), 86_400);
        assert!(resolution_to_seconds("7m").is_err());
    }

    #[test]
    fn test_signing_key_formats_and_signature() {
        let hex_key = "1b6e9cdd5e80a1c1ab8a4e3ffe9e1327323b694bf3955a6fd9c07a973e6ae9f5";
        let key = parse_signing_key(hex_key).unwrap();

        let message = sign_message(SIGN_VERSION, "req-1", 1_754_000_000_000, "{\"a\":1}");
        let signature = key.sign(message.as_bytes());
        let verifier = VerifyingKey::from(&key);
        assert!(verifier.verify(message.as_bytes(), &signature).is_ok());

        // The same key in base64 yields the same signer.
        let raw = hex::decode(hex_key).unwrap();
        let b64_key = BASE64.encode(&raw);
        let key2 = parse_signing_key(&b64_key).unwrap();
        assert_eq!(key.to_bytes(), key2.to_bytes());

        assert!(parse_signing_key("").is_err());
        assert!(parse_signing_key("not-a-key").is_err());
    }

    #[test]
    fn test_sign_message_layout() {
        let message = sign_message("v1", "abc", 42, "{}");
        assert_eq!(message, "v1,abc,42,{}");
    }

    #[test]
    fn test_dispatch_price_message() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let text = json!({
            "channel": "price",
            "data": { "symbol": "ETH-USD", "mark_price": "3000.25", "time": 1 }
        })
        .to_string();
        dispatch_message(&text, &tx).unwrap();
        match rx.try_recv().unwrap() {
            GatewayEvent::Price(price) => assert_eq!(price, dec!(3000.25)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_dispatch_order_message_single_row() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let text = json!({
            "channel": "order",
            "data": {
                "id": 5, "cl_ord_id": "grid_1_0_aaaa", "side": "buy",
                "price": "2998.5", "qty": "0.01", "fill_qty": "0.01",
                "status": "filled"
            }
        })
        .to_string();
        dispatch_message(&text, &tx).unwrap();
        match rx.try_recv().unwrap() {
            GatewayEvent::Orders(orders) => {
                assert_eq!(orders.len(), 1);
                assert_eq!(orders[0].status, OrderStatus::Filled);
                assert_eq!(orders[0].filled_size, dec!(0.01));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_dispatch_ignores_unknown_channels() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let text = json!({"channel": "balance", "data": {}}).to_string();
        dispatch_message(&text, &tx).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
