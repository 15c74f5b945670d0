//! Live Binance USDT-margined perpetual futures adaptor.
//!
//! Market data is assembled from multi-interval klines plus funding, open
//! interest, and top-trader positioning; account and position state always
//! comes from the exchange (it is authoritative). Execution maps validated
//! decisions onto market orders with protective stop-market /
//! take-profit-market orders, honouring hedge mode, and latches a
//! process-lifetime flag when the account rejects stop orders outright.

pub mod client;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use perp_common::{format_price, format_quantity, is_major, Kline, Side};

use crate::clock::Clock;
use crate::history::TradeHistoryManager;
use crate::indicators;
use crate::types::{
    Account, Decision, DecisionAction, LiquidationEstimate, LongShortRatio, MarketSnapshot,
    OpenInterest, Position, Sentiment, TimeframeIndicators, TradeRecord,
};

use super::oi_tracker::OiTracker;
use super::open_time::OpenTimeStore;
use super::{Exchange, ExchangeError};

pub use client::BinanceClient;
use client::OrderRequest;

const KLINE_LIMIT: usize = 60;

struct LiveState {
    market: BTreeMap<String, MarketSnapshot>,
    oi_tracker: OiTracker,
    open_times: OpenTimeStore,
    peak_pnl: HashMap<String, f64>,
    initial_equity: f64,
    last_account: Account,
    last_positions: Vec<Position>,
}

/// Live exchange adaptor.
pub struct BinanceExchange {
    client: BinanceClient,
    state: RwLock<LiveState>,
    history: TradeHistoryManager,
    /// Hedge mode, latched once at startup.
    dual_side: AtomicBool,
    /// Latched when the account rejects stop orders (code -4120); further
    /// protective order placement becomes a logged no-op.
    stop_orders_disabled: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl BinanceExchange {
    /// Connect, detect position mode, and restore the open-time table.
    pub async fn connect(
        api_key: String,
        secret_key: String,
        proxy_url: Option<&str>,
        open_time_path: PathBuf,
        history: TradeHistoryManager,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ExchangeError> {
        let client = BinanceClient::new(api_key, secret_key, proxy_url)?;

        let dual_side = match client.dual_side_position().await {
            Ok(dual) => dual,
            Err(e) => {
                warn!(error = %e, "position mode query failed, assuming one-way mode");
                false
            }
        };
        info!(dual_side, "binance position mode detected");

        Ok(Self {
            client,
            state: RwLock::new(LiveState {
                market: BTreeMap::new(),
                oi_tracker: OiTracker::new(),
                open_times: OpenTimeStore::load(open_time_path),
                peak_pnl: HashMap::new(),
                initial_equity: 0.0,
                last_account: Account::default(),
                last_positions: Vec::new(),
            }),
            history,
            dual_side: AtomicBool::new(dual_side),
            stop_orders_disabled: AtomicBool::new(false),
            clock,
        })
    }

    pub fn is_hedge_mode(&self) -> bool {
        self.dual_side.load(Ordering::Relaxed)
    }

    fn position_side_of(&self, side: Side) -> Option<&'static str> {
        if self.is_hedge_mode() {
            Some(match side {
                Side::Long => "LONG",
                Side::Short => "SHORT",
            })
        } else {
            None
        }
    }

    /// Pull recent fills into the trade history. Called at startup and
    /// periodically; records with non-zero realized PnL read as closes.
    pub async fn sync_trade_history(&self, symbols: &[String]) {
        for symbol in symbols {
            let trades = match self.client.user_trades(symbol, 10).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(symbol, error = %e, "fill sync failed");
                    continue;
                }
            };
            for t in trades {
                let price = t.price.parse::<f64>().unwrap_or_default();
                let qty = t.qty.parse::<f64>().unwrap_or_default();
                let pnl = t.realized_pnl.parse::<f64>().unwrap_or_default();

                let side = if t.side == "BUY" { Side::Long } else { Side::Short };
                let action = if pnl != 0.0 {
                    "close/profit".to_string()
                } else if t.side == "BUY" {
                    "open_long".to_string()
                } else {
                    "open_short".to_string()
                };

                let time = chrono::DateTime::from_timestamp_millis(t.time)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();

                self.history.add(TradeRecord {
                    time,
                    symbol: t.symbol,
                    side,
                    action,
                    entry_price: price,
                    exit_price: price,
                    quantity: qty,
                    pnl,
                    pnl_pct: 0.0,
                    reason: "synced from exchange fills".into(),
                });
            }
        }
        debug!("fill sync complete");
    }

    /// Fetch everything needed for one symbol's snapshot. Network errors on
    /// the required series (3m, 4h) skip the symbol.
    async fn fetch_symbol(&self, symbol: &str) -> Option<FetchedSymbol> {
        let klines_3m = match self.client.klines(symbol, "3m", KLINE_LIMIT).await {
            Ok(k) if !k.is_empty() => k,
            Ok(_) => return None,
            Err(e) => {
                warn!(symbol, error = %e, "3m kline fetch failed");
                return None;
            }
        };
        let klines_4h = match self.client.klines(symbol, "4h", KLINE_LIMIT).await {
            Ok(k) if !k.is_empty() => k,
            Ok(_) => return None,
            Err(e) => {
                warn!(symbol, error = %e, "4h kline fetch failed");
                return None;
            }
        };
        // The shorter context intervals degrade gracefully.
        let klines_5m = self
            .client
            .klines(symbol, "5m", KLINE_LIMIT)
            .await
            .unwrap_or_else(|e| {
                warn!(symbol, error = %e, "5m kline fetch failed");
                Vec::new()
            });
        let klines_1h = self
            .client
            .klines(symbol, "1h", KLINE_LIMIT)
            .await
            .unwrap_or_else(|e| {
                warn!(symbol, error = %e, "1h kline fetch failed");
                Vec::new()
            });
        let day_open = self.fetch_day_open(symbol).await;

        let funding_rate = self.client.funding_rate(symbol).await.unwrap_or_default();
        let open_interest = self.client.open_interest(symbol).await.ok();
        let long_short = self.client.top_long_short_ratio(symbol).await.ok();

        Some(FetchedSymbol {
            symbol: symbol.to_string(),
            klines_3m,
            klines_5m,
            klines_1h,
            klines_4h,
            day_open,
            funding_rate,
            open_interest,
            long_short,
        })
    }

    /// Open price of today's (UTC) daily candle.
    async fn fetch_day_open(&self, symbol: &str) -> Option<f64> {
        match self.client.klines(symbol, "1d", 2).await {
            Ok(klines) => klines.last().map(|k| k.open),
            Err(e) => {
                debug!(symbol, error = %e, "daily kline fetch failed");
                None
            }
        }
    }

    fn build_snapshot(fetched: FetchedSymbol, oi: Option<OpenInterest>) -> MarketSnapshot {
        let series = &fetched.klines_3m;
        let current_price = series.last().map(|k| k.close).unwrap_or_default();

        let tf = |bars: &[Kline]| TimeframeIndicators {
            ema20: indicators::ema(bars, 20),
            macd: indicators::macd(bars),
            rsi14: indicators::rsi(bars, 14),
            atr14: indicators::atr(bars, 14),
        };

        let klines_15m = indicators::aggregate(series, 5);
        let klines_30m = indicators::aggregate(series, 10);

        let price_change_1h = if fetched.klines_1h.len() >= 2 {
            pct_change(
                fetched.klines_1h[fetched.klines_1h.len() - 2].close,
                current_price,
            )
        } else if series.len() >= 21 {
            pct_change(series[series.len() - 21].close, current_price)
        } else {
            0.0
        };
        let price_change_4h = if fetched.klines_4h.len() >= 2 {
            pct_change(
                fetched.klines_4h[fetched.klines_4h.len() - 2].close,
                current_price,
            )
        } else {
            0.0
        };
        let price_change_day = fetched
            .day_open
            .filter(|open| *open > 0.0)
            .map(|open| pct_change(open, current_price))
            .unwrap_or_default();

        let intraday = indicators::intraday_series(series);

        let liquidation = oi.and_then(|oi| {
            estimate_liquidation(&fetched.symbol, oi.change_1h, intraday.atr14)
        });

        let vol_1h = if fetched.klines_1h.is_empty() {
            0.0
        } else {
            indicators::realized_volatility(&fetched.klines_1h, 20)
        };
        let ls_ratio = fetched.long_short.map(|(ratio, long_pct, short_pct)| {
            LongShortRatio {
                ratio,
                long_pct,
                short_pct,
            }
        });
        let sentiment = local_sentiment(fetched.funding_rate, ls_ratio.map(|r| r.ratio), vol_1h);

        MarketSnapshot {
            symbol: fetched.symbol,
            current_price,
            price_change_1h,
            price_change_4h,
            price_change_day,
            current_ema20: indicators::ema(series, 20),
            current_macd: indicators::macd(series),
            current_rsi7: indicators::rsi(series, 7),
            tf_5m: tf(&fetched.klines_5m),
            tf_15m: tf(&klines_15m),
            tf_30m: tf(&klines_30m),
            tf_1h: tf(&fetched.klines_1h),
            bollinger: indicators::bollinger(series, 20, 2.0),
            funding_rate: fetched.funding_rate,
            open_interest: oi,
            long_short_ratio: ls_ratio,
            liquidation,
            volume: indicators::volume_analysis(series, 20),
            sentiment: Some(sentiment),
            intraday: Some(intraday),
            longer_term: Some(indicators::longer_term_context(&fetched.klines_4h)),
        }
    }

    async fn find_position(
        &self,
        symbol: &str,
        want: Option<Side>,
    ) -> Option<Position> {
        self.positions()
            .await
            .into_iter()
            .find(|p| p.symbol == symbol && want.map_or(true, |s| p.side == s))
    }

    /// Place a reduce-all stop-market order. No-op once the capability flag
    /// is down.
    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        stop_price: f64,
    ) -> Result<(), ExchangeError> {
        self.place_protective(symbol, side, stop_price, "STOP_MARKET")
            .await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: Side,
        stop_price: f64,
    ) -> Result<(), ExchangeError> {
        self.place_protective(symbol, side, stop_price, "TAKE_PROFIT_MARKET")
            .await
    }

    async fn place_protective(
        &self,
        symbol: &str,
        side: Side,
        stop_price: f64,
        order_type: &'static str,
    ) -> Result<(), ExchangeError> {
        if self.stop_orders_disabled.load(Ordering::Relaxed) {
            info!(symbol, order_type, "protective orders disabled on this account, skipping");
            return Ok(());
        }

        let close_side = match side {
            Side::Long => "SELL",
            Side::Short => "BUY",
        };
        let result = self
            .client
            .create_order(&OrderRequest {
                symbol: symbol.to_string(),
                side: close_side,
                order_type,
                quantity: None, // closePosition replaces quantity
                position_side: self.position_side_of(side),
                stop_price: Some(format_price(stop_price)),
                close_position: true,
                working_type: Some("CONTRACT_PRICE"),
            })
            .await;

        if let Err(e) = &result {
            if e.is_stop_order_unsupported() {
                warn!(
                    symbol,
                    "account rejects stop orders (-4120); disabling protective orders for this process"
                );
                self.stop_orders_disabled.store(true, Ordering::Relaxed);
                return Ok(());
            }
        }
        result
    }

    async fn cancel_orders_of_types(&self, symbol: &str, types: &[&str]) -> Result<(), ExchangeError> {
        let orders = self.client.open_orders(symbol).await?;
        for order in orders {
            if types.contains(&order.order_type.as_str()) {
                if let Err(e) = self.client.cancel_order(symbol, order.order_id).await {
                    warn!(symbol, order_id = order.order_id, error = %e, "order cancel failed");
                }
            }
        }
        Ok(())
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        self.cancel_orders_of_types(symbol, &["STOP_MARKET", "STOP"]).await
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        self.cancel_orders_of_types(symbol, &["TAKE_PROFIT_MARKET", "TAKE_PROFIT"])
            .await
    }

    async fn execute_open(&self, d: &Decision) -> Result<(), ExchangeError> {
        let symbol = &d.symbol;
        let side = if d.action == DecisionAction::OpenLong {
            Side::Long
        } else {
            Side::Short
        };

        // Stale protective orders from an earlier position must not stack
        // onto the new one.
        if let Err(e) = self.client.cancel_all_orders(symbol).await {
            warn!(symbol, error = %e, "pre-open order cleanup failed");
        }

        if d.leverage > 0 {
            if let Err(e) = self.client.change_leverage(symbol, d.leverage).await {
                warn!(symbol, leverage = d.leverage, error = %e, "leverage change failed, continuing");
            }
        }

        let price = {
            let state = self.state.read().await;
            state
                .market
                .get(symbol)
                .map(|m| m.current_price)
                .ok_or_else(|| ExchangeError::NoMarketData(symbol.clone()))?
        };
        if price <= 0.0 {
            return Err(ExchangeError::InvalidPrice(symbol.clone()));
        }

        let quantity = d.position_size_usd / price;
        let qty_str = format_quantity(symbol, quantity);

        self.client
            .create_order(&OrderRequest {
                symbol: symbol.clone(),
                side: match side {
                    Side::Long => "BUY",
                    Side::Short => "SELL",
                },
                order_type: "MARKET",
                quantity: Some(qty_str.clone()),
                position_side: self.position_side_of(side),
                ..Default::default()
            })
            .await?;
        info!(symbol, action = %d.action, qty = %qty_str, "market open placed");

        // Protective orders are best effort: a failure here never undoes
        // the open.
        if d.stop_loss > 0.0 {
            if let Err(e) = self.set_stop_loss(symbol, side, d.stop_loss).await {
                error!(symbol, stop = d.stop_loss, error = %e, "stop loss placement failed");
            }
        }
        if d.take_profit > 0.0 {
            if let Err(e) = self.set_take_profit(symbol, side, d.take_profit).await {
                error!(symbol, take = d.take_profit, error = %e, "take profit placement failed");
            }
        }

        Ok(())
    }

    async fn execute_close(&self, d: &Decision) -> Result<(), ExchangeError> {
        let symbol = &d.symbol;
        let want = if d.action == DecisionAction::CloseLong {
            Side::Long
        } else {
            Side::Short
        };
        // The advisor's notional is ignored: closes are for the exact held
        // quantity.
        let pos = self
            .find_position(symbol, Some(want))
            .await
            .ok_or_else(|| ExchangeError::NoPosition {
                symbol: symbol.clone(),
                action: d.action.to_string(),
            })?;

        let qty_str = format_quantity(symbol, pos.quantity);
        self.client
            .create_order(&OrderRequest {
                symbol: symbol.clone(),
                side: match want {
                    Side::Long => "SELL",
                    Side::Short => "BUY",
                },
                order_type: "MARKET",
                quantity: Some(qty_str.clone()),
                position_side: self.position_side_of(want),
                ..Default::default()
            })
            .await?;
        info!(symbol, action = %d.action, qty = %qty_str, "market close placed");

        self.history.add(TradeRecord {
            time: self.clock.now().format("%Y-%m-%d %H:%M:%S").to_string(),
            symbol: symbol.clone(),
            side: pos.side,
            action: d.action.to_string(),
            entry_price: pos.entry_price,
            exit_price: pos.mark_price, // approximate; market fill may slip
            quantity: pos.quantity,
            pnl: pos.unrealized_pnl,
            pnl_pct: pos.unrealized_pnl_pct,
            reason: d.reasoning.clone(),
        });

        {
            let mut state = self.state.write().await;
            state.peak_pnl.remove(symbol);
            state.open_times.remove(pos.side, symbol);
        }

        if let Err(e) = self.cancel_stop_loss_orders(symbol).await {
            warn!(symbol, error = %e, "post-close stop cancel failed");
        }
        if let Err(e) = self.cancel_take_profit_orders(symbol).await {
            warn!(symbol, error = %e, "post-close take cancel failed");
        }

        Ok(())
    }

    async fn execute_partial_close(&self, d: &Decision) -> Result<(), ExchangeError> {
        let symbol = &d.symbol;
        let pos = self
            .find_position(symbol, None)
            .await
            .ok_or_else(|| ExchangeError::NoPosition {
                symbol: symbol.clone(),
                action: d.action.to_string(),
            })?;

        let mut pct = d.close_percentage / 100.0;
        if pct <= 0.0 {
            let notional = pos.quantity * pos.mark_price;
            if d.position_size_usd <= 0.0 || notional <= 0.0 {
                return Err(ExchangeError::InvalidParameter(format!(
                    "cannot derive close percentage for {symbol}"
                )));
            }
            pct = (d.position_size_usd / notional).min(1.0);
            info!(
                symbol,
                derived_pct = pct * 100.0,
                "[Partial Fallback] close percentage derived from notional"
            );
        }
        pct = pct.min(1.0);

        let close_qty = pos.quantity * pct;
        let qty_str = format_quantity(symbol, close_qty);

        self.client
            .create_order(&OrderRequest {
                symbol: symbol.clone(),
                side: match pos.side {
                    Side::Long => "SELL",
                    Side::Short => "BUY",
                },
                order_type: "MARKET",
                quantity: Some(qty_str.clone()),
                position_side: self.position_side_of(pos.side),
                ..Default::default()
            })
            .await?;
        info!(symbol, pct = pct * 100.0, qty = %qty_str, "partial close placed");

        self.history.add(TradeRecord {
            time: self.clock.now().format("%Y-%m-%d %H:%M:%S").to_string(),
            symbol: symbol.clone(),
            side: pos.side,
            action: "partial_close".into(),
            entry_price: pos.entry_price,
            exit_price: pos.mark_price,
            quantity: close_qty,
            pnl: pos.unrealized_pnl * pct,
            pnl_pct: pos.unrealized_pnl_pct,
            reason: d.reasoning.clone(),
        });

        // A ~100% partial close is a full close for housekeeping purposes.
        if pct >= 0.999 {
            {
                let mut state = self.state.write().await;
                state.peak_pnl.remove(symbol);
                state.open_times.remove(pos.side, symbol);
            }
            if let Err(e) = self.cancel_stop_loss_orders(symbol).await {
                warn!(symbol, error = %e, "post-close stop cancel failed");
            }
            if let Err(e) = self.cancel_take_profit_orders(symbol).await {
                warn!(symbol, error = %e, "post-close take cancel failed");
            }
        }

        Ok(())
    }

    async fn execute_stop_update(&self, d: &Decision) -> Result<(), ExchangeError> {
        let new_stop = if d.new_stop_loss > 0.0 {
            d.new_stop_loss
        } else {
            d.stop_loss
        };
        if new_stop <= 0.0 {
            return Err(ExchangeError::InvalidParameter(format!(
                "invalid new stop loss {new_stop}"
            )));
        }
        let pos = self
            .find_position(&d.symbol, None)
            .await
            .ok_or_else(|| ExchangeError::NoPosition {
                symbol: d.symbol.clone(),
                action: d.action.to_string(),
            })?;

        if let Err(e) = self.cancel_stop_loss_orders(&d.symbol).await {
            warn!(symbol = %d.symbol, error = %e, "old stop cancel failed, placing new anyway");
        }
        info!(symbol = %d.symbol, side = %pos.side, new_stop, "updating stop loss");
        self.set_stop_loss(&d.symbol, pos.side, new_stop).await
    }

    async fn execute_take_update(&self, d: &Decision) -> Result<(), ExchangeError> {
        if d.new_take_profit <= 0.0 {
            return Err(ExchangeError::InvalidParameter(format!(
                "invalid new take profit {}",
                d.new_take_profit
            )));
        }
        let pos = self
            .find_position(&d.symbol, None)
            .await
            .ok_or_else(|| ExchangeError::NoPosition {
                symbol: d.symbol.clone(),
                action: d.action.to_string(),
            })?;

        if let Err(e) = self.cancel_take_profit_orders(&d.symbol).await {
            warn!(symbol = %d.symbol, error = %e, "old take cancel failed, placing new anyway");
        }
        info!(symbol = %d.symbol, side = %pos.side, new_take = d.new_take_profit, "updating take profit");
        self.set_take_profit(&d.symbol, pos.side, d.new_take_profit)
            .await
    }
}

struct FetchedSymbol {
    symbol: String,
    klines_3m: Vec<Kline>,
    klines_5m: Vec<Kline>,
    klines_1h: Vec<Kline>,
    klines_4h: Vec<Kline>,
    day_open: Option<f64>,
    funding_rate: f64,
    open_interest: Option<f64>,
    long_short: Option<(f64, f64, f64)>,
}

fn pct_change(prev: f64, current: f64) -> f64 {
    if prev > 0.0 {
        (current - prev) / prev * 100.0
    } else {
        0.0
    }
}

/// Local fear/greed heuristic from funding and crowding. Not part of any
/// exchange contract; the snapshot fields just need comparable semantics.
fn local_sentiment(funding_rate: f64, ls_ratio: Option<f64>, volatility_1h: f64) -> Sentiment {
    let mut score: i32 = 50;
    if funding_rate > 0.0 {
        score += 5;
    }
    if funding_rate > 0.0005 {
        score += 10;
    }
    if funding_rate < 0.0 {
        score -= 5;
    }
    if funding_rate < -0.0005 {
        score -= 10;
    }

    let mut crowding = "Neutral".to_string();
    if let Some(ratio) = ls_ratio {
        if ratio > 1.2 {
            score += 10;
            crowding = "Bullish_Crowded".into();
        } else if ratio < 0.8 {
            score -= 10;
            crowding = "Bearish_Crowded".into();
        }
    }

    let score = score.clamp(0, 100);
    let label = match score {
        0..=20 => "Extreme Fear",
        21..=40 => "Fear",
        41..=59 => "Neutral",
        60..=79 => "Greed",
        _ => "Extreme Greed",
    };

    Sentiment {
        fear_greed_index: score,
        fear_greed_label: label.into(),
        crowding,
        volatility_1h,
    }
}

/// Liquidation amount estimate from OI drawdown. Real liquidation feeds
/// need a websocket aggregator; this stands in with comparable semantics.
fn estimate_liquidation(
    symbol: &str,
    oi_change_1h: f64,
    _atr_3m: f64,
) -> Option<LiquidationEstimate> {
    if oi_change_1h >= -0.5 {
        return None;
    }
    let mut amount = oi_change_1h.abs() * 100_000.0;
    if is_major(symbol) {
        amount *= 10.0;
    }
    Some(LiquidationEstimate {
        amount_1h: amount,
        amount_4h: amount * 2.5,
        side_ratio: 1.5,
    })
}

#[async_trait]
impl Exchange for BinanceExchange {
    async fn refresh_market_data(&self, symbols: &[String]) -> Result<(), ExchangeError> {
        for symbol in symbols {
            let Some(fetched) = self.fetch_symbol(symbol).await else {
                continue;
            };

            let now = self.clock.now();
            let mut state = self.state.write().await;

            let oi = fetched.open_interest.map(|latest| {
                state.oi_tracker.record(symbol, latest, now);
                OpenInterest {
                    latest,
                    average: latest,
                    change_1h: state.oi_tracker.change_pct(symbol, Duration::hours(1)),
                    change_4h: state.oi_tracker.change_pct(symbol, Duration::hours(4)),
                }
            });

            let snapshot = Self::build_snapshot(fetched, oi);
            state.market.insert(symbol.clone(), snapshot);
        }
        Ok(())
    }

    async fn account(&self) -> Account {
        let totals = match self.client.account_totals().await {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "account query failed, serving last snapshot");
                return self.state.read().await.last_account;
            }
        };

        let wallet = totals.total_wallet_balance.parse::<f64>().unwrap_or_default();
        let unrealized = totals
            .total_unrealized_profit
            .parse::<f64>()
            .unwrap_or_default();
        let margin = totals.total_initial_margin.parse::<f64>().unwrap_or_default();
        let total_equity = wallet + unrealized;

        let mut state = self.state.write().await;
        // Baseline for realized-PnL%: frozen on the first successful read.
        if state.initial_equity == 0.0 && total_equity > 0.0 {
            state.initial_equity = total_equity;
            info!(initial_equity = total_equity, "initial equity baseline frozen");
        }

        let (realized_pnl, realized_pnl_pct) = if state.initial_equity > 0.0 {
            let pnl = total_equity - state.initial_equity;
            (pnl, pnl / state.initial_equity * 100.0)
        } else {
            (0.0, 0.0)
        };

        let account = Account {
            total_equity,
            available_balance: wallet - margin,
            unrealized_pnl: unrealized,
            realized_pnl,
            realized_pnl_pct,
            margin_used: margin,
            margin_used_pct: if total_equity > 0.0 {
                margin / total_equity * 100.0
            } else {
                0.0
            },
            position_count: state.last_positions.len(),
        };
        state.last_account = account;
        account
    }

    async fn positions(&self) -> Vec<Position> {
        let risks = match self.client.position_risk().await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "position query failed, serving last snapshot");
                return self.state.read().await.last_positions.clone();
            }
        };

        let now_ms = self.clock.now_ms();
        let mut state = self.state.write().await;
        let mut positions = Vec::new();
        let mut active: Vec<(Side, String)> = Vec::new();

        for p in &risks {
            let amt = p.position_amt.parse::<f64>().unwrap_or_default();
            if amt == 0.0 {
                continue;
            }
            let (side, quantity) = if amt < 0.0 {
                (Side::Short, -amt)
            } else {
                (Side::Long, amt)
            };

            let entry_price = p.entry_price.parse::<f64>().unwrap_or_default();
            let mark_price = p.mark_price.parse::<f64>().unwrap_or_default();
            let unrealized = p.unrealized_profit.parse::<f64>().unwrap_or_default();
            let leverage = p.leverage.parse::<u32>().unwrap_or(1).max(1);
            let liquidation_price = p.liquidation_price.parse::<f64>().unwrap_or_default();

            let margin_used = quantity * mark_price / leverage as f64;
            let unrealized_pct = if margin_used > 0.0 {
                unrealized / margin_used * 100.0
            } else {
                0.0
            };

            let peak = state
                .peak_pnl
                .entry(p.symbol.clone())
                .and_modify(|v| {
                    if unrealized_pct > *v {
                        *v = unrealized_pct;
                    }
                })
                .or_insert(unrealized_pct);
            let peak = *peak;

            let opened_at_ms = state.open_times.get_or_insert(side, &p.symbol, now_ms);
            active.push((side, p.symbol.clone()));

            positions.push(Position {
                symbol: p.symbol.clone(),
                side,
                entry_price,
                mark_price,
                quantity,
                leverage,
                unrealized_pnl: unrealized,
                unrealized_pnl_pct: unrealized_pct,
                peak_pnl_pct: peak,
                liquidation_price,
                margin_used,
                opened_at_ms,
            });
        }

        state
            .open_times
            .prune(active.iter().map(|(s, sym)| (*s, sym.as_str())));
        state.open_times.save();
        state.last_positions = positions.clone();
        positions
    }

    async fn market_data(&self) -> BTreeMap<String, MarketSnapshot> {
        self.state.read().await.market.clone()
    }

    async fn execute_decision(&self, d: &Decision) -> Result<(), ExchangeError> {
        if d.action == DecisionAction::Wait
            || d.action == DecisionAction::Hold
            || d.symbol.is_empty()
            || d.symbol == "NONE"
        {
            return Ok(());
        }

        match d.action {
            DecisionAction::OpenLong | DecisionAction::OpenShort => self.execute_open(d).await,
            DecisionAction::CloseLong | DecisionAction::CloseShort => self.execute_close(d).await,
            DecisionAction::PartialClose => self.execute_partial_close(d).await,
            DecisionAction::UpdateStopLoss => self.execute_stop_update(d).await,
            DecisionAction::UpdateTakeProfit => self.execute_take_update(d).await,
            _ => Ok(()),
        }
    }

    async fn trade_history(&self) -> Vec<TradeRecord> {
        self.history.history()
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        if leverage == 0 {
            return Err(ExchangeError::InvalidParameter(
                "leverage must be positive".into(),
            ));
        }
        self.client.change_leverage(symbol, leverage).await?;
        info!(symbol, leverage, "leverage changed");
        Ok(())
    }

    async fn cleanup_protective_orders(&self, symbols: &[String]) {
        let held: HashSet<String> = self
            .positions()
            .await
            .into_iter()
            .map(|p| p.symbol)
            .collect();
        for symbol in symbols {
            if held.contains(symbol) {
                continue;
            }
            if let Err(e) = self.cancel_stop_loss_orders(symbol).await {
                debug!(symbol, error = %e, "cleanup stop cancel failed");
            }
            if let Err(e) = self.cancel_take_profit_orders(symbol).await {
                debug!(symbol, error = %e, "cleanup take cancel failed");
            }
        }
    }

    fn name(&self) -> &'static str {
        "binance"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentiment_scoring_matches_heuristic() {
        // Zero funding moves nothing.
        let neutral = local_sentiment(0.0, Some(1.0), 0.0);
        assert_eq!(neutral.fear_greed_index, 50);
        assert_eq!(neutral.fear_greed_label, "Neutral");
        assert_eq!(neutral.crowding, "Neutral");

        let greedy = local_sentiment(0.001, Some(1.5), 0.0);
        assert_eq!(greedy.fear_greed_index, 75);
        assert_eq!(greedy.fear_greed_label, "Greed");
        assert_eq!(greedy.crowding, "Bullish_Crowded");

        let fearful = local_sentiment(-0.001, Some(0.5), 0.0);
        assert_eq!(fearful.fear_greed_index, 25);
        assert_eq!(fearful.fear_greed_label, "Fear");
        assert_eq!(fearful.crowding, "Bearish_Crowded");
    }

    #[test]
    fn liquidation_estimate_requires_oi_drop() {
        assert!(estimate_liquidation("BTCUSDT", 0.0, 10.0).is_none());
        assert!(estimate_liquidation("BTCUSDT", -0.4, 10.0).is_none());

        let est = estimate_liquidation("SOLUSDT", -2.0, 1.0).unwrap();
        assert!((est.amount_1h - 200_000.0).abs() < 1e-6);
        assert!((est.amount_4h - 500_000.0).abs() < 1e-6);

        // Majors get the x10 multiplier.
        let est = estimate_liquidation("BTCUSDT", -2.0, 100.0).unwrap();
        assert!((est.amount_1h - 2_000_000.0).abs() < 1e-6);
    }
}
