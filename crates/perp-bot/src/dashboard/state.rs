//! Shared dashboard state.
//!
//! The control loop pushes the latest context and advisor decision here
//! (twice per cycle: before and after execution); the HTTP handlers only
//! read. One RwLock guards everything, and writers hold it briefly.

use std::collections::BTreeMap;

use tokio::sync::RwLock;

use crate::types::{FullDecision, MarketSnapshot, TradeContext};

const MIN_INTERVAL_SECS: u64 = 30;
const MAX_INTERVAL_SECS: u64 = 900;

#[derive(Default)]
struct Inner {
    latest_context: Option<TradeContext>,
    latest_decision: Option<FullDecision>,
    history: Vec<FullDecision>,
    market: BTreeMap<String, MarketSnapshot>,
    loop_interval_secs: u64,
}

pub struct DashboardState {
    inner: RwLock<Inner>,
}

impl DashboardState {
    pub fn new(default_interval_secs: u64) -> Self {
        let interval = if default_interval_secs == 0 {
            150
        } else {
            default_interval_secs
        };
        Self {
            inner: RwLock::new(Inner {
                loop_interval_secs: interval,
                ..Default::default()
            }),
        }
    }

    /// Push the latest cycle state. The same decision pushed twice in one
    /// cycle (pre- and post-execution) is stored in history only once, by
    /// timestamp.
    pub async fn update(
        &self,
        ctx: &TradeContext,
        decision: Option<&FullDecision>,
        market: &BTreeMap<String, MarketSnapshot>,
    ) {
        let mut inner = self.inner.write().await;
        inner.latest_context = Some(ctx.clone());
        inner.market = market.clone();

        if let Some(decision) = decision {
            let duplicate = inner
                .history
                .last()
                .map(|last| last.timestamp == decision.timestamp)
                .unwrap_or(false);
            if duplicate {
                // Replace so the post-execution statuses win.
                *inner.history.last_mut().expect("history nonempty") = decision.clone();
            } else {
                inner.history.push(decision.clone());
            }
            inner.latest_decision = Some(decision.clone());
        }
    }

    pub async fn loop_interval_secs(&self) -> u64 {
        self.inner.read().await.loop_interval_secs
    }

    /// Set the loop interval; values outside [30, 900] are rejected.
    pub async fn set_loop_interval_secs(&self, secs: u64) -> Result<(), String> {
        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&secs) {
            return Err(format!(
                "loop_interval_seconds must be between {MIN_INTERVAL_SECS} and {MAX_INTERVAL_SECS}"
            ));
        }
        self.inner.write().await.loop_interval_secs = secs;
        Ok(())
    }

    pub async fn history(&self) -> Vec<FullDecision> {
        self.inner.read().await.history.clone()
    }

    /// The `/api/state` payload.
    pub async fn state_payload(&self) -> serde_json::Value {
        let inner = self.inner.read().await;
        serde_json::json!({
            "context": inner.latest_context,
            "decision": inner.latest_decision,
            "market_data": inner.market,
            "loop_interval_seconds": inner.loop_interval_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn interval_bounds_are_enforced() {
        let state = DashboardState::new(150);
        assert_eq!(state.loop_interval_secs().await, 150);
        assert!(state.set_loop_interval_secs(29).await.is_err());
        assert!(state.set_loop_interval_secs(901).await.is_err());
        state.set_loop_interval_secs(60).await.unwrap();
        assert_eq!(state.loop_interval_secs().await, 60);
    }

    #[tokio::test]
    async fn repeated_push_of_same_decision_stores_once() {
        let state = DashboardState::new(150);
        let ctx = TradeContext::default();
        let market = BTreeMap::new();

        let mut decision = FullDecision {
            timestamp: Utc::now(),
            ..Default::default()
        };
        state.update(&ctx, Some(&decision), &market).await;
        // Second push carries execution results but the same timestamp.
        decision.cot_trace = "with results".into();
        state.update(&ctx, Some(&decision), &market).await;

        let history = state.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].cot_trace, "with results");
    }

    #[tokio::test]
    async fn distinct_decisions_accumulate() {
        let state = DashboardState::new(150);
        let ctx = TradeContext::default();
        let market = BTreeMap::new();
        for i in 0..3i64 {
            let decision = FullDecision {
                timestamp: Utc::now() + chrono::Duration::seconds(i),
                ..Default::default()
            };
            state.update(&ctx, Some(&decision), &market).await;
        }
        assert_eq!(state.history().await.len(), 3);
    }
}
