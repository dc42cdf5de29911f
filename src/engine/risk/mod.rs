//! Risk engine service: the periodic loop that refreshes PnL, manages risk
//! timers, recovers stuck closes, and offsets ripe losers against winners.

pub mod executor;
pub mod selector;
pub mod timer;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::position::stats;
use super::EngineContext;
use crate::cache::CoordinationCache;
use crate::exchange::ExchangeConnector;
use crate::models::{PositionGroup, User};
use crate::precision::PrecisionRules;

pub struct RiskEngineService {
    ctx: EngineContext,
}

impl RiskEngineService {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.ctx.settings.risk_engine_interval_secs.max(1),
        ));
        info!("risk engine started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_iteration().await {
                        warn!(error = %e, "risk engine iteration failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("risk engine stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One sweep over every user with non-terminal groups.
    pub async fn run_iteration(&self) -> Result<()> {
        let all = self.ctx.db.list_non_terminal_groups().await?;
        let mut user_ids: Vec<Uuid> = all.iter().map(|g| g.user_id).collect();
        user_ids.dedup();

        for user_id in user_ids {
            let Some(user) = self.ctx.db.get_user(user_id).await? else {
                continue;
            };
            if let Err(e) = self.evaluate_user(&user).await {
                warn!(%user_id, error = %e, "risk evaluation failed for user");
            }
        }

        self.ctx
            .cache
            .set_service_health(
                "risk_engine",
                serde_json::json!({"last_run": Utc::now().to_rfc3339()}),
            )
            .await;
        Ok(())
    }

    /// Full risk pass for one user. Also the operator's run-evaluation verb.
    pub async fn evaluate_user(&self, user: &User) -> Result<()> {
        let now = Utc::now();
        let config = &user.risk_config;
        let groups = self.ctx.db.list_groups_for_user(user.id, false).await?;
        if groups.is_empty() {
            return Ok(());
        }

        // One connector and one ticker snapshot per exchange this pass.
        let mut connectors: HashMap<String, Arc<dyn ExchangeConnector>> = HashMap::new();
        let mut tickers: HashMap<String, HashMap<String, f64>> = HashMap::new();
        for exchange in groups
            .iter()
            .map(|g| g.exchange.clone())
            .collect::<HashSet<_>>()
        {
            match self.ctx.connectors.connect(user, &exchange) {
                Ok(connector) => {
                    match connector.get_all_tickers().await {
                        Ok(t) => {
                            tickers.insert(exchange.clone(), t);
                        }
                        Err(e) => {
                            warn!(%exchange, error = %e, "ticker snapshot failed")
                        }
                    }
                    connectors.insert(exchange, connector);
                }
                Err(e) => warn!(%exchange, error = %e, "connector unavailable for risk pass"),
            }
        }

        // Refresh PnL against the snapshot before deciding anything.
        for group in &groups {
            let price = tickers
                .get(&group.exchange)
                .and_then(|t| t.get(&group.symbol))
                .copied();
            stats::recompute_group_stats(&self.ctx.db, group.id, price).await?;
        }
        let groups = self.ctx.db.list_groups_for_user(user.id, false).await?;

        timer::recover_stuck_closing(
            &self.ctx.db,
            &groups,
            self.ctx.settings.closing_timeout_minutes,
            now,
        )
        .await?;
        let skipped = timer::update_risk_timers(&self.ctx.db, &groups, config, now).await?;

        let groups = self.ctx.db.list_groups_for_user(user.id, false).await?;
        let losers = selector::filter_eligible_losers(&groups, config, now, &skipped);
        let Some(loser) = selector::select_deepest_loser(&losers).cloned() else {
            debug!(user_id = %user.id, "no eligible losers this cycle");
            self.close_connectors(connectors).await;
            return Ok(());
        };

        // Offsets execute on the loser's exchange; winners elsewhere cannot
        // share its connector and are left for their own books.
        let winners: Vec<PositionGroup> =
            selector::select_winners(&groups, loser.id, config, now)
                .into_iter()
                .filter(|w| w.exchange == loser.exchange)
                .collect();
        if winners.is_empty() {
            debug!(loser_id = %loser.id, "eligible loser but no winners to offset against");
            self.close_connectors(connectors).await;
            return Ok(());
        }

        let Some(connector) = connectors.get(&loser.exchange).cloned() else {
            self.close_connectors(connectors).await;
            return Ok(());
        };
        let exchange_tickers = tickers.get(&loser.exchange).cloned().unwrap_or_default();

        let loser_price = match self
            .price_for(connector.as_ref(), &exchange_tickers, &loser.symbol)
            .await
        {
            Some(p) => p,
            None => {
                warn!(loser_id = %loser.id, "no price for loser symbol, skipping cycle");
                self.close_connectors(connectors).await;
                return Ok(());
            }
        };
        let loser_rules = self
            .ctx
            .precision
            .get_precision_for_symbol(connector.as_ref(), &loser.exchange, &loser.symbol)
            .await?;

        let mut winner_inputs: Vec<(PositionGroup, f64, PrecisionRules)> = Vec::new();
        for winner in winners {
            let Some(price) = self
                .price_for(connector.as_ref(), &exchange_tickers, &winner.symbol)
                .await
            else {
                continue;
            };
            let rules = self
                .ctx
                .precision
                .get_precision_for_symbol(connector.as_ref(), &winner.exchange, &winner.symbol)
                .await?;
            winner_inputs.push((winner, price, rules));
        }

        let Some(plan) =
            executor::build_offset_plan(&loser, loser_price, &loser_rules, &winner_inputs, config)
        else {
            debug!(loser_id = %loser.id, "no viable offset plan");
            self.close_connectors(connectors).await;
            return Ok(());
        };

        info!(
            loser_id = %loser.id,
            loss_pct = loser.unrealized_pnl_percent,
            winners = plan.winner_closes.len(),
            full_close = plan.full_close,
            "executing offset"
        );
        if let Err(e) =
            executor::execute_offset(&self.ctx, connector.as_ref(), &loser, loser_price, &plan)
                .await
        {
            warn!(loser_id = %loser.id, error = %e, "offset execution failed, retrying next cycle");
        }

        self.close_connectors(connectors).await;
        Ok(())
    }

    async fn price_for(
        &self,
        connector: &dyn ExchangeConnector,
        tickers: &HashMap<String, f64>,
        symbol: &str,
    ) -> Option<f64> {
        if let Some(price) = tickers.get(symbol).copied().filter(|p| *p > 0.0) {
            return Some(price);
        }
        connector.get_current_price(symbol).await.ok()
    }

    async fn close_connectors(&self, connectors: HashMap<String, Arc<dyn ExchangeConnector>>) {
        for (_, connector) in connectors {
            connector.close().await;
        }
    }
}
