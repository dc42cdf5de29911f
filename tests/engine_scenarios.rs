//! End-to-end engine scenarios over the mock exchange and a temp database:
//! grid entry with per-leg TPs, slot exhaustion and promotion, pyramid
//! continuation, exit handling, the winner/loser offset, and webhook locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use uuid::Uuid;

use dcabot_backend::cache::{CoordinationCache, MemoryCache};
use dcabot_backend::engine::fill_monitor::OrderFillMonitor;
use dcabot_backend::engine::queue::QueuePromoter;
use dcabot_backend::engine::risk::RiskEngineService;
use dcabot_backend::engine::router::{RouteError, RouteOutcome, SignalRouter};
use dcabot_backend::engine::{EngineContext, EngineSettings};
use dcabot_backend::exchange::mock::{MockConnector, MockConnectorFactory};
use dcabot_backend::models::{
    DcaConfiguration, DcaGridConfig, DcaLevel, DcaOrder, ExecutionIntent, GroupStatus,
    OrderSide, OrderStatus, OrderType, PositionGroup, Pyramid, PyramidStatus, QueueStatus,
    QueuedSignal, RiskActionType, RiskEngineConfig, RiskInfo, StrategyInfo,
    TimerStartCondition, TpMode, TradingViewData, User, WebhookPayload,
};
use dcabot_backend::precision::{PrecisionCache, PrecisionCacheConfig, PrecisionRules};
use dcabot_backend::store::EngineDb;

struct Harness {
    ctx: EngineContext,
    factory: Arc<MockConnectorFactory>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = EngineDb::new(dir.path().join("engine.db").to_str().unwrap()).expect("open db");
    let factory = Arc::new(MockConnectorFactory::new());
    let ctx = EngineContext {
        db,
        cache: Arc::new(MemoryCache::new()),
        connectors: factory.clone(),
        precision: Arc::new(PrecisionCache::new(PrecisionCacheConfig::default())),
        settings: EngineSettings::default(),
    };
    Harness {
        ctx,
        factory,
        _dir: dir,
    }
}

fn rules() -> PrecisionRules {
    PrecisionRules {
        tick_size: 0.01,
        step_size: 0.001,
        min_qty: 0.001,
        min_notional: 10.0,
    }
}

async fn create_user(ctx: &EngineContext, risk_config: RiskEngineConfig) -> User {
    let user = User {
        id: Uuid::new_v4(),
        username: format!("trader-{}", Uuid::new_v4().simple()),
        email: format!("{}@example.com", Uuid::new_v4().simple()),
        password_hash: "hash".to_string(),
        is_active: true,
        webhook_secret: Some("whsec".to_string()),
        secure_signals: false,
        exchange_credentials: HashMap::new(),
        risk_config,
        created_at: Utc::now(),
    };
    ctx.db.create_user(&user).await.unwrap();
    user
}

fn reference_levels() -> Vec<DcaLevel> {
    vec![
        DcaLevel { gap_percent: 0.0, weight_percent: 20.0, tp_percent: 1.0 },
        DcaLevel { gap_percent: -0.5, weight_percent: 20.0, tp_percent: 0.5 },
        DcaLevel { gap_percent: -1.0, weight_percent: 20.0, tp_percent: 0.5 },
        DcaLevel { gap_percent: -2.0, weight_percent: 40.0, tp_percent: 0.5 },
    ]
}

async fn save_dca_config(
    ctx: &EngineContext,
    user: &User,
    pair: &str,
    levels: Vec<DcaLevel>,
    capital: f64,
) {
    let now = Utc::now();
    let config = DcaConfiguration {
        id: Uuid::new_v4(),
        user_id: user.id,
        pair: pair.to_string(),
        timeframe: 60,
        exchange: "binance".to_string(),
        grid: DcaGridConfig {
            levels,
            tp_mode: TpMode::PerLeg,
            tp_aggregate_percent: 1.0,
            max_pyramids: 5,
            pyramid_level_overrides: HashMap::new(),
            base_capital_usd: capital,
            pyramid_capital_overrides: HashMap::new(),
        },
        created_at: now,
        updated_at: now,
    };
    ctx.db.upsert_dca_config(&config).await.unwrap();
}

fn listed_symbol(mock: &MockConnector, symbol: &str, price: f64) {
    mock.set_precision(symbol, rules());
    mock.set_price(symbol, price);
}

fn buy_payload(user_id: Uuid, symbol: &str, entry_price: f64) -> WebhookPayload {
    WebhookPayload {
        user_id,
        secret: "whsec".to_string(),
        source: "tradingview".to_string(),
        timestamp: Utc::now(),
        tv: TradingViewData {
            exchange: "binance".to_string(),
            symbol: symbol.to_string(),
            timeframe: 60,
            action: "buy".to_string(),
            market_position: "long".to_string(),
            market_position_size: 1.0,
            prev_market_position: "flat".to_string(),
            prev_market_position_size: 0.0,
            entry_price,
            close_price: entry_price,
            order_size: 1.0,
        },
        strategy_info: StrategyInfo {
            trade_id: Uuid::new_v4().to_string(),
            alert_name: "entry".to_string(),
            alert_message: String::new(),
        },
        execution_intent: ExecutionIntent {
            intent_type: "signal".to_string(),
            side: "buy".to_string(),
        },
        risk: RiskInfo {
            stop_loss: None,
            take_profit: None,
            max_slippage_percent: 0.5,
        },
    }
}

fn exit_payload(user_id: Uuid, symbol: &str, price: f64) -> WebhookPayload {
    let mut payload = buy_payload(user_id, symbol, price);
    payload.tv.action = "sell".to_string();
    payload.execution_intent.intent_type = "exit".to_string();
    payload.execution_intent.side = "sell".to_string();
    payload
}

/// Scenario 1: fresh entry, 4 legs, per-leg TP, reference numbers.
#[tokio::test]
async fn test_fresh_entry_four_legs_per_leg_tp() {
    let h = harness();
    let user = create_user(&h.ctx, RiskEngineConfig::default()).await;
    save_dca_config(&h.ctx, &user, "BTCUSDT", reference_levels(), 1_000.0).await;

    let mock = h.factory.connector("binance");
    listed_symbol(&mock, "BTCUSDT", 50_000.0);
    mock.set_free_balance("USDT", 10_000.0);

    let router = SignalRouter::new(h.ctx.clone());
    let outcome = router
        .route(user.id, &buy_payload(user.id, "BTCUSDT", 50_000.0))
        .await
        .unwrap();
    let group_id = match outcome {
        RouteOutcome::Created {
            group_id,
            accepted_legs,
            failed_legs,
        } => {
            assert_eq!(accepted_legs, 4);
            assert_eq!(failed_legs, 0);
            group_id
        }
        other => panic!("expected Created, got {other:?}"),
    };

    // Planned legs at the expected prices and quantities.
    let placed = mock.placed_orders();
    assert_eq!(placed.len(), 4);
    let expected = [
        (50_000.00, 0.004),
        (49_750.00, 0.004),
        (49_500.00, 0.004),
        (49_000.00, 0.008),
    ];
    for (order, (price, qty)) in placed.iter().zip(expected) {
        assert_eq!(order.request.side, OrderSide::Buy);
        assert!(
            (order.request.price.unwrap() - price).abs() < 1e-6,
            "leg price {} != {price}",
            order.request.price.unwrap()
        );
        assert!((order.request.quantity - qty).abs() < 1e-9);
    }

    let group = h.ctx.db.get_group(group_id).await.unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Live);
    assert_eq!(group.total_dca_legs, 4);

    // Fill every leg, then let the monitor reconcile.
    for (order, (price, qty)) in placed.iter().zip(expected) {
        mock.fill_order(&order.order.order_id, qty, price);
    }
    let monitor = OrderFillMonitor::new(h.ctx.clone());
    monitor.run_iteration(1).await.unwrap();

    let group = h.ctx.db.get_group(group_id).await.unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Active);
    assert_eq!(group.filled_dca_legs, 4);
    assert!((group.total_filled_quantity - 0.020).abs() < 1e-9);
    assert!(
        (group.weighted_avg_entry - 49_583.3333).abs() < 0.01,
        "weighted avg {}",
        group.weighted_avg_entry
    );

    // Per-leg TPs at the reference prices.
    let all_orders = mock.placed_orders();
    let tps: Vec<_> = all_orders
        .iter()
        .filter(|o| o.request.side == OrderSide::Sell)
        .collect();
    assert_eq!(tps.len(), 4);
    for (tp, price) in tps.iter().zip([50_500.00, 49_998.75, 49_747.50, 49_245.00]) {
        assert!(
            (tp.request.price.unwrap() - price).abs() < 1e-6,
            "tp price {} != {price}",
            tp.request.price.unwrap()
        );
    }

    // Heartbeat published after the iteration.
    assert!(h
        .ctx
        .cache
        .get_service_health("order_fill_monitor")
        .await
        .is_some());
}

/// Scenario 2: slot exhaustion enqueues, and closing a group promotes.
#[tokio::test]
async fn test_slot_exhaustion_and_promotion() {
    let h = harness();
    let user = create_user(
        &h.ctx,
        RiskEngineConfig {
            max_open_positions_global: 2,
            ..Default::default()
        },
    )
    .await;
    for pair in ["BTCUSDT", "ETHUSDT", "SOLUSDT"] {
        save_dca_config(&h.ctx, &user, pair, reference_levels(), 1_000.0).await;
    }

    let mock = h.factory.connector("binance");
    listed_symbol(&mock, "BTCUSDT", 50_000.0);
    listed_symbol(&mock, "ETHUSDT", 3_000.0);
    listed_symbol(&mock, "SOLUSDT", 150.0);
    mock.set_free_balance("USDT", 100_000.0);

    let router = SignalRouter::new(h.ctx.clone());
    for (symbol, price) in [("BTCUSDT", 50_000.0), ("ETHUSDT", 3_000.0)] {
        let outcome = router
            .route(user.id, &buy_payload(user.id, symbol, price))
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::Created { .. }));
    }

    // Third admission: pool is full, the signal queues at the base tier.
    let outcome = router
        .route(user.id, &buy_payload(user.id, "SOLUSDT", 150.0))
        .await
        .unwrap();
    let signal_id = match outcome {
        RouteOutcome::Enqueued {
            signal_id,
            priority_score,
            replacement_count,
        } => {
            assert_eq!(replacement_count, 0);
            assert!(
                (priority_score - 10_000.0).abs() < 10.0,
                "base-tier score, got {priority_score}"
            );
            signal_id
        }
        other => panic!("expected Enqueued, got {other:?}"),
    };
    assert_eq!(h.ctx.db.count_pool_groups(user.id).await.unwrap(), 2);

    // Close one group; the promoter fills the freed slot.
    let outcome = router
        .route(user.id, &exit_payload(user.id, "BTCUSDT", 50_000.0))
        .await
        .unwrap();
    assert!(matches!(outcome, RouteOutcome::ExitExecuted { .. }));

    let promoter = QueuePromoter::new(h.ctx.clone());
    promoter.run_iteration().await.unwrap();

    let signal = h.ctx.db.get_queued_signal(signal_id).await.unwrap().unwrap();
    assert_eq!(signal.status, QueueStatus::Promoted);
    assert!(signal.promoted_at.is_some());
    let sol = h
        .ctx
        .db
        .find_active_group(user.id, "SOLUSDT", 60, "binance", OrderSide::Buy)
        .await
        .unwrap();
    assert!(sol.is_some());
}

/// Scenario 3: same-pair signal becomes a pyramid continuation, no new slot.
#[tokio::test]
async fn test_pyramid_continuation() {
    let h = harness();
    let user = create_user(&h.ctx, RiskEngineConfig::default()).await;
    save_dca_config(&h.ctx, &user, "BTCUSDT", reference_levels(), 1_000.0).await;

    let mock = h.factory.connector("binance");
    listed_symbol(&mock, "BTCUSDT", 50_000.0);
    mock.set_free_balance("USDT", 100_000.0);

    let router = SignalRouter::new(h.ctx.clone());
    let outcome = router
        .route(user.id, &buy_payload(user.id, "BTCUSDT", 50_000.0))
        .await
        .unwrap();
    let group_id = match outcome {
        RouteOutcome::Created { group_id, .. } => group_id,
        other => panic!("expected Created, got {other:?}"),
    };
    assert_eq!(h.ctx.db.count_pool_groups(user.id).await.unwrap(), 1);

    let outcome = router
        .route(user.id, &buy_payload(user.id, "BTCUSDT", 49_000.0))
        .await
        .unwrap();
    match outcome {
        RouteOutcome::PyramidAdded {
            group_id: continued,
            ..
        } => assert_eq!(continued, group_id),
        other => panic!("expected PyramidAdded, got {other:?}"),
    }

    let group = h.ctx.db.get_group(group_id).await.unwrap().unwrap();
    assert_eq!(group.pyramid_count, 2);
    assert_eq!(group.total_dca_legs, 8);
    let pyramids = h.ctx.db.list_pyramids(group_id).await.unwrap();
    assert_eq!(pyramids.len(), 2);
    assert!((pyramids[1].entry_price - 49_000.0).abs() < 1e-9);

    // Continuations never consume another slot.
    assert_eq!(h.ctx.db.count_pool_groups(user.id).await.unwrap(), 1);
}

/// Scenario 4: exit cancels entries + TPs, market-sells, and closes.
#[tokio::test]
async fn test_exit_signal_full_close() {
    let h = harness();
    let user = create_user(&h.ctx, RiskEngineConfig::default()).await;
    save_dca_config(&h.ctx, &user, "BTCUSDT", reference_levels(), 1_000.0).await;

    let mock = h.factory.connector("binance");
    listed_symbol(&mock, "BTCUSDT", 50_000.0);
    mock.set_free_balance("USDT", 100_000.0);

    let router = SignalRouter::new(h.ctx.clone());
    let outcome = router
        .route(user.id, &buy_payload(user.id, "BTCUSDT", 50_000.0))
        .await
        .unwrap();
    let group_id = match outcome {
        RouteOutcome::Created { group_id, .. } => group_id,
        other => panic!("expected Created, got {other:?}"),
    };

    // Fill every entry and let the monitor place the TPs.
    let placed = mock.placed_orders();
    for order in &placed {
        mock.fill_order(
            &order.order.order_id,
            order.request.quantity,
            order.request.price.unwrap(),
        );
    }
    OrderFillMonitor::new(h.ctx.clone())
        .run_iteration(1)
        .await
        .unwrap();

    // A queued entry for the same pair should die with the exit.
    let queued = QueuedSignal {
        id: Uuid::new_v4(),
        user_id: user.id,
        exchange: "binance".to_string(),
        symbol: "BTCUSDT".to_string(),
        timeframe: 60,
        side: OrderSide::Buy,
        entry_price: 48_000.0,
        signal_payload: serde_json::json!({}),
        queued_at: Utc::now(),
        replacement_count: 0,
        priority_score: 10_000.0,
        is_pyramid_continuation: false,
        current_loss_percent: None,
        priority_explanation: None,
        status: QueueStatus::Queued,
        promoted_at: None,
        rejection_reason: None,
    };
    h.ctx.db.enqueue_signal(&queued).await.unwrap();

    mock.set_price("BTCUSDT", 49_800.0);
    let outcome = router
        .route(user.id, &exit_payload(user.id, "BTCUSDT", 49_800.0))
        .await
        .unwrap();
    match outcome {
        RouteOutcome::ExitExecuted { group_id: id, status } => {
            assert_eq!(id, group_id);
            assert_eq!(status, "closed");
        }
        other => panic!("expected ExitExecuted, got {other:?}"),
    }

    let group = h.ctx.db.get_group(group_id).await.unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Closed);
    assert!(group.closed_at.is_some());
    assert!(group.total_filled_quantity.abs() < 1e-9);

    // The synthetic exit row carries the market sell.
    let orders = h.ctx.db.get_orders_for_group(group_id).await.unwrap();
    let synthetic: Vec<_> = orders.iter().filter(|o| o.leg_index == 999).collect();
    assert_eq!(synthetic.len(), 1);
    assert_eq!(synthetic[0].side, OrderSide::Sell);
    assert_eq!(synthetic[0].status, OrderStatus::Filled);
    assert!((synthetic[0].filled_quantity - 0.020).abs() < 1e-9);

    let signal = h.ctx.db.get_queued_signal(queued.id).await.unwrap().unwrap();
    assert_eq!(signal.status, QueueStatus::Cancelled);
}

async fn seeded_group(
    ctx: &EngineContext,
    user: &User,
    symbol: &str,
    quantity: f64,
    entry_price: f64,
) -> PositionGroup {
    let now = Utc::now();
    let group = PositionGroup {
        id: Uuid::new_v4(),
        user_id: user.id,
        exchange: "binance".to_string(),
        symbol: symbol.to_string(),
        timeframe: 60,
        side: OrderSide::Buy,
        status: GroupStatus::Active,
        pyramid_count: 1,
        max_pyramids: 5,
        total_dca_legs: 1,
        filled_dca_legs: 1,
        base_entry_price: entry_price,
        weighted_avg_entry: entry_price,
        total_invested_usd: quantity * entry_price,
        total_filled_quantity: quantity,
        unrealized_pnl_usd: 0.0,
        unrealized_pnl_percent: 0.0,
        realized_pnl_usd: 0.0,
        total_entry_fees_usd: 0.0,
        total_exit_fees_usd: 0.0,
        total_hedged_qty: 0.0,
        total_hedged_value_usd: 0.0,
        tp_mode: TpMode::PerLeg,
        tp_aggregate_percent: 0.0,
        aggregate_tp_order_id: None,
        risk_timer_start: None,
        risk_timer_expires: None,
        risk_eligible: false,
        risk_blocked: false,
        risk_skip_once: false,
        created_at: now - Duration::hours(6),
        updated_at: now,
        closing_started_at: None,
        closed_at: None,
    };
    let pyramid = Pyramid {
        id: Uuid::new_v4(),
        group_id: group.id,
        pyramid_index: 0,
        entry_price,
        status: PyramidStatus::Filled,
        dca_config: Vec::new(),
        closed_at: None,
        exit_price: None,
        realized_pnl_usd: None,
        total_quantity: None,
        created_at: now - Duration::hours(6),
    };
    let order = DcaOrder {
        id: Uuid::new_v4(),
        group_id: group.id,
        pyramid_id: pyramid.id,
        leg_index: 0,
        side: OrderSide::Buy,
        order_type: OrderType::Limit,
        price: entry_price,
        quantity,
        quote_amount: None,
        status: OrderStatus::Filled,
        filled_quantity: quantity,
        avg_fill_price: entry_price,
        fee: 0.0,
        fee_currency: None,
        tp_percent: None,
        tp_price: None,
        tp_order_id: None,
        tp_hit: false,
        tp_executed_at: None,
        exchange_order_id: Some(format!("seed-{}", Uuid::new_v4().simple())),
        submitted_at: Some(now - Duration::hours(6)),
        filled_at: Some(now - Duration::hours(6)),
        cancelled_at: None,
        created_at: now - Duration::hours(6),
    };
    ctx.db
        .admit_group(&group, &pyramid, &[order], None)
        .await
        .unwrap();
    group
}

/// Scenario 5: loser −50 USD, winners +30/+15/+10; full close + 4 actions.
#[tokio::test]
async fn test_risk_offset_full_close() {
    let h = harness();
    let user = create_user(
        &h.ctx,
        RiskEngineConfig {
            loss_threshold_percent: -5.0,
            post_full_wait_minutes: 0,
            require_full_pyramids: false,
            partial_close_enabled: true,
            min_close_notional: 10.0,
            max_winners_to_combine: 3,
            timer_start_condition: TimerStartCondition::AfterAllDcaFilled,
            ..Default::default()
        },
    )
    .await;

    let mock = h.factory.connector("binance");
    // Loser: 0.02 BTC at 50000 entry, marked at 47500 → −50 USD (−5%).
    listed_symbol(&mock, "BTCUSDT", 47_500.0);
    // Winners at +30 / +15 / +10 USD over a 0.02 position.
    listed_symbol(&mock, "ETHUSDT", 51_500.0);
    listed_symbol(&mock, "SOLUSDT", 50_750.0);
    listed_symbol(&mock, "ADAUSDT", 50_500.0);

    let loser = seeded_group(&h.ctx, &user, "BTCUSDT", 0.02, 50_000.0).await;
    let winner_eth = seeded_group(&h.ctx, &user, "ETHUSDT", 0.02, 50_000.0).await;
    let winner_sol = seeded_group(&h.ctx, &user, "SOLUSDT", 0.02, 50_000.0).await;
    let winner_ada = seeded_group(&h.ctx, &user, "ADAUSDT", 0.02, 50_000.0).await;

    RiskEngineService::new(h.ctx.clone())
        .evaluate_user(&user)
        .await
        .unwrap();

    // Loser fully closed (55 >= 50).
    let loser_after = h.ctx.db.get_group(loser.id).await.unwrap().unwrap();
    assert_eq!(loser_after.status, GroupStatus::Closed);
    assert!(loser_after.total_filled_quantity.abs() < 1e-9);

    // One full_close for the loser, one hedge_close per winner.
    let actions = h.ctx.db.list_risk_actions(None, 50).await.unwrap();
    let full_closes: Vec<_> = actions
        .iter()
        .filter(|a| a.action_type == RiskActionType::FullClose)
        .collect();
    let hedge_closes: Vec<_> = actions
        .iter()
        .filter(|a| a.action_type == RiskActionType::HedgeClose)
        .collect();
    assert_eq!(full_closes.len(), 1);
    assert_eq!(hedge_closes.len(), 3);
    assert_eq!(full_closes[0].loser_group_id, Some(loser.id));
    assert_eq!(full_closes[0].winner_group_ids.len(), 3);

    // Winners realize 50/55 of their positions, step-rounded to 0.018, and
    // the hedge tracking columns reflect it.
    for winner in [&winner_eth, &winner_sol, &winner_ada] {
        let after = h.ctx.db.get_group(winner.id).await.unwrap().unwrap();
        assert!(
            (after.total_hedged_qty - 0.018).abs() < 1e-9,
            "hedged qty {} on {}",
            after.total_hedged_qty,
            after.symbol
        );
        assert!(after.total_hedged_value_usd > 0.0);
    }
}

/// Scenario 6: concurrent webhooks for the same pair — second sees 409.
#[tokio::test]
async fn test_webhook_lock_contention() {
    let h = harness();
    let user = create_user(&h.ctx, RiskEngineConfig::default()).await;
    save_dca_config(&h.ctx, &user, "BTCUSDT", reference_levels(), 1_000.0).await;

    let mock = h.factory.connector("binance");
    listed_symbol(&mock, "BTCUSDT", 50_000.0);
    mock.set_free_balance("USDT", 10_000.0);

    // First delivery holds the lock.
    let lock_name = format!("webhook:{}:BTCUSDT:60:long", user.id);
    assert!(
        h.ctx
            .cache
            .acquire_lock(&lock_name, "first-delivery", StdDuration::from_secs(30))
            .await
    );

    let router = SignalRouter::new(h.ctx.clone());
    let err = router
        .route(user.id, &buy_payload(user.id, "BTCUSDT", 50_000.0))
        .await
        .unwrap_err();
    assert!(matches!(err, RouteError::LockContention));
    assert_eq!(err.status_code(), 409);

    // Once released, the same delivery goes through.
    assert!(h.ctx.cache.release_lock(&lock_name, "first-delivery").await);
    let outcome = router
        .route(user.id, &buy_payload(user.id, "BTCUSDT", 50_000.0))
        .await
        .unwrap();
    assert!(matches!(outcome, RouteOutcome::Created { .. }));
}

/// Boundary: a min-notional violation rejects the plan with no rows created.
#[tokio::test]
async fn test_min_notional_violation_creates_no_rows() {
    let h = harness();
    let user = create_user(&h.ctx, RiskEngineConfig::default()).await;
    // 20% of $30 is $6 per small leg — below the $10 minimum notional.
    save_dca_config(&h.ctx, &user, "BTCUSDT", reference_levels(), 30.0).await;

    let mock = h.factory.connector("binance");
    listed_symbol(&mock, "BTCUSDT", 50_000.0);
    mock.set_free_balance("USDT", 10_000.0);

    let router = SignalRouter::new(h.ctx.clone());
    let err = router
        .route(user.id, &buy_payload(user.id, "BTCUSDT", 50_000.0))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    assert!(h
        .ctx
        .db
        .find_active_group(user.id, "BTCUSDT", 60, "binance", OrderSide::Buy)
        .await
        .unwrap()
        .is_none());
    assert!(mock.placed_orders().is_empty());
}

/// Boundary: short signals are rejected at admission.
#[tokio::test]
async fn test_short_signal_rejected() {
    let h = harness();
    let user = create_user(&h.ctx, RiskEngineConfig::default()).await;

    let mut payload = buy_payload(user.id, "BTCUSDT", 50_000.0);
    payload.tv.action = "sell".to_string();
    payload.execution_intent.intent_type = "signal".to_string();

    let router = SignalRouter::new(h.ctx.clone());
    let err = router.route(user.id, &payload).await.unwrap_err();
    assert!(matches!(err, RouteError::ShortNotSupported));
    assert_eq!(err.status_code(), 400);
}

/// Boundary: a group stuck in CLOSING is recovered to ACTIVE.
#[tokio::test]
async fn test_stuck_closing_recovery() {
    let h = harness();
    let user = create_user(
        &h.ctx,
        RiskEngineConfig {
            require_full_pyramids: false,
            ..Default::default()
        },
    )
    .await;
    let mock = h.factory.connector("binance");
    listed_symbol(&mock, "BTCUSDT", 50_000.0);

    let group = seeded_group(&h.ctx, &user, "BTCUSDT", 0.02, 50_000.0).await;
    let stale = Utc::now() - Duration::minutes(45);
    h.ctx
        .db
        .mutate_group(group.id, move |g, _| {
            g.status = GroupStatus::Closing;
            g.closing_started_at = Some(stale);
        })
        .await
        .unwrap();

    RiskEngineService::new(h.ctx.clone())
        .evaluate_user(&user)
        .await
        .unwrap();

    let recovered = h.ctx.db.get_group(group.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, GroupStatus::Active);
    assert!(recovered.closing_started_at.is_none());
}
