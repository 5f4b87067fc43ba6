//! Rebalance scheduling and the cycle pipeline.
//!
//! The scheduler polls on a short tick and starts a cycle once the rebalance
//! interval has elapsed since the last successful one. A cycle runs:
//!
//! 1. refresh instrument metadata when stale
//! 2. fetch candles for the universe concurrently and score each instrument
//! 3. select the target book (reversed inside the configured window)
//! 4. cancel resting orders
//! 5. fetch every live position
//! 6. reconcile and execute
//!
//! Per-instrument failures skip that instrument; a failure in steps 4-5 aborts
//! only the current cycle and the next tick tries again.

use super::executor::{ExecutionReport, OrderExecutor};
use super::factor::{FactorEngine, MomentumScore};
use super::reconciler::{PositionBook, PositionReconciler, Reconciliation};
use super::selector::{Selector, TargetState};
use crate::config::Config;
use crate::exchange::{
    retry_read, CandleSeries, ExecutionGateway, GatewayError, Instrument, InstrumentSpec,
    MarketDataGate, PositionFilter, RetryPolicy,
};
use crate::persistence::CycleJournal;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument as _};

/// Cooperative shutdown flag shared between the signal handler and the scheduler.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as `self`, so this cannot fail while we wait
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }

    /// Sleep for `duration`; returns true if shutdown was requested first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_triggered(),
            _ = self.wait() => true,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipeline state for one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleContext {
    pub scores: BTreeMap<Instrument, MomentumScore>,
    /// Instruments left out of ranking, with the reason
    pub skipped: Vec<(Instrument, String)>,
    pub target: TargetState,
    pub live: PositionBook,
    pub reconciliation: Reconciliation,
    pub cancelled_orders: usize,
    pub execution: ExecutionReport,
}

/// Outcome of one cycle, logged and journaled.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub number: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reversed: bool,
    pub dry_run: bool,
    /// Shutdown stopped the cycle before it finished
    pub interrupted: bool,
    /// Set when the cycle aborted
    pub error: Option<String>,
    pub context: CycleContext,
}

impl CycleReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.interrupted
    }

    pub fn scored(&self) -> usize {
        self.context.scores.len()
    }

    pub fn skipped(&self) -> usize {
        self.context.skipped.len() + self.context.execution.skipped()
    }

    pub fn opened(&self) -> usize {
        self.context.execution.opened()
    }

    pub fn closed(&self) -> usize {
        self.context.execution.closed()
    }

    pub fn kept(&self) -> usize {
        self.context.reconciliation.kept.len()
    }

    pub fn failed(&self) -> usize {
        self.context.execution.failed()
    }
}

/// What a cycle is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleMode {
    Rebalance,
    /// Score, select and reconcile only
    Plan,
    /// Close every live position without scoring
    Flatten { dry_run: bool },
}

impl CycleMode {
    fn is_dry_run(self) -> bool {
        matches!(self, CycleMode::Plan | CycleMode::Flatten { dry_run: true })
    }
}

/// Drives rebalance cycles against a market-data source and an execution venue.
pub struct RebalanceScheduler<M: ?Sized, E: ?Sized> {
    config: Config,
    market: Arc<M>,
    gateway: Arc<E>,
    factor: FactorEngine,
    selector: Selector,
    reconciler: PositionReconciler,
    executor: OrderExecutor,
    retry: RetryPolicy,
    /// Configured universe restricted to listed instruments
    universe: Vec<Instrument>,
    specs: HashMap<Instrument, InstrumentSpec>,
    specs_loaded_at: DateTime<Utc>,
    journal: Option<CycleJournal>,
    last_success: Option<DateTime<Utc>>,
    reversed_last: Option<bool>,
    cycle_count: u64,
}

impl<M, E> RebalanceScheduler<M, E>
where
    M: MarketDataGate + ?Sized,
    E: ExecutionGateway + ?Sized,
{
    /// Load instrument metadata and restore the last successful cycle time.
    ///
    /// Fails when metadata cannot be loaded or no configured instrument is listed.
    pub async fn new(
        config: Config,
        market: Arc<M>,
        gateway: Arc<E>,
        journal: Option<CycleJournal>,
    ) -> Result<Self> {
        let strategy = &config.strategy;
        let factor = FactorEngine::new(strategy.scoring, strategy.max_bar_move);
        let selector = Selector::new(
            strategy.long_n,
            strategy.short_n,
            strategy.target_notional_per_leg,
        );
        let executor = OrderExecutor::new(&config.execution);
        let retry = config.execution.retry_policy();

        let last_success = match &journal {
            Some(journal) => journal.last_success().unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read last successful cycle from journal");
                None
            }),
            None => None,
        };

        let mut scheduler = Self {
            config,
            market,
            gateway,
            factor,
            selector,
            reconciler: PositionReconciler::new(),
            executor,
            retry,
            universe: Vec::new(),
            specs: HashMap::new(),
            specs_loaded_at: Utc::now(),
            journal,
            last_success,
            reversed_last: None,
            cycle_count: 0,
        };

        scheduler
            .load_instruments()
            .await
            .context("Failed to load instrument metadata")?;

        anyhow::ensure!(
            !scheduler.universe.is_empty(),
            "None of the configured instruments are listed on the exchange"
        );

        if let Some(last) = scheduler.last_success {
            info!(last_success = %last, "Restored last successful cycle time");
        }

        Ok(scheduler)
    }

    pub fn universe(&self) -> &[Instrument] {
        &self.universe
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    /// Whether a cycle should start at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_success {
            None => true,
            Some(last) => now - last >= self.interval(),
        }
    }

    fn interval(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.schedule.rebalance_interval())
            .unwrap_or_else(|_| ChronoDuration::hours(4))
    }

    /// Tick loop until shutdown.
    pub async fn run(&mut self, shutdown: &ShutdownSignal) {
        let tick = self.config.schedule.tick();
        info!(
            interval_secs = self.config.schedule.rebalance_interval_secs,
            tick_secs = self.config.schedule.tick_secs,
            universe = self.universe.len(),
            "Scheduler started"
        );

        loop {
            if shutdown.is_triggered() {
                break;
            }

            if self.is_due(Utc::now()) {
                self.run_cycle(shutdown).await;
            }

            if shutdown.sleep(tick).await {
                break;
            }
        }

        info!("Scheduler stopped");
    }

    /// Run one full cycle, record it, and update the success time.
    pub async fn run_cycle(&mut self, shutdown: &ShutdownSignal) -> CycleReport {
        self.cycle(shutdown, CycleMode::Rebalance).await
    }

    /// Score, select and reconcile without cancelling or placing orders.
    pub async fn plan(&mut self) -> CycleReport {
        self.cycle(&ShutdownSignal::new(), CycleMode::Plan).await
    }

    /// Cancel resting orders and close every live position, in or out of the universe.
    ///
    /// With `dry_run` only the close list is built. Not journaled and never
    /// counted as a successful rebalance.
    pub async fn close_all(&mut self, shutdown: &ShutdownSignal, dry_run: bool) -> CycleReport {
        self.cycle(shutdown, CycleMode::Flatten { dry_run }).await
    }

    async fn cycle(&mut self, shutdown: &ShutdownSignal, mode: CycleMode) -> CycleReport {
        let dry_run = mode.is_dry_run();
        self.cycle_count += 1;
        let number = self.cycle_count;
        let span = info_span!("cycle", n = number);

        async move {
            let started_at = Utc::now();
            let reversed = self.reversed_at(started_at);
            info!(reversed, ?mode, "Cycle started");

            let mut context = CycleContext::default();
            let result = self
                .execute_cycle(&mut context, reversed, shutdown, mode)
                .await;

            let mut report = CycleReport {
                number,
                started_at,
                finished_at: Utc::now(),
                reversed,
                dry_run,
                interrupted: false,
                error: None,
                context,
            };

            match result {
                Ok(completed) => {
                    report.interrupted = !completed;
                    if report.succeeded() && mode == CycleMode::Rebalance {
                        self.last_success = Some(report.finished_at);
                    }
                }
                Err(e) => {
                    error!(error = %format!("{:#}", e), "Cycle aborted");
                    report.error = Some(format!("{:#}", e));
                }
            }

            info!(
                scored = report.scored(),
                skipped = report.skipped(),
                opened = report.opened(),
                closed = report.closed(),
                kept = report.kept(),
                failed = report.failed(),
                cancelled = report.context.cancelled_orders,
                interrupted = report.interrupted,
                "Cycle finished"
            );

            if mode == CycleMode::Rebalance {
                if let Some(journal) = &self.journal {
                    if let Err(e) = journal.record(&report) {
                        warn!(error = %e, "Failed to write cycle journal");
                    }
                }
            }

            report
        }
        .instrument(span)
        .await
    }

    /// Returns Ok(false) if shutdown stopped the cycle early.
    async fn execute_cycle(
        &mut self,
        context: &mut CycleContext,
        reversed: bool,
        shutdown: &ShutdownSignal,
        mode: CycleMode,
    ) -> Result<bool> {
        let dry_run = mode.is_dry_run();

        if matches!(mode, CycleMode::Flatten { .. }) {
            warn!("Closing all positions");
            context.target = TargetState::default();
        } else {
            self.refresh_instruments_if_stale().await;
            self.score_universe(context).await;
            context.target = self.selector.select(&context.scores, reversed);
        }

        if shutdown.is_triggered() {
            warn!("Shutdown requested before order phase");
            return Ok(false);
        }

        if !dry_run {
            context.cancelled_orders = self.cancel_open_orders().await?;
        }

        let filter = PositionFilter::All;
        let positions = retry_read("positions", &self.retry, || {
            self.gateway.fetch_positions(&filter)
        })
        .await
        .context("Failed to fetch positions")?;
        context.live = PositionBook::from_positions(positions);

        context.reconciliation = self.reconciler.reconcile(&context.target, &context.live);

        for action in &context.reconciliation.actions {
            info!(%action, "Planned");
        }
        for instrument in &context.reconciliation.kept {
            debug!(%instrument, "Position kept");
        }

        if dry_run {
            return Ok(true);
        }

        context.execution = self
            .executor
            .execute(
                self.market.as_ref(),
                self.gateway.as_ref(),
                &self.specs,
                &context.reconciliation.actions,
                shutdown,
            )
            .await;

        Ok(context.execution.unexecuted.is_empty())
    }

    /// Evaluate the reverse window, logging any change since the last cycle.
    pub fn reversed_at(&mut self, now: DateTime<Utc>) -> bool {
        let reversed = self.config.strategy.reverse_window.contains(now);
        match self.reversed_last {
            Some(previous) if previous != reversed => {
                if reversed {
                    info!("Entering reverse window: bottom ranks go long, top ranks go short");
                } else {
                    info!("Leaving reverse window: normal momentum selection");
                }
            }
            None if reversed => info!("Reverse window active"),
            _ => {}
        }
        self.reversed_last = Some(reversed);
        reversed
    }

    async fn score_universe(&self, context: &mut CycleContext) {
        let timeframe = self.config.market_data.candle_timeframe.as_str();
        let limit = self.config.market_data.lookback_bars;
        let timeout = Duration::from_secs(self.config.market_data.fetch_timeout_secs);
        let market = self.market.as_ref();
        let retry = &self.retry;

        let fetches = self.universe.iter().map(|instrument| async move {
            let fetch = retry_read("candles", retry, || {
                market.fetch_candles(instrument, timeframe, limit)
            });
            let result: Result<CandleSeries, GatewayError> =
                match tokio::time::timeout(timeout, fetch).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Transport(format!(
                        "candle fetch timed out after {}s",
                        timeout.as_secs()
                    ))),
                };
            (instrument, result)
        });

        for (instrument, result) in join_all(fetches).await {
            let series = match result {
                Ok(series) => series,
                Err(e) => {
                    warn!(%instrument, error = %e, "Candle fetch failed, skipping");
                    context
                        .skipped
                        .push((instrument.clone(), format!("candles: {}", e)));
                    continue;
                }
            };

            match self.factor.breakdown(&series) {
                Ok(breakdown) => {
                    debug!(
                        %instrument,
                        score = %breakdown.score,
                        raw = breakdown.raw_momentum,
                        vol_adjusted = breakdown.volatility_adjusted,
                        trend = breakdown.trend,
                        volume = breakdown.volume,
                        "Scored"
                    );
                    context.scores.insert(instrument.clone(), breakdown.score);
                }
                Err(e) => {
                    warn!(%instrument, bars = series.len(), error = %e, "Not scored, skipping");
                    context.skipped.push((instrument.clone(), e.to_string()));
                }
            }
        }
    }

    async fn cancel_open_orders(&self) -> Result<usize> {
        let orders = retry_read("open orders", &self.retry, || self.gateway.fetch_open_orders())
            .await
            .context("Failed to fetch open orders")?;

        let mut cancelled = 0;
        for order in &orders {
            match self
                .gateway
                .cancel_order(&order.order_id, &order.instrument)
                .await
            {
                Ok(()) => {
                    cancelled += 1;
                    info!(instrument = %order.instrument, order_id = %order.order_id, "Cancelled open order");
                }
                Err(e) => warn!(
                    instrument = %order.instrument,
                    order_id = %order.order_id,
                    error = %e,
                    "Failed to cancel open order"
                ),
            }
        }

        Ok(cancelled)
    }

    async fn load_instruments(&mut self) -> Result<(), GatewayError> {
        let listed = retry_read("instruments", &self.retry, || self.market.fetch_instruments()).await?;
        let listed: HashMap<Instrument, InstrumentSpec> = listed
            .into_iter()
            .map(|spec| (spec.instrument.clone(), spec))
            .collect();

        let mut universe = Vec::new();
        let mut specs = HashMap::new();
        for symbol in &self.config.strategy.universe {
            let instrument = Instrument::new(symbol.as_str());
            match listed.get(&instrument) {
                Some(spec) => {
                    specs.insert(instrument.clone(), spec.clone());
                    if !universe.contains(&instrument) {
                        universe.push(instrument);
                    }
                }
                None => warn!(%instrument, "Configured instrument not listed, dropping"),
            }
        }

        info!(
            listed = listed.len(),
            universe = universe.len(),
            "Instrument metadata loaded"
        );

        self.universe = universe;
        self.specs = specs;
        self.specs_loaded_at = Utc::now();
        Ok(())
    }

    async fn refresh_instruments_if_stale(&mut self) {
        let max_age = ChronoDuration::from_std(self.config.schedule.instrument_refresh())
            .unwrap_or_else(|_| ChronoDuration::days(1));
        if Utc::now() - self.specs_loaded_at < max_age {
            return;
        }

        let previous = (self.universe.clone(), self.specs.clone());
        match self.load_instruments().await {
            Ok(()) if self.universe.is_empty() => {
                warn!("Refreshed metadata lists no configured instrument, keeping previous table");
                (self.universe, self.specs) = previous;
            }
            Ok(()) => {}
            Err(e) => warn!(error = %e, "Instrument refresh failed, keeping previous table"),
        }
    }
}
