// =============================================================================
// Position Monitor - one supervised Tokio task per open trade
// =============================================================================
//
// Each monitored trade gets its own task that, until the record is closed or
// the task is cancelled:
//   1. Force-closes with `timeout` once the maximum holding time is reached.
//   2. Sleeps one poll interval (interruptible by cancellation).
//   3. Fetches the price, plus best-effort indicator readings.
//   4. Appends a price snapshot and emits a `monitor_update` event.
//   5. Evaluates the exit policy and applies its trailing-stop changes.
//   6. Closes or partially closes the position when the policy says so.
//
// A failed price fetch skips the tick. A failed close is retried on the next
// tick. A close that comes back `AlreadyClosed` means another closer won and
// the task simply stops.
//
//   let scheduler = Arc::new(MonitorScheduler::new(executor, indicators));
//   scheduler.spawn(&record.trade_id);
//
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::analysis::{IndicatorReadings, IndicatorSource};
use crate::error::TradeError;
use crate::events::TradeEvent;
use crate::execution::TradeExecutor;
use crate::exit::policy::{self, ExitParams, ExitSignal};
use crate::position_store::PriceSnapshot;
use crate::types::CloseReason;

struct MonitorHandle {
    cancel: watch::Sender<bool>,
    /// Taken by `wait`.
    join: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    fn is_done(&self) -> bool {
        match &self.join {
            Some(join) => join.is_finished(),
            None => self.cancel.is_closed(),
        }
    }
}

/// Everything a monitor task needs, shared by all tasks.
#[derive(Clone)]
struct MonitorContext {
    executor: Arc<TradeExecutor>,
    indicators: Option<Arc<dyn IndicatorSource>>,
    poll_interval: Duration,
    max_duration: Duration,
    exit_params: ExitParams,
}

/// Registry of monitor tasks keyed by trade id.
pub struct MonitorScheduler {
    ctx: MonitorContext,
    tasks: Mutex<HashMap<String, MonitorHandle>>,
    shutting_down: AtomicBool,
}

impl MonitorScheduler {
    pub fn new(executor: Arc<TradeExecutor>, indicators: Option<Arc<dyn IndicatorSource>>) -> Self {
        let params = executor.params();
        let ctx = MonitorContext {
            poll_interval: params.poll_interval(),
            max_duration: params.max_duration(),
            exit_params: params.exit_params(),
            executor,
            indicators,
        };
        Self {
            ctx,
            tasks: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn executor(&self) -> &Arc<TradeExecutor> {
        &self.ctx.executor
    }

    /// Start supervising `trade_id`. Returns `false` if a live monitor already
    /// exists for it or the scheduler is shutting down.
    pub fn spawn(&self, trade_id: &str) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!(trade_id, "scheduler shutting down, monitor not started");
            return false;
        }

        let mut tasks = self.tasks.lock();
        tasks.retain(|_, h| !h.is_done());
        if tasks.contains_key(trade_id) {
            debug!(trade_id, "monitor already running");
            return false;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let join = tokio::spawn(monitor_trade(
            self.ctx.clone(),
            trade_id.to_string(),
            cancel_rx,
        ));
        tasks.insert(
            trade_id.to_string(),
            MonitorHandle {
                cancel: cancel_tx,
                join: Some(join),
            },
        );
        true
    }

    /// Ask the monitor of `trade_id` to stop. The trade itself stays open.
    pub fn cancel(&self, trade_id: &str) -> bool {
        match self.tasks.lock().get(trade_id) {
            Some(handle) => handle.cancel.send(true).is_ok(),
            None => false,
        }
    }

    /// Cancel every monitor and refuse new ones.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let tasks = self.tasks.lock();
        info!(monitors = tasks.len(), "cancelling all monitors");
        for handle in tasks.values() {
            let _ = handle.cancel.send(true);
        }
    }

    /// `shutdown`, then wait for every task to exit.
    pub async fn shutdown_and_wait(&self) {
        self.shutdown();
        let joins: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .values_mut()
            .filter_map(|h| h.join.take())
            .collect();
        for join in joins {
            if let Err(e) = join.await {
                error!(error = %e, "monitor task panicked");
            }
        }
    }

    /// Wait for the monitor of `trade_id` to finish.
    pub async fn wait(&self, trade_id: &str) {
        let join = self
            .tasks
            .lock()
            .get_mut(trade_id)
            .and_then(|h| h.join.take());
        if let Some(join) = join {
            if let Err(e) = join.await {
                error!(trade_id, error = %e, "monitor task panicked");
            }
        }
    }

    pub fn is_monitoring(&self, trade_id: &str) -> bool {
        self.tasks
            .lock()
            .get(trade_id)
            .is_some_and(|h| !h.is_done())
    }

    pub fn active_count(&self) -> usize {
        self.tasks.lock().values().filter(|h| !h.is_done()).count()
    }
}

impl std::fmt::Debug for MonitorScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorScheduler")
            .field("poll_interval", &self.ctx.poll_interval)
            .field("max_duration", &self.ctx.max_duration)
            .field("monitors", &self.active_count())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Task body
// -----------------------------------------------------------------------------

enum Tick {
    Continue,
    Stop,
    Cancelled,
}

async fn monitor_trade(ctx: MonitorContext, trade_id: String, mut cancel: watch::Receiver<bool>) {
    let Some((symbol, opened)) = ctx
        .executor
        .store()
        .snapshot(&trade_id)
        .await
        .map(|r| (r.symbol, r.opened_instant))
    else {
        warn!(trade_id = %trade_id, "monitor started for unknown trade");
        return;
    };

    // Counted from the open, so a restarted monitor keeps the original deadline.
    let deadline = opened + ctx.max_duration;
    let mut check_count: u64 = 0;

    info!(
        trade_id = %trade_id,
        symbol = %symbol,
        interval_secs = ctx.poll_interval.as_secs(),
        remaining_secs = deadline.saturating_duration_since(Instant::now()).as_secs(),
        "monitor started"
    );

    loop {
        if *cancel.borrow() {
            info!(trade_id = %trade_id, check_count, "monitor cancelled");
            return;
        }

        match ctx.executor.store().status(&trade_id).await {
            Some(status) if status.is_active() => {}
            _ => break,
        }

        if Instant::now() >= deadline {
            info!(
                trade_id = %trade_id,
                elapsed_secs = opened.elapsed().as_secs(),
                "max duration reached, force closing"
            );
            match ctx.executor.close(&trade_id, CloseReason::Timeout).await {
                Ok(_) => break,
                Err(TradeError::AlreadyClosed(_)) | Err(TradeError::NotFound(_)) => break,
                Err(e) => report_error(&ctx, &trade_id, &symbol, check_count, &e),
            }
        }

        tokio::select! {
            _ = sleep(ctx.poll_interval) => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    info!(trade_id = %trade_id, check_count, "monitor cancelled");
                    return;
                }
                continue;
            }
        }

        check_count += 1;
        match check(&ctx, &trade_id, &symbol, check_count, opened, &cancel).await {
            Tick::Continue => {}
            Tick::Stop => break,
            Tick::Cancelled => {
                info!(trade_id = %trade_id, check_count, "monitor cancelled mid-check");
                return;
            }
        }
    }

    info!(trade_id = %trade_id, check_count, "monitor finished");
}

async fn check(
    ctx: &MonitorContext,
    trade_id: &str,
    symbol: &str,
    check_count: u64,
    opened: Instant,
    cancel: &watch::Receiver<bool>,
) -> Tick {
    let executor = &ctx.executor;

    let price = match executor.gateway().price(symbol).await {
        Ok(p) => p,
        Err(source) => {
            let err = TradeError::PriceFetch {
                symbol: symbol.to_string(),
                source,
            };
            warn!(trade_id, check_count, error = %err, "price fetch failed");
            executor.events().emit(TradeEvent::MonitorError {
                trade_id: trade_id.to_string(),
                symbol: symbol.to_string(),
                check_count,
                error: err.to_string(),
                at: Utc::now(),
            });
            return Tick::Continue;
        }
    };

    // A force close or shutdown may have arrived while the fetch was in flight.
    if *cancel.borrow() {
        return Tick::Cancelled;
    }

    let readings = match &ctx.indicators {
        Some(source) => source.snapshot(symbol).await.unwrap_or_else(|e| {
            debug!(trade_id, error = %e, "indicator snapshot unavailable");
            IndicatorReadings::default()
        }),
        None => IndicatorReadings::default(),
    };

    let Some(handle) = executor.store().get(trade_id) else {
        return Tick::Stop;
    };

    let (signal, activated, update) = {
        let mut record = handle.lock().await;
        // Closed by someone else while we were fetching.
        if !record.status.is_active() {
            return Tick::Stop;
        }

        let evaluation = policy::evaluate(&record, price, &ctx.exit_params);
        let activated = record.apply_trailing(evaluation.trailing);

        let mut snapshot = PriceSnapshot::new(price, readings.clone());
        if activated {
            snapshot.note = Some(format!("trailing stop activated at {price}"));
        }
        record.price_history.push(snapshot);

        let unrealized_pnl = record.unrealized_pnl(price);
        let pnl_percent = record.unrealized_pnl_percent(price);
        let time_label = elapsed_label(opened.elapsed());

        debug!(
            trade_id,
            check_count,
            time = %time_label,
            price,
            pnl = format!("{unrealized_pnl:+.4}"),
            pnl_pct = format!("{pnl_percent:+.2}"),
            trailing = record.trailing_stop_active,
            "monitor check"
        );

        let update = TradeEvent::MonitorUpdate {
            trade_id: trade_id.to_string(),
            symbol: symbol.to_string(),
            check_count,
            time_label,
            current_price: price,
            entry_price: record.entry_price,
            take_profit: record.take_profit,
            stop_loss: record.stop_loss,
            unrealized_pnl,
            pnl_percent,
            rsi: readings.rsi,
            volume_ratio: readings.volume_ratio,
            trailing_stop_active: record.trailing_stop_active,
            partial_closed: record.partial_closed,
            at: Utc::now(),
        };
        (evaluation.signal, activated, update)
    };

    if activated {
        info!(trade_id, price, "trailing stop activated");
        executor.events().emit(TradeEvent::TrailingActivated {
            trade_id: trade_id.to_string(),
            symbol: symbol.to_string(),
            price,
            at: Utc::now(),
        });
    }
    executor.events().emit(update);

    if signal != ExitSignal::None && *cancel.borrow() {
        return Tick::Cancelled;
    }

    match signal {
        ExitSignal::None => Tick::Continue,
        ExitSignal::PartialTakeProfit => match executor.partial_close(trade_id).await {
            Ok(_) => Tick::Continue,
            Err(TradeError::AlreadyClosed(_)) | Err(TradeError::NotFound(_)) => Tick::Stop,
            Err(e) => {
                report_error(ctx, trade_id, symbol, check_count, &e);
                Tick::Continue
            }
        },
        full if full.is_full_exit() => {
            let Some(reason) = full.close_reason() else {
                return Tick::Continue;
            };
            info!(trade_id, %reason, price, "exit triggered");
            match executor.close(trade_id, reason).await {
                Ok(_) => Tick::Stop,
                Err(TradeError::AlreadyClosed(_)) | Err(TradeError::NotFound(_)) => Tick::Stop,
                Err(e) => {
                    report_error(ctx, trade_id, symbol, check_count, &e);
                    Tick::Continue
                }
            }
        }
        _ => Tick::Continue,
    }
}

fn report_error(ctx: &MonitorContext, trade_id: &str, symbol: &str, check_count: u64, err: &TradeError) {
    error!(trade_id, check_count, error = %err, retryable = err.is_retryable(), "monitor action failed");
    ctx.executor.events().emit(TradeEvent::MonitorError {
        trade_id: trade_id.to_string(),
        symbol: symbol.to_string(),
        check_count,
        error: err.to_string(),
        at: Utc::now(),
    });
}

/// "12min" under an hour, "2h5m" past it.
pub fn elapsed_label(elapsed: Duration) -> String {
    let minutes = elapsed.as_secs() / 60;
    if minutes < 60 {
        format!("{minutes}min")
    } else {
        format!("{}h{}m", minutes / 60, minutes % 60)
    }
}

// =============================================================================
// Tests
// =============================================================================
