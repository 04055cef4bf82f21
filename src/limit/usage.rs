//! Usage tracker - windowed token/cost accounting with budget enforcement
//!
//! Accumulates realized usage against configured budgets, computes cost from
//! the pricing table, and parks callers (pause-and-wait) when a budget is
//! exhausted. Parks release on manual resume, raised limits, or window roll;
//! a ~10 s sweep re-evaluates while parked.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, Months, NaiveDate, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::pricing;
use super::storage::UsageStorage;
use crate::llm::types::TokenUsage;

/// Fraction of a budget at which a warning event fires
const WARNING_THRESHOLD: f64 = 0.8;

/// How often parked callers re-evaluate the budget on their own
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Reset period for usage accumulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UsageWindow {
    Hour,
    #[default]
    Day,
    Week,
    Month,
    AllTime,
}

impl UsageWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageWindow::Hour => "hour",
            UsageWindow::Day => "day",
            UsageWindow::Week => "week",
            UsageWindow::Month => "month",
            UsageWindow::AllTime => "all-time",
        }
    }

    /// `[start, end)` of the window containing `now`, aligned to local
    /// calendar units. Weeks start Monday 00:00 local.
    pub fn bounds(&self, now: DateTime<Local>) -> (DateTime<Local>, DateTime<Local>) {
        match self {
            UsageWindow::Hour => {
                let start = local_datetime(
                    now.date_naive()
                        .and_hms_opt(now.hour(), 0, 0)
                        .expect("valid hour start"),
                );
                (start, start + chrono::Duration::hours(1))
            }
            UsageWindow::Day => {
                let start = local_midnight(now.date_naive());
                (start, start + chrono::Duration::days(1))
            }
            UsageWindow::Week => {
                let monday = now.date_naive()
                    - chrono::Duration::days(now.weekday().num_days_from_monday() as i64);
                let start = local_midnight(monday);
                (start, start + chrono::Duration::days(7))
            }
            UsageWindow::Month => {
                let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
                    .expect("valid first of month");
                let start = local_midnight(first);
                let end = start
                    .checked_add_months(Months::new(1))
                    .expect("valid next month");
                (start, end)
            }
            UsageWindow::AllTime => {
                let start = Local
                    .timestamp_opt(0, 0)
                    .single()
                    .expect("epoch is representable");
                let end = Local
                    .timestamp_opt(253_402_300_799, 0) // 9999-12-31
                    .single()
                    .expect("far future is representable");
                (start, end)
            }
        }
    }
}

fn local_midnight(date: NaiveDate) -> DateTime<Local> {
    local_datetime(date.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

fn local_datetime(naive: chrono::NaiveDateTime) -> DateTime<Local> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| Local.from_utc_datetime(&naive))
}

/// Accumulated usage for the active window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
    pub request_count: u64,
    pub window_start: DateTime<Local>,
    pub window_end: DateTime<Local>,
}

impl UsageStats {
    fn fresh(window: UsageWindow, now: DateTime<Local>) -> Self {
        let (window_start, window_end) = window.bounds(now);
        Self {
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            cost_usd: 0.0,
            request_count: 0,
            window_start,
            window_end,
        }
    }
}

/// Budget limits; unset fields behave as +infinity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageLimits {
    pub max_input_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub max_total_tokens: Option<u64>,
    pub max_cost_usd: Option<f64>,
    #[serde(default)]
    pub window: UsageWindow,
}

/// Partial update for [`UsageLimits`]; unset fields keep their value
#[derive(Debug, Clone, Default)]
pub struct UsageLimitsUpdate {
    pub max_input_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub max_total_tokens: Option<u64>,
    pub max_cost_usd: Option<f64>,
    pub window: Option<UsageWindow>,
}

/// One response's realized usage, as reported by the agent loop
#[derive(Debug, Clone, Default)]
pub struct UsageReport {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    /// Pre-computed cost; when absent it is derived from `model` pricing
    pub cost_usd: Option<f64>,
    pub model: Option<String>,
}

impl UsageReport {
    pub fn from_usage(usage: &TokenUsage, model: impl Into<String>) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            cost_usd: None,
            model: Some(model.into()),
        }
    }
}

/// Outcome of a budget check
#[derive(Debug, Clone)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

/// Warning fired when a metric first crosses the 80% threshold
#[derive(Debug, Clone)]
pub struct BudgetWarning {
    pub metric: &'static str,
    pub current: f64,
    pub limit: f64,
    pub percent_used: f64,
}

/// Notification of a transition into the paused state
pub struct BudgetPause {
    pub reason: String,
    /// Releases all parked callers when invoked
    pub resume: Box<dyn Fn() + Send + Sync>,
}

/// Percent-of-budget snapshot for the UI; `None` where no limit is set
#[derive(Debug, Clone, Copy, Default)]
pub struct UsagePercentages {
    pub input: Option<f64>,
    pub output: Option<f64>,
    pub total: Option<f64>,
    pub cost: Option<f64>,
}

type PausedCallback = Arc<dyn Fn(BudgetPause) + Send + Sync>;
type WarningCallback = Arc<dyn Fn(BudgetWarning) + Send + Sync>;
type UpdateCallback = Arc<dyn Fn(UsageStats) + Send + Sync>;

#[derive(Default, Clone, Copy)]
struct WarnedFlags {
    input: bool,
    output: bool,
    total: bool,
    cost: bool,
}

struct TrackerInner {
    stats: UsageStats,
    limits: UsageLimits,
    paused: bool,
    /// Bumped by resume/reset/window-roll; parked callers holding an older
    /// generation are released unconditionally
    resume_generation: u64,
    warned: WarnedFlags,
    on_paused: Option<PausedCallback>,
    on_warning: Option<WarningCallback>,
    on_update: Option<UpdateCallback>,
}

/// Thread-safe usage tracker
pub struct UsageTracker {
    inner: Mutex<TrackerInner>,
    notify: Notify,
    storage: Option<Arc<dyn UsageStorage>>,
    key_prefix: String,
    self_ref: Mutex<Weak<UsageTracker>>,
}

impl UsageTracker {
    pub fn new(limits: UsageLimits) -> Arc<Self> {
        Self::with_storage(limits, None, "usage")
    }

    /// Create a tracker, restoring persisted stats when the stored window
    /// matches the current one; otherwise fresh stats win.
    pub fn with_storage(
        limits: UsageLimits,
        storage: Option<Arc<dyn UsageStorage>>,
        key_prefix: &str,
    ) -> Arc<Self> {
        let now = Local::now();
        let mut stats = UsageStats::fresh(limits.window, now);

        if let Some(adapter) = &storage {
            let key = format!("{key_prefix}:{}", limits.window.as_str());
            if let Some(raw) = adapter.get(&key) {
                match serde_json::from_str::<UsageStats>(&raw) {
                    Ok(saved) if saved.window_start == stats.window_start => stats = saved,
                    Ok(_) => {
                        tracing::debug!("persisted usage stats are from a previous window, discarding")
                    }
                    Err(e) => tracing::warn!("failed to parse persisted usage stats: {e}"),
                }
            }
        }

        let tracker = Arc::new(Self {
            inner: Mutex::new(TrackerInner {
                stats,
                limits,
                paused: false,
                resume_generation: 0,
                warned: WarnedFlags::default(),
                on_paused: None,
                on_warning: None,
                on_update: None,
            }),
            notify: Notify::new(),
            storage,
            key_prefix: key_prefix.to_string(),
            self_ref: Mutex::new(Weak::new()),
        });
        *tracker.self_ref.lock().expect("tracker lock poisoned") = Arc::downgrade(&tracker);
        tracker
    }

    pub fn set_on_paused_callback(&self, cb: impl Fn(BudgetPause) + Send + Sync + 'static) {
        self.lock().on_paused = Some(Arc::new(cb));
    }

    pub fn set_on_warning_callback(&self, cb: impl Fn(BudgetWarning) + Send + Sync + 'static) {
        self.lock().on_warning = Some(Arc::new(cb));
    }

    pub fn set_on_update_callback(&self, cb: impl Fn(UsageStats) + Send + Sync + 'static) {
        self.lock().on_update = Some(Arc::new(cb));
    }

    /// Whether the next request fits the budget; the first tripped limit
    /// names the reason.
    pub fn check_budget(&self) -> BudgetCheck {
        let now = Local::now();
        let mut inner = self.lock();
        let rolled = roll_if_expired(&mut inner, now);
        let check = evaluate(&inner);
        drop(inner);
        if rolled {
            self.notify.notify_waiters();
        }
        check
    }

    /// Return immediately if budget allows; otherwise park until resume,
    /// raised limits, or window roll.
    pub async fn wait_for_budget(&self) {
        let (parked_gen, pause) = {
            let now = Local::now();
            let mut inner = self.lock();
            roll_if_expired(&mut inner, now);
            let check = evaluate(&inner);
            if check.allowed {
                inner.paused = false;
                return;
            }

            let first_pause = !inner.paused;
            inner.paused = true;
            let pause = if first_pause {
                inner.on_paused.clone().map(|cb| {
                    (
                        cb,
                        check.reason.unwrap_or_else(|| "budget exhausted".to_string()),
                    )
                })
            } else {
                None
            };
            (inner.resume_generation, pause)
        };

        if let Some((cb, reason)) = pause {
            let weak = self.self_ref.lock().expect("tracker lock poisoned").clone();
            cb(BudgetPause {
                reason,
                resume: Box::new(move || {
                    if let Some(tracker) = weak.upgrade() {
                        tracker.resume();
                    }
                }),
            });
        }

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            }

            let now = Local::now();
            let mut inner = self.lock();
            roll_if_expired(&mut inner, now);
            if inner.resume_generation != parked_gen || evaluate(&inner).allowed {
                inner.paused = false;
                return;
            }
        }
    }

    /// Accumulate one response's realized usage. Cost is derived from the
    /// pricing table when not supplied. Persists when storage is attached.
    pub fn report_usage(&self, report: UsageReport) {
        let now = Local::now();
        let mut inner = self.lock();
        let rolled = roll_if_expired(&mut inner, now);

        let cost = report.cost_usd.unwrap_or_else(|| {
            let usage = TokenUsage {
                input_tokens: report.input_tokens,
                output_tokens: report.output_tokens,
                cache_read_tokens: report.cache_read_tokens,
                cache_creation_tokens: report.cache_creation_tokens,
            };
            pricing::cost_usd(
                &usage,
                pricing::pricing_for(report.model.as_deref().unwrap_or_default()),
            )
        });

        inner.stats.input_tokens += report.input_tokens;
        inner.stats.output_tokens += report.output_tokens;
        inner.stats.total_tokens += report.input_tokens + report.output_tokens;
        inner.stats.cache_read_tokens += report.cache_read_tokens;
        inner.stats.cache_creation_tokens += report.cache_creation_tokens;
        inner.stats.cost_usd += cost;
        inner.stats.request_count += 1;

        let warnings = collect_warnings(&mut inner);
        let stats = inner.stats.clone();
        let on_warning = inner.on_warning.clone();
        let on_update = inner.on_update.clone();
        drop(inner);

        self.persist(&stats);
        if rolled {
            self.notify.notify_waiters();
        }
        if let Some(cb) = on_warning {
            for warning in warnings {
                cb(warning);
            }
        }
        if let Some(cb) = on_update {
            cb(stats);
        }
    }

    /// Zero the stats at the current window boundaries and release parks.
    pub fn reset(&self) {
        let now = Local::now();
        let mut inner = self.lock();
        inner.stats = UsageStats::fresh(inner.limits.window, now);
        inner.warned = WarnedFlags::default();
        inner.paused = false;
        inner.resume_generation += 1;
        let stats = inner.stats.clone();
        drop(inner);

        self.persist(&stats);
        self.notify.notify_waiters();
    }

    /// Release parked callers regardless of budget state.
    pub fn resume(&self) {
        let mut inner = self.lock();
        inner.paused = false;
        inner.resume_generation += 1;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Overwrite the set fields; parked callers re-evaluate and are
    /// released if the new limits allow.
    pub fn update_limits(&self, update: UsageLimitsUpdate) {
        let now = Local::now();
        let mut inner = self.lock();

        if let Some(v) = update.max_input_tokens {
            inner.limits.max_input_tokens = Some(v);
        }
        if let Some(v) = update.max_output_tokens {
            inner.limits.max_output_tokens = Some(v);
        }
        if let Some(v) = update.max_total_tokens {
            inner.limits.max_total_tokens = Some(v);
        }
        if let Some(v) = update.max_cost_usd {
            inner.limits.max_cost_usd = Some(v);
        }
        if let Some(window) = update.window {
            if window != inner.limits.window {
                inner.limits.window = window;
                inner.stats = UsageStats::fresh(window, now);
                inner.warned = WarnedFlags::default();
            }
        }

        // Warning crossings re-arm for metrics that dropped back under the
        // threshold; raised limits may also unpark waiters.
        rearm_warnings(&mut inner);
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn get_stats(&self) -> UsageStats {
        let now = Local::now();
        let mut inner = self.lock();
        let rolled = roll_if_expired(&mut inner, now);
        let stats = inner.stats.clone();
        drop(inner);
        if rolled {
            self.notify.notify_waiters();
        }
        stats
    }

    pub fn get_usage_percentages(&self) -> UsagePercentages {
        let now = Local::now();
        let mut inner = self.lock();
        roll_if_expired(&mut inner, now);
        let pct = |current: f64, limit: Option<f64>| {
            limit.filter(|l| *l > 0.0).map(|l| current / l * 100.0)
        };
        UsagePercentages {
            input: pct(
                inner.stats.input_tokens as f64,
                inner.limits.max_input_tokens.map(|v| v as f64),
            ),
            output: pct(
                inner.stats.output_tokens as f64,
                inner.limits.max_output_tokens.map(|v| v as f64),
            ),
            total: pct(
                inner.stats.total_tokens as f64,
                inner.limits.max_total_tokens.map(|v| v as f64),
            ),
            cost: pct(inner.stats.cost_usd, inner.limits.max_cost_usd),
        }
    }

    fn persist(&self, stats: &UsageStats) {
        let Some(storage) = &self.storage else {
            return;
        };
        let window = {
            let inner = self.lock();
            inner.limits.window
        };
        let key = format!("{}:{}", self.key_prefix, window.as_str());
        match serde_json::to_string(stats) {
            Ok(json) => {
                if let Err(e) = storage.set(&key, &json) {
                    tracing::warn!("failed to persist usage stats: {e}");
                }
            }
            Err(e) => tracing::warn!("failed to serialize usage stats: {e}"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().expect("usage tracker lock poisoned")
    }
}

/// Install fresh stats when the active window has expired. Returns true
/// when a roll happened (callers then release parked waiters).
fn roll_if_expired(inner: &mut TrackerInner, now: DateTime<Local>) -> bool {
    if now < inner.stats.window_end {
        return false;
    }
    inner.stats = UsageStats::fresh(inner.limits.window, now);
    inner.warned = WarnedFlags::default();
    inner.paused = false;
    inner.resume_generation += 1;
    true
}

/// Budget evaluation; the first tripped limit names the reason.
fn evaluate(inner: &TrackerInner) -> BudgetCheck {
    let stats = &inner.stats;
    let limits = &inner.limits;

    if let Some(max) = limits.max_input_tokens {
        if stats.input_tokens >= max {
            return BudgetCheck {
                allowed: false,
                reason: Some(format!(
                    "Input token limit exceeded ({}/{})",
                    stats.input_tokens, max
                )),
            };
        }
    }
    if let Some(max) = limits.max_output_tokens {
        if stats.output_tokens >= max {
            return BudgetCheck {
                allowed: false,
                reason: Some(format!(
                    "Output token limit exceeded ({}/{})",
                    stats.output_tokens, max
                )),
            };
        }
    }
    if let Some(max) = limits.max_total_tokens {
        if stats.total_tokens >= max {
            return BudgetCheck {
                allowed: false,
                reason: Some(format!(
                    "Total token limit exceeded ({}/{})",
                    stats.total_tokens, max
                )),
            };
        }
    }
    if let Some(max) = limits.max_cost_usd {
        if stats.cost_usd >= max {
            return BudgetCheck {
                allowed: false,
                reason: Some(format!(
                    "Cost limit exceeded (${:.4}/${:.2})",
                    stats.cost_usd, max
                )),
            };
        }
    }
    BudgetCheck {
        allowed: true,
        reason: None,
    }
}

/// One warning per metric per crossing of the threshold.
fn collect_warnings(inner: &mut TrackerInner) -> Vec<BudgetWarning> {
    let mut warnings = Vec::new();
    let stats = inner.stats.clone();
    let limits = inner.limits.clone();

    let mut check = |metric: &'static str, current: f64, limit: Option<f64>, warned: &mut bool| {
        let Some(limit) = limit.filter(|l| *l > 0.0) else {
            return;
        };
        let pct = current / limit;
        if pct >= WARNING_THRESHOLD && !*warned {
            *warned = true;
            warnings.push(BudgetWarning {
                metric,
                current,
                limit,
                percent_used: pct * 100.0,
            });
        }
    };

    check(
        "input_tokens",
        stats.input_tokens as f64,
        limits.max_input_tokens.map(|v| v as f64),
        &mut inner.warned.input,
    );
    check(
        "output_tokens",
        stats.output_tokens as f64,
        limits.max_output_tokens.map(|v| v as f64),
        &mut inner.warned.output,
    );
    check(
        "total_tokens",
        stats.total_tokens as f64,
        limits.max_total_tokens.map(|v| v as f64),
        &mut inner.warned.total,
    );
    check(
        "cost_usd",
        stats.cost_usd,
        limits.max_cost_usd,
        &mut inner.warned.cost,
    );
    warnings
}

/// Re-arm warning crossings for metrics now back under the threshold.
fn rearm_warnings(inner: &mut TrackerInner) {
    let stats = inner.stats.clone();
    let limits = inner.limits.clone();
    let under = |current: f64, limit: Option<f64>| {
        limit
            .filter(|l| *l > 0.0)
            .map(|l| current / l < WARNING_THRESHOLD)
            .unwrap_or(true)
    };
    if under(
        stats.input_tokens as f64,
        limits.max_input_tokens.map(|v| v as f64),
    ) {
        inner.warned.input = false;
    }
    if under(
        stats.output_tokens as f64,
        limits.max_output_tokens.map(|v| v as f64),
    ) {
        inner.warned.output = false;
    }
    if under(
        stats.total_tokens as f64,
        limits.max_total_tokens.map(|v| v as f64),
    ) {
        inner.warned.total = false;
    }
    if under(stats.cost_usd, limits.max_cost_usd) {
        inner.warned.cost = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration as ChronoDuration;

    use crate::limit::storage::MemoryUsageStorage;

    use super::*;

    fn report(input: u64, output: u64, model: &str) -> UsageReport {
        UsageReport {
            input_tokens: input,
            output_tokens: output,
            model: Some(model.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn totals_and_cost_accumulate() {
        let tracker = UsageTracker::new(UsageLimits::default());
        tracker.report_usage(report(10_000, 1_000, "claude-sonnet-4-20250514"));
        tracker.report_usage(report(5_000, 500, "claude-sonnet-4-20250514"));

        let stats = tracker.get_stats();
        assert_eq!(stats.input_tokens, 15_000);
        assert_eq!(stats.output_tokens, 1_500);
        assert_eq!(stats.total_tokens, stats.input_tokens + stats.output_tokens);
        assert_eq!(stats.request_count, 2);

        let expected = (15_000.0 * 3.0 + 1_500.0 * 15.0) / 1_000_000.0;
        assert!((stats.cost_usd - expected).abs() < 1e-9);
    }

    #[test]
    fn explicit_cost_wins_over_pricing() {
        let tracker = UsageTracker::new(UsageLimits::default());
        tracker.report_usage(UsageReport {
            input_tokens: 1,
            cost_usd: Some(0.5),
            ..Default::default()
        });
        assert!((tracker.get_stats().cost_usd - 0.5).abs() < 1e-12);
    }

    #[test]
    fn cost_limit_trips_with_named_reason() {
        let tracker = UsageTracker::new(UsageLimits {
            max_cost_usd: Some(0.01),
            window: UsageWindow::Hour,
            ..Default::default()
        });
        // 10k input tokens at $3/M is $0.03, over the one-cent budget.
        tracker.report_usage(report(10_000, 0, "claude-sonnet-4-20250514"));

        let check = tracker.check_budget();
        assert!(!check.allowed);
        assert!(check.reason.unwrap().starts_with("Cost limit exceeded"));
    }

    #[test]
    fn first_tripped_limit_names_the_reason() {
        let tracker = UsageTracker::new(UsageLimits {
            max_input_tokens: Some(100),
            max_total_tokens: Some(100),
            ..Default::default()
        });
        tracker.report_usage(report(200, 0, "claude-sonnet-4-20250514"));
        let check = tracker.check_budget();
        assert!(check.reason.unwrap().starts_with("Input token limit"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_budget_returns_immediately_when_allowed() {
        let tracker = UsageTracker::new(UsageLimits::default());
        tracker.wait_for_budget().await;
    }

    #[tokio::test(start_paused = true)]
    async fn update_limits_releases_parked_caller() {
        let tracker = UsageTracker::new(UsageLimits {
            max_cost_usd: Some(0.01),
            window: UsageWindow::Hour,
            ..Default::default()
        });
        tracker.report_usage(report(10_000, 0, "claude-sonnet-4-20250514"));
        assert!(!tracker.check_budget().allowed);

        let parked = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker.wait_for_budget().await;
            })
        };
        tokio::task::yield_now().await;

        tracker.update_limits(UsageLimitsUpdate {
            max_cost_usd: Some(1.0),
            ..Default::default()
        });
        parked.await.unwrap();
        assert!(tracker.check_budget().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_releases_parks_even_over_budget() {
        let tracker = UsageTracker::new(UsageLimits {
            max_total_tokens: Some(10),
            ..Default::default()
        });
        tracker.report_usage(report(100, 0, "claude-sonnet-4-20250514"));

        let parked = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker.wait_for_budget().await;
            })
        };
        tokio::task::yield_now().await;
        tracker.resume();
        parked.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn paused_callback_fires_once_per_transition() {
        let tracker = UsageTracker::new(UsageLimits {
            max_total_tokens: Some(10),
            ..Default::default()
        });
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            tracker.set_on_paused_callback(move |pause| {
                fired.fetch_add(1, Ordering::SeqCst);
                assert!(pause.reason.starts_with("Total token limit"));
                (pause.resume)();
            });
        }
        tracker.report_usage(report(100, 0, "claude-sonnet-4-20250514"));

        // The callback's resume() releases the park.
        tracker.wait_for_budget().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn warning_fires_once_per_crossing() {
        let tracker = UsageTracker::new(UsageLimits {
            max_total_tokens: Some(1_000),
            ..Default::default()
        });
        let warnings = Arc::new(AtomicUsize::new(0));
        {
            let warnings = warnings.clone();
            tracker.set_on_warning_callback(move |w| {
                assert_eq!(w.metric, "total_tokens");
                assert!(w.percent_used >= 80.0);
                warnings.fetch_add(1, Ordering::SeqCst);
            });
        }
        tracker.report_usage(report(700, 100, "claude-sonnet-4-20250514"));
        tracker.report_usage(report(50, 0, "claude-sonnet-4-20250514"));
        tracker.report_usage(report(50, 0, "claude-sonnet-4-20250514"));
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_releases_parked_callers() {
        let tracker = UsageTracker::new(UsageLimits {
            max_total_tokens: Some(10),
            window: UsageWindow::Hour,
            ..Default::default()
        });
        tracker.report_usage(report(100, 0, "claude-sonnet-4-20250514"));

        let parked = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker.wait_for_budget().await;
            })
        };
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        // Expire the window under the parked caller; its next sweep must
        // roll the stats and release it.
        {
            let mut inner = tracker.inner.lock().unwrap();
            inner.stats.window_end = Local::now() - ChronoDuration::seconds(1);
        }
        parked.await.unwrap();
        assert!(tracker.check_budget().allowed);
        assert_eq!(tracker.get_stats().total_tokens, 0);
    }

    #[test]
    fn window_roll_resets_stats() {
        let tracker = UsageTracker::new(UsageLimits {
            window: UsageWindow::Hour,
            ..Default::default()
        });
        tracker.report_usage(report(100, 10, "claude-sonnet-4-20250514"));

        // Force the window into the past; the next access must roll.
        {
            let mut inner = tracker.inner.lock().unwrap();
            inner.stats.window_end = Local::now() - ChronoDuration::seconds(1);
        }
        let stats = tracker.get_stats();
        assert_eq!(stats.input_tokens, 0);
        assert_eq!(stats.request_count, 0);
        assert!(stats.window_end > Local::now());
    }

    #[test]
    fn persisted_stats_reload_in_same_window() {
        let storage: Arc<dyn UsageStorage> = Arc::new(MemoryUsageStorage::new());
        let tracker = UsageTracker::with_storage(
            UsageLimits {
                window: UsageWindow::Day,
                ..Default::default()
            },
            Some(storage.clone()),
            "usage",
        );
        tracker.report_usage(report(42, 7, "claude-sonnet-4-20250514"));
        let saved = tracker.get_stats();
        drop(tracker);

        let restored = UsageTracker::with_storage(
            UsageLimits {
                window: UsageWindow::Day,
                ..Default::default()
            },
            Some(storage),
            "usage",
        );
        assert_eq!(restored.get_stats(), saved);
    }

    #[test]
    fn stale_persisted_window_is_discarded() {
        let storage: Arc<dyn UsageStorage> = Arc::new(MemoryUsageStorage::new());
        let now = Local::now();
        let mut stale = UsageStats::fresh(UsageWindow::Hour, now);
        stale.window_start -= ChronoDuration::hours(2);
        stale.window_end -= ChronoDuration::hours(2);
        stale.input_tokens = 999;
        storage
            .set("usage:hour", &serde_json::to_string(&stale).unwrap())
            .unwrap();

        let tracker = UsageTracker::with_storage(
            UsageLimits {
                window: UsageWindow::Hour,
                ..Default::default()
            },
            Some(storage),
            "usage",
        );
        assert_eq!(tracker.get_stats().input_tokens, 0);
    }

    #[test]
    fn percentages_reflect_limits() {
        let tracker = UsageTracker::new(UsageLimits {
            max_input_tokens: Some(1_000),
            max_cost_usd: Some(1.0),
            ..Default::default()
        });
        tracker.report_usage(report(250, 0, "claude-sonnet-4-20250514"));

        let pct = tracker.get_usage_percentages();
        assert!((pct.input.unwrap() - 25.0).abs() < 1e-9);
        assert!(pct.output.is_none());
        assert!(pct.cost.unwrap() > 0.0);
    }

    #[test]
    fn window_bounds_are_calendar_aligned() {
        let now = Local.with_ymd_and_hms(2026, 3, 18, 14, 35, 20).unwrap();

        let (start, end) = UsageWindow::Hour.bounds(now);
        assert_eq!(start.hour(), 14);
        assert_eq!(start.minute(), 0);
        assert_eq!(end - start, ChronoDuration::hours(1));

        let (start, end) = UsageWindow::Day.bounds(now);
        assert_eq!(start.hour(), 0);
        assert_eq!(end - start, ChronoDuration::days(1));

        let (start, end) = UsageWindow::Week.bounds(now);
        assert_eq!(start.weekday(), chrono::Weekday::Mon);
        assert_eq!(end - start, ChronoDuration::days(7));

        let (start, end) = UsageWindow::Month.bounds(now);
        assert_eq!(start.day(), 1);
        assert_eq!(end.day(), 1);
        assert!(end > start);

        let (start, end) = UsageWindow::AllTime.bounds(now);
        assert!(start < now && now < end);
    }

    #[test]
    fn reset_zeroes_and_releases() {
        let tracker = UsageTracker::new(UsageLimits {
            max_total_tokens: Some(10),
            ..Default::default()
        });
        tracker.report_usage(report(100, 0, "claude-sonnet-4-20250514"));
        assert!(!tracker.check_budget().allowed);

        tracker.reset();
        assert!(tracker.check_budget().allowed);
        assert_eq!(tracker.get_stats().total_tokens, 0);
    }
}
