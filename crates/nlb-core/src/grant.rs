//! Once-per-day free credit grant.
//!
//! A single task sleeps until the configured local wall-clock time, then
//! walks the whole user population applying the ledger's idempotent grant.
//! The pass is single-flight: a tick must never overlap a still-running pass.
//! Per-user notification failures are swallowed, mirroring the broadcast
//! engine's isolation policy.

use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, TimeZone};
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    messaging::port::MessagingPort,
    quota::QuotaLedger,
    store::UserStore,
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct GrantConfig {
    /// Local wall-clock time of the daily tick.
    pub hour: u32,
    pub minute: u32,
    /// Credits added per grant; shown in the notification.
    pub amount: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GrantRunReport {
    pub visited: u64,
    pub granted: u64,
    pub notify_failed: u64,
}

struct GrantInner {
    store: Arc<dyn UserStore>,
    ledger: Arc<QuotaLedger>,
    messenger: Arc<dyn MessagingPort>,
    cfg: GrantConfig,
    running: Mutex<bool>,
}

#[derive(Clone)]
pub struct DailyGrantScheduler {
    inner: Arc<GrantInner>,
}

impl DailyGrantScheduler {
    pub fn new(
        store: Arc<dyn UserStore>,
        ledger: Arc<QuotaLedger>,
        messenger: Arc<dyn MessagingPort>,
        cfg: GrantConfig,
    ) -> Self {
        Self {
            inner: Arc::new(GrantInner {
                store,
                ledger,
                messenger,
                cfg,
                running: Mutex::new(false),
            }),
        }
    }

    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let now = Local::now();
                let Some(next) =
                    next_run_after(now, scheduler.inner.cfg.hour, scheduler.inner.cfg.minute)
                else {
                    warn!("daily grant has no next run time (stopping)");
                    break;
                };
                let dur = (next - now).to_std().unwrap_or_default();
                info!("next daily grant at {next}");

                tokio::select! {
                  _ = cancel.cancelled() => break,
                  _ = sleep(dur) => {
                    let today = Local::now().date_naive();
                    match scheduler.run_once(today).await {
                      Ok(Some(report)) => info!(
                        visited = report.visited,
                        granted = report.granted,
                        "daily grant pass complete"
                      ),
                      Ok(None) => warn!("daily grant tick skipped: previous pass still running"),
                      Err(e) => warn!("daily grant pass failed: {e}"),
                    }
                  }
                }
            }
        })
    }

    /// Run one grant pass for `today`. Returns `None` if a pass is already in
    /// flight (single-flight, same discipline as the broadcast engine).
    pub async fn run_once(&self, today: NaiveDate) -> Result<Option<GrantRunReport>> {
        {
            let mut running = self.inner.running.lock().await;
            if *running {
                return Ok(None);
            }
            *running = true;
        }

        let result = self.pass(today).await;

        *self.inner.running.lock().await = false;
        result.map(Some)
    }

    async fn pass(&self, today: NaiveDate) -> Result<GrantRunReport> {
        let mut report = GrantRunReport::default();
        let mut cursor = self.inner.store.all_users().await?;

        while let Some(next) = cursor.next().await {
            let user = match next {
                Ok(user) => user,
                Err(e) => {
                    debug!("user cursor error during grant pass: {e}");
                    continue;
                }
            };
            report.visited += 1;

            match self.inner.ledger.grant_if_due(user.id, today).await {
                Ok(true) => {
                    report.granted += 1;
                    let notice = format!(
                        "🎁 Daily bonus: {} free credit{} added to your balance.",
                        self.inner.cfg.amount,
                        if self.inner.cfg.amount == 1 { "" } else { "s" }
                    );
                    if self
                        .inner
                        .messenger
                        .send_html(user.id.chat(), &notice)
                        .await
                        .is_err()
                    {
                        report.notify_failed += 1;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    // One user's store hiccup must not starve the rest.
                    debug!(user = user.id.0, "grant failed: {e}");
                }
            }
        }

        Ok(report)
    }
}

fn next_run_after(now: DateTime<Local>, hour: u32, minute: u32) -> Option<DateTime<Local>> {
    let mut date = now.date_naive();
    // A DST gap can swallow the slot; look a few days ahead at most.
    for _ in 0..4 {
        if let Some(naive) = date.and_hms_opt(hour, minute, 0) {
            if let Some(candidate) = Local.from_local_datetime(&naive).earliest() {
                if candidate > now {
                    return Some(candidate);
                }
            }
        }
        date = date.succ_opt()?;
    }
    None
}
