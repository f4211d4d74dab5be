//! Recurring backup trigger
//!
//! The scheduler owns exactly one job slot, keyed `backup_job`. Every
//! configuration change replaces the slot wholesale: the old timer is
//! cancelled and a new one spawned. Cancellation only interrupts the wait for
//! the next fire; a run already in progress always completes, so the data
//! service is never left stopped. A scheduled fire calls the same entry point a
//! manual trigger uses.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Key of the single recurring job
pub const JOB_KEY: &str = "backup_job";

/// Hour and minute used when no valid schedule is configured
pub const DEFAULT_HOUR: u32 = 3;
pub const DEFAULT_MINUTE: u32 = 0;

/// Schedule as configured, before validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleSpec {
    /// Cron expression: 5-field crontab, or 6/7 fields with seconds first
    Cron(String),
    /// Every day at a local wall-clock time
    Daily { hour: u32, minute: u32 },
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        Self::Daily {
            hour: DEFAULT_HOUR,
            minute: DEFAULT_MINUTE,
        }
    }
}

/// A validated schedule that can compute its next fire time
#[derive(Debug, Clone)]
pub enum Trigger {
    Cron {
        expression: String,
        schedule: Box<cron::Schedule>,
    },
    Daily {
        hour: u32,
        minute: u32,
    },
}

impl Default for Trigger {
    fn default() -> Self {
        Self::Daily {
            hour: DEFAULT_HOUR,
            minute: DEFAULT_MINUTE,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Cron { expression, .. } => write!(f, "cron '{}'", expression),
            Trigger::Daily { hour, minute } => write!(f, "daily at {:02}:{:02}", hour, minute),
        }
    }
}

/// Crontab numbers weekdays 0-7 from Sunday; the cron parser uses 1-7
fn crontab_weekdays(field: &str) -> String {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let number = NUMBER.get_or_init(|| Regex::new(r"\d+").expect("valid regex"));
    field
        .split(',')
        .map(|part| {
            let (days, step) = match part.split_once('/') {
                Some((days, step)) => (days, Some(step)),
                None => (part, None),
            };
            let days = number.replace_all(days, |caps: &regex::Captures| {
                match caps[0].parse::<u32>() {
                    Ok(7) => "1".to_string(),
                    Ok(n) if n < 7 => (n + 1).to_string(),
                    _ => caps[0].to_string(),
                }
            });
            match step {
                Some(step) => format!("{}/{}", days, step),
                None => days.into_owned(),
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Bring an expression into the seconds-first form the cron parser expects
fn normalize_cron(expression: &str) -> Option<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => Some(format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            crontab_weekdays(fields[4])
        )),
        6 | 7 => Some(fields.join(" ")),
        _ => None,
    }
}

impl Trigger {
    /// Parse a cron expression
    pub fn cron(expression: &str) -> Result<Self, String> {
        let normalized = normalize_cron(expression)
            .ok_or_else(|| format!("expected 5, 6 or 7 fields in '{}'", expression))?;
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| e.to_string())?;
        Ok(Self::Cron {
            expression: expression.trim().to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// Validated trigger for a configured schedule
    ///
    /// Anything invalid falls back to daily 03:00 with a warning, so a typo
    /// never leaves the job unregistered.
    pub fn from_spec(spec: &ScheduleSpec) -> Self {
        match spec {
            ScheduleSpec::Cron(expression) => Self::cron(expression).unwrap_or_else(|e| {
                warn!(
                    "Invalid cron expression '{}' ({}); falling back to {}",
                    expression,
                    e,
                    Self::default()
                );
                Self::default()
            }),
            ScheduleSpec::Daily { hour, minute } if *hour < 24 && *minute < 60 => Self::Daily {
                hour: *hour,
                minute: *minute,
            },
            ScheduleSpec::Daily { hour, minute } => {
                warn!(
                    "Invalid schedule time {}:{}; falling back to {}",
                    hour,
                    minute,
                    Self::default()
                );
                Self::default()
            }
        }
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        match self {
            Trigger::Cron { schedule, .. } => schedule.after(&after).next(),
            Trigger::Daily { hour, minute } => {
                let time = NaiveTime::from_hms_opt(*hour, *minute, 0)?;
                // Two days covers a wall-clock time skipped by a DST jump
                (0..=2).find_map(|offset| {
                    let date = after.date_naive() + Duration::days(offset);
                    Local
                        .from_local_datetime(&date.and_time(time))
                        .earliest()
                        .filter(|candidate| *candidate > after)
                })
            }
        }
    }

    /// Whether this is the fallback daily 03:00 trigger
    pub fn is_default(&self) -> bool {
        matches!(
            self,
            Trigger::Daily { hour, minute } if *hour == DEFAULT_HOUR && *minute == DEFAULT_MINUTE
        )
    }
}

/// Work invoked on every fire
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    async fn run(&self);
}

struct JobSlot {
    key: &'static str,
    trigger: Trigger,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owner of the single recurring job
pub struct Scheduler {
    job: Arc<dyn ScheduledJob>,
    slot: Mutex<Option<JobSlot>>,
    /// Timers of replaced triggers that may still be finishing a run
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(job: Arc<dyn ScheduledJob>) -> Self {
        Self {
            job,
            slot: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Replace the job's trigger, cancelling the previous timer
    ///
    /// A run started by the previous trigger keeps going until it returns.
    /// Must be called from within a Tokio runtime.
    pub fn replace(&self, trigger: Trigger) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.take() {
            old.cancel.cancel();
            debug!("Removed job {} ({})", old.key, old.trigger);
            let mut retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());
            retired.retain(|handle| !handle.is_finished());
            retired.push(old.handle);
        }

        info!("Scheduled job {}: {}", JOB_KEY, trigger);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_trigger(
            trigger.clone(),
            self.job.clone(),
            cancel.clone(),
        ));
        *slot = Some(JobSlot {
            key: JOB_KEY,
            trigger,
            cancel,
            handle,
        });
    }

    /// Bind the job to a configured schedule; returns the effective trigger
    pub fn update_schedule(&self, spec: &ScheduleSpec) -> Trigger {
        let trigger = Trigger::from_spec(spec);
        self.replace(trigger.clone());
        trigger
    }

    /// Key and trigger of the registered job, if any
    pub fn current(&self) -> Option<(&'static str, Trigger)> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .map(|slot| (slot.key, slot.trigger.clone()))
    }

    /// Cancel the job and wait for any run in progress to finish
    pub async fn shutdown(&self) {
        let handles = {
            let mut handles =
                std::mem::take(&mut *self.retired.lock().unwrap_or_else(|e| e.into_inner()));
            let current = self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(old) = current {
                old.cancel.cancel();
                info!("Stopped job {}", old.key);
                handles.push(old.handle);
            }
            handles
        };

        for handle in handles {
            if !handle.is_finished() {
                info!("Waiting for the running backup to finish");
            }
            if let Err(e) = handle.await {
                warn!("Scheduled job ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Timers stop; a run in progress still completes on the runtime
        let slot = self.slot.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.take() {
            old.cancel.cancel();
        }
    }
}

async fn run_trigger(trigger: Trigger, job: Arc<dyn ScheduledJob>, cancel: CancellationToken) {
    let mut last_fire: Option<DateTime<Local>> = None;
    loop {
        let now = Local::now();
        // Never fire twice for the same instant if the timer wakes early
        let from = last_fire.map_or(now, |last| last.max(now));
        let Some(next) = trigger.next_after(from) else {
            warn!("Schedule {} has no future fire time; job idle", trigger);
            return;
        };
        debug!("Next backup at {}", next.format("%Y-%m-%d %H:%M:%S"));

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        info!("Scheduled backup triggered");
        job.run().await;
        last_fire = Some(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(y, m, d)
                    .unwrap()
                    .and_hms_opt(h, min, 0)
                    .unwrap(),
            )
            .earliest()
            .unwrap()
    }

    #[derive(Default)]
    struct CountingJob {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        async fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_crontab_expression_fires_daily_at_three() {
        let trigger = Trigger::from_spec(&ScheduleSpec::Cron("0 3 * * *".into()));
        assert!(matches!(trigger, Trigger::Cron { .. }));

        let next = trigger.next_after(local(2024, 1, 10, 10, 0)).unwrap();
        assert_eq!(next, local(2024, 1, 11, 3, 0));
        let after = trigger.next_after(next).unwrap();
        assert_eq!(after, local(2024, 1, 12, 3, 0));
    }

    #[test]
    fn test_invalid_cron_falls_back_to_default() {
        let trigger = Trigger::from_spec(&ScheduleSpec::Cron("not-a-cron".into()));
        assert!(trigger.is_default());
        let next = trigger.next_after(local(2024, 1, 10, 10, 0)).unwrap();
        assert_eq!((next.hour(), next.minute()), (3, 0));
    }

    #[test]
    fn test_seconds_field_expressions() {
        let trigger = Trigger::cron("30 15 2 * * *").unwrap();
        let next = trigger.next_after(local(2024, 1, 10, 10, 0)).unwrap();
        assert_eq!(next.second(), 30);
        assert_eq!((next.hour(), next.minute()), (2, 15));
    }

    #[test]
    fn test_crontab_weekday_numbering() {
        assert_eq!(crontab_weekdays("*"), "*");
        assert_eq!(crontab_weekdays("0"), "1");
        assert_eq!(crontab_weekdays("7"), "1");
        assert_eq!(crontab_weekdays("1-5"), "2-6");
        assert_eq!(crontab_weekdays("*/2"), "*/2");
        assert_eq!(crontab_weekdays("0,6"), "1,7");
        assert_eq!(crontab_weekdays("MON"), "MON");

        // Sunday 04:00: 2024-01-14 is a Sunday
        let trigger = Trigger::cron("0 4 * * 0").unwrap();
        let next = trigger.next_after(local(2024, 1, 10, 10, 0)).unwrap();
        assert_eq!(next, local(2024, 1, 14, 4, 0));
    }

    #[test]
    fn test_daily_trigger() {
        let trigger = Trigger::from_spec(&ScheduleSpec::Daily { hour: 4, minute: 30 });
        assert_eq!(
            trigger.next_after(local(2024, 1, 10, 3, 0)).unwrap(),
            local(2024, 1, 10, 4, 30)
        );
        assert_eq!(
            trigger.next_after(local(2024, 1, 10, 4, 30)).unwrap(),
            local(2024, 1, 11, 4, 30)
        );
    }

    #[test]
    fn test_invalid_daily_falls_back() {
        let trigger = Trigger::from_spec(&ScheduleSpec::Daily { hour: 24, minute: 0 });
        assert!(trigger.is_default());
    }

    #[test]
    fn test_display() {
        assert_eq!(Trigger::default().to_string(), "daily at 03:00");
        assert_eq!(
            Trigger::cron("0 3 * * *").unwrap().to_string(),
            "cron '0 3 * * *'"
        );
    }

    #[tokio::test]
    async fn test_invalid_cron_still_registers_job() {
        let scheduler = Scheduler::new(Arc::new(CountingJob::default()));
        let trigger = scheduler.update_schedule(&ScheduleSpec::Cron("not-a-cron".into()));
        assert!(trigger.is_default());

        let (key, current) = scheduler.current().unwrap();
        assert_eq!(key, JOB_KEY);
        assert!(current.is_default());
    }

    #[tokio::test]
    async fn test_replace_keeps_a_single_slot() {
        let scheduler = Scheduler::new(Arc::new(CountingJob::default()));
        scheduler.update_schedule(&ScheduleSpec::default());
        scheduler.update_schedule(&ScheduleSpec::Cron("15 1 * * *".into()));

        let (_, current) = scheduler.current().unwrap();
        assert_eq!(current.to_string(), "cron '15 1 * * *'");

        scheduler.shutdown().await;
        assert!(scheduler.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_fires_on_schedule() {
        let job = Arc::new(CountingJob::default());
        let scheduler = Scheduler::new(job.clone());
        scheduler.replace(Trigger::default());

        // The wall clock stands still under a paused runtime, so each wait is
        // measured from the same instant; five virtual days covers two fires
        tokio::time::sleep(std::time::Duration::from_secs(5 * 24 * 3600)).await;
        assert!(job.runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_trigger_stops_firing() {
        let job = Arc::new(CountingJob::default());
        let scheduler = Scheduler::new(job.clone());
        scheduler.replace(Trigger::default());
        scheduler.shutdown().await;

        tokio::time::sleep(std::time::Duration::from_secs(3 * 24 * 3600)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }

    /// Job that stays busy long enough to be caught mid-run
    #[derive(Default)]
    struct SlowJob {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl ScheduledJob for SlowJob {
        async fn run(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_until_started(job: &SlowJob) {
        while job.started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_change_lets_running_job_finish() {
        let job = Arc::new(SlowJob::default());
        let scheduler = Scheduler::new(job.clone());
        scheduler.replace(Trigger::cron("* * * * * *").unwrap());
        wait_until_started(&job).await;

        scheduler.update_schedule(&ScheduleSpec::default());
        tokio::time::sleep(std::time::Duration::from_secs(4)).await;

        assert_eq!(job.started.load(Ordering::SeqCst), 1);
        assert_eq!(job.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_running_job() {
        let job = Arc::new(SlowJob::default());
        let scheduler = Scheduler::new(job.clone());
        scheduler.replace(Trigger::cron("* * * * * *").unwrap());
        wait_until_started(&job).await;

        scheduler.shutdown().await;

        assert_eq!(job.finished.load(Ordering::SeqCst), 1);
        assert!(scheduler.current().is_none());
    }
}
