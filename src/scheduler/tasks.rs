//! Built-in recurring jobs.
//!
//! Jobs are plain [`RecurringTask`] configurations: each builder captures
//! its collaborators and returns a task ready to spawn.

use crate::config::{SchedulerConfig, SessionReaperConfig};
use crate::feed::{ExternalFeed, FeedTracker};
use crate::notify::{Notification, Notifier};
use crate::scheduler::runner::RecurringTask;
use crate::state::{
    ActivitySessions, RuntimeStateStore, SessionDescriptor, StateCategory, Timers, VoiceSessions,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Well-known job name for the expired timer sweep.
pub const TASK_TIMER_SWEEP: &str = "timer_sweep";

/// Well-known job name for stale session cleanup.
pub const TASK_SESSION_REAPER: &str = "session_reaper";

/// Well-known job name for the external feed refresh.
pub const TASK_FEED_SYNC: &str = "feed_sync";

/// Announce and drop timers that have run out.
pub fn timer_sweep_task(
    interval: Duration,
    store: Arc<RuntimeStateStore>,
    notifier: Arc<dyn Notifier>,
) -> RecurringTask {
    RecurringTask::new(TASK_TIMER_SWEEP, interval, move || {
        let store = Arc::clone(&store);
        let notifier = Arc::clone(&notifier);
        async move {
            sweep_expired_timers(&store, notifier.as_ref(), Utc::now())
                .await
                .map(|_| ())
        }
    })
}

/// Notify about every expired timer and remove it.
///
/// A timer whose notification fails stays in place for the next sweep.
/// Returns the number of timers removed.
pub async fn sweep_expired_timers(
    store: &RuntimeStateStore,
    notifier: &dyn Notifier,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let mut expired: Vec<_> = store
        .get::<Timers>()
        .into_iter()
        .filter(|(_, timer)| timer.is_expired(now))
        .collect();
    expired.sort_by_key(|(channel_id, _)| *channel_id);

    let mut removed = 0usize;
    let mut failed = 0usize;
    for (channel_id, timer) in expired {
        let notification = Notification::TimerExpired {
            channel_id,
            owner_id: timer.owner_id,
            label: timer.label.clone(),
        };
        if let Err(e) = notifier.notify(&notification).await {
            warn!(channel_id, error = %e, "cannot announce expired timer");
            failed += 1;
            continue;
        }
        if store
            .remove_if::<Timers, _>(channel_id, |current| *current == timer)
            .is_some()
        {
            removed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} expired timer notification(s) failed; {removed} timer(s) cleared");
    }
    if removed > 0 {
        info!(removed, "expired timers cleared");
    }
    Ok(removed)
}

/// Drop sessions that outlived their category's maximum age.
pub fn session_reaper_task(
    config: &SessionReaperConfig,
    store: Arc<RuntimeStateStore>,
) -> RecurringTask {
    let activity_max_age = max_age(config.activity_max_age_secs);
    let voice_max_age = max_age(config.voice_max_age_secs);
    RecurringTask::new(TASK_SESSION_REAPER, config.interval(), move || {
        let store = Arc::clone(&store);
        async move {
            let now = Utc::now();
            let activity = reap_sessions::<ActivitySessions>(&store, now, activity_max_age);
            let voice = reap_sessions::<VoiceSessions>(&store, now, voice_max_age);
            if activity + voice > 0 {
                info!(activity, voice, "stale sessions reaped");
            }
            Ok(())
        }
    })
}

fn max_age(secs: u64) -> chrono::TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::TimeDelta::try_seconds)
        .unwrap_or(chrono::TimeDelta::MAX)
}

/// Remove sessions of one category started more than `max_age` before `now`.
pub fn reap_sessions<C>(
    store: &RuntimeStateStore,
    now: DateTime<Utc>,
    max_age: chrono::Duration,
) -> usize
where
    C: StateCategory<Value = SessionDescriptor>,
{
    let Some(cutoff) = now.checked_sub_signed(max_age) else {
        return 0;
    };
    let mut reaped = 0usize;
    for (user_id, stale) in store.get::<C>() {
        if stale.started_at >= cutoff {
            continue;
        }
        if store
            .remove_if::<C, _>(user_id, |current| *current == stale)
            .is_some()
        {
            reaped += 1;
        }
    }
    reaped
}

/// Refresh the external feed, then announce values that changed.
///
/// Both steps share the tick's failure boundary: when the refresh fails the
/// announcement step does not run and the baseline is left untouched.
pub fn feed_sync_task(
    interval: Duration,
    feed: Arc<dyn ExternalFeed>,
    notifier: Arc<dyn Notifier>,
) -> RecurringTask {
    let tracker = Arc::new(Mutex::new(FeedTracker::new()));
    RecurringTask::new(TASK_FEED_SYNC, interval, move || {
        let feed = Arc::clone(&feed);
        let notifier = Arc::clone(&notifier);
        let tracker = Arc::clone(&tracker);
        async move {
            let mut tracker = tracker.lock().await;
            sync_feed(feed.as_ref(), notifier.as_ref(), &mut tracker)
                .await
                .map(|_| ())
        }
    })
}

/// One feed sync pass. Returns the number of announced changes.
pub async fn sync_feed(
    feed: &dyn ExternalFeed,
    notifier: &dyn Notifier,
    tracker: &mut FeedTracker,
) -> anyhow::Result<usize> {
    let entries = feed.fetch().await.context("refreshing external feed")?;

    if !tracker.is_seeded() {
        tracker.commit(&entries);
        debug!(entries = entries.len(), "feed baseline seeded");
        return Ok(0);
    }

    let changes = tracker.diff(&entries);
    let mut announced = 0usize;
    for change in &changes {
        notifier
            .notify(&Notification::FeedChanged {
                key: change.key.clone(),
                previous: change.previous,
                current: change.current,
            })
            .await
            .with_context(|| format!("announcing feed change for {}", change.key))?;
        tracker.commit_change(change);
        announced += 1;
    }

    tracker.commit(&entries);
    Ok(announced)
}

/// Build every enabled built-in job.
///
/// The feed sync job is only built when a feed is supplied.
pub fn builtin_tasks(
    config: &SchedulerConfig,
    store: &Arc<RuntimeStateStore>,
    notifier: &Arc<dyn Notifier>,
    feed: Option<Arc<dyn ExternalFeed>>,
) -> Vec<RecurringTask> {
    let mut tasks = Vec::new();

    if config.timer_sweep.enabled {
        tasks.push(timer_sweep_task(
            config.timer_sweep.interval(),
            Arc::clone(store),
            Arc::clone(notifier),
        ));
    }

    if config.session_reaper.enabled {
        tasks.push(session_reaper_task(&config.session_reaper, Arc::clone(store)));
    }

    if config.feed_sync.enabled {
        match feed {
            Some(feed) => tasks.push(feed_sync_task(
                config.feed_sync.interval(),
                feed,
                Arc::clone(notifier),
            )),
            None => warn!("feed sync enabled but no feed is configured; skipping"),
        }
    }

    tasks
        .into_iter()
        .map(|task| task.with_stagger(config.stagger()))
        .collect()
}
