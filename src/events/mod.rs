//! Event-source collaborator.
//!
//! Upstream handlers describe what happened as [`BotEvent`]s; [`apply_event`]
//! turns each one into store mutations. [`stdio`] feeds events from a
//! newline-delimited JSON stream.

pub mod stdio;

pub use stdio::{EventSourceStats, run_event_source};

use crate::state::{
    ActivitySessions, ChannelId, CreatedChildren, RuntimeStateStore, SessionDescriptor, Timers,
    TimerDescriptor, UserId, VoiceSessions,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Which session category an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Activity,
    Voice,
}

/// Something that happened upstream and touches runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotEvent {
    ChildChannelCreated {
        parent_id: ChannelId,
        child_id: ChannelId,
    },
    ChildChannelDeleted {
        parent_id: ChannelId,
        child_id: ChannelId,
    },
    TimerStarted {
        channel_id: ChannelId,
        owner_id: UserId,
        #[serde(default)]
        label: String,
        duration_secs: u64,
    },
    TimerCancelled {
        channel_id: ChannelId,
    },
    SessionStarted {
        kind: SessionKind,
        user_id: UserId,
        #[serde(default)]
        channel_id: Option<ChannelId>,
        #[serde(default)]
        detail: Option<String>,
    },
    SessionEnded {
        kind: SessionKind,
        user_id: UserId,
    },
}

/// Whether applying an event changed the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    Unchanged,
}

impl From<bool> for EventOutcome {
    fn from(changed: bool) -> Self {
        if changed { Self::Applied } else { Self::Unchanged }
    }
}

/// Apply `event` to the store using the current time.
pub fn apply_event(store: &RuntimeStateStore, event: BotEvent) -> EventOutcome {
    apply_event_at(store, event, Utc::now())
}

/// Apply `event` as if it happened at `now`.
pub fn apply_event_at(
    store: &RuntimeStateStore,
    event: BotEvent,
    now: DateTime<Utc>,
) -> EventOutcome {
    match event {
        BotEvent::ChildChannelCreated {
            parent_id,
            child_id,
        } => {
            let mut inserted = false;
            store.update::<CreatedChildren, _>(parent_id, |children| {
                let mut children = children.unwrap_or_default();
                inserted = children.insert(child_id);
                Some(children)
            });
            inserted.into()
        }
        BotEvent::ChildChannelDeleted {
            parent_id,
            child_id,
        } => {
            let mut removed = false;
            store.update::<CreatedChildren, _>(parent_id, |children| {
                let mut children = children?;
                removed = children.remove(&child_id);
                // The last child takes its parent entry with it.
                (!children.is_empty()).then_some(children)
            });
            removed.into()
        }
        BotEvent::TimerStarted {
            channel_id,
            owner_id,
            label,
            duration_secs,
        } => {
            let expires_at = i64::try_from(duration_secs)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .and_then(|duration| now.checked_add_signed(duration))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            store.upsert::<Timers>(
                channel_id,
                TimerDescriptor {
                    owner_id,
                    label,
                    started_at: now,
                    expires_at,
                },
            );
            EventOutcome::Applied
        }
        BotEvent::TimerCancelled { channel_id } => {
            store.remove::<Timers>(channel_id).is_some().into()
        }
        BotEvent::SessionStarted {
            kind,
            user_id,
            channel_id,
            detail,
        } => {
            let session = SessionDescriptor {
                started_at: now,
                channel_id,
                detail,
            };
            match kind {
                SessionKind::Activity => store.upsert::<ActivitySessions>(user_id, session),
                SessionKind::Voice => store.upsert::<VoiceSessions>(user_id, session),
            }
            EventOutcome::Applied
        }
        BotEvent::SessionEnded { kind, user_id } => {
            let removed = match kind {
                SessionKind::Activity => store.remove::<ActivitySessions>(user_id).is_some(),
                SessionKind::Voice => store.remove::<VoiceSessions>(user_id).is_some(),
            };
            removed.into()
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::state::persist::MemoryPersistence;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    async fn store() -> RuntimeStateStore {
        let store = RuntimeStateStore::new(Arc::new(MemoryPersistence::new()), Duration::from_secs(5));
        store.initialize().await;
        store
    }

    #[test]
    fn events_use_snake_case_type_tags() {
        let event: BotEvent = serde_json::from_str(
            r#"{"type":"session_started","kind":"voice","user_id":7,"channel_id":9}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            BotEvent::SessionStarted {
                kind: SessionKind::Voice,
                user_id: 7,
                channel_id: Some(9),
                detail: None,
            }
        );

        let encoded = serde_json::to_value(BotEvent::TimerCancelled { channel_id: 3 }).unwrap();
        assert_eq!(encoded["type"], "timer_cancelled");
    }

    #[tokio::test]
    async fn child_channels_accumulate_and_drain() {
        let store = store().await;
        let created = |child_id| BotEvent::ChildChannelCreated {
            parent_id: 1,
            child_id,
        };

        assert_eq!(apply_event(&store, created(10)), EventOutcome::Applied);
        assert_eq!(apply_event(&store, created(11)), EventOutcome::Applied);
        assert_eq!(apply_event(&store, created(11)), EventOutcome::Unchanged);
        assert_eq!(
            store.get_entry::<CreatedChildren>(1),
            Some(HashSet::from([10, 11]))
        );

        for child_id in [10, 11] {
            let outcome = apply_event(
                &store,
                BotEvent::ChildChannelDeleted {
                    parent_id: 1,
                    child_id,
                },
            );
            assert_eq!(outcome, EventOutcome::Applied);
        }
        assert_eq!(store.get_entry::<CreatedChildren>(1), None);
    }

    #[tokio::test]
    async fn deleting_unknown_child_changes_nothing() {
        let store = store().await;
        let outcome = apply_event(
            &store,
            BotEvent::ChildChannelDeleted {
                parent_id: 1,
                child_id: 2,
            },
        );
        assert_eq!(outcome, EventOutcome::Unchanged);
        assert!(!store.is_dirty());
    }

    #[tokio::test]
    async fn timer_expiry_is_start_plus_duration() {
        let store = store().await;
        let now = Utc::now();
        apply_event_at(
            &store,
            BotEvent::TimerStarted {
                channel_id: 4,
                owner_id: 8,
                label: "raid".to_owned(),
                duration_secs: 90,
            },
            now,
        );

        let timer = store.get_entry::<Timers>(4).unwrap();
        assert_eq!(timer.started_at, now);
        assert_eq!(timer.expires_at, now + TimeDelta::seconds(90));

        assert_eq!(
            apply_event(&store, BotEvent::TimerCancelled { channel_id: 4 }),
            EventOutcome::Applied
        );
        assert_eq!(
            apply_event(&store, BotEvent::TimerCancelled { channel_id: 4 }),
            EventOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn huge_timer_duration_saturates() {
        let store = store().await;
        apply_event(
            &store,
            BotEvent::TimerStarted {
                channel_id: 1,
                owner_id: 1,
                label: String::new(),
                duration_secs: u64::MAX,
            },
        );
        assert_eq!(
            store.get_entry::<Timers>(1).unwrap().expires_at,
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[tokio::test]
    async fn session_kinds_target_their_own_category() {
        let store = store().await;
        apply_event(
            &store,
            BotEvent::SessionStarted {
                kind: SessionKind::Activity,
                user_id: 5,
                channel_id: None,
                detail: Some("chess".to_owned()),
            },
        );

        assert!(store.get_entry::<ActivitySessions>(5).is_some());
        assert!(store.get_entry::<VoiceSessions>(5).is_none());
        assert_eq!(
            apply_event(
                &store,
                BotEvent::SessionEnded {
                    kind: SessionKind::Voice,
                    user_id: 5
                }
            ),
            EventOutcome::Unchanged
        );
        assert_eq!(
            apply_event(
                &store,
                BotEvent::SessionEnded {
                    kind: SessionKind::Activity,
                    user_id: 5
                }
            ),
            EventOutcome::Applied
        );
    }
}
