//! Volatile runtime state that must survive restarts.
//!
//! The [`RuntimeStateSnapshot`] holds four independent categories keyed by
//! platform identifiers. It is owned exclusively by
//! [`RuntimeStateStore`](store::RuntimeStateStore); every other component
//! reads copies and mutates through the store's operations.
//!
//! Categories are addressed by type rather than by name:
//!
//! ```rust,ignore
//! use tether::state::{Timers, store::RuntimeStateStore};
//! let timers = store.get::<Timers>();
//! store.remove::<Timers>(channel_id);
//! ```

pub mod persist;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub use store::RuntimeStateStore;

/// Platform channel identifier.
pub type ChannelId = u64;

/// Platform user identifier.
pub type UserId = u64;

/// A countdown attached to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerDescriptor {
    /// User who started the timer.
    pub owner_id: UserId,
    /// Free-form label shown when the timer fires.
    #[serde(default)]
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TimerDescriptor {
    /// Whether the timer has fired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// An activity or voice session a user currently has open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub started_at: DateTime<Utc>,
    /// Channel the session is bound to, if any.
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    /// Free-form detail (game title, activity name).
    #[serde(default)]
    pub detail: Option<String>,
}

/// Complete in-memory representation of all tracked runtime state.
///
/// This is also the unit written to durable storage. Map keys serialize as
/// decimal strings in JSON and decode back to the same integers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeStateSnapshot {
    /// Parent channel -> child channels created on its behalf.
    pub created_children: HashMap<ChannelId, HashSet<ChannelId>>,
    /// Channel -> running timer.
    pub timers: HashMap<ChannelId, TimerDescriptor>,
    /// User -> open activity session.
    pub activity_sessions: HashMap<UserId, SessionDescriptor>,
    /// User -> open voice session.
    pub voice_sessions: HashMap<UserId, SessionDescriptor>,
    /// Time of the last successful durable write.
    pub last_saved: Option<DateTime<Utc>>,
}

impl RuntimeStateSnapshot {
    /// Total number of entries across all categories.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.created_children.len()
            + self.timers.len()
            + self.activity_sessions.len()
            + self.voice_sessions.len()
    }
}

/// A keyed category inside [`RuntimeStateSnapshot`].
///
/// Implemented by uninhabited marker types so categories can only be used
/// as type parameters.
pub trait StateCategory: 'static {
    /// Value stored per key.
    type Value: Clone + PartialEq + Send + Sync + 'static;

    /// Stable category name used in logs.
    const NAME: &'static str;

    fn entries(snapshot: &RuntimeStateSnapshot) -> &HashMap<u64, Self::Value>;

    fn entries_mut(snapshot: &mut RuntimeStateSnapshot) -> &mut HashMap<u64, Self::Value>;
}

/// Child channels created per parent channel.
#[derive(Debug)]
pub enum CreatedChildren {}

/// Running channel timers.
#[derive(Debug)]
pub enum Timers {}

/// Open activity sessions per user.
#[derive(Debug)]
pub enum ActivitySessions {}

/// Open voice sessions per user.
#[derive(Debug)]
pub enum VoiceSessions {}

impl StateCategory for CreatedChildren {
    type Value = HashSet<ChannelId>;
    const NAME: &'static str = "created_children";

    fn entries(snapshot: &RuntimeStateSnapshot) -> &HashMap<u64, Self::Value> {
        &snapshot.created_children
    }

    fn entries_mut(snapshot: &mut RuntimeStateSnapshot) -> &mut HashMap<u64, Self::Value> {
        &mut snapshot.created_children
    }
}

impl StateCategory for Timers {
    type Value = TimerDescriptor;
    const NAME: &'static str = "timers";

    fn entries(snapshot: &RuntimeStateSnapshot) -> &HashMap<u64, Self::Value> {
        &snapshot.timers
    }

    fn entries_mut(snapshot: &mut RuntimeStateSnapshot) -> &mut HashMap<u64, Self::Value> {
        &mut snapshot.timers
    }
}

impl StateCategory for ActivitySessions {
    type Value = SessionDescriptor;
    const NAME: &'static str = "activity_sessions";

    fn entries(snapshot: &RuntimeStateSnapshot) -> &HashMap<u64, Self::Value> {
        &snapshot.activity_sessions
    }

    fn entries_mut(snapshot: &mut RuntimeStateSnapshot) -> &mut HashMap<u64, Self::Value> {
        &mut snapshot.activity_sessions
    }
}

impl StateCategory for VoiceSessions {
    type Value = SessionDescriptor;
    const NAME: &'static str = "voice_sessions";

    fn entries(snapshot: &RuntimeStateSnapshot) -> &HashMap<u64, Self::Value> {
        &snapshot.voice_sessions
    }

    fn entries_mut(snapshot: &mut RuntimeStateSnapshot) -> &mut HashMap<u64, Self::Value> {
        &mut snapshot.voice_sessions
    }
}
