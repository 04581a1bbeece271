//! Newline-delimited JSON event reader.

use crate::events::{BotEvent, EventOutcome, apply_event};
use crate::state::RuntimeStateStore;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counters for one event-source run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSourceStats {
    pub applied: u64,
    pub unchanged: u64,
    pub malformed: u64,
}

/// Apply one JSON [`BotEvent`] per line until EOF or cancellation.
///
/// Blank lines are ignored; lines that do not parse, including lines that
/// are not UTF-8, are logged and skipped.
pub async fn run_event_source<R>(
    mut reader: R,
    store: &RuntimeStateStore,
    cancel: CancellationToken,
) -> crate::Result<EventSourceStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = EventSourceStats::default();
    let mut line = Vec::new();

    loop {
        line.clear();
        let bytes_read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("event source cancelled");
                break;
            }
            read = reader.read_until(b'\n', &mut line) => read?,
        };
        if bytes_read == 0 {
            info!("event source reached end of input");
            break;
        }

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        let event: BotEvent = match serde_json::from_slice(trimmed) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    error = %e,
                    raw_line = %String::from_utf8_lossy(trimmed),
                    "skipping malformed event"
                );
                stats.malformed += 1;
                continue;
            }
        };

        match apply_event(store, event) {
            EventOutcome::Applied => stats.applied += 1,
            EventOutcome::Unchanged => stats.unchanged += 1,
        }
    }

    info!(
        applied = stats.applied,
        unchanged = stats.unchanged,
        malformed = stats.malformed,
        "event source finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::state::persist::MemoryPersistence;
    use crate::state::{Timers, VoiceSessions};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, BufReader};

    async fn store() -> RuntimeStateStore {
        let store = RuntimeStateStore::new(Arc::new(MemoryPersistence::new()), Duration::from_secs(5));
        store.initialize().await;
        store
    }

    #[tokio::test]
    async fn applies_lines_and_skips_garbage() {
        let store = store().await;
        let input = concat!(
            r#"{"type":"timer_started","channel_id":1,"owner_id":2,"duration_secs":60}"#,
            "\n\n",
            "not json\n",
            r#"{"type":"timer_cancelled","channel_id":99}"#,
            "\n",
            r#"{"type":"session_started","kind":"voice","user_id":3}"#,
        );

        let stats = run_event_source(input.as_bytes(), &store, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            stats,
            EventSourceStats {
                applied: 2,
                unchanged: 1,
                malformed: 1
            }
        );
        assert!(store.get_entry::<Timers>(1).is_some());
        assert!(store.get_entry::<VoiceSessions>(3).is_some());
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_skipped() {
        let store = store().await;
        let mut input = b"\xff\xfe garbage\n".to_vec();
        input.extend_from_slice(br#"{"type":"session_started","kind":"voice","user_id":3}"#);
        input.push(b'\n');

        let stats = run_event_source(input.as_slice(), &store, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.applied, 1);
        assert!(store.get_entry::<VoiceSessions>(3).is_some());
    }

    #[tokio::test]
    async fn stops_on_cancel_while_input_stays_open() {
        let store = store().await;
        let (client, server) = tokio::io::duplex(256);
        let cancel = CancellationToken::new();

        let mut writer = client;
        writer
            .write_all(b"{\"type\":\"timer_cancelled\",\"channel_id\":1}\n")
            .await
            .unwrap();

        let token = cancel.clone();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let stats = run_event_source(BufReader::new(server), &store, cancel)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(stats.unchanged, 1);
        drop(writer);
    }
}
