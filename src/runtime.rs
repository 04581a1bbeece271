//! Process wiring.
//!
//! [`BotRuntime`] builds the state store, the recurring jobs, the trigger
//! listener and the optional event source from a [`BotConfig`], runs them
//! until the shared [`CancellationToken`] fires, and then drains everything
//! before writing the final snapshot.

use crate::config::{BotConfig, ConfigIssueSeverity, validate_config};
use crate::error::{BotError, Result};
use crate::events::run_event_source;
use crate::feed::{ExternalFeed, HttpFeed};
use crate::ingest::IngestionListener;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::scheduler::builtin_tasks;
use crate::state::RuntimeStateStore;
use crate::state::persist::{JsonFilePersistence, StatePersistence};
use crate::workflow::{SubmissionWorkflow, Workflow};
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, error, info, info_span, warn};

type EventReader = Box<dyn AsyncBufRead + Unpin + Send>;

/// Configured but not yet running bot process.
///
/// Collaborators not supplied through the `with_*` methods are built from
/// the configuration.
pub struct BotRuntime {
    config: BotConfig,
    persistence: Option<Arc<dyn StatePersistence>>,
    notifier: Option<Arc<dyn Notifier>>,
    workflow: Option<Arc<dyn Workflow>>,
    feed: Option<Arc<dyn ExternalFeed>>,
    event_source: Option<EventReader>,
}

impl std::fmt::Debug for BotRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotRuntime")
            .field("config", &self.config)
            .field("event_source", &self.event_source.is_some())
            .finish_non_exhaustive()
    }
}

impl BotRuntime {
    pub fn new(config: BotConfig) -> Self {
        Self {
            config,
            persistence: None,
            notifier: None,
            workflow: None,
            feed: None,
            event_source: None,
        }
    }

    /// Replace the JSON state file with another persistence backend.
    pub fn with_persistence(mut self, persistence: Arc<dyn StatePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_workflow(mut self, workflow: Arc<dyn Workflow>) -> Self {
        self.workflow = Some(workflow);
        self
    }

    /// Use `feed` for the feed sync job instead of the configured URL.
    pub fn with_feed(mut self, feed: Arc<dyn ExternalFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Apply newline-delimited JSON events read from `reader`.
    pub fn with_event_source<R>(mut self, reader: R) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        self.event_source = Some(Box::new(reader));
        self
    }

    /// Run until `cancel` fires.
    ///
    /// On shutdown the listener stops accepting, jobs finish their current
    /// tick, and the snapshot is written one last time. A failure of that
    /// final write is returned.
    ///
    /// # Errors
    ///
    /// Fails before starting anything when the configuration has errors or
    /// the listener cannot bind.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        check_config(&self.config)?;
        let Self {
            config,
            persistence,
            notifier,
            workflow,
            feed,
            event_source,
        } = self;

        let persistence = persistence.unwrap_or_else(|| {
            Arc::new(JsonFilePersistence::new(config.state.path.clone())) as Arc<dyn StatePersistence>
        });
        let notifier: Arc<dyn Notifier> = match (notifier, &config.notifier.webhook_url) {
            (Some(notifier), _) => notifier,
            (None, Some(url)) => Arc::new(WebhookNotifier::new(url.clone())),
            (None, None) => Arc::new(LogNotifier),
        };
        let workflow = workflow.unwrap_or_else(|| {
            Arc::new(SubmissionWorkflow::new(Arc::clone(&notifier))) as Arc<dyn Workflow>
        });
        let feed = feed.or_else(|| {
            config
                .scheduler
                .feed_sync
                .url
                .as_ref()
                .map(|url| Arc::new(HttpFeed::new(url.clone())) as Arc<dyn ExternalFeed>)
        });

        let store = Arc::new(RuntimeStateStore::new(persistence, config.state.debounce()));
        store.initialize().await;

        let listener = if config.ingest.enabled {
            Some(IngestionListener::bind(&config.ingest, workflow).await?)
        } else {
            info!("ingestion listener disabled");
            None
        };

        let tracker = TaskTracker::new();
        let persister = store.spawn_persister(cancel.clone());

        if let Some(listener) = listener {
            let cancel = cancel.clone();
            tracker.spawn(async move {
                if let Err(e) = listener.run(cancel).await {
                    error!(error = %e, "ingestion listener stopped with error");
                }
            });
        }

        if let Some(reader) = event_source {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            tracker.spawn(
                async move {
                    if let Err(e) = run_event_source(reader, &store, cancel).await {
                        error!(error = %e, "event source failed");
                    }
                }
                .instrument(info_span!("event_source")),
            );
        }

        let tasks: Vec<_> = builtin_tasks(&config.scheduler, &store, &notifier, feed)
            .into_iter()
            .map(|task| task.spawn(cancel.clone()))
            .collect();
        info!(tasks = tasks.len(), "runtime started");

        cancel.cancelled().await;
        info!("shutdown requested; draining");

        for handle in tasks {
            let name = handle.name().to_owned();
            match handle.join().await {
                Ok(status) => info!(
                    task = %name,
                    ticks = status.ticks,
                    failures = status.failures,
                    "task stopped"
                ),
                Err(e) => warn!(error = %e, "task did not stop cleanly"),
            }
        }

        tracker.close();
        tracker.wait().await;
        if let Err(e) = persister.await {
            warn!(error = %e, "state persister did not stop cleanly");
        }

        let saved_at = store.save_now().await.map_err(|e| {
            error!(error = %e, "final state save failed");
            BotError::from(e)
        })?;
        info!(%saved_at, "runtime stopped");
        Ok(())
    }
}

/// Log every configuration issue and refuse to start on errors.
fn check_config(config: &BotConfig) -> Result<()> {
    let issues = validate_config(config);
    let mut errors = 0usize;
    for issue in &issues {
        match issue.severity {
            ConfigIssueSeverity::Warning => warn!(id = %issue.id, "{}", issue.summary),
            ConfigIssueSeverity::Error => {
                error!(id = %issue.id, "{}", issue.summary);
                errors += 1;
            }
        }
    }
    if errors > 0 {
        return Err(BotError::Config(format!(
            "{errors} configuration error(s); see log for details"
        )));
    }
    Ok(())
}
