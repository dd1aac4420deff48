//! Downstream consumption of sync events.
//!
//! Delivery from the sync core is at-least-once, so the [`SinkWorker`]
//! collapses duplicates by dedup key before handing events to an
//! [`EventSink`]. A key is remembered only after the sink handled the event
//! successfully; failed events are logged and dropped without stopping the
//! worker.
//!
//! [`IndexingSink`] is the production sink: it persists each message,
//! classifies it and sends notifications for the configured label.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::mpsc;

use super::classification::Classifier;
use super::notification_service::Notifier;
use crate::domain::{DedupKey, EmailLabel, SyncEvent};
use crate::storage::queries::messages;
use crate::storage::Database;

/// Consumes sync events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Handles one event. Errors are logged by the worker and not retried.
    async fn handle(&self, event: &SyncEvent) -> anyhow::Result<()>;
}

/// Counters reported by a [`SinkWorker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Events read from the channel.
    pub received: u64,
    /// Events handled successfully.
    pub handled: u64,
    /// Events skipped as duplicates.
    pub duplicates: u64,
    /// Events whose handling failed.
    pub failed: u64,
}

/// Reads the sync channel and feeds an [`EventSink`], collapsing duplicates.
pub struct SinkWorker<S> {
    sink: S,
    recent: LruCache<DedupKey, ()>,
    stats: SinkStats,
}

impl<S: EventSink> SinkWorker<S> {
    /// Creates a worker remembering up to `capacity` recent dedup keys.
    pub fn new(sink: S, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            sink,
            recent: LruCache::new(capacity),
            stats: SinkStats::default(),
        }
    }

    /// Returns the counters so far.
    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    /// Handles one event unless its key was handled recently.
    pub async fn process(&mut self, event: SyncEvent) {
        self.stats.received += 1;
        let key = event.dedup_key();

        if self.recent.get(&key).is_some() {
            self.stats.duplicates += 1;
            tracing::debug!(key = %key, "Duplicate event collapsed");
            return;
        }

        match self.sink.handle(&event).await {
            Ok(()) => {
                self.recent.put(key, ());
                self.stats.handled += 1;
            }
            Err(e) => {
                self.stats.failed += 1;
                tracing::warn!(key = %key, error = %e, "Event handling failed");
            }
        }
    }

    /// Drains `events` until every sender is gone, then returns the counters.
    pub async fn run(mut self, mut events: mpsc::Receiver<SyncEvent>) -> SinkStats {
        while let Some(event) = events.recv().await {
            self.process(event).await;
        }

        tracing::info!(
            received = self.stats.received,
            handled = self.stats.handled,
            duplicates = self.stats.duplicates,
            failed = self.stats.failed,
            "Event sink drained"
        );
        self.stats
    }
}

/// Persists, classifies and notifies.
pub struct IndexingSink {
    db: Database,
    classifier: Option<Arc<dyn Classifier>>,
    notifier: Option<Arc<dyn Notifier>>,
    notify_label: EmailLabel,
}

impl IndexingSink {
    /// Creates a sink that only persists messages.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            classifier: None,
            notifier: None,
            notify_label: EmailLabel::Interested,
        }
    }

    /// Labels each new message with `classifier`.
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Sends notifications for messages labelled `label`.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>, label: EmailLabel) -> Self {
        self.notifier = Some(notifier);
        self.notify_label = label;
        self
    }

    /// Returns true when the stored copy already carries labels.
    async fn already_labelled(&self, event: &SyncEvent) -> anyhow::Result<bool> {
        let stored = messages::get(&self.db, &event.account_id, &event.message.id).await?;
        Ok(stored.is_some_and(|s| !s.labels.is_empty()))
    }
}

#[async_trait]
impl EventSink for IndexingSink {
    async fn handle(&self, event: &SyncEvent) -> anyhow::Result<()> {
        let message = &event.message;
        let is_new = messages::upsert(&self.db, message).await?;
        tracing::debug!(account_id = %event.account_id, message_id = %message.id, is_new, "Message indexed");

        let Some(classifier) = &self.classifier else {
            return Ok(());
        };

        // A redelivery of a message labelled in an earlier run is not re-notified.
        if !is_new && self.already_labelled(event).await? {
            return Ok(());
        }

        let label = match classifier.classify(message).await {
            Ok(label) => label,
            Err(e) => {
                tracing::warn!(message_id = %message.id, error = %e, "Classification failed");
                EmailLabel::NotInterested
            }
        };

        messages::set_labels(&self.db, &event.account_id, &message.id, &[label]).await?;
        tracing::info!(account_id = %event.account_id, message_id = %message.id, %label, "Message classified");

        if label == self.notify_label {
            if let Some(notifier) = &self.notifier {
                if let Err(e) = notifier.notify(message, label).await {
                    tracing::warn!(message_id = %message.id, error = %e, "Notification failed");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountId, Address, MessageId, NormalizedMessage};
    use crate::services::classification::MockClassifier;
    use crate::services::notification_service::MockNotifier;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn event(account: &str, id: &str) -> SyncEvent {
        SyncEvent::new(NormalizedMessage {
            id: MessageId::from(id),
            id_generated: false,
            account_id: AccountId::from(account),
            folder: "INBOX".to_string(),
            subject: "Hello".to_string(),
            from: Address::new("ann@example.com"),
            to: vec![],
            cc: vec![],
            body_text: "Body".to_string(),
            body_html: String::new(),
            date: Utc::now(),
            attachments: vec![],
        })
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
        fail_first: Mutex<bool>,
    }

    #[async_trait]
    impl EventSink for Arc<Recording> {
        async fn handle(&self, event: &SyncEvent) -> anyhow::Result<()> {
            let mut fail = self.fail_first.lock().unwrap();
            if *fail {
                *fail = false;
                anyhow::bail!("store unavailable");
            }
            self.seen.lock().unwrap().push(event.dedup_key().to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn collapses_duplicates() {
        let recording = Arc::new(Recording::default());
        let mut worker = SinkWorker::new(Arc::clone(&recording), 16);

        worker.process(event("a", "1")).await;
        worker.process(event("a", "1")).await;
        worker.process(event("b", "1")).await;

        assert_eq!(*recording.seen.lock().unwrap(), vec!["a/1", "b/1"]);
        assert_eq!(
            worker.stats(),
            SinkStats {
                received: 3,
                handled: 2,
                duplicates: 1,
                failed: 0,
            }
        );
    }

    #[tokio::test]
    async fn failed_events_are_not_remembered() {
        let recording = Arc::new(Recording::default());
        *recording.fail_first.lock().unwrap() = true;
        let mut worker = SinkWorker::new(Arc::clone(&recording), 16);

        worker.process(event("a", "1")).await;
        worker.process(event("a", "1")).await;

        assert_eq!(*recording.seen.lock().unwrap(), vec!["a/1"]);
        assert_eq!(worker.stats().failed, 1);
        assert_eq!(worker.stats().handled, 1);
    }

    #[tokio::test]
    async fn run_drains_until_channel_closes() {
        let recording = Arc::new(Recording::default());
        let (tx, rx) = mpsc::channel(4);
        let worker = tokio::spawn(SinkWorker::new(Arc::clone(&recording), 16).run(rx));

        tx.send(event("a", "1")).await.unwrap();
        tx.send(event("a", "2")).await.unwrap();
        drop(tx);

        let stats = worker.await.unwrap();
        assert_eq!(stats.handled, 2);
    }

    #[tokio::test]
    async fn indexing_sink_notifies_on_label() {
        let db = Database::open_in_memory().await.unwrap();

        let mut classifier = MockClassifier::new();
        classifier
            .expect_classify()
            .times(1)
            .returning(|_| Ok(EmailLabel::Interested));

        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|_, label| *label == EmailLabel::Interested)
            .times(1)
            .returning(|_, _| Ok(()));

        let sink = IndexingSink::new(db.clone())
            .with_classifier(Arc::new(classifier))
            .with_notifier(Arc::new(notifier), EmailLabel::Interested);

        let event = event("a", "lead@example.com");
        sink.handle(&event).await.unwrap();
        // Redelivery of an already labelled message neither reclassifies nor notifies.
        sink.handle(&event).await.unwrap();

        let stored = messages::get(&db, &event.account_id, &event.message.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.labels, vec![EmailLabel::Interested]);
    }

    #[tokio::test]
    async fn indexing_sink_skips_notification_for_other_labels() {
        let db = Database::open_in_memory().await.unwrap();

        let mut classifier = MockClassifier::new();
        classifier
            .expect_classify()
            .returning(|_| Err(anyhow::anyhow!("model offline")));

        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();

        let sink = IndexingSink::new(db.clone())
            .with_classifier(Arc::new(classifier))
            .with_notifier(Arc::new(notifier), EmailLabel::Interested);

        let event = event("a", "meh@example.com");
        sink.handle(&event).await.unwrap();

        let stored = messages::get(&db, &event.account_id, &event.message.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.labels, vec![EmailLabel::NotInterested]);
    }
}
