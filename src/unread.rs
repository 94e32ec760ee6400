//! Unread message counter
//!
//! The counter is seeded from the authoritative `count_unread_messages` call
//! and then patched from message events: +1 for an incoming insert, -1
//! (floored at zero) when an incoming message's read instant goes from absent
//! to present. Incremental values are a latency optimization only; the monitor
//! periodically overwrites them with the authoritative count and logs drift.
//!
//! The feed carries every message row, so the monitor keeps the set of
//! threads the viewer takes part in and ignores messages of other threads.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::Result;
use crate::feed::{
    Change, ChangeFeed, ChangeKind, FeedSignal, Interest, Lifecycle, ScopeKey, SubscriptionSet,
};
use crate::metrics::SyncMetrics;
use crate::models::{Message, Thread, ThreadId, UserId};
use crate::retry::{retry_read, RetryPolicy};
use crate::schema::Table;

/// Badge text: nothing at zero, the number up to 99, then "99+".
#[must_use]
pub fn badge_label(count: u32) -> Option<String> {
    match count {
        0 => None,
        1..=99 => Some(count.to_string()),
        _ => Some("99+".to_string()),
    }
}

/// Pure incremental counter for one viewer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadCounter {
    viewer: UserId,
    value: u32,
}

impl UnreadCounter {
    /// Counter at zero
    #[must_use]
    pub const fn new(viewer: UserId) -> Self {
        Self { viewer, value: 0 }
    }

    /// Current value
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.value
    }

    /// Viewer whose unread messages are counted
    #[must_use]
    pub const fn viewer(&self) -> UserId {
        self.viewer
    }

    /// Install an authoritative value without drift accounting
    pub fn seed(&mut self, value: u32) {
        self.value = value;
    }

    /// Apply one message change. Returns true if the value moved.
    pub fn apply(&mut self, change: &Change<Message>) -> bool {
        match change {
            Change::Insert(message) if message.is_incoming_for(self.viewer) => {
                self.value = self.value.saturating_add(1);
                true
            }
            Change::Update { new, old } => {
                let was_read = old.as_ref().is_some_and(|m| m.read_at.is_some());
                let just_read =
                    !was_read && new.read_at.is_some() && new.is_incoming_for(self.viewer);
                if just_read && self.value > 0 {
                    self.value -= 1;
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Overwrite with the authoritative count; returns the drift if any.
    pub fn reconcile(&mut self, authoritative: u32) -> Option<i64> {
        let drift = i64::from(authoritative) - i64::from(self.value);
        self.value = authoritative;
        SyncMetrics::record_unread_reconciliation(authoritative, drift);
        if drift == 0 {
            None
        } else {
            warn!(
                viewer = %self.viewer,
                authoritative,
                drift,
                "Unread counter drifted from authoritative count"
            );
            Some(drift)
        }
    }
}

/// Live unread counter for the signed-in user.
///
/// Owns its feed subscription on scope `unread-<viewer>` and publishes the
/// current value on a watch channel.
pub struct UnreadMonitor {
    backend: Arc<dyn Backend>,
    feed: Arc<dyn ChangeFeed>,
    counter: UnreadCounter,
    threads: HashSet<ThreadId>,
    seeded: bool,
    scope: ScopeKey,
    subscriptions: SubscriptionSet,
    retry: RetryPolicy,
    lifecycle: Lifecycle,
    tx: watch::Sender<u32>,
}

impl UnreadMonitor {
    /// Seed from the authoritative count and attach to the feed.
    pub async fn mount(
        backend: Arc<dyn Backend>,
        feed: Arc<dyn ChangeFeed>,
        viewer: UserId,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let (tx, _) = watch::channel(0);
        let mut monitor = Self {
            backend,
            feed,
            counter: UnreadCounter::new(viewer),
            threads: HashSet::new(),
            seeded: false,
            scope: ScopeKey::new(format!("unread-{viewer}")),
            subscriptions: SubscriptionSet::new(),
            retry,
            lifecycle: Lifecycle::new(),
            tx,
        };
        monitor.resync().await?;
        monitor
            .subscriptions
            .open(
                monitor.feed.as_ref(),
                monitor.scope.clone(),
                vec![
                    Interest::on(Table::Threads, ChangeKind::Insert),
                    Interest::on(Table::Messages, ChangeKind::Insert),
                    Interest::on(Table::Messages, ChangeKind::Update),
                ],
            )
            .await?;
        info!(viewer = %viewer, value = monitor.counter.value(), "Unread monitor mounted");
        Ok(monitor)
    }

    /// Current value
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.counter.value()
    }

    /// Badge text for the current value
    #[must_use]
    pub fn badge(&self) -> Option<String> {
        badge_label(self.counter.value())
    }

    /// Receiver observing every value change
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<u32> {
        self.tx.subscribe()
    }

    /// Liveness token; ending it stops [`UnreadMonitor::run`]
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    /// Threads whose messages are counted
    #[must_use]
    pub fn tracks(&self, thread: ThreadId) -> bool {
        self.threads.contains(&thread)
    }

    /// Replace the thread set and the value with authoritative reads.
    pub async fn resync(&mut self) -> Result<Option<i64>> {
        let backend = Arc::clone(&self.backend);
        let viewer = self.counter.viewer();
        let threads = retry_read(&self.retry, "threads_for_user", || {
            backend.threads_for_user(viewer)
        })
        .await?;
        let authoritative = retry_read(&self.retry, "count_unread_messages", || {
            backend.count_unread_messages(viewer)
        })
        .await?;
        if !self.lifecycle.is_alive() {
            return Ok(None);
        }
        self.threads = threads.into_iter().map(|t| t.id).collect();
        let drift = if self.seeded {
            self.counter.reconcile(authoritative)
        } else {
            self.counter.seed(authoritative);
            self.seeded = true;
            None
        };
        self.publish();
        Ok(drift)
    }

    /// Handle one feed signal.
    pub async fn handle(&mut self, signal: FeedSignal) -> Result<()> {
        if !self.lifecycle.is_alive() {
            return Ok(());
        }
        match signal {
            FeedSignal::Change(row) => {
                SyncMetrics::record_feed_event(row.table, row.kind.as_str());
                if row.table == Table::Threads {
                    if let Ok(Change::Insert(thread)) = row.decode::<Thread>() {
                        if thread.involves(self.counter.viewer()) {
                            debug!(thread = %thread.id, "Unread monitor tracks new thread");
                            self.threads.insert(thread.id);
                        }
                    }
                    return Ok(());
                }
                let Ok(change) = row.decode::<Message>() else {
                    return Ok(());
                };
                let tracked = change
                    .current()
                    .is_some_and(|m| self.threads.contains(&m.thread_id));
                if tracked && self.counter.apply(&change) {
                    debug!(viewer = %self.counter.viewer(), value = self.counter.value(), "Unread counter moved");
                    self.publish();
                }
            }
            FeedSignal::Dropped(reason) => {
                warn!(scope = %self.scope, reason, "Unread feed dropped, resyncing");
                self.resync().await?;
            }
            FeedSignal::Reconnected => {
                info!(scope = %self.scope, "Unread feed reconnected, resyncing");
                self.resync().await?;
            }
        }
        Ok(())
    }

    /// Apply every signal already queued without waiting.
    pub async fn pump(&mut self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let Some(signal) = self
                .subscriptions
                .get_mut(&self.scope)
                .and_then(|s| s.try_next())
            else {
                return Ok(handled);
            };
            self.handle(signal).await?;
            handled += 1;
        }
    }

    /// Drive the monitor until its lifecycle ends: feed signals as they
    /// arrive and an authoritative resync every `reconcile_every`.
    pub async fn run(mut self, reconcile_every: Duration) {
        let lifecycle = self.lifecycle.clone();
        let mut ticker = tokio::time::interval(reconcile_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            let scope = self.scope.clone();
            tokio::select! {
                () = lifecycle.ended() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.resync().await {
                        warn!(error = %err, "Periodic unread resync failed");
                    }
                }
                signal = async {
                    match self.subscriptions.get_mut(&scope) {
                        Some(sub) => sub.next().await,
                        None => None,
                    }
                } => {
                    match signal {
                        Some(signal) => {
                            if let Err(err) = self.handle(signal).await {
                                warn!(error = %err, "Unread feed handling failed");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        self.unmount();
    }

    /// Tear down the subscription; later signals and results are ignored.
    pub fn unmount(&mut self) {
        self.lifecycle.end();
        self.subscriptions.close_all();
    }

    fn publish(&self) {
        self.tx.send_replace(self.counter.value());
    }
}

impl Drop for UnreadMonitor {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageId, ThreadId};
    use chrono::Utc;

    fn message(sender: UserId, read: bool) -> Message {
        Message {
            id: MessageId::new(),
            thread_id: ThreadId::new(),
            sender_id: sender,
            content: "hi".into(),
            created_at: Utc::now(),
            read_at: read.then(Utc::now),
        }
    }

    #[test]
    fn test_badge_policy() {
        assert_eq!(badge_label(0), None);
        assert_eq!(badge_label(1).as_deref(), Some("1"));
        assert_eq!(badge_label(99).as_deref(), Some("99"));
        assert_eq!(badge_label(100).as_deref(), Some("99+"));
        assert_eq!(badge_label(5000).as_deref(), Some("99+"));
    }

    #[test]
    fn test_incoming_insert_increments_own_does_not() {
        let (me, other) = (UserId::new(), UserId::new());
        let mut counter = UnreadCounter::new(me);
        assert!(counter.apply(&Change::Insert(message(other, false))));
        assert!(!counter.apply(&Change::Insert(message(me, false))));
        assert_eq!(counter.value(), 1);
    }

    #[test]
    fn test_read_transition_decrements_and_floors() {
        let (me, other) = (UserId::new(), UserId::new());
        let mut counter = UnreadCounter::new(me);
        let unread = message(other, false);
        let mut read = unread.clone();
        read.read_at = Some(Utc::now());

        counter.seed(1);
        counter.apply(&Change::Update {
            new: read.clone(),
            old: Some(unread.clone()),
        });
        assert_eq!(counter.value(), 0);

        counter.apply(&Change::Update {
            new: read.clone(),
            old: Some(unread),
        });
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_already_read_update_is_ignored() {
        let (me, other) = (UserId::new(), UserId::new());
        let mut counter = UnreadCounter::new(me);
        counter.seed(2);
        let read = message(other, true);
        counter.apply(&Change::Update {
            new: read.clone(),
            old: Some(read),
        });
        assert_eq!(counter.value(), 2);
    }

    #[test]
    fn test_own_messages_marked_read_do_not_decrement() {
        let me = UserId::new();
        let mut counter = UnreadCounter::new(me);
        counter.seed(3);
        counter.apply(&Change::Update {
            new: message(me, true),
            old: Some(message(me, false)),
        });
        assert_eq!(counter.value(), 3);
    }

    #[test]
    fn test_reconcile_reports_drift() {
        let mut counter = UnreadCounter::new(UserId::new());
        counter.seed(4);
        assert_eq!(counter.reconcile(4), None);
        assert_eq!(counter.reconcile(1), Some(-3));
        assert_eq!(counter.value(), 1);
    }
}
