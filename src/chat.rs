//! Chat screen for one thread
//!
//! Sent text shows up immediately as a provisional entry. The store assigns
//! the real id, so the provisional entry is matched to its echo by sender,
//! content and a creation-time window, never by id. A failed send removes the
//! entry and hands the text back to the input.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::cache::ProjectionCache;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::error::Result;
use crate::feed::{
    ChangeFeed, ChangeKind, ColumnFilter, FeedSignal, Interest, Lifecycle, ScopeKey,
    SubscriptionSet,
};
use crate::metrics::SyncMetrics;
use crate::models::{Message, MessageId, ThreadId, UserId};
use crate::retry::{retry_read, RetryPolicy};
use crate::schema::{messages, Table};
use crate::validation::InputValidator;

/// Local tag of a message not yet confirmed by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProvisionalId(u64);

/// Whether an entry is confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Stored message with its server id
    Confirmed(MessageId),
    /// Sent from this screen, echo not seen yet
    Provisional(ProvisionalId),
}

/// One line of the conversation as displayed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    /// Confirmation state
    pub state: EntryState,
    /// Author
    pub sender_id: UserId,
    /// Text
    pub content: String,
    /// Server instant for confirmed entries, local instant otherwise
    pub created_at: DateTime<Utc>,
    /// Read instant of confirmed entries
    pub read_at: Option<DateTime<Utc>>,
}

impl ChatEntry {
    /// True until the echo arrived
    #[must_use]
    pub const fn is_provisional(&self) -> bool {
        matches!(self.state, EntryState::Provisional(_))
    }
}

#[derive(Debug, Clone)]
struct Pending {
    id: ProvisionalId,
    content: String,
    created_at: DateTime<Utc>,
}

/// Controller of the chat screen
pub struct ChatScreen {
    backend: Arc<dyn Backend>,
    feed: Arc<dyn ChangeFeed>,
    clock: Arc<dyn Clock>,
    thread: ThreadId,
    viewer: UserId,
    echo_window: TimeDelta,
    retry: RetryPolicy,
    confirmed: ProjectionCache<Message>,
    pending: Vec<Pending>,
    next_provisional: u64,
    draft: String,
    scope: ScopeKey,
    subscriptions: SubscriptionSet,
    lifecycle: Lifecycle,
}

impl ChatScreen {
    /// Load the thread, mark it read and attach to its message inserts
    pub async fn open(
        backend: Arc<dyn Backend>,
        feed: Arc<dyn ChangeFeed>,
        clock: Arc<dyn Clock>,
        thread: ThreadId,
        viewer: UserId,
        config: &AppConfig,
    ) -> Result<Self> {
        let echo_secs = i64::try_from(config.sync.echo_match_window_secs).unwrap_or(i64::MAX);
        let mut screen = Self {
            backend,
            feed,
            clock,
            thread,
            viewer,
            echo_window: TimeDelta::try_seconds(echo_secs).unwrap_or(TimeDelta::MAX),
            retry: RetryPolicy::from(&config.retry),
            confirmed: ProjectionCache::new("chat_messages"),
            pending: Vec::new(),
            next_provisional: 0,
            draft: String::new(),
            scope: ScopeKey::new(format!("messages-thread-{thread}")),
            subscriptions: SubscriptionSet::new(),
            lifecycle: Lifecycle::new(),
        };
        screen.reload().await?;
        screen.mark_read().await;
        screen
            .subscriptions
            .open(
                screen.feed.as_ref(),
                screen.scope.clone(),
                vec![Interest::on(Table::Messages, ChangeKind::Insert)
                    .filtered(ColumnFilter::eq(messages::THREAD_ID, thread))],
            )
            .await?;
        info!(thread = %thread, viewer = %viewer, messages = screen.confirmed.len(), "Chat opened");
        Ok(screen)
    }

    /// Thread shown by this screen
    #[must_use]
    pub const fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Current input text
    #[must_use]
    pub fn draft(&self) -> &str {
        &self.draft
    }

    /// Replace the input text
    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    /// Authoritative reload of the thread
    pub async fn reload(&mut self) -> Result<()> {
        let ticket = self.confirmed.begin_reload();
        let backend = Arc::clone(&self.backend);
        let thread = self.thread;
        let rows = retry_read(&self.retry, "thread_messages", || {
            backend.thread_messages(thread)
        })
        .await?;
        if !self.lifecycle.is_alive() {
            return Ok(());
        }
        let known: HashSet<MessageId> = self.confirmed.iter().map(|m| m.id).collect();
        if self.confirmed.complete_reload(ticket, rows) {
            // Messages confirmed before this reload cannot echo a later send.
            let viewer = self.viewer;
            let mut own: Vec<Message> = self
                .confirmed
                .to_vec()
                .into_iter()
                .filter(|m| m.sender_id == viewer && !known.contains(&m.id))
                .collect();
            own.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            let mut floor: Option<DateTime<Utc>> = None;
            for message in &own {
                if let Some(settled_at) = self.settle_echo(message, floor) {
                    floor = Some(settled_at);
                }
            }
        }
        debug!(thread = %thread, messages = self.confirmed.len(), "Chat reloaded");
        Ok(())
    }

    /// Send `text`.
    ///
    /// The entry is shown at once. On failure it is removed, the text goes
    /// back to the input and the error is returned for the "Send error" alert.
    pub async fn send(&mut self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        let content = InputValidator::validate_message(&text)?;

        self.next_provisional += 1;
        let id = ProvisionalId(self.next_provisional);
        self.pending.push(Pending {
            id,
            content: content.clone(),
            created_at: self.clock.now(),
        });
        self.draft.clear();

        if let Err(err) = self
            .backend
            .send_message(self.viewer, self.thread, &content)
            .await
        {
            error!(thread = %self.thread, error = %err, "Send failed, rolling back");
            SyncMetrics::record_write_failure("send_message");
            self.pending.retain(|p| p.id != id);
            self.draft = text;
            return Err(err);
        }
        debug!(thread = %self.thread, provisional = id.0, "Message sent");
        Ok(())
    }

    /// Handle one feed signal
    pub async fn handle(&mut self, signal: FeedSignal) -> Result<()> {
        if !self.lifecycle.is_alive() {
            return Ok(());
        }
        match signal {
            FeedSignal::Change(row) => {
                SyncMetrics::record_feed_event(row.table, row.kind.as_str());
                let Ok(change) = row.decode::<Message>() else {
                    return Ok(());
                };
                let Some(message) = change.current().cloned() else {
                    return Ok(());
                };
                if message.thread_id != self.thread {
                    return Ok(());
                }
                let ticket = self.confirmed.begin_patch();
                self.confirmed.apply_patch(ticket, change);
                if message.sender_id == self.viewer {
                    self.settle_echo(&message, None);
                } else {
                    self.mark_read().await;
                }
            }
            FeedSignal::Dropped(reason) => {
                warn!(scope = %self.scope, reason, "Chat feed dropped, reloading");
                self.reload().await?;
            }
            FeedSignal::Reconnected => self.reload().await?,
        }
        Ok(())
    }

    /// Apply every queued signal
    pub async fn pump(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Some(signal) = self
            .subscriptions
            .get_mut(&self.scope)
            .and_then(|s| s.try_next())
        {
            self.handle(signal).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Confirmed messages by creation instant, then provisional entries
    #[must_use]
    pub fn entries(&self) -> Vec<ChatEntry> {
        let mut confirmed = self.confirmed.to_vec();
        confirmed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        confirmed
            .into_iter()
            .map(|m| ChatEntry {
                state: EntryState::Confirmed(m.id),
                sender_id: m.sender_id,
                content: m.content,
                created_at: m.created_at,
                read_at: m.read_at,
            })
            .chain(self.pending.iter().map(|p| ChatEntry {
                state: EntryState::Provisional(p.id),
                sender_id: self.viewer,
                content: p.content.clone(),
                created_at: p.created_at,
                read_at: None,
            }))
            .collect()
    }

    /// Number of sends still waiting for their echo
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Detach from the feed
    pub fn close(&mut self) {
        self.lifecycle.end();
        self.subscriptions.close_all();
    }

    /// Drop the oldest provisional entry this stored message confirms.
    ///
    /// A stored message only confirms an entry created no later than one
    /// window before it, and never one older than `floor`, the creation
    /// instant of the entry settled by the previous match in the same pass.
    /// Returns the creation instant of the settled entry.
    fn settle_echo(
        &mut self,
        message: &Message,
        floor: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let window = self.echo_window;
        let matched = self.pending.iter().position(|p| {
            p.content == message.content
                && message.created_at >= p.created_at - window
                && message.created_at - p.created_at <= window
                && floor.map_or(true, |floor| p.created_at >= floor)
        })?;
        let settled = self.pending.remove(matched);
        debug!(provisional = settled.id.0, message = %message.id, "Echo reconciled");
        Some(settled.created_at)
    }

    async fn mark_read(&self) {
        if let Err(err) = self.backend.mark_thread_read(self.viewer, self.thread).await {
            warn!(thread = %self.thread, error = %err, "Failed to mark thread read");
        }
    }
}

impl Drop for ChatScreen {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::clock::SystemClock;
    use crate::error::SyncError;
    use crate::feed::FeedHub;

    async fn open_with(mock: MockBackend) -> ChatScreen {
        ChatScreen::open(
            Arc::new(mock),
            Arc::new(FeedHub::default()),
            Arc::new(SystemClock),
            ThreadId::new(),
            UserId::new(),
            &AppConfig::default(),
        )
        .await
        .expect("chat opens")
    }

    #[tokio::test]
    async fn test_failed_send_rolls_back_and_restores_draft() {
        let mut mock = MockBackend::new();
        mock.expect_thread_messages().returning(|_| Ok(Vec::new()));
        mock.expect_mark_thread_read().times(1).returning(|_, _| Ok(()));
        mock.expect_send_message()
            .times(1)
            .returning(|_, _, _| Err(SyncError::write("send_message", "row level policy")));
        let mut chat = open_with(mock).await;

        let err = chat.send("  hello there ").await.unwrap_err();
        assert_eq!(err.alert("Send error").message, "row level policy");
        assert!(chat.entries().is_empty());
        assert_eq!(chat.draft(), "  hello there ");
    }

    #[tokio::test]
    async fn test_successful_send_stays_provisional_until_echo() {
        let mut mock = MockBackend::new();
        mock.expect_thread_messages().returning(|_| Ok(Vec::new()));
        mock.expect_mark_thread_read().returning(|_, _| Ok(()));
        mock.expect_send_message()
            .withf(|_, _, content| content.to_string() == "hello")
            .returning(|_, _, _| Ok(()));
        let mut chat = open_with(mock).await;

        chat.send("hello").await.unwrap();
        let entries = chat.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_provisional());
        assert_eq!(chat.draft(), "");
    }

    #[tokio::test]
    async fn test_mark_read_failure_does_not_block_opening() {
        let mut mock = MockBackend::new();
        mock.expect_thread_messages().returning(|_| Ok(Vec::new()));
        mock.expect_mark_thread_read()
            .returning(|_, _| Err(SyncError::write("mark_thread_read", "offline")));
        let chat = open_with(mock).await;
        assert_eq!(chat.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reload_does_not_settle_send_with_older_identical_message() {
        let start = Utc::now();
        let clock = Arc::new(crate::clock::ManualClock::new(start));
        let (thread, viewer) = (ThreadId::new(), UserId::new());
        let earlier = Message {
            id: MessageId::new(),
            thread_id: thread,
            sender_id: viewer,
            content: "ok".into(),
            created_at: start,
            read_at: None,
        };
        let stored = Arc::new(std::sync::Mutex::new(vec![earlier]));
        let rows = Arc::clone(&stored);

        let mut mock = MockBackend::new();
        mock.expect_thread_messages()
            .returning(move |_| Ok(rows.lock().map(|r| r.clone()).unwrap_or_default()));
        mock.expect_mark_thread_read().returning(|_, _| Ok(()));
        mock.expect_send_message().returning(|_, _, _| Ok(()));
        let mut chat = ChatScreen::open(
            Arc::new(mock),
            Arc::new(FeedHub::default()),
            clock.clone(),
            thread,
            viewer,
            &AppConfig::default(),
        )
        .await
        .expect("chat opens");

        clock.advance(TimeDelta::seconds(30));
        chat.send("ok").await.unwrap();
        chat.reload().await.unwrap();
        assert_eq!(chat.pending_count(), 1);

        stored.lock().unwrap().push(Message {
            id: MessageId::new(),
            thread_id: thread,
            sender_id: viewer,
            content: "ok".into(),
            created_at: start + TimeDelta::seconds(31),
            read_at: None,
        });
        chat.reload().await.unwrap();
        assert_eq!(chat.pending_count(), 0);
        assert_eq!(chat.entries().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected_before_sending() {
        let mut mock = MockBackend::new();
        mock.expect_thread_messages().returning(|_| Ok(Vec::new()));
        mock.expect_mark_thread_read().returning(|_, _| Ok(()));
        mock.expect_send_message().never();
        let mut chat = open_with(mock).await;
        assert!(matches!(chat.send("   ").await, Err(SyncError::Validation(_))));
    }
}
