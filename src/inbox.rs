//! Inbox: one preview per conversation
//!
//! Previews are a pure projection of the viewer's threads and a bounded
//! window of recent messages. They are recomputed after every reload and
//! every relevant feed event, never stored.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::cache::ProjectionCache;
use crate::config::AppConfig;
use crate::error::Result;
use crate::feed::{
    Change, ChangeFeed, ChangeKind, FeedSignal, Interest, Lifecycle, ScopeKey, SubscriptionSet,
};
use crate::logging::OperationTimer;
use crate::metrics::SyncMetrics;
use crate::models::{Message, MessageId, Profile, Thread, ThreadId, UserId};
use crate::retry::{retry_read, RetryPolicy};
use crate::schema::Table;

/// Summary line of one conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPreview {
    /// Conversation
    pub thread_id: ThreadId,
    /// The other participant
    pub other_id: Option<UserId>,
    /// Display label of the other participant
    pub other_label: String,
    /// Most recent message in the window
    pub last_message: Option<Message>,
    /// Unread incoming messages in the window
    pub unread: u32,
}

impl ThreadPreview {
    /// Creation instant of the latest message
    #[must_use]
    pub fn last_at(&self) -> Option<DateTime<Utc>> {
        self.last_message.as_ref().map(|m| m.created_at)
    }

    /// Latest message text, empty when the thread has none
    #[must_use]
    pub fn snippet(&self) -> &str {
        self.last_message.as_ref().map_or("", |m| m.content.as_str())
    }
}

/// Newer of two messages: later creation instant, then greater id
fn newer<'a>(a: &'a Message, b: &'a Message) -> &'a Message {
    match a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)) {
        Ordering::Less => b,
        _ => a,
    }
}

/// Build inbox previews for `viewer`.
///
/// Threads without messages sort last; ties between equal instants fall back
/// to the thread id so the order is stable.
#[must_use]
pub fn compose_previews(
    viewer: UserId,
    threads: &[Thread],
    messages: &[Message],
    profiles: &HashMap<UserId, Profile>,
) -> Vec<ThreadPreview> {
    let mut latest: HashMap<ThreadId, &Message> = HashMap::new();
    let mut unread: HashMap<ThreadId, u32> = HashMap::new();
    for message in messages {
        latest
            .entry(message.thread_id)
            .and_modify(|current| *current = newer(*current, message))
            .or_insert(message);
        if message.is_unread_for(viewer) {
            *unread.entry(message.thread_id).or_default() += 1;
        }
    }

    let mut previews: Vec<ThreadPreview> = threads
        .iter()
        .map(|thread| {
            let other_id = thread.other(viewer);
            let other_label = other_id.map_or_else(String::new, |other| {
                profiles
                    .get(&other)
                    .map_or_else(|| other.short(), Profile::label)
            });
            ThreadPreview {
                thread_id: thread.id,
                other_id,
                other_label,
                last_message: latest.get(&thread.id).map(|m| (*m).clone()),
                unread: unread.get(&thread.id).copied().unwrap_or(0),
            }
        })
        .collect();

    previews.sort_by(|a, b| match (a.last_at(), b.last_at()) {
        (Some(x), Some(y)) => y.cmp(&x).then(a.thread_id.cmp(&b.thread_id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.thread_id.cmp(&b.thread_id),
    });
    previews
}

/// Controller of the inbox screen
pub struct InboxScreen {
    backend: Arc<dyn Backend>,
    feed: Arc<dyn ChangeFeed>,
    viewer: UserId,
    window: usize,
    retry: RetryPolicy,
    threads: ProjectionCache<Thread>,
    messages: ProjectionCache<Message>,
    profiles: HashMap<UserId, Profile>,
    previews: Vec<ThreadPreview>,
    scope: ScopeKey,
    subscriptions: SubscriptionSet,
    lifecycle: Lifecycle,
}

impl InboxScreen {
    /// Load the inbox and attach to the feed
    pub async fn mount(
        backend: Arc<dyn Backend>,
        feed: Arc<dyn ChangeFeed>,
        viewer: UserId,
        config: &AppConfig,
    ) -> Result<Self> {
        let mut screen = Self {
            backend,
            feed,
            viewer,
            window: config.sync.inbox_message_window,
            retry: RetryPolicy::from(&config.retry),
            threads: ProjectionCache::new("inbox_threads"),
            messages: ProjectionCache::new("inbox_messages"),
            profiles: HashMap::new(),
            previews: Vec::new(),
            scope: ScopeKey::new(format!("inbox-sync-{viewer}")),
            subscriptions: SubscriptionSet::new(),
            lifecycle: Lifecycle::new(),
        };
        screen.reload().await?;
        screen
            .subscriptions
            .open(
                screen.feed.as_ref(),
                screen.scope.clone(),
                vec![
                    Interest::all(Table::Messages),
                    Interest::on(Table::Threads, ChangeKind::Insert),
                ],
            )
            .await?;
        info!(viewer = %viewer, threads = screen.threads.len(), "Inbox mounted");
        Ok(screen)
    }

    /// Authoritative reload of threads, the message window and names
    pub async fn reload(&mut self) -> Result<()> {
        let timer = OperationTimer::new("inbox_reload");
        let thread_ticket = self.threads.begin_reload();
        let message_ticket = self.messages.begin_reload();
        let backend = Arc::clone(&self.backend);
        let viewer = self.viewer;
        let window = self.window;

        let threads = retry_read(&self.retry, "threads_for_user", || {
            backend.threads_for_user(viewer)
        })
        .await?;
        let thread_ids: Vec<ThreadId> = threads.iter().map(|t| t.id).collect();
        let messages = if thread_ids.is_empty() {
            Vec::new()
        } else {
            retry_read(&self.retry, "recent_messages", || {
                backend.recent_messages(&thread_ids, window)
            })
            .await?
        };
        let others: Vec<UserId> = threads
            .iter()
            .filter_map(|t| t.other(viewer))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let profiles = if others.is_empty() {
            Vec::new()
        } else {
            retry_read(&self.retry, "profiles", || backend.profiles(&others)).await?
        };

        if !self.lifecycle.is_alive() {
            return Ok(());
        }
        self.threads.complete_reload(thread_ticket, threads);
        self.messages.complete_reload(message_ticket, messages);
        self.profiles = profiles.into_iter().map(|p| (p.id, p)).collect();
        self.recompute();
        debug!(
            viewer = %viewer,
            threads = self.threads.len(),
            messages = self.messages.len(),
            "Inbox reloaded"
        );
        timer.finish();
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
                match row.table {
                    Table::Messages => {
                        let Ok(change) = row.decode::<Message>() else {
                            return Ok(());
                        };
                        let thread = match &change {
                            Change::Insert(m) | Change::Update { new: m, .. } => m.thread_id,
                            Change::Delete { old } => old.thread_id,
                        };
                        if self.threads.get(&thread).is_some() {
                            let ticket = self.messages.begin_patch();
                            if self.messages.apply_patch(ticket, change) {
                                self.trim_window();
                            }
                            self.recompute();
                        } else if matches!(change, Change::Insert(ref m) if m.is_incoming_for(self.viewer)) {
                            debug!(thread = %thread, "Message for an unknown thread, reloading");
                            self.reload().await?;
                        }
                    }
                    Table::Threads => {
                        if let Ok(Change::Insert(thread)) = row.decode::<Thread>() {
                            if thread.involves(self.viewer) {
                                self.reload().await?;
                            }
                        }
                    }
                    _ => {}
                }
            }
            FeedSignal::Dropped(reason) => {
                warn!(scope = %self.scope, reason, "Inbox feed dropped, reloading");
                self.reload().await?;
            }
            FeedSignal::Reconnected => {
                self.reload().await?;
            }
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

    /// Current previews, newest conversation first
    #[must_use]
    pub fn previews(&self) -> &[ThreadPreview] {
        &self.previews
    }

    /// Preview of one thread
    #[must_use]
    pub fn preview(&self, thread: ThreadId) -> Option<&ThreadPreview> {
        self.previews.iter().find(|p| p.thread_id == thread)
    }

    /// Sum of unread counts across previews
    #[must_use]
    pub fn total_unread(&self) -> u32 {
        self.previews.iter().map(|p| p.unread).sum()
    }

    /// Detach from the feed; pending results are discarded
    pub fn unmount(&mut self) {
        self.lifecycle.end();
        self.subscriptions.close_all();
    }

    /// Keep the newest `window` messages, like a reload would.
    fn trim_window(&mut self) {
        if self.messages.len() <= self.window {
            return;
        }
        let mut newest: Vec<(DateTime<Utc>, MessageId)> =
            self.messages.iter().map(|m| (m.created_at, m.id)).collect();
        newest.sort_by(|a, b| b.cmp(a));
        let keep: HashSet<MessageId> = newest
            .into_iter()
            .take(self.window)
            .map(|(_, id)| id)
            .collect();
        let dropped = self.messages.retain(|m| keep.contains(&m.id));
        debug!(viewer = %self.viewer, dropped, "Trimmed inbox message window");
    }

    fn recompute(&mut self) {
        self.previews = compose_previews(
            self.viewer,
            &self.threads.to_vec(),
            &self.messages.to_vec(),
            &self.profiles,
        );
    }
}

impl Drop for InboxScreen {
    fn drop(&mut self) {
        self.unmount();
    }
}
