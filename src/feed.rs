//! Change-feed subscriptions
//!
//! A screen opens one subscription per scope key (for example
//! `inbox-sync-<user>`) with a set of table/event interests. Row changes are
//! delivered in commit order per publisher; nothing stronger is promised
//! across rows.
//!
//! Teardown is explicit and idempotent: once [`Subscription::close`] runs (or
//! the handle is dropped) `next` yields `None` and nothing more is delivered.
//! A lost or lagging connection is reported as [`FeedSignal::Dropped`], which
//! consumers answer with an authoritative reload.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::models::Record;
use crate::schema::Table;

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Row created
    Insert,
    /// Row modified
    Update,
    /// Row removed
    Delete,
}

impl ChangeKind {
    /// Lower-case name used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Equality filter on one column of the row image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFilter {
    /// Column name
    pub column: &'static str,
    /// Expected value, compared as text
    pub value: String,
}

impl ColumnFilter {
    /// `column = value`
    pub fn eq(column: &'static str, value: impl ToString) -> Self {
        Self {
            column,
            value: value.to_string(),
        }
    }
}

/// One (table, event) interest of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    /// Watched table
    pub table: Table,
    /// Watched change kind; `None` means every kind
    pub kind: Option<ChangeKind>,
    /// Optional row filter
    pub filter: Option<ColumnFilter>,
}

impl Interest {
    /// Every change on `table`
    #[must_use]
    pub const fn all(table: Table) -> Self {
        Self {
            table,
            kind: None,
            filter: None,
        }
    }

    /// Changes of one kind on `table`
    #[must_use]
    pub const fn on(table: Table, kind: ChangeKind) -> Self {
        Self {
            table,
            kind: Some(kind),
            filter: None,
        }
    }

    /// Restrict to rows where `filter` holds
    #[must_use]
    pub fn filtered(mut self, filter: ColumnFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// True if `change` falls under this interest
    #[must_use]
    pub fn matches(&self, change: &RowChange) -> bool {
        if self.table != change.table {
            return false;
        }
        if self.kind.is_some_and(|kind| kind != change.kind) {
            return false;
        }
        self.filter
            .as_ref()
            .map_or(true, |f| change.column(f.column) == Some(f.value.as_str()))
    }
}

/// Raw row change as delivered by the feed
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    /// Source table
    pub table: Table,
    /// Change kind
    pub kind: ChangeKind,
    /// Row image after the change (insert, update)
    pub new: Option<Value>,
    /// Row image before the change (update, delete); may be partial
    pub old: Option<Value>,
    /// Publisher commit sequence number
    pub commit_seq: u64,
}

impl RowChange {
    /// Text value of `column` from the new image, falling back to the old one
    #[must_use]
    pub fn column(&self, column: &str) -> Option<&str> {
        self.new
            .as_ref()
            .and_then(|row| row.get(column))
            .or_else(|| self.old.as_ref().and_then(|row| row.get(column)))
            .and_then(Value::as_str)
    }

    /// Parse the row images into `T`, rejecting malformed rows.
    ///
    /// A partial old image on update is tolerated and reported as `None`.
    pub fn decode<T: Record>(&self) -> Result<Change<T>> {
        if self.table != T::TABLE {
            return Err(SyncError::malformed(
                T::TABLE.as_str(),
                format!("change belongs to {}", self.table),
            ));
        }
        let result = match self.kind {
            ChangeKind::Insert => parse_image(self.new.as_ref(), "new").map(Change::Insert),
            ChangeKind::Update => parse_image(self.new.as_ref(), "new").map(|new| Change::Update {
                new,
                old: parse_image(self.old.as_ref(), "old").ok(),
            }),
            ChangeKind::Delete => {
                parse_image(self.old.as_ref(), "old").map(|old| Change::Delete { old })
            }
        };
        if let Err(err) = &result {
            warn!(table = %self.table, kind = self.kind.as_str(), error = %err, "Rejected malformed row");
            SyncMetrics::record_malformed_row(self.table);
        }
        result
    }
}

fn parse_image<T: Record>(image: Option<&Value>, which: &str) -> Result<T> {
    let value = image.ok_or_else(|| {
        SyncError::malformed(T::TABLE.as_str(), format!("missing {which} row image"))
    })?;
    let row: T = serde_json::from_value(value.clone())
        .map_err(|e| SyncError::malformed(T::TABLE.as_str(), e.to_string()))?;
    row.check()
        .map_err(|reason| SyncError::malformed(T::TABLE.as_str(), reason))?;
    Ok(row)
}

/// Typed row change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<T> {
    /// New row
    Insert(T),
    /// Modified row with the previous image when the feed supplied one
    Update {
        /// Row after the change
        new: T,
        /// Row before the change
        old: Option<T>,
    },
    /// Removed row
    Delete {
        /// Last image of the row
        old: T,
    },
}

impl<T> Change<T> {
    /// Current image, absent for deletes
    pub const fn current(&self) -> Option<&T> {
        match self {
            Self::Insert(row) | Self::Update { new: row, .. } => Some(row),
            Self::Delete { .. } => None,
        }
    }

    /// Kind of this change
    pub const fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert(_) => ChangeKind::Insert,
            Self::Update { .. } => ChangeKind::Update,
            Self::Delete { .. } => ChangeKind::Delete,
        }
    }
}

/// What a subscription can deliver
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    /// A matching row change
    Change(RowChange),
    /// The connection was lost or the subscriber fell behind; reload
    Dropped(String),
    /// The connection came back; reload
    Reconnected,
}

/// Logical channel name, e.g. `unread-<user>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey(String);

impl ScopeKey {
    /// Scope from any displayable name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Scope name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Default)]
struct SubscriptionState {
    closed: AtomicBool,
    lagged: AtomicBool,
}

/// Publisher half of a subscription, held by the feed implementation
#[derive(Debug, Clone)]
pub struct SubscriptionSender {
    tx: mpsc::Sender<FeedSignal>,
    state: Arc<SubscriptionState>,
}

impl SubscriptionSender {
    /// False once the subscriber closed or went away
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.state.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Deliver a signal. A full buffer marks the subscriber as lagged.
    pub fn send(&self, signal: FeedSignal) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.tx.try_send(signal) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.state.lagged.store(true, Ordering::Release);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Subscriber half: the handle a screen owns
#[derive(Debug)]
pub struct Subscription {
    scope: ScopeKey,
    rx: mpsc::Receiver<FeedSignal>,
    state: Arc<SubscriptionState>,
}

impl Subscription {
    /// Create a connected pair with room for `buffer` pending signals
    #[must_use]
    pub fn channel(scope: ScopeKey, buffer: usize) -> (SubscriptionSender, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let state = Arc::new(SubscriptionState::default());
        (
            SubscriptionSender {
                tx,
                state: Arc::clone(&state),
            },
            Self { scope, rx, state },
        )
    }

    /// Scope this subscription was opened for
    #[must_use]
    pub const fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    /// False after `close`
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.state.closed.load(Ordering::Acquire)
    }

    /// Wait for the next signal; `None` once closed or disconnected for good.
    pub async fn next(&mut self) -> Option<FeedSignal> {
        if !self.is_active() {
            return None;
        }
        if self.state.lagged.swap(false, Ordering::AcqRel) {
            return Some(FeedSignal::Dropped("subscriber lagged".to_string()));
        }
        let signal = self.rx.recv().await?;
        self.is_active().then_some(signal)
    }

    /// Next signal if one is already queued.
    pub fn try_next(&mut self) -> Option<FeedSignal> {
        if !self.is_active() {
            return None;
        }
        if self.state.lagged.swap(false, Ordering::AcqRel) {
            return Some(FeedSignal::Dropped("subscriber lagged".to_string()));
        }
        self.rx.try_recv().ok()
    }

    /// Stop delivery. Safe to call any number of times.
    pub fn close(&mut self) {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            debug!(scope = %self.scope, "Subscription closed");
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Source of change-feed subscriptions
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription for `scope` with the given interests
    async fn subscribe(&self, scope: ScopeKey, interests: Vec<Interest>) -> Result<Subscription>;
}

/// Per-screen registry keeping at most one live subscription per scope key
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    subscriptions: HashMap<ScopeKey, Subscription>,
}

impl SubscriptionSet {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `scope`, closing any subscription previously held for it.
    pub async fn open(
        &mut self,
        feed: &dyn ChangeFeed,
        scope: ScopeKey,
        interests: Vec<Interest>,
    ) -> Result<()> {
        if let Some(mut previous) = self.subscriptions.remove(&scope) {
            previous.close();
        }
        let subscription = feed.subscribe(scope.clone(), interests).await?;
        self.subscriptions.insert(scope, subscription);
        Ok(())
    }

    /// Subscription held for `scope`
    pub fn get_mut(&mut self, scope: &ScopeKey) -> Option<&mut Subscription> {
        self.subscriptions.get_mut(scope)
    }

    /// Number of scopes with a live subscription
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.subscriptions.values().filter(|s| s.is_active()).count()
    }

    /// Close one scope
    pub fn close(&mut self, scope: &ScopeKey) {
        if let Some(mut subscription) = self.subscriptions.remove(scope) {
            subscription.close();
        }
    }

    /// Close everything; used on unmount
    pub fn close_all(&mut self) {
        for (_, mut subscription) in self.subscriptions.drain() {
            subscription.close();
        }
    }
}

/// Liveness token of a mounted screen or background task.
///
/// Results of in-flight work are applied only while the token is alive.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    ended: Arc<watch::Sender<bool>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Alive token
    #[must_use]
    pub fn new() -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            ended: Arc::new(ended),
        }
    }

    /// True until `end` is called on any clone
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !*self.ended.borrow()
    }

    /// End the lifecycle
    pub fn end(&self) {
        self.ended.send_replace(true);
    }

    /// Resolves once the lifecycle has ended
    pub async fn ended(&self) {
        let mut rx = self.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

struct HubSubscriber {
    scope: ScopeKey,
    interests: Vec<Interest>,
    sender: SubscriptionSender,
}

#[derive(Default)]
struct HubInner {
    next_seq: u64,
    subscribers: Vec<HubSubscriber>,
}

/// In-process change feed fanning row changes out to subscribers
#[derive(Clone)]
pub struct FeedHub {
    inner: Arc<Mutex<HubInner>>,
    buffer: usize,
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl FeedHub {
    /// Hub whose subscribers buffer up to `buffer` signals each
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner::default())),
            buffer,
        }
    }

    /// Publish a committed row change. Returns its sequence number.
    pub async fn publish(
        &self,
        table: Table,
        kind: ChangeKind,
        new: Option<Value>,
        old: Option<Value>,
    ) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.next_seq += 1;
        let change = RowChange {
            table,
            kind,
            new,
            old,
            commit_seq: inner.next_seq,
        };
        inner.subscribers.retain(|s| s.sender.is_active());
        for subscriber in &inner.subscribers {
            if subscriber.interests.iter().any(|i| i.matches(&change)) {
                subscriber.sender.send(FeedSignal::Change(change.clone()));
            }
        }
        change.commit_seq
    }

    /// Simulate a lost connection on every subscription
    pub async fn drop_connections(&self, reason: &str) {
        let inner = self.inner.lock().await;
        for subscriber in &inner.subscribers {
            warn!(scope = %subscriber.scope, reason, "Feed connection dropped");
            SyncMetrics::record_subscription_drop();
            subscriber
                .sender
                .send(FeedSignal::Dropped(reason.to_string()));
        }
    }

    /// Simulate the connection coming back
    pub async fn reconnect(&self) {
        let inner = self.inner.lock().await;
        for subscriber in &inner.subscribers {
            subscriber.sender.send(FeedSignal::Reconnected);
        }
    }

    /// Number of live subscriptions
    pub async fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .subscribers
            .iter()
            .filter(|s| s.sender.is_active())
            .count()
    }
}

#[async_trait]
impl ChangeFeed for FeedHub {
    async fn subscribe(&self, scope: ScopeKey, interests: Vec<Interest>) -> Result<Subscription> {
        if interests.is_empty() {
            return Err(SyncError::Subscription(format!(
                "subscription {scope} has no interests"
            )));
        }
        let (sender, subscription) = Subscription::channel(scope.clone(), self.buffer);
        debug!(scope = %scope, interests = interests.len(), "Subscription opened");
        self.inner.lock().await.subscribers.push(HubSubscriber {
            scope,
            interests,
            sender,
        });
        Ok(subscription)
    }
}
