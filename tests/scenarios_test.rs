//! End-to-end scenarios against the in-memory backend

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use skillswap_sync::backend::Backend;
use skillswap_sync::chat::ChatScreen;
use skillswap_sync::clock::{Clock, ManualClock};
use skillswap_sync::config::AppConfig;
use skillswap_sync::error::SyncError;
use skillswap_sync::events::LocalEvents;
use skillswap_sync::feed::{ChangeFeed, FeedHub};
use skillswap_sync::inbox::InboxScreen;
use skillswap_sync::memory::MemoryBackend;
use skillswap_sync::models::{NewSlot, Profile, Slot, ThreadId, UserId};
use skillswap_sync::retry::RetryPolicy;
use skillswap_sync::skills::SkillsScreen;
use skillswap_sync::slots::{BrowseSlotsScreen, SessionsScreen, SlotStatus};
use skillswap_sync::unread::UnreadMonitor;

struct World {
    clock: Arc<ManualClock>,
    store: Arc<MemoryBackend>,
    backend: Arc<dyn Backend>,
    feed: Arc<dyn ChangeFeed>,
    config: AppConfig,
}

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).unwrap()
}

fn world() -> World {
    let clock = Arc::new(ManualClock::new(base()));
    let store = Arc::new(MemoryBackend::new(clock.clone()));
    let mut config = AppConfig::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    World {
        backend: store.clone(),
        feed: Arc::new(store.feed()),
        clock,
        store,
        config,
    }
}

impl World {
    async fn user(&self, name: &str) -> UserId {
        let id = UserId::new();
        self.store
            .put_profile(Profile {
                id,
                display_name: Some(name.to_string()),
                email: Some(format!("{}@example.com", name.to_lowercase())),
                bio: None,
            })
            .await;
        id
    }

    async fn slot(&self, owner: UserId, hours_ahead: i64) -> Slot {
        let start = self.clock.now() + Duration::hours(hours_ahead);
        self.backend
            .insert_slot(NewSlot {
                owner,
                start_at: start,
                end_at: start + Duration::hours(1),
                timezone: "UTC".to_string(),
                notes: None,
            })
            .await
            .unwrap()
    }

    async fn browse(&self, viewer: UserId) -> BrowseSlotsScreen {
        BrowseSlotsScreen::mount(
            self.backend.clone(),
            self.feed.clone(),
            self.clock.clone(),
            viewer,
            &self.config,
        )
        .await
        .unwrap()
    }

    async fn chat(&self, thread: ThreadId, viewer: UserId) -> ChatScreen {
        ChatScreen::open(
            self.backend.clone(),
            self.feed.clone(),
            self.clock.clone(),
            thread,
            viewer,
            &self.config,
        )
        .await
        .unwrap()
    }
}

#[tokio::test]
async fn test_booking_is_visible_to_everyone() {
    let w = world();
    let (ana, ben, cleo) = (w.user("Ana").await, w.user("Ben").await, w.user("Cleo").await);
    let mut ana_sessions =
        SessionsScreen::mount(w.backend.clone(), w.feed.clone(), ana, &w.config)
            .await
            .unwrap();
    let mut ben_browse = w.browse(ben).await;
    let mut cleo_browse = w.browse(cleo).await;

    let slot = w.slot(ana, 2).await;
    ben_browse.pump().await.unwrap();
    cleo_browse.pump().await.unwrap();
    ana_sessions.pump().await.unwrap();
    assert_eq!(ben_browse.listing(slot.id).unwrap().status, SlotStatus::Bookable);
    assert_eq!(
        ben_browse.listing(slot.id).unwrap().owner_label.as_deref(),
        Some("ana@example.com")
    );
    assert_eq!(ana_sessions.slots()[0].booking_label(), "Free");

    ben_browse.book(slot.id).await.unwrap();
    ben_browse.pump().await.unwrap();
    cleo_browse.pump().await.unwrap();
    ana_sessions.pump().await.unwrap();

    assert_eq!(ben_browse.listing(slot.id).unwrap().status.label(), "Booked (you)");
    assert_eq!(cleo_browse.listing(slot.id).unwrap().status.label(), "Booked");
    assert_eq!(ana_sessions.slots()[0].booking_label(), "Booked");

    let second = cleo_browse.book(slot.id).await;
    assert!(matches!(second, Err(SyncError::Conflict(_))));
    let foreign_cancel = cleo_browse.cancel(slot.id).await;
    assert!(matches!(foreign_cancel, Err(SyncError::Validation(_))));
}

#[tokio::test]
async fn test_cancel_frees_the_slot() {
    let w = world();
    let (ana, ben, cleo) = (w.user("Ana").await, w.user("Ben").await, w.user("Cleo").await);
    let slot = w.slot(ana, 3).await;
    let mut ben_browse = w.browse(ben).await;
    let mut cleo_browse = w.browse(cleo).await;

    ben_browse.book(slot.id).await.unwrap();
    cleo_browse.pump().await.unwrap();
    assert_eq!(cleo_browse.listing(slot.id).unwrap().status, SlotStatus::BookedByOther);

    ben_browse.cancel(slot.id).await.unwrap();
    cleo_browse.pump().await.unwrap();
    assert_eq!(ben_browse.listing(slot.id).unwrap().status, SlotStatus::Bookable);
    assert_eq!(cleo_browse.listing(slot.id).unwrap().status, SlotStatus::Bookable);

    let again = ben_browse.cancel(slot.id).await;
    assert!(matches!(again, Err(SyncError::NotFound(_))));
    cleo_browse.book(slot.id).await.unwrap();
}

#[tokio::test]
async fn test_own_and_past_slots_are_not_browsable() {
    let w = world();
    let (ana, ben) = (w.user("Ana").await, w.user("Ben").await);
    let own = w.slot(ben, 1).await;
    let past = w.slot(ana, -3).await;
    let future = w.slot(ana, 1).await;

    let browse = w.browse(ben).await;
    let ids: Vec<_> = browse.listings().iter().map(|l| l.slot.id).collect();
    assert_eq!(ids, vec![future.id]);
    assert!(!ids.contains(&own.id) && !ids.contains(&past.id));
}

#[tokio::test]
async fn test_deleting_a_booked_slot_removes_it_from_browse() {
    let w = world();
    let (ana, ben) = (w.user("Ana").await, w.user("Ben").await);
    let mut sessions = SessionsScreen::mount(w.backend.clone(), w.feed.clone(), ana, &w.config)
        .await
        .unwrap();
    let slot = w.slot(ana, 2).await;
    let mut browse = w.browse(ben).await;
    browse.book(slot.id).await.unwrap();

    sessions.pump().await.unwrap();
    sessions.delete_slot(slot.id).await.unwrap();
    browse.pump().await.unwrap();

    assert!(sessions.slots().is_empty());
    assert!(browse.listings().is_empty());
    assert_eq!(w.backend.booking_for_slot(slot.id).await.unwrap(), None);
}

#[tokio::test]
async fn test_opening_the_chat_clears_three_unread() {
    let w = world();
    let (ana, ben) = (w.user("Ana").await, w.user("Ben").await);
    let mut unread = UnreadMonitor::mount(
        w.backend.clone(),
        w.feed.clone(),
        ana,
        RetryPolicy::from(&w.config.retry),
    )
    .await
    .unwrap();

    let thread = w.backend.get_or_create_thread(ben, ana).await.unwrap();
    for text in ["one", "two", "three"] {
        w.clock.advance(Duration::seconds(5));
        w.backend.send_message(ben, thread, text).await.unwrap();
    }
    unread.pump().await.unwrap();
    assert_eq!(unread.value(), 3);
    assert_eq!(unread.badge().as_deref(), Some("3"));

    let inbox = InboxScreen::mount(w.backend.clone(), w.feed.clone(), ana, &w.config)
        .await
        .unwrap();
    let preview = inbox.preview(thread).unwrap();
    assert_eq!(preview.unread, 3);
    assert_eq!(preview.other_label, "Ben");
    assert_eq!(preview.snippet(), "three");

    let _chat = w.chat(thread, ana).await;
    unread.pump().await.unwrap();
    assert_eq!(unread.value(), 0);
    assert_eq!(unread.badge(), None);
    assert_eq!(w.backend.count_unread_messages(ana).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unread_ignores_threads_of_other_users() {
    let w = world();
    let (ana, ben, cleo) = (w.user("Ana").await, w.user("Ben").await, w.user("Cleo").await);
    let mut unread = UnreadMonitor::mount(
        w.backend.clone(),
        w.feed.clone(),
        ana,
        RetryPolicy::from(&w.config.retry),
    )
    .await
    .unwrap();

    let ben_cleo = w.backend.get_or_create_thread(ben, cleo).await.unwrap();
    w.backend.send_message(ben, ben_cleo, "hi cleo").await.unwrap();
    let ben_ana = w.backend.get_or_create_thread(ben, ana).await.unwrap();
    w.backend.send_message(ben, ben_ana, "hi ana").await.unwrap();
    w.backend.mark_thread_read(cleo, ben_cleo).await.unwrap();
    unread.pump().await.unwrap();

    assert!(!unread.tracks(ben_cleo));
    assert!(unread.tracks(ben_ana));
    assert_eq!(unread.value(), 1);
    assert_eq!(w.backend.count_unread_messages(ana).await.unwrap(), 1);
    assert_eq!(unread.resync().await.unwrap(), None);
}

#[tokio::test]
async fn test_incoming_message_while_chat_is_open_is_read() {
    let w = world();
    let (ana, ben) = (w.user("Ana").await, w.user("Ben").await);
    let thread = w.backend.get_or_create_thread(ana, ben).await.unwrap();
    let mut ana_chat = w.chat(thread, ana).await;

    w.backend.send_message(ben, thread, "are you there?").await.unwrap();
    ana_chat.pump().await.unwrap();

    assert_eq!(ana_chat.entries().len(), 1);
    assert_eq!(w.backend.count_unread_messages(ana).await.unwrap(), 0);
}

#[tokio::test]
async fn test_optimistic_message_settles_on_echo() {
    let w = world();
    let (ana, ben) = (w.user("Ana").await, w.user("Ben").await);
    let thread = w.backend.get_or_create_thread(ben, ana).await.unwrap();
    let mut chat = w.chat(thread, ben).await;

    chat.send("hello").await.unwrap();
    chat.send("hello").await.unwrap();
    assert_eq!(chat.pending_count(), 2);
    assert!(chat.entries().iter().all(|e| e.is_provisional()));

    chat.pump().await.unwrap();
    let entries = chat.entries();
    assert_eq!(chat.pending_count(), 0);
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| !e.is_provisional()));
}

#[tokio::test]
async fn test_failed_send_restores_the_draft() {
    let w = world();
    let (ana, ben) = (w.user("Ana").await, w.user("Ben").await);
    let thread = w.backend.get_or_create_thread(ben, ana).await.unwrap();
    let mut chat = w.chat(thread, ben).await;
    w.store.fail_next_write("send_message", "network unreachable").await;

    let err = chat.send("see you at 10").await.unwrap_err();

    assert_eq!(err.alert("Send error").title, "Send error");
    assert_eq!(chat.draft(), "see you at 10");
    assert!(chat.entries().is_empty());
    chat.send("see you at 10").await.unwrap();
    chat.pump().await.unwrap();
    assert_eq!(chat.entries().len(), 1);
}

#[tokio::test]
async fn test_unread_resyncs_after_feed_drop() {
    let w = world();
    let (ana, ben) = (w.user("Ana").await, w.user("Ben").await);
    // A hub the store does not publish to, so the monitor misses every event.
    let silent = FeedHub::default();
    let mut unread = UnreadMonitor::mount(
        w.backend.clone(),
        Arc::new(silent.clone()),
        ana,
        RetryPolicy::from(&w.config.retry),
    )
    .await
    .unwrap();

    let thread = w.backend.get_or_create_thread(ben, ana).await.unwrap();
    w.backend.send_message(ben, thread, "a").await.unwrap();
    w.backend.send_message(ben, thread, "b").await.unwrap();
    unread.pump().await.unwrap();
    assert_eq!(unread.value(), 0);

    silent.drop_connections("socket closed").await;
    unread.pump().await.unwrap();
    assert_eq!(unread.value(), 2);
}

#[tokio::test]
async fn test_reads_are_retried_on_transient_failures() {
    let w = world();
    let (ana, ben) = (w.user("Ana").await, w.user("Ben").await);
    w.slot(ana, 1).await;
    w.store.fail_reads("upcoming_slots_excluding", 2).await;

    let browse = w.browse(ben).await;
    assert_eq!(browse.listings().len(), 1);

    w.store.fail_reads("upcoming_slots_excluding", 5).await;
    let failed = BrowseSlotsScreen::mount(
        w.backend.clone(),
        w.feed.clone(),
        w.clock.clone(),
        ben,
        &w.config,
    )
    .await;
    assert!(matches!(failed, Err(SyncError::Query { .. })));
}

#[tokio::test]
async fn test_skill_titles_deduplicate_across_users() {
    let w = world();
    let (ana, ben) = (w.user("Ana").await, w.user("Ben").await);
    let events = LocalEvents::default();
    let mut ana_skills = SkillsScreen::mount(w.backend.clone(), events.clone(), ana, &w.config)
        .await
        .unwrap();
    let mut ben_skills = SkillsScreen::mount(w.backend.clone(), events.clone(), ben, &w.config)
        .await
        .unwrap();

    let guitar = ana_skills.add_skill("Guitar").await.unwrap();
    let same = ben_skills.add_skill("guitar").await.unwrap();

    assert_eq!(guitar.id, same.id);
    assert_eq!(w.backend.skills().await.unwrap().len(), 1);
}
