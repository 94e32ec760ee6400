//! In-process backend
//!
//! A complete stand-in for the hosted store, used by tests and the demo. It
//! enforces the store-side invariants the client relies on and publishes
//! every committed row change to its [`FeedHub`], in commit order.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::Backend;
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::feed::{ChangeKind, FeedHub};
use crate::models::{
    Booking, BookingId, FeedbackId, MatchRow, Message, MessageId, NewFeedback, NewSlot, Profile,
    ProfileEdit, ProofDocument, ProofId, ProofStatus, SessionFeedback, Skill, SkillId, SkillProof, Slot,
    SlotId, SlotPatch, Thread, ThreadId, UserId, UserRating, UserSkill,
};
use crate::schema::{Table, PROOF_BUCKET};

#[derive(Default)]
struct Store {
    profiles: Vec<Profile>,
    threads: Vec<Thread>,
    messages: Vec<Message>,
    slots: Vec<Slot>,
    bookings: Vec<Booking>,
    skills: Vec<Skill>,
    offers: Vec<UserSkill>,
    wants: Vec<UserSkill>,
    proofs: Vec<SkillProof>,
    feedback: Vec<SessionFeedback>,
    blobs: HashMap<String, Vec<u8>>,
    write_faults: HashMap<&'static str, String>,
    read_faults: HashMap<&'static str, u32>,
}

impl Store {
    fn thread(&self, id: ThreadId) -> Result<&Thread> {
        self.threads
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("thread {id}")))
    }

    fn thread_ids_of(&self, user: UserId) -> HashSet<ThreadId> {
        self.threads
            .iter()
            .filter(|t| t.involves(user))
            .map(|t| t.id)
            .collect()
    }

    fn slot_index(&self, id: SlotId) -> Result<usize> {
        self.slots
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("slot {id}")))
    }

    fn skill_title(&self, id: SkillId) -> Option<String> {
        self.skills
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.title.clone())
    }

    fn title_taken(&self, title: &str, except: Option<SkillId>) -> bool {
        let wanted = title.to_lowercase();
        self.skills
            .iter()
            .any(|s| Some(s.id) != except && s.title.to_lowercase() == wanted)
    }

    fn first_overlap(&self, a: UserId, b: UserId) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let mine = self.slots.iter().filter(|s| s.user_id == a);
        mine.flat_map(|x| {
            self.slots
                .iter()
                .filter(move |y| y.user_id == b)
                .map(move |y| (x.start_at.max(y.start_at), x.end_at.min(y.end_at)))
        })
        .filter(|(start, end)| start < end)
        .min()
    }
}

fn ordered_by_start(mut slots: Vec<Slot>) -> Vec<Slot> {
    slots.sort_by(|a, b| a.start_at.cmp(&b.start_at).then(a.id.cmp(&b.id)));
    slots
}

fn check_range(operation: &'static str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if end <= start {
        return Err(SyncError::write(operation, "end must be after start"));
    }
    Ok(())
}

fn check_rating(operation: &'static str, rating: u8) -> Result<()> {
    if !(1..=5).contains(&rating) {
        return Err(SyncError::write(operation, "rating must be between 1 and 5"));
    }
    Ok(())
}

/// Hosted store replacement living in process memory
pub struct MemoryBackend {
    store: Mutex<Store>,
    hub: FeedHub,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    /// Empty store publishing to a hub with the default buffer
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_hub(clock, FeedHub::default())
    }

    /// Empty store publishing to `hub`
    #[must_use]
    pub fn with_hub(clock: Arc<dyn Clock>, hub: FeedHub) -> Self {
        Self {
            store: Mutex::new(Store::default()),
            hub,
            clock,
        }
    }

    /// The change feed fed by this store
    #[must_use]
    pub fn feed(&self) -> FeedHub {
        self.hub.clone()
    }

    /// Create or replace a profile
    pub async fn put_profile(&self, profile: Profile) {
        let mut store = self.store.lock().await;
        store.profiles.retain(|p| p.id != profile.id);
        store.profiles.push(profile);
    }

    /// Set the call link of a booking
    pub async fn set_meeting_url(&self, id: BookingId, url: &str) -> Result<Booking> {
        let mut store = self.write("set_meeting_url").await?;
        let booking = store
            .bookings
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("booking {id}")))?;
        let old = booking.clone();
        booking.meeting_url = Some(url.to_string());
        let new = booking.clone();
        self.emit(Table::Bookings, ChangeKind::Update, Some(&new), Some(&old))
            .await?;
        Ok(new)
    }

    /// Make the next call of `operation` fail with a write error
    pub async fn fail_next_write(&self, operation: &'static str, message: impl Into<String>) {
        self.store
            .lock()
            .await
            .write_faults
            .insert(operation, message.into());
    }

    /// Make the next `times` calls of read `operation` fail
    pub async fn fail_reads(&self, operation: &'static str, times: u32) {
        self.store.lock().await.read_faults.insert(operation, times);
    }

    /// Drop every feed connection
    pub async fn simulate_drop(&self, reason: &str) {
        self.hub.drop_connections(reason).await;
    }

    /// Bring feed connections back
    pub async fn simulate_reconnect(&self) {
        self.hub.reconnect().await;
    }

    async fn read(&self, operation: &'static str) -> Result<MutexGuard<'_, Store>> {
        let mut store = self.store.lock().await;
        if let Some(remaining) = store.read_faults.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::query(operation, "injected read failure"));
            }
        }
        Ok(store)
    }

    async fn write(&self, operation: &'static str) -> Result<MutexGuard<'_, Store>> {
        let mut store = self.store.lock().await;
        if let Some(message) = store.write_faults.remove(operation) {
            return Err(SyncError::write(operation, message));
        }
        Ok(store)
    }

    async fn emit<T: Serialize + Sync>(
        &self,
        table: Table,
        kind: ChangeKind,
        new: Option<&T>,
        old: Option<&T>,
    ) -> Result<()> {
        let new = new.map(serde_json::to_value).transpose()?;
        let old = old.map(serde_json::to_value).transpose()?;
        let seq = self.hub.publish(table, kind, new, old).await;
        debug!(table = %table, kind = kind.as_str(), seq, "Row change committed");
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn find_complementary_matches(&self, user: UserId) -> Result<Vec<MatchRow>> {
        let store = self.read("find_complementary_matches").await?;
        let my_offers: HashSet<SkillId> = store
            .offers
            .iter()
            .filter(|o| o.user_id == user)
            .map(|o| o.skill_id)
            .collect();
        let my_wants: HashSet<SkillId> = store
            .wants
            .iter()
            .filter(|w| w.user_id == user)
            .map(|w| w.skill_id)
            .collect();
        let others: BTreeSet<UserId> = store
            .offers
            .iter()
            .chain(store.wants.iter())
            .map(|r| r.user_id)
            .filter(|u| *u != user)
            .collect();

        let mut rows = Vec::new();
        for other in others {
            let offer_to_them: Vec<String> = store
                .wants
                .iter()
                .filter(|w| w.user_id == other && my_offers.contains(&w.skill_id))
                .filter_map(|w| store.skill_title(w.skill_id))
                .collect();
            let want_from_them: Vec<String> = store
                .offers
                .iter()
                .filter(|o| o.user_id == other && my_wants.contains(&o.skill_id))
                .filter_map(|o| store.skill_title(o.skill_id))
                .collect();
            if offer_to_them.is_empty() || want_from_them.is_empty() {
                continue;
            }

            let profile = store.profiles.iter().find(|p| p.id == other);
            let overlap = store.first_overlap(user, other);
            rows.push(MatchRow {
                other_id: other,
                other_name: profile.and_then(|p| p.display_name.clone()),
                other_email: profile.and_then(|p| p.email.clone()),
                offer_to_them,
                want_from_them,
                overlap_weekday: overlap
                    .and_then(|(start, _)| u8::try_from(start.weekday().num_days_from_sunday()).ok()),
                overlap_start_min: overlap.and_then(|(start, _)| minute_of_day(start)),
                overlap_end_min: overlap.and_then(|(_, end)| minute_of_day(end)),
                overlap_start_at: overlap.map(|(start, _)| start),
                overlap_end_at: overlap.map(|(_, end)| end),
            });
        }
        Ok(rows)
    }

    async fn get_or_create_thread(&self, me: UserId, other: UserId) -> Result<ThreadId> {
        let mut store = self.write("get_or_create_thread").await?;
        if me == other {
            return Err(SyncError::write(
                "get_or_create_thread",
                "cannot open a thread with yourself",
            ));
        }
        if let Some(thread) = store
            .threads
            .iter()
            .find(|t| t.involves(me) && t.involves(other))
        {
            return Ok(thread.id);
        }
        let thread = Thread {
            id: ThreadId::new(),
            user_a: me,
            user_b: other,
        };
        store.threads.push(thread.clone());
        info!(thread = %thread.id, "Thread created");
        self.emit(Table::Threads, ChangeKind::Insert, Some(&thread), None)
            .await?;
        Ok(thread.id)
    }

    async fn send_message(&self, sender: UserId, thread: ThreadId, content: &str) -> Result<()> {
        let mut store = self.write("send_message").await?;
        if !store.thread(thread)?.involves(sender) {
            return Err(SyncError::write("send_message", "not a participant of this thread"));
        }
        let message = Message {
            id: MessageId::new(),
            thread_id: thread,
            sender_id: sender,
            content: content.to_string(),
            created_at: self.clock.now(),
            read_at: None,
        };
        store.messages.push(message.clone());
        self.emit(Table::Messages, ChangeKind::Insert, Some(&message), None)
            .await
    }

    async fn mark_thread_read(&self, user: UserId, thread: ThreadId) -> Result<()> {
        let mut store = self.write("mark_thread_read").await?;
        if !store.thread(thread)?.involves(user) {
            return Err(SyncError::write("mark_thread_read", "not a participant of this thread"));
        }
        let now = self.clock.now();
        let mut transitions = Vec::new();
        for message in store
            .messages
            .iter_mut()
            .filter(|m| m.thread_id == thread && m.is_unread_for(user))
        {
            let old = message.clone();
            message.read_at = Some(now);
            transitions.push((old, message.clone()));
        }
        for (old, new) in &transitions {
            self.emit(Table::Messages, ChangeKind::Update, Some(new), Some(old))
                .await?;
        }
        Ok(())
    }

    async fn count_unread_messages(&self, user: UserId) -> Result<u32> {
        let store = self.read("count_unread_messages").await?;
        let threads = store.thread_ids_of(user);
        let count = store
            .messages
            .iter()
            .filter(|m| threads.contains(&m.thread_id) && m.is_unread_for(user))
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn threads_for_user(&self, user: UserId) -> Result<Vec<Thread>> {
        let store = self.read("threads_for_user").await?;
        Ok(store
            .threads
            .iter()
            .filter(|t| t.involves(user))
            .cloned()
            .collect())
    }

    async fn recent_messages(&self, threads: &[ThreadId], limit: usize) -> Result<Vec<Message>> {
        let store = self.read("recent_messages").await?;
        let mut messages: Vec<Message> = store
            .messages
            .iter()
            .filter(|m| threads.contains(&m.thread_id))
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        messages.truncate(limit);
        Ok(messages)
    }

    async fn thread_messages(&self, thread: ThreadId) -> Result<Vec<Message>> {
        let store = self.read("thread_messages").await?;
        let mut messages: Vec<Message> = store
            .messages
            .iter()
            .filter(|m| m.thread_id == thread)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn profiles(&self, users: &[UserId]) -> Result<Vec<Profile>> {
        let store = self.read("profiles").await?;
        Ok(store
            .profiles
            .iter()
            .filter(|p| users.contains(&p.id))
            .cloned()
            .collect())
    }

    async fn update_profile(&self, user: UserId, edit: ProfileEdit) -> Result<Profile> {
        let mut store = self.write("update_profile").await?;
        let profile = store
            .profiles
            .iter_mut()
            .find(|p| p.id == user)
            .ok_or_else(|| SyncError::NotFound(format!("profile {user}")))?;
        let old = profile.clone();
        profile.display_name = edit.display_name;
        profile.bio = edit.bio;
        let new = profile.clone();
        self.emit(Table::Profiles, ChangeKind::Update, Some(&new), Some(&old))
            .await?;
        Ok(new)
    }

    async fn ratings_received(&self, user: UserId) -> Result<Vec<u8>> {
        let store = self.read("ratings_received").await?;
        Ok(store
            .feedback
            .iter()
            .filter(|f| f.ratee_id == user)
            .map(|f| f.rating)
            .collect())
    }

    async fn user_ratings(&self, users: &[UserId]) -> Result<Vec<UserRating>> {
        let store = self.read("user_ratings").await?;
        let mut ratings = Vec::new();
        for user in users {
            let given: Vec<u8> = store
                .feedback
                .iter()
                .filter(|f| f.ratee_id == *user)
                .map(|f| f.rating)
                .collect();
            if given.is_empty() {
                continue;
            }
            let total: u32 = given.iter().map(|r| u32::from(*r)).sum();
            let count = u32::try_from(given.len()).unwrap_or(u32::MAX);
            ratings.push(UserRating {
                user_id: *user,
                avg_rating: Some(f64::from(total) / f64::from(count)),
                rating_count: count,
            });
        }
        Ok(ratings)
    }

    async fn slots_owned_by(&self, owner: UserId) -> Result<Vec<Slot>> {
        let store = self.read("slots_owned_by").await?;
        Ok(ordered_by_start(
            store
                .slots
                .iter()
                .filter(|s| s.user_id == owner)
                .cloned()
                .collect(),
        ))
    }

    async fn upcoming_slots_excluding(
        &self,
        user: UserId,
        after: DateTime<Utc>,
    ) -> Result<Vec<Slot>> {
        let store = self.read("upcoming_slots_excluding").await?;
        Ok(ordered_by_start(
            store
                .slots
                .iter()
                .filter(|s| s.user_id != user && s.end_at > after)
                .cloned()
                .collect(),
        ))
    }

    async fn slot(&self, id: SlotId) -> Result<Option<Slot>> {
        let store = self.read("slot").await?;
        Ok(store.slots.iter().find(|s| s.id == id).cloned())
    }

    async fn insert_slot(&self, slot: NewSlot) -> Result<Slot> {
        let mut store = self.write("insert_slot").await?;
        check_range("insert_slot", slot.start_at, slot.end_at)?;
        let row = Slot {
            id: SlotId::new(),
            user_id: slot.owner,
            start_at: slot.start_at,
            end_at: slot.end_at,
            timezone: slot.timezone,
            notes: slot.notes,
        };
        store.slots.push(row.clone());
        self.emit(Table::AvailabilitySlots, ChangeKind::Insert, Some(&row), None)
            .await?;
        Ok(row)
    }

    async fn update_slot(&self, id: SlotId, owner: UserId, patch: SlotPatch) -> Result<Slot> {
        let mut store = self.write("update_slot").await?;
        let index = store.slot_index(id)?;
        if store.slots[index].user_id != owner {
            return Err(SyncError::write("update_slot", "only the owner may edit a slot"));
        }
        check_range("update_slot", patch.start_at, patch.end_at)?;
        let old = store.slots[index].clone();
        let slot = &mut store.slots[index];
        slot.start_at = patch.start_at;
        slot.end_at = patch.end_at;
        slot.timezone = patch.timezone;
        slot.notes = patch.notes;
        let new = slot.clone();
        self.emit(Table::AvailabilitySlots, ChangeKind::Update, Some(&new), Some(&old))
            .await?;
        Ok(new)
    }

    async fn delete_slot(&self, id: SlotId, owner: UserId) -> Result<()> {
        let mut store = self.write("delete_slot").await?;
        let index = store.slot_index(id)?;
        if store.slots[index].user_id != owner {
            return Err(SyncError::write("delete_slot", "only the owner may delete a slot"));
        }
        let (cancelled, kept): (Vec<Booking>, Vec<Booking>) = std::mem::take(&mut store.bookings)
            .into_iter()
            .partition(|b| b.slot_id == id);
        store.bookings = kept;
        let slot = store.slots.remove(index);
        for booking in &cancelled {
            self.emit(Table::Bookings, ChangeKind::Delete, None, Some(booking))
                .await?;
        }
        self.emit(Table::AvailabilitySlots, ChangeKind::Delete, None, Some(&slot))
            .await
    }

    async fn bookings_for_slots(&self, slots: &[SlotId]) -> Result<Vec<Booking>> {
        let store = self.read("bookings_for_slots").await?;
        Ok(store
            .bookings
            .iter()
            .filter(|b| slots.contains(&b.slot_id))
            .cloned()
            .collect())
    }

    async fn booking_for_slot(&self, slot: SlotId) -> Result<Option<Booking>> {
        let store = self.read("booking_for_slot").await?;
        Ok(store.bookings.iter().find(|b| b.slot_id == slot).cloned())
    }

    async fn insert_booking(&self, slot: SlotId, booker: UserId) -> Result<Booking> {
        let mut store = self.write("insert_booking").await?;
        let index = store.slot_index(slot)?;
        if store.slots[index].user_id == booker {
            return Err(SyncError::write("insert_booking", "cannot book your own slot"));
        }
        if store.bookings.iter().any(|b| b.slot_id == slot) {
            return Err(SyncError::Conflict(format!("slot {slot} is already booked")));
        }
        let booking = Booking {
            id: BookingId::new(),
            slot_id: slot,
            booker_id: booker,
            meeting_url: None,
        };
        store.bookings.push(booking.clone());
        self.emit(Table::Bookings, ChangeKind::Insert, Some(&booking), None)
            .await?;
        Ok(booking)
    }

    async fn delete_booking(&self, id: BookingId) -> Result<()> {
        let mut store = self.write("delete_booking").await?;
        let index = store
            .bookings
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("booking {id}")))?;
        let booking = store.bookings.remove(index);
        self.emit(Table::Bookings, ChangeKind::Delete, None, Some(&booking))
            .await
    }

    async fn skills(&self) -> Result<Vec<Skill>> {
        let store = self.read("skills").await?;
        let mut skills = store.skills.clone();
        skills.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
        Ok(skills)
    }

    async fn insert_skill(&self, title: &str) -> Result<Skill> {
        let mut store = self.write("insert_skill").await?;
        let title = title.trim();
        if store.title_taken(title, None) {
            return Err(SyncError::Conflict(format!("skill {title:?} already exists")));
        }
        let skill = Skill {
            id: SkillId::new(),
            title: title.to_string(),
        };
        store.skills.push(skill.clone());
        self.emit(Table::Skills, ChangeKind::Insert, Some(&skill), None)
            .await?;
        Ok(skill)
    }

    async fn rename_skill(&self, id: SkillId, title: &str) -> Result<Skill> {
        let mut store = self.write("rename_skill").await?;
        let title = title.trim();
        if store.title_taken(title, Some(id)) {
            return Err(SyncError::Conflict(format!("skill {title:?} already exists")));
        }
        let skill = store
            .skills
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("skill {id}")))?;
        let old = skill.clone();
        skill.title = title.to_string();
        let new = skill.clone();
        self.emit(Table::Skills, ChangeKind::Update, Some(&new), Some(&old))
            .await?;
        Ok(new)
    }

    async fn delete_skill(&self, id: SkillId) -> Result<()> {
        let mut store = self.write("delete_skill").await?;
        let index = store
            .skills
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("skill {id}")))?;
        let (dropped_offers, offers): (Vec<UserSkill>, Vec<UserSkill>) =
            std::mem::take(&mut store.offers)
                .into_iter()
                .partition(|o| o.skill_id == id);
        let (dropped_wants, wants): (Vec<UserSkill>, Vec<UserSkill>) =
            std::mem::take(&mut store.wants)
                .into_iter()
                .partition(|w| w.skill_id == id);
        store.offers = offers;
        store.wants = wants;
        store.proofs.retain(|p| p.skill_id != id);
        let skill = store.skills.remove(index);

        for offer in &dropped_offers {
            self.emit(Table::UserOffers, ChangeKind::Delete, None, Some(offer))
                .await?;
        }
        for want in &dropped_wants {
            self.emit(Table::UserWants, ChangeKind::Delete, None, Some(want))
                .await?;
        }
        self.emit(Table::Skills, ChangeKind::Delete, None, Some(&skill))
            .await
    }

    async fn offers(&self, user: UserId) -> Result<Vec<SkillId>> {
        let store = self.read("offers").await?;
        Ok(store
            .offers
            .iter()
            .filter(|o| o.user_id == user)
            .map(|o| o.skill_id)
            .collect())
    }

    async fn wants(&self, user: UserId) -> Result<Vec<SkillId>> {
        let store = self.read("wants").await?;
        Ok(store
            .wants
            .iter()
            .filter(|w| w.user_id == user)
            .map(|w| w.skill_id)
            .collect())
    }

    async fn insert_offer(&self, user: UserId, skill: SkillId) -> Result<()> {
        let mut store = self.write("insert_offer").await?;
        let row = UserSkill {
            user_id: user,
            skill_id: skill,
        };
        if store.offers.contains(&row) {
            return Err(SyncError::Conflict(format!("already offering skill {skill}")));
        }
        store.offers.push(row);
        self.emit(Table::UserOffers, ChangeKind::Insert, Some(&row), None)
            .await
    }

    async fn delete_offer(&self, user: UserId, skill: SkillId) -> Result<()> {
        let mut store = self.write("delete_offer").await?;
        let row = UserSkill {
            user_id: user,
            skill_id: skill,
        };
        let before = store.offers.len();
        store.offers.retain(|o| *o != row);
        if store.offers.len() == before {
            return Ok(());
        }
        self.emit(Table::UserOffers, ChangeKind::Delete, None, Some(&row))
            .await
    }

    async fn insert_want(&self, user: UserId, skill: SkillId) -> Result<()> {
        let mut store = self.write("insert_want").await?;
        let row = UserSkill {
            user_id: user,
            skill_id: skill,
        };
        if store.wants.contains(&row) {
            return Err(SyncError::Conflict(format!("already wanting skill {skill}")));
        }
        store.wants.push(row);
        self.emit(Table::UserWants, ChangeKind::Insert, Some(&row), None)
            .await
    }

    async fn delete_want(&self, user: UserId, skill: SkillId) -> Result<()> {
        let mut store = self.write("delete_want").await?;
        let row = UserSkill {
            user_id: user,
            skill_id: skill,
        };
        let before = store.wants.len();
        store.wants.retain(|w| *w != row);
        if store.wants.len() == before {
            return Ok(());
        }
        self.emit(Table::UserWants, ChangeKind::Delete, None, Some(&row))
            .await
    }

    async fn approved_proofs(&self, user: UserId) -> Result<Vec<SkillProof>> {
        let store = self.read("approved_proofs").await?;
        Ok(store
            .proofs
            .iter()
            .filter(|p| p.user_id == user && p.status == ProofStatus::Approved)
            .cloned()
            .collect())
    }

    async fn upload_proof(
        &self,
        user: UserId,
        skill: SkillId,
        document: &ProofDocument,
    ) -> Result<SkillProof> {
        let mut store = self.write("upload_proof").await?;
        if document.bytes.is_empty() {
            return Err(SyncError::write("upload_proof", "document is empty"));
        }
        if store.skill_title(skill).is_none() {
            return Err(SyncError::NotFound(format!("skill {skill}")));
        }
        let object = format!("{user}/{skill}/{}.{}", Uuid::new_v4(), document.extension());
        store.blobs.insert(object.clone(), document.bytes.clone());
        let proof = SkillProof {
            id: ProofId::new(),
            user_id: user,
            skill_id: skill,
            storage_path: format!("{PROOF_BUCKET}/{object}"),
            status: ProofStatus::Approved,
        };
        store.proofs.push(proof.clone());
        debug!(
            path = %proof.storage_path,
            content_type = document.mime(),
            bytes = document.bytes.len(),
            "Proof stored"
        );
        self.emit(Table::SkillProofs, ChangeKind::Insert, Some(&proof), None)
            .await?;
        Ok(proof)
    }

    async fn feedback_by(&self, slot: SlotId, rater: UserId) -> Result<Option<SessionFeedback>> {
        let store = self.read("feedback_by").await?;
        Ok(store
            .feedback
            .iter()
            .find(|f| f.slot_id == slot && f.rater_id == rater)
            .cloned())
    }

    async fn insert_feedback(&self, feedback: NewFeedback) -> Result<SessionFeedback> {
        let mut store = self.write("insert_feedback").await?;
        check_rating("insert_feedback", feedback.rating)?;
        if store
            .feedback
            .iter()
            .any(|f| f.slot_id == feedback.slot_id && f.rater_id == feedback.rater_id)
        {
            return Err(SyncError::Conflict(format!(
                "feedback for slot {} already left",
                feedback.slot_id
            )));
        }
        let row = SessionFeedback {
            id: FeedbackId::new(),
            slot_id: feedback.slot_id,
            rater_id: feedback.rater_id,
            ratee_id: feedback.ratee_id,
            rating: feedback.rating,
            note: feedback.note,
        };
        store.feedback.push(row.clone());
        self.emit(Table::SessionFeedback, ChangeKind::Insert, Some(&row), None)
            .await?;
        Ok(row)
    }

    async fn update_feedback(
        &self,
        id: FeedbackId,
        rating: u8,
        note: Option<String>,
    ) -> Result<SessionFeedback> {
        let mut store = self.write("update_feedback").await?;
        check_rating("update_feedback", rating)?;
        let row = store
            .feedback
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("feedback {id}")))?;
        let old = row.clone();
        row.rating = rating;
        row.note = note;
        let new = row.clone();
        self.emit(Table::SessionFeedback, ChangeKind::Update, Some(&new), Some(&old))
            .await?;
        Ok(new)
    }
}

fn minute_of_day(instant: DateTime<Utc>) -> Option<u16> {
    u16::try_from(instant.hour() * 60 + instant.minute()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::feed::{ChangeFeed, FeedSignal, Interest, ScopeKey};
    use chrono::{Duration, TimeZone};

    fn backend() -> MemoryBackend {
        let start = Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap();
        MemoryBackend::new(Arc::new(ManualClock::new(start)))
    }

    fn new_slot(owner: UserId, hour: u32) -> NewSlot {
        NewSlot {
            owner,
            start_at: Utc.with_ymd_and_hms(2024, 5, 6, hour, 0, 0).unwrap(),
            end_at: Utc.with_ymd_and_hms(2024, 5, 6, hour + 1, 0, 0).unwrap(),
            timezone: "UTC".into(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_one_thread_per_unordered_pair() {
        let backend = backend();
        let (a, b) = (UserId::new(), UserId::new());
        let first = backend.get_or_create_thread(a, b).await.unwrap();
        let again = backend.get_or_create_thread(b, a).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(backend.threads_for_user(a).await.unwrap().len(), 1);
        assert!(backend.get_or_create_thread(a, a).await.is_err());
    }

    #[tokio::test]
    async fn test_second_booking_conflicts() {
        let backend = backend();
        let (owner, b, c) = (UserId::new(), UserId::new(), UserId::new());
        let slot = backend.insert_slot(new_slot(owner, 10)).await.unwrap();

        backend.insert_booking(slot.id, b).await.unwrap();
        let err = backend.insert_booking(slot.id, c).await.unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));
        assert!(backend.insert_booking(slot.id, owner).await.is_err());
    }

    #[tokio::test]
    async fn test_deleting_slot_publishes_booking_delete_first() {
        let backend = backend();
        let (owner, booker) = (UserId::new(), UserId::new());
        let slot = backend.insert_slot(new_slot(owner, 10)).await.unwrap();
        backend.insert_booking(slot.id, booker).await.unwrap();

        let mut sub = backend
            .feed()
            .subscribe(
                ScopeKey::new("watch"),
                vec![
                    Interest::all(Table::Bookings),
                    Interest::all(Table::AvailabilitySlots),
                ],
            )
            .await
            .unwrap();
        backend.delete_slot(slot.id, owner).await.unwrap();

        let tables: Vec<Table> = std::iter::from_fn(|| sub.try_next())
            .filter_map(|signal| match signal {
                FeedSignal::Change(change) => Some(change.table),
                _ => None,
            })
            .collect();
        assert_eq!(tables, vec![Table::Bookings, Table::AvailabilitySlots]);
        assert!(backend.booking_for_slot(slot.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_instant_is_set_once() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let backend = MemoryBackend::new(clock.clone());
        let (a, b) = (UserId::new(), UserId::new());
        let thread = backend.get_or_create_thread(a, b).await.unwrap();
        backend.send_message(b, thread, "hello").await.unwrap();

        backend.mark_thread_read(a, thread).await.unwrap();
        let first = backend.thread_messages(thread).await.unwrap()[0].read_at;
        clock.advance(Duration::minutes(5));
        backend.mark_thread_read(a, thread).await.unwrap();
        let second = backend.thread_messages(thread).await.unwrap()[0].read_at;

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(backend.count_unread_messages(a).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_skill_titles_are_unique_ignoring_case() {
        let backend = backend();
        backend.insert_skill("Guitar").await.unwrap();
        let err = backend.insert_skill("guitar").await.unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));
        assert_eq!(backend.skills().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_faults_fire_once() {
        let backend = backend();
        backend.fail_next_write("insert_skill", "policy").await;
        assert!(backend.insert_skill("Chess").await.is_err());
        assert!(backend.insert_skill("Chess").await.is_ok());

        backend.fail_reads("skills", 2).await;
        assert!(backend.skills().await.is_err());
        assert!(backend.skills().await.is_err());
        assert!(backend.skills().await.is_ok());
    }

    #[tokio::test]
    async fn test_profile_edit_publishes_update() {
        let backend = backend();
        let user = UserId::new();
        backend
            .put_profile(Profile {
                id: user,
                display_name: Some("Ada".into()),
                email: Some("ada@example.com".into()),
                bio: None,
            })
            .await;
        let mut sub = backend
            .feed()
            .subscribe(ScopeKey::new("profiles"), vec![Interest::all(Table::Profiles)])
            .await
            .unwrap();

        let edit = ProfileEdit {
            display_name: Some("Ada L.".into()),
            bio: Some("Teaches chess".into()),
        };
        let saved = backend.update_profile(user, edit).await.unwrap();
        assert_eq!(saved.email.as_deref(), Some("ada@example.com"));
        assert_eq!(saved.bio.as_deref(), Some("Teaches chess"));
        assert!(matches!(sub.try_next(), Some(FeedSignal::Change(c)) if c.kind == ChangeKind::Update));

        let missing = backend.update_profile(UserId::new(), ProfileEdit::default()).await;
        assert!(matches!(missing, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_ratings_received_only_counts_ratee() {
        let backend = backend();
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());
        let first = backend.insert_slot(new_slot(a, 10)).await.unwrap();
        let second = backend.insert_slot(new_slot(a, 12)).await.unwrap();
        for (slot, rater, ratee, rating) in [(first.id, b, a, 5), (second.id, c, a, 3), (first.id, a, b, 4)] {
            backend
                .insert_feedback(NewFeedback {
                    slot_id: slot,
                    rater_id: rater,
                    ratee_id: ratee,
                    rating,
                    note: None,
                })
                .await
                .unwrap();
        }

        let mut received = backend.ratings_received(a).await.unwrap();
        received.sort_unstable();
        assert_eq!(received, vec![3, 5]);
        assert!(backend.ratings_received(c).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_matches_need_both_directions() {
        let backend = backend();
        let (a, b) = (UserId::new(), UserId::new());
        let guitar = backend.insert_skill("Guitar").await.unwrap();
        let spanish = backend.insert_skill("Spanish").await.unwrap();

        backend.insert_offer(a, guitar.id).await.unwrap();
        backend.insert_want(b, guitar.id).await.unwrap();
        assert!(backend.find_complementary_matches(a).await.unwrap().is_empty());

        backend.insert_offer(b, spanish.id).await.unwrap();
        backend.insert_want(a, spanish.id).await.unwrap();
        backend.insert_slot(new_slot(a, 10)).await.unwrap();
        let mut other = new_slot(b, 10);
        other.start_at += Duration::minutes(30);
        other.end_at += Duration::minutes(30);
        backend.insert_slot(other).await.unwrap();

        let rows = backend.find_complementary_matches(a).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].offer_to_them, vec!["Guitar".to_string()]);
        assert_eq!(rows[0].want_from_them, vec!["Spanish".to_string()]);
        assert_eq!(rows[0].overlap_start_min, Some(10 * 60 + 30));
        assert_eq!(rows[0].overlap_end_min, Some(11 * 60));
        assert_eq!(rows[0].overlap_weekday, Some(1));
    }
}
