//! Remote store contract
//!
//! Everything durable lives behind this trait: table reads and writes, the
//! messaging procedures and blob storage. The acting user is passed
//! explicitly where the hosted store would take it from the session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    Booking, BookingId, FeedbackId, MatchRow, Message, NewFeedback, NewSlot, Profile,
    ProfileEdit, ProofDocument, SessionFeedback, Skill, SkillId, SkillProof, Slot, SlotId, SlotPatch, Thread,
    ThreadId, UserId, UserRating,
};

/// Remote procedures, tables and storage used by the client
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Users whose offers and wants complement `user`'s
    async fn find_complementary_matches(&self, user: UserId) -> Result<Vec<MatchRow>>;

    /// Thread between `me` and `other`, created on first contact
    async fn get_or_create_thread(&self, me: UserId, other: UserId) -> Result<ThreadId>;

    /// Append a message; the store assigns id and creation instant
    async fn send_message(&self, sender: UserId, thread: ThreadId, content: &str) -> Result<()>;

    /// Mark every incoming unread message of `thread` as read for `user`
    async fn mark_thread_read(&self, user: UserId, thread: ThreadId) -> Result<()>;

    /// Authoritative number of unread incoming messages across all threads
    async fn count_unread_messages(&self, user: UserId) -> Result<u32>;

    /// Threads `user` participates in
    async fn threads_for_user(&self, user: UserId) -> Result<Vec<Thread>>;

    /// Most recent messages of `threads`, newest first, at most `limit`
    async fn recent_messages(&self, threads: &[ThreadId], limit: usize) -> Result<Vec<Message>>;

    /// All messages of one thread, oldest first
    async fn thread_messages(&self, thread: ThreadId) -> Result<Vec<Message>>;

    /// Profiles of `users`; unknown ids are skipped
    async fn profiles(&self, users: &[UserId]) -> Result<Vec<Profile>>;

    /// Change the display name and bio of `user`'s own profile
    async fn update_profile(&self, user: UserId, edit: ProfileEdit) -> Result<Profile>;

    /// Every rating `user` received as a ratee
    async fn ratings_received(&self, user: UserId) -> Result<Vec<u8>>;

    /// Aggregated ratings of `users`; unrated users are skipped
    async fn user_ratings(&self, users: &[UserId]) -> Result<Vec<UserRating>>;

    /// Slots owned by `owner`, by start
    async fn slots_owned_by(&self, owner: UserId) -> Result<Vec<Slot>>;

    /// Slots ending after `after` not owned by `user`, by start
    async fn upcoming_slots_excluding(
        &self,
        user: UserId,
        after: DateTime<Utc>,
    ) -> Result<Vec<Slot>>;

    /// One slot
    async fn slot(&self, id: SlotId) -> Result<Option<Slot>>;

    /// Create a slot
    async fn insert_slot(&self, slot: NewSlot) -> Result<Slot>;

    /// Edit a slot; only its owner may
    async fn update_slot(&self, id: SlotId, owner: UserId, patch: SlotPatch) -> Result<Slot>;

    /// Delete a slot together with its booking; only its owner may
    async fn delete_slot(&self, id: SlotId, owner: UserId) -> Result<()>;

    /// Bookings of `slots`
    async fn bookings_for_slots(&self, slots: &[SlotId]) -> Result<Vec<Booking>>;

    /// Booking of one slot
    async fn booking_for_slot(&self, slot: SlotId) -> Result<Option<Booking>>;

    /// Book a slot; fails with a conflict if it is already booked
    async fn insert_booking(&self, slot: SlotId, booker: UserId) -> Result<Booking>;

    /// Cancel a booking, freeing its slot
    async fn delete_booking(&self, id: BookingId) -> Result<()>;

    /// Skill catalogue ordered by title
    async fn skills(&self) -> Result<Vec<Skill>>;

    /// Add a skill to the catalogue
    async fn insert_skill(&self, title: &str) -> Result<Skill>;

    /// Rename a skill
    async fn rename_skill(&self, id: SkillId, title: &str) -> Result<Skill>;

    /// Remove a skill and every offer, want and proof referencing it
    async fn delete_skill(&self, id: SkillId) -> Result<()>;

    /// Skills `user` offers to teach
    async fn offers(&self, user: UserId) -> Result<Vec<SkillId>>;

    /// Skills `user` wants to learn
    async fn wants(&self, user: UserId) -> Result<Vec<SkillId>>;

    /// Start offering a skill
    async fn insert_offer(&self, user: UserId, skill: SkillId) -> Result<()>;

    /// Stop offering a skill
    async fn delete_offer(&self, user: UserId, skill: SkillId) -> Result<()>;

    /// Start wanting a skill
    async fn insert_want(&self, user: UserId, skill: SkillId) -> Result<()>;

    /// Stop wanting a skill
    async fn delete_want(&self, user: UserId, skill: SkillId) -> Result<()>;

    /// Approved proofs uploaded by `user`
    async fn approved_proofs(&self, user: UserId) -> Result<Vec<SkillProof>>;

    /// Store a proof document and record it
    async fn upload_proof(
        &self,
        user: UserId,
        skill: SkillId,
        document: &ProofDocument,
    ) -> Result<SkillProof>;

    /// Feedback `rater` left for a session
    async fn feedback_by(&self, slot: SlotId, rater: UserId) -> Result<Option<SessionFeedback>>;

    /// Leave feedback; one row per (slot, rater)
    async fn insert_feedback(&self, feedback: NewFeedback) -> Result<SessionFeedback>;

    /// Change an existing feedback row
    async fn update_feedback(
        &self,
        id: FeedbackId,
        rating: u8,
        note: Option<String>,
    ) -> Result<SessionFeedback>;
}
