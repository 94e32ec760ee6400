//! Data models for rows received from the remote store
//!
//! Every table the client touches gets an explicit record type. Rows are parsed
//! and checked when they cross the boundary (query response or feed event), so
//! nothing downstream handles half-shaped data.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::Keyed;
use crate::schema::Table;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// First eight characters, used as a display fallback
            #[must_use]
            pub fn short(&self) -> String {
                self.0.to_string().chars().take(8).collect()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

entity_id!(
    /// Authenticated user id
    UserId
);
entity_id!(
    /// Conversation id
    ThreadId
);
entity_id!(
    /// Chat message id
    MessageId
);
entity_id!(
    /// Availability slot id
    SlotId
);
entity_id!(
    /// Booking id
    BookingId
);
entity_id!(
    /// Skill id
    SkillId
);
entity_id!(
    /// Session feedback id
    FeedbackId
);
entity_id!(
    /// Skill proof id
    ProofId
);

/// A typed row of one remote table.
pub trait Record: DeserializeOwned + Clone + Send + Sync + 'static {
    /// Table the row belongs to
    const TABLE: Table;

    /// Row-level invariants beyond the shape checked by serde
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Public profile of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Profile owner
    pub id: UserId,
    /// Chosen display name
    #[serde(default)]
    pub display_name: Option<String>,
    /// Account email
    #[serde(default)]
    pub email: Option<String>,
    /// Free-text introduction
    #[serde(default)]
    pub bio: Option<String>,
}

/// Editable part of the signed-in user's profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileEdit {
    /// New display name; `None` clears it
    pub display_name: Option<String>,
    /// New bio; `None` clears it
    pub bio: Option<String>,
}

impl Profile {
    /// Display label: display name, then email, then the short id
    #[must_use]
    pub fn label(&self) -> String {
        non_blank(self.display_name.as_deref())
            .or_else(|| non_blank(self.email.as_deref()))
            .map_or_else(|| self.id.short(), str::to_string)
    }
}

/// A conversation container between exactly two users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    /// Thread id
    pub id: ThreadId,
    /// One participant
    pub user_a: UserId,
    /// The other participant
    pub user_b: UserId,
}

impl Thread {
    /// True when `user` is one of the two participants
    #[must_use]
    pub fn involves(&self, user: UserId) -> bool {
        self.user_a == user || self.user_b == user
    }

    /// The participant that is not `viewer`
    #[must_use]
    pub fn other(&self, viewer: UserId) -> Option<UserId> {
        if self.user_a == viewer {
            Some(self.user_b)
        } else if self.user_b == viewer {
            Some(self.user_a)
        } else {
            None
        }
    }
}

/// A chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned id
    pub id: MessageId,
    /// Owning thread
    pub thread_id: ThreadId,
    /// Author
    pub sender_id: UserId,
    /// Text content
    pub content: String,
    /// Server-assigned creation instant
    pub created_at: DateTime<Utc>,
    /// Set once the recipient has read the message
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Incoming for `viewer` means sent by the other participant
    #[must_use]
    pub fn is_incoming_for(&self, viewer: UserId) -> bool {
        self.sender_id != viewer
    }

    /// Incoming and not yet read
    #[must_use]
    pub fn is_unread_for(&self, viewer: UserId) -> bool {
        self.is_incoming_for(viewer) && self.read_at.is_none()
    }
}

/// An owner-defined block of time offered for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Slot id
    pub id: SlotId,
    /// Owner
    pub user_id: UserId,
    /// Start instant
    pub start_at: DateTime<Utc>,
    /// End instant, strictly after start
    pub end_at: DateTime<Utc>,
    /// Timezone label chosen by the owner
    pub timezone: String,
    /// Free-form notes
    #[serde(default)]
    pub notes: Option<String>,
}

/// Fields of a slot being created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSlot {
    /// Owner
    pub owner: UserId,
    /// Start instant
    pub start_at: DateTime<Utc>,
    /// End instant
    pub end_at: DateTime<Utc>,
    /// Timezone label
    pub timezone: String,
    /// Free-form notes
    pub notes: Option<String>,
}

/// Owner edit of an existing slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPatch {
    /// New start instant
    pub start_at: DateTime<Utc>,
    /// New end instant
    pub end_at: DateTime<Utc>,
    /// New timezone label
    pub timezone: String,
    /// New notes
    pub notes: Option<String>,
}

/// A claim on a slot by a non-owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Booking id
    pub id: BookingId,
    /// Booked slot, unique across bookings
    pub slot_id: SlotId,
    /// User who booked
    pub booker_id: UserId,
    /// Call link, once known
    #[serde(default)]
    pub meeting_url: Option<String>,
}

/// Rating left by one participant about the other after a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFeedback {
    /// Feedback id
    pub id: FeedbackId,
    /// Session slot
    pub slot_id: SlotId,
    /// Author
    pub rater_id: UserId,
    /// Subject
    pub ratee_id: UserId,
    /// 1 to 5 stars
    pub rating: u8,
    /// Optional comment
    #[serde(default)]
    pub note: Option<String>,
}

/// Fields of a feedback row being created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFeedback {
    /// Session slot
    pub slot_id: SlotId,
    /// Author
    pub rater_id: UserId,
    /// Subject
    pub ratee_id: UserId,
    /// 1 to 5 stars
    pub rating: u8,
    /// Optional comment
    pub note: Option<String>,
}

/// A skill in the shared catalogue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    /// Skill id
    pub id: SkillId,
    /// Title as entered
    pub title: String,
}

/// A row of `user_offers` or `user_wants`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSkill {
    /// User
    pub user_id: UserId,
    /// Skill
    pub skill_id: SkillId,
}

/// Review state of a proof document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    /// Awaiting review
    Pending,
    /// Accepted; enables teaching the skill
    Approved,
    /// Refused
    Rejected,
}

/// An uploaded document proving a skill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillProof {
    /// Proof id
    pub id: ProofId,
    /// Uploader
    pub user_id: UserId,
    /// Proven skill
    pub skill_id: SkillId,
    /// `<bucket>/<user>/<skill>/<uuid>.<ext>`
    pub storage_path: String,
    /// Review state
    pub status: ProofStatus,
}

/// A document picked by the user as proof of a skill
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofDocument {
    /// Original file name
    pub file_name: String,
    /// MIME type reported by the picker
    pub content_type: Option<String>,
    /// File contents
    pub bytes: Vec<u8>,
}

impl ProofDocument {
    /// Lower-cased file extension, `pdf` when the name has none
    #[must_use]
    pub fn extension(&self) -> String {
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
            .unwrap_or("pdf")
            .to_lowercase()
    }

    /// MIME type, defaulting to a generic binary type
    #[must_use]
    pub fn mime(&self) -> &str {
        self.content_type
            .as_deref()
            .unwrap_or("application/octet-stream")
    }
}

/// Aggregated rating of a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRating {
    /// Rated user
    pub user_id: UserId,
    /// Mean rating
    #[serde(default)]
    pub avg_rating: Option<f64>,
    /// Number of ratings
    #[serde(default)]
    pub rating_count: u32,
}

/// A user whose offers and wants complement the viewer's
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRow {
    /// Matched user
    pub other_id: UserId,
    /// Matched user's display name
    #[serde(default)]
    pub other_name: Option<String>,
    /// Matched user's email
    #[serde(default)]
    pub other_email: Option<String>,
    /// Skills the viewer can teach them
    #[serde(default)]
    pub offer_to_them: Vec<String>,
    /// Skills the viewer can learn from them
    #[serde(default)]
    pub want_from_them: Vec<String>,
    /// Weekday of the first availability overlap (0 = Sunday)
    #[serde(default)]
    pub overlap_weekday: Option<u8>,
    /// Overlap start, minutes after midnight
    #[serde(default)]
    pub overlap_start_min: Option<u16>,
    /// Overlap end, minutes after midnight
    #[serde(default)]
    pub overlap_end_min: Option<u16>,
    /// Concrete overlap start, when known
    #[serde(default)]
    pub overlap_start_at: Option<DateTime<Utc>>,
    /// Concrete overlap end, when known
    #[serde(default)]
    pub overlap_end_at: Option<DateTime<Utc>>,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl Record for Profile {
    const TABLE: Table = Table::Profiles;
}

impl Record for Thread {
    const TABLE: Table = Table::Threads;

    fn check(&self) -> Result<(), String> {
        if self.user_a == self.user_b {
            return Err("thread participants must differ".to_string());
        }
        Ok(())
    }
}

impl Record for Message {
    const TABLE: Table = Table::Messages;
}

impl Record for Slot {
    const TABLE: Table = Table::AvailabilitySlots;

    fn check(&self) -> Result<(), String> {
        if self.end_at <= self.start_at {
            return Err(format!(
                "slot {} ends at {} which is not after its start {}",
                self.id, self.end_at, self.start_at
            ));
        }
        Ok(())
    }
}

impl Record for Booking {
    const TABLE: Table = Table::Bookings;
}

impl Record for SessionFeedback {
    const TABLE: Table = Table::SessionFeedback;

    fn check(&self) -> Result<(), String> {
        if !(1..=5).contains(&self.rating) {
            return Err(format!("rating {} outside 1..=5", self.rating));
        }
        Ok(())
    }
}

impl Record for Skill {
    const TABLE: Table = Table::Skills;
}

impl Record for SkillProof {
    const TABLE: Table = Table::SkillProofs;
}

impl Record for UserRating {
    const TABLE: Table = Table::UserRatings;
}

impl Keyed for Thread {
    type Key = ThreadId;
    fn key(&self) -> ThreadId {
        self.id
    }
}

impl Keyed for Message {
    type Key = MessageId;
    fn key(&self) -> MessageId {
        self.id
    }
}

impl Keyed for Slot {
    type Key = SlotId;
    fn key(&self) -> SlotId {
        self.id
    }
}

impl Keyed for Booking {
    type Key = BookingId;
    fn key(&self) -> BookingId {
        self.id
    }
}

impl Keyed for Skill {
    type Key = SkillId;
    fn key(&self) -> SkillId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_label_fallbacks() {
        let id = UserId::new();
        let mut profile = Profile {
            id,
            display_name: Some("Ada".into()),
            email: Some("ada@example.com".into()),
            bio: None,
        };
        assert_eq!(profile.label(), "Ada");

        profile.display_name = Some("   ".into());
        assert_eq!(profile.label(), "ada@example.com");

        profile.email = None;
        assert_eq!(profile.label(), id.short());
        assert_eq!(profile.label().len(), 8);
    }

    #[test]
    fn test_thread_other_participant() {
        let (a, b) = (UserId::new(), UserId::new());
        let thread = Thread {
            id: ThreadId::new(),
            user_a: a,
            user_b: b,
        };
        assert_eq!(thread.other(a), Some(b));
        assert_eq!(thread.other(b), Some(a));
        assert_eq!(thread.other(UserId::new()), None);
    }

    #[test]
    fn test_proof_extension() {
        let mut doc = ProofDocument {
            file_name: "Certificate.PDF".into(),
            content_type: None,
            bytes: vec![1, 2, 3],
        };
        assert_eq!(doc.extension(), "pdf");
        doc.file_name = "scan.jpeg".into();
        assert_eq!(doc.extension(), "jpeg");
        doc.file_name = "noext".into();
        assert_eq!(doc.extension(), "pdf");
        assert_eq!(doc.mime(), "application/octet-stream");
    }

    #[test]
    fn test_slot_check_rejects_inverted_range() {
        let now = Utc::now();
        let slot = Slot {
            id: SlotId::new(),
            user_id: UserId::new(),
            start_at: now,
            end_at: now,
            timezone: "UTC".into(),
            notes: None,
        };
        assert!(slot.check().is_err());
    }
}
