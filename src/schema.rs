//! Remote schema definitions
//!
//! Table and column names of the managed store, shared by the feed filters,
//! the boundary parser and the in-memory backend.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tables the client reads, writes or subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// User profiles
    Profiles,
    /// Skill catalogue
    Skills,
    /// Skills a user offers to teach
    UserOffers,
    /// Skills a user wants to learn
    UserWants,
    /// Owner-defined time blocks
    AvailabilitySlots,
    /// Claims on slots
    Bookings,
    /// Two-party conversation containers
    Threads,
    /// Chat messages
    Messages,
    /// Uploaded proof documents
    SkillProofs,
    /// Post-session ratings
    SessionFeedback,
    /// Aggregated ratings view
    UserRatings,
}

impl Table {
    /// Name of the table in the remote store
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Profiles => "profiles",
            Self::Skills => "skills",
            Self::UserOffers => "user_offers",
            Self::UserWants => "user_wants",
            Self::AvailabilitySlots => "availability_slots",
            Self::Bookings => "bookings",
            Self::Threads => "threads",
            Self::Messages => "messages",
            Self::SkillProofs => "skill_proofs",
            Self::SessionFeedback => "session_feedback",
            Self::UserRatings => "user_ratings",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages table columns
pub mod messages {
    /// Owning thread column
    pub const THREAD_ID: &str = "thread_id";
    /// Sender column
    pub const SENDER_ID: &str = "sender_id";
    /// Read instant column
    pub const READ_AT: &str = "read_at";
}

/// Threads table columns
pub mod threads {
    /// First participant column
    pub const USER_A: &str = "user_a";
    /// Second participant column
    pub const USER_B: &str = "user_b";
}

/// Availability slots table columns
pub mod availability_slots {
    /// Owner column
    pub const USER_ID: &str = "user_id";
}

/// Bookings table columns
pub mod bookings {
    /// Booked slot column
    pub const SLOT_ID: &str = "slot_id";
}

/// Storage bucket holding proof documents
pub const PROOF_BUCKET: &str = "skill-proofs";
