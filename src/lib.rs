//! Skillswap Sync - Realtime Client Synchronization
//!
//! The client-side layer of the skillswap teach/learn matching app: it keeps
//! local projections of remote tables consistent with a push-based change
//! feed, shows optimistic updates until the store confirms them, and drives
//! the time-based session phases of booked meetings.
//!
//! # Features
//!
//! - Scoped change-feed subscriptions with explicit teardown
//! - Projection caches where an authoritative reload wins over stale patches
//! - Incremental unread badge with periodic reconciliation
//! - Inbox previews, chat with optimistic sends, slot booking
//! - Session phase clock with a one-shot reminder
//! - In-memory backend for tests and demos

/// Remote store contract
pub mod backend;
/// Keyed projection caches
pub mod cache;
/// Chat screen
pub mod chat;
/// Wall-clock access
pub mod clock;
/// Configuration management
pub mod config;
/// Error types
pub mod error;
/// In-app event bus
pub mod events;
/// Change-feed subscriptions
pub mod feed;
/// Inbox previews
pub mod inbox;
/// Logging setup and utilities
pub mod logging;
/// Matches screen
pub mod matches;
/// Meeting screen
pub mod meeting;
/// In-process backend
pub mod memory;
/// Metrics collection
pub mod metrics;
/// Data models and structures
pub mod models;
/// Own profile screen
pub mod profile;
/// Read retry with backoff
pub mod retry;
/// Remote schema definitions
pub mod schema;
/// Session phase state machine
pub mod session;
/// Skills screen
pub mod skills;
/// Slots and bookings
pub mod slots;
/// Unread counter and badge
pub mod unread;
/// Input validation and sanitization
pub mod validation;

// Re-export key components for easier access
pub use backend::Backend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{Result, SyncError, UserAlert};
pub use events::{LocalEvent, LocalEvents};
pub use feed::{ChangeFeed, FeedHub, FeedSignal, Lifecycle};
pub use memory::MemoryBackend;
pub use session::SessionPhase;
pub use unread::badge_label;
