//! Availability slots and their bookings
//!
//! Two views share the same rows: people browsing other owners' upcoming
//! slots, and an owner managing their own. Both reload authoritatively on
//! mount and keep the booking state of each slot in sync from the feed.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::cache::ProjectionCache;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::error::{Result, SyncError};
use crate::feed::{
    Change, ChangeFeed, ColumnFilter, FeedSignal, Interest, Lifecycle, ScopeKey, SubscriptionSet,
};
use crate::metrics::SyncMetrics;
use crate::models::{Booking, BookingId, NewSlot, Profile, Slot, SlotId, SlotPatch, UserId};
use crate::retry::{retry_read, RetryPolicy};
use crate::schema::{availability_slots, Table};
use crate::validation::InputValidator;

/// How a slot looks to a given viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    /// Free and owned by someone else
    Bookable,
    /// Booked by the viewer
    BookedByYou,
    /// Booked by someone else
    BookedByOther,
    /// Owned by the viewer
    Own,
}

impl SlotStatus {
    /// Status of a slot owned by `owner` and booked by `booked_by`
    #[must_use]
    pub fn for_viewer(viewer: UserId, owner: UserId, booked_by: Option<UserId>) -> Self {
        if owner == viewer {
            return Self::Own;
        }
        match booked_by {
            None => Self::Bookable,
            Some(booker) if booker == viewer => Self::BookedByYou,
            Some(_) => Self::BookedByOther,
        }
    }

    /// Label shown on the slot card
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Bookable => "Available",
            Self::BookedByYou => "Booked (you)",
            Self::BookedByOther => "Booked",
            Self::Own => "Your slot",
        }
    }

    /// The viewer may book it
    #[must_use]
    pub const fn can_book(self) -> bool {
        matches!(self, Self::Bookable)
    }

    /// The viewer may cancel its booking from this view
    #[must_use]
    pub const fn can_cancel(self) -> bool {
        matches!(self, Self::BookedByYou)
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A slot on the browse list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotListing {
    /// The slot
    pub slot: Slot,
    /// Who booked it, if anyone
    pub booked_by: Option<UserId>,
    /// Owner email, or another label when it has none
    pub owner_label: Option<String>,
    /// Status for the viewer
    pub status: SlotStatus,
}

#[derive(Debug, Clone, Copy)]
struct BookedBy {
    booking: BookingId,
    booker: UserId,
}

/// Controller of the browse-and-book screen
pub struct BrowseSlotsScreen {
    backend: Arc<dyn Backend>,
    feed: Arc<dyn ChangeFeed>,
    clock: Arc<dyn Clock>,
    viewer: UserId,
    retry: RetryPolicy,
    slots: ProjectionCache<Slot>,
    booked: HashMap<SlotId, BookedBy>,
    owners: HashMap<UserId, String>,
    scope: ScopeKey,
    subscriptions: SubscriptionSet,
    lifecycle: Lifecycle,
}

impl BrowseSlotsScreen {
    /// Load upcoming slots of other owners and attach to the feed
    pub async fn mount(
        backend: Arc<dyn Backend>,
        feed: Arc<dyn ChangeFeed>,
        clock: Arc<dyn Clock>,
        viewer: UserId,
        config: &AppConfig,
    ) -> Result<Self> {
        let mut screen = Self {
            backend,
            feed,
            clock,
            viewer,
            retry: RetryPolicy::from(&config.retry),
            slots: ProjectionCache::new("browse_slots"),
            booked: HashMap::new(),
            owners: HashMap::new(),
            scope: ScopeKey::new(format!("browse-slots-{viewer}")),
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
                    Interest::all(Table::AvailabilitySlots),
                    Interest::all(Table::Bookings),
                ],
            )
            .await?;
        info!(viewer = %viewer, slots = screen.slots.len(), "Browse slots mounted");
        Ok(screen)
    }

    /// Authoritative reload of slots, bookings and owner labels
    pub async fn reload(&mut self) -> Result<()> {
        let ticket = self.slots.begin_reload();
        let backend = Arc::clone(&self.backend);
        let (viewer, now) = (self.viewer, self.clock.now());

        let slots = retry_read(&self.retry, "upcoming_slots_excluding", || {
            backend.upcoming_slots_excluding(viewer, now)
        })
        .await?;
        let slot_ids: Vec<SlotId> = slots.iter().map(|s| s.id).collect();
        let bookings = if slot_ids.is_empty() {
            Vec::new()
        } else {
            retry_read(&self.retry, "bookings_for_slots", || {
                backend.bookings_for_slots(&slot_ids)
            })
            .await?
        };
        let owner_ids: Vec<UserId> = slots
            .iter()
            .map(|s| s.user_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let profiles = if owner_ids.is_empty() {
            Vec::new()
        } else {
            retry_read(&self.retry, "profiles", || backend.profiles(&owner_ids)).await?
        };

        if !self.lifecycle.is_alive() || !self.slots.complete_reload(ticket, slots) {
            return Ok(());
        }
        self.booked = bookings
            .into_iter()
            .map(|b| {
                (
                    b.slot_id,
                    BookedBy {
                        booking: b.id,
                        booker: b.booker_id,
                    },
                )
            })
            .collect();
        self.owners = profiles
            .into_iter()
            .map(|p| (p.id, owner_label(&p)))
            .collect();
        debug!(viewer = %viewer, slots = self.slots.len(), booked = self.booked.len(), "Browse slots reloaded");
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
                    Table::Bookings => match row.decode::<Booking>() {
                        Ok(change) => self.patch_booking(change),
                        Err(_) => self.reload().await?,
                    },
                    Table::AvailabilitySlots => self.reload().await?,
                    _ => {}
                }
            }
            FeedSignal::Dropped(reason) => {
                warn!(scope = %self.scope, reason, "Browse feed dropped, reloading");
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

    /// Listings ordered by start
    #[must_use]
    pub fn listings(&self) -> Vec<SlotListing> {
        let mut listings: Vec<SlotListing> = self
            .slots
            .iter()
            .map(|slot| {
                let booked_by = self.booked.get(&slot.id).map(|b| b.booker);
                SlotListing {
                    slot: slot.clone(),
                    booked_by,
                    owner_label: self.owners.get(&slot.user_id).cloned(),
                    status: SlotStatus::for_viewer(self.viewer, slot.user_id, booked_by),
                }
            })
            .collect();
        listings.sort_by(|a, b| a.slot.start_at.cmp(&b.slot.start_at).then(a.slot.id.cmp(&b.slot.id)));
        listings
    }

    /// Listing of one slot
    #[must_use]
    pub fn listing(&self, slot: SlotId) -> Option<SlotListing> {
        self.listings().into_iter().find(|l| l.slot.id == slot)
    }

    /// Book a free slot. Never retried; a lost race surfaces as a conflict.
    pub async fn book(&mut self, slot: SlotId) -> Result<Booking> {
        let listing = self
            .listing(slot)
            .ok_or_else(|| SyncError::NotFound(format!("slot {slot}")))?;
        match listing.status {
            SlotStatus::Own => {
                return Err(SyncError::Validation("You cannot book your own slot".into()))
            }
            SlotStatus::BookedByYou | SlotStatus::BookedByOther => {
                return Err(SyncError::Conflict(format!("slot {slot} is already booked")))
            }
            SlotStatus::Bookable => {}
        }

        let booking = match self.backend.insert_booking(slot, self.viewer).await {
            Ok(booking) => booking,
            Err(err) => {
                error!(slot = %slot, error = %err, "Booking failed");
                SyncMetrics::record_write_failure("insert_booking");
                return Err(err);
            }
        };
        if self.lifecycle.is_alive() {
            self.patch_booking(Change::Insert(booking.clone()));
        }
        info!(slot = %slot, booking = %booking.id, "Slot booked");
        Ok(booking)
    }

    /// Cancel the viewer's booking of `slot`
    pub async fn cancel(&mut self, slot: SlotId) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let booking = retry_read(&self.retry, "booking_for_slot", || {
            backend.booking_for_slot(slot)
        })
        .await?
        .ok_or_else(|| SyncError::NotFound("No booking to cancel".into()))?;
        if booking.booker_id != self.viewer {
            return Err(SyncError::Validation(
                "Only the booker can cancel from here".into(),
            ));
        }

        if let Err(err) = self.backend.delete_booking(booking.id).await {
            error!(slot = %slot, error = %err, "Cancel failed");
            SyncMetrics::record_write_failure("delete_booking");
            return Err(err);
        }
        if self.lifecycle.is_alive() {
            self.patch_booking(Change::Delete { old: booking });
        }
        info!(slot = %slot, "Booking cancelled");
        Ok(())
    }

    /// Detach from the feed
    pub fn unmount(&mut self) {
        self.lifecycle.end();
        self.subscriptions.close_all();
    }

    fn patch_booking(&mut self, change: Change<Booking>) {
        match change {
            Change::Insert(b) | Change::Update { new: b, .. } => {
                if self.slots.get(&b.slot_id).is_some() {
                    self.booked.insert(
                        b.slot_id,
                        BookedBy {
                            booking: b.id,
                            booker: b.booker_id,
                        },
                    );
                }
            }
            Change::Delete { old } => {
                if self
                    .booked
                    .get(&old.slot_id)
                    .is_some_and(|current| current.booking == old.id)
                {
                    self.booked.remove(&old.slot_id);
                }
            }
        }
    }
}

impl Drop for BrowseSlotsScreen {
    fn drop(&mut self) {
        self.unmount();
    }
}

fn owner_label(profile: &Profile) -> String {
    profile
        .email
        .clone()
        .filter(|email| !email.trim().is_empty())
        .unwrap_or_else(|| profile.label())
}

/// Owner input for creating or editing a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDraft {
    /// Start instant
    pub start_at: Option<DateTime<Utc>>,
    /// End instant
    pub end_at: Option<DateTime<Utc>>,
    /// Timezone label
    pub timezone: String,
    /// Free-form notes
    pub notes: Option<String>,
}

impl SlotDraft {
    fn validate(&self) -> Result<(DateTime<Utc>, DateTime<Utc>, String, Option<String>)> {
        let (start, end) = InputValidator::validate_slot_range(self.start_at, self.end_at)?;
        InputValidator::validate_timezone(&self.timezone)?;
        let notes = InputValidator::validate_note(self.notes.as_deref())?;
        Ok((start, end, self.timezone.trim().to_string(), notes))
    }
}

/// One of the owner's slots with its booking state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedSlot {
    /// The slot
    pub slot: Slot,
    /// Its booking, if any
    pub booking: Option<Booking>,
}

impl OwnedSlot {
    /// "Booked" or "Free"
    #[must_use]
    pub const fn booking_label(&self) -> &'static str {
        if self.booking.is_some() {
            "Booked"
        } else {
            "Free"
        }
    }
}

/// Controller of the owner's sessions screen
pub struct SessionsScreen {
    backend: Arc<dyn Backend>,
    feed: Arc<dyn ChangeFeed>,
    owner: UserId,
    retry: RetryPolicy,
    slots: ProjectionCache<Slot>,
    bookings: HashMap<SlotId, Booking>,
    scope: ScopeKey,
    subscriptions: SubscriptionSet,
    lifecycle: Lifecycle,
}

impl SessionsScreen {
    /// Load the owner's slots and attach to the feed
    pub async fn mount(
        backend: Arc<dyn Backend>,
        feed: Arc<dyn ChangeFeed>,
        owner: UserId,
        config: &AppConfig,
    ) -> Result<Self> {
        let mut screen = Self {
            backend,
            feed,
            owner,
            retry: RetryPolicy::from(&config.retry),
            slots: ProjectionCache::new("owner_slots"),
            bookings: HashMap::new(),
            scope: ScopeKey::new(format!("sessions-{owner}")),
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
                    Interest::all(Table::AvailabilitySlots)
                        .filtered(ColumnFilter::eq(availability_slots::USER_ID, owner)),
                    Interest::all(Table::Bookings),
                ],
            )
            .await?;
        info!(owner = %owner, slots = screen.slots.len(), "Sessions mounted");
        Ok(screen)
    }

    /// Authoritative reload of the owner's slots and their bookings
    pub async fn reload(&mut self) -> Result<()> {
        let ticket = self.slots.begin_reload();
        let backend = Arc::clone(&self.backend);
        let owner = self.owner;
        let slots = retry_read(&self.retry, "slots_owned_by", || backend.slots_owned_by(owner)).await?;
        let slot_ids: Vec<SlotId> = slots.iter().map(|s| s.id).collect();
        let bookings = if slot_ids.is_empty() {
            Vec::new()
        } else {
            retry_read(&self.retry, "bookings_for_slots", || {
                backend.bookings_for_slots(&slot_ids)
            })
            .await?
        };
        if !self.lifecycle.is_alive() || !self.slots.complete_reload(ticket, slots) {
            return Ok(());
        }
        self.bookings = bookings.into_iter().map(|b| (b.slot_id, b)).collect();
        debug!(owner = %owner, slots = self.slots.len(), "Sessions reloaded");
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
                    Table::AvailabilitySlots => match row.decode::<Slot>() {
                        Ok(change) if change.current().map_or(true, |s| s.user_id == self.owner) => {
                            let ticket = self.slots.begin_patch();
                            self.slots.apply_patch(ticket, change);
                        }
                        Ok(_) => {}
                        Err(_) => self.reload().await?,
                    },
                    Table::Bookings => self.reload().await?,
                    _ => {}
                }
            }
            FeedSignal::Dropped(reason) => {
                warn!(scope = %self.scope, reason, "Sessions feed dropped, reloading");
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

    /// Owner's slots by start, with booking state
    #[must_use]
    pub fn slots(&self) -> Vec<OwnedSlot> {
        let mut slots: Vec<OwnedSlot> = self
            .slots
            .iter()
            .map(|slot| OwnedSlot {
                slot: slot.clone(),
                booking: self.bookings.get(&slot.id).cloned(),
            })
            .collect();
        slots.sort_by(|a, b| a.slot.start_at.cmp(&b.slot.start_at).then(a.slot.id.cmp(&b.slot.id)));
        slots
    }

    /// Create a slot
    pub async fn create_slot(&mut self, draft: SlotDraft) -> Result<Slot> {
        let (start_at, end_at, timezone, notes) = draft.validate()?;
        let slot = self
            .backend
            .insert_slot(NewSlot {
                owner: self.owner,
                start_at,
                end_at,
                timezone,
                notes,
            })
            .await
            .map_err(|err| write_failed("insert_slot", err))?;
        if self.lifecycle.is_alive() {
            self.slots.upsert(slot.clone());
        }
        Ok(slot)
    }

    /// Edit one of the owner's slots
    pub async fn edit_slot(&mut self, id: SlotId, draft: SlotDraft) -> Result<Slot> {
        let (start_at, end_at, timezone, notes) = draft.validate()?;
        let slot = self
            .backend
            .update_slot(
                id,
                self.owner,
                SlotPatch {
                    start_at,
                    end_at,
                    timezone,
                    notes,
                },
            )
            .await
            .map_err(|err| write_failed("update_slot", err))?;
        if self.lifecycle.is_alive() {
            self.slots.upsert(slot.clone());
        }
        Ok(slot)
    }

    /// Delete one of the owner's slots and its booking
    pub async fn delete_slot(&mut self, id: SlotId) -> Result<()> {
        self.backend
            .delete_slot(id, self.owner)
            .await
            .map_err(|err| write_failed("delete_slot", err))?;
        if self.lifecycle.is_alive() {
            self.slots.remove(&id);
            self.bookings.remove(&id);
        }
        Ok(())
    }

    /// Detach from the feed
    pub fn unmount(&mut self) {
        self.lifecycle.end();
        self.subscriptions.close_all();
    }
}

impl Drop for SessionsScreen {
    fn drop(&mut self) {
        self.unmount();
    }
}

fn write_failed(operation: &'static str, err: SyncError) -> SyncError {
    error!(operation, error = %err, "Write failed");
    SyncMetrics::record_write_failure(operation);
    err
}
