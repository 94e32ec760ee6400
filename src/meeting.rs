//! Meeting screen of one booked session

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::backend::Backend;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::error::{Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::models::{Booking, NewFeedback, SessionFeedback, Slot, SlotId, ThreadId, UserId};
use crate::retry::{retry_read, RetryPolicy};
use crate::session::{countdown, format_countdown, SessionClock, SessionPhase};
use crate::validation::InputValidator;

/// Controller of the meeting screen
pub struct MeetingScreen {
    backend: Arc<dyn Backend>,
    viewer: UserId,
    slot: Slot,
    booking: Option<Booking>,
    partner: Option<UserId>,
    partner_label: Option<String>,
    feedback: Option<SessionFeedback>,
}

impl MeetingScreen {
    /// Load the slot, its booking, the partner and the viewer's own feedback
    pub async fn load(
        backend: Arc<dyn Backend>,
        slot: SlotId,
        viewer: UserId,
        config: &AppConfig,
    ) -> Result<Self> {
        let retry = RetryPolicy::from(&config.retry);
        let source = Arc::clone(&backend);
        let found = retry_read(&retry, "slot", || source.slot(slot))
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("slot {slot}")))?;

        // A failed booking lookup leaves the session unbooked.
        let booking = match retry_read(&retry, "booking_for_slot", || source.booking_for_slot(slot)).await {
            Ok(booking) => booking,
            Err(err) => {
                warn!(slot = %slot, error = %err, "Booking lookup failed");
                None
            }
        };

        let partner = booking.as_ref().map(|b| {
            if viewer == found.user_id {
                b.booker_id
            } else {
                found.user_id
            }
        });
        let partner_label = match partner {
            Some(partner) => {
                let ids = [partner];
                retry_read(&retry, "profiles", || source.profiles(&ids))
                    .await?
                    .into_iter()
                    .find(|p| p.id == partner)
                    .and_then(|p| {
                        p.display_name
                            .filter(|n| !n.trim().is_empty())
                            .or(p.email.filter(|e| !e.trim().is_empty()))
                    })
            }
            None => None,
        };
        let feedback = retry_read(&retry, "feedback_by", || source.feedback_by(slot, viewer)).await?;

        info!(slot = %slot, viewer = %viewer, booked = booking.is_some(), "Meeting loaded");
        Ok(Self {
            backend,
            viewer,
            slot: found,
            booking,
            partner,
            partner_label,
            feedback,
        })
    }

    /// The session slot
    #[must_use]
    pub const fn slot(&self) -> &Slot {
        &self.slot
    }

    /// Its booking, if still booked
    #[must_use]
    pub const fn booking(&self) -> Option<&Booking> {
        self.booking.as_ref()
    }

    /// The other participant
    #[must_use]
    pub const fn partner(&self) -> Option<UserId> {
        self.partner
    }

    /// Partner display name or email; `"Not booked yet"` without partner
    #[must_use]
    pub fn partner_label(&self) -> &str {
        match (&self.partner, &self.partner_label) {
            (None, _) => "Not booked yet",
            (Some(_), Some(label)) => label.as_str(),
            (Some(_), None) => "",
        }
    }

    /// Feedback the viewer already left
    #[must_use]
    pub const fn own_feedback(&self) -> Option<&SessionFeedback> {
        self.feedback.as_ref()
    }

    /// Phase at `now`
    #[must_use]
    pub fn phase(&self, now: DateTime<Utc>) -> SessionPhase {
        SessionPhase::at(now, self.slot.start_at, self.slot.end_at)
    }

    /// `HH:MM:SS` left at `now`; empty once finished
    #[must_use]
    pub fn countdown_label(&self, now: DateTime<Utc>) -> String {
        countdown(now, self.slot.start_at, self.slot.end_at)
            .map(format_countdown)
            .unwrap_or_default()
    }

    /// Status text of `phase`
    #[must_use]
    pub const fn status_label(phase: SessionPhase) -> &'static str {
        phase.status_label()
    }

    /// Label of the join button, none once finished
    #[must_use]
    pub const fn join_label(phase: SessionPhase) -> Option<&'static str> {
        match phase {
            SessionPhase::Before => Some("Join when live"),
            SessionPhase::Live => Some("Join call"),
            SessionPhase::After => None,
        }
    }

    /// Ticking clock for this session
    #[must_use]
    pub fn session_clock(&self, clock: Arc<dyn Clock>, config: &AppConfig) -> SessionClock {
        SessionClock::new(self.slot.start_at, self.slot.end_at, clock, &config.session)
    }

    /// Owner or booker of a booked session
    #[must_use]
    pub fn can_cancel(&self) -> bool {
        self.booking
            .as_ref()
            .is_some_and(|b| self.viewer == self.slot.user_id || self.viewer == b.booker_id)
    }

    /// Cancel the booking and forget everything derived from it
    pub async fn cancel_booking(&mut self) -> Result<()> {
        if !self.can_cancel() {
            return Err(SyncError::Validation("Nothing to cancel".into()));
        }
        let Some(booking) = self.booking.as_ref() else {
            return Err(SyncError::NotFound("No booking to cancel".into()));
        };
        if let Err(err) = self.backend.delete_booking(booking.id).await {
            error!(slot = %self.slot.id, error = %err, "Cancel failed");
            SyncMetrics::record_write_failure("delete_booking");
            return Err(err);
        }
        self.booking = None;
        self.partner = None;
        self.partner_label = None;
        info!(slot = %self.slot.id, "Booking cancelled from meeting");
        Ok(())
    }

    /// Thread with the partner, created on first contact
    pub async fn open_chat(&self) -> Result<ThreadId> {
        let partner = self
            .partner
            .ok_or_else(|| SyncError::NotFound("This session is not booked yet".into()))?;
        self.backend.get_or_create_thread(self.viewer, partner).await
    }

    /// Call link of the session
    pub fn join_link(&self) -> Result<&str> {
        let link = self
            .booking
            .as_ref()
            .and_then(|b| b.meeting_url.as_deref())
            .ok_or_else(|| SyncError::NotFound("Meeting link is not available".into()))?;
        InputValidator::validate_meeting_link(link)?;
        Ok(link)
    }

    /// Rate the partner once the session is over.
    ///
    /// The first submission inserts a row, later ones update it.
    pub async fn submit_feedback(
        &mut self,
        rating: u8,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SessionFeedback> {
        if self.phase(now) != SessionPhase::After {
            return Err(SyncError::Validation(
                "Feedback opens once the session has finished".into(),
            ));
        }
        let partner = self
            .partner
            .ok_or_else(|| SyncError::Validation("Missing session or partner".into()))?;
        InputValidator::validate_rating(rating)?;
        let note = InputValidator::validate_note(note)?;

        let (operation, result) = match &self.feedback {
            Some(existing) => (
                "update_feedback",
                self.backend.update_feedback(existing.id, rating, note).await,
            ),
            None => (
                "insert_feedback",
                self.backend
                    .insert_feedback(NewFeedback {
                        slot_id: self.slot.id,
                        rater_id: self.viewer,
                        ratee_id: partner,
                        rating,
                        note,
                    })
                    .await,
            ),
        };
        let saved = result.map_err(|err| {
            error!(slot = %self.slot.id, operation, error = %err, "Feedback not saved");
            SyncMetrics::record_write_failure(operation);
            err
        })?;
        self.feedback = Some(saved.clone());
        Ok(saved)
    }
}
