//! The signed-in user's own profile
//!
//! Shows the editable name and bio, the titles the user teaches and wants to
//! learn, and the average of every rating received. Offer, want and skill
//! changes refresh the skill summary; feedback about the user refreshes the
//! rating.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::AppConfig;
use crate::error::{Result, SyncError};
use crate::feed::{
    ChangeFeed, ChangeKind, FeedSignal, Interest, Lifecycle, ScopeKey, SubscriptionSet,
};
use crate::metrics::SyncMetrics;
use crate::models::{Profile, ProfileEdit, SkillId, UserId};
use crate::retry::{retry_read, RetryPolicy};
use crate::schema::Table;
use crate::validation::InputValidator;

/// Average of received ratings
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RatingSummary {
    /// Mean rating, none before the first one
    pub average: Option<f64>,
    /// Number of ratings
    pub count: u32,
}

impl RatingSummary {
    /// Summary of `ratings`
    #[must_use]
    pub fn from_ratings(ratings: &[u8]) -> Self {
        let count = u32::try_from(ratings.len()).unwrap_or(u32::MAX);
        if count == 0 {
            return Self::default();
        }
        let total: u32 = ratings.iter().map(|r| u32::from(*r)).sum();
        Self {
            average: Some(f64::from(total) / f64::from(count)),
            count,
        }
    }

    /// `"4.5 (2 ratings)"`, or `"No ratings yet"`
    #[must_use]
    pub fn label(&self) -> String {
        match (self.average, self.count) {
            (Some(avg), 1) => format!("{avg:.1} (1 rating)"),
            (Some(avg), count) => format!("{avg:.1} ({count} ratings)"),
            (None, _) => "No ratings yet".to_string(),
        }
    }
}

/// Controller of the profile screen
pub struct ProfileScreen {
    backend: Arc<dyn Backend>,
    feed: Arc<dyn ChangeFeed>,
    viewer: UserId,
    retry: RetryPolicy,
    profile: Profile,
    offers: Vec<String>,
    wants: Vec<String>,
    rating: RatingSummary,
    scope: ScopeKey,
    subscriptions: SubscriptionSet,
    lifecycle: Lifecycle,
}

impl ProfileScreen {
    /// Load profile, skill summary and rating, then attach to the feed
    pub async fn mount(
        backend: Arc<dyn Backend>,
        feed: Arc<dyn ChangeFeed>,
        viewer: UserId,
        config: &AppConfig,
    ) -> Result<Self> {
        let retry = RetryPolicy::from(&config.retry);
        let source = Arc::clone(&backend);
        let ids = [viewer];
        let profile = retry_read(&retry, "profiles", || source.profiles(&ids))
            .await?
            .into_iter()
            .find(|p| p.id == viewer)
            .ok_or_else(|| SyncError::NotFound(format!("profile {viewer}")))?;

        let mut screen = Self {
            backend,
            feed,
            viewer,
            retry,
            profile,
            offers: Vec::new(),
            wants: Vec::new(),
            rating: RatingSummary::default(),
            scope: ScopeKey::new(format!("profile-live-{viewer}")),
            subscriptions: SubscriptionSet::new(),
            lifecycle: Lifecycle::new(),
        };
        screen.reload_skills().await?;
        screen.reload_ratings().await;
        screen
            .subscriptions
            .open(
                screen.feed.as_ref(),
                screen.scope.clone(),
                vec![
                    Interest::on(Table::UserOffers, ChangeKind::Insert),
                    Interest::on(Table::UserOffers, ChangeKind::Delete),
                    Interest::on(Table::UserWants, ChangeKind::Insert),
                    Interest::on(Table::UserWants, ChangeKind::Delete),
                    Interest::on(Table::Skills, ChangeKind::Update),
                    Interest::all(Table::SessionFeedback),
                ],
            )
            .await?;
        info!(
            viewer = %viewer,
            offers = screen.offers.len(),
            wants = screen.wants.len(),
            ratings = screen.rating.count,
            "Profile mounted"
        );
        Ok(screen)
    }

    /// Stored profile
    #[must_use]
    pub const fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Titles the viewer teaches, by title
    #[must_use]
    pub fn offers(&self) -> &[String] {
        &self.offers
    }

    /// Titles the viewer wants to learn, by title
    #[must_use]
    pub fn wants(&self) -> &[String] {
        &self.wants
    }

    /// Ratings received so far
    #[must_use]
    pub const fn rating(&self) -> RatingSummary {
        self.rating
    }

    /// Save name and bio.
    ///
    /// Blank values clear the field. A failure is returned for the
    /// "Save profile error" alert and leaves the shown profile unchanged.
    pub async fn save(&mut self, display_name: &str, bio: &str) -> Result<&Profile> {
        let edit = ProfileEdit {
            display_name: InputValidator::validate_display_name(display_name)?,
            bio: InputValidator::validate_bio(bio)?,
        };
        match self.backend.update_profile(self.viewer, edit).await {
            Ok(saved) => {
                info!(viewer = %self.viewer, "Profile updated");
                self.profile = saved;
                Ok(&self.profile)
            }
            Err(err) => {
                error!(viewer = %self.viewer, error = %err, "Profile save failed");
                SyncMetrics::record_write_failure("update_profile");
                Err(err)
            }
        }
    }

    /// Reload the offered and wanted titles
    pub async fn reload_skills(&mut self) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let viewer = self.viewer;
        let skills = retry_read(&self.retry, "skills", || backend.skills()).await?;
        let offers: HashSet<SkillId> = retry_read(&self.retry, "offers", || backend.offers(viewer))
            .await?
            .into_iter()
            .collect();
        let wants: HashSet<SkillId> = retry_read(&self.retry, "wants", || backend.wants(viewer))
            .await?
            .into_iter()
            .collect();
        if !self.lifecycle.is_alive() {
            return Ok(());
        }
        // The catalogue arrives ordered by title.
        self.offers = skills
            .iter()
            .filter(|s| offers.contains(&s.id))
            .map(|s| s.title.clone())
            .collect();
        self.wants = skills
            .iter()
            .filter(|s| wants.contains(&s.id))
            .map(|s| s.title.clone())
            .collect();
        debug!(viewer = %viewer, offers = self.offers.len(), wants = self.wants.len(), "Profile skills reloaded");
        Ok(())
    }

    /// Reload the rating; a failed read keeps the previous value
    pub async fn reload_ratings(&mut self) {
        let backend = Arc::clone(&self.backend);
        let viewer = self.viewer;
        match retry_read(&self.retry, "ratings_received", || backend.ratings_received(viewer)).await {
            Ok(ratings) if self.lifecycle.is_alive() => {
                self.rating = RatingSummary::from_ratings(&ratings);
            }
            Ok(_) => {}
            Err(err) => warn!(viewer = %viewer, error = %err, "Rating load failed"),
        }
    }

    /// Handle one feed signal
    pub async fn handle(&mut self, signal: FeedSignal) -> Result<()> {
        if !self.lifecycle.is_alive() {
            return Ok(());
        }
        match signal {
            FeedSignal::Change(row) => {
                SyncMetrics::record_feed_event(row.table, row.kind.as_str());
                let viewer = self.viewer.to_string();
                match row.table {
                    Table::UserOffers | Table::UserWants
                        if row.column("user_id") == Some(viewer.as_str()) =>
                    {
                        self.reload_skills().await?;
                    }
                    Table::Skills => self.reload_skills().await?,
                    Table::SessionFeedback if row.column("ratee_id") == Some(viewer.as_str()) => {
                        self.reload_ratings().await;
                    }
                    _ => {}
                }
            }
            FeedSignal::Dropped(reason) => {
                warn!(scope = %self.scope, reason, "Profile feed dropped, reloading");
                self.reload_skills().await?;
                self.reload_ratings().await;
            }
            FeedSignal::Reconnected => {
                self.reload_skills().await?;
                self.reload_ratings().await;
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

    /// Detach from the feed
    pub fn unmount(&mut self) {
        self.lifecycle.end();
        self.subscriptions.close_all();
    }
}

impl Drop for ProfileScreen {
    fn drop(&mut self) {
        self.unmount();
    }
}
