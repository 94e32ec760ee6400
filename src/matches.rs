//! Complementary matches with their ratings

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::Backend;
use crate::config::AppConfig;
use crate::error::Result;
use crate::events::{LocalEventReceiver, LocalEvents};
use crate::models::{MatchRow, ThreadId, UserId, UserRating};
use crate::retry::{retry_read, RetryPolicy};

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A match with the matched user's rating
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCard {
    /// Row returned by the matching procedure
    pub row: MatchRow,
    /// Mean rating, if rated
    pub avg_rating: Option<f64>,
    /// Number of ratings
    pub rating_count: u32,
}

impl MatchCard {
    /// Email, then name, then the full id
    #[must_use]
    pub fn title(&self) -> String {
        [&self.row.other_email, &self.row.other_name]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .map_or_else(|| self.row.other_id.to_string(), str::to_string)
    }

    /// `"4.5 (3)"`, `"4.5"` without a count, `"—"` when unrated
    #[must_use]
    pub fn rating_text(&self) -> String {
        match (self.avg_rating, self.rating_count) {
            (None, _) => "—".to_string(),
            (Some(avg), 0) => format!("{avg:.1}"),
            (Some(avg), count) => format!("{avg:.1} ({count})"),
        }
    }

    /// First availability overlap
    #[must_use]
    pub fn overlap_label(&self) -> String {
        let row = &self.row;
        if let (Some(start), Some(end)) = (row.overlap_start_at, row.overlap_end_at) {
            return format!(
                "First overlap: {} – {}",
                start.format("%Y-%m-%d %H:%M"),
                end.format("%Y-%m-%d %H:%M UTC")
            );
        }
        match (row.overlap_weekday, row.overlap_start_min, row.overlap_end_min) {
            (Some(day), Some(from), Some(to)) if usize::from(day) < WEEKDAYS.len() => format!(
                "First overlap: {} {}–{}",
                WEEKDAYS[usize::from(day)],
                clock_time(from),
                clock_time(to)
            ),
            _ => "No overlapping time yet".to_string(),
        }
    }

    /// Skills the viewer can teach
    #[must_use]
    pub fn teach_label(&self) -> String {
        format!("Teach: {}", self.row.offer_to_them.join(", "))
    }

    /// Skills the viewer can learn
    #[must_use]
    pub fn learn_label(&self) -> String {
        format!("Learn: {}", self.row.want_from_them.join(", "))
    }
}

fn clock_time(minutes: u16) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Controller of the matches screen
pub struct MatchesScreen {
    backend: Arc<dyn Backend>,
    viewer: UserId,
    retry: RetryPolicy,
    skills_changed: LocalEventReceiver,
    cards: Vec<MatchCard>,
}

impl MatchesScreen {
    /// Load matches and start listening for skill changes
    pub async fn load(
        backend: Arc<dyn Backend>,
        events: &LocalEvents,
        viewer: UserId,
        config: &AppConfig,
    ) -> Result<Self> {
        let mut screen = Self {
            backend,
            viewer,
            retry: RetryPolicy::from(&config.retry),
            skills_changed: events.subscribe(),
            cards: Vec::new(),
        };
        screen.reload().await?;
        info!(viewer = %viewer, matches = screen.cards.len(), "Matches loaded");
        Ok(screen)
    }

    /// Authoritative reload
    pub async fn reload(&mut self) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let viewer = self.viewer;
        let rows = retry_read(&self.retry, "find_complementary_matches", || {
            backend.find_complementary_matches(viewer)
        })
        .await?;
        let ids: Vec<UserId> = rows.iter().map(|r| r.other_id).collect();
        let ratings: HashMap<UserId, UserRating> = if ids.is_empty() {
            HashMap::new()
        } else {
            retry_read(&self.retry, "user_ratings", || backend.user_ratings(&ids))
                .await?
                .into_iter()
                .map(|r| (r.user_id, r))
                .collect()
        };

        self.cards = rows
            .into_iter()
            .map(|row| {
                let rating = ratings.get(&row.other_id);
                MatchCard {
                    avg_rating: rating.and_then(|r| r.avg_rating),
                    rating_count: rating.map_or(0, |r| r.rating_count),
                    row,
                }
            })
            .collect();
        debug!(viewer = %viewer, matches = self.cards.len(), "Matches reloaded");
        Ok(())
    }

    /// Reload if skills changed since the last check; returns whether it did
    pub async fn refresh_if_skills_changed(&mut self) -> Result<bool> {
        if !self.skills_changed.drain() {
            return Ok(false);
        }
        self.reload().await?;
        Ok(true)
    }

    /// Wait for the next skills change and reload; `false` once the bus is gone
    pub async fn follow_skill_changes(&mut self) -> Result<bool> {
        if self.skills_changed.recv().await.is_none() {
            return Ok(false);
        }
        self.skills_changed.drain();
        self.reload().await?;
        Ok(true)
    }

    /// Cards in the order returned by the store
    #[must_use]
    pub fn cards(&self) -> &[MatchCard] {
        &self.cards
    }

    /// Thread with a matched user, created on first contact
    pub async fn start_chat(&self, other: UserId) -> Result<ThreadId> {
        self.backend.get_or_create_thread(self.viewer, other).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    fn row(email: Option<&str>, name: Option<&str>) -> MatchRow {
        MatchRow {
            other_id: UserId::new(),
            other_name: name.map(str::to_string),
            other_email: email.map(str::to_string),
            offer_to_them: vec!["Guitar".into()],
            want_from_them: vec!["Spanish".into(), "Chess".into()],
            overlap_weekday: Some(1),
            overlap_start_min: Some(600),
            overlap_end_min: Some(630),
            overlap_start_at: None,
            overlap_end_at: None,
        }
    }

    fn card(row: MatchRow, avg_rating: Option<f64>, rating_count: u32) -> MatchCard {
        MatchCard {
            row,
            avg_rating,
            rating_count,
        }
    }

    #[test]
    fn test_card_labels() {
        let c = card(row(Some(" "), Some("Ana")), Some(4.46), 3);
        assert_eq!(c.title(), "Ana");
        assert_eq!(c.rating_text(), "4.5 (3)");
        assert_eq!(c.overlap_label(), "First overlap: Mon 10:00–10:30");
        assert_eq!(c.learn_label(), "Learn: Spanish, Chess");

        let unrated = card(row(None, None), None, 0);
        assert_eq!(unrated.title(), unrated.row.other_id.to_string());
        assert_eq!(unrated.rating_text(), "—");
    }

    #[tokio::test]
    async fn test_skill_change_triggers_reload() {
        let mut mock = MockBackend::new();
        mock.expect_find_complementary_matches()
            .times(2)
            .returning(|_| Ok(Vec::new()));
        let events = LocalEvents::default();
        let mut screen = MatchesScreen::load(Arc::new(mock), &events, UserId::new(), &AppConfig::default())
            .await
            .unwrap();

        assert!(!screen.refresh_if_skills_changed().await.unwrap());
        events.emit_skills_changed("test");
        events.emit_skills_changed("test");
        assert!(screen.refresh_if_skills_changed().await.unwrap());
    }
}
