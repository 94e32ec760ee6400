//! The viewer's skills: what they teach, what they want to learn
//!
//! Teaching a skill needs an approved proof. Every successful mutation is
//! announced on the local event bus so screens derived from skills (matches)
//! reload.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::backend::Backend;
use crate::config::AppConfig;
use crate::error::{Result, SyncError};
use crate::events::LocalEvents;
use crate::metrics::SyncMetrics;
use crate::models::{ProofDocument, Skill, SkillId, UserId};
use crate::retry::{retry_read, RetryPolicy};
use crate::validation::InputValidator;

/// A catalogue skill and the viewer's relation to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillSelection {
    /// The skill
    pub skill: Skill,
    /// The viewer teaches it
    pub is_offer: bool,
    /// The viewer wants to learn it
    pub is_want: bool,
    /// The viewer has an approved proof for it
    pub is_verified: bool,
}

/// Controller of the skills screen
pub struct SkillsScreen {
    backend: Arc<dyn Backend>,
    events: LocalEvents,
    viewer: UserId,
    retry: RetryPolicy,
    rows: Vec<SkillSelection>,
}

impl SkillsScreen {
    /// Load the catalogue with the viewer's offers, wants and proofs
    pub async fn mount(
        backend: Arc<dyn Backend>,
        events: LocalEvents,
        viewer: UserId,
        config: &AppConfig,
    ) -> Result<Self> {
        let mut screen = Self {
            backend,
            events,
            viewer,
            retry: RetryPolicy::from(&config.retry),
            rows: Vec::new(),
        };
        screen.reload().await?;
        info!(viewer = %viewer, skills = screen.rows.len(), "Skills mounted");
        Ok(screen)
    }

    /// Authoritative reload
    pub async fn reload(&mut self) -> Result<()> {
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
        let verified: HashSet<SkillId> =
            retry_read(&self.retry, "approved_proofs", || backend.approved_proofs(viewer))
                .await?
                .into_iter()
                .map(|p| p.skill_id)
                .collect();

        self.rows = skills
            .into_iter()
            .map(|skill| SkillSelection {
                is_offer: offers.contains(&skill.id),
                is_want: wants.contains(&skill.id),
                is_verified: verified.contains(&skill.id),
                skill,
            })
            .collect();
        self.sort();
        debug!(viewer = %viewer, skills = self.rows.len(), "Skills reloaded");
        Ok(())
    }

    /// Selections ordered by title
    #[must_use]
    pub fn selections(&self) -> &[SkillSelection] {
        &self.rows
    }

    /// Selection of one skill
    #[must_use]
    pub fn selection(&self, skill: SkillId) -> Option<&SkillSelection> {
        self.rows.iter().find(|row| row.skill.id == skill)
    }

    /// Add a skill to the catalogue.
    ///
    /// A title already present, ignoring case, yields the existing skill.
    pub async fn add_skill(&mut self, title: &str) -> Result<Skill> {
        let title = InputValidator::validate_skill_title(title)?;
        if let Some(existing) = self.find_title(&title, None) {
            debug!(title, skill = %existing.id, "Skill already exists");
            return Ok(existing.clone());
        }

        let skill = match self.backend.insert_skill(&title).await {
            Ok(skill) => skill,
            Err(SyncError::Conflict(_)) => {
                // Added elsewhere since the last reload.
                self.reload().await?;
                return self
                    .find_title(&title, None)
                    .cloned()
                    .ok_or_else(|| SyncError::NotFound(format!("skill {title}")));
            }
            Err(err) => return Err(write_failed("insert_skill", err)),
        };
        self.rows.push(SkillSelection {
            skill: skill.clone(),
            is_offer: false,
            is_want: false,
            is_verified: false,
        });
        self.sort();
        self.events.emit_skills_changed("add_skill");
        Ok(skill)
    }

    /// Rename a skill
    pub async fn rename_skill(&mut self, skill: SkillId, title: &str) -> Result<Skill> {
        let title = InputValidator::validate_skill_title(title)?;
        if self.find_title(&title, Some(skill)).is_some() {
            return Err(SyncError::Conflict(format!("A skill named {title} already exists")));
        }
        let renamed = self
            .backend
            .rename_skill(skill, &title)
            .await
            .map_err(|err| write_failed("rename_skill", err))?;
        if let Some(row) = self.rows.iter_mut().find(|row| row.skill.id == skill) {
            row.skill = renamed.clone();
        }
        self.sort();
        self.events.emit_skills_changed("rename_skill");
        Ok(renamed)
    }

    /// Delete a skill with every offer, want and proof referencing it
    pub async fn delete_skill(&mut self, skill: SkillId) -> Result<()> {
        self.backend
            .delete_skill(skill)
            .await
            .map_err(|err| write_failed("delete_skill", err))?;
        self.rows.retain(|row| row.skill.id != skill);
        self.events.emit_skills_changed("delete_skill");
        Ok(())
    }

    /// Flip whether the viewer wants to learn `skill`; returns the new state
    pub async fn toggle_want(&mut self, skill: SkillId) -> Result<bool> {
        let current = self.known(skill)?.is_want;
        let result = if current {
            self.backend.delete_want(self.viewer, skill).await
        } else {
            self.backend.insert_want(self.viewer, skill).await
        };
        result.map_err(|err| write_failed("toggle_want", err))?;
        self.set(skill, |row| row.is_want = !current);
        self.events.emit_skills_changed("toggle_want");
        Ok(!current)
    }

    /// Flip whether the viewer teaches `skill`; returns the new state.
    ///
    /// Enabling needs an approved proof. Without one, `proof` is uploaded
    /// first and the call fails when no document was picked.
    pub async fn toggle_offer(
        &mut self,
        skill: SkillId,
        proof: Option<ProofDocument>,
    ) -> Result<bool> {
        let row = self.known(skill)?;
        if row.is_offer {
            self.backend
                .delete_offer(self.viewer, skill)
                .await
                .map_err(|err| write_failed("delete_offer", err))?;
            self.set(skill, |row| row.is_offer = false);
            self.events.emit_skills_changed("toggle_offer");
            return Ok(false);
        }

        if !row.is_verified {
            let document = proof.ok_or_else(|| {
                SyncError::Validation("Upload a proof before teaching this skill".into())
            })?;
            let uploaded = self
                .backend
                .upload_proof(self.viewer, skill, &document)
                .await
                .map_err(|err| write_failed("upload_proof", err))?;
            info!(skill = %skill, path = %uploaded.storage_path, "Proof uploaded");
            self.set(skill, |row| row.is_verified = true);
        }

        self.backend
            .insert_offer(self.viewer, skill)
            .await
            .map_err(|err| write_failed("insert_offer", err))?;
        self.set(skill, |row| row.is_offer = true);
        self.events.emit_skills_changed("toggle_offer");
        Ok(true)
    }

    fn known(&self, skill: SkillId) -> Result<SkillSelection> {
        self.selection(skill)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("skill {skill}")))
    }

    fn set(&mut self, skill: SkillId, f: impl FnOnce(&mut SkillSelection)) {
        if let Some(row) = self.rows.iter_mut().find(|row| row.skill.id == skill) {
            f(row);
        }
    }

    fn find_title(&self, title: &str, except: Option<SkillId>) -> Option<&Skill> {
        let wanted = title.to_lowercase();
        self.rows
            .iter()
            .map(|row| &row.skill)
            .find(|s| Some(s.id) != except && s.title.trim().to_lowercase() == wanted)
    }

    fn sort(&mut self) {
        self.rows.sort_by(|a, b| {
            a.skill
                .title
                .to_lowercase()
                .cmp(&b.skill.title.to_lowercase())
                .then(a.skill.id.cmp(&b.skill.id))
        });
    }
}

fn write_failed(operation: &'static str, err: SyncError) -> SyncError {
    error!(operation, error = %err, "Skill change failed");
    SyncMetrics::record_write_failure(operation);
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::clock::SystemClock;
    use crate::memory::MemoryBackend;

    async fn screen(backend: Arc<dyn Backend>, events: &LocalEvents) -> SkillsScreen {
        SkillsScreen::mount(backend, events.clone(), UserId::new(), &AppConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_skill_reuses_existing_title() {
        let events = LocalEvents::default();
        let mut rx = events.subscribe();
        let mut skills = screen(Arc::new(MemoryBackend::new(Arc::new(SystemClock))), &events).await;

        let first = skills.add_skill("Guitar").await.unwrap();
        assert!(rx.drain());
        let second = skills.add_skill("  guitar ").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(skills.selections().len(), 1);
        assert!(!rx.drain());
    }

    #[tokio::test]
    async fn test_teaching_requires_a_proof() {
        let events = LocalEvents::default();
        let mut skills = screen(Arc::new(MemoryBackend::new(Arc::new(SystemClock))), &events).await;
        let skill = skills.add_skill("Piano").await.unwrap();

        let refused = skills.toggle_offer(skill.id, None).await;
        assert!(matches!(refused, Err(SyncError::Validation(_))));
        assert!(!skills.selection(skill.id).unwrap().is_offer);

        let proof = ProofDocument {
            file_name: "grade8.PDF".into(),
            content_type: Some("application/pdf".into()),
            bytes: vec![1, 2, 3],
        };
        assert!(skills.toggle_offer(skill.id, Some(proof)).await.unwrap());
        let row = skills.selection(skill.id).unwrap();
        assert!(row.is_offer && row.is_verified);

        // Verified now, so turning it off and on again needs no document.
        assert!(!skills.toggle_offer(skill.id, None).await.unwrap());
        assert!(skills.toggle_offer(skill.id, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_want_keeps_state_and_stays_silent() {
        let skill = Skill {
            id: SkillId::new(),
            title: "Chess".into(),
        };
        let mut mock = MockBackend::new();
        let catalogue = vec![skill.clone()];
        mock.expect_skills().returning(move || Ok(catalogue.clone()));
        mock.expect_offers().returning(|_| Ok(Vec::new()));
        mock.expect_wants().returning(|_| Ok(Vec::new()));
        mock.expect_approved_proofs().returning(|_| Ok(Vec::new()));
        mock.expect_insert_want()
            .returning(|_, _| Err(SyncError::write("insert_want", "permission denied")));

        let events = LocalEvents::default();
        let mut rx = events.subscribe();
        let mut skills = screen(Arc::new(mock), &events).await;
        assert!(skills.toggle_want(skill.id).await.is_err());
        assert!(!skills.selection(skill.id).unwrap().is_want);
        assert!(!rx.drain());
    }
}
