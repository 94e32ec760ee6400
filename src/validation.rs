use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::{Result, SyncError};

const MAX_SKILL_TITLE: usize = 80;
const MAX_MESSAGE: usize = 4000;
const MAX_NOTE: usize = 1000;
const MAX_DISPLAY_NAME: usize = 80;
const MAX_BIO: usize = 500;

const TIMEZONE_PATTERN: &str = r"^(UTC|[A-Z][A-Za-z_]+(/[A-Z][A-Za-z0-9_+\-]+){1,2})$";
const LINK_PATTERN: &str = r"^https?://[^\s/$.?#][^\s]*$";

fn invalid(message: impl Into<String>) -> SyncError {
    SyncError::Validation(message.into())
}

fn pattern(cell: &'static OnceLock<std::result::Result<Regex, regex::Error>>, source: &str) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(source))
        .as_ref()
        .map_err(|e| invalid(format!("Invalid pattern: {e}")))
}

/// Checks user input before it is written anywhere
#[derive(Debug, Copy, Clone)]
pub struct InputValidator;

impl InputValidator {
    /// Validate a skill title; returns it trimmed
    pub fn validate_skill_title(title: &str) -> Result<String> {
        let title = title.trim();
        if title.is_empty() {
            return Err(invalid("Skill title cannot be empty"));
        }

        if title.chars().count() > MAX_SKILL_TITLE {
            return Err(invalid(format!(
                "Skill title too long (max {MAX_SKILL_TITLE} characters)"
            )));
        }

        if title.chars().any(char::is_control) {
            return Err(invalid("Skill title contains invalid characters"));
        }

        Ok(title.to_string())
    }

    /// Validate message content; returns it trimmed
    pub fn validate_message(content: &str) -> Result<String> {
        let content = content.trim();
        if content.is_empty() {
            return Err(invalid("Message cannot be empty"));
        }

        if content.chars().count() > MAX_MESSAGE {
            return Err(invalid(format!(
                "Message too long (max {MAX_MESSAGE} characters)"
            )));
        }

        Ok(Self::sanitize_text(content))
    }

    /// Validate a slot's bounds; both must be present and end after start
    pub fn validate_slot_range(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let (Some(start), Some(end)) = (start, end) else {
            return Err(invalid("Start and end are required"));
        };

        if end <= start {
            return Err(invalid("End must be after start"));
        }

        Ok((start, end))
    }

    /// Validate a timezone label such as `Europe/Paris` or `UTC`
    pub fn validate_timezone(timezone: &str) -> Result<()> {
        static TIMEZONE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
        if !pattern(&TIMEZONE, TIMEZONE_PATTERN)?.is_match(timezone.trim()) {
            return Err(invalid(format!("Invalid timezone: {timezone}")));
        }
        Ok(())
    }

    /// Validate a star rating
    pub fn validate_rating(rating: u8) -> Result<()> {
        if !(1..=5).contains(&rating) {
            return Err(invalid("Choose between 1 and 5 stars"));
        }
        Ok(())
    }

    /// Validate an optional note; blank notes become `None`
    pub fn validate_note(note: Option<&str>) -> Result<Option<String>> {
        let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(None);
        };

        if note.chars().count() > MAX_NOTE {
            return Err(invalid(format!("Note too long (max {MAX_NOTE} characters)")));
        }

        Ok(Some(Self::sanitize_text(note)))
    }

    /// Validate a display name; blank names become `None`
    pub fn validate_display_name(name: &str) -> Result<Option<String>> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }

        if name.chars().count() > MAX_DISPLAY_NAME {
            return Err(invalid(format!(
                "Name too long (max {MAX_DISPLAY_NAME} characters)"
            )));
        }

        if name.chars().any(char::is_control) {
            return Err(invalid("Name contains invalid characters"));
        }

        Ok(Some(name.to_string()))
    }

    /// Validate a bio; blank bios become `None`
    pub fn validate_bio(bio: &str) -> Result<Option<String>> {
        let bio = bio.trim();
        if bio.is_empty() {
            return Ok(None);
        }

        if bio.chars().count() > MAX_BIO {
            return Err(invalid(format!("Bio too long (max {MAX_BIO} characters)")));
        }

        Ok(Some(Self::sanitize_text(bio)))
    }

    /// Validate a call link
    pub fn validate_meeting_link(link: &str) -> Result<()> {
        static LINK: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
        if !pattern(&LINK, LINK_PATTERN)?.is_match(link.trim()) {
            return Err(invalid("Meeting link must be an http or https URL"));
        }
        Ok(())
    }

    /// Sanitize text by removing control characters other than line breaks and tabs
    #[must_use]
    pub fn sanitize_text(text: &str) -> String {
        text.chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timezone_labels() {
        assert!(InputValidator::validate_timezone("UTC").is_ok());
        assert!(InputValidator::validate_timezone("Europe/Paris").is_ok());
        assert!(InputValidator::validate_timezone("America/Argentina/Buenos_Aires").is_ok());
        assert!(InputValidator::validate_timezone("paris").is_err());
        assert!(InputValidator::validate_timezone("").is_err());
    }

    #[test]
    fn test_sanitize_keeps_line_breaks() {
        assert_eq!(InputValidator::sanitize_text("a\u{0}b\nc\td"), "ab\nc\td");
    }
}
