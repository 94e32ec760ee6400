//! In-app event bus
//!
//! Screens that change data other screens display announce it here. The bus
//! is an explicit value handed to the screens that need it; each receiver is
//! an independent subscription closed by dropping it.

use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Events exchanged between screens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    /// The viewer's skills, offers or wants changed
    SkillsChanged {
        /// Screen or action that made the change
        source: &'static str,
    },
}

/// Cloneable handle to the bus
#[derive(Debug, Clone)]
pub struct LocalEvents {
    tx: broadcast::Sender<LocalEvent>,
}

impl Default for LocalEvents {
    fn default() -> Self {
        Self::new(64)
    }
}

impl LocalEvents {
    /// Bus keeping up to `capacity` undelivered events per receiver
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Announce that skills changed
    pub fn emit_skills_changed(&self, source: &'static str) {
        self.emit(LocalEvent::SkillsChanged { source });
    }

    /// Announce any event; returns how many receivers got it
    pub fn emit(&self, event: LocalEvent) -> usize {
        debug!(?event, "Local event");
        self.tx.send(event).unwrap_or(0)
    }

    /// New receiver seeing events emitted from now on
    #[must_use]
    pub fn subscribe(&self) -> LocalEventReceiver {
        LocalEventReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

/// One subscription to the bus
#[derive(Debug)]
pub struct LocalEventReceiver {
    rx: broadcast::Receiver<LocalEvent>,
}

impl LocalEventReceiver {
    /// Wait for the next event; `None` once every sender is gone.
    ///
    /// Missed events collapse into the next one delivered, which is enough
    /// for receivers that only reload.
    pub async fn recv(&mut self) -> Option<LocalEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Local event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// True if at least one event is waiting; drains everything queued.
    pub fn drain(&mut self) -> bool {
        let mut any = false;
        loop {
            match self.rx.try_recv() {
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => any = true,
                Err(_) => return any,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_receiver_sees_the_event() {
        let events = LocalEvents::default();
        let mut first = events.subscribe();
        let mut second = events.subscribe();
        assert_eq!(events.emit(LocalEvent::SkillsChanged { source: "test" }), 2);

        assert_eq!(
            first.recv().await,
            Some(LocalEvent::SkillsChanged { source: "test" })
        );
        assert!(second.drain());
        assert!(!second.drain());
    }

    #[test]
    fn test_emit_without_receivers_is_fine() {
        let events = LocalEvents::default();
        events.emit_skills_changed("skills");
        let mut late = events.subscribe();
        assert!(!late.drain());
    }
}
