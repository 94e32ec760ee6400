//! Session phase state machine
//!
//! The phase of a booked session is a pure function of the current instant
//! and the slot's bounds; nothing is stored between ticks. A separate one-shot
//! reminder fires when the whole minutes left before the start equal the
//! configured lead. It is only checked on a coarse tick, so the exact minute
//! can be missed by up to one tick period.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::feed::Lifecycle;

/// Phase of a time-boxed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// Now is before the start
    Before,
    /// Start and end inclusive
    Live,
    /// Now is after the end
    After,
}

impl SessionPhase {
    /// Phase at `now` for a session spanning `start..=end`
    #[must_use]
    pub fn at(now: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if now < start {
            Self::Before
        } else if now <= end {
            Self::Live
        } else {
            Self::After
        }
    }

    /// Text shown next to the countdown
    #[must_use]
    pub const fn status_label(self) -> &'static str {
        match self {
            Self::Before => "Starts in",
            Self::Live => "Ends in",
            Self::After => "Finished",
        }
    }
}

/// Time left until the start (before) or the end (live); none afterwards
#[must_use]
pub fn countdown(now: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Duration> {
    let target = match SessionPhase::at(now, start, end) {
        SessionPhase::Before => start,
        SessionPhase::Live => end,
        SessionPhase::After => return None,
    };
    Some((target - now).to_std().unwrap_or(Duration::ZERO))
}

/// `HH:MM:SS`, hours not wrapped at a day
#[must_use]
pub fn format_countdown(left: Duration) -> String {
    let secs = left.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// One-shot pre-start reminder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderTimer {
    lead_minutes: i64,
    fired: bool,
}

impl ReminderTimer {
    /// Reminder firing `lead_minutes` before the start
    #[must_use]
    pub const fn new(lead_minutes: i64) -> Self {
        Self {
            lead_minutes,
            fired: false,
        }
    }

    /// True if the reminder already fired
    #[must_use]
    pub const fn has_fired(&self) -> bool {
        self.fired
    }

    /// Check on a reminder tick; true exactly once, when the floored minutes
    /// left before `start` equal the lead.
    pub fn check(&mut self, now: DateTime<Utc>, start: DateTime<Utc>) -> bool {
        if self.fired {
            return false;
        }
        let minutes_left = (start - now).num_seconds().div_euclid(60);
        if minutes_left == self.lead_minutes {
            self.fired = true;
            return true;
        }
        false
    }
}

/// What the meeting view shows on each tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockTick {
    /// Current phase
    pub phase: SessionPhase,
    /// Time left in the current phase
    pub countdown: Option<Duration>,
    /// True from the tick the reminder fired on
    pub reminder: bool,
}

impl ClockTick {
    /// Countdown rendered as `HH:MM:SS`, empty once finished
    #[must_use]
    pub fn countdown_label(&self) -> String {
        self.countdown.map(format_countdown).unwrap_or_default()
    }
}

/// Wall-clock driver of one session's phase and reminder
pub struct SessionClock {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    tick_every: Duration,
    reminder_every: Duration,
    reminder: ReminderTimer,
    lifecycle: Lifecycle,
    tx: watch::Sender<ClockTick>,
}

impl SessionClock {
    /// Clock for a session spanning `start..=end`
    #[must_use]
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        clock: Arc<dyn Clock>,
        config: &SessionConfig,
    ) -> Self {
        let first = Self::evaluate(clock.now(), start, end, false);
        let (tx, _) = watch::channel(first);
        Self {
            start,
            end,
            clock,
            tick_every: Duration::from_millis(config.tick_millis),
            reminder_every: Duration::from_secs(config.reminder_check_secs),
            reminder: ReminderTimer::new(config.reminder_lead_minutes),
            lifecycle: Lifecycle::new(),
            tx,
        }
    }

    /// Override the tick periods
    #[must_use]
    pub const fn with_periods(mut self, tick_every: Duration, reminder_every: Duration) -> Self {
        self.tick_every = tick_every;
        self.reminder_every = reminder_every;
        self
    }

    /// Receiver of every tick
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ClockTick> {
        self.tx.subscribe()
    }

    /// Ending this token stops [`SessionClock::run`]
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    fn evaluate(
        now: DateTime<Utc>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        reminder: bool,
    ) -> ClockTick {
        ClockTick {
            phase: SessionPhase::at(now, start, end),
            countdown: countdown(now, start, end),
            reminder,
        }
    }

    /// Tick until the lifecycle ends. The reminder is first checked one
    /// reminder period after start-up.
    pub async fn run(mut self) {
        let lifecycle = self.lifecycle.clone();
        let mut phase_tick = interval(self.tick_every);
        phase_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reminder_tick =
            interval_at(Instant::now() + self.reminder_every, self.reminder_every);
        reminder_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = lifecycle.ended() => break,
                _ = phase_tick.tick() => {
                    let tick = Self::evaluate(
                        self.clock.now(),
                        self.start,
                        self.end,
                        self.reminder.has_fired(),
                    );
                    self.tx.send_if_modified(|current| {
                        if *current == tick {
                            false
                        } else {
                            *current = tick;
                            true
                        }
                    });
                }
                _ = reminder_tick.tick() => {
                    let now = self.clock.now();
                    if self.reminder.check(now, self.start) {
                        info!(start = %self.start, "Session starts soon");
                        self.tx.send_replace(Self::evaluate(now, self.start, self.end, true));
                    }
                }
            }
        }
        debug!(start = %self.start, "Session clock stopped");
    }
}
