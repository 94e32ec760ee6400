//! Property tests for the pure parts of the sync layer

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use skillswap_sync::feed::Change;
use skillswap_sync::models::{Message, MessageId, ThreadId, UserId};
use skillswap_sync::session::{countdown, SessionPhase};
use skillswap_sync::unread::{badge_label, UnreadCounter};

#[derive(Debug, Clone)]
enum Op {
    Incoming,
    Own,
    Read(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Incoming),
        1 => Just(Op::Own),
        3 => (0..64usize).prop_map(Op::Read),
    ]
}

proptest! {
    #[test]
    fn incremental_unread_matches_batch_count(ops in prop::collection::vec(op(), 0..80)) {
        let viewer = UserId::new();
        let other = UserId::new();
        let thread = ThreadId::new();
        let base = Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap();

        let mut stored: Vec<Message> = Vec::new();
        let mut counter = UnreadCounter::new(viewer);

        for (step, op) in ops.into_iter().enumerate() {
            let at = base + Duration::seconds(i64::try_from(step).unwrap());
            let change = match op {
                Op::Incoming | Op::Own => {
                    let message = Message {
                        id: MessageId::new(),
                        thread_id: thread,
                        sender_id: if matches!(op, Op::Own) { viewer } else { other },
                        content: format!("m{step}"),
                        created_at: at,
                        read_at: None,
                    };
                    stored.push(message.clone());
                    Change::Insert(message)
                }
                Op::Read(index) => {
                    if stored.is_empty() {
                        continue;
                    }
                    let index = index % stored.len();
                    let old = stored[index].clone();
                    // The store never moves a read instant once set.
                    if old.read_at.is_none() {
                        stored[index].read_at = Some(at);
                    }
                    Change::Update { new: stored[index].clone(), old: Some(old) }
                }
            };
            counter.apply(&change);
        }

        let batch = stored.iter().filter(|m| m.is_unread_for(viewer)).count();
        prop_assert_eq!(counter.value() as usize, batch);
    }

    #[test]
    fn phases_move_forward_once_at_each_boundary(start_offset in -3_600i64..3_600, length in 1i64..900) {
        let base = Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap();
        let start = base + Duration::seconds(start_offset);
        let end = start + Duration::seconds(length);

        let rank = |phase: SessionPhase| match phase {
            SessionPhase::Before => 0,
            SessionPhase::Live => 1,
            SessionPhase::After => 2,
        };
        let mut previous = SessionPhase::at(start - Duration::seconds(5), start, end);
        prop_assert_eq!(previous, SessionPhase::Before);
        let mut changes = Vec::new();
        let mut now = start - Duration::seconds(4);
        while now <= end + Duration::seconds(5) {
            let phase = SessionPhase::at(now, start, end);
            prop_assert!(rank(phase) >= rank(previous));
            if phase != previous {
                changes.push(now);
            }
            prop_assert_eq!(countdown(now, start, end).is_none(), phase == SessionPhase::After);
            previous = phase;
            now += Duration::seconds(1);
        }
        prop_assert_eq!(changes, vec![start, end + Duration::seconds(1)]);
        prop_assert_eq!(previous, SessionPhase::After);
    }

    #[test]
    fn badge_is_capped(count in 0u32..100_000) {
        match badge_label(count) {
            None => prop_assert_eq!(count, 0),
            Some(label) if count >= 100 => prop_assert_eq!(label, "99+"),
            Some(label) => prop_assert_eq!(label, count.to_string()),
        }
    }
}
