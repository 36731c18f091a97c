//! Ephemeral per-room typing indicators.
//!
//! Last-write-wins per user, auto-reverting to inactive after an idle
//! timeout so a crashed client never types forever. Nothing here is
//! persisted and no ordering is guaranteed relative to messages.

use std::collections::HashMap;
use std::time::Duration;

use parlor_proto::payloads::presence::TypingEvent;

use crate::room::UserId;

/// Time after which an unrefreshed indicator reverts to inactive.
pub const TYPING_IDLE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Typing state for one room.
///
/// Mutations are edge-triggered: a [`TypingEvent`] is returned only when a
/// user's indicator actually flips, so repeated refresh signals from a
/// client do not fan out. The owning worker calls [`TypingTracker::sweep`]
/// on its periodic tick to expire stale indicators.
#[derive(Debug)]
pub struct TypingTracker<I> {
    active: HashMap<UserId, I>,
    timeout: Duration,
}

impl<I> TypingTracker<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    /// Creates a tracker with the given idle timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { active: HashMap::new(), timeout }
    }

    /// Applies a typing signal from `user_id`.
    ///
    /// An active signal refreshes the expiry clock; the event is emitted
    /// only on the inactive-to-active edge (and vice versa).
    pub fn set(&mut self, user_id: UserId, active: bool, now: I) -> Option<TypingEvent> {
        if active {
            let started = self.active.insert(user_id, now).is_none();
            return started.then_some(TypingEvent { user_id, active: true });
        }
        self.active
            .remove(&user_id)
            .map(|_started_at| TypingEvent { user_id, active: false })
    }

    /// Forces the indicator off, as on disconnect or leave.
    pub fn clear_user(&mut self, user_id: UserId, now: I) -> Option<TypingEvent> {
        self.set(user_id, false, now)
    }

    /// Expires indicators not refreshed within the idle timeout.
    ///
    /// Returns the stop events to broadcast, in user id order.
    pub fn sweep(&mut self, now: I) -> Vec<TypingEvent> {
        let timeout = self.timeout;
        let mut expired: Vec<UserId> = self
            .active
            .iter()
            .filter(|(_, last)| now - **last >= timeout)
            .map(|(user_id, _)| *user_id)
            .collect();
        expired.sort_unstable();

        for user_id in &expired {
            self.active.remove(user_id);
        }
        expired.into_iter().map(|user_id| TypingEvent { user_id, active: false }).collect()
    }

    /// Whether `user_id` currently shows as typing.
    pub fn is_typing(&self, user_id: UserId) -> bool {
        self.active.contains_key(&user_id)
    }

    /// Whether no one is typing. Lets the worker skip sweep work.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn tracker() -> TypingTracker<Instant> {
        TypingTracker::new(TYPING_IDLE_TIMEOUT)
    }

    #[test]
    fn start_is_announced_once() {
        let t0 = Instant::now();
        let mut typing = tracker();

        let event = typing.set(7, true, t0).unwrap();
        assert_eq!(event.user_id, 7);
        assert!(event.active);

        assert!(typing.set(7, true, t0 + Duration::from_millis(300)).is_none());
        assert!(typing.is_typing(7));
    }

    #[test]
    fn stop_is_announced_once() {
        let t0 = Instant::now();
        let mut typing = tracker();
        typing.set(7, true, t0);

        let event = typing.set(7, false, t0).unwrap();
        assert!(!event.active);
        assert!(!typing.is_typing(7));

        assert!(typing.set(7, false, t0).is_none());
    }

    #[test]
    fn stop_without_start_is_silent() {
        let mut typing = tracker();
        assert!(typing.set(7, false, Instant::now()).is_none());
    }

    #[test]
    fn sweep_expires_stale_indicators() {
        let t0 = Instant::now();
        let mut typing = tracker();
        typing.set(7, true, t0);

        assert!(typing.sweep(t0 + Duration::from_millis(999)).is_empty());

        let events = typing.sweep(t0 + Duration::from_millis(1000));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id, 7);
        assert!(!events[0].active);
        assert!(typing.is_empty());
    }

    #[test]
    fn refresh_defers_expiry() {
        let t0 = Instant::now();
        let mut typing = tracker();
        typing.set(7, true, t0);
        typing.set(7, true, t0 + Duration::from_millis(800));

        assert!(typing.sweep(t0 + Duration::from_millis(1200)).is_empty());
        assert_eq!(typing.sweep(t0 + Duration::from_millis(1800)).len(), 1);
    }

    #[test]
    fn expired_then_resignaled_is_a_fresh_edge() {
        let t0 = Instant::now();
        let mut typing = tracker();
        typing.set(7, true, t0);
        typing.sweep(t0 + Duration::from_secs(2));

        assert!(typing.set(7, true, t0 + Duration::from_secs(3)).is_some());
    }

    #[test]
    fn sweep_reports_in_user_id_order() {
        let t0 = Instant::now();
        let mut typing = tracker();
        for user_id in [30, 10, 20] {
            typing.set(user_id, true, t0);
        }

        let events = typing.sweep(t0 + Duration::from_secs(5));
        let ids: Vec<_> = events.iter().map(|event| event.user_id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn clear_user_acts_like_explicit_stop() {
        let t0 = Instant::now();
        let mut typing = tracker();
        typing.set(7, true, t0);

        let event = typing.clear_user(7, t0).unwrap();
        assert!(!event.active);
        assert!(typing.clear_user(7, t0).is_none());
    }
}
