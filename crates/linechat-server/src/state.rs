//! Session state flags and the reader/writer handshake.
//!
//! A session's state is not a single phase but four independent flags that
//! are only ever set, never cleared. Both units and the server update them
//! concurrently with an atomic OR.
//!
//! # Handshake
//!
//! Each unit, on exit, sets its own DONE bit and inspects the value that was
//! in place immediately before its write. The unit that sees the partner's
//! DONE bit in that previous value is the second finisher and hands the
//! session to the reaper; the other one only nudges its partner.
//!
//! Both DONE bits are set with `fetch_or` on one atomic, so the two updates
//! are totally ordered in its modification order. The later of the two reads
//! the earlier one's bit, the earlier cannot read the later's. Exactly one
//! unit therefore observes "both done". `AcqRel` on the update makes
//! everything the first finisher did before exiting visible to the second
//! finisher and, through the reaper queue, to the reaper.

use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

/// A set of session flags.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct StateFlags(u8);

impl StateFlags {
    /// No flag set: both units running.
    pub const RUNNING: Self = Self(0);
    /// The reader unit has left its loop.
    pub const READER_DONE: Self = Self(1);
    /// The writer unit has left its loop.
    pub const WRITER_DONE: Self = Self(1 << 1);
    /// Termination was requested by the server or the peer unit.
    pub const TERMINATION_REQUESTED: Self = Self(1 << 2);
    /// The reader's blocking read was interrupted.
    pub const READER_INTERRUPT_REQUESTED: Self = Self(1 << 3);

    const ALL: [(Self, &'static str); 4] = [
        (Self::READER_DONE, "READER_DONE"),
        (Self::WRITER_DONE, "WRITER_DONE"),
        (Self::TERMINATION_REQUESTED, "TERMINATION_REQUESTED"),
        (Self::READER_INTERRUPT_REQUESTED, "READER_INTERRUPT_REQUESTED"),
    ];

    /// True if every flag in `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any flag in `other` is set in `self`.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Union of two flag sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Both units have exited.
    pub const fn is_quiesced(self) -> bool {
        self.contains(Self::READER_DONE.union(Self::WRITER_DONE))
    }
}

impl fmt::Debug for StateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("RUNNING");
        }
        let mut set = f.debug_set();
        for (flag, name) in Self::ALL {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// One of the two units of concurrency in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    /// Consumes input lines.
    Reader,
    /// Drains the outbound queue.
    Writer,
}

impl Unit {
    const fn done_flag(self) -> StateFlags {
        match self {
            Self::Reader => StateFlags::READER_DONE,
            Self::Writer => StateFlags::WRITER_DONE,
        }
    }

    const fn partner(self) -> Self {
        match self {
            Self::Reader => Self::Writer,
            Self::Writer => Self::Reader,
        }
    }
}

/// What an exiting unit must do after marking itself done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// Partner already exited: this unit enqueues the session for reclamation.
    Reclaim,
    /// Partner still running: this unit must wake or interrupt it.
    NotifyPartner,
}

/// Atomic flag-set shared by a session's units and the server.
#[derive(Default)]
pub struct SessionState(AtomicU8);

impl SessionState {
    /// All flags clear.
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Current flags.
    pub fn load(&self) -> StateFlags {
        StateFlags(self.0.load(Ordering::Acquire))
    }

    /// Set `flags` and return the flags that were set before.
    pub fn set(&self, flags: StateFlags) -> StateFlags {
        StateFlags(self.0.fetch_or(flags.0, Ordering::AcqRel))
    }

    /// Mark `unit` done and decide who reclaims the session.
    ///
    /// For a given session, exactly one of the two calls (one per unit)
    /// returns [`Handoff::Reclaim`].
    pub fn finish(&self, unit: Unit) -> Handoff {
        let previous = self.set(unit.done_flag());
        assert!(
            !previous.contains(unit.done_flag()),
            "invariant: {unit:?} finished twice (state {previous:?})"
        );
        if previous.contains(unit.partner().done_flag()) {
            Handoff::Reclaim
        } else {
            Handoff::NotifyPartner
        }
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionState").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn flags_start_clear() {
        let state = SessionState::new();
        assert_eq!(state.load(), StateFlags::RUNNING);
        assert!(!state.load().is_quiesced());
    }

    #[test]
    fn set_returns_previous_and_never_clears() {
        let state = SessionState::new();

        let before = state.set(StateFlags::TERMINATION_REQUESTED);
        assert_eq!(before, StateFlags::RUNNING);

        let before = state.set(StateFlags::READER_INTERRUPT_REQUESTED);
        assert_eq!(before, StateFlags::TERMINATION_REQUESTED);

        // Setting an already-set flag is a no-op
        state.set(StateFlags::TERMINATION_REQUESTED);
        let now = state.load();
        assert!(now.contains(StateFlags::TERMINATION_REQUESTED));
        assert!(now.contains(StateFlags::READER_INTERRUPT_REQUESTED));
        assert!(!now.intersects(StateFlags::READER_DONE.union(StateFlags::WRITER_DONE)));
    }

    #[test]
    fn first_finisher_notifies_second_reclaims() {
        let state = SessionState::new();
        assert_eq!(state.finish(Unit::Writer), Handoff::NotifyPartner);
        assert_eq!(state.finish(Unit::Reader), Handoff::Reclaim);
        assert!(state.load().is_quiesced());

        let state = SessionState::new();
        assert_eq!(state.finish(Unit::Reader), Handoff::NotifyPartner);
        assert_eq!(state.finish(Unit::Writer), Handoff::Reclaim);
    }

    #[test]
    fn termination_flags_do_not_affect_handoff() {
        let state = SessionState::new();
        state.set(StateFlags::TERMINATION_REQUESTED.union(StateFlags::READER_INTERRUPT_REQUESTED));
        assert_eq!(state.finish(Unit::Reader), Handoff::NotifyPartner);
        assert_eq!(state.finish(Unit::Writer), Handoff::Reclaim);
    }

    #[test]
    #[should_panic(expected = "finished twice")]
    fn finishing_twice_is_fatal() {
        let state = SessionState::new();
        state.finish(Unit::Reader);
        state.finish(Unit::Reader);
    }

    #[test]
    fn racing_finishers_reclaim_exactly_once() {
        for _ in 0..1_000 {
            let state = Arc::new(SessionState::new());
            let handles: Vec<_> = [Unit::Reader, Unit::Writer]
                .into_iter()
                .map(|unit| {
                    let state = Arc::clone(&state);
                    thread::spawn(move || state.finish(unit))
                })
                .collect();

            let reclaims = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|h| *h == Handoff::Reclaim)
                .count();
            assert_eq!(reclaims, 1);
        }
    }

    #[test]
    fn debug_lists_set_flags() {
        let flags = StateFlags::READER_DONE.union(StateFlags::TERMINATION_REQUESTED);
        assert_eq!(format!("{flags:?}"), "{READER_DONE, TERMINATION_REQUESTED}");
        assert_eq!(format!("{:?}", StateFlags::RUNNING), "RUNNING");
    }
}
