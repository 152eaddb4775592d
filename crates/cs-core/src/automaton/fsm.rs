//! Pure transition table of the reconnect automaton
//!
//! The table is the single source of truth for which events are legal in
//! which state. Firing an event that has no entry is rejected with
//! [`StateError::InvalidTransition`] and leaves the state untouched.

use std::fmt;

use crate::error::StateError;
use crate::types::ConnectionState;

/// Inputs to the automaton
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Caller asks for connectivity
    Connect,
    /// Caller asks to drop connectivity
    Disconnect,
    /// A connection attempt produced a session
    Connected,
    /// A connection attempt failed
    ConnectionFailed,
    /// The live (or just-established) session went away
    ConnectionLost,
    /// The backoff timer fired
    Timer,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Connect => write!(f, "connect"),
            Event::Disconnect => write!(f, "disconnect"),
            Event::Connected => write!(f, "connected"),
            Event::ConnectionFailed => write!(f, "connectionFailed"),
            Event::ConnectionLost => write!(f, "connectionLost"),
            Event::Timer => write!(f, "timer"),
        }
    }
}

/// Side effects requested by a transition, run in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Tear down any existing session and start a new attempt
    AttemptConnect,
    /// Adopt the new session and reset the backoff delay
    OnConnected,
    /// Grow the delay and arm the retry timer
    ScheduleBackoff,
    /// Disarm the retry timer
    CancelBackoffTimer,
    /// Close the current session
    Teardown,
}

use Action::*;
use ConnectionState::*;

/// Look up the transition for a (state, event) pair
pub fn transition(
    state: ConnectionState,
    event: Event,
) -> Option<(ConnectionState, &'static [Action])> {
    let entry: (ConnectionState, &'static [Action]) = match (state, event) {
        (Disconnected, Event::Connect) => (Connecting, &[AttemptConnect]),
        (Disconnected, Event::Disconnect) => (Disconnected, &[]),
        (Disconnected, Event::ConnectionLost) => (Disconnected, &[]),

        (Connecting, Event::Connected) => (Connected, &[OnConnected]),
        (Connecting, Event::ConnectionFailed) => (Cooldown, &[ScheduleBackoff]),
        (Connecting, Event::ConnectionLost) => (Cooldown, &[ScheduleBackoff]),
        (Connecting, Event::Disconnect) => (Cancelled, &[]),

        (Cancelled, Event::Disconnect) => (Cancelled, &[]),
        (Cancelled, Event::Connected) => (Disconnected, &[OnConnected, Teardown]),
        (Cancelled, Event::ConnectionFailed) => (Disconnected, &[]),
        (Cancelled, Event::ConnectionLost) => (Disconnected, &[]),

        (Cooldown, Event::Timer) => (Connecting, &[AttemptConnect]),
        (Cooldown, Event::Disconnect) => (Disconnected, &[CancelBackoffTimer]),

        (Connected, Event::ConnectionLost) => (Connecting, &[AttemptConnect]),
        (Connected, Event::Disconnect) => (Disconnected, &[Teardown]),

        _ => return None,
    };
    Some(entry)
}

/// Current state plus the table
#[derive(Debug)]
pub struct Fsm {
    state: ConnectionState,
}

impl Fsm {
    /// Start in `Disconnected`
    pub fn new() -> Self {
        Self {
            state: Disconnected,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply an event, returning the actions the caller must run
    pub fn fire(&mut self, event: Event) -> Result<&'static [Action], StateError> {
        let (next, actions) =
            transition(self.state, event).ok_or(StateError::InvalidTransition {
                state: self.state,
                event,
            })?;

        tracing::info!(
            "Transition \"{}\" -> \"{}\" on event \"{}\"",
            self.state,
            next,
            event
        );
        self.state = next;
        Ok(actions)
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [ConnectionState; 5] = [Disconnected, Connecting, Cooldown, Connected, Cancelled];
    const EVENTS: [Event; 6] = [
        Event::Connect,
        Event::Disconnect,
        Event::Connected,
        Event::ConnectionFailed,
        Event::ConnectionLost,
        Event::Timer,
    ];

    fn fsm_in(state: ConnectionState) -> Fsm {
        Fsm { state }
    }

    #[test]
    fn test_table_has_fifteen_entries() {
        let defined = STATES
            .iter()
            .flat_map(|s| EVENTS.iter().map(move |e| (*s, *e)))
            .filter(|(s, e)| transition(*s, *e).is_some())
            .count();
        assert_eq!(defined, 15);
    }

    #[test]
    fn test_undefined_pairs_are_rejected() {
        for state in STATES {
            for event in EVENTS {
                if transition(state, event).is_some() {
                    continue;
                }
                let mut fsm = fsm_in(state);
                let err = fsm.fire(event).unwrap_err();
                assert_eq!(err, StateError::InvalidTransition { state, event });
                assert_eq!(fsm.state(), state, "state changed on rejected {}", event);
            }
        }
    }

    #[test]
    fn test_happy_path() {
        let mut fsm = Fsm::new();
        assert_eq!(fsm.fire(Event::Connect).unwrap(), &[AttemptConnect]);
        assert_eq!(fsm.fire(Event::Connected).unwrap(), &[OnConnected]);
        assert_eq!(fsm.state(), Connected);
        assert_eq!(fsm.fire(Event::ConnectionLost).unwrap(), &[AttemptConnect]);
        assert_eq!(fsm.state(), Connecting);
    }

    #[test]
    fn test_failure_then_cooldown() {
        let mut fsm = Fsm::new();
        fsm.fire(Event::Connect).unwrap();
        assert_eq!(fsm.fire(Event::ConnectionFailed).unwrap(), &[ScheduleBackoff]);
        assert_eq!(fsm.state(), Cooldown);
        assert_eq!(fsm.fire(Event::Timer).unwrap(), &[AttemptConnect]);
        assert_eq!(fsm.state(), Connecting);
    }

    #[test]
    fn test_disconnect_in_cooldown_then_timer() {
        let mut fsm = fsm_in(Cooldown);
        assert_eq!(fsm.fire(Event::Disconnect).unwrap(), &[CancelBackoffTimer]);
        assert_eq!(fsm.state(), Disconnected);
        assert!(fsm.fire(Event::Timer).is_err());
        assert_eq!(fsm.state(), Disconnected);
    }

    #[test]
    fn test_late_session_after_cancel_is_torn_down() {
        let mut fsm = fsm_in(Connecting);
        assert!(fsm.fire(Event::Disconnect).unwrap().is_empty());
        assert_eq!(fsm.state(), Cancelled);
        assert!(fsm.fire(Event::Disconnect).unwrap().is_empty());
        assert_eq!(fsm.fire(Event::Connected).unwrap(), &[OnConnected, Teardown]);
        assert_eq!(fsm.state(), Disconnected);
    }

    #[test]
    fn test_double_disconnect_tears_down_once() {
        let mut fsm = fsm_in(Connected);
        let first = fsm.fire(Event::Disconnect).unwrap();
        let second = fsm.fire(Event::Disconnect).unwrap();
        let teardowns = first
            .iter()
            .chain(second.iter())
            .filter(|a| **a == Teardown)
            .count();
        assert_eq!(teardowns, 1);
    }
}
