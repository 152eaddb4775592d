//! Reconnect automaton
//!
//! [`fsm`] holds the pure transition table, [`backoff`] the retry delay
//! growth, and [`driver`] the actor that runs actions against a
//! [`Connector`].

pub mod backoff;
pub mod driver;
pub mod fsm;

pub use backoff::ExponentialBackoff;
pub use driver::{
    AutomatonHandle, ConnectError, Connector, DisconnectNotifier, LiveSession, ReconnectAutomaton,
};
pub use fsm::{Action, Event, Fsm};
