//! Async driver for the reconnect automaton
//!
//! One actor task owns the [`Fsm`], the backoff state and zero-or-one live
//! session. Caller commands, attempt outcomes, disconnect notifications and
//! timer expiries all arrive on channels and are handled one at a time, so
//! events for one automaton never race.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::backoff::ExponentialBackoff;
use super::fsm::{Action, Event, Fsm};
use crate::config::BackoffConfig;
use crate::error::{StateError, TransportError};
use crate::types::ConnectionState;

/// A live, established session owned by the automaton
#[async_trait]
pub trait LiveSession: Send + Sync + 'static {
    /// Close the session; must be safe to call on an already-dead session
    async fn close(&self);
}

/// Establishes sessions on behalf of the automaton
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The session type produced by a successful attempt
    type Session: LiveSession;

    /// Run one connection attempt
    ///
    /// `on_disconnect` must be kept alive by the session and fired (or
    /// dropped) when the session is lost.
    async fn connect(
        &self,
        on_disconnect: DisconnectNotifier,
    ) -> Result<Self::Session, TransportError>;
}

/// One-shot callback reporting that a session went away
///
/// Fires when [`notify`](Self::notify) is called or when the notifier is
/// dropped, whichever happens first, and never more than once.
#[derive(Debug)]
pub struct DisconnectNotifier {
    attempt: u64,
    tx: Option<mpsc::UnboundedSender<u64>>,
}

impl DisconnectNotifier {
    /// A notifier not attached to any automaton
    pub fn detached() -> Self {
        Self { attempt: 0, tx: None }
    }

    /// Report the disconnect
    pub fn notify(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(self.attempt);
        }
    }
}

impl Drop for DisconnectNotifier {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Errors reported to the caller of [`AutomatonHandle::connect`]
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The first attempt failed; the automaton keeps retrying
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// `disconnect` was fired before the attempt finished
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// `connect` is not valid in the current state
    #[error(transparent)]
    State(#[from] StateError),

    /// The automaton task is gone
    #[error("Automaton has shut down")]
    Closed,
}

enum Command {
    Connect(oneshot::Sender<Result<(), ConnectError>>),
    Disconnect(oneshot::Sender<()>),
    Shutdown,
}

type Outcome<S> = (u64, Result<S, TransportError>);

struct InFlight {
    attempt: u64,
    /// The session reported loss before its outcome arrived
    lost: bool,
}

/// Entry point for spawning automata
pub struct ReconnectAutomaton;

impl ReconnectAutomaton {
    /// Spawn the actor task; it starts in `Disconnected`
    pub fn spawn<C: Connector>(
        connector: C,
        backoff: &BackoffConfig,
    ) -> (AutomatonHandle<C::Session>, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (session_tx, session_rx) = watch::channel(None);

        let driver = Driver {
            connector: Arc::new(connector),
            fsm: Fsm::new(),
            backoff: ExponentialBackoff::from_config(backoff),
            attempt_seq: 0,
            in_flight: None,
            live: None,
            pending: None,
            waiter: None,
            timer: None,
            timer_seq: 0,
            outcome_tx,
            lost_tx,
            timer_tx,
            state_tx,
            session_tx,
        };

        let task = tokio::spawn(driver.run(command_rx, outcome_rx, lost_rx, timer_rx));

        let handle = AutomatonHandle {
            commands: command_tx,
            state: state_rx,
            session: session_rx,
        };
        (handle, task)
    }
}

/// Cloneable front end of a running automaton
pub struct AutomatonHandle<S> {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    session: watch::Receiver<Option<Arc<S>>>,
}

impl<S> Clone for AutomatonHandle<S> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            state: self.state.clone(),
            session: self.session.clone(),
        }
    }
}

impl<S> AutomatonHandle<S> {
    /// Fire `connect` and wait for the first attempt's outcome
    ///
    /// Only this first outcome is reported; later automatic retries are
    /// logged and never surface here.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(tx))
            .map_err(|_| ConnectError::Closed)?;
        rx.await.map_err(|_| ConnectError::Closed)?
    }

    /// Fire `disconnect`
    pub async fn disconnect(&self) -> Result<(), ConnectError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect(tx))
            .map_err(|_| ConnectError::Closed)?;
        rx.await.map_err(|_| ConnectError::Closed)
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// The live session, if connected
    pub fn session(&self) -> Option<Arc<S>> {
        self.session.borrow().clone()
    }

    /// Watch the live session
    pub fn sessions(&self) -> watch::Receiver<Option<Arc<S>>> {
        self.session.clone()
    }

    /// Disconnect and stop the actor
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct Driver<C: Connector> {
    connector: Arc<C>,
    fsm: Fsm,
    backoff: ExponentialBackoff,
    attempt_seq: u64,
    in_flight: Option<InFlight>,
    live: Option<(u64, Arc<C::Session>)>,
    /// Session handed over by the outcome being processed
    pending: Option<(u64, Arc<C::Session>)>,
    /// Caller of the external `connect`, resolved by the first outcome
    waiter: Option<oneshot::Sender<Result<(), ConnectError>>>,
    timer: Option<(u64, JoinHandle<()>)>,
    timer_seq: u64,
    outcome_tx: mpsc::UnboundedSender<Outcome<C::Session>>,
    lost_tx: mpsc::UnboundedSender<u64>,
    timer_tx: mpsc::UnboundedSender<u64>,
    state_tx: watch::Sender<ConnectionState>,
    session_tx: watch::Sender<Option<Arc<C::Session>>>,
}

impl<C: Connector> Driver<C> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut outcomes: mpsc::UnboundedReceiver<Outcome<C::Session>>,
        mut lost: mpsc::UnboundedReceiver<u64>,
        mut timers: mpsc::UnboundedReceiver<u64>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect(reply)) => self.on_connect(reply).await,
                    Some(Command::Disconnect(reply)) => {
                        self.on_disconnect().await;
                        let _ = reply.send(());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some((attempt, result)) = outcomes.recv() => self.on_outcome(attempt, result).await,
                Some(attempt) = lost.recv() => self.on_lost(attempt).await,
                Some(generation) = timers.recv() => self.on_timer(generation).await,
            }
        }

        self.on_disconnect().await;

        if self.in_flight.is_some() {
            // The attempt still owns a sender; close whatever it produces
            drop(self);
            tokio::spawn(async move {
                if let Some((_, Ok(session))) = outcomes.recv().await {
                    session.close().await;
                }
            });
        }
        tracing::debug!("Automaton stopped");
    }

    async fn on_connect(&mut self, reply: oneshot::Sender<Result<(), ConnectError>>) {
        match self.dispatch(Event::Connect).await {
            Ok(()) => {
                if let Some(previous) = self.waiter.replace(reply) {
                    let _ = previous.send(Err(ConnectError::Cancelled));
                }
            }
            Err(e) => {
                let _ = reply.send(Err(ConnectError::State(e)));
            }
        }
    }

    async fn on_disconnect(&mut self) {
        let _ = self.dispatch(Event::Disconnect).await;
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(ConnectError::Cancelled));
        }
    }

    async fn on_outcome(&mut self, attempt: u64, result: Result<C::Session, TransportError>) {
        let current = matches!(&self.in_flight, Some(f) if f.attempt == attempt);
        if !current {
            tracing::debug!("Discarding outcome of stale attempt {}", attempt);
            if let Ok(session) = result {
                session.close().await;
            }
            return;
        }
        let lost_early = self.in_flight.take().map(|f| f.lost).unwrap_or(false);

        match result {
            Ok(session) if !lost_early => {
                self.pending = Some((attempt, Arc::new(session)));
                let dispatched = self.dispatch(Event::Connected).await;
                if let Some((_, orphan)) = self.pending.take() {
                    orphan.close().await;
                }
                if dispatched.is_ok() {
                    self.resolve(Ok(()));
                }
            }
            Ok(session) => {
                session.close().await;
                self.on_failed(TransportError::SessionClosed).await;
            }
            Err(e) => self.on_failed(e).await,
        }
    }

    async fn on_failed(&mut self, error: TransportError) {
        let _ = self.dispatch(Event::ConnectionFailed).await;
        match self.waiter.take() {
            Some(waiter) => {
                tracing::warn!("Connection failed: {}", error);
                let _ = waiter.send(Err(ConnectError::Transport(error)));
            }
            None => tracing::info!("Reconnection attempt failed: {}", error),
        }
    }

    async fn on_lost(&mut self, attempt: u64) {
        if matches!(&self.live, Some((a, _)) if *a == attempt) {
            tracing::warn!("Connection lost");
            let _ = self.dispatch(Event::ConnectionLost).await;
            return;
        }
        match self.in_flight.as_mut() {
            Some(f) if f.attempt == attempt => f.lost = true,
            _ => tracing::debug!("Ignoring loss of stale attempt {}", attempt),
        }
    }

    async fn on_timer(&mut self, generation: u64) {
        if !matches!(&self.timer, Some((g, _)) if *g == generation) {
            tracing::debug!("Ignoring cancelled timer {}", generation);
            return;
        }
        self.timer = None;
        let _ = self.dispatch(Event::Timer).await;
    }

    fn resolve(&mut self, result: Result<(), ConnectError>) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(result);
        }
    }

    async fn dispatch(&mut self, event: Event) -> Result<(), StateError> {
        let actions = match self.fsm.fire(event) {
            Ok(actions) => actions,
            Err(e) => {
                tracing::error!("{}", e);
                return Err(e);
            }
        };
        for action in actions {
            self.perform(*action).await;
        }
        self.state_tx.send_replace(self.fsm.state());
        Ok(())
    }

    async fn perform(&mut self, action: Action) {
        match action {
            Action::AttemptConnect => {
                self.teardown().await;
                self.start_attempt();
            }
            Action::OnConnected => {
                if let Some((attempt, session)) = self.pending.take() {
                    self.session_tx.send_replace(Some(Arc::clone(&session)));
                    self.live = Some((attempt, session));
                }
                self.backoff.reset();
            }
            Action::ScheduleBackoff => self.schedule_backoff(),
            Action::CancelBackoffTimer => {
                if let Some((_, timer)) = self.timer.take() {
                    timer.abort();
                }
            }
            Action::Teardown => self.teardown().await,
        }
    }

    fn start_attempt(&mut self) {
        self.attempt_seq += 1;
        let attempt = self.attempt_seq;
        self.in_flight = Some(InFlight {
            attempt,
            lost: false,
        });

        let notifier = DisconnectNotifier {
            attempt,
            tx: Some(self.lost_tx.clone()),
        };
        let connector = Arc::clone(&self.connector);
        let outcome_tx = self.outcome_tx.clone();
        tracing::debug!("Starting connection attempt {}", attempt);
        tokio::spawn(async move {
            let result = connector.connect(notifier).await;
            let _ = outcome_tx.send((attempt, result));
        });
    }

    fn schedule_backoff(&mut self) {
        let delay = self.backoff.next_delay();
        self.timer_seq += 1;
        let generation = self.timer_seq;
        let timer_tx = self.timer_tx.clone();
        tracing::info!("Retrying in {:.2?}", delay);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timer_tx.send(generation);
        });
        if let Some((_, stale)) = self.timer.replace((generation, timer)) {
            stale.abort();
        }
    }

    async fn teardown(&mut self) {
        if let Some((_, session)) = self.live.take() {
            self.session_tx.send_replace(None);
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    enum Step {
        Fail,
        Succeed,
        /// Wait for the test to decide
        Hold(oneshot::Receiver<bool>),
    }

    #[derive(Clone, Default)]
    struct Counters {
        attempts: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    struct MockConnector {
        script: Mutex<VecDeque<Step>>,
        counters: Counters,
    }

    struct MockSession {
        closes: Arc<AtomicUsize>,
        notifier: Mutex<Option<DisconnectNotifier>>,
    }

    impl MockSession {
        fn lose(&self) {
            if let Some(notifier) = self.notifier.lock().unwrap().take() {
                notifier.notify();
            }
        }
    }

    #[async_trait]
    impl LiveSession for MockSession {
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Session = MockSession;

        async fn connect(
            &self,
            on_disconnect: DisconnectNotifier,
        ) -> Result<MockSession, TransportError> {
            self.counters.attempts.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front();
            let succeed = match step {
                Some(Step::Succeed) => true,
                Some(Step::Hold(rx)) => rx.await.unwrap_or(false),
                Some(Step::Fail) | None => false,
            };
            if succeed {
                Ok(MockSession {
                    closes: Arc::clone(&self.counters.closes),
                    notifier: Mutex::new(Some(on_disconnect)),
                })
            } else {
                Err(TransportError::Connect {
                    address: "mock".to_string(),
                    reason: "refused".to_string(),
                })
            }
        }
    }

    fn spawn(steps: Vec<Step>) -> (AutomatonHandle<MockSession>, Counters) {
        let counters = Counters::default();
        let connector = MockConnector {
            script: Mutex::new(steps.into()),
            counters: counters.clone(),
        };
        let (handle, _task) = ReconnectAutomaton::spawn(connector, &BackoffConfig::default());
        (handle, counters)
    }

    async fn wait_for(handle: &AutomatonHandle<MockSession>, state: ConnectionState) {
        let mut rx = handle.subscribe();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_failure_reaches_caller_in_cooldown() {
        let (handle, counters) = spawn(vec![Step::Fail, Step::Succeed]);

        let result = handle.connect().await;
        assert!(matches!(result, Err(ConnectError::Transport(_))));
        assert_eq!(handle.state(), ConnectionState::Cooldown);

        // Next attempt is automatic
        wait_for(&handle, ConnectionState::Connected).await;
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 2);
        assert!(handle.session().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_failures_are_silent() {
        let (handle, counters) = spawn(vec![Step::Fail, Step::Fail, Step::Fail, Step::Succeed]);

        assert!(handle.connect().await.is_err());
        wait_for(&handle, ConnectionState::Connected).await;
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_in_cooldown_cancels_timer() {
        let (handle, counters) = spawn(vec![Step::Fail, Step::Succeed]);

        assert!(handle.connect().await.is_err());
        assert_eq!(handle.state(), ConnectionState::Cooldown);

        handle.disconnect().await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_rejected_outside_disconnected() {
        let (handle, _counters) = spawn(vec![Step::Fail]);

        assert!(handle.connect().await.is_err());
        let second = handle.connect().await;
        assert!(matches!(
            second,
            Err(ConnectError::State(StateError::InvalidTransition {
                state: ConnectionState::Cooldown,
                event: Event::Connect,
            }))
        ));
        assert_eq!(handle.state(), ConnectionState::Cooldown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_reconnects_immediately() {
        let (hold_tx, hold_rx) = oneshot::channel();
        let (handle, counters) = spawn(vec![Step::Succeed, Step::Hold(hold_rx)]);

        handle.connect().await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Connected);

        handle.session().unwrap().lose();
        wait_for(&handle, ConnectionState::Connecting).await;
        assert!(handle.session().is_none());
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

        hold_tx.send(true).unwrap();
        wait_for(&handle, ConnectionState::Connected).await;
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_disconnect_single_teardown() {
        let (handle, counters) = spawn(vec![Step::Succeed]);

        handle.connect().await.unwrap();
        handle.disconnect().await.unwrap();
        handle.disconnect().await.unwrap();

        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_after_cancel_is_torn_down() {
        let (hold_tx, hold_rx) = oneshot::channel();
        let (handle, counters) = spawn(vec![Step::Hold(hold_rx)]);

        let caller = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.connect().await })
        };
        wait_for(&handle, ConnectionState::Connecting).await;

        handle.disconnect().await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Cancelled);
        assert!(matches!(caller.await.unwrap(), Err(ConnectError::Cancelled)));

        hold_tx.send(true).unwrap();
        wait_for(&handle, ConnectionState::Disconnected).await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(handle.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_live_session() {
        let (handle, counters) = spawn(vec![Step::Succeed]);
        handle.connect().await.unwrap();

        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(matches!(handle.connect().await, Err(ConnectError::Closed)));
    }
}
