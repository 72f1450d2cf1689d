//! SessionRunner - single-owner task driving the KBI-1 session
//!
//! The runner owns the state machine and the transport. Decoded events from
//! the MIDI callback thread, the periodic tick and operator commands all
//! arrive on channels and are handled one at a time, so the session is never
//! touched from two places at once.
//!
//! ```text
//!  MIDI thread ──InboundEvent──┐
//!  interval tick ──────────────┼──► SessionRunner ──bytes──► Transport
//!  SessionHandle ─Command──────┘        │
//!                                       └──SessionNotice──► subscribers
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::demo::DemoAnimation;
use crate::encode::{encode_button, encode_display, encode_exchange, ButtonGroup, DisplayTarget, LightLevel};
use crate::exchange::ExchangePair;
use crate::protocol::PARAM_ECHO;
use crate::session::{
    ConnectionState, DeviceSession, SessionAction, SessionInput, SessionMachine, SessionNotice,
};
use crate::transport::{InboundEvent, InboundKind, Transport, INBOUND_CAPACITY};

/// Callback for session notices
pub type NoticeCallback = Arc<dyn Fn(SessionNotice) + Send + Sync>;

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub session: DeviceSession,
    pub tick: u64,
}

/// Operator commands for the runner
#[derive(Debug)]
pub enum SessionCommand {
    /// Write text to a display
    Display { target: DisplayTarget, text: String },
    /// Set one button light
    Button {
        group: ButtonGroup,
        button: u8,
        level: LightLevel,
    },
    /// Send an arbitrary exchange
    Exchange(ExchangePair),
    /// Ask the device to echo a value back
    Echo(u16),
    /// Current session state
    QueryState {
        response: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown,
}

/// Cloneable handle for talking to a running [`SessionRunner`]
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    subscribers: Arc<RwLock<Vec<NoticeCallback>>>,
}

impl SessionHandle {
    /// Write text to a display (fire-and-forget)
    pub fn display(&self, target: DisplayTarget, text: impl Into<String>) {
        let _ = self.cmd_tx.send(SessionCommand::Display {
            target,
            text: text.into(),
        });
    }

    /// Set a button light (fire-and-forget)
    pub fn button(&self, group: ButtonGroup, button: u8, level: LightLevel) {
        let _ = self.cmd_tx.send(SessionCommand::Button { group, button, level });
    }

    pub fn send_exchange(&self, pair: ExchangePair) {
        let _ = self.cmd_tx.send(SessionCommand::Exchange(pair));
    }

    /// Send an echo request; the reply arrives as [`SessionNotice::Echo`]
    pub fn echo(&self, value: u16) {
        let _ = self.cmd_tx.send(SessionCommand::Echo(value));
    }

    /// Query the current state. Returns `None` once the runner has stopped.
    pub async fn state(&self) -> Option<SessionSnapshot> {
        let (response, rx) = oneshot::channel();
        self.cmd_tx.send(SessionCommand::QueryState { response }).ok()?;
        rx.await.ok()
    }

    /// Register a callback for session notices
    pub fn subscribe(&self, callback: NoticeCallback) {
        self.subscribers.write().push(callback);
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown);
    }
}

/// Owns the session and executes what the state machine asks for
pub struct SessionRunner<T: Transport> {
    machine: SessionMachine,
    transport: T,
    inbound_tx: mpsc::Sender<InboundEvent>,
    inbound_rx: mpsc::Receiver<InboundEvent>,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    subscribers: Arc<RwLock<Vec<NoticeCallback>>>,
    tick_period: Duration,
    /// Epoch handed to the next transport connection
    next_epoch: u64,
    demo: Option<DemoAnimation>,
}

impl<T: Transport> SessionRunner<T> {
    /// Create a runner and the handle used to command it
    pub fn new(transport: T, config: &SessionConfig, demo: bool) -> (Self, SessionHandle) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (cmd_tx, command_rx) = mpsc::unbounded_channel();
        let subscribers = Arc::new(RwLock::new(Vec::new()));

        let runner = Self {
            machine: SessionMachine::new(config.liveness_timeout_ticks),
            transport,
            inbound_tx,
            inbound_rx,
            command_rx,
            subscribers: subscribers.clone(),
            tick_period: config.tick_period(),
            next_epoch: 0,
            demo: demo.then(DemoAnimation::new),
        };

        (runner, SessionHandle { cmd_tx, subscribers })
    }

    pub fn machine(&self) -> &SessionMachine {
        &self.machine
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.machine.state(),
            session: self.machine.session().clone(),
            tick: self.machine.tick(),
        }
    }

    /// Run until shutdown is requested, every handle is dropped, or
    /// `shutdown` resolves
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        info!(tick_ms = self.tick_period.as_millis() as u64, "Session runner started");

        let mut ticker = tokio::time::interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick().await,

                Some(event) = self.inbound_rx.recv() => self.on_inbound(event).await,

                cmd = self.command_rx.recv() => match cmd {
                    Some(SessionCommand::Shutdown) | None => {
                        info!("Session runner received shutdown command");
                        break;
                    }
                    Some(cmd) => self.on_command(cmd).await,
                },

                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping session runner");
                    break;
                }
            }
        }

        self.transport.close();
        info!(ticks = self.machine.tick(), "Session runner terminated");
    }

    /// Handle one periodic tick
    pub async fn on_tick(&mut self) {
        // Stand-in for topology notifications: notice vanished ports
        if self.transport.is_open() && !self.transport.is_present() {
            self.transport.close();
            self.apply(SessionInput::Detached).await;
        }

        self.apply(SessionInput::Tick).await;
        let tick = self.machine.tick();

        if let ConnectionState::Connected(kind) = self.machine.state() {
            if let Some(demo) = self.demo.as_mut() {
                let bytes = demo.step(kind, tick);
                if let Some(next) = self.send(&bytes).await {
                    self.apply(next).await;
                }
            }
        }
    }

    /// Handle one event decoded by the transport
    pub async fn on_inbound(&mut self, event: InboundEvent) {
        match event.kind {
            InboundKind::Message(message) => {
                trace!(epoch = event.epoch, "Device message: {}", message);
            }
            InboundKind::Exchange(pair) => {
                self.apply(SessionInput::Exchange {
                    epoch: event.epoch,
                    pair,
                })
                .await;
            }
        }
    }

    /// Handle one operator command (except shutdown, which `run` handles)
    pub async fn on_command(&mut self, cmd: SessionCommand) {
        let bytes = match cmd {
            SessionCommand::Display { target, text } => encode_display(target, &text),
            SessionCommand::Button { group, button, level } => {
                match encode_button(group, button, level) {
                    Some(frame) => frame.to_vec(),
                    None => {
                        warn!("Button {} is outside the bank, dropping command", button);
                        return;
                    }
                }
            }
            SessionCommand::Exchange(pair) => encode_exchange(pair),
            SessionCommand::Echo(value) => encode_exchange(ExchangePair::new(PARAM_ECHO, value)),
            SessionCommand::QueryState { response } => {
                let _ = response.send(self.snapshot());
                return;
            }
            SessionCommand::Shutdown => return,
        };

        if !self.transport.is_open() {
            warn!("KBI-1 not connected, dropping command");
            return;
        }

        if let Some(next) = self.send(&bytes).await {
            self.apply(next).await;
        }
    }

    /// Feed an input to the machine and carry out the resulting actions,
    /// including any inputs those actions produce in turn
    async fn apply(&mut self, input: SessionInput) {
        let mut pending = VecDeque::from([input]);

        while let Some(input) = pending.pop_front() {
            for action in self.machine.handle(input) {
                if let Some(next) = self.execute(action).await {
                    pending.push_back(next);
                }
            }
        }
    }

    async fn execute(&mut self, action: SessionAction) -> Option<SessionInput> {
        match action {
            SessionAction::SendExchange(pair) => {
                debug!(%pair, "Sending exchange");
                self.send(&encode_exchange(pair)).await
            }
            SessionAction::PollTransport => self.poll_transport().await,
            SessionAction::ResetAnimation => {
                if let Some(demo) = self.demo.as_mut() {
                    demo.reset();
                }
                None
            }
            SessionAction::Notify(notice) => {
                self.notify(notice);
                None
            }
        }
    }

    async fn poll_transport(&mut self) -> Option<SessionInput> {
        self.next_epoch += 1;
        let epoch = self.next_epoch;

        match self.transport.open(epoch, self.inbound_tx.clone()).await {
            Ok(()) => Some(SessionInput::Attached { epoch }),
            Err(e) => {
                debug!("Waiting for KBI-1: {}", e);
                None
            }
        }
    }

    /// Send bytes; a failed send drops the connection so the next tick re-polls
    async fn send(&mut self, bytes: &[u8]) -> Option<SessionInput> {
        match self.transport.send(bytes).await {
            Ok(()) => None,
            Err(e) => {
                warn!("Send to KBI-1 failed: {}", e);
                self.transport.close();
                Some(SessionInput::Detached)
            }
        }
    }

    fn notify(&self, notice: SessionNotice) {
        match notice {
            SessionNotice::TimedOut | SessionNotice::Unplugged => warn!("{}", notice),
            _ => info!("{}", notice),
        }

        for callback in self.subscribers.read().iter() {
            callback(notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        IDENTITY_SELF, PARAM_IDENTITY, PARAM_REFRESH, PARAM_STATUS, ASK_VALUE, STATUS_ORK,
    };
    use crate::session::{clear_command, identity_inquiry, status_inquiry, SubPeripheral};
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MockState {
        present: bool,
        open: bool,
        fail_sends: bool,
        sent: Vec<Vec<u8>>,
        inbound: Option<(u64, mpsc::Sender<InboundEvent>)>,
    }

    /// Transport double recording everything sent to it
    #[derive(Clone, Default)]
    struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        fn present() -> Self {
            let mock = Self::default();
            mock.state.lock().present = true;
            mock
        }

        fn take_sent(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.state.lock().sent)
        }

        fn epoch(&self) -> u64 {
            self.state.lock().inbound.as_ref().map(|(e, _)| *e).unwrap_or(0)
        }

        /// Deliver an exchange the way the MIDI callback would
        fn device_sends(&self, pair: ExchangePair) {
            let state = self.state.lock();
            if let Some((epoch, tx)) = state.inbound.as_ref() {
                let _ = tx.try_send(InboundEvent {
                    epoch: *epoch,
                    kind: InboundKind::Exchange(pair),
                });
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(&mut self, epoch: u64, inbound: mpsc::Sender<InboundEvent>) -> Result<(), TransportError> {
            let mut state = self.state.lock();
            if !state.present {
                return Err(TransportError::PortNotFound {
                    direction: "input",
                    pattern: "mock".to_string(),
                });
            }
            state.open = true;
            state.inbound = Some((epoch, inbound));
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.state.lock().open
        }

        fn is_present(&self) -> bool {
            self.state.lock().present
        }

        async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            let mut state = self.state.lock();
            if !state.open {
                return Err(TransportError::NotConnected);
            }
            if state.fail_sends {
                return Err(TransportError::Send("mock failure".to_string()));
            }
            state.sent.push(bytes.to_vec());
            Ok(())
        }

        fn close(&mut self) {
            let mut state = self.state.lock();
            state.open = false;
            state.inbound = None;
        }
    }

    fn exchange_event(epoch: u64, parameter: u16, value: u16) -> InboundEvent {
        InboundEvent {
            epoch,
            kind: InboundKind::Exchange(ExchangePair::new(parameter, value)),
        }
    }

    fn recorded_notices(handle: &SessionHandle) -> Arc<Mutex<Vec<SessionNotice>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        handle.subscribe(Arc::new(move |notice: SessionNotice| sink.lock().push(notice)));
        seen
    }

    async fn connected_runner(
        mock: &MockTransport,
        demo: bool,
    ) -> (SessionRunner<MockTransport>, SessionHandle) {
        let (mut runner, handle) = SessionRunner::new(mock.clone(), &SessionConfig::default(), demo);
        runner.on_tick().await;
        let epoch = mock.epoch();
        runner.on_inbound(exchange_event(epoch, PARAM_IDENTITY, IDENTITY_SELF)).await;
        runner.on_inbound(exchange_event(epoch, PARAM_STATUS, STATUS_ORK)).await;
        mock.take_sent();
        (runner, handle)
    }

    #[tokio::test]
    async fn test_tick_without_device_keeps_polling() {
        let mock = MockTransport::default();
        let (mut runner, _handle) = SessionRunner::new(mock.clone(), &SessionConfig::default(), false);

        runner.on_tick().await;
        runner.on_tick().await;

        assert_eq!(runner.snapshot().state, ConnectionState::Disconnected);
        assert!(mock.take_sent().is_empty());
    }

    #[tokio::test]
    async fn test_attach_identify_connect_sequence() {
        let mock = MockTransport::present();
        let (mut runner, handle) = SessionRunner::new(mock.clone(), &SessionConfig::default(), false);
        let notices = recorded_notices(&handle);

        runner.on_tick().await;
        assert_eq!(runner.snapshot().state, ConnectionState::Identifying);
        assert_eq!(mock.take_sent(), vec![encode_exchange(identity_inquiry())]);

        let epoch = mock.epoch();
        runner.on_inbound(exchange_event(epoch, PARAM_IDENTITY, IDENTITY_SELF)).await;
        assert_eq!(mock.take_sent(), vec![encode_exchange(status_inquiry())]);

        runner.on_inbound(exchange_event(epoch, PARAM_STATUS, STATUS_ORK)).await;
        assert_eq!(mock.take_sent(), vec![encode_exchange(clear_command())]);
        assert_eq!(
            runner.snapshot().state,
            ConnectionState::Connected(SubPeripheral::Ork)
        );

        assert_eq!(
            *notices.lock(),
            vec![
                SessionNotice::Attached,
                SessionNotice::Identified,
                SessionNotice::SubPeripheralAttached(SubPeripheral::Ork),
            ]
        );
    }

    #[tokio::test]
    async fn test_vanished_ports_detach_session() {
        let mock = MockTransport::present();
        let (mut runner, handle) = connected_runner(&mock, false).await;
        let notices = recorded_notices(&handle);

        mock.state.lock().present = false;
        runner.on_tick().await;

        assert_eq!(runner.snapshot().state, ConnectionState::Disconnected);
        assert!(!runner.transport().is_open());
        assert_eq!(*notices.lock(), vec![SessionNotice::Unplugged]);
    }

    #[tokio::test]
    async fn test_reconnect_uses_new_epoch() {
        let mock = MockTransport::present();
        let (mut runner, _handle) = connected_runner(&mock, false).await;
        let old_epoch = mock.epoch();

        mock.state.lock().present = false;
        runner.on_tick().await;
        mock.state.lock().present = true;
        runner.on_tick().await;

        let new_epoch = mock.epoch();
        assert!(new_epoch > old_epoch);

        // A late identity reply from the old connection is ignored
        runner.on_inbound(exchange_event(old_epoch, PARAM_IDENTITY, IDENTITY_SELF)).await;
        assert!(!runner.machine().session().identified);
    }

    #[tokio::test]
    async fn test_send_failure_degrades_to_disconnected() {
        let mock = MockTransport::present();
        let (mut runner, _handle) = connected_runner(&mock, false).await;

        mock.state.lock().fail_sends = true;
        runner.on_tick().await;

        assert_eq!(runner.snapshot().state, ConnectionState::Disconnected);
        assert!(!runner.transport().is_open());

        // Next tick polls again and re-attaches
        mock.state.lock().fail_sends = false;
        runner.on_tick().await;
        assert_eq!(runner.snapshot().state, ConnectionState::Identifying);
    }

    #[tokio::test]
    async fn test_refresh_request_resends_clear() {
        let mock = MockTransport::present();
        let (mut runner, _handle) = connected_runner(&mock, false).await;

        runner.on_inbound(exchange_event(mock.epoch(), PARAM_REFRESH, ASK_VALUE)).await;
        assert_eq!(mock.take_sent(), vec![encode_exchange(clear_command())]);
    }

    #[tokio::test]
    async fn test_demo_writes_display_and_lights_when_connected() {
        let mock = MockTransport::present();
        let (mut runner, _handle) = connected_runner(&mock, true).await;

        runner.on_tick().await;
        let sent = mock.take_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], encode_exchange(status_inquiry()));
        // ORK display note-ons on channel 5, ending with button 0 lit on the ORK bank
        assert_eq!(sent[1][0], 0x94);
        assert_eq!(&sent[1][sent[1].len() - 3..], &[0x91, 0, 127]);
    }

    #[tokio::test]
    async fn test_commands_are_encoded_and_sent() {
        let mock = MockTransport::present();
        let (mut runner, _handle) = connected_runner(&mock, false).await;

        runner
            .on_command(SessionCommand::Display {
                target: DisplayTarget::Ork,
                text: "1".to_string(),
            })
            .await;
        runner
            .on_command(SessionCommand::Button {
                group: ButtonGroup::Ork,
                button: 9,
                level: LightLevel::Blinking,
            })
            .await;
        runner.on_command(SessionCommand::Echo(5)).await;

        assert_eq!(
            mock.take_sent(),
            vec![
                vec![0x94, 0x00, b'1', 0x84, 0x00, 0x00],
                vec![0x91, 9, 64],
                encode_exchange(ExchangePair::new(PARAM_ECHO, 5)),
            ]
        );
    }

    #[tokio::test]
    async fn test_button_outside_bank_sends_nothing() {
        let mock = MockTransport::present();
        let (mut runner, _handle) = connected_runner(&mock, false).await;

        runner
            .on_command(SessionCommand::Button {
                group: ButtonGroup::Ork,
                button: 200,
                level: LightLevel::On,
            })
            .await;

        assert!(mock.take_sent().is_empty());
        assert!(matches!(runner.machine.state(), ConnectionState::Connected(_)));
    }

    #[tokio::test]
    async fn test_commands_dropped_while_disconnected() {
        let mock = MockTransport::default();
        let (mut runner, _handle) = SessionRunner::new(mock.clone(), &SessionConfig::default(), false);

        runner.on_command(SessionCommand::Echo(1)).await;
        assert!(mock.take_sent().is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_with_handle() {
        let mock = MockTransport::present();
        let config = SessionConfig {
            tick_ms: 10,
            ..SessionConfig::default()
        };
        let (runner, handle) = SessionRunner::new(mock.clone(), &config, false);
        let task = tokio::spawn(runner.run(std::future::pending()));

        // First tick fires immediately and opens the mock
        let mut state = None;
        for _ in 0..100 {
            if mock.is_open() {
                mock.device_sends(ExchangePair::new(PARAM_IDENTITY, IDENTITY_SELF));
                mock.device_sends(ExchangePair::new(PARAM_STATUS, STATUS_ORK));
                state = handle.state().await.map(|s| s.state);
                if state == Some(ConnectionState::Connected(SubPeripheral::Ork)) {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(state, Some(ConnectionState::Connected(SubPeripheral::Ork)));

        handle.shutdown();
        task.await.unwrap();
        assert!(!mock.is_open());
        assert!(handle.state().await.is_none());
    }
}
