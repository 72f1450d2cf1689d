//! Connection/session state machine
//!
//! Tracks whether the interface is attached and identified, which keyboard
//! (ORK or VK) sits behind it, and whether it is still answering. The machine
//! is a plain value: inputs go in through [`SessionMachine::handle`], and the
//! outbound work it wants done comes back as a list of [`SessionAction`]s for
//! the owner to execute. It never talks to the transport itself.

use std::fmt;

use tracing::{debug, info, trace};

use crate::exchange::ExchangePair;
use crate::protocol::{
    ASK_VALUE, IDENTITY_ALTERNATE, IDENTITY_SELF, PARAM_CLEAR, PARAM_ECHO, PARAM_IDENTITY,
    PARAM_REFRESH, PARAM_STATUS, STATUS_NONE, STATUS_ORK, STATUS_VK,
};

/// Reference liveness timeout, in ticks
pub const DEFAULT_LIVENESS_TIMEOUT: u64 = 5;

/// Keyboard attached behind the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubPeripheral {
    /// Optical Rotary Keyboard
    Ork,
    /// Velocity Keyboard
    Vk,
}

impl SubPeripheral {
    /// Decode a status value; `None` for "nothing attached" and unknown values
    pub fn from_status(value: u16) -> Option<Self> {
        match value {
            STATUS_ORK => Some(SubPeripheral::Ork),
            STATUS_VK => Some(SubPeripheral::Vk),
            _ => None,
        }
    }
}

impl fmt::Display for SubPeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubPeripheral::Ork => write!(f, "ORK"),
            SubPeripheral::Vk => write!(f, "VK"),
        }
    }
}

/// Coarse connection state derived from the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Identifying,
    Connected(SubPeripheral),
}

/// Per-connection device state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSession {
    pub attached: bool,
    pub identified: bool,
    pub sub_peripheral: Option<SubPeripheral>,
    /// Tick at which the last status exchange arrived
    pub last_liveness_tick: u64,
    /// Epoch of the current transport connection
    pub epoch: u64,
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    /// Both endpoints opened; events of this connection carry `epoch`
    Attached { epoch: u64 },
    /// Endpoints went away
    Detached,
    /// A completed exchange from the connection identified by `epoch`
    Exchange { epoch: u64, pair: ExchangePair },
    /// Periodic timer
    Tick,
}

/// Things the owner of the machine should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Encode and send an exchange to the device
    SendExchange(ExchangePair),
    /// Look for the device endpoints again
    PollTransport,
    /// Restart any display/light animation from the beginning
    ResetAnimation,
    /// Surface a state change to the operator
    Notify(SessionNotice),
}

/// Presence and status changes worth reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionNotice {
    Attached,
    Identified,
    SubPeripheralAttached(SubPeripheral),
    SubPeripheralDetached,
    /// Identified device stopped answering status inquiries
    TimedOut,
    /// Identified device's endpoints disappeared
    Unplugged,
    Echo(u16),
}

impl fmt::Display for SessionNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionNotice::Attached => write!(f, "KBI-1 ports found"),
            SessionNotice::Identified => write!(f, "KBI-1 connected"),
            SessionNotice::SubPeripheralAttached(kind) => write!(f, "{} connected", kind),
            SessionNotice::SubPeripheralDetached => write!(f, "ORK/VK disconnected"),
            SessionNotice::TimedOut => write!(f, "KBI-1 timeout"),
            SessionNotice::Unplugged => write!(f, "KBI-1 unplugged"),
            SessionNotice::Echo(value) => write!(f, "Echo {:#06X}", value),
        }
    }
}

/// Identity inquiry (parameter 0, ask)
pub fn identity_inquiry() -> ExchangePair {
    ExchangePair::new(PARAM_IDENTITY, ASK_VALUE)
}

/// Status inquiry (parameter 1, ask)
pub fn status_inquiry() -> ExchangePair {
    ExchangePair::new(PARAM_STATUS, ASK_VALUE)
}

/// Clear display and lights (parameter 2, value 0)
pub fn clear_command() -> ExchangePair {
    ExchangePair::new(PARAM_CLEAR, 0)
}

/// Session state machine
#[derive(Debug)]
pub struct SessionMachine {
    session: DeviceSession,
    tick: u64,
    liveness_timeout: u64,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new(DEFAULT_LIVENESS_TIMEOUT)
    }
}

impl SessionMachine {
    pub fn new(liveness_timeout: u64) -> Self {
        Self {
            session: DeviceSession::default(),
            tick: 0,
            liveness_timeout,
        }
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// Number of ticks handled so far, which is also the index of the last one
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn state(&self) -> ConnectionState {
        if !self.session.attached {
            ConnectionState::Disconnected
        } else if let Some(kind) = self.session.sub_peripheral {
            ConnectionState::Connected(kind)
        } else {
            ConnectionState::Identifying
        }
    }

    /// Apply one input and return the resulting actions, in order
    pub fn handle(&mut self, input: SessionInput) -> Vec<SessionAction> {
        let mut actions = Vec::new();

        match input {
            SessionInput::Attached { epoch } => self.on_attached(epoch, &mut actions),
            SessionInput::Detached => self.on_detached(&mut actions),
            SessionInput::Exchange { epoch, pair } => {
                if !self.session.attached || epoch != self.session.epoch {
                    trace!(epoch, %pair, "Dropping exchange outside the current connection");
                } else {
                    self.on_exchange(pair, &mut actions);
                }
            }
            SessionInput::Tick => {
                // Replies arriving until the next tick are stamped with this one
                self.tick += 1;
                self.on_tick(&mut actions);
            }
        }

        actions
    }

    fn on_attached(&mut self, epoch: u64, actions: &mut Vec<SessionAction>) {
        info!(epoch, "Transport attached, identifying device");
        self.session = DeviceSession {
            attached: true,
            epoch,
            last_liveness_tick: self.tick,
            ..DeviceSession::default()
        };
        actions.push(SessionAction::Notify(SessionNotice::Attached));
        actions.push(SessionAction::SendExchange(identity_inquiry()));
    }

    fn on_detached(&mut self, actions: &mut Vec<SessionAction>) {
        if !self.session.attached {
            return;
        }
        if self.session.identified {
            actions.push(SessionAction::Notify(SessionNotice::Unplugged));
        }
        info!("Transport detached");
        self.session = DeviceSession {
            epoch: self.session.epoch,
            ..DeviceSession::default()
        };
    }

    fn on_exchange(&mut self, pair: ExchangePair, actions: &mut Vec<SessionAction>) {
        debug!(%pair, "Exchange from device");

        match pair.parameter {
            PARAM_IDENTITY => match pair.value {
                IDENTITY_SELF if !self.session.identified => {
                    self.session.identified = true;
                    actions.push(SessionAction::Notify(SessionNotice::Identified));
                    actions.push(SessionAction::SendExchange(status_inquiry()));
                }
                IDENTITY_SELF => {}
                IDENTITY_ALTERNATE => debug!("Device identifies as the alternate product, ignoring"),
                other => debug!(value = other, "Unknown identity response"),
            },
            PARAM_STATUS => self.on_status(pair.value, actions),
            PARAM_REFRESH if pair.value == ASK_VALUE => {
                if self.session.sub_peripheral.is_some() {
                    debug!("Device asked for a refresh");
                    actions.push(SessionAction::SendExchange(clear_command()));
                }
            }
            PARAM_ECHO => actions.push(SessionAction::Notify(SessionNotice::Echo(pair.value))),
            _ => trace!(%pair, "Unhandled exchange"),
        }
    }

    fn on_status(&mut self, value: u16, actions: &mut Vec<SessionAction>) {
        self.session.last_liveness_tick = self.tick;

        if value == STATUS_NONE {
            if self.session.sub_peripheral.take().is_some() {
                actions.push(SessionAction::Notify(SessionNotice::SubPeripheralDetached));
            }
            return;
        }

        let Some(kind) = SubPeripheral::from_status(value) else {
            debug!(value, "Unknown status value");
            return;
        };

        if self.session.sub_peripheral != Some(kind) {
            self.session.sub_peripheral = Some(kind);
            actions.push(SessionAction::Notify(SessionNotice::SubPeripheralAttached(kind)));
            actions.push(SessionAction::SendExchange(clear_command()));
            actions.push(SessionAction::ResetAnimation);
        }
    }

    fn on_tick(&mut self, actions: &mut Vec<SessionAction>) {
        let session = &mut self.session;

        if !session.attached {
            actions.push(SessionAction::PollTransport);
        } else if !session.identified {
            actions.push(SessionAction::SendExchange(identity_inquiry()));
        } else if session.sub_peripheral.is_some()
            && self.tick.saturating_sub(session.last_liveness_tick) > self.liveness_timeout
        {
            info!(
                tick = self.tick,
                last = session.last_liveness_tick,
                "No status from device, presuming it gone"
            );
            session.identified = false;
            session.sub_peripheral = None;
            actions.push(SessionAction::Notify(SessionNotice::TimedOut));
        } else {
            actions.push(SessionAction::SendExchange(status_inquiry()));
        }
    }
}
