//! Per-device connection state machine.
//!
//! ```text
//! Disconnected --start--> Connecting --transport up--> Connected --login issued--> LoggingIn
//! LoggingIn --login + retrieval ok--> Active --transport lost--> Disconnected
//! any --shutdown--> Closing
//! ```
//!
//! Transitions are pure: [`ConnectionState::on`] only says where to go and
//! which requests to issue. The coordinator executes the effects.

use crate::types::ConnectionState;

/// Stimulus for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleInput {
    /// Connection was just admitted
    Start,
    /// `connect()` request failed
    ConnectFailed,
    /// Session reported `connected`
    TransportConnected,
    /// Login request has been handed to the session
    LoginIssued,
    /// Login and initial retrieval both succeeded
    SessionReady,
    /// Login or initial retrieval failed
    SessionFailed,
    /// Session reported `disconnected`
    TransportLost,
    ShutdownRequested,
}

/// Request the coordinator must issue after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    RequestConnect,
    /// Login followed by a data retrieval
    RequestLogin,
    ForceClose,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn new(from: ConnectionState, to: ConnectionState, effects: Vec<Effect>) -> Self {
        Self { from, to, effects }
    }

    pub fn became_active(&self) -> bool {
        !self.from.is_active() && self.to.is_active()
    }

    pub fn lost_active(&self) -> bool {
        self.from.is_active() && !self.to.is_active()
    }
}

impl ConnectionState {
    /// Transition for `input`, or `None` when the input does not apply here.
    pub fn on(self, input: LifecycleInput) -> Option<Transition> {
        use ConnectionState::*;
        use LifecycleInput::*;

        let transition = match (self, input) {
            (Closing, _) => return None,
            (_, ShutdownRequested) => Transition::new(self, Closing, vec![Effect::Destroy]),

            (Disconnected, Start) => {
                Transition::new(self, Connecting, vec![Effect::RequestConnect])
            }
            (Connecting, ConnectFailed) => Transition::new(self, Disconnected, Vec::new()),

            // The device library reconnects on its own, so a disconnected
            // slot may see the transport come back without a new request.
            (Connecting | Disconnected, TransportConnected) => {
                Transition::new(self, Connected, vec![Effect::RequestLogin])
            }
            (Connected, LoginIssued) => Transition::new(self, LoggingIn, Vec::new()),

            (LoggingIn, SessionReady) => Transition::new(self, Active, Vec::new()),
            (LoggingIn, SessionFailed) => {
                Transition::new(self, Disconnected, vec![Effect::ForceClose])
            }

            (Connecting | Connected | LoggingIn | Active, TransportLost) => {
                Transition::new(self, Disconnected, Vec::new())
            }

            _ => return None,
        };

        Some(transition)
    }
}
