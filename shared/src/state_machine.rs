//! Link State Machine
//!
//! Defines the valid connection state transitions. The connection manager
//! drives this machine under its lock and owns the side effects (launching
//! and cancelling tasks); the machine itself only decides the next state.

use crate::ConnectionState;

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// `start()` called; `can_listen` is true when an acceptor is configured
    Started { can_listen: bool },
    /// `connect()` called
    ConnectRequested,
    /// Outbound attempt produced a stream
    OutboundSucceeded,
    /// Outbound attempt failed or timed out
    OutboundFailed,
    /// Acceptor produced a stream
    InboundAccepted,
    /// Pump saw the stream close or fail
    StreamLost,
    /// Acceptor gave up (bind or accept error, or re-arming disabled)
    ListenerEnded,
    /// `stop()` called
    Stopped,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid; carries the new state (may equal the old one)
    Success(ConnectionState),
    /// Transition was invalid from the current state
    Invalid {
        from: ConnectionState,
        event: LinkEvent,
    },
}

/// The connection state machine
#[derive(Debug, Default)]
pub struct LinkStateMachine {
    current_state: ConnectionState,
    can_listen: bool,
    stopped: bool,
}

impl LinkStateMachine {
    /// Create a new state machine in the NONE state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.current_state
    }

    /// True once `start()` ran with an acceptor configured
    pub fn can_listen(&self) -> bool {
        self.can_listen
    }

    /// True once `Stopped` has been processed
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// State to fall back to when a connection attempt or session ends
    pub fn fallback_state(&self) -> ConnectionState {
        if self.can_listen {
            ConnectionState::Listening
        } else {
            ConnectionState::None
        }
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        if self.stopped {
            return TransitionResult::Invalid {
                from: self.current_state,
                event,
            };
        }

        match self.next_state(event) {
            Some(state) => {
                match event {
                    LinkEvent::Started { can_listen } => self.can_listen |= can_listen,
                    LinkEvent::Stopped => self.stopped = true,
                    _ => {}
                }
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    fn next_state(&self, event: LinkEvent) -> Option<ConnectionState> {
        use ConnectionState as S;
        use LinkEvent::*;

        match (self.current_state, event) {
            (S::None, Started { can_listen: true }) => Some(S::Listening),
            (S::None, Started { can_listen: false }) => Some(S::None),
            // Already running: start is a no-op
            (state, Started { .. }) => Some(state),

            (_, ConnectRequested) => Some(S::Connecting),

            (S::Connecting, OutboundSucceeded) => Some(S::Connected),
            (S::Connecting, OutboundFailed) => Some(self.fallback_state()),

            (S::Listening | S::Connecting, InboundAccepted) => Some(S::Connected),

            (S::Connected, StreamLost) => Some(self.fallback_state()),

            (S::Listening, ListenerEnded) => Some(S::None),
            (state, ListenerEnded) => Some(state),

            (_, Stopped) => Some(S::None),

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let fsm = LinkStateMachine::new();
        assert_eq!(fsm.state(), ConnectionState::None);
        assert!(!fsm.can_listen());
    }

    #[test]
    fn test_start_without_acceptor_stays_none() {
        let mut fsm = LinkStateMachine::new();
        let result = fsm.process_event(LinkEvent::Started { can_listen: false });
        assert_eq!(result, TransitionResult::Success(ConnectionState::None));
    }

    #[test]
    fn test_outbound_flow() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::Started { can_listen: false });

        let result = fsm.process_event(LinkEvent::ConnectRequested);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Connecting));

        let result = fsm.process_event(LinkEvent::OutboundSucceeded);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Connected));

        let result = fsm.process_event(LinkEvent::StreamLost);
        assert_eq!(result, TransitionResult::Success(ConnectionState::None));
    }

    #[test]
    fn test_failures_fall_back_to_listening() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::Started { can_listen: true });
        assert_eq!(fsm.state(), ConnectionState::Listening);

        fsm.process_event(LinkEvent::ConnectRequested);
        let result = fsm.process_event(LinkEvent::OutboundFailed);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Listening));

        fsm.process_event(LinkEvent::InboundAccepted);
        assert_eq!(fsm.state(), ConnectionState::Connected);
        let result = fsm.process_event(LinkEvent::StreamLost);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Listening));
    }

    #[test]
    fn test_inbound_accepted_while_connected_is_invalid() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);
        fsm.process_event(LinkEvent::OutboundSucceeded);

        let result = fsm.process_event(LinkEvent::InboundAccepted);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_outbound_success_requires_connecting() {
        let mut fsm = LinkStateMachine::new();
        let result = fsm.process_event(LinkEvent::OutboundSucceeded);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), ConnectionState::None);
    }

    #[test]
    fn test_listener_ended() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::Started { can_listen: true });
        let result = fsm.process_event(LinkEvent::ListenerEnded);
        assert_eq!(result, TransitionResult::Success(ConnectionState::None));

        fsm.process_event(LinkEvent::ConnectRequested);
        let result = fsm.process_event(LinkEvent::ListenerEnded);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Connecting));
    }

    #[test]
    fn test_stop_is_terminal() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);
        let result = fsm.process_event(LinkEvent::Stopped);
        assert_eq!(result, TransitionResult::Success(ConnectionState::None));
        assert!(fsm.is_stopped());

        let result = fsm.process_event(LinkEvent::ConnectRequested);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), ConnectionState::None);
    }
}
