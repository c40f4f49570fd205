//! Client lifecycle states.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a client.
///
/// ```text
/// Starting -> Started <-> Retrying
///    |           |           |
///    +-------> Stopping <----+
///                  |
///               Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientState {
    /// Looking up an endpoint and connecting for the first time.
    Starting = 0,
    /// Connected. Operations are sent straight away.
    Started = 1,
    /// The connection was lost. Operations are queued until it is back.
    Retrying = 2,
    /// Stop requested. No new operations are accepted.
    Stopping = 3,
    Stopped = 4,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Starting,
            1 => ClientState::Started,
            2 => ClientState::Retrying,
            3 => ClientState::Stopping,
            _ => ClientState::Stopped,
        }
    }

    /// Whether new operations are refused in this state.
    pub fn is_stopping_or_stopped(self) -> bool {
        matches!(self, ClientState::Stopping | ClientState::Stopped)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Starting => "starting",
            ClientState::Started => "started",
            ClientState::Retrying => "retrying",
            ClientState::Stopping => "stopping",
            ClientState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// State readable from any thread, written only by the client's component.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ClientState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ClientState {
        ClientState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ClientState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_round_trips_every_state() {
        let cell = StateCell::new(ClientState::Starting);
        for state in [
            ClientState::Started,
            ClientState::Retrying,
            ClientState::Stopping,
            ClientState::Stopped,
            ClientState::Starting,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn test_stopping_or_stopped() {
        assert!(!ClientState::Retrying.is_stopping_or_stopped());
        assert!(ClientState::Stopping.is_stopping_or_stopped());
        assert!(ClientState::Stopped.is_stopping_or_stopped());
        assert_eq!(ClientState::Retrying.to_string(), "retrying");
    }
}
