//! Control-channel action codes.

use thiserror::Error;

/// The first u32 on every control connection selects one of these.
///
/// `Connect` is reserved on the wire but has never had a handler; the
/// dispatcher rejects it like any unknown code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Action {
    Register = 0,
    Connect = 1,
    Login = 2,
    Tunnel = 3,
    JoinPool = 4,
}

impl Action {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// A u32 outside the closed set of action codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid action code: {0}")]
pub struct InvalidAction(pub u32);

impl TryFrom<u32> for Action {
    type Error = InvalidAction;

    fn try_from(code: u32) -> Result<Self, InvalidAction> {
        match code {
            0 => Ok(Action::Register),
            1 => Ok(Action::Connect),
            2 => Ok(Action::Login),
            3 => Ok(Action::Tunnel),
            4 => Ok(Action::JoinPool),
            other => Err(InvalidAction(other)),
        }
    }
}
