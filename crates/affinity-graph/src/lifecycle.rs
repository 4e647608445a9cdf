//! Enable / disable / shutdown state shared by builders, participants and
//! coordinators.

use std::fmt;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Lifecycle state of a component. `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Enabled,
    Disabled,
    Shutdown,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentState::Enabled => write!(f, "enabled"),
            ComponentState::Disabled => write!(f, "disabled"),
            ComponentState::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Thread-safe lifecycle cell.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<ComponentState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// A new, enabled lifecycle.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ComponentState::Enabled),
        }
    }

    pub fn state(&self) -> ComponentState {
        *self.state.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == ComponentState::Enabled
    }

    /// Move to `Enabled`. Returns whether the state changed.
    pub fn enable(&self) -> Result<bool> {
        self.transition(ComponentState::Enabled)
    }

    /// Move to `Disabled`. Returns whether the state changed.
    pub fn disable(&self) -> Result<bool> {
        self.transition(ComponentState::Disabled)
    }

    fn transition(&self, to: ComponentState) -> Result<bool> {
        let mut state = self.state.lock();
        match *state {
            ComponentState::Shutdown => Err(Error::Shutdown),
            current if current == to => Ok(false),
            _ => {
                *state = to;
                Ok(true)
            }
        }
    }

    /// Move to `Shutdown`. Returns `true` only for the first call.
    pub fn shutdown(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ComponentState::Shutdown {
            return false;
        }
        *state = ComponentState::Shutdown;
        true
    }

    /// Fail if the component has been shut down.
    pub fn ensure_running(&self) -> Result<()> {
        match self.state() {
            ComponentState::Shutdown => Err(Error::Shutdown),
            _ => Ok(()),
        }
    }

    /// Fail unless the component is enabled.
    pub fn ensure_enabled(&self) -> Result<()> {
        match self.state() {
            ComponentState::Enabled => Ok(()),
            ComponentState::Shutdown => Err(Error::Shutdown),
            state => Err(Error::InvalidState {
                expected: "enabled",
                actual: state.to_string(),
            }),
        }
    }
}
