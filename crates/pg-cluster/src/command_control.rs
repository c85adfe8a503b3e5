//! Per-operation timeout policy.

use std::time::Duration;

use serde::Serialize;

use crate::swap::SharedCell;

/// Timeouts applied to database operations.
///
/// This is an immutable value: updates replace the whole value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CommandControl {
    /// Timeout for network round-trips (connect, ping, cleanup).
    pub network: Duration,
    /// Server-side statement timeout.
    pub statement: Duration,
}

impl CommandControl {
    /// Create a command control with the given timeouts.
    #[must_use]
    pub const fn new(network: Duration, statement: Duration) -> Self {
        Self { network, statement }
    }

    /// Set the network timeout.
    #[must_use]
    pub fn with_network(mut self, timeout: Duration) -> Self {
        self.network = timeout;
        self
    }

    /// Set the statement timeout.
    #[must_use]
    pub fn with_statement(mut self, timeout: Duration) -> Self {
        self.statement = timeout;
        self
    }
}

impl Default for CommandControl {
    fn default() -> Self {
        Self {
            network: Duration::from_secs(1),
            statement: Duration::from_secs(5),
        }
    }
}

/// Concurrently readable store of the current [`CommandControl`].
#[derive(Debug, Default)]
pub struct CommandControlStore {
    cell: SharedCell<CommandControl>,
}

impl CommandControlStore {
    /// Create a store holding `initial`.
    #[must_use]
    pub fn new(initial: CommandControl) -> Self {
        Self {
            cell: SharedCell::new(initial),
        }
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> CommandControl {
        *self.cell.read()
    }

    /// Replace the stored value.
    ///
    /// Returns `false` and leaves the store untouched when `cmd_ctl` equals
    /// the current value.
    pub fn set(&self, cmd_ctl: CommandControl) -> bool {
        let mut writer = self.cell.start_write();
        if *writer == cmd_ctl {
            return false;
        }
        *writer = cmd_ctl;
        writer.commit();
        true
    }
}
