//! On/off command rendering for bridged devices
//!
//! Bridges that drive a device through a host command use a [`CommandToggle`]
//! to produce the next invocation each time a trigger message arrives.

/// Command that alternates between an "on" and an "off" argument
///
/// Each call to [`CommandToggle::toggle`] flips the state and renders the
/// command for the new state, e.g. `ex_hello(1)` then `ex_hello(0)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandToggle {
    command: String,
    on: bool,
}

impl CommandToggle {
    /// Starts in the off state
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            on: false,
        }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Flip the state and return the command to send
    pub fn toggle(&mut self) -> String {
        self.on = !self.on;
        self.render()
    }

    /// Command for the current state without changing it
    pub fn render(&self) -> String {
        format!("{}({})", self.command, u8::from(self.on))
    }
}
