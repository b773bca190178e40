//! Presence payloads and how the LED listener interprets them.
//!
//! The publisher only ever sends the literal `"1"` or `"0"`. The listener is
//! more lenient: any payload containing a `1` (or `liga`/`on`) switches the
//! LED on, `toggle` inverts it, anything else switches it off.

pub const PAYLOAD_PRESENT: &str = "1";
pub const PAYLOAD_ABSENT: &str = "0";

/// Payload to publish for a match decision.
pub fn presence_payload(is_target: bool) -> &'static str {
    if is_target { PAYLOAD_PRESENT } else { PAYLOAD_ABSENT }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedCommand {
    On,
    Off,
    Toggle,
}

/// Decode an incoming payload the way the actuator does.
pub fn interpret(payload: &[u8]) -> LedCommand {
    let text = String::from_utf8_lossy(payload).trim().to_lowercase();
    if text.contains('1') || text == "liga" || text == "on" {
        LedCommand::On
    } else if text == "toggle" {
        LedCommand::Toggle
    } else {
        LedCommand::Off
    }
}

/// LED state on the actuator side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedState {
    pub on: bool,
}

impl LedState {
    /// Apply a command; returns true if the LED changed.
    pub fn apply(&mut self, command: LedCommand) -> bool {
        let next = match command {
            LedCommand::On => true,
            LedCommand::Off => false,
            LedCommand::Toggle => !self.on,
        };
        let changed = next != self.on;
        self.on = next;
        changed
    }
}
