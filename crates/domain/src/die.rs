//! Die — configuration and observable state of one tracked Pixels die.
//!
//! [`DieSnapshot`] is the single unit of observable state. It is only ever
//! mutated by the session worker that owns it; everyone else sees immutable
//! clones.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::id::DieId;
use crate::protocol::Message;
use crate::time::{self, Timestamp};

/// Manufacturer reported for every die.
pub const MANUFACTURER: &str = "Pixels Dice";
/// Model reported for every die.
pub const MODEL: &str = "Bluetooth Dice";
/// Default freshness window for presence.
pub const DEFAULT_PRESENCE_WINDOW: Duration = Duration::from_secs(300);

/// Connection lifecycle of a die session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// No advertising die with the configured name was known to the adapter.
    NotFound,
    /// The transport refused or timed out the connection.
    ConnectFailed,
    /// An unexpected failure happened while connecting.
    Error,
}

impl ConnectionState {
    /// Whether a `connect` call has finished in this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Connecting)
    }
}

/// Physical motion state of the die.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollPhase {
    /// Nothing reported yet (or reset on disconnect).
    #[default]
    Idle,
    /// A roll finished on a face.
    Rolled,
    /// The die is being picked up or moved by hand.
    Handling,
    /// The die is tumbling.
    Rolling,
    /// The die came to rest tilted, not on a face.
    Crooked,
    /// The die rests on a face without a preceding roll.
    OnFace,
    /// The die sent a state code this codec does not know.
    Unknown,
}

impl RollPhase {
    /// Map a wire state code.
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::Rolled,
            0x02 => Self::Handling,
            0x03 => Self::Rolling,
            0x04 => Self::Crooked,
            0x05 => Self::OnFace,
            _ => Self::Unknown,
        }
    }

    /// Whether the die rests on a face in this phase.
    #[must_use]
    pub fn has_face(self) -> bool {
        matches!(self, Self::Rolled | Self::OnFace)
    }
}

/// Battery charging state as reported by the die.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryState {
    Ok,
    Low,
    Charging,
    Done,
    BadCharging,
    Error,
}

impl BatteryState {
    /// Map a wire state code, `None` when unknown.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::Low),
            2 => Some(Self::Charging),
            3 => Some(Self::Done),
            4 => Some(Self::BadCharging),
            5 => Some(Self::Error),
            _ => None,
        }
    }
}

/// The most recent of connection state or roll phase.
///
/// A die reports connection changes and roll changes on one "state"
/// attribute; whichever changed last wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DieStatus {
    Connection(ConnectionState),
    Roll(RollPhase),
}

impl Default for DieStatus {
    fn default() -> Self {
        Self::Connection(ConnectionState::Disconnected)
    }
}

/// One advertisement sighting of a die.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    /// Received signal strength in dBm, when the stack reports one.
    pub rssi: Option<i16>,
    pub seen_at: Timestamp,
}

/// Manufacturer / model pair attached to every die.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub manufacturer: &'static str,
    pub model: &'static str,
}

/// Host-provided configuration of one die.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DieConfig {
    pub name: String,
    pub id: DieId,
    pub autoconnect: bool,
    pub presence_window: Duration,
}

impl DieConfig {
    /// Create a configuration with autoconnect off and the default presence
    /// window.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyName`] when `name` is blank.
    pub fn new(name: impl Into<String>, id: DieId) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        Ok(Self {
            name,
            id,
            autoconnect: false,
            presence_window: DEFAULT_PRESENCE_WINDOW,
        })
    }

    /// Create a configuration whose id is the die name.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyName`] when `name` is blank.
    pub fn named(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        let id = DieId::new(name.clone()).map_err(|_| ValidationError::EmptyName)?;
        Self::new(name, id)
    }

    #[must_use]
    pub fn with_autoconnect(mut self, autoconnect: bool) -> Self {
        self.autoconnect = autoconnect;
        self
    }

    #[must_use]
    pub fn with_presence_window(mut self, window: Duration) -> Self {
        self.presence_window = window;
        self
    }

    #[must_use]
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            manufacturer: MANUFACTURER,
            model: MODEL,
        }
    }
}

/// Observable state of one die.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DieSnapshot {
    pub name: String,
    pub id: DieId,
    pub connection: ConnectionState,
    pub roll: RollPhase,
    pub status: DieStatus,
    /// 1-based face while the die rests on one.
    pub face: Option<u16>,
    pub battery_level: Option<u8>,
    pub battery_state: Option<BatteryState>,
    pub last_seen: Option<Timestamp>,
    pub rssi: Option<i16>,
    /// Heard within the presence window. Cleared once the window runs out.
    pub present: bool,
    pub autoconnect: bool,
}

impl DieSnapshot {
    /// Initial state for a freshly registered die.
    #[must_use]
    pub fn new(config: &DieConfig) -> Self {
        Self {
            name: config.name.clone(),
            id: config.id.clone(),
            connection: ConnectionState::Disconnected,
            roll: RollPhase::Idle,
            status: DieStatus::default(),
            face: None,
            battery_level: None,
            battery_state: None,
            last_seen: None,
            rssi: None,
            present: false,
            autoconnect: config.autoconnect,
        }
    }

    /// Move to a new connection state.
    ///
    /// Leaving the connected states clears the face and resets the roll
    /// phase, since no further roll reports can arrive.
    pub fn set_connection(&mut self, state: ConnectionState) {
        self.connection = state;
        self.status = DieStatus::Connection(state);
        if !matches!(
            state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            self.face = None;
            self.roll = RollPhase::Idle;
        }
    }

    /// Apply a decoded message. Returns `true` when observers should be
    /// notified.
    pub fn apply(&mut self, message: &Message) -> bool {
        match *message {
            Message::RollState { phase, face } => {
                self.roll = phase;
                self.status = DieStatus::Roll(phase);
                self.face = if phase.has_face() { face } else { None };
                true
            }
            Message::Battery { level, state } => {
                self.battery_level = Some(level);
                if let Some(state) = state {
                    self.battery_state = Some(state);
                }
                true
            }
            Message::Unhandled { .. } | Message::Malformed { .. } => false,
        }
    }

    /// Record an advertisement sighting.
    pub fn record_sighting(&mut self, sighting: &Sighting) {
        self.last_seen = Some(sighting.seen_at);
        if let Some(rssi) = sighting.rssi {
            self.rssi = Some(rssi);
        }
    }

    /// Whether the die was heard within `window` before `at`.
    #[must_use]
    pub fn is_present(&self, at: Timestamp, window: Duration) -> bool {
        self.last_seen
            .is_some_and(|seen| time::is_within(seen, at, window))
    }

    /// Recompute [`present`](Self::present) at `at`. Returns `true` when it
    /// changed.
    pub fn refresh_presence(&mut self, at: Timestamp, window: Duration) -> bool {
        let present = self.is_present(at, window);
        let changed = present != self.present;
        self.present = present;
        changed
    }

    /// Time left before presence expires, `None` when not present.
    #[must_use]
    pub fn presence_remaining(&self, at: Timestamp, window: Duration) -> Option<Duration> {
        self.last_seen
            .and_then(|seen| time::remaining(seen, at, window))
    }
}
