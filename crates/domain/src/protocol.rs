//! Pixels die wire protocol — notification frame decoding and request encoding.
//!
//! Pure functions operating on raw `&[u8]` slices, with no BLE dependency.
//! Every frame starts with a one-byte message tag:
//!
//! | Tag | Direction | Message | Payload |
//! |-----|-----------|---------|---------|
//! | `0x03` | die → host | Roll state | state code, 0-based face index |
//! | `0x21` | host → die | Request battery level | none |
//! | `0x22` | die → host | Battery level | percent, battery state code |
//!
//! Inbound frames shorter than [`MIN_FRAME_LEN`] are malformed. Unknown tags
//! decode to [`Message::Unhandled`]; unknown state codes degrade to
//! [`RollPhase::Unknown`] or a missing [`BatteryState`] instead of failing.

use crate::die::{BatteryState, RollPhase};

/// UUID of the Pixels GATT service.
pub const PIXELS_SERVICE_UUID: uuid::Uuid =
    uuid::Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Characteristic the die sends notification frames on.
///
/// The observed protocol shares one UUID between notify and write.
pub const NOTIFY_CHARACTERISTIC: uuid::Uuid = PIXELS_SERVICE_UUID;

/// Characteristic requests are written to.
pub const WRITE_CHARACTERISTIC: uuid::Uuid = PIXELS_SERVICE_UUID;

/// Standard GATT battery level characteristic (`0x2A19`), one-byte percent.
pub const BATTERY_LEVEL_CHARACTERISTIC: uuid::Uuid =
    uuid::Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);

/// Tag of the roll state notification.
pub const TAG_ROLL_STATE: u8 = 0x03;
/// Tag of the battery level request.
pub const TAG_REQUEST_BATTERY_LEVEL: u8 = 0x21;
/// Tag of the battery level notification.
pub const TAG_BATTERY_LEVEL: u8 = 0x22;

/// Shortest inbound frame carrying a tag and two payload bytes.
pub const MIN_FRAME_LEN: usize = 3;

/// A decoded inbound notification frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// The die's motion state changed.
    RollState {
        phase: RollPhase,
        /// 1-based face, present for [`RollPhase::Rolled`] and [`RollPhase::OnFace`].
        face: Option<u16>,
    },
    /// Battery report, usually in answer to [`Request::BatteryLevel`].
    Battery {
        /// Charge in percent, clamped to 100.
        level: u8,
        /// `None` when the state code is not recognised.
        state: Option<BatteryState>,
    },
    /// A well-formed frame with a tag this codec does not interpret.
    Unhandled { tag: u8 },
    /// Frame too short to carry any known message.
    Malformed { len: usize },
}

/// Decode one notification frame. Total: never panics, never fails.
#[must_use]
pub fn decode(frame: &[u8]) -> Message {
    let &[tag, first, second, ..] = frame else {
        return Message::Malformed { len: frame.len() };
    };

    match tag {
        TAG_ROLL_STATE => {
            let phase = RollPhase::from_code(first);
            let face = phase.has_face().then(|| u16::from(second) + 1);
            Message::RollState { phase, face }
        }
        TAG_BATTERY_LEVEL => Message::Battery {
            level: first.min(100),
            state: BatteryState::from_code(second),
        },
        other => Message::Unhandled { tag: other },
    }
}

/// An outbound request written to [`WRITE_CHARACTERISTIC`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Ask the die to send a [`Message::Battery`] notification.
    BatteryLevel,
}

impl Request {
    /// Message tag of this request.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::BatteryLevel => TAG_REQUEST_BATTERY_LEVEL,
        }
    }

    /// Encode the request as a wire frame.
    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        match self {
            Self::BatteryLevel => vec![self.tag()],
        }
    }

    /// Parse a request frame as the die would. Returns `None` for unknown
    /// tags or unexpected payloads.
    #[must_use]
    pub fn decode(frame: &[u8]) -> Option<Self> {
        match frame {
            [TAG_REQUEST_BATTERY_LEVEL] => Some(Self::BatteryLevel),
            _ => None,
        }
    }
}
