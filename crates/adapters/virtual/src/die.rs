//! Virtual die — a simulated Pixels die speaking the real wire protocol.

use std::sync::{Mutex, PoisonError};

use pixels_dice_app::ports::FrameSink;
use pixels_dice_domain::die::{BatteryState, RollPhase};
use pixels_dice_domain::protocol::{TAG_BATTERY_LEVEL, TAG_ROLL_STATE};

/// Roll state codes as sent on the wire.
fn roll_code(phase: RollPhase) -> u8 {
    match phase {
        RollPhase::Rolled => 0x01,
        RollPhase::Handling => 0x02,
        RollPhase::Rolling => 0x03,
        RollPhase::Crooked => 0x04,
        RollPhase::OnFace => 0x05,
        RollPhase::Idle | RollPhase::Unknown => 0x00,
    }
}

fn battery_code(state: BatteryState) -> u8 {
    match state {
        BatteryState::Ok => 0,
        BatteryState::Low => 1,
        BatteryState::Charging => 2,
        BatteryState::Done => 3,
        BatteryState::BadCharging => 4,
        BatteryState::Error => 5,
    }
}

#[derive(Debug)]
struct State {
    powered: bool,
    accepting: bool,
    connected: bool,
    /// Incremented on every accepted connection.
    generation: u64,
    battery_level: u8,
    battery_state: BatteryState,
    notify: Option<FrameSink>,
    writes: Vec<Vec<u8>>,
}

/// A simulated die.
///
/// Starts powered on, accepting connections, with a full battery.
#[derive(Debug)]
pub struct VirtualDie {
    name: String,
    state: Mutex<State>,
}

impl VirtualDie {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                powered: true,
                accepting: true,
                connected: false,
                generation: 0,
                battery_level: 100,
                battery_state: BatteryState::Ok,
                notify: None,
                writes: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A powered-off die cannot be discovered and drops its connection.
    pub fn set_powered(&self, powered: bool) {
        self.lock().powered = powered;
        if !powered {
            self.drop_connection();
        }
    }

    /// Drop the link the way a die walking out of range does: the subscriber
    /// is told the link is gone. Returns whether a link was up.
    pub fn drop_connection(&self) -> bool {
        let (was_connected, sink) = {
            let mut state = self.lock();
            let was_connected = std::mem::replace(&mut state.connected, false);
            (was_connected, state.notify.take())
        };
        if let Some(sink) = sink {
            sink.link_lost();
        }
        was_connected
    }

    #[must_use]
    pub fn is_powered(&self) -> bool {
        self.lock().powered
    }

    /// Refuse (or accept again) incoming connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().accepting = !refuse;
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Whether a session is currently subscribed to notifications.
    #[must_use]
    pub fn has_subscriber(&self) -> bool {
        self.lock().notify.is_some()
    }

    /// Every frame written to the die, oldest first.
    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    #[must_use]
    pub fn battery_level(&self) -> u8 {
        self.lock().battery_level
    }

    /// Tumble and land on `face` (1-based). Returns whether a subscriber
    /// received the frames.
    pub fn roll(&self, face: u16) -> bool {
        let rolling = self.notify(&[TAG_ROLL_STATE, roll_code(RollPhase::Rolling), 0]);
        let landed = self.send_roll_state(RollPhase::OnFace, face);
        rolling && landed
    }

    /// Send an arbitrary roll state. `face` is 1-based and only meaningful
    /// for phases that carry one.
    pub fn send_roll_state(&self, phase: RollPhase, face: u16) -> bool {
        let index = u8::try_from(face.saturating_sub(1)).unwrap_or(u8::MAX);
        self.notify(&[TAG_ROLL_STATE, roll_code(phase), index])
    }

    /// Change the battery and report it to the subscriber, if any.
    pub fn set_battery(&self, level: u8, state: BatteryState) -> bool {
        {
            let mut inner = self.lock();
            inner.battery_level = level;
            inner.battery_state = state;
        }
        self.report_battery()
    }

    /// Push a raw frame, bypassing the simulation.
    pub fn notify(&self, frame: &[u8]) -> bool {
        let sink = self.lock().notify.clone();
        sink.is_some_and(|sink| sink.push(frame.to_vec()))
    }

    pub(crate) fn report_battery(&self) -> bool {
        let frame = {
            let state = self.lock();
            [
                TAG_BATTERY_LEVEL,
                state.battery_level,
                battery_code(state.battery_state),
            ]
        };
        self.notify(&frame)
    }

    /// Accept a connection. Returns its generation, or `None` when refused.
    pub(crate) fn accept(&self) -> Option<u64> {
        let mut state = self.lock();
        if !state.powered || !state.accepting {
            return None;
        }
        state.connected = true;
        state.generation += 1;
        state.notify = None;
        Some(state.generation)
    }

    pub(crate) fn is_linked(&self, generation: u64) -> bool {
        let state = self.lock();
        state.connected && state.generation == generation
    }

    pub(crate) fn set_notify(&self, generation: u64, sink: Option<FrameSink>) -> bool {
        let mut state = self.lock();
        if !(state.connected && state.generation == generation) {
            return false;
        }
        state.notify = sink;
        true
    }

    pub(crate) fn record_write(&self, frame: &[u8]) {
        self.lock().writes.push(frame.to_vec());
    }

    pub(crate) fn release(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation {
            state.connected = false;
            state.notify = None;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
