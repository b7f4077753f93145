//! Telephony state cache feeding the headset CIND indicators.

use std::collections::HashMap;

use bitflags::bitflags;
use log::debug;
use num_derive::{FromPrimitive, ToPrimitive};
use tokio::sync::mpsc::Sender;

use crate::{BDAddr, Message};

/// Call state as presented to the headset, in HAL ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum CallState {
    Active = 0,
    Held,
    Dialing,
    Alerting,
    Incoming,
    Waiting,
    Idle,
    Disconnected,
}

/// A telecom call state update, real or injected by the virtual call path.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadsetCallState {
    pub num_active: i32,
    pub num_held: i32,
    pub state: CallState,
    pub number: String,
    pub name: String,
}

impl HeadsetCallState {
    pub fn new(num_active: i32, num_held: i32, state: CallState) -> Self {
        Self { num_active, num_held, state, number: String::from(""), name: String::from("") }
    }
}

/// Snapshot of the AG status indicators broadcast to connected headsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadsetDeviceState {
    /// Whether cellular service is available.
    pub service: bool,
    /// Whether the network is roaming.
    pub roam: bool,
    /// Signal strength, 0-5.
    pub signal: i32,
    /// Battery charge, 0-5.
    pub battery_charge: i32,
}

bitflags! {
    /// Which telephony events a connected device is interested in.
    pub struct PhoneStateListenFlags: u32 {
        const SERVICE = 0b01;
        const SIGNAL = 0b10;
    }
}

/// Caches call and network indicators needed to compute headset status.
///
/// Mutated from telephony callbacks (or by virtual-call injection through the
/// headset service) and read by every connected device handle. Indicator
/// setters are debounced: an unchanged value does not retrigger a broadcast.
pub struct PhoneState {
    num_active: i32,
    num_held: i32,
    call_state: CallState,

    cind_service: bool,
    cind_roam: bool,
    cind_signal: i32,
    cind_battery_charge: i32,

    /// Telephony listen interest per device. The aggregate decides whether
    /// the telephony subscription is kept alive at all.
    listeners: HashMap<BDAddr, PhoneStateListenFlags>,

    tx: Sender<Message>,
}

impl PhoneState {
    pub fn new(tx: Sender<Message>) -> PhoneState {
        PhoneState {
            num_active: 0,
            num_held: 0,
            call_state: CallState::Idle,
            cind_service: false,
            cind_roam: false,
            cind_signal: 0,
            cind_battery_charge: 0,
            listeners: HashMap::new(),
            tx,
        }
    }

    pub fn num_active(&self) -> i32 {
        self.num_active
    }

    pub fn set_num_active(&mut self, num_active: i32) {
        self.num_active = num_active;
    }

    pub fn num_held(&self) -> i32 {
        self.num_held
    }

    pub fn set_num_held(&mut self, num_held: i32) {
        self.num_held = num_held;
    }

    pub fn call_state(&self) -> CallState {
        self.call_state
    }

    pub fn set_call_state(&mut self, call_state: CallState) {
        self.call_state = call_state;
    }

    /// True if there is any call in progress besides an incoming one that has
    /// not been picked up yet.
    pub fn is_in_call(&self) -> bool {
        self.num_active > 0
            || self.num_held > 0
            || (self.call_state != CallState::Idle && self.call_state != CallState::Incoming)
    }

    /// True if an incoming call is ringing.
    pub fn is_ringing(&self) -> bool {
        self.call_state == CallState::Incoming
    }

    pub fn is_call_idle(&self) -> bool {
        !self.is_in_call() && !self.is_ringing()
    }

    pub fn set_cind_service(&mut self, service: bool) {
        if self.cind_service == service {
            return;
        }
        self.cind_service = service;
        self.send_device_state_changed();
    }

    pub fn set_cind_roam(&mut self, roam: bool) {
        if self.cind_roam == roam {
            return;
        }
        self.cind_roam = roam;
        self.send_device_state_changed();
    }

    pub fn set_cind_signal(&mut self, signal: i32) {
        let signal = signal.clamp(0, 5);
        if self.cind_signal == signal {
            return;
        }
        self.cind_signal = signal;
        self.send_device_state_changed();
    }

    pub fn set_cind_battery_charge(&mut self, battery_charge: i32) {
        let battery_charge = battery_charge.clamp(0, 5);
        if self.cind_battery_charge == battery_charge {
            return;
        }
        self.cind_battery_charge = battery_charge;
        self.send_device_state_changed();
    }

    /// Returns the current indicator snapshot.
    pub fn device_state(&self) -> HeadsetDeviceState {
        HeadsetDeviceState {
            service: self.cind_service,
            roam: self.cind_roam,
            signal: self.cind_signal,
            battery_charge: self.cind_battery_charge,
        }
    }

    /// Registers (or widens) a device's interest in telephony events.
    pub fn listen_for_phone_state(&mut self, device: BDAddr, flags: PhoneStateListenFlags) {
        if flags.is_empty() {
            self.listeners.remove(&device);
        } else {
            *self.listeners.entry(device).or_insert(PhoneStateListenFlags::empty()) |= flags;
        }
        debug!("listen_for_phone_state: device={}, flags={:?}", device, flags);
    }

    /// True while at least one device is interested in telephony events.
    pub fn is_listening(&self) -> bool {
        !self.listeners.is_empty()
    }

    fn send_device_state_changed(&self) {
        let state = self.device_state();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Message::DeviceStateChanged(state)).await;
        });
    }
}
