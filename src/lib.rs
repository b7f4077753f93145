//! Headset (HFP/HSP) profile service.
//!
//! This crate provides the orchestration logic of the headset audio gateway:
//! which remote devices are connected, which one is the active audio device,
//! and whether the synchronous (SCO) audio link may be opened right now. The
//! link-layer state machine per device, the native audio interface and the
//! telephony subsystem are external collaborators consumed through traits.

pub mod callbacks;
pub mod headset;
pub mod mocks;
pub mod phone_state;
pub mod uuid;

use std::convert::TryInto;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::channel;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::headset::{BondState, HeadsetService, HeadsetStackEvent};
use crate::phone_state::{HeadsetCallState, HeadsetDeviceState};

/// Represents a Bluetooth address.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BDAddr {
    val: [u8; 6],
}

impl Debug for BDAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for BDAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.val[0], self.val[1], self.val[2], self.val[3], self.val[4], self.val[5]
        )
    }
}

impl Default for BDAddr {
    fn default() -> Self {
        Self { val: [0; 6] }
    }
}

impl BDAddr {
    /// Constructs a BDAddr from a vector of 6 bytes.
    pub fn from_byte_vec(raw_addr: &Vec<u8>) -> Option<BDAddr> {
        if let Ok(val) = raw_addr.clone().try_into() {
            return Some(BDAddr { val });
        }
        None
    }

    pub fn from_string<S: Into<String>>(addr: S) -> Option<BDAddr> {
        let addr: String = addr.into();
        let s = addr.split(':').collect::<Vec<&str>>();

        if s.len() != 6 {
            return None;
        }

        let mut raw: [u8; 6] = [0; 6];
        for i in 0..s.len() {
            raw[i] = match u8::from_str_radix(s[i], 16) {
                Ok(res) => res,
                Err(_) => {
                    return None;
                }
            };
        }

        Some(BDAddr { val: raw })
    }

    pub fn to_byte_arr(&self) -> [u8; 6] {
        self.val.clone()
    }
}

/// Message types that are sent to the stack main dispatch loop.
///
/// Every collaborator callback (native stack events, telephony updates, bond
/// state changes, timer expirations) is funneled through this enum so that
/// the headset service only ever executes on the dispatch worker.
pub enum Message {
    /// Event emitted by a per-device connection handle or the native stack.
    Stack(HeadsetStackEvent),

    /// Telecom call state update. Virtual call injections do not go through
    /// this variant; they are applied inline by the service.
    PhoneStateChanged(HeadsetCallState),

    /// Debounced CIND indicator update from the telephony state cache.
    DeviceStateChanged(HeadsetDeviceState),

    /// Host battery level changed; scaled down to the 0-5 CIND range.
    BatteryLevelChanged { level: i32, scale: i32 },

    /// Bond state of a remote device changed.
    BondStateChanged(BDAddr, BondState),

    /// The remote-initiated outgoing dial was not resolved in time. Carries
    /// the generation the timer was armed with; stale generations are no-ops.
    DialingOutTimeout(u64),

    /// The remote-initiated voice recognition request was not resolved in
    /// time. Carries the arming generation, same as `DialingOutTimeout`.
    VoiceRecognitionTimeout(u64),

    /// A registered headset observer went away.
    HeadsetCallbackDisconnected(u32),
}

/// Umbrella for the headset stack.
pub struct Stack {}

impl Stack {
    /// Creates an mpsc channel for passing messages to the main dispatch loop.
    pub fn create_channel() -> (Sender<Message>, Receiver<Message>) {
        channel::<Message>(1)
    }

    /// Runs the main dispatch loop. All orchestration state is mutated here
    /// and nowhere else, so operations execute as a strict serial sequence.
    pub async fn dispatch(mut rx: Receiver<Message>, headset: Arc<Mutex<Box<HeadsetService>>>) {
        loop {
            let m = rx.recv().await;

            if m.is_none() {
                log::error!("Message dispatch loop quit");
                break;
            }

            match m.unwrap() {
                Message::Stack(event) => {
                    headset.lock().unwrap().dispatch_stack_event(event);
                }

                Message::PhoneStateChanged(call_state) => {
                    headset.lock().unwrap().phone_state_changed(call_state, false);
                }

                Message::DeviceStateChanged(device_state) => {
                    headset.lock().unwrap().on_device_state_changed(device_state);
                }

                Message::BatteryLevelChanged { level, scale } => {
                    headset.lock().unwrap().on_battery_level_changed(level, scale);
                }

                Message::BondStateChanged(addr, state) => {
                    headset.lock().unwrap().on_bond_state_changed(addr, state);
                }

                Message::DialingOutTimeout(generation) => {
                    headset.lock().unwrap().on_dialing_out_timeout(generation);
                }

                Message::VoiceRecognitionTimeout(generation) => {
                    headset.lock().unwrap().on_voice_recognition_timeout(generation);
                }

                Message::HeadsetCallbackDisconnected(id) => {
                    headset.lock().unwrap().remove_callback(id);
                }
            }
        }
    }
}

/// Signifies that the object may be a proxy to a remote RPC object.
///
/// An object that implements the RPCProxy trait may be disconnected at any
/// time and should implement `register_disconnect` to let others observe the
/// disconnection event.
pub trait RPCProxy {
    /// Registers a disconnect observer and returns an identifier usable to
    /// unregister it later.
    fn register_disconnect(&mut self, f: Box<dyn Fn(u32) + Send>) -> u32;

    /// Stops watching for disconnects on the given registration.
    fn unregister(&mut self, id: u32) -> bool;

    /// Returns the ID of the object. For example this would be an object path
    /// in D-Bus RPC.
    fn get_object_id(&self) -> String;
}
