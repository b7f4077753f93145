//! Headset (HFP/HSP) profile service.
//!
//! Owns the per-device connection handles, arbitrates which device is active,
//! gates SCO audio establishment and enforces that only one audio mode (telecom
//! call, virtual call, voice recognition) drives the audio link at a time.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, error, info, warn};
use num_derive::{FromPrimitive, ToPrimitive};
use tokio::sync::mpsc::Sender;
use tokio::time::sleep;

use crate::callbacks::Callbacks;
use crate::phone_state::{CallState, HeadsetCallState, HeadsetDeviceState, PhoneState};
use crate::uuid::{Uuid128Bit, UuidHelper};
use crate::{BDAddr, Message, RPCProxy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting,
    Connected,
    Disconnecting,
}

/// State of the synchronous (SCO) audio link of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum AudioState {
    Disconnected = 0,
    Connecting,
    Connected,
    Disconnecting,
}

/// Profile connection policy as recorded in the persistent policy store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum ConnectionPolicy {
    Unknown = -1,
    Forbidden = 0,
    Allowed = 100,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum BondState {
    NotBonded = 0,
    Bonding,
    Bonded,
}

/// Why a SCO establishment request was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoRejection {
    NotActiveDevice,
    AudioRouteNotAllowed,
    NoActiveAudioMode,
}

/// An entry of the current call list (AT+CLCC answer).
#[derive(Debug, Clone)]
pub struct ClccResponse {
    pub index: i32,
    pub direction: i32,
    pub status: i32,
    pub mode: i32,
    pub mpty: bool,
    pub number: String,
    pub number_type: i32,
}

/// Events emitted by the per-device connection handles and the native stack.
#[derive(Debug)]
pub enum HeadsetStackEvent {
    ConnectionStateChanged { device: BDAddr, from: ConnectionState, to: ConnectionState },
    AudioStateChanged { device: BDAddr, from: AudioState, to: AudioState },
    VoiceRecognitionStart { device: BDAddr },
    VoiceRecognitionStop { device: BDAddr },
    DialCall { device: BDAddr, number: String },
}

pub struct HeadsetServiceConfig {
    pub max_headset_connections: usize,
    pub inband_ringing_supported: bool,
    pub dialing_out_timeout_ms: u64,
    pub start_vr_timeout_ms: u64,
}

impl Default for HeadsetServiceConfig {
    fn default() -> Self {
        Self {
            max_headset_connections: 1,
            inband_ringing_supported: true,
            dialing_out_timeout_ms: 10000,
            start_vr_timeout_ms: 5000,
        }
    }
}

/// Per-device connection handle. Owns the link-layer state machine of one
/// remote device; directives are fire-and-forget, results come back as
/// `HeadsetStackEvent`s.
pub trait IHeadsetStateMachine {
    fn device(&self) -> BDAddr;
    fn connect(&mut self);
    fn disconnect(&mut self);
    fn get_connection_state(&self) -> ConnectionState;
    fn get_audio_state(&self) -> AudioState;

    /// Milliseconds timestamp of when the handle last started connecting.
    fn get_connecting_timestamp_ms(&self) -> u64;

    fn connect_audio(&mut self);
    fn disconnect_audio(&mut self);
    fn set_silence(&mut self, silence: bool);
    fn voice_recognition_start(&mut self);
    fn voice_recognition_stop(&mut self);
    fn voice_recognition_result(&mut self, success: bool);
    fn dialing_out_result(&mut self, success: bool);
    fn set_inband_ringing(&mut self, enabled: bool);
    fn call_state_changed(&mut self, call_state: &HeadsetCallState);
    fn device_state_changed(&mut self, device_state: &HeadsetDeviceState);
    fn clcc_response(&mut self, response: &ClccResponse);
}

/// Creates connection handles. Kept behind a trait so tests can inject mocks.
pub trait IHeadsetStateMachineFactory {
    fn make_state_machine(
        &self,
        device: BDAddr,
        tx: Sender<Message>,
    ) -> Box<dyn IHeadsetStateMachine + Send>;
}

/// Native HFP half of the stack.
pub trait IHeadsetNativeInterface {
    fn init(&mut self, max_connections: usize, inband_ringing: bool);

    /// Points the native audio path at the given device. Not invoked when the
    /// active device is merely cleared.
    fn set_active_device(&mut self, device: Option<BDAddr>) -> bool;

    fn set_sco_allowed(&mut self, allowed: bool);
    fn cleanup(&mut self);
}

/// Telephony, audio routing and power facilities of the platform.
pub trait ISystemInterface {
    fn activate_voice_recognition(&mut self) -> bool;
    fn deactivate_voice_recognition(&mut self) -> bool;
    fn dial_outgoing_call(&mut self, number: &str) -> bool;
    fn is_call_idle(&self) -> bool;
    fn is_in_call(&self) -> bool;
    fn is_ringing(&self) -> bool;
    fn acquire_wake_lock(&mut self, timeout_ms: u64);
    fn release_wake_lock(&mut self);
    fn is_wake_lock_held(&self) -> bool;
    fn set_audio_parameter(&mut self, key: &str, value: &str);
    fn phone_state(&mut self) -> &mut PhoneState;
}

/// Adapter-level queries: bonding, remote services, connection policy.
pub trait IAdapterInterface {
    fn get_bonded_devices(&self) -> Vec<BDAddr>;
    fn get_bond_state(&self, device: BDAddr) -> BondState;
    fn get_remote_uuids(&self, device: BDAddr) -> Vec<Uuid128Bit>;
    fn is_quiet_mode_enabled(&self) -> bool;
    fn get_connection_policy(&self, device: BDAddr) -> ConnectionPolicy;
    fn set_connection_policy(&mut self, device: BDAddr, policy: ConnectionPolicy) -> bool;
}

/// Observer of headset service state changes.
pub trait IHeadsetCallback: RPCProxy {
    fn on_active_device_changed(&self, device: Option<BDAddr>);
    fn on_connection_state_changed(&self, device: BDAddr, state: ConnectionState);
    fn on_audio_state_changed(&self, device: BDAddr, state: AudioState);
}

/// Outward API of the headset service.
pub trait IHeadset {
    fn connect(&mut self, device: BDAddr) -> bool;
    fn disconnect(&mut self, device: BDAddr) -> bool;
    fn get_connected_devices(&self) -> Vec<BDAddr>;
    fn get_devices_matching_connection_states(&self, states: &[ConnectionState]) -> Vec<BDAddr>;
    fn get_connection_state(&self, device: BDAddr) -> ConnectionState;
    fn get_connection_policy(&self, device: BDAddr) -> ConnectionPolicy;
    fn set_connection_policy(&mut self, device: BDAddr, policy: ConnectionPolicy) -> bool;
    fn register_callback(&mut self, callback: Box<dyn IHeadsetCallback + Send>) -> u32;
    fn unregister_callback(&mut self, id: u32) -> bool;
    fn set_active_device(&mut self, device: Option<BDAddr>) -> bool;
    fn get_active_device(&self) -> Option<BDAddr>;
    fn start_voice_recognition(&mut self, device: Option<BDAddr>) -> bool;
    fn stop_voice_recognition(&mut self, device: BDAddr) -> bool;
    fn is_audio_on(&self) -> bool;
    fn is_audio_connected(&self, device: BDAddr) -> bool;
    fn get_audio_state(&self, device: BDAddr) -> AudioState;
    fn connect_audio(&mut self, device: BDAddr) -> bool;
    fn disconnect_audio(&mut self, device: BDAddr) -> bool;
    fn is_audio_route_allowed(&self) -> bool;
    fn set_audio_route_allowed(&mut self, allowed: bool);
    fn set_force_sco_audio(&mut self, forced: bool);
    fn start_virtual_call(&mut self) -> bool;
    fn stop_virtual_call(&mut self) -> bool;
    fn is_virtual_call_started(&self) -> bool;
    fn set_silence_mode(&mut self, device: BDAddr, silence: bool) -> bool;
    fn is_inband_ringing_enabled(&self) -> bool;
    fn clcc_response(&mut self, response: ClccResponse);
}

/// A remote-initiated request waiting for its resolution. The generation is
/// compared against the one carried by the timeout message; a mismatch means
/// the timer is stale and must be ignored.
#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    device: BDAddr,
    generation: u64,
}

pub struct HeadsetService {
    config: HeadsetServiceConfig,
    state_machines: HashMap<BDAddr, Box<dyn IHeadsetStateMachine + Send>>,
    active_device: Option<BDAddr>,

    native: Box<dyn IHeadsetNativeInterface + Send>,
    system: Box<dyn ISystemInterface + Send>,
    adapter: Box<dyn IAdapterInterface + Send>,
    factory: Box<dyn IHeadsetStateMachineFactory + Send>,

    callbacks: Callbacks<dyn IHeadsetCallback + Send>,
    tx: Sender<Message>,

    started: bool,
    audio_route_allowed: bool,
    force_sco_audio: bool,
    inband_ringing_runtime_disable: bool,
    virtual_call_started: bool,
    voice_recognition_started: bool,

    dialing_out: Option<PendingRequest>,
    voice_recognition_request: Option<PendingRequest>,
    timeout_generation: u64,
}

impl HeadsetService {
    pub fn new(
        tx: Sender<Message>,
        native: Box<dyn IHeadsetNativeInterface + Send>,
        system: Box<dyn ISystemInterface + Send>,
        adapter: Box<dyn IAdapterInterface + Send>,
        factory: Box<dyn IHeadsetStateMachineFactory + Send>,
        config: HeadsetServiceConfig,
    ) -> HeadsetService {
        HeadsetService {
            config,
            state_machines: HashMap::new(),
            active_device: None,
            native,
            system,
            adapter,
            factory,
            callbacks: Callbacks::new(tx.clone(), Message::HeadsetCallbackDisconnected),
            tx,
            started: false,
            audio_route_allowed: true,
            force_sco_audio: false,
            inband_ringing_runtime_disable: false,
            virtual_call_started: false,
            voice_recognition_started: false,
            dialing_out: None,
            voice_recognition_request: None,
            timeout_generation: 0,
        }
    }

    /// Initializes the native layer. One extra connection slot is requested so
    /// that an incoming device can connect while an active device switch is in
    /// flight.
    pub fn start(&mut self) -> bool {
        if self.started {
            error!("start: headset service is already started");
            return false;
        }
        let inband = self.is_inband_ringing_enabled();
        self.native.init(self.config.max_headset_connections + 1, inband);
        self.started = true;
        info!(
            "start: headset service started, max_connections={}, inband_ringing={}",
            self.config.max_headset_connections, inband
        );
        true
    }

    /// Tears the service down to its initial state. Calling stop on a service
    /// that was never started is reported and accepted.
    pub fn stop(&mut self) -> bool {
        if !self.started {
            warn!("stop: headset service was never started");
            return true;
        }
        self.dialing_out = None;
        self.voice_recognition_request = None;
        if self.system.is_wake_lock_held() {
            self.system.release_wake_lock();
        }
        self.state_machines.clear();
        self.active_device = None;
        self.audio_route_allowed = true;
        self.force_sco_audio = false;
        self.inband_ringing_runtime_disable = false;
        self.virtual_call_started = false;
        self.voice_recognition_started = false;
        self.native.cleanup();
        self.started = false;
        info!("stop: headset service stopped");
        true
    }

    /// Routes one stack event to its handler. Failed remote-initiated flows
    /// are answered with a failure result so the headset is not left waiting.
    pub fn dispatch_stack_event(&mut self, event: HeadsetStackEvent) {
        match event {
            HeadsetStackEvent::ConnectionStateChanged { device, from, to } => {
                self.on_connection_state_changed(device, from, to);
            }
            HeadsetStackEvent::AudioStateChanged { device, from, to } => {
                self.on_audio_state_changed(device, from, to);
            }
            HeadsetStackEvent::VoiceRecognitionStart { device } => {
                if !self.start_voice_recognition_by_headset(device) {
                    if let Some(sm) = self.state_machines.get_mut(&device) {
                        sm.voice_recognition_result(false);
                    }
                }
            }
            HeadsetStackEvent::VoiceRecognitionStop { device } => {
                if !self.stop_voice_recognition_by_headset(device) {
                    if let Some(sm) = self.state_machines.get_mut(&device) {
                        sm.voice_recognition_result(false);
                    }
                }
            }
            HeadsetStackEvent::DialCall { device, number } => {
                if !self.dial_outgoing_call(device, number) {
                    if let Some(sm) = self.state_machines.get_mut(&device) {
                        sm.dialing_out_result(false);
                    }
                }
            }
        }
    }

    /// Decides whether a SCO establishment request from the given device may
    /// proceed at the current system state.
    pub fn sco_admission(&self, device: BDAddr) -> Result<(), ScoRejection> {
        if self.active_device != Some(device) {
            return Err(ScoRejection::NotActiveDevice);
        }
        if self.force_sco_audio {
            return Ok(());
        }
        if !self.audio_route_allowed {
            return Err(ScoRejection::AudioRouteNotAllowed);
        }
        if self.voice_recognition_started || self.virtual_call_started {
            return Ok(());
        }
        if self.should_call_audio_be_active() {
            return Ok(());
        }
        Err(ScoRejection::NoActiveAudioMode)
    }

    pub fn is_sco_acceptable(&self, device: BDAddr) -> bool {
        match self.sco_admission(device) {
            Ok(()) => true,
            Err(reason) => {
                warn!(
                    "is_sco_acceptable: rejected SCO to {}: {:?}, active={:?}, in_call={}, \
                     ringing={}, inband_ringing={}, voice_recognition={}, virtual_call={}",
                    device,
                    reason,
                    self.active_device,
                    self.system.is_in_call(),
                    self.system.is_ringing(),
                    self.is_inband_ringing_enabled(),
                    self.voice_recognition_started,
                    self.virtual_call_started
                );
                false
            }
        }
    }

    /// Check whether an incoming profile connection from the remote should be
    /// accepted by the native layer.
    pub fn ok_to_accept_connection(&self, device: BDAddr) -> bool {
        if self.adapter.is_quiet_mode_enabled() {
            warn!("ok_to_accept_connection: rejecting {}, quiet mode enabled", device);
            return false;
        }
        // Connections from devices that are not fully bonded are unauthorized.
        let bond_state = self.adapter.get_bond_state(device);
        if bond_state != BondState::Bonded {
            warn!("ok_to_accept_connection: rejecting {}, bond_state={:?}", device, bond_state);
            return false;
        }
        let policy = self.adapter.get_connection_policy(device);
        if policy != ConnectionPolicy::Unknown && policy != ConnectionPolicy::Allowed {
            warn!("ok_to_accept_connection: rejecting {}, policy={:?}", device, policy);
            return false;
        }
        let connectable = self
            .get_devices_matching_connection_states(&[
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ])
            .len();
        if connectable >= self.config.max_headset_connections {
            warn!(
                "ok_to_accept_connection: rejecting {}, maximum of {} connections reached",
                device, self.config.max_headset_connections
            );
            return false;
        }
        true
    }

    /// Dial an outgoing call as requested by the remote device. Arms the
    /// dial-out timer; the pending request resolves on the next telecom
    /// `Dialing` update or fails when the timer fires.
    pub fn dial_outgoing_call(&mut self, device: BDAddr, number: String) -> bool {
        info!("dial_outgoing_call: from {}", device);
        if let Some(pending) = self.dialing_out {
            error!("dial_outgoing_call: already dialing out from {}", pending.device);
            return false;
        }
        if self.virtual_call_started {
            if !self.stop_virtual_call() {
                error!("dial_outgoing_call: failed to stop the current virtual call");
                return false;
            }
        }
        if !self.set_active_device(Some(device)) {
            error!("dial_outgoing_call: failed to set {} as active", device);
            return false;
        }
        if !self.system.dial_outgoing_call(&number) {
            warn!("dial_outgoing_call: telephony rejected the outgoing call from {}", device);
            return false;
        }
        let generation = self.next_timeout_generation();
        self.dialing_out = Some(PendingRequest { device, generation });
        let tx = self.tx.clone();
        let timeout = Duration::from_millis(self.config.dialing_out_timeout_ms);
        tokio::spawn(async move {
            sleep(timeout).await;
            let _ = tx.send(Message::DialingOutTimeout(generation)).await;
        });
        true
    }

    pub fn has_device_initiated_dialing_out(&self) -> bool {
        self.dialing_out.is_some()
    }

    /// First device available for SCO, ordered by connection recency.
    pub fn get_first_connected_audio_device(&self) -> Option<BDAddr> {
        self.state_machines
            .values()
            .filter(|sm| {
                matches!(
                    sm.get_connection_state(),
                    ConnectionState::Connecting | ConnectionState::Connected
                )
            })
            .min_by_key(|sm| sm.get_connecting_timestamp_ms())
            .map(|sm| sm.device())
    }

    /// Applies a telecom (or injected virtual) call state update.
    pub fn phone_state_changed(&mut self, call_state: HeadsetCallState, is_virtual: bool) {
        // A real call pre-empts every synthetic audio mode.
        if call_state.num_active + call_state.num_held > 0 || call_state.state != CallState::Idle {
            if !is_virtual && self.virtual_call_started {
                self.stop_virtual_call();
            }
            if self.voice_recognition_started {
                if let Some(active) = self.active_device {
                    self.stop_voice_recognition(active);
                }
            }
        }

        if let Some(PendingRequest { device, .. }) = self.dialing_out {
            match call_state.state {
                CallState::Dialing => {
                    // The dial went through; resolve the pending request.
                    self.dialing_out = None;
                    if let Some(sm) = self.state_machines.get_mut(&device) {
                        sm.dialing_out_result(true);
                    }
                }
                CallState::Active | CallState::Idle => {
                    self.dialing_out = None;
                }
                _ => {}
            }
        }

        let was_call_idle = self.system.is_call_idle();
        {
            let phone_state = self.system.phone_state();
            phone_state.set_num_active(call_state.num_active);
            phone_state.set_num_held(call_state.num_held);
            phone_state.set_call_state(call_state.state);
        }
        // Suspend A2DP when a call is about to become active.
        if call_state.state != CallState::Disconnected
            && !self.system.is_call_idle()
            && was_call_idle
        {
            self.system.set_audio_parameter("A2dpSuspended", "true");
        }

        for sm in self.state_machines.values_mut() {
            if sm.get_connection_state() == ConnectionState::Connected {
                sm.call_state_changed(&call_state);
            }
        }

        // Resume A2DP when the call ended and no SCO link remains.
        if call_state.state == CallState::Idle && self.system.is_call_idle() && !self.is_audio_on()
        {
            self.system.set_audio_parameter("A2dpSuspended", "false");
        }
    }

    /// Forwards a CIND indicator snapshot to every connected device.
    pub fn on_device_state_changed(&mut self, device_state: HeadsetDeviceState) {
        for sm in self.state_machines.values_mut() {
            if sm.get_connection_state() == ConnectionState::Connected {
                sm.device_state_changed(&device_state);
            }
        }
    }

    /// Scales a host battery update down to the 0-5 CIND range.
    pub fn on_battery_level_changed(&mut self, level: i32, scale: i32) {
        if level < 0 || scale <= 0 {
            error!("on_battery_level_changed: bad battery update, level={}, scale={}", level, scale);
            return;
        }
        let charge = ((level as f32) * 5.0 / (scale as f32)).round() as i32;
        self.system.phone_state().set_cind_battery_charge(charge);
    }

    /// A handle is removed only once its device is unbonded and its link is
    /// down; anything else keeps the handle for reconnection.
    pub fn on_bond_state_changed(&mut self, device: BDAddr, state: BondState) {
        debug!("on_bond_state_changed: device={}, state={:?}", device, state);
        if state != BondState::NotBonded {
            return;
        }
        let removable = self
            .state_machines
            .get(&device)
            .map_or(false, |sm| sm.get_connection_state() == ConnectionState::Disconnected);
        if removable {
            info!("on_bond_state_changed: removing connection handle of unbonded {}", device);
            self.state_machines.remove(&device);
        }
    }

    pub fn on_dialing_out_timeout(&mut self, generation: u64) {
        match self.dialing_out {
            Some(PendingRequest { device, generation: armed }) if armed == generation => {
                warn!("on_dialing_out_timeout: dial-out from {} was not resolved in time", device);
                self.dialing_out = None;
                if let Some(sm) = self.state_machines.get_mut(&device) {
                    sm.dialing_out_result(false);
                }
            }
            _ => {
                debug!("on_dialing_out_timeout: stale timer, generation={}", generation);
            }
        }
    }

    pub fn on_voice_recognition_timeout(&mut self, generation: u64) {
        match self.voice_recognition_request {
            Some(PendingRequest { device, generation: armed }) if armed == generation => {
                warn!(
                    "on_voice_recognition_timeout: request from {} was not resolved in time",
                    device
                );
                self.voice_recognition_request = None;
                if self.system.is_wake_lock_held() {
                    self.system.release_wake_lock();
                }
                if let Some(sm) = self.state_machines.get_mut(&device) {
                    sm.voice_recognition_result(false);
                }
            }
            _ => {
                debug!("on_voice_recognition_timeout: stale timer, generation={}", generation);
            }
        }
    }

    pub fn remove_callback(&mut self, id: u32) {
        self.callbacks.remove_callback(id);
    }

    fn on_connection_state_changed(
        &mut self,
        device: BDAddr,
        from: ConnectionState,
        to: ConnectionState,
    ) {
        if !self.state_machines.contains_key(&device) {
            match to {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    // Remote-initiated connection; create the handle now.
                    let sm = self.factory.make_state_machine(device, self.tx.clone());
                    self.state_machines.insert(device, sm);
                }
                _ => {
                    error!(
                        "on_connection_state_changed: {} has no connection handle, to={:?}",
                        device, to
                    );
                    return;
                }
            }
        }
        info!("on_connection_state_changed: {} from {:?} to {:?}", device, from, to);

        let connectable = self.connectable_device_count();
        if from != ConnectionState::Connected && to == ConnectionState::Connected {
            // In-band ringing cannot be honored for more than one headset.
            if connectable > 1 {
                self.inband_ringing_runtime_disable = true;
                let enabled = self.is_inband_ringing_enabled();
                self.for_each_connected(|sm| sm.set_inband_ringing(enabled));
            }
        }
        if from != ConnectionState::Disconnected && to == ConnectionState::Disconnected {
            if connectable <= 1 && self.inband_ringing_runtime_disable {
                self.inband_ringing_runtime_disable = false;
                let enabled = self.is_inband_ringing_enabled();
                self.for_each_connected(|sm| sm.set_inband_ringing(enabled));
            }
            if self.active_device == Some(device) {
                self.set_active_device(None);
            }
        }

        self.callbacks.for_all_callbacks(|cb| cb.on_connection_state_changed(device, to));
    }

    fn on_audio_state_changed(&mut self, device: BDAddr, from: AudioState, to: AudioState) {
        info!("on_audio_state_changed: {} from {:?} to {:?}", device, from, to);
        if to == AudioState::Disconnected {
            if from != AudioState::Disconnected {
                if let Some(active) = self.active_device {
                    if active != device && self.should_persist_audio() {
                        if !self.connect_audio(active) {
                            warn!(
                                "on_audio_state_changed: failed to connect audio on the new \
                                 active device {} after {} dropped SCO",
                                active, device
                            );
                        }
                    }
                }
            }
            if self.voice_recognition_started {
                if !self.stop_voice_recognition_by_headset(device) {
                    warn!("on_audio_state_changed: failed to stop voice recognition");
                }
            }
            if self.virtual_call_started {
                if !self.stop_virtual_call() {
                    warn!("on_audio_state_changed: failed to stop the virtual call");
                }
            }
            if self.system.is_call_idle() {
                self.system.set_audio_parameter("A2dpSuspended", "false");
            }
        }
        self.callbacks.for_all_callbacks(|cb| cb.on_audio_state_changed(device, to));
    }

    fn start_voice_recognition_by_headset(&mut self, device: BDAddr) -> bool {
        info!("start_voice_recognition_by_headset: from {}", device);
        if self.voice_recognition_started {
            // Recover from a session that was not terminated properly.
            let stopped = self.stop_voice_recognition(device);
            warn!(
                "start_voice_recognition_by_headset: already started, recovery stop on {} \
                 returned {}, please try again",
                device, stopped
            );
            return false;
        }
        if !self.is_audio_mode_idle() {
            warn!(
                "start_voice_recognition_by_headset: audio mode not idle, active device is {:?}",
                self.active_device
            );
            return false;
        }
        if self.is_audio_on() {
            let disconnected = self.disconnect_all_audio();
            warn!(
                "start_voice_recognition_by_headset: audio is still active, disconnect \
                 returned {}, wait for audio to go down",
                disconnected
            );
            return false;
        }
        if let Some(pending) = self.voice_recognition_request {
            warn!(
                "start_voice_recognition_by_headset: rejecting {}, request from {} is pending",
                device, pending.device
            );
            return false;
        }
        if !self.set_active_device(Some(device)) {
            warn!("start_voice_recognition_by_headset: failed to set {} as active", device);
            return false;
        }
        if !self.system.activate_voice_recognition() {
            warn!("start_voice_recognition_by_headset: telephony rejected the request from {}", device);
            return false;
        }
        let generation = self.next_timeout_generation();
        self.voice_recognition_request = Some(PendingRequest { device, generation });
        let tx = self.tx.clone();
        let timeout = Duration::from_millis(self.config.start_vr_timeout_ms);
        tokio::spawn(async move {
            sleep(timeout).await;
            let _ = tx.send(Message::VoiceRecognitionTimeout(generation)).await;
        });
        if !self.system.is_wake_lock_held() {
            self.system.acquire_wake_lock(self.config.start_vr_timeout_ms);
        }
        true
    }

    fn stop_voice_recognition_by_headset(&mut self, device: BDAddr) -> bool {
        info!("stop_voice_recognition_by_headset: from {}", device);
        if self.active_device != Some(device) {
            warn!(
                "stop_voice_recognition_by_headset: {} is not active, active device is {:?}",
                device, self.active_device
            );
            return false;
        }
        if !self.voice_recognition_started && self.voice_recognition_request.is_none() {
            warn!("stop_voice_recognition_by_headset: voice recognition not started on {}", device);
            return false;
        }
        if self.voice_recognition_request.is_some() {
            self.voice_recognition_request = None;
            if self.system.is_wake_lock_held() {
                self.system.release_wake_lock();
            }
        }
        if self.voice_recognition_started {
            if !self.disconnect_all_audio() {
                warn!("stop_voice_recognition_by_headset: failed to disconnect audio from {}", device);
            }
            self.voice_recognition_started = false;
        }
        if !self.system.deactivate_voice_recognition() {
            warn!("stop_voice_recognition_by_headset: telephony rejected the stop from {}", device);
            return false;
        }
        true
    }

    fn should_call_audio_be_active(&self) -> bool {
        self.system.is_in_call()
            || (self.system.is_ringing() && self.is_inband_ringing_enabled())
    }

    /// Audio is carried over to a new active device only for real call audio.
    /// A virtual call is excluded because its SCO client is expected to
    /// reconnect on its own after the switch.
    fn should_persist_audio(&self) -> bool {
        !self.virtual_call_started && self.should_call_audio_be_active()
    }

    fn is_audio_mode_idle(&self) -> bool {
        if self.voice_recognition_started
            || self.virtual_call_started
            || !self.system.is_call_idle()
        {
            info!(
                "is_audio_mode_idle: not idle, voice_recognition={}, virtual_call={}, call_idle={}",
                self.voice_recognition_started,
                self.virtual_call_started,
                self.system.is_call_idle()
            );
            return false;
        }
        true
    }

    fn disconnect_all_audio(&mut self) -> bool {
        let non_idle: Vec<BDAddr> = self
            .state_machines
            .values()
            .filter(|sm| sm.get_audio_state() != AudioState::Disconnected)
            .map(|sm| sm.device())
            .collect();
        let mut result = false;
        for device in non_idle {
            if self.disconnect_audio(device) {
                result = true;
            } else {
                error!("disconnect_all_audio: failed to disconnect audio from {}", device);
            }
        }
        result
    }

    fn connectable_device_count(&self) -> usize {
        self.state_machines
            .values()
            .filter(|sm| {
                matches!(
                    sm.get_connection_state(),
                    ConnectionState::Connecting | ConnectionState::Connected
                )
            })
            .count()
    }

    fn for_each_connected<F: FnMut(&mut Box<dyn IHeadsetStateMachine + Send>)>(&mut self, mut f: F) {
        for sm in self.state_machines.values_mut() {
            if sm.get_connection_state() == ConnectionState::Connected {
                f(sm);
            }
        }
    }

    fn next_timeout_generation(&mut self) -> u64 {
        self.timeout_generation += 1;
        self.timeout_generation
    }
}

impl IHeadset for HeadsetService {
    fn connect(&mut self, device: BDAddr) -> bool {
        if self.adapter.get_connection_policy(device) == ConnectionPolicy::Forbidden {
            warn!("connect: connection policy of {} is forbidden", device);
            return false;
        }
        let uuids = self.adapter.get_remote_uuids(device);
        if !UuidHelper::contains_headset_uuid(&uuids) {
            error!("connect: cannot connect to {}, no headset UUID", device);
            return false;
        }
        info!("connect: device={}", device);
        if !self.state_machines.contains_key(&device) {
            let sm = self.factory.make_state_machine(device, self.tx.clone());
            self.state_machines.insert(device, sm);
        }
        let state = self.get_connection_state(device);
        if state == ConnectionState::Connected || state == ConnectionState::Connecting {
            warn!("connect: {} is already connected or connecting, state={:?}", device, state);
            return false;
        }
        let connectable = self.get_devices_matching_connection_states(&[
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]);
        if connectable.len() >= self.config.max_headset_connections {
            // With a single slot the old connection yields to the new one.
            if self.config.max_headset_connections == 1 {
                for other in connectable {
                    self.disconnect(other);
                }
                self.set_active_device(None);
            } else {
                warn!(
                    "connect: maximum of {} connections reached, rejecting {}",
                    self.config.max_headset_connections, device
                );
                return false;
            }
        }
        if let Some(sm) = self.state_machines.get_mut(&device) {
            sm.connect();
        }
        true
    }

    fn disconnect(&mut self, device: BDAddr) -> bool {
        info!("disconnect: device={}", device);
        match self.state_machines.get_mut(&device) {
            Some(sm) => match sm.get_connection_state() {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    sm.disconnect();
                    true
                }
                state => {
                    warn!("disconnect: {} is not connected or connecting, state={:?}", device, state);
                    false
                }
            },
            None => {
                warn!("disconnect: {} was never connected or connecting", device);
                false
            }
        }
    }

    fn get_connected_devices(&self) -> Vec<BDAddr> {
        self.state_machines
            .values()
            .filter(|sm| sm.get_connection_state() == ConnectionState::Connected)
            .map(|sm| sm.device())
            .collect()
    }

    fn get_devices_matching_connection_states(&self, states: &[ConnectionState]) -> Vec<BDAddr> {
        self.adapter
            .get_bonded_devices()
            .into_iter()
            .filter(|device| {
                UuidHelper::contains_headset_uuid(&self.adapter.get_remote_uuids(*device))
                    && states.contains(&self.get_connection_state(*device))
            })
            .collect()
    }

    fn get_connection_state(&self, device: BDAddr) -> ConnectionState {
        self.state_machines
            .get(&device)
            .map_or(ConnectionState::Disconnected, |sm| sm.get_connection_state())
    }

    fn get_connection_policy(&self, device: BDAddr) -> ConnectionPolicy {
        self.adapter.get_connection_policy(device)
    }

    fn set_connection_policy(&mut self, device: BDAddr, policy: ConnectionPolicy) -> bool {
        if !self.adapter.set_connection_policy(device, policy) {
            warn!("set_connection_policy: failed to store policy {:?} for {}", policy, device);
            return false;
        }
        info!("set_connection_policy: device={}, policy={:?}", device, policy);
        match policy {
            ConnectionPolicy::Allowed => {
                self.connect(device);
            }
            ConnectionPolicy::Forbidden => {
                self.disconnect(device);
            }
            ConnectionPolicy::Unknown => {}
        }
        true
    }

    fn register_callback(&mut self, callback: Box<dyn IHeadsetCallback + Send>) -> u32 {
        self.callbacks.add_callback(callback)
    }

    fn unregister_callback(&mut self, id: u32) -> bool {
        self.callbacks.remove_callback(id)
    }

    fn set_active_device(&mut self, device: Option<BDAddr>) -> bool {
        info!("set_active_device: device={:?}", device);
        let device = match device {
            Some(device) => device,
            None => {
                // Clearing the active device ends every ongoing audio mode.
                if self.voice_recognition_started {
                    if let Some(active) = self.active_device {
                        if !self.stop_voice_recognition(active) {
                            warn!("set_active_device: failed to stop voice recognition on {}", active);
                        }
                    }
                }
                if self.virtual_call_started {
                    if !self.stop_virtual_call() {
                        warn!("set_active_device: failed to stop the virtual call");
                    }
                }
                if let Some(active) = self.active_device {
                    if self.get_audio_state(active) != AudioState::Disconnected {
                        if !self.disconnect_audio(active) {
                            warn!("set_active_device: failed to disconnect audio from {}", active);
                        }
                    }
                }
                self.active_device = None;
                self.callbacks.for_all_callbacks(|cb| cb.on_active_device_changed(None));
                return true;
            }
        };
        if self.active_device == Some(device) {
            info!("set_active_device: {} is already active", device);
            return true;
        }
        if self.get_connection_state(device) != ConnectionState::Connected {
            error!("set_active_device: cannot set {} as active, device is not connected", device);
            return false;
        }
        if !self.native.set_active_device(Some(device)) {
            error!("set_active_device: cannot set {} as active in the native layer", device);
            return false;
        }
        let previous = self.active_device;
        self.active_device = Some(device);
        let previous_audio =
            previous.map_or(AudioState::Disconnected, |prev| self.get_audio_state(prev));
        if let (Some(prev), true) = (previous, previous_audio != AudioState::Disconnected) {
            // Tear the old SCO link down; the audio drop reaction brings it
            // back up on the new active device when call audio persists.
            if !self.disconnect_audio(prev) {
                error!("set_active_device: failed to disconnect audio from {}", prev);
                self.active_device = previous;
                self.native.set_active_device(previous);
                return false;
            }
            self.callbacks.for_all_callbacks(|cb| cb.on_active_device_changed(Some(device)));
        } else if self.should_persist_audio() {
            self.callbacks.for_all_callbacks(|cb| cb.on_active_device_changed(Some(device)));
            if !self.connect_audio(device) {
                error!("set_active_device: failed to connect audio on {}", device);
                self.active_device = previous;
                self.native.set_active_device(previous);
                return false;
            }
        } else {
            self.callbacks.for_all_callbacks(|cb| cb.on_active_device_changed(Some(device)));
        }
        true
    }

    fn get_active_device(&self) -> Option<BDAddr> {
        self.active_device
    }

    fn start_voice_recognition(&mut self, device: Option<BDAddr>) -> bool {
        info!("start_voice_recognition: device={:?}", device);
        if self.voice_recognition_started {
            let active = self.active_device;
            let stopped = active.map_or(false, |active| self.stop_voice_recognition(active));
            warn!(
                "start_voice_recognition: already started, recovery stop on {:?} returned {}, \
                 please try again",
                active, stopped
            );
            return false;
        }
        if !self.is_audio_mode_idle() {
            warn!(
                "start_voice_recognition: audio mode not idle, active device is {:?}",
                self.active_device
            );
            return false;
        }
        if self.is_audio_on() {
            let disconnected = self.disconnect_all_audio();
            warn!(
                "start_voice_recognition: audio is still active, disconnect returned {}, wait \
                 for audio to go down",
                disconnected
            );
            return false;
        }
        let mut device = match device.or(self.active_device) {
            Some(device) => device,
            None => {
                warn!("start_voice_recognition: no target device and no active device");
                return false;
            }
        };
        // A pending remote-initiated request is granted instead of starting a
        // fresh session.
        let mut granted_pending = false;
        if let Some(pending) = self.voice_recognition_request {
            if pending.device != device {
                warn!(
                    "start_voice_recognition: {} is not the requesting device, falling back \
                     to {}",
                    device, pending.device
                );
                device = pending.device;
            }
            self.voice_recognition_request = None;
            if self.system.is_wake_lock_held() {
                self.system.release_wake_lock();
            }
            granted_pending = true;
        }
        if self.active_device != Some(device) && !self.set_active_device(Some(device)) {
            warn!("start_voice_recognition: failed to set {} as active", device);
            return false;
        }
        match self.state_machines.get_mut(&device) {
            Some(sm)
                if matches!(
                    sm.get_connection_state(),
                    ConnectionState::Connected | ConnectionState::Connecting
                ) =>
            {
                self.voice_recognition_started = true;
                if granted_pending {
                    sm.voice_recognition_result(true);
                } else {
                    sm.voice_recognition_start();
                }
                sm.connect_audio();
                true
            }
            _ => {
                warn!("start_voice_recognition: {} is not connected or connecting", device);
                false
            }
        }
    }

    fn stop_voice_recognition(&mut self, device: BDAddr) -> bool {
        info!("stop_voice_recognition: device={}", device);
        let device = if self.active_device != Some(device) {
            warn!(
                "stop_voice_recognition: {} is not active, falling back to the active \
                 device {:?}",
                device, self.active_device
            );
            match self.active_device {
                Some(active) => active,
                None => return false,
            }
        } else {
            device
        };
        if !self.voice_recognition_started {
            warn!("stop_voice_recognition: voice recognition was not started");
            return false;
        }
        match self.state_machines.get_mut(&device) {
            Some(sm)
                if matches!(
                    sm.get_connection_state(),
                    ConnectionState::Connected | ConnectionState::Connecting
                ) =>
            {
                self.voice_recognition_started = false;
                sm.voice_recognition_stop();
                sm.disconnect_audio();
                true
            }
            _ => {
                warn!("stop_voice_recognition: {} is not connected or connecting", device);
                false
            }
        }
    }

    fn is_audio_on(&self) -> bool {
        self.state_machines
            .values()
            .any(|sm| sm.get_audio_state() != AudioState::Disconnected)
    }

    fn is_audio_connected(&self, device: BDAddr) -> bool {
        self.get_audio_state(device) == AudioState::Connected
    }

    fn get_audio_state(&self, device: BDAddr) -> AudioState {
        self.state_machines
            .get(&device)
            .map_or(AudioState::Disconnected, |sm| sm.get_audio_state())
    }

    fn connect_audio(&mut self, device: BDAddr) -> bool {
        info!("connect_audio: device={}", device);
        if !self.is_sco_acceptable(device) {
            warn!("connect_audio: rejected SCO request to {}", device);
            return false;
        }
        let audio_on = self.is_audio_on();
        match self.state_machines.get_mut(&device) {
            Some(sm) => {
                if sm.get_connection_state() != ConnectionState::Connected {
                    warn!("connect_audio: profile is not connected on {}", device);
                    return false;
                }
                if sm.get_audio_state() != AudioState::Disconnected {
                    debug!("connect_audio: audio is not idle on {}", device);
                    return true;
                }
                if audio_on {
                    warn!("connect_audio: another device still holds the audio link");
                    return false;
                }
                sm.connect_audio();
                true
            }
            None => {
                warn!("connect_audio: {} was never connected or connecting", device);
                false
            }
        }
    }

    fn disconnect_audio(&mut self, device: BDAddr) -> bool {
        info!("disconnect_audio: device={}", device);
        match self.state_machines.get_mut(&device) {
            Some(sm) => {
                if sm.get_audio_state() == AudioState::Disconnected {
                    warn!("disconnect_audio: audio is already disconnected on {}", device);
                    return false;
                }
                sm.disconnect_audio();
                true
            }
            None => {
                warn!("disconnect_audio: {} was never connected or connecting", device);
                false
            }
        }
    }

    fn is_audio_route_allowed(&self) -> bool {
        self.audio_route_allowed
    }

    fn set_audio_route_allowed(&mut self, allowed: bool) {
        info!("set_audio_route_allowed: allowed={}", allowed);
        self.audio_route_allowed = allowed;
        self.native.set_sco_allowed(allowed);
    }

    fn set_force_sco_audio(&mut self, forced: bool) {
        info!("set_force_sco_audio: forced={}", forced);
        self.force_sco_audio = forced;
    }

    fn start_virtual_call(&mut self) -> bool {
        info!("start_virtual_call");
        if self.voice_recognition_started {
            // An unterminated session blocks the virtual call until the stop
            // actually succeeds.
            let active = self.active_device;
            let stopped = active.map_or(false, |active| self.stop_voice_recognition(active));
            warn!(
                "start_virtual_call: voice recognition is still active, recovery stop on {:?} \
                 returned {}, please try again",
                active, stopped
            );
            return false;
        }
        if !self.is_audio_mode_idle() {
            warn!(
                "start_virtual_call: audio mode not idle, active device is {:?}",
                self.active_device
            );
            return false;
        }
        if self.is_audio_on() {
            let disconnected = self.disconnect_all_audio();
            warn!(
                "start_virtual_call: audio is still active, disconnect returned {}, wait for \
                 audio to go down",
                disconnected
            );
            return false;
        }
        if self.active_device.is_none() {
            warn!("start_virtual_call: no active device");
            return false;
        }
        self.virtual_call_started = true;
        // Walk the synthetic call through dialing and alerting into active so
        // the headset initializes SCO.
        self.phone_state_changed(HeadsetCallState::new(0, 0, CallState::Dialing), true);
        self.phone_state_changed(HeadsetCallState::new(0, 0, CallState::Alerting), true);
        self.phone_state_changed(HeadsetCallState::new(1, 0, CallState::Idle), true);
        true
    }

    fn stop_virtual_call(&mut self) -> bool {
        info!("stop_virtual_call");
        if !self.virtual_call_started {
            warn!("stop_virtual_call: virtual call was not started");
            return false;
        }
        self.virtual_call_started = false;
        self.phone_state_changed(HeadsetCallState::new(0, 0, CallState::Idle), true);
        true
    }

    fn is_virtual_call_started(&self) -> bool {
        self.virtual_call_started
    }

    fn set_silence_mode(&mut self, device: BDAddr, silence: bool) -> bool {
        debug!("set_silence_mode: device={}, silence={}", device, silence);
        if silence && self.active_device == Some(device) {
            self.set_active_device(None);
        } else if !silence && self.active_device.is_none() {
            // Un-silencing with no active device promotes this one.
            self.set_active_device(Some(device));
        }
        match self.state_machines.get_mut(&device) {
            Some(sm) => {
                sm.set_silence(silence);
                true
            }
            None => {
                warn!("set_silence_mode: {} was never connected or connecting", device);
                false
            }
        }
    }

    fn is_inband_ringing_enabled(&self) -> bool {
        self.config.inband_ringing_supported && !self.inband_ringing_runtime_disable
    }

    fn clcc_response(&mut self, response: ClccResponse) {
        self.for_each_connected(|sm| sm.clcc_response(&response));
    }
}
