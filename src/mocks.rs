//! Mock collaborators for testing the headset service without a native stack.
//!
//! Every directive the service issues is routed to a single unbounded channel
//! of [`MockEvent`]s so tests can assert on the exact sequence of side
//! effects. Link and audio states live in a shared map that both the mock
//! connection handles and the tests can read and write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{Sender, UnboundedSender};

use crate::headset::{
    AudioState, BondState, ClccResponse, ConnectionPolicy, ConnectionState, IAdapterInterface,
    IHeadsetCallback, IHeadsetNativeInterface, IHeadsetStateMachine, IHeadsetStateMachineFactory,
    ISystemInterface,
};
use crate::phone_state::{HeadsetCallState, HeadsetDeviceState, PhoneState};
use crate::uuid::{Uuid128Bit, UuidHelper, HFP};
use crate::{BDAddr, Message, RPCProxy};

/// Every observable side effect of the service, in issue order.
#[derive(Debug)]
pub enum MockEvent {
    Connect(BDAddr),
    Disconnect(BDAddr),
    ConnectAudio(BDAddr),
    DisconnectAudio(BDAddr),
    SetSilence(BDAddr, bool),
    VoiceRecognitionStart(BDAddr),
    VoiceRecognitionStop(BDAddr),
    VoiceRecognitionResult(BDAddr, bool),
    DialingOutResult(BDAddr, bool),
    SetInbandRinging(BDAddr, bool),
    CallStateChanged(BDAddr, HeadsetCallState),
    DeviceStateChanged(BDAddr, HeadsetDeviceState),
    ClccResponse(BDAddr, i32),

    NativeInit { max_connections: usize, inband_ringing: bool },
    NativeSetActiveDevice(Option<BDAddr>),
    NativeSetScoAllowed(bool),
    NativeCleanup,

    ActivateVoiceRecognition,
    DeactivateVoiceRecognition,
    DialOutgoingCall(String),
    AcquireWakeLock(u64),
    ReleaseWakeLock,
    AudioParameter(String, String),

    CallbackActiveDeviceChanged(Option<BDAddr>),
    CallbackConnectionStateChanged(BDAddr, ConnectionState),
    CallbackAudioStateChanged(BDAddr, AudioState),
}

#[derive(Debug, Clone, Copy)]
pub struct MockDeviceState {
    pub connection_state: ConnectionState,
    pub audio_state: AudioState,
    pub connecting_timestamp_ms: u64,
}

impl Default for MockDeviceState {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            audio_state: AudioState::Disconnected,
            connecting_timestamp_ms: 0,
        }
    }
}

/// Link and audio state of every mock device, shared between the mock
/// connection handles and the test body.
#[derive(Clone, Default)]
pub struct MockDeviceStates(Arc<Mutex<HashMap<BDAddr, MockDeviceState>>>);

impl MockDeviceStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device: BDAddr) -> MockDeviceState {
        self.0.lock().unwrap().get(&device).copied().unwrap_or_default()
    }

    pub fn set_connection_state(&self, device: BDAddr, state: ConnectionState) {
        self.0.lock().unwrap().entry(device).or_default().connection_state = state;
    }

    pub fn set_audio_state(&self, device: BDAddr, state: AudioState) {
        self.0.lock().unwrap().entry(device).or_default().audio_state = state;
    }

    pub fn set_connecting_timestamp_ms(&self, device: BDAddr, timestamp_ms: u64) {
        self.0.lock().unwrap().entry(device).or_default().connecting_timestamp_ms = timestamp_ms;
    }
}

/// Mock per-device connection handle. Directives are recorded; `connect`
/// moves the shared link state to connecting, `disconnect` and
/// `disconnect_audio` tear the shared state down immediately.
pub struct MockStateMachine {
    device: BDAddr,
    states: MockDeviceStates,
    events: UnboundedSender<MockEvent>,
}

impl MockStateMachine {
    pub fn new(
        device: BDAddr,
        states: MockDeviceStates,
        events: UnboundedSender<MockEvent>,
    ) -> Self {
        Self { device, states, events }
    }
}

impl IHeadsetStateMachine for MockStateMachine {
    fn device(&self) -> BDAddr {
        self.device
    }

    fn connect(&mut self) {
        self.states.set_connection_state(self.device, ConnectionState::Connecting);
        self.events.send(MockEvent::Connect(self.device)).unwrap();
    }

    fn disconnect(&mut self) {
        self.states.set_connection_state(self.device, ConnectionState::Disconnected);
        self.states.set_audio_state(self.device, AudioState::Disconnected);
        self.events.send(MockEvent::Disconnect(self.device)).unwrap();
    }

    fn get_connection_state(&self) -> ConnectionState {
        self.states.get(self.device).connection_state
    }

    fn get_audio_state(&self) -> AudioState {
        self.states.get(self.device).audio_state
    }

    fn get_connecting_timestamp_ms(&self) -> u64 {
        self.states.get(self.device).connecting_timestamp_ms
    }

    fn connect_audio(&mut self) {
        self.states.set_audio_state(self.device, AudioState::Connecting);
        self.events.send(MockEvent::ConnectAudio(self.device)).unwrap();
    }

    fn disconnect_audio(&mut self) {
        self.states.set_audio_state(self.device, AudioState::Disconnected);
        self.events.send(MockEvent::DisconnectAudio(self.device)).unwrap();
    }

    fn set_silence(&mut self, silence: bool) {
        self.events.send(MockEvent::SetSilence(self.device, silence)).unwrap();
    }

    fn voice_recognition_start(&mut self) {
        self.events.send(MockEvent::VoiceRecognitionStart(self.device)).unwrap();
    }

    fn voice_recognition_stop(&mut self) {
        self.events.send(MockEvent::VoiceRecognitionStop(self.device)).unwrap();
    }

    fn voice_recognition_result(&mut self, success: bool) {
        self.events.send(MockEvent::VoiceRecognitionResult(self.device, success)).unwrap();
    }

    fn dialing_out_result(&mut self, success: bool) {
        self.events.send(MockEvent::DialingOutResult(self.device, success)).unwrap();
    }

    fn set_inband_ringing(&mut self, enabled: bool) {
        self.events.send(MockEvent::SetInbandRinging(self.device, enabled)).unwrap();
    }

    fn call_state_changed(&mut self, call_state: &HeadsetCallState) {
        self.events.send(MockEvent::CallStateChanged(self.device, call_state.clone())).unwrap();
    }

    fn device_state_changed(&mut self, device_state: &HeadsetDeviceState) {
        self.events.send(MockEvent::DeviceStateChanged(self.device, *device_state)).unwrap();
    }

    fn clcc_response(&mut self, response: &ClccResponse) {
        self.events.send(MockEvent::ClccResponse(self.device, response.index)).unwrap();
    }
}

pub struct MockStateMachineFactory {
    states: MockDeviceStates,
    events: UnboundedSender<MockEvent>,
}

impl MockStateMachineFactory {
    pub fn new(states: MockDeviceStates, events: UnboundedSender<MockEvent>) -> Self {
        Self { states, events }
    }
}

impl IHeadsetStateMachineFactory for MockStateMachineFactory {
    fn make_state_machine(
        &self,
        device: BDAddr,
        _tx: Sender<Message>,
    ) -> Box<dyn IHeadsetStateMachine + Send> {
        Box::new(MockStateMachine::new(device, self.states.clone(), self.events.clone()))
    }
}

pub struct MockNativeInterface {
    events: UnboundedSender<MockEvent>,
    /// Clone before boxing to flip the result mid-test.
    pub set_active_device_result: Arc<Mutex<bool>>,
}

impl MockNativeInterface {
    pub fn new(events: UnboundedSender<MockEvent>) -> Self {
        Self { events, set_active_device_result: Arc::new(Mutex::new(true)) }
    }
}

impl IHeadsetNativeInterface for MockNativeInterface {
    fn init(&mut self, max_connections: usize, inband_ringing: bool) {
        self.events.send(MockEvent::NativeInit { max_connections, inband_ringing }).unwrap();
    }

    fn set_active_device(&mut self, device: Option<BDAddr>) -> bool {
        self.events.send(MockEvent::NativeSetActiveDevice(device)).unwrap();
        *self.set_active_device_result.lock().unwrap()
    }

    fn set_sco_allowed(&mut self, allowed: bool) {
        self.events.send(MockEvent::NativeSetScoAllowed(allowed)).unwrap();
    }

    fn cleanup(&mut self) {
        self.events.send(MockEvent::NativeCleanup).unwrap();
    }
}

/// Mock telephony and platform facilities with an owned phone state cache.
pub struct MockSystemInterface {
    events: UnboundedSender<MockEvent>,
    phone_state: PhoneState,
    wake_lock_held: bool,
    pub activate_voice_recognition_result: Arc<Mutex<bool>>,
    pub deactivate_voice_recognition_result: Arc<Mutex<bool>>,
    pub dial_outgoing_call_result: Arc<Mutex<bool>>,
}

impl MockSystemInterface {
    pub fn new(tx: Sender<Message>, events: UnboundedSender<MockEvent>) -> Self {
        Self {
            events,
            phone_state: PhoneState::new(tx),
            wake_lock_held: false,
            activate_voice_recognition_result: Arc::new(Mutex::new(true)),
            deactivate_voice_recognition_result: Arc::new(Mutex::new(true)),
            dial_outgoing_call_result: Arc::new(Mutex::new(true)),
        }
    }
}

impl ISystemInterface for MockSystemInterface {
    fn activate_voice_recognition(&mut self) -> bool {
        self.events.send(MockEvent::ActivateVoiceRecognition).unwrap();
        *self.activate_voice_recognition_result.lock().unwrap()
    }

    fn deactivate_voice_recognition(&mut self) -> bool {
        self.events.send(MockEvent::DeactivateVoiceRecognition).unwrap();
        *self.deactivate_voice_recognition_result.lock().unwrap()
    }

    fn dial_outgoing_call(&mut self, number: &str) -> bool {
        self.events.send(MockEvent::DialOutgoingCall(number.into())).unwrap();
        *self.dial_outgoing_call_result.lock().unwrap()
    }

    fn is_call_idle(&self) -> bool {
        self.phone_state.is_call_idle()
    }

    fn is_in_call(&self) -> bool {
        self.phone_state.is_in_call()
    }

    fn is_ringing(&self) -> bool {
        self.phone_state.is_ringing()
    }

    fn acquire_wake_lock(&mut self, timeout_ms: u64) {
        self.wake_lock_held = true;
        self.events.send(MockEvent::AcquireWakeLock(timeout_ms)).unwrap();
    }

    fn release_wake_lock(&mut self) {
        self.wake_lock_held = false;
        self.events.send(MockEvent::ReleaseWakeLock).unwrap();
    }

    fn is_wake_lock_held(&self) -> bool {
        self.wake_lock_held
    }

    fn set_audio_parameter(&mut self, key: &str, value: &str) {
        self.events.send(MockEvent::AudioParameter(key.into(), value.into())).unwrap();
    }

    fn phone_state(&mut self) -> &mut PhoneState {
        &mut self.phone_state
    }
}

/// Mock adapter with shared, test-mutable device records.
#[derive(Clone, Default)]
pub struct MockAdapter {
    pub bonded: Arc<Mutex<Vec<BDAddr>>>,
    pub bond_states: Arc<Mutex<HashMap<BDAddr, BondState>>>,
    pub uuids: Arc<Mutex<HashMap<BDAddr, Vec<Uuid128Bit>>>>,
    pub policies: Arc<Mutex<HashMap<BDAddr, ConnectionPolicy>>>,
    pub quiet_mode: Arc<Mutex<bool>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a bonded device advertising the HFP service.
    pub fn add_bonded_headset(&self, device: BDAddr) {
        self.bonded.lock().unwrap().push(device);
        self.bond_states.lock().unwrap().insert(device, BondState::Bonded);
        self.uuids.lock().unwrap().insert(device, vec![UuidHelper::from_string(HFP).unwrap()]);
    }
}

impl IAdapterInterface for MockAdapter {
    fn get_bonded_devices(&self) -> Vec<BDAddr> {
        self.bonded.lock().unwrap().clone()
    }

    fn get_bond_state(&self, device: BDAddr) -> BondState {
        self.bond_states.lock().unwrap().get(&device).copied().unwrap_or(BondState::NotBonded)
    }

    fn get_remote_uuids(&self, device: BDAddr) -> Vec<Uuid128Bit> {
        self.uuids.lock().unwrap().get(&device).cloned().unwrap_or_default()
    }

    fn is_quiet_mode_enabled(&self) -> bool {
        *self.quiet_mode.lock().unwrap()
    }

    fn get_connection_policy(&self, device: BDAddr) -> ConnectionPolicy {
        self.policies.lock().unwrap().get(&device).copied().unwrap_or(ConnectionPolicy::Unknown)
    }

    fn set_connection_policy(&mut self, device: BDAddr, policy: ConnectionPolicy) -> bool {
        self.policies.lock().unwrap().insert(device, policy);
        true
    }
}

/// Mock observer that records service notifications.
pub struct MockHeadsetCallback {
    id: u32,
    events: UnboundedSender<MockEvent>,
}

impl MockHeadsetCallback {
    pub fn new(id: u32, events: UnboundedSender<MockEvent>) -> Self {
        Self { id, events }
    }
}

impl RPCProxy for MockHeadsetCallback {
    fn register_disconnect(&mut self, _f: Box<dyn Fn(u32) + Send>) -> u32 {
        self.id
    }

    fn unregister(&mut self, _id: u32) -> bool {
        true
    }

    fn get_object_id(&self) -> String {
        format!("mock_headset_callback_{}", self.id)
    }
}

impl IHeadsetCallback for MockHeadsetCallback {
    fn on_active_device_changed(&self, device: Option<BDAddr>) {
        self.events.send(MockEvent::CallbackActiveDeviceChanged(device)).unwrap();
    }

    fn on_connection_state_changed(&self, device: BDAddr, state: ConnectionState) {
        self.events.send(MockEvent::CallbackConnectionStateChanged(device, state)).unwrap();
    }

    fn on_audio_state_changed(&self, device: BDAddr, state: AudioState) {
        self.events.send(MockEvent::CallbackAudioStateChanged(device, state)).unwrap();
    }
}
