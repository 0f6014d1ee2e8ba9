//! Parsed device information.
//!
//! The backend publishes one BSON document describing every logical device
//! it manages. [`FullInfo`] owns the parsed devices together with the raw
//! snapshot bytes; handing out `Arc<FullInfo>` keeps the whole set alive
//! for as long as any consumer looks at a single device.

use std::sync::Arc;

use bson::{Bson, Document};
use parking_lot::Mutex;
use servolink_shm::ShmView;
use servolink_wire::DEVICE_INFO_SHM_VERSION;

use crate::provider::{BsonBlockProvider, UpdateOutcome};

/// Session-scoped device identifier. `0` means "no device" and scopes a
/// variable or telemetry to the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceSessionId(pub u16);

impl DeviceSessionId {
    pub const NONE: DeviceSessionId = DeviceSessionId(0);

    pub fn is_device(self) -> bool {
        self.0 != 0
    }
}

/// Intended use of a whole device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRole {
    Wheel,
    Wheelbase,
    ThrottlePedal,
    BrakePedal,
    Handbrake,
    ClutchPedal,
    GearStick,
    ButtonBox,
    Hub,
    Unknown,
    Other(String),
}

impl DeviceRole {
    fn from_str(s: &str) -> DeviceRole {
        match s {
            "wheel" => DeviceRole::Wheel,
            "wheelbase" => DeviceRole::Wheelbase,
            "throttle_pedal" => DeviceRole::ThrottlePedal,
            "brake_pedal" => DeviceRole::BrakePedal,
            "handbrake" => DeviceRole::Handbrake,
            "clutch_pedal" => DeviceRole::ClutchPedal,
            "gear_stick" => DeviceRole::GearStick,
            "button_box" => DeviceRole::ButtonBox,
            "hub" => DeviceRole::Hub,
            "unknown" => DeviceRole::Unknown,
            other => DeviceRole::Other(other.to_string()),
        }
    }
}

/// Physical control types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlType {
    Wheelbase,
    Wheel,
    Pedal,
    Paddle,
    HatSwitch,
    Button,
    ToggleSwitch,
    Dir2Way,
    Dir4Way,
    RotEnc,
    FunkySwitch,
    Light,
    Unknown,
    Other(String),
}

impl ControlType {
    fn from_str(s: &str) -> ControlType {
        match s {
            "wheelbase" => ControlType::Wheelbase,
            "wheel" => ControlType::Wheel,
            "pedal" => ControlType::Pedal,
            "paddle" => ControlType::Paddle,
            "hat_switch" => ControlType::HatSwitch,
            "button" => ControlType::Button,
            "toggle_switch" => ControlType::ToggleSwitch,
            "dir_2way" => ControlType::Dir2Way,
            "dir_4way" => ControlType::Dir4Way,
            "rot_enc" => ControlType::RotEnc,
            "funky_switch" => ControlType::FunkySwitch,
            "light" => ControlType::Light,
            "unknown" => ControlType::Unknown,
            other => ControlType::Other(other.to_string()),
        }
    }
}

/// How the simulator can act on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackType {
    DirectInput,
    Wheelbase,
    ActivePedal,
    RgbLight,
    Light,
    Unknown,
    Other(String),
}

impl FeedbackType {
    fn from_str(s: &str) -> FeedbackType {
        match s {
            "direct_input" => FeedbackType::DirectInput,
            "wheelbase" => FeedbackType::Wheelbase,
            "active_pedal" => FeedbackType::ActivePedal,
            "rgb_light" => FeedbackType::RgbLight,
            "light" => FeedbackType::Light,
            "unknown" => FeedbackType::Unknown,
            other => FeedbackType::Other(other.to_string()),
        }
    }
}

/// Intended mapping of an input source to a game control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRole {
    Steering,
    Throttle,
    Brake,
    Clutch,
    GearShift,
    GearShiftUp,
    GearShiftDown,
    Handbrake,
    Ignition,
    Starter,
    PitLimiter,
    Drs,
    Horn,
    Unknown,
    Other(String),
}

impl InputRole {
    fn from_str(s: &str) -> InputRole {
        match s {
            "steering" => InputRole::Steering,
            "throttle" => InputRole::Throttle,
            "brake" => InputRole::Brake,
            "clutch" => InputRole::Clutch,
            "gear_shift" => InputRole::GearShift,
            "gear_shift_up" => InputRole::GearShiftUp,
            "gear_shift_down" => InputRole::GearShiftDown,
            "handbrake" => InputRole::Handbrake,
            "ignition" => InputRole::Ignition,
            "starter" => InputRole::Starter,
            "pit_limiter" => InputRole::PitLimiter,
            "drs" => InputRole::Drs,
            "horn" => InputRole::Horn,
            "unknown" => InputRole::Unknown,
            other => InputRole::Other(other.to_string()),
        }
    }
}

/// Physical form of an input source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputType {
    Axis,
    Button,
    IncRotEnc,
    AbsRotEnc,
    Unknown,
    Other(String),
}

impl InputType {
    fn from_str(s: &str) -> InputType {
        match s {
            "axis" => InputType::Axis,
            "button" => InputType::Button,
            "inc_rot_enc" => InputType::IncRotEnc,
            "abs_rot_enc" => InputType::AbsRotEnc,
            "unknown" => InputType::Unknown,
            other => InputType::Other(other.to_string()),
        }
    }
}

/// USB identity of a device, when it is a USB HID device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsbDeviceInfo {
    pub vid: i32,
    pub pid: i32,
    pub hid_device_path: String,
}

/// One physical control of a device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Control {
    pub id: String,
    pub name: String,
    pub control_type: Option<ControlType>,
    /// Id of the control this one is mounted on, if any.
    pub parent_id: String,
}

/// A variable reference used by inputs; may point at another device's
/// variable with the `"<device>:<name>"` form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VariableRef {
    pub name: String,
    pub device_session_id: DeviceSessionId,
}

/// One input source of a device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Input {
    pub id: String,
    pub variable: VariableRef,
    pub role: Option<InputRole>,
    pub input_type: Option<InputType>,
    /// Id of the control this input belongs to.
    pub control: String,
}

/// One feedback surface of a device.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Feedback {
    pub id: String,
    pub control: String,
    pub feedback_type: Option<FeedbackType>,
    /// Feedback-type specific parameters, kept as the raw document.
    pub parameters: Option<Document>,
}

/// Mapping from a HID input index to a device input.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InputMapping {
    pub input_id: String,
    pub device_session_id: DeviceSessionId,
}

/// One HID axis published by the backend's virtual game device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HidAxisInput {
    pub role: Option<InputRole>,
    pub mappings: Vec<InputMapping>,
    pub range_low: i32,
    pub range_high: i32,
}

/// One HID button published by the backend's virtual game device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HidButtonInput {
    pub role: Option<InputRole>,
    pub mappings: Vec<InputMapping>,
}

/// Everything known about one logical device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    uid: String,
    session_id: DeviceSessionId,
    role: DeviceRole,
    connected: bool,
    usb_info: Option<UsbDeviceInfo>,
    controls: Vec<Control>,
    inputs: Vec<Input>,
    feedbacks: Vec<Feedback>,
    hid_axes: Vec<HidAxisInput>,
    hid_buttons: Vec<HidButtonInput>,
}

impl DeviceInfo {
    /// Stable unique id of the device across sessions.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Id of the device within this session only.
    pub fn session_id(&self) -> DeviceSessionId {
        self.session_id
    }

    pub fn role(&self) -> &DeviceRole {
        &self.role
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn usb_info(&self) -> Option<&UsbDeviceInfo> {
        self.usb_info.as_ref()
    }

    pub fn controls(&self) -> &[Control] {
        &self.controls
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    pub fn feedbacks(&self) -> &[Feedback] {
        &self.feedbacks
    }

    pub fn hid_axes(&self) -> &[HidAxisInput] {
        &self.hid_axes
    }

    pub fn hid_buttons(&self) -> &[HidButtonInput] {
        &self.hid_buttons
    }

    pub fn control(&self, id: &str) -> Option<&Control> {
        self.controls.iter().find(|c| c.id == id)
    }

    pub fn input(&self, id: &str) -> Option<&Input> {
        self.inputs.iter().find(|i| i.id == id)
    }

    pub fn feedback(&self, id: &str) -> Option<&Feedback> {
        self.feedbacks.iter().find(|f| f.id == id)
    }

    pub fn has_feedback_type(&self, feedback_type: &FeedbackType) -> bool {
        self.feedbacks
            .iter()
            .any(|f| f.feedback_type.as_ref() == Some(feedback_type))
    }

    fn parse(doc: &Document) -> Option<DeviceInfo> {
        let session_id = doc.get_i32("logical_id").ok()?;
        let uid = doc.get_str("device_uid").ok()?.to_string();
        let session_id = DeviceSessionId(session_id as u16);

        let mut info = DeviceInfo {
            uid,
            session_id,
            role: DeviceRole::Unknown,
            connected: false,
            usb_info: None,
            controls: Vec::new(),
            inputs: Vec::new(),
            feedbacks: Vec::new(),
            hid_axes: Vec::new(),
            hid_buttons: Vec::new(),
        };

        let mut usb = UsbDeviceInfo::default();
        for (key, value) in doc {
            match (key.as_str(), value) {
                ("role", Bson::String(s)) => info.role = DeviceRole::from_str(s),
                ("is_connected", Bson::Boolean(b)) => info.connected = *b,
                ("usb_path", Bson::String(s)) => usb.hid_device_path = s.clone(),
                ("usb_vid", Bson::Int32(v)) => usb.vid = *v,
                ("usb_pid", Bson::Int32(v)) => usb.pid = *v,
                ("control", Bson::Document(d)) => info.controls = parse_controls(d),
                ("input", Bson::Document(d)) => info.inputs = parse_inputs(d, session_id),
                ("feedback", Bson::Document(d)) => info.feedbacks = parse_feedbacks(d),
                ("hid_input", Bson::Document(d)) => {
                    (info.hid_axes, info.hid_buttons) = parse_hid_inputs(d)
                }
                _ => {}
            }
        }
        if !usb.hid_device_path.is_empty() {
            info.usb_info = Some(usb);
        }
        Some(info)
    }
}

fn parse_controls(doc: &Document) -> Vec<Control> {
    let mut controls = Vec::new();
    for (id, value) in doc {
        let Bson::Document(body) = value else { continue };
        let mut control = Control {
            id: id.clone(),
            ..Control::default()
        };
        for (key, value) in body {
            if let Bson::String(s) = value {
                match key.as_str() {
                    "name" => control.name = s.clone(),
                    "role" => control.control_type = Some(ControlType::from_str(s)),
                    "parent" => control.parent_id = s.clone(),
                    _ => {}
                }
            }
        }
        controls.push(control);
    }
    controls
}

fn parse_variable_ref(raw: &str, this_device: DeviceSessionId) -> VariableRef {
    // A "<device>:<name>" reference targets another device's variable.
    if let Some((device, name)) = raw.split_once(':') {
        if let Ok(id) = device.parse::<u16>() {
            return VariableRef {
                name: name.to_string(),
                device_session_id: DeviceSessionId(id),
            };
        }
    }
    VariableRef {
        name: raw.to_string(),
        device_session_id: this_device,
    }
}

fn parse_inputs(doc: &Document, this_device: DeviceSessionId) -> Vec<Input> {
    let mut inputs = Vec::new();
    for (id, value) in doc {
        let Bson::Document(body) = value else { continue };
        let mut input = Input {
            id: id.clone(),
            variable: VariableRef {
                name: String::new(),
                device_session_id: this_device,
            },
            ..Input::default()
        };
        for (key, value) in body {
            if let Bson::String(s) = value {
                match key.as_str() {
                    "variable" => input.variable = parse_variable_ref(s, this_device),
                    "role" => input.role = Some(InputRole::from_str(s)),
                    "type" => input.input_type = Some(InputType::from_str(s)),
                    "control" => input.control = s.clone(),
                    _ => {}
                }
            }
        }
        inputs.push(input);
    }
    inputs
}

fn parse_feedbacks(doc: &Document) -> Vec<Feedback> {
    let mut feedbacks = Vec::new();
    for (id, value) in doc {
        let Bson::Document(body) = value else { continue };
        let mut feedback = Feedback {
            id: id.clone(),
            ..Feedback::default()
        };
        for (key, value) in body {
            match (key.as_str(), value) {
                ("control", Bson::String(s)) => feedback.control = s.clone(),
                ("type", Bson::String(s)) => {
                    feedback.feedback_type = Some(FeedbackType::from_str(s))
                }
                (_, Bson::Document(d)) => feedback.parameters = Some(d.clone()),
                _ => {}
            }
        }
        feedbacks.push(feedback);
    }
    feedbacks
}

fn parse_mappings(items: &bson::Array) -> Vec<InputMapping> {
    let mut mappings = Vec::new();
    for item in items {
        let Bson::Document(body) = item else { continue };
        let mut mapping = InputMapping::default();
        for (key, value) in body {
            match value {
                Bson::String(s) if key == "input" => mapping.input_id = s.clone(),
                Bson::Int32(v) => mapping.device_session_id = DeviceSessionId(*v as u16),
                _ => {}
            }
        }
        mappings.push(mapping);
    }
    mappings
}

fn parse_hid_inputs(doc: &Document) -> (Vec<HidAxisInput>, Vec<HidButtonInput>) {
    let mut axes = Vec::new();
    let mut buttons = Vec::new();

    if let Ok(items) = doc.get_array("axis") {
        for item in items {
            let Bson::Document(body) = item else { continue };
            let mut axis = HidAxisInput::default();
            for (key, value) in body {
                match (key.as_str(), value) {
                    ("role", Bson::String(s)) => axis.role = Some(InputRole::from_str(s)),
                    ("mappings", Bson::Array(a)) => axis.mappings = parse_mappings(a),
                    ("range", Bson::Array(a)) => {
                        if let [Bson::Int32(low), Bson::Int32(high)] = a.as_slice() {
                            axis.range_low = *low;
                            axis.range_high = *high;
                        }
                    }
                    _ => {}
                }
            }
            axes.push(axis);
        }
    }

    if let Ok(items) = doc.get_array("buttons") {
        for item in items {
            let Bson::Document(body) = item else { continue };
            let mut button = HidButtonInput::default();
            for (key, value) in body {
                match (key.as_str(), value) {
                    ("role", Bson::String(s)) => button.role = Some(InputRole::from_str(s)),
                    ("mappings", Bson::Array(a)) => button.mappings = parse_mappings(a),
                    _ => {}
                }
            }
            buttons.push(button);
        }
    }

    (axes, buttons)
}

/// The full parsed device set of one snapshot.
pub struct FullInfo {
    devices: Vec<DeviceInfo>,
    revision: u32,
    /// The raw snapshot the devices were parsed from.
    raw_bson: Arc<[u8]>,
}

impl FullInfo {
    fn parse(raw_bson: Arc<[u8]>, revision: u32) -> FullInfo {
        let mut devices = Vec::new();
        if let Ok(doc) = Document::from_reader(&mut raw_bson.as_ref()) {
            for (_, value) in &doc {
                if let Bson::Document(device_doc) = value {
                    if let Some(device) = DeviceInfo::parse(device_doc) {
                        devices.push(device);
                    }
                }
            }
        }
        FullInfo {
            devices,
            revision,
            raw_bson,
        }
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn raw_bson(&self) -> &[u8] {
        &self.raw_bson
    }

    pub fn by_uid(&self, uid: &str) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.uid == uid)
    }

    pub fn by_session_id(&self, id: DeviceSessionId) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.session_id == id)
    }

    pub fn by_hid_device_path(&self, path: &str) -> Option<&DeviceInfo> {
        self.devices
            .iter()
            .find(|d| d.usb_info.as_ref().is_some_and(|u| u.hid_device_path == path))
    }

    pub fn find_first(&self, filter: impl Fn(&DeviceInfo) -> bool) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| filter(d))
    }

    pub fn find_all(&self, filter: impl Fn(&DeviceInfo) -> bool) -> Vec<&DeviceInfo> {
        self.devices.iter().filter(|d| filter(d)).collect()
    }
}

/// Device info block provider with a lazy parse cache.
pub(crate) struct DeviceInfoProvider {
    block: BsonBlockProvider,
    parsed: Mutex<Option<Arc<FullInfo>>>,
}

impl DeviceInfoProvider {
    pub fn new(view: ShmView) -> Self {
        Self {
            block: BsonBlockProvider::new(view, DEVICE_INFO_SHM_VERSION),
            parsed: Mutex::new(None),
        }
    }

    pub fn update(&self) -> UpdateOutcome {
        self.block.update()
    }

    /// Parse (or reuse) the current snapshot.
    pub fn full_info(&self) -> Option<Arc<FullInfo>> {
        let (raw, revision) = self.block.raw()?;
        {
            let parsed = self.parsed.lock();
            if let Some(info) = parsed.as_ref() {
                if info.revision == revision {
                    return Some(Arc::clone(info));
                }
            }
        }

        let info = Arc::new(FullInfo::parse(raw, revision));
        *self.parsed.lock() = Some(Arc::clone(&info));
        Some(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn device_doc() -> Document {
        doc! {
            "0": {
                "logical_id": 3i32,
                "device_uid": "wb-001",
                "role": "wheelbase",
                "is_connected": true,
                "usb_path": "/dev/hidraw2",
                "usb_vid": 0x16d0i32,
                "usb_pid": 0x0d5ai32,
                "control": {
                    "base": { "name": "Base", "role": "wheelbase" },
                    "rim": { "name": "Rim", "role": "wheel", "parent": "base" },
                },
                "input": {
                    "steer": { "variable": "steering_angle", "role": "steering",
                               "type": "axis", "control": "base" },
                    "remote": { "variable": "4:brake_pressure", "role": "brake",
                                "type": "axis", "control": "base" },
                },
                "feedback": {
                    "ffb": { "control": "base", "type": "wheelbase",
                             "params": { "max_torque_nm": 25i32 } },
                },
                "hid_input": {
                    "axis": [
                        { "role": "steering", "range": [-32768i32, 32767i32],
                          "mappings": [ { "input": "steer", "dev": 3i32 } ] },
                    ],
                    "buttons": [
                        { "role": "horn", "mappings": [] },
                    ],
                },
            },
            "1": {
                "logical_id": 4i32,
                "device_uid": "pedal-002",
                "role": "brake_pedal",
                "is_connected": false,
            },
        }
    }

    fn parse_full(doc: &Document) -> FullInfo {
        let mut bytes = Vec::new();
        doc.to_writer(&mut bytes).unwrap();
        FullInfo::parse(Arc::from(bytes.into_boxed_slice()), 2)
    }

    #[test]
    fn parses_device_set() {
        let info = parse_full(&device_doc());
        assert_eq!(info.devices().len(), 2);

        let wheelbase = info.by_uid("wb-001").unwrap();
        assert_eq!(wheelbase.session_id(), DeviceSessionId(3));
        assert_eq!(*wheelbase.role(), DeviceRole::Wheelbase);
        assert!(wheelbase.is_connected());
        assert_eq!(wheelbase.usb_info().unwrap().vid, 0x16d0);
        assert_eq!(wheelbase.controls().len(), 2);
        assert_eq!(wheelbase.control("rim").unwrap().parent_id, "base");
        assert!(wheelbase.has_feedback_type(&FeedbackType::Wheelbase));
        assert!(wheelbase
            .feedback("ffb")
            .unwrap()
            .parameters
            .as_ref()
            .unwrap()
            .contains_key("max_torque_nm"));

        let pedal = info.by_session_id(DeviceSessionId(4)).unwrap();
        assert_eq!(pedal.uid(), "pedal-002");
        assert!(!pedal.is_connected());
        assert!(pedal.usb_info().is_none());
    }

    #[test]
    fn input_variable_references_resolve_device_scope() {
        let info = parse_full(&device_doc());
        let wheelbase = info.by_uid("wb-001").unwrap();

        let local = wheelbase.input("steer").unwrap();
        assert_eq!(local.variable.name, "steering_angle");
        assert_eq!(local.variable.device_session_id, DeviceSessionId(3));

        let remote = wheelbase.input("remote").unwrap();
        assert_eq!(remote.variable.name, "brake_pressure");
        assert_eq!(remote.variable.device_session_id, DeviceSessionId(4));
    }

    #[test]
    fn hid_inputs_carry_ranges_and_mappings() {
        let info = parse_full(&device_doc());
        let wheelbase = info.by_uid("wb-001").unwrap();

        let axis = &wheelbase.hid_axes()[0];
        assert_eq!(axis.role, Some(InputRole::Steering));
        assert_eq!((axis.range_low, axis.range_high), (-32768, 32767));
        assert_eq!(axis.mappings[0].input_id, "steer");
        assert_eq!(axis.mappings[0].device_session_id, DeviceSessionId(3));

        assert_eq!(wheelbase.hid_buttons()[0].role, Some(InputRole::Horn));
    }

    #[test]
    fn devices_missing_identity_are_skipped() {
        let info = parse_full(&doc! {
            "0": { "device_uid": "no-logical-id" },
            "1": { "logical_id": 7i32, "device_uid": "ok" },
        });
        assert_eq!(info.devices().len(), 1);
        assert_eq!(info.devices()[0].uid(), "ok");
    }

    #[test]
    fn filters_find_devices() {
        let info = parse_full(&device_doc());
        assert_eq!(
            info.find_first(|d| !d.is_connected()).unwrap().uid(),
            "pedal-002"
        );
        assert_eq!(info.find_all(|d| d.session_id().is_device()).len(), 2);
        assert!(info.by_hid_device_path("/dev/hidraw2").is_some());
    }
}
