//! Client runtime for the servolink force-feedback / telemetry backend.
//!
//! Simulators and tools use this crate to talk to the co-resident backend
//! that owns the physical devices. The attachment is a shared-memory
//! rendezvous; after that, three traffic classes flow:
//!
//! - bulk, slowly changing state read out of shared memory (device info,
//!   variables, telemetry definitions, simulator data),
//! - request/reply commands over a reliable stream,
//! - tight-deadline actions (feedback samples, telemetry pushes) over a
//!   loopback datagram socket, optionally authenticated-encrypted.
//!
//! The usual shape of an application:
//!
//! ```no_run
//! use servolink::{control_flags, Api, ApiUserInformation, Event};
//!
//! let api = Api::new();
//! let events = api.create_event_queue();
//! api.enable_control(
//!     control_flags::FFB_EFFECTS | control_flags::TELEMETRY,
//!     "example3",
//!     ApiUserInformation {
//!         display_name: "Example".to_string(),
//!         ..Default::default()
//!     },
//! );
//!
//! while let Some(event) = events.pop() {
//!     if let Event::SessionStateChanged { state, .. } = event {
//!         println!("session is now {state}");
//!     }
//! }
//! ```
//!
//! For manual control of the run loop, use [`ApiCore::open_session`] and
//! drive [`Session::poll`] or [`Session::run_until_state_changes`]
//! yourself.

pub use bson;

mod action;
mod api;
mod bson_check;
mod clock;
mod command;
mod device_info;
mod error;
mod events;
mod ffb;
mod provider;
mod rendezvous;
mod secure;
mod session;
mod sim_data;
mod telemetry;
mod variables;

pub use action::{ActionBuilder, ActionResult, ActionStatusCell};
pub use api::{Api, ApiListener, ListenerId};
pub use clock::{now, ticks, Timestamp, TIMESTAMP_FREQUENCY_HZ};
pub use command::{CommandError, CommandRequest, CommandResult};
pub use device_info::{
    Control, ControlType, DeviceInfo, DeviceRole, DeviceSessionId, Feedback, FeedbackType,
    FullInfo, HidAxisInput, HidButtonInput, Input, InputMapping, InputRole, InputType,
    UsbDeviceInfo, VariableRef,
};
pub use error::{Error, Result, SessionState};
pub use events::{Event, EventProducer, EventQueue};
pub use ffb::{
    build_effect_clear_action, build_effect_offset_action, EffectPipeline, Filter, Interpolation,
    OffsetType, PipelineConfig,
};
pub use provider::UpdateOutcome;
pub use rendezvous::{ApiCore, SHM_DIR_ENV};
pub use secure::{
    derive_symmetric_key, try_key_exchange, try_key_exchange_with_anchor, SecureSession,
    SecureSessionOptions, SecureSessionParameters, TRUST_ANCHOR_PUBLIC_KEY,
};
pub use session::{
    control_flags, ApiUserInformation, PeriodicTimerHandle, Session, CORE_VERSION_MAJOR,
    CORE_VERSION_MINOR, CORE_VERSION_PATCH,
};
pub use sim_data::{Participant, Section, Sim, SimData, SimSession, Tire, Track, Vehicle};
pub use telemetry::{
    Telemetry, TelemetryCell, TelemetryDefinition, TelemetryDefinitions, TelemetryScalar,
    TelemetryUpdateGroup,
};
pub use variables::{Variable, VariableDefinitions};

// The wire-level vocabulary types shared with the protocol crate.
pub use servolink_wire::{
    ActionFlags, ActionId, BaseType, PublicKeyOffer, ResponseCode, SampleFormat, SecurityMethod,
    SessionDescriptor, SubBlobRef, TelemetryFlags, TypeVariant, ValueType, VariableFlags,
};
