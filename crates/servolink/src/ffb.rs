//! Feedback effect pipelines.
//!
//! A pipeline is a server-side slot that consumes time-stamped sample sets
//! and drives one feedback actuator. Configuration travels over the command
//! stream; the samples themselves go out as datagram actions, encrypted
//! when the session was registered securely.
//!
//! The device applies samples strictly by timestamp: sets whose time has
//! already passed are discarded, and a later-arriving set overwrites an
//! earlier one where they overlap.

use std::sync::Arc;
use std::time::Duration;

use servolink_wire::actions::{effect_samples_offset, CLEAR_EFFECT_BODY_SIZE};
use servolink_wire::{
    ActionFlags, ActionId, ClearEffectAction, EffectOffsetAction, SampleFormat, AAD_SIZE,
    EFFECT_ENC_OFFSET, EFFECT_MAX_SAMPLE_COUNT, GCM_IV_SIZE, GCM_TAG_SIZE,
};

use crate::action::{ActionBuilder, ActionResult};
use crate::clock::Timestamp;
use crate::command::{CommandError, CommandRequest};
use crate::device_info::DeviceSessionId;
use crate::error::{Error, Result, SessionState};
use crate::session::Session;

/// What an effect offset means physically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetType {
    /// Wheelbase torque offset in newton-meters.
    TorqueNm,
    /// Pedal force offset in newtons.
    ForceN,
    /// Force offset relative to the current pedal force.
    ForceRelative,
    /// Pedal position offset in millimeters.
    PositionMm,
}

impl OffsetType {
    fn as_str(self) -> &'static str {
        match self {
            OffsetType::TorqueNm => "torque",
            OffsetType::ForceN => "force",
            OffsetType::ForceRelative => "force_relative",
            OffsetType::PositionMm => "position",
        }
    }
}

/// Sample interpolation between points of a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    None,
    Linear,
}

impl Interpolation {
    fn as_str(self) -> &'static str {
        match self {
            Interpolation::None => "none",
            Interpolation::Linear => "linear",
        }
    }
}

/// Output filtering applied by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    None,
    LowPass,
    SlewRateLimit,
}

impl Filter {
    fn as_str(self) -> &'static str {
        match self {
            Filter::None => "none",
            Filter::LowPass => "low_pass",
            Filter::SlewRateLimit => "slew_rate_limit",
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub offset_type: OffsetType,
    pub interpolation: Interpolation,
    pub gain: f64,
    pub filter: Filter,
    pub filter_parameter: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            offset_type: OffsetType::TorqueNm,
            interpolation: Interpolation::None,
            gain: 1.0,
            filter: Filter::None,
            filter_parameter: 0.0,
        }
    }
}

/// Build a feedback-effect action into `builder`.
///
/// Encrypts the sample section when the session holds a secure session.
pub fn build_effect_offset_action(
    builder: &mut ActionBuilder,
    device: DeviceSessionId,
    pipeline_idx: u8,
    start_time: Timestamp,
    sample_time: Duration,
    samples: &[f32],
) -> bool {
    if samples.is_empty() || samples.len() > EFFECT_MAX_SAMPLE_COUNT {
        return false;
    }

    let action = EffectOffsetAction {
        pipeline_idx,
        device_session_id: device.0,
        sample_format: SampleFormat::F32,
        sample_count: samples.len() as u16,
        sample_duration: sample_time.as_nanos() as u64,
        start_time: start_time.ticks(),
    };

    let secure = builder.session().secure_session();
    let samples_size = samples.len() * 4;

    if let Some(secure) = secure {
        // Ciphertext length is rounded up to whole AES blocks.
        let padded = samples_size.next_multiple_of(16);
        let body_len = effect_samples_offset() + padded;
        let total = GCM_IV_SIZE + body_len + GCM_TAG_SIZE;

        let mut payload = vec![0u8; total];
        let body_start = GCM_IV_SIZE;
        action.encode_into(&mut payload[body_start..body_start + effect_samples_offset()]);
        let samples_start = body_start + effect_samples_offset();
        for (i, sample) in samples.iter().enumerate() {
            payload[samples_start + 4 * i..samples_start + 4 * i + 4]
                .copy_from_slice(&sample.to_le_bytes());
        }

        let (iv, rest) = payload.split_at_mut(GCM_IV_SIZE);
        let (body, tag) = rest.split_at_mut(body_len);
        let (aad, enc) = body.split_at_mut(AAD_SIZE);
        // The device id and pad bytes between AAD and ciphertext stay in
        // the clear without being authenticated.
        let (_, enc) = enc.split_at_mut(EFFECT_ENC_OFFSET - AAD_SIZE);
        if secure.encrypt(iv, aad, enc, tag).is_err() {
            return false;
        }

        builder.build(
            ActionId::FbEffect,
            &payload,
            ActionFlags(ActionFlags::ENCRYPTED),
        )
    } else {
        let mut payload = vec![0u8; effect_samples_offset() + samples_size];
        action.encode_into(&mut payload);
        let samples_start = effect_samples_offset();
        for (i, sample) in samples.iter().enumerate() {
            payload[samples_start + 4 * i..samples_start + 4 * i + 4]
                .copy_from_slice(&sample.to_le_bytes());
        }
        builder.build(ActionId::FbEffect, &payload, ActionFlags::NONE)
    }
}

/// Build a clear-effect action for one pipeline. Clear actions are never
/// encrypted.
pub fn build_effect_clear_action(
    builder: &mut ActionBuilder,
    device: DeviceSessionId,
    pipeline_idx: u8,
) -> bool {
    let body = ClearEffectAction {
        device_session_id: device.0,
        pipelines: vec![pipeline_idx],
    }
    .encode();
    debug_assert_eq!(body.len(), CLEAR_EFFECT_BODY_SIZE);
    builder.build(ActionId::FbEffectClear, &body, ActionFlags::NONE)
}

/// Handle to one server-side effect pipeline slot.
///
/// Configuration allocates the slot; dropping the handle frees it on the
/// device (asynchronously).
pub struct EffectPipeline {
    builder: ActionBuilder,
    device: DeviceSessionId,
    pipeline_id: i8,
    config: Option<PipelineConfig>,
}

impl EffectPipeline {
    pub fn new(session: Arc<Session>, device: DeviceSessionId) -> EffectPipeline {
        debug_assert!(device.is_device());
        EffectPipeline {
            builder: ActionBuilder::new(session),
            device,
            pipeline_id: -1,
            config: None,
        }
    }

    pub fn device(&self) -> DeviceSessionId {
        self.device
    }

    /// The server-assigned pipeline id, or -1 while unconfigured.
    pub fn pipeline_id(&self) -> i8 {
        self.pipeline_id
    }

    pub fn config(&self) -> Option<&PipelineConfig> {
        self.config.as_ref()
    }

    /// True while the slot is held and the session can drive it.
    pub fn is_active(&self) -> bool {
        self.pipeline_id >= 0
            && self.builder.session().state() == SessionState::ConnectedControl
    }

    /// Configure (or reconfigure) the pipeline, blocking on the backend's
    /// reply. On first success the backend assigns the pipeline id.
    pub fn configure(&mut self, config: &PipelineConfig) -> Result<()> {
        let mut request = CommandRequest::new("ffb", "configure_pipeline")
            .arg("device_session_id", self.device.0 as i32)
            .arg("offset_mode", config.offset_type.as_str())
            .arg("interpolation_mode", config.interpolation.as_str())
            .arg("filter_mode", config.filter.as_str())
            .arg("filter_parameter", config.filter_parameter);
        if self.pipeline_id >= 0 {
            request = request.arg("pipeline_id", self.pipeline_id as i32);
        }

        match self.builder.session().blocking_command(request) {
            Ok(payload) => {
                let id = payload
                    .as_ref()
                    .and_then(|doc| doc.get_i32("pipeline_id").ok())
                    .unwrap_or(-1);
                self.pipeline_id = id as i8;
                self.config = Some(*config);
                Ok(())
            }
            Err(CommandError::Local(e)) => Err(e),
            Err(CommandError::Backend { code, .. }) => Err(Error::from_response_code(code)),
        }
    }

    /// Send one sample set, non-blocking.
    ///
    /// `start_time` is on the session clock; samples whose time has passed
    /// by arrival are dropped by the device.
    pub fn generate_effect(
        &mut self,
        start_time: Timestamp,
        sample_time: Duration,
        samples: &[f32],
    ) -> bool {
        if self.pipeline_id < 0 {
            return false;
        }
        if !build_effect_offset_action(
            &mut self.builder,
            self.device,
            self.pipeline_id as u8,
            start_time,
            sample_time,
            samples,
        ) {
            return false;
        }
        self.builder.send_non_blocking() == ActionResult::Complete
    }

    /// Drop the active sample set but keep the slot configured.
    pub fn stop(&mut self) -> bool {
        if self.pipeline_id < 0 {
            return false;
        }
        if !build_effect_clear_action(&mut self.builder, self.device, self.pipeline_id as u8) {
            return false;
        }
        self.builder.send_non_blocking() == ActionResult::Complete
    }

    /// Free the slot on the device, blocking on the reply.
    pub fn remove(&mut self) -> Result<()> {
        if self.pipeline_id < 0 {
            return Ok(());
        }
        let request = self.free_request();
        match self.builder.session().blocking_simple_command(request) {
            Ok(()) => {
                self.pipeline_id = -1;
                Ok(())
            }
            Err(CommandError::Local(e)) => Err(e),
            Err(CommandError::Backend { code, .. }) => Err(Error::from_response_code(code)),
        }
    }

    fn free_request(&self) -> CommandRequest {
        CommandRequest::new("ffb", "free_pipeline")
            .arg("device_session_id", self.device.0 as i32)
            .arg("pipeline_id", self.pipeline_id as i32)
    }
}

impl Drop for EffectPipeline {
    fn drop(&mut self) {
        if self.is_active() {
            let request = self.free_request();
            self.builder.session().async_command(request, |_| {});
        }
    }
}
