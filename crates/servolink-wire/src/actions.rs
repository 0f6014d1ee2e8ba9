//! Datagram action framing.
//!
//! A datagram carries one or more frames. Each frame starts with the 8-byte
//! [`FrameHeader`]; encrypted frames insert a 12-byte IV after the header
//! and append a 12-byte GCM tag at the end.
//!
//! The feedback-effect body keeps the original C layout, including the two
//! alignment pad bytes between the device id and the encrypted section:
//!
//! ```text
//! offset  size  field
//!      0    16  AAD   { pipeline_idx:u8, flags:u8, 14 reserved bytes }
//!     16     2  device_session_id:u16      (not encrypted, not in AAD)
//!     18     2  pad
//!     20    16  enc   { sample_format:u8, sample_duration_high:u8,
//!                       sample_count_minus_1:u16, sample_duration:u32,
//!                       start_time_low:u32, start_time_high:u32 }
//!     36     …  samples
//! ```
//!
//! Only the `enc` section and the samples are encrypted; the AAD section is
//! authenticated but sent in the clear.

use crate::read;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// IV length for encrypted frames.
pub const GCM_IV_SIZE: usize = 12;

/// Truncated GCM tag length for encrypted frames.
pub const GCM_TAG_SIZE: usize = 12;

/// Size of the authenticated-but-clear prefix of an effect body.
pub const AAD_SIZE: usize = 16;

/// Offset of the encrypted section within an effect body.
pub const EFFECT_ENC_OFFSET: usize = 20;

/// Size of the encrypted effect header (before the samples).
pub const EFFECT_ENC_HEADER_SIZE: usize = 16;

/// Upper bound on samples per effect action.
pub const EFFECT_MAX_SAMPLE_COUNT: usize = 256;

/// Action identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionId {
    FbEffect,
    FbEffectClear,
    RegisterTelemetryGroup,
    SetTelemetryGroup,
    /// Reserved legacy/test id.
    TempApEffects,
    /// Reserved legacy/test id.
    TempTelemetryData,
    Unknown(u16),
}

impl ActionId {
    pub fn raw(self) -> u16 {
        match self {
            ActionId::FbEffect => 0x0001,
            ActionId::FbEffectClear => 0x0002,
            ActionId::RegisterTelemetryGroup => 0x1000,
            ActionId::SetTelemetryGroup => 0x1001,
            ActionId::TempApEffects => 0x000a,
            ActionId::TempTelemetryData => 0x001d,
            ActionId::Unknown(raw) => raw,
        }
    }

    pub fn from_raw(raw: u16) -> ActionId {
        match raw {
            0x0001 => ActionId::FbEffect,
            0x0002 => ActionId::FbEffectClear,
            0x1000 => ActionId::RegisterTelemetryGroup,
            0x1001 => ActionId::SetTelemetryGroup,
            0x000a => ActionId::TempApEffects,
            0x001d => ActionId::TempTelemetryData,
            other => ActionId::Unknown(other),
        }
    }
}

/// Per-frame flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionFlags(pub u16);

impl ActionFlags {
    pub const NONE: ActionFlags = ActionFlags(0);
    /// Body is AES-128-GCM encrypted; frame carries IV and tag.
    pub const ENCRYPTED: u16 = 1 << 0;

    pub fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }
}

/// The 8-byte frame header.
///
/// `size` covers the whole frame: header, IV/tag when encrypted, and body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub controller_id: u16,
    pub flags: ActionFlags,
    pub action_id: ActionId,
    pub size: u16,
}

impl FrameHeader {
    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.controller_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.flags.0.to_le_bytes());
        out[4..6].copy_from_slice(&self.action_id.raw().to_le_bytes());
        out[6..8].copy_from_slice(&self.size.to_le_bytes());
    }

    pub fn parse(buf: &[u8]) -> Option<FrameHeader> {
        Some(FrameHeader {
            controller_id: read::u16_at(buf, 0)?,
            flags: ActionFlags(read::u16_at(buf, 2)?),
            action_id: ActionId::from_raw(read::u16_at(buf, 4)?),
            size: read::u16_at(buf, 6)?,
        })
    }
}

/// Sample encodings for effect offsets.
///
/// The device scales I16 samples as −1.0…1.0 and U16 samples as 0…1.0, so
/// the pipeline gain matters with the integer formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
    I16,
    U16,
}

impl SampleFormat {
    pub fn raw(self) -> u8 {
        match self {
            SampleFormat::F32 => 0,
            SampleFormat::I16 => 1,
            SampleFormat::U16 => 2,
        }
    }

    pub fn from_raw(raw: u8) -> Option<SampleFormat> {
        match raw {
            0 => Some(SampleFormat::F32),
            1 => Some(SampleFormat::I16),
            2 => Some(SampleFormat::U16),
            _ => None,
        }
    }

    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::I16 | SampleFormat::U16 => 2,
        }
    }
}

/// Header fields of a feedback-effect action.
///
/// The samples themselves are appended separately because their encoding
/// depends on [`SampleFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectOffsetAction {
    pub pipeline_idx: u8,
    pub device_session_id: u16,
    pub sample_format: SampleFormat,
    /// Number of samples; must be within `1..=EFFECT_MAX_SAMPLE_COUNT`.
    pub sample_count: u16,
    /// Ticks between samples.
    pub sample_duration: u64,
    /// Timestamp at which the first sample applies.
    pub start_time: u64,
}

impl EffectOffsetAction {
    /// Encode the plaintext body (AAD through effect header) into `out`,
    /// which must be at least `EFFECT_ENC_OFFSET + EFFECT_ENC_HEADER_SIZE`
    /// bytes. Samples follow at [`effect_samples_offset`].
    pub fn encode_into(&self, out: &mut [u8]) {
        debug_assert!(self.sample_count >= 1);
        debug_assert!(self.sample_count as usize <= EFFECT_MAX_SAMPLE_COUNT);

        out[..EFFECT_ENC_OFFSET + EFFECT_ENC_HEADER_SIZE].fill(0);
        out[0] = self.pipeline_idx;
        // out[1] = aad flags (none defined)
        out[16..18].copy_from_slice(&self.device_session_id.to_le_bytes());

        let enc = &mut out[EFFECT_ENC_OFFSET..];
        enc[0] = self.sample_format.raw();
        enc[1] = ((self.sample_duration >> 32) & 0xff) as u8;
        enc[2..4].copy_from_slice(&(self.sample_count - 1).to_le_bytes());
        enc[4..8].copy_from_slice(&((self.sample_duration & 0xffff_ffff) as u32).to_le_bytes());
        enc[8..12].copy_from_slice(&((self.start_time & 0xffff_ffff) as u32).to_le_bytes());
        enc[12..16].copy_from_slice(&((self.start_time >> 32) as u32).to_le_bytes());
    }

    /// Decode the body fields back out of a plaintext effect body.
    pub fn parse(body: &[u8]) -> Option<EffectOffsetAction> {
        if body.len() < EFFECT_ENC_OFFSET + EFFECT_ENC_HEADER_SIZE {
            return None;
        }
        let enc = &body[EFFECT_ENC_OFFSET..];
        let sample_duration_high = enc[1] as u64;
        let sample_duration_low = read::u32_at(enc, 4)? as u64;
        let start_low = read::u32_at(enc, 8)? as u64;
        let start_high = read::u32_at(enc, 12)? as u64;
        Some(EffectOffsetAction {
            pipeline_idx: body[0],
            device_session_id: read::u16_at(body, 16)?,
            sample_format: SampleFormat::from_raw(enc[0])?,
            sample_count: read::u16_at(enc, 2)? + 1,
            sample_duration: (sample_duration_high << 32) | sample_duration_low,
            start_time: (start_high << 32) | start_low,
        })
    }
}

/// Byte offset of the first sample within an effect body.
pub const fn effect_samples_offset() -> usize {
    EFFECT_ENC_OFFSET + EFFECT_ENC_HEADER_SIZE
}

/// A clear-effect action body: drops the active sample sets of up to 31
/// pipelines on one device while keeping their slots configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearEffectAction {
    pub device_session_id: u16,
    pub pipelines: Vec<u8>,
}

/// Size of a clear-effect body.
pub const CLEAR_EFFECT_BODY_SIZE: usize = EFFECT_ENC_OFFSET + 32;

impl ClearEffectAction {
    pub fn encode(&self) -> Vec<u8> {
        assert!(self.pipelines.len() <= 31, "too many pipelines to clear");
        let mut out = vec![0u8; CLEAR_EFFECT_BODY_SIZE];
        out[16..18].copy_from_slice(&self.device_session_id.to_le_bytes());
        out[EFFECT_ENC_OFFSET] = self.pipelines.len() as u8;
        out[EFFECT_ENC_OFFSET + 1..EFFECT_ENC_OFFSET + 1 + self.pipelines.len()]
            .copy_from_slice(&self.pipelines);
        out
    }

    pub fn parse(body: &[u8]) -> Option<ClearEffectAction> {
        if body.len() < CLEAR_EFFECT_BODY_SIZE {
            return None;
        }
        let count = body[EFFECT_ENC_OFFSET] as usize;
        if count > 31 {
            return None;
        }
        Some(ClearEffectAction {
            device_session_id: read::u16_at(body, 16)?,
            pipelines: body[EFFECT_ENC_OFFSET + 1..EFFECT_ENC_OFFSET + 1 + count].to_vec(),
        })
    }
}
