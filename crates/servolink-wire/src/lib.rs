//! Wire-level definitions shared by every servolink component.
//!
//! Everything the backend publishes (the rendezvous region, the session
//! descriptor, the sub-blob headers, variable and telemetry definition
//! records, and the datagram action frames) is a fixed little-endian
//! layout. This crate parses those layouts out of *copied* buffers (never
//! straight out of live shared memory) and encodes the frames the client
//! sends. Golden byte layouts are pinned by the tests next to each type.

pub mod actions;
pub mod blocks;
pub mod command;
pub mod core;
pub mod telemetry;
pub mod types;
pub mod variables;

pub use crate::core::{
    versions_compatible, CoreRegion, CoreState, PublicKeyOffer, SecurityMethod, SessionDescriptor,
    SessionShmState, SubBlobRef, CORE_SHM_NAME, CORE_SHM_SIZE, CORE_SHM_VERSION,
    MIN_ENCRYPTED_PACKET_SIZE, MIN_PLAINTEXT_PACKET_SIZE, SESSION_SHM_VERSION, TCP_CORE_VERSION,
    UDP_PROTOCOL_VERSION_MAJOR,
};

pub use crate::actions::{
    ActionFlags, ActionId, ClearEffectAction, EffectOffsetAction, FrameHeader, SampleFormat,
    AAD_SIZE, EFFECT_ENC_HEADER_SIZE, EFFECT_ENC_OFFSET, EFFECT_MAX_SAMPLE_COUNT, FRAME_HEADER_SIZE,
    GCM_IV_SIZE, GCM_TAG_SIZE,
};

pub use crate::blocks::{
    BsonBlockBody, SubBlobId, BSON_BLOCK_BODY_SIZE, DEVICE_INFO_SHM_ID, DEVICE_INFO_SHM_VERSION,
    SIM_DATA_SHM_ID, SIM_DATA_SHM_VERSION, TELEMETRY_DEFINITION_SHM_ID,
    TELEMETRY_DEFINITION_SHM_VERSION, VARIABLE_DATA_SHM_ID, VARIABLE_DATA_SHM_VERSION,
    VARIABLE_HEADER_SHM_ID, VARIABLE_HEADER_SHM_VERSION,
};

pub use crate::command::ResponseCode;
pub use crate::telemetry::{TelemetryDefBlock, TelemetryDefRecord, TelemetryFlags, NO_ALIAS_VARIABLE};
pub use crate::types::{BaseType, TypeVariant, ValueType};
pub use crate::variables::{
    VariableDataBlock, VariableDefBlock, VariableDefRecord, VariableFlags,
};

/// Little-endian field reads out of copied protocol buffers.
///
/// All offsets in this crate are byte offsets from the start of the
/// enclosing structure, so these helpers are the only decoding primitive
/// needed.
pub(crate) mod read {
    pub fn u16_at(buf: &[u8], offset: usize) -> Option<u16> {
        let bytes = buf.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn u32_at(buf: &[u8], offset: usize) -> Option<u32> {
        let bytes = buf.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn i32_at(buf: &[u8], offset: usize) -> Option<i32> {
        Some(u32_at(buf, offset)? as i32)
    }

    pub fn u64_at(buf: &[u8], offset: usize) -> Option<u64> {
        let bytes = buf.get(offset..offset + 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Some(u64::from_le_bytes(raw))
    }

    /// Read a fixed-size, NUL-terminated character field. Rejects fields
    /// whose final byte is not NUL, which the protocol requires so that
    /// names can never run past their buffers.
    pub fn cstr_at(buf: &[u8], offset: usize, len: usize) -> Option<String> {
        let bytes = buf.get(offset..offset + len)?;
        if *bytes.last()? != 0 {
            return None;
        }
        let nul = bytes.iter().position(|&b| b == 0)?;
        String::from_utf8(bytes[..nul].to_vec()).ok()
    }
}
