//! Telemetry definition block layout.

use crate::read;
use crate::types::ValueType;

/// Marker for a telemetry definition with no aliased variable.
pub const NO_ALIAS_VARIABLE: u32 = 0xffff_ffff;

/// Flags carried by a telemetry definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryFlags(pub u16);

impl TelemetryFlags {
    /// Potentially feeds feedback effects; update with minimal latency.
    pub const USED_FOR_EFFECTS: u16 = 1 << 0;
    /// Feeds dashes and LEDs; a lower update rate is acceptable.
    pub const USED_FOR_DISPLAY: u16 = 1 << 1;
    /// Kept for backwards compatibility only.
    pub const DEPRECATED: u16 = 1 << 2;

    pub fn contains(self, flag: u16) -> bool {
        self.0 & flag != 0
    }
}

// Telemetry definitions block body (after the 12-byte common header).
const DEFS_DEFINITION_OFFSET: usize = 12;
const DEFS_DEFINITION_DATA_SIZE: usize = 16;
const DEFS_DEFINITION_COUNT: usize = 20;

/// Byte offset of the definition count within the definitions block.
pub const TELEMETRY_DEF_COUNT_OFFSET: usize = DEFS_DEFINITION_COUNT;

/// Body of the telemetry definitions block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryDefBlock {
    pub definition_offset: u32,
    pub definition_data_size: u32,
    pub definition_count: u32,
}

impl TelemetryDefBlock {
    pub fn parse(block: &[u8]) -> Option<Self> {
        Some(Self {
            definition_offset: read::u32_at(block, DEFS_DEFINITION_OFFSET)?,
            definition_data_size: read::u32_at(block, DEFS_DEFINITION_DATA_SIZE)?,
            definition_count: read::u32_at(block, DEFS_DEFINITION_COUNT)?,
        })
    }
}

const DEF_ID: usize = 0;
const DEF_FLAGS: usize = 2;
const DEF_TYPE: usize = 4;
const DEF_TYPE_VARIANT_DATA: usize = 6;
const DEF_ALIAS_VARIABLE_IDX: usize = 8;
const DEF_NAME: usize = 12;
const DEF_NAME_LEN: usize = 36;

/// On-wire size of one telemetry definition record.
pub const TELEMETRY_DEF_RECORD_SIZE: usize = DEF_NAME + DEF_NAME_LEN;

/// One telemetry definition record.
///
/// Ids are unique within a session but may change across sessions; the name
/// is the stable handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryDefRecord {
    pub id: u16,
    pub flags: TelemetryFlags,
    pub value_type: ValueType,
    pub alias_variable_idx: u32,
    pub name: String,
}

impl TelemetryDefRecord {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        Some(Self {
            id: read::u16_at(buf, DEF_ID)?,
            flags: TelemetryFlags(read::u16_at(buf, DEF_FLAGS)?),
            value_type: ValueType::from_raw(
                read::u16_at(buf, DEF_TYPE)?,
                read::u16_at(buf, DEF_TYPE_VARIANT_DATA)?,
            ),
            alias_variable_idx: read::u32_at(buf, DEF_ALIAS_VARIABLE_IDX)?,
            name: read::cstr_at(buf, DEF_NAME, DEF_NAME_LEN)?,
        })
    }

    /// Encode one record (test fixtures).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; TELEMETRY_DEF_RECORD_SIZE];
        buf[DEF_ID..DEF_ID + 2].copy_from_slice(&self.id.to_le_bytes());
        buf[DEF_FLAGS..DEF_FLAGS + 2].copy_from_slice(&self.flags.0.to_le_bytes());
        buf[DEF_TYPE..DEF_TYPE + 2].copy_from_slice(&self.value_type.raw().to_le_bytes());
        buf[DEF_TYPE_VARIANT_DATA..DEF_TYPE_VARIANT_DATA + 2]
            .copy_from_slice(&self.value_type.variant_data().to_le_bytes());
        buf[DEF_ALIAS_VARIABLE_IDX..DEF_ALIAS_VARIABLE_IDX + 4]
            .copy_from_slice(&self.alias_variable_idx.to_le_bytes());
        assert!(self.name.len() < DEF_NAME_LEN, "telemetry name too long");
        buf[DEF_NAME..DEF_NAME + self.name.len()].copy_from_slice(self.name.as_bytes());
        buf
    }
}

/// Encoders for fabricating backend-side block images in tests.
pub mod encode {
    use super::*;

    /// Byte offset where definition records start in an encoded block.
    pub const DEFINITIONS_OFFSET: usize = 32;

    /// Build a telemetry definitions block holding `records`, publishing
    /// `published_count` of them.
    pub fn definitions_block(records: &[TelemetryDefRecord], published_count: u32) -> Vec<u8> {
        let total = DEFINITIONS_OFFSET + records.len() * TELEMETRY_DEF_RECORD_SIZE;
        let mut buf = vec![0u8; total];
        buf[0..4].copy_from_slice(&1u32.to_le_bytes()); // version
        buf[4..8].copy_from_slice(&2u32.to_le_bytes()); // revision counter
        buf[8..12].copy_from_slice(&(total as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&(DEFINITIONS_OFFSET as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&(TELEMETRY_DEF_RECORD_SIZE as u32).to_le_bytes());
        buf[20..24].copy_from_slice(&published_count.to_le_bytes());
        for (i, record) in records.iter().enumerate() {
            let at = DEFINITIONS_OFFSET + i * TELEMETRY_DEF_RECORD_SIZE;
            buf[at..at + TELEMETRY_DEF_RECORD_SIZE].copy_from_slice(&record.encode());
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BaseType;

    #[test]
    fn definition_record_roundtrips() {
        let record = TelemetryDefRecord {
            id: 12,
            flags: TelemetryFlags(TelemetryFlags::USED_FOR_DISPLAY),
            value_type: ValueType::scalar(BaseType::F32),
            alias_variable_idx: NO_ALIAS_VARIABLE,
            name: "engine_rpm".to_string(),
        };
        let bytes = record.encode();
        assert_eq!(bytes.len(), TELEMETRY_DEF_RECORD_SIZE);
        assert_eq!(TelemetryDefRecord::parse(&bytes).unwrap(), record);
    }
}
