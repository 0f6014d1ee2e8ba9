//! Variable definition and data block layouts.

use crate::read;
use crate::types::ValueType;

/// Flags carried by a variable definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableFlags(pub u32);

impl VariableFlags {
    /// Guaranteed to stay supported in future backend releases.
    pub const STABLE: u32 = 1 << 0;
    /// Constant while the device stays connected.
    pub const DEVICE_CONSTANT: u32 = 1 << 2;
    /// Constant until the backend restarts.
    pub const SESSION_CONSTANT: u32 = 1 << 3;

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

// Variable definitions block body (after the 12-byte common header).
const DEFS_DEFINITION_OFFSET: usize = 12;
const DEFS_DEFINITION_DATA_SIZE: usize = 16;
const DEFS_DEFINITION_COUNT: usize = 20;

/// Byte offset of the definition count within the definitions block.
pub const VARIABLE_DEF_COUNT_OFFSET: usize = DEFS_DEFINITION_COUNT;

/// Body of the variable definitions block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableDefBlock {
    pub definition_offset: u32,
    pub definition_data_size: u32,
    pub definition_count: u32,
}

impl VariableDefBlock {
    pub fn parse(block: &[u8]) -> Option<Self> {
        Some(Self {
            definition_offset: read::u32_at(block, DEFS_DEFINITION_OFFSET)?,
            definition_data_size: read::u32_at(block, DEFS_DEFINITION_DATA_SIZE)?,
            definition_count: read::u32_at(block, DEFS_DEFINITION_COUNT)?,
        })
    }
}

// Variable data block body.
const DATA_VAR_DATA_OFFSET: usize = 12;
const DATA_VAR_DATA_SIZE: usize = 16;

/// Body of the variable data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableDataBlock {
    pub var_data_offset: u32,
    pub var_data_size: u32,
}

impl VariableDataBlock {
    pub fn parse(block: &[u8]) -> Option<Self> {
        Some(Self {
            var_data_offset: read::u32_at(block, DATA_VAR_DATA_OFFSET)?,
            var_data_size: read::u32_at(block, DATA_VAR_DATA_SIZE)?,
        })
    }
}

const DEF_FLAGS: usize = 0;
const DEF_TYPE: usize = 4;
const DEF_TYPE_VARIANT_DATA: usize = 6;
const DEF_VALUE_OFFSET: usize = 8;
const DEF_DEVICE_SESSION_ID: usize = 12;
const DEF_NAME: usize = 14;
const DEF_NAME_LEN: usize = 50;

/// On-wire size of one variable definition record.
pub const VARIABLE_DEF_RECORD_SIZE: usize = DEF_NAME + DEF_NAME_LEN;

/// One variable definition record.
///
/// `value_offset` points into the variable *data* block; the definition set
/// is append-only within a session and previously published records never
/// change (the validity flag excepted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDefRecord {
    pub flags: VariableFlags,
    pub value_type: ValueType,
    pub value_offset: u32,
    pub device_session_id: u16,
    pub name: String,
}

impl VariableDefRecord {
    /// Decode one record; `buf` must start at the record.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        Some(Self {
            flags: VariableFlags(read::u32_at(buf, DEF_FLAGS)?),
            value_type: ValueType::from_raw(
                read::u16_at(buf, DEF_TYPE)?,
                read::u16_at(buf, DEF_TYPE_VARIANT_DATA)?,
            ),
            value_offset: read::u32_at(buf, DEF_VALUE_OFFSET)?,
            device_session_id: read::u16_at(buf, DEF_DEVICE_SESSION_ID)?,
            name: read::cstr_at(buf, DEF_NAME, DEF_NAME_LEN)?,
        })
    }

    /// Encode one record (test fixtures).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; VARIABLE_DEF_RECORD_SIZE];
        buf[DEF_FLAGS..DEF_FLAGS + 4].copy_from_slice(&self.flags.0.to_le_bytes());
        buf[DEF_TYPE..DEF_TYPE + 2].copy_from_slice(&self.value_type.raw().to_le_bytes());
        buf[DEF_TYPE_VARIANT_DATA..DEF_TYPE_VARIANT_DATA + 2]
            .copy_from_slice(&self.value_type.variant_data().to_le_bytes());
        buf[DEF_VALUE_OFFSET..DEF_VALUE_OFFSET + 4]
            .copy_from_slice(&self.value_offset.to_le_bytes());
        buf[DEF_DEVICE_SESSION_ID..DEF_DEVICE_SESSION_ID + 2]
            .copy_from_slice(&self.device_session_id.to_le_bytes());
        assert!(self.name.len() < DEF_NAME_LEN, "variable name too long");
        buf[DEF_NAME..DEF_NAME + self.name.len()].copy_from_slice(self.name.as_bytes());
        buf
    }
}

/// Encoders for fabricating backend-side block images in tests.
pub mod encode {
    use super::*;

    /// Byte offset where definition records start in an encoded block.
    pub const DEFINITIONS_OFFSET: usize = 32;

    /// Byte offset where the value area starts in an encoded data block.
    pub const DATA_OFFSET: usize = 24;

    /// Build a variable definitions block holding `records`, publishing
    /// `published_count` of them.
    pub fn definitions_block(records: &[VariableDefRecord], published_count: u32) -> Vec<u8> {
        let total = DEFINITIONS_OFFSET + records.len() * VARIABLE_DEF_RECORD_SIZE;
        let mut buf = vec![0u8; total];
        buf[0..4].copy_from_slice(&1u32.to_le_bytes()); // version
        buf[4..8].copy_from_slice(&2u32.to_le_bytes()); // revision counter
        buf[8..12].copy_from_slice(&(total as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&(DEFINITIONS_OFFSET as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&(VARIABLE_DEF_RECORD_SIZE as u32).to_le_bytes());
        buf[20..24].copy_from_slice(&published_count.to_le_bytes());
        for (i, record) in records.iter().enumerate() {
            let at = DEFINITIONS_OFFSET + i * VARIABLE_DEF_RECORD_SIZE;
            buf[at..at + VARIABLE_DEF_RECORD_SIZE].copy_from_slice(&record.encode());
        }
        buf
    }

    /// Build a variable data block whose value area holds `values`.
    pub fn data_block(values: &[u8]) -> Vec<u8> {
        let total = DATA_OFFSET + values.len();
        let mut buf = vec![0u8; total];
        buf[0..4].copy_from_slice(&1u32.to_le_bytes());
        buf[4..8].copy_from_slice(&2u32.to_le_bytes());
        buf[8..12].copy_from_slice(&(total as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&(DATA_OFFSET as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&(values.len() as u32).to_le_bytes());
        buf[DATA_OFFSET..].copy_from_slice(values);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BaseType;

    #[test]
    fn definition_record_roundtrips() {
        let record = VariableDefRecord {
            flags: VariableFlags(VariableFlags::STABLE),
            value_type: ValueType::scalar(BaseType::F32),
            value_offset: 128,
            device_session_id: 3,
            name: "steering_angle".to_string(),
        };
        let bytes = record.encode();
        assert_eq!(bytes.len(), VARIABLE_DEF_RECORD_SIZE);
        assert_eq!(VariableDefRecord::parse(&bytes).unwrap(), record);
    }

    #[test]
    fn record_without_nul_terminator_is_rejected() {
        let record = VariableDefRecord {
            flags: VariableFlags(0),
            value_type: ValueType::scalar(BaseType::U8),
            value_offset: 0,
            device_session_id: 0,
            name: "x".to_string(),
        };
        let mut bytes = record.encode();
        for b in &mut bytes[DEF_NAME..] {
            *b = b'a';
        }
        assert_eq!(VariableDefRecord::parse(&bytes), None);
    }
}
