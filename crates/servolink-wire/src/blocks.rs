//! Sub-blob identities and the BSON-bodied block layout.
//!
//! Every sub-blob referenced from the session descriptor starts with the
//! common 12-byte block header (see `servolink-shm`); the typed body
//! follows. Device info and sim data carry one large BSON document located
//! by `{data_offset, data_size}`.

use crate::read;

pub const DEVICE_INFO_SHM_ID: u32 = 0x8976_5893;
pub const DEVICE_INFO_SHM_VERSION: u32 = 0x0000_0001;

pub const SIM_DATA_SHM_ID: u32 = 0x896f_43a2;
pub const SIM_DATA_SHM_VERSION: u32 = 0x0000_0001;

pub const VARIABLE_HEADER_SHM_ID: u32 = 0x8553_2367;
pub const VARIABLE_HEADER_SHM_VERSION: u32 = 0x0000_0001;

pub const VARIABLE_DATA_SHM_ID: u32 = 0x8578_2367;
pub const VARIABLE_DATA_SHM_VERSION: u32 = 0x0000_0001;

pub const TELEMETRY_DEFINITION_SHM_ID: u32 = 0x78d3_8efb;
pub const TELEMETRY_DEFINITION_SHM_VERSION: u32 = 0x0000_0001;

/// Identity of one required sub-blob, paired with the layout version this
/// client implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubBlobId {
    pub id: u32,
    pub version: u32,
}

impl SubBlobId {
    pub const DEVICE_INFO: SubBlobId = SubBlobId {
        id: DEVICE_INFO_SHM_ID,
        version: DEVICE_INFO_SHM_VERSION,
    };
    pub const VARIABLE_HEADER: SubBlobId = SubBlobId {
        id: VARIABLE_HEADER_SHM_ID,
        version: VARIABLE_HEADER_SHM_VERSION,
    };
    pub const VARIABLE_DATA: SubBlobId = SubBlobId {
        id: VARIABLE_DATA_SHM_ID,
        version: VARIABLE_DATA_SHM_VERSION,
    };
    pub const TELEMETRY_DEFINITIONS: SubBlobId = SubBlobId {
        id: TELEMETRY_DEFINITION_SHM_ID,
        version: TELEMETRY_DEFINITION_SHM_VERSION,
    };
    pub const SIM_DATA: SubBlobId = SubBlobId {
        id: SIM_DATA_SHM_ID,
        version: SIM_DATA_SHM_VERSION,
    };

    /// The blobs every session must publish, in rendezvous order.
    pub const REQUIRED: [SubBlobId; 5] = [
        SubBlobId::DEVICE_INFO,
        SubBlobId::VARIABLE_HEADER,
        SubBlobId::VARIABLE_DATA,
        SubBlobId::TELEMETRY_DEFINITIONS,
        SubBlobId::SIM_DATA,
    ];
}

// Body offsets are relative to the start of the block (header included).
const BSON_DATA_OFFSET: usize = 12;
const BSON_DATA_SIZE: usize = 16;
const BSON_FLAGS: usize = 20;

/// Size of the BSON block body fields (after the common header).
pub const BSON_BLOCK_BODY_SIZE: usize = 12;

/// Body of a BSON-carrying block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BsonBlockBody {
    pub data_offset: u32,
    pub data_size: u32,
    pub flags: u32,
}

impl BsonBlockBody {
    /// Decode the body fields from the start of a block image.
    pub fn parse(block: &[u8]) -> Option<Self> {
        Some(Self {
            data_offset: read::u32_at(block, BSON_DATA_OFFSET)?,
            data_size: read::u32_at(block, BSON_DATA_SIZE)?,
            flags: read::u32_at(block, BSON_FLAGS)?,
        })
    }

    /// Resolve `(offset, len)` of the BSON document within a block of
    /// `announced_size` bytes, or `None` when it does not fit.
    pub fn payload_bounds(&self, announced_size: u32) -> Option<(usize, usize)> {
        let end = u64::from(self.data_offset) + u64::from(self.data_size);
        if end > u64::from(announced_size) {
            return None;
        }
        Some((self.data_offset as usize, self.data_size as usize))
    }
}

/// Encoders for fabricating backend-side block images in tests.
pub mod encode {
    use super::*;

    /// Build a complete BSON block image: header, body fields and document.
    pub fn bson_block(version: u32, revision: u32, doc: &[u8]) -> Vec<u8> {
        let data_offset = (12 + BSON_BLOCK_BODY_SIZE) as u32;
        let total = data_offset as usize + doc.len();
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&version.to_le_bytes());
        buf.extend_from_slice(&revision.to_le_bytes());
        buf.extend_from_slice(&(total as u32).to_le_bytes());
        buf.extend_from_slice(&data_offset.to_le_bytes());
        buf.extend_from_slice(&(doc.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // flags
        buf.extend_from_slice(doc);
        buf
    }
}
