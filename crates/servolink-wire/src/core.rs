//! The rendezvous surface: core region and per-session descriptor.
//!
//! The core region sits at a well-known name and is the only thing a client
//! needs to know in advance. It points at the per-session region, which
//! carries the transport endpoints, packet-size limits, the sub-blob
//! reference table and the backend's public-key offers.

use crate::read;

/// Well-known name of the core shared-memory region.
pub const CORE_SHM_NAME: &str = "$servolink-core$";

/// Fixed size of the core region in bytes.
pub const CORE_SHM_SIZE: usize = 4096;

/// Core region layout version implemented by this crate.
pub const CORE_SHM_VERSION: u32 = 0x0000_0001;

/// Session descriptor layout version implemented by this crate.
pub const SESSION_SHM_VERSION: u32 = 0x0000_0001;

/// Protocol version sent in the TCP register command.
pub const TCP_CORE_VERSION: u32 = 0x0001_0000;

/// Major version of the UDP action protocol.
pub const UDP_PROTOCOL_VERSION_MAJOR: u32 = 0;

/// Documented floor for the descriptor's plaintext UDP packet limit.
pub const MIN_PLAINTEXT_PACKET_SIZE: u16 = 4096;

/// Documented floor for the descriptor's encrypted UDP packet limit.
pub const MIN_ENCRYPTED_PACKET_SIZE: u16 = 1400;

/// Maximum number of public-key offers in a descriptor.
pub const MAX_PUBLIC_KEYS: usize = 8;

/// Versions are compatible when their major halves (high 16 bits) match.
#[inline]
pub fn versions_compatible(known: u32, actual: u32) -> bool {
    (known & 0xffff_0000) == (actual & 0xffff_0000)
}

/// Backend lifecycle state published in the core region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Offline,
    Initializing,
    Active,
    Shutdown,
    Unknown(u32),
}

impl From<u32> for CoreState {
    fn from(raw: u32) -> Self {
        match raw {
            0 => CoreState::Offline,
            1 => CoreState::Initializing,
            2 => CoreState::Active,
            3 => CoreState::Shutdown,
            other => CoreState::Unknown(other),
        }
    }
}

/// Session lifecycle state published in the session descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionShmState {
    Initializing,
    Active,
    Shutdown,
    Unknown(u32),
}

impl From<u32> for SessionShmState {
    fn from(raw: u32) -> Self {
        match raw {
            0 => SessionShmState::Initializing,
            1 => SessionShmState::Active,
            2 => SessionShmState::Shutdown,
            other => SessionShmState::Unknown(other),
        }
    }
}

// Core region byte offsets.
const CORE_VERSION: usize = 0;
const CORE_REVISION_COUNTER: usize = 4;
const CORE_SESSION_ID: usize = 8;
const CORE_SESSION_VERSION: usize = 12;
const CORE_SESSION_SHM_SIZE: usize = 16;
const CORE_STATE: usize = 20;
const CORE_SESSION_SHM_PATH: usize = 24;
const CORE_SESSION_SHM_PATH_LEN: usize = 64;

/// Byte offset of the core region's revision counter.
pub const CORE_REVISION_COUNTER_OFFSET: usize = CORE_REVISION_COUNTER;

/// Byte offset of the core region's active session id.
pub const CORE_SESSION_ID_OFFSET: usize = CORE_SESSION_ID;

/// Minimum number of bytes a core region snapshot must carry.
pub const CORE_REGION_MIN_LEN: usize = CORE_SESSION_SHM_PATH + CORE_SESSION_SHM_PATH_LEN;

/// Decoded core region contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreRegion {
    pub version: u32,
    pub revision_counter: u32,
    pub session_id: u32,
    pub session_version: u32,
    pub session_shm_size: u32,
    pub state: CoreState,
    pub session_shm_path: String,
}

impl CoreRegion {
    /// Decode the core region out of a copied buffer.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        Some(Self {
            version: read::u32_at(buf, CORE_VERSION)?,
            revision_counter: read::u32_at(buf, CORE_REVISION_COUNTER)?,
            session_id: read::u32_at(buf, CORE_SESSION_ID)?,
            session_version: read::u32_at(buf, CORE_SESSION_VERSION)?,
            session_shm_size: read::u32_at(buf, CORE_SESSION_SHM_SIZE)?,
            state: CoreState::from(read::u32_at(buf, CORE_STATE)?),
            session_shm_path: read::cstr_at(buf, CORE_SESSION_SHM_PATH, CORE_SESSION_SHM_PATH_LEN)?,
        })
    }
}

// Session descriptor byte offsets. The u64 process id forces 8-byte struct
// alignment, so there are 4 pad bytes after the volatile head.
const SES_VERSION: usize = 0;
const SES_SESSION_ID: usize = 4;
const SES_STATE: usize = 8;
const SES_KEEP_ALIVE: usize = 12;
const SES_DATA_SIZE: usize = 16;
const SES_MANAGER_PID: usize = 24;
const SES_TCP_PROTOCOL_VERSION: usize = 32;
const SES_TCP_FEATURE_FLAGS: usize = 36;
const SES_TCP_ADDRESS: usize = 40;
const SES_TCP_PORT: usize = 44;
const SES_TCP_MAX_PACKET_SIZE: usize = 48;
const SES_UDP_PROTOCOL_VERSION: usize = 68;
const SES_UDP_ADDRESS: usize = 88;
const SES_UDP_PORT: usize = 92;
const SES_UDP_MAX_PLAINTEXT: usize = 94;
const SES_UDP_MAX_ENCRYPTED: usize = 96;
const SES_SHM_REF_COUNT: usize = 116;
const SES_SHM_REF_SIZE: usize = 118;
const SES_SHM_REF_OFFSET: usize = 120;
const SES_PUBLIC_KEY_OFFSETS: usize = 124;

/// Byte offset of the descriptor's keep-alive counter within the mapped
/// session region. The counter is the only descriptor field that keeps
/// changing during an active session.
pub const SESSION_KEEP_ALIVE_OFFSET: usize = SES_KEEP_ALIVE;

/// Byte offset of the descriptor's `session_data_size` field.
pub const SESSION_DATA_SIZE_OFFSET: usize = SES_DATA_SIZE;

/// Smallest descriptor that can carry all fixed fields.
pub const SESSION_DESCRIPTOR_MIN_LEN: usize = SES_PUBLIC_KEY_OFFSETS + 2 * MAX_PUBLIC_KEYS;

const SUB_BLOB_REF_ID: usize = 0;
const SUB_BLOB_REF_VERSION: usize = 4;
const SUB_BLOB_REF_SIZE: usize = 8;
const SUB_BLOB_REF_PATH: usize = 12;
const SUB_BLOB_REF_PATH_LEN: usize = 64;

/// Minimum size of one sub-blob reference table entry.
pub const SUB_BLOB_REF_LEN: usize = SUB_BLOB_REF_PATH + SUB_BLOB_REF_PATH_LEN;

const PUBLIC_KEY_HEADER_LEN: usize = 10;

/// One entry of the descriptor's sub-blob reference table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBlobRef {
    pub id: u32,
    pub version: u32,
    pub size: u32,
    pub path: String,
}

/// Supported secure-session methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMethod {
    None,
    X25519Aes128Gcm,
    Unknown(u16),
}

impl From<u16> for SecurityMethod {
    fn from(raw: u16) -> Self {
        match raw {
            0 => SecurityMethod::None,
            1 => SecurityMethod::X25519Aes128Gcm,
            other => SecurityMethod::Unknown(other),
        }
    }
}

/// One public-key offer: the backend's key for a security method, signed by
/// the vendor trust anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyOffer {
    pub method: SecurityMethod,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Fully decoded and bounds-checked session descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub session_version: u32,
    pub session_id: u32,
    pub state: SessionShmState,
    pub session_data_size: u32,
    pub manager_process_pid: u64,

    pub tcp_protocol_version: u32,
    pub tcp_feature_flags: u32,
    pub tcp_address: [u8; 4],
    pub tcp_port: u16,
    pub tcp_max_packet_size: u32,

    pub udp_protocol_version: u32,
    pub udp_address: [u8; 4],
    pub udp_port: u16,
    pub udp_max_plaintext_packet_size: u16,
    pub udp_max_encrypted_packet_size: u16,

    pub sub_blobs: Vec<SubBlobRef>,
    pub public_key_offers: Vec<PublicKeyOffer>,
}

/// Reasons a descriptor copy fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorError {
    /// Buffer shorter than the fixed field set or the announced size.
    Truncated,
    /// An offset/size pair points outside the descriptor.
    OutOfBounds,
    /// A path or name field is not NUL-terminated.
    BadString,
}

impl std::fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptorError::Truncated => write!(f, "descriptor truncated"),
            DescriptorError::OutOfBounds => write!(f, "descriptor reference out of bounds"),
            DescriptorError::BadString => write!(f, "descriptor string not NUL-terminated"),
        }
    }
}

impl std::error::Error for DescriptorError {}

impl SessionDescriptor {
    /// Decode a descriptor out of a copied buffer.
    ///
    /// The buffer must already be the `session_data_size`-long copy taken
    /// from the session region; every table offset is validated against it
    /// so nothing here can read past the copy.
    pub fn parse(buf: &[u8]) -> Result<Self, DescriptorError> {
        use DescriptorError::*;

        if buf.len() < SESSION_DESCRIPTOR_MIN_LEN {
            return Err(Truncated);
        }

        let session_data_size = read::u32_at(buf, SES_DATA_SIZE).ok_or(Truncated)?;
        if (session_data_size as usize) > buf.len() {
            return Err(Truncated);
        }
        let data_size = session_data_size as u64;
        let in_bounds =
            |offset: u64, size: u64, count: u64| offset + size.saturating_mul(count) <= data_size;

        let mut tcp_address = [0u8; 4];
        tcp_address.copy_from_slice(&buf[SES_TCP_ADDRESS..SES_TCP_ADDRESS + 4]);
        let mut udp_address = [0u8; 4];
        udp_address.copy_from_slice(&buf[SES_UDP_ADDRESS..SES_UDP_ADDRESS + 4]);

        let ref_count = read::u16_at(buf, SES_SHM_REF_COUNT).ok_or(Truncated)? as u64;
        let ref_size = read::u16_at(buf, SES_SHM_REF_SIZE).ok_or(Truncated)? as u64;
        let ref_offset = read::i32_at(buf, SES_SHM_REF_OFFSET).ok_or(Truncated)?;
        if ref_offset < 0 || ref_size < SUB_BLOB_REF_LEN as u64 {
            return Err(OutOfBounds);
        }
        if !in_bounds(ref_offset as u64, ref_size, ref_count) {
            return Err(OutOfBounds);
        }

        let mut sub_blobs = Vec::with_capacity(ref_count as usize);
        for i in 0..ref_count {
            let base = ref_offset as usize + (ref_size * i) as usize;
            sub_blobs.push(SubBlobRef {
                id: read::u32_at(buf, base + SUB_BLOB_REF_ID).ok_or(Truncated)?,
                version: read::u32_at(buf, base + SUB_BLOB_REF_VERSION).ok_or(Truncated)?,
                size: read::u32_at(buf, base + SUB_BLOB_REF_SIZE).ok_or(Truncated)?,
                path: read::cstr_at(buf, base + SUB_BLOB_REF_PATH, SUB_BLOB_REF_PATH_LEN)
                    .ok_or(BadString)?,
            });
        }

        let mut public_key_offers = Vec::new();
        for i in 0..MAX_PUBLIC_KEYS {
            let hdr_offset = read::u16_at(buf, SES_PUBLIC_KEY_OFFSETS + 2 * i).ok_or(Truncated)?;
            if hdr_offset == 0 {
                continue;
            }
            let hdr_offset = hdr_offset as u64;
            if !in_bounds(hdr_offset, PUBLIC_KEY_HEADER_LEN as u64, 1) {
                return Err(OutOfBounds);
            }
            let base = hdr_offset as usize;
            let method = read::u16_at(buf, base).ok_or(Truncated)?;
            let key_size = read::u16_at(buf, base + 2).ok_or(Truncated)? as u64;
            let key_offset = read::u16_at(buf, base + 4).ok_or(Truncated)? as u64;
            let signature_size = read::u16_at(buf, base + 6).ok_or(Truncated)? as u64;
            let signature_offset = read::u16_at(buf, base + 8).ok_or(Truncated)? as u64;

            // Key and signature offsets are relative to the offer header.
            if !in_bounds(hdr_offset + key_offset, key_size, 1)
                || !in_bounds(hdr_offset + signature_offset, signature_size, 1)
            {
                return Err(OutOfBounds);
            }

            let key_start = (hdr_offset + key_offset) as usize;
            let sig_start = (hdr_offset + signature_offset) as usize;
            public_key_offers.push(PublicKeyOffer {
                method: SecurityMethod::from(method),
                public_key: buf[key_start..key_start + key_size as usize].to_vec(),
                signature: buf[sig_start..sig_start + signature_size as usize].to_vec(),
            });
        }

        Ok(Self {
            session_version: read::u32_at(buf, SES_VERSION).ok_or(Truncated)?,
            session_id: read::u32_at(buf, SES_SESSION_ID).ok_or(Truncated)?,
            state: SessionShmState::from(read::u32_at(buf, SES_STATE).ok_or(Truncated)?),
            session_data_size,
            manager_process_pid: read::u64_at(buf, SES_MANAGER_PID).ok_or(Truncated)?,
            tcp_protocol_version: read::u32_at(buf, SES_TCP_PROTOCOL_VERSION).ok_or(Truncated)?,
            tcp_feature_flags: read::u32_at(buf, SES_TCP_FEATURE_FLAGS).ok_or(Truncated)?,
            tcp_address,
            tcp_port: read::u16_at(buf, SES_TCP_PORT).ok_or(Truncated)?,
            tcp_max_packet_size: read::u32_at(buf, SES_TCP_MAX_PACKET_SIZE).ok_or(Truncated)?,
            udp_protocol_version: read::u32_at(buf, SES_UDP_PROTOCOL_VERSION).ok_or(Truncated)?,
            udp_address,
            udp_port: read::u16_at(buf, SES_UDP_PORT).ok_or(Truncated)?,
            udp_max_plaintext_packet_size: read::u16_at(buf, SES_UDP_MAX_PLAINTEXT)
                .ok_or(Truncated)?,
            udp_max_encrypted_packet_size: read::u16_at(buf, SES_UDP_MAX_ENCRYPTED)
                .ok_or(Truncated)?,
            sub_blobs,
            public_key_offers,
        })
    }

    /// True when the UDP protocol major version and both packet-size floors
    /// are acceptable.
    pub fn limits_valid(&self) -> bool {
        self.udp_protocol_version >> 16 == UDP_PROTOCOL_VERSION_MAJOR
            && self.udp_max_plaintext_packet_size >= MIN_PLAINTEXT_PACKET_SIZE
            && self.udp_max_encrypted_packet_size >= MIN_ENCRYPTED_PACKET_SIZE
    }

    /// Find a sub-blob with the given id and a compatible version.
    pub fn find_sub_blob(&self, id: u32, known_version: u32) -> Option<&SubBlobRef> {
        self.sub_blobs
            .iter()
            .find(|r| r.id == id && versions_compatible(known_version, r.version))
    }
}

/// Builders for the backend-side layouts, used by the test fixtures in this
/// workspace to fabricate a backend.
pub mod encode {
    use super::*;

    fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
        buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_cstr(buf: &mut [u8], offset: usize, len: usize, value: &str) {
        assert!(value.len() < len, "string field overflow");
        buf[offset..offset + value.len()].copy_from_slice(value.as_bytes());
    }

    /// Encode a complete core region image.
    pub fn core_region(r: &CoreRegion) -> Vec<u8> {
        let mut buf = vec![0u8; CORE_SHM_SIZE];
        put_u32(&mut buf, CORE_VERSION, r.version);
        put_u32(&mut buf, CORE_REVISION_COUNTER, r.revision_counter);
        put_u32(&mut buf, CORE_SESSION_ID, r.session_id);
        put_u32(&mut buf, CORE_SESSION_VERSION, r.session_version);
        put_u32(&mut buf, CORE_SESSION_SHM_SIZE, r.session_shm_size);
        let state = match r.state {
            CoreState::Offline => 0,
            CoreState::Initializing => 1,
            CoreState::Active => 2,
            CoreState::Shutdown => 3,
            CoreState::Unknown(v) => v,
        };
        put_u32(&mut buf, CORE_STATE, state);
        put_cstr(
            &mut buf,
            CORE_SESSION_SHM_PATH,
            CORE_SESSION_SHM_PATH_LEN,
            &r.session_shm_path,
        );
        buf
    }

    /// Encode a session descriptor image with its sub-blob table and
    /// public-key offers appended after the fixed fields.
    pub fn session_descriptor(d: &SessionDescriptor, keep_alive_counter: u32) -> Vec<u8> {
        let refs_offset = SESSION_DESCRIPTOR_MIN_LEN.next_multiple_of(8);
        let refs_len = d.sub_blobs.len() * SUB_BLOB_REF_LEN;
        let mut keys_offset = refs_offset + refs_len;

        let mut key_blobs = Vec::new();
        for offer in &d.public_key_offers {
            let total = PUBLIC_KEY_HEADER_LEN + offer.public_key.len() + offer.signature.len();
            key_blobs.push((keys_offset, total));
            keys_offset += total;
        }
        let total_size = keys_offset;

        let mut buf = vec![0u8; total_size];
        put_u32(&mut buf, SES_VERSION, d.session_version);
        put_u32(&mut buf, SES_SESSION_ID, d.session_id);
        let state = match d.state {
            SessionShmState::Initializing => 0,
            SessionShmState::Active => 1,
            SessionShmState::Shutdown => 2,
            SessionShmState::Unknown(v) => v,
        };
        put_u32(&mut buf, SES_STATE, state);
        put_u32(&mut buf, SES_KEEP_ALIVE, keep_alive_counter);
        put_u32(&mut buf, SES_DATA_SIZE, total_size as u32);
        buf[SES_MANAGER_PID..SES_MANAGER_PID + 8]
            .copy_from_slice(&d.manager_process_pid.to_le_bytes());

        put_u32(&mut buf, SES_TCP_PROTOCOL_VERSION, d.tcp_protocol_version);
        put_u32(&mut buf, SES_TCP_FEATURE_FLAGS, d.tcp_feature_flags);
        buf[SES_TCP_ADDRESS..SES_TCP_ADDRESS + 4].copy_from_slice(&d.tcp_address);
        put_u16(&mut buf, SES_TCP_PORT, d.tcp_port);
        put_u32(&mut buf, SES_TCP_MAX_PACKET_SIZE, d.tcp_max_packet_size);

        put_u32(&mut buf, SES_UDP_PROTOCOL_VERSION, d.udp_protocol_version);
        buf[SES_UDP_ADDRESS..SES_UDP_ADDRESS + 4].copy_from_slice(&d.udp_address);
        put_u16(&mut buf, SES_UDP_PORT, d.udp_port);
        put_u16(&mut buf, SES_UDP_MAX_PLAINTEXT, d.udp_max_plaintext_packet_size);
        put_u16(&mut buf, SES_UDP_MAX_ENCRYPTED, d.udp_max_encrypted_packet_size);

        put_u16(&mut buf, SES_SHM_REF_COUNT, d.sub_blobs.len() as u16);
        put_u16(&mut buf, SES_SHM_REF_SIZE, SUB_BLOB_REF_LEN as u16);
        put_u32(&mut buf, SES_SHM_REF_OFFSET, refs_offset as u32);

        for (i, blob) in d.sub_blobs.iter().enumerate() {
            let base = refs_offset + i * SUB_BLOB_REF_LEN;
            put_u32(&mut buf, base + SUB_BLOB_REF_ID, blob.id);
            put_u32(&mut buf, base + SUB_BLOB_REF_VERSION, blob.version);
            put_u32(&mut buf, base + SUB_BLOB_REF_SIZE, blob.size);
            put_cstr(&mut buf, base + SUB_BLOB_REF_PATH, SUB_BLOB_REF_PATH_LEN, &blob.path);
        }

        for (i, offer) in d.public_key_offers.iter().enumerate() {
            let (base, _) = key_blobs[i];
            put_u16(&mut buf, SES_PUBLIC_KEY_OFFSETS + 2 * i, base as u16);
            let method = match offer.method {
                SecurityMethod::None => 0,
                SecurityMethod::X25519Aes128Gcm => 1,
                SecurityMethod::Unknown(v) => v,
            };
            put_u16(&mut buf, base, method);
            put_u16(&mut buf, base + 2, offer.public_key.len() as u16);
            put_u16(&mut buf, base + 4, PUBLIC_KEY_HEADER_LEN as u16);
            put_u16(&mut buf, base + 6, offer.signature.len() as u16);
            put_u16(
                &mut buf,
                base + 8,
                (PUBLIC_KEY_HEADER_LEN + offer.public_key.len()) as u16,
            );
            let key_start = base + PUBLIC_KEY_HEADER_LEN;
            buf[key_start..key_start + offer.public_key.len()].copy_from_slice(&offer.public_key);
            let sig_start = key_start + offer.public_key.len();
            buf[sig_start..sig_start + offer.signature.len()].copy_from_slice(&offer.signature);
        }

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_descriptor() -> SessionDescriptor {
        SessionDescriptor {
            session_version: SESSION_SHM_VERSION,
            session_id: 77,
            state: SessionShmState::Active,
            session_data_size: 0, // filled by encode
            manager_process_pid: 4242,
            tcp_protocol_version: TCP_CORE_VERSION,
            tcp_feature_flags: 0,
            tcp_address: [127, 0, 0, 1],
            tcp_port: 43111,
            tcp_max_packet_size: 0x10000,
            udp_protocol_version: UDP_PROTOCOL_VERSION_MAJOR << 16,
            udp_address: [127, 0, 0, 1],
            udp_port: 43112,
            udp_max_plaintext_packet_size: 4096,
            udp_max_encrypted_packet_size: 1400,
            sub_blobs: vec![SubBlobRef {
                id: 0x1234_5678,
                version: 0x0000_0001,
                size: 4096,
                path: "blob-a".to_string(),
            }],
            public_key_offers: vec![PublicKeyOffer {
                method: SecurityMethod::X25519Aes128Gcm,
                public_key: vec![0x11; 32],
                signature: vec![0x22; 64],
            }],
        }
    }

    #[test]
    fn core_region_roundtrips() {
        let region = CoreRegion {
            version: CORE_SHM_VERSION,
            revision_counter: 2,
            session_id: 9,
            session_version: SESSION_SHM_VERSION,
            session_shm_size: 2048,
            state: CoreState::Active,
            session_shm_path: "session-9".to_string(),
        };
        let bytes = encode::core_region(&region);
        assert_eq!(bytes.len(), CORE_SHM_SIZE);
        assert_eq!(CoreRegion::parse(&bytes).unwrap(), region);
    }

    #[test]
    fn descriptor_roundtrips_with_blobs_and_offers() {
        let descriptor = sample_descriptor();
        let bytes = encode::session_descriptor(&descriptor, 10);
        let parsed = SessionDescriptor::parse(&bytes).unwrap();

        assert_eq!(parsed.session_id, 77);
        assert_eq!(parsed.state, SessionShmState::Active);
        assert_eq!(parsed.tcp_port, 43111);
        assert_eq!(parsed.udp_port, 43112);
        assert_eq!(parsed.sub_blobs, descriptor.sub_blobs);
        assert_eq!(parsed.public_key_offers, descriptor.public_key_offers);
        assert!(parsed.limits_valid());
        assert!(parsed
            .find_sub_blob(0x1234_5678, 0x0000_0005)
            .is_some());
        assert!(parsed.find_sub_blob(0x1234_5678, 0x0001_0000).is_none());
    }

    #[test]
    fn keep_alive_field_sits_at_published_offset() {
        let bytes = encode::session_descriptor(&sample_descriptor(), 0xdead_beef);
        assert_eq!(
            crate::read::u32_at(&bytes, SESSION_KEEP_ALIVE_OFFSET).unwrap(),
            0xdead_beef
        );
    }

    #[test]
    fn descriptor_rejects_out_of_bounds_reference_table() {
        let mut bytes = encode::session_descriptor(&sample_descriptor(), 0);
        // Push the reference table past the announced descriptor size.
        let huge = (bytes.len() as u32) + 1;
        bytes[SES_SHM_REF_OFFSET..SES_SHM_REF_OFFSET + 4].copy_from_slice(&huge.to_le_bytes());
        assert_eq!(
            SessionDescriptor::parse(&bytes).unwrap_err(),
            DescriptorError::OutOfBounds
        );
    }

    #[test]
    fn descriptor_rejects_out_of_bounds_key_offer() {
        let mut bytes = encode::session_descriptor(&sample_descriptor(), 0);
        // Point the first offer header at the end of the descriptor.
        let bad = (bytes.len() - 2) as u16;
        bytes[SES_PUBLIC_KEY_OFFSETS..SES_PUBLIC_KEY_OFFSETS + 2]
            .copy_from_slice(&bad.to_le_bytes());
        assert_eq!(
            SessionDescriptor::parse(&bytes).unwrap_err(),
            DescriptorError::OutOfBounds
        );
    }

    #[test]
    fn descriptor_rejects_truncated_copy() {
        let bytes = encode::session_descriptor(&sample_descriptor(), 0);
        assert_eq!(
            SessionDescriptor::parse(&bytes[..SESSION_DESCRIPTOR_MIN_LEN - 1]).unwrap_err(),
            DescriptorError::Truncated
        );
    }

    #[test]
    fn limits_floors_are_enforced() {
        let mut d = sample_descriptor();
        d.udp_max_plaintext_packet_size = MIN_PLAINTEXT_PACKET_SIZE - 1;
        let bytes = encode::session_descriptor(&d, 0);
        assert!(!SessionDescriptor::parse(&bytes).unwrap().limits_valid());

        let mut d = sample_descriptor();
        d.udp_protocol_version = 0x0001_0000;
        let bytes = encode::session_descriptor(&d, 0);
        assert!(!SessionDescriptor::parse(&bytes).unwrap().limits_valid());
    }
}
