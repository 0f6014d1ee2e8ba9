//! A fabricated backend: shared-memory files in a tempdir plus loopback
//! TCP/UDP endpoints the client can register against.
#![allow(dead_code)]

use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bson::{doc, Document};
use servolink::ApiCore;
use servolink_wire::core::{encode as core_encode, SESSION_KEEP_ALIVE_OFFSET};
use servolink_wire::telemetry::encode as telemetry_encode;
use servolink_wire::variables::encode as variables_encode;
use servolink_wire::{
    blocks, CoreRegion, CoreState, PublicKeyOffer, SessionDescriptor, SessionShmState, SubBlobRef,
    TelemetryDefRecord, VariableDefRecord, CORE_SHM_NAME, CORE_SHM_VERSION,
    DEVICE_INFO_SHM_VERSION, SESSION_SHM_VERSION, SIM_DATA_SHM_VERSION, TCP_CORE_VERSION,
};

pub const SESSION_FILE: &str = "session-1";

pub struct BackendOptions {
    pub session_id: u32,
    pub device_info: Document,
    pub sim_data: Document,
    pub variable_defs: Vec<VariableDefRecord>,
    pub variable_values: Vec<u8>,
    pub telemetry_defs: Vec<TelemetryDefRecord>,
    pub public_key_offers: Vec<PublicKeyOffer>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        BackendOptions {
            session_id: 1,
            device_info: doc! {
                "0": {
                    "logical_id": 3i32,
                    "device_uid": "wb-001",
                    "role": "wheelbase",
                    "is_connected": true,
                },
            },
            sim_data: doc! {
                "active_sim": "rx9",
                "active_session": "race1",
                "sim": { "name": "RX Simulator" },
                "sessions": { "race1": { "track_id": "ring" } },
                "tracks": { "ring": { "name": "The Ring" } },
            },
            variable_defs: Vec::new(),
            variable_values: vec![0u8; 64],
            telemetry_defs: Vec::new(),
            public_key_offers: Vec::new(),
        }
    }
}

pub struct FakeBackend {
    pub dir: tempfile::TempDir,
    pub session_id: u32,
    pub tcp: TcpListener,
    pub udp: UdpSocket,
    session_path: PathBuf,
    core_path: PathBuf,
}

fn doc_bytes(doc: &Document) -> Vec<u8> {
    let mut out = Vec::new();
    doc.to_writer(&mut out).unwrap();
    out
}

fn overwrite(path: &Path, offset: u64, bytes: &[u8]) {
    let mut f = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(bytes).unwrap();
}

impl FakeBackend {
    pub fn new() -> FakeBackend {
        FakeBackend::with_options(BackendOptions::default())
    }

    pub fn with_options(options: BackendOptions) -> FakeBackend {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let dir = tempfile::tempdir().unwrap();
        let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        udp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let blobs: [(&str, u32, u32, Vec<u8>); 5] = [
            (
                "device-info",
                blocks::DEVICE_INFO_SHM_ID,
                DEVICE_INFO_SHM_VERSION,
                blocks::encode::bson_block(
                    DEVICE_INFO_SHM_VERSION,
                    2,
                    &doc_bytes(&options.device_info),
                ),
            ),
            (
                "variable-defs",
                blocks::VARIABLE_HEADER_SHM_ID,
                blocks::VARIABLE_HEADER_SHM_VERSION,
                variables_encode::definitions_block(
                    &options.variable_defs,
                    options.variable_defs.len() as u32,
                ),
            ),
            (
                "variable-data",
                blocks::VARIABLE_DATA_SHM_ID,
                blocks::VARIABLE_DATA_SHM_VERSION,
                variables_encode::data_block(&options.variable_values),
            ),
            (
                "telemetry-defs",
                blocks::TELEMETRY_DEFINITION_SHM_ID,
                blocks::TELEMETRY_DEFINITION_SHM_VERSION,
                telemetry_encode::definitions_block(
                    &options.telemetry_defs,
                    options.telemetry_defs.len() as u32,
                ),
            ),
            (
                "sim-data",
                blocks::SIM_DATA_SHM_ID,
                SIM_DATA_SHM_VERSION,
                blocks::encode::bson_block(SIM_DATA_SHM_VERSION, 2, &doc_bytes(&options.sim_data)),
            ),
        ];

        let mut sub_blobs = Vec::new();
        for (name, id, version, bytes) in &blobs {
            std::fs::write(dir.path().join(name), bytes).unwrap();
            sub_blobs.push(SubBlobRef {
                id: *id,
                version: *version,
                size: bytes.len() as u32,
                path: name.to_string(),
            });
        }

        let descriptor = SessionDescriptor {
            session_version: SESSION_SHM_VERSION,
            session_id: options.session_id,
            state: SessionShmState::Active,
            session_data_size: 0, // filled by the encoder
            manager_process_pid: 4242,
            tcp_protocol_version: TCP_CORE_VERSION,
            tcp_feature_flags: 0,
            tcp_address: [127, 0, 0, 1],
            tcp_port: tcp.local_addr().unwrap().port(),
            tcp_max_packet_size: 0x10000,
            udp_protocol_version: 0,
            udp_address: [127, 0, 0, 1],
            udp_port: udp.local_addr().unwrap().port(),
            udp_max_plaintext_packet_size: 4096,
            udp_max_encrypted_packet_size: 1400,
            sub_blobs,
            public_key_offers: options.public_key_offers,
        };
        let descriptor_bytes = core_encode::session_descriptor(&descriptor, 1);
        let session_path = dir.path().join(SESSION_FILE);
        std::fs::write(&session_path, &descriptor_bytes).unwrap();

        let core = CoreRegion {
            version: CORE_SHM_VERSION,
            revision_counter: 2,
            session_id: options.session_id,
            session_version: SESSION_SHM_VERSION,
            session_shm_size: descriptor_bytes.len() as u32,
            state: CoreState::Active,
            session_shm_path: SESSION_FILE.to_string(),
        };
        let core_path = dir.path().join(CORE_SHM_NAME);
        std::fs::write(&core_path, core_encode::core_region(&core)).unwrap();

        FakeBackend {
            dir,
            session_id: options.session_id,
            tcp,
            udp,
            session_path,
            core_path,
        }
    }

    pub fn api_core(&self) -> ApiCore {
        ApiCore::with_shm_root(self.dir.path().to_path_buf())
    }

    /// Advance the session's keep-alive counter.
    pub fn bump_keep_alive(&self, value: u32) {
        overwrite(
            &self.session_path,
            SESSION_KEEP_ALIVE_OFFSET as u64,
            &value.to_le_bytes(),
        );
    }

    /// Patch raw bytes of the core region (for corruption tests).
    pub fn patch_core(&self, offset: u64, bytes: &[u8]) {
        overwrite(&self.core_path, offset, bytes);
    }

    /// Patch raw bytes of the session descriptor.
    pub fn patch_session(&self, offset: u64, bytes: &[u8]) {
        overwrite(&self.session_path, offset, bytes);
    }

    /// Receive one action datagram (5 s timeout).
    pub fn recv_action_datagram(&self) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let n = self.udp.recv(&mut buf).expect("action datagram");
        buf[..n].to_vec()
    }
}

/// Read one length-prefixed BSON document off a stream.
pub fn read_document(stream: &mut TcpStream) -> Document {
    let mut size_bytes = [0u8; 4];
    stream.read_exact(&mut size_bytes).unwrap();
    let size = i32::from_le_bytes(size_bytes) as usize;
    let mut body = vec![0u8; size];
    body[..4].copy_from_slice(&size_bytes);
    stream.read_exact(&mut body[4..]).unwrap();
    Document::from_reader(&mut &body[..]).unwrap()
}

pub fn write_document(stream: &mut TcpStream, doc: &Document) {
    let bytes = doc_bytes(doc);
    stream.write_all(&bytes).unwrap();
}

/// Accept one registration, reply with `controller_id` and the granted
/// control list, and return the open stream plus the request document.
pub fn serve_register(
    listener: &TcpListener,
    controller_id: i32,
    granted: &[&str],
) -> (TcpStream, Document) {
    let (mut stream, _) = listener.accept().unwrap();
    let request = read_document(&mut stream);

    let control: bson::Array = granted
        .iter()
        .map(|name| bson::Bson::String(name.to_string()))
        .collect();
    let reply = doc! {
        "00type": 1i32,
        "service": "core",
        "result": 0i32,
        "data": { "register": { "controller_id": controller_id, "control": control } },
    };
    write_document(&mut stream, &reply);
    (stream, request)
}

/// Read one command off the stream and answer it through `respond`.
pub fn serve_command(
    stream: &mut TcpStream,
    respond: impl FnOnce(&Document) -> Document,
) -> Document {
    let request = read_document(stream);
    let reply = respond(&request);
    write_document(stream, &reply);
    request
}

/// Build a success reply for the given request, echoing its `user-data`.
pub fn command_reply(request: &Document, command: &str, payload: Document) -> Document {
    doc! {
        "00type": 1i32,
        "result": 0i32,
        "data": { command: payload },
        "user-data": request.get_i32("user-data").unwrap(),
    }
}
