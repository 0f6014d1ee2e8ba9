//! Rendezvous against a fabricated backend.

mod support;

use std::time::{Duration, Instant};

use servolink::{ApiCore, Error, Event, SessionState};
use support::{BackendOptions, FakeBackend};

#[test]
fn cold_rendezvous_reaches_connected_monitor() {
    let backend = FakeBackend::new();
    let api = backend.api_core();
    let events = api.create_event_queue();

    let session = api.open_session().expect("open session");
    assert_eq!(session.state(), SessionState::ConnectedMonitor);
    assert_eq!(session.session_id(), backend.session_id);
    assert_eq!(session.controller_id(), 0);

    match events.try_pop_for(Duration::from_secs(1)) {
        Some(Event::SessionStateChanged {
            state,
            controller_id,
            control_flags,
            ..
        }) => {
            assert_eq!(state, SessionState::ConnectedMonitor);
            assert_eq!(controller_id, 0);
            assert_eq!(control_flags, 0);
        }
        other => panic!("expected SessionStateChanged, got {other:?}"),
    }
}

#[test]
fn descriptor_limits_and_endpoints_are_published() {
    let backend = FakeBackend::new();
    let session = backend.api_core().open_session().unwrap();

    let descriptor = session.descriptor();
    assert_eq!(descriptor.udp_max_plaintext_packet_size, 4096);
    assert_eq!(descriptor.udp_max_encrypted_packet_size, 1400);
    assert_eq!(descriptor.tcp_address, [127, 0, 0, 1]);
    assert_eq!(descriptor.sub_blobs.len(), 5);
}

#[test]
fn second_open_fails_with_already_open() {
    let backend = FakeBackend::new();
    let api = backend.api_core();
    let _session = api.open_session().unwrap();
    assert_eq!(api.open_session().unwrap_err(), Error::AlreadyOpen);
}

#[test]
fn open_after_close_succeeds() {
    let backend = FakeBackend::new();
    let api = backend.api_core();
    let session = api.open_session().unwrap();
    session.close();
    assert_eq!(session.state(), SessionState::Invalid);

    let again = api.open_session().expect("reopen after close");
    assert_eq!(again.state(), SessionState::ConnectedMonitor);
}

#[test]
fn missing_backend_cannot_connect() {
    let dir = tempfile::tempdir().unwrap();
    let api = ApiCore::with_shm_root(dir.path().to_path_buf());
    assert_eq!(api.open_session().unwrap_err(), Error::CannotConnect);
}

#[test]
fn writer_in_progress_times_out() {
    let backend = FakeBackend::new();
    // Core region revision counter stuck odd: writer never finishes.
    backend.patch_core(4, &3u32.to_le_bytes());

    let start = Instant::now();
    let err = backend.api_core().open_session().unwrap_err();
    assert_eq!(err, Error::Timeout);
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(450),
        "deadline respected, got {elapsed:?}"
    );
}

#[test]
fn inactive_core_cannot_connect() {
    let backend = FakeBackend::new();
    // Core state back to initializing.
    backend.patch_core(20, &1u32.to_le_bytes());
    assert_eq!(
        backend.api_core().open_session().unwrap_err(),
        Error::CannotConnect
    );
}

#[test]
fn incompatible_core_version_is_rejected() {
    let backend = FakeBackend::new();
    backend.patch_core(0, &0x0002_0000u32.to_le_bytes());
    assert_eq!(
        backend.api_core().open_session().unwrap_err(),
        Error::Incompatible
    );
}

#[test]
fn packet_size_floor_violation_is_protocol_error() {
    let backend = FakeBackend::new();
    // udp_control_max_plaintext_packet_size sits at offset 94.
    backend.patch_session(94, &1024u16.to_le_bytes());
    assert_eq!(
        backend.api_core().open_session().unwrap_err(),
        Error::Protocol
    );
}

#[test]
fn unknown_udp_protocol_major_is_incompatible() {
    let backend = FakeBackend::new();
    // udp_control_protocol_version sits at offset 68.
    backend.patch_session(68, &0x0005_0000u32.to_le_bytes());
    assert_eq!(
        backend.api_core().open_session().unwrap_err(),
        Error::Incompatible
    );
}

#[test]
fn session_id_mismatch_between_regions_cannot_connect() {
    let backend = FakeBackend::new();
    // The descriptor's session id (offset 4) no longer matches the core's.
    backend.patch_session(4, &99u32.to_le_bytes());
    assert_eq!(
        backend.api_core().open_session().unwrap_err(),
        Error::CannotConnect
    );
}

#[test]
fn blob_with_unknown_id_is_incompatible() {
    let backend = FakeBackend::new();
    // The sub-blob reference table starts at offset 144; corrupt the id of
    // the fourth entry (telemetry definitions) so no match exists.
    backend.patch_session(144 + 3 * 76, &0xdead_0000u32.to_le_bytes());
    assert_eq!(
        backend.api_core().open_session().unwrap_err(),
        Error::Incompatible
    );
}

#[test]
fn initial_definition_refresh_emits_data_events() {
    let backend = FakeBackend::new();
    let api = backend.api_core();
    let events = api.create_event_queue();
    let session = api.open_session().unwrap();
    // Drain the state transition.
    assert!(matches!(
        events.try_pop_for(Duration::from_secs(1)),
        Some(Event::SessionStateChanged { .. })
    ));

    // The first tick runs on the first poll and surfaces the initial BSON
    // blobs.
    session.poll();

    let mut saw_device_info = false;
    let mut saw_sim_data = false;
    while let Some(event) = events.try_pop() {
        match event {
            Event::DeviceInfoChanged(_) => saw_device_info = true,
            Event::SimDataChanged(_) => saw_sim_data = true,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(saw_device_info, "device info event after first tick");
    assert!(saw_sim_data, "sim data event after first tick");

    let info = session.device_info().expect("device info parsed");
    assert_eq!(info.devices().len(), 1);
    assert_eq!(info.devices()[0].uid(), "wb-001");

    let sim = session.sim_data().expect("sim data parsed");
    assert_eq!(sim.current_track().unwrap().name(), "The Ring");
}

#[test]
fn late_event_queue_gets_synthetic_state_event() {
    let backend = FakeBackend::new();
    let api = backend.api_core();
    let _session = api.open_session().unwrap();

    // Subscribed after the fact, still sees the current state first.
    let events = api.create_event_queue();
    match events.try_pop() {
        Some(Event::SessionStateChanged { state, .. }) => {
            assert_eq!(state, SessionState::ConnectedMonitor)
        }
        other => panic!("expected synthetic state event, got {other:?}"),
    }
}

#[test]
fn missing_required_blob_file_cannot_connect() {
    let backend = FakeBackend::with_options(BackendOptions::default());
    std::fs::remove_file(backend.dir.path().join("telemetry-defs")).unwrap();
    assert_eq!(
        backend.api_core().open_session().unwrap_err(),
        Error::CannotConnect
    );
}
