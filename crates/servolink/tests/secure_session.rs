//! Secure registration and encrypted effect actions end to end.

mod support;

use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::aes::Aes128;
use aes_gcm::{AesGcm, KeyInit, Nonce, Tag};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use rand::RngCore;

use servolink::{
    control_flags, derive_symmetric_key, try_key_exchange_with_anchor, ApiUserInformation,
    EffectPipeline, PipelineConfig, SecureSession, SecurityMethod, Session, SessionState,
};
use servolink_wire::actions::effect_samples_offset;
use servolink_wire::{
    ActionId, EffectOffsetAction, FrameHeader, PublicKeyOffer, AAD_SIZE, EFFECT_ENC_OFFSET,
    FRAME_HEADER_SIZE, GCM_IV_SIZE, GCM_TAG_SIZE,
};
use support::{command_reply, serve_command, serve_register, BackendOptions, FakeBackend};

struct SecureFixture {
    backend: FakeBackend,
    anchor: SigningKey,
    server_private: [u8; 32],
}

fn x25519_pair() -> ([u8; 32], [u8; 32]) {
    let mut private = [0u8; 32];
    OsRng.fill_bytes(&mut private);
    let secret = x25519_dalek::StaticSecret::from(private);
    (private, *x25519_dalek::PublicKey::from(&secret).as_bytes())
}

fn secure_backend() -> SecureFixture {
    let anchor = SigningKey::generate(&mut OsRng);
    let (server_private, server_public) = x25519_pair();
    let offer = PublicKeyOffer {
        method: SecurityMethod::X25519Aes128Gcm,
        public_key: server_public.to_vec(),
        signature: anchor.sign(&server_public).to_bytes().to_vec(),
    };
    let backend = FakeBackend::with_options(BackendOptions {
        public_key_offers: vec![offer],
        ..BackendOptions::default()
    });
    SecureFixture {
        backend,
        anchor,
        server_private,
    }
}

fn establish(fixture: &SecureFixture, session: &Arc<Session>) -> (SecureSession, [u8; 32]) {
    let options = session.secure_session_options();
    assert!(options.is_valid());
    let offer = options.preferred_offer().expect("usable offer");

    let (client_private, client_public) = x25519_pair();
    let params = try_key_exchange_with_anchor(
        &fixture.anchor.verifying_key().to_bytes(),
        options.session_id,
        offer,
        &client_private,
        &client_public,
    )
    .expect("key exchange");
    (SecureSession::establish(params, "secure-app"), client_public)
}

#[test]
fn secure_register_carries_public_key_and_encrypts_effects() {
    let fixture = secure_backend();
    let session = fixture.backend.api_core().open_session().unwrap();
    let (secure, client_public) = establish(&fixture, &session);

    let listener = fixture.backend.tcp.try_clone().unwrap();
    let server = std::thread::spawn(move || serve_register(&listener, 9, &["ffb"]));
    session
        .register_to_control(
            control_flags::FFB_EFFECTS,
            "secure-app",
            &ApiUserInformation::default(),
            Some(secure),
        )
        .expect("secure register");
    let (mut stream, request) = server.join().unwrap();
    assert_eq!(session.state(), SessionState::ConnectedControl);

    // The request advertises the method and the controller's public key.
    let block = request
        .get_document("cmd")
        .unwrap()
        .get_document("register")
        .unwrap()
        .get_document("secure_session")
        .unwrap();
    assert_eq!(block.get_str("method").unwrap(), "x25519-AES128-GCM");
    let sent_key = match block.get("public_key").unwrap() {
        bson::Bson::Binary(binary) => binary.bytes.clone(),
        other => panic!("expected binary public key, got {other:?}"),
    };
    assert_eq!(sent_key, client_public.to_vec());

    // Drive the reactor for the blocking pipeline configure.
    let runner = {
        let session = Arc::clone(&session);
        std::thread::spawn(move || {
            while session.run_until_state_changes() == SessionState::ConnectedControl {}
        })
    };
    let server = std::thread::spawn(move || {
        serve_command(&mut stream, |request| {
            command_reply(request, "configure_pipeline", bson::doc! {"pipeline_id": 0i32})
        });
        stream
    });

    let device = session.device_info().unwrap().devices()[0].session_id();
    let mut pipeline = EffectPipeline::new(Arc::clone(&session), device);
    pipeline.configure(&PipelineConfig::default()).unwrap();
    let _stream = server.join().unwrap();

    let start = servolink::now().after(Duration::from_millis(4));
    assert!(pipeline.generate_effect(start, Duration::from_millis(2), &[0.25, -0.25, 0.5]));

    // The frame is marked encrypted: header, IV, body, truncated tag.
    let datagram = fixture.backend.recv_action_datagram();
    let header = FrameHeader::parse(&datagram).unwrap();
    assert_eq!(header.action_id, ActionId::FbEffect);
    assert!(header.flags.is_encrypted());

    // 3 f32 samples pad up to one AES block.
    let padded_samples = 16;
    assert_eq!(
        datagram.len(),
        FRAME_HEADER_SIZE + GCM_IV_SIZE + effect_samples_offset() + padded_samples + GCM_TAG_SIZE
    );

    // The backend derives the same key from its side of the agreement and
    // decrypts.
    let secret = x25519_dalek::StaticSecret::from(fixture.server_private)
        .diffie_hellman(&x25519_dalek::PublicKey::from(client_public));
    let key = derive_symmetric_key(session.session_id(), "secure-app", secret.as_bytes());
    let cipher = AesGcm::<Aes128, U12, U12>::new_from_slice(&key).unwrap();

    let body = &datagram[FRAME_HEADER_SIZE..];
    let (iv, rest) = body.split_at(GCM_IV_SIZE);
    let (clear, rest) = rest.split_at(EFFECT_ENC_OFFSET);
    let (ciphertext, tag) = rest.split_at(rest.len() - GCM_TAG_SIZE);

    let mut plaintext = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(iv),
            &clear[..AAD_SIZE],
            &mut plaintext,
            Tag::<U12>::from_slice(tag),
        )
        .expect("authenticated decryption");

    // Reassemble the plaintext body and decode it.
    let mut full_body = clear.to_vec();
    full_body.extend_from_slice(&plaintext);
    let action = EffectOffsetAction::parse(&full_body).unwrap();
    assert_eq!(action.sample_count, 3);
    assert_eq!(action.device_session_id, 3);
    assert_eq!(action.start_time, start.ticks());
    let samples_at = effect_samples_offset();
    assert_eq!(
        f32::from_le_bytes(full_body[samples_at..samples_at + 4].try_into().unwrap()),
        0.25
    );
    assert_eq!(
        f32::from_le_bytes(full_body[samples_at + 4..samples_at + 8].try_into().unwrap()),
        -0.25
    );

    session.close();
    runner.join().unwrap();
}

#[test]
fn secure_register_rejects_session_id_mismatch() {
    let fixture = secure_backend();
    let session = fixture.backend.api_core().open_session().unwrap();

    let options = session.secure_session_options();
    let offer = options.preferred_offer().unwrap();
    let (client_private, client_public) = x25519_pair();
    // Key exchange bound to the wrong session id.
    let params = try_key_exchange_with_anchor(
        &fixture.anchor.verifying_key().to_bytes(),
        options.session_id + 1,
        offer,
        &client_private,
        &client_public,
    )
    .unwrap();
    let secure = SecureSession::establish(params, "secure-app");

    let err = session
        .register_to_control(
            control_flags::FFB_EFFECTS,
            "secure-app",
            &ApiUserInformation::default(),
            Some(secure),
        )
        .unwrap_err();
    assert_eq!(err, servolink::Error::InvalidArgument);
}

#[test]
fn tampered_offer_fails_verification() {
    let fixture = secure_backend();
    let session = fixture.backend.api_core().open_session().unwrap();

    let options = session.secure_session_options();
    let mut offer = options.preferred_offer().unwrap().clone();
    offer.public_key[0] ^= 0x01;

    let (client_private, client_public) = x25519_pair();
    let err = try_key_exchange_with_anchor(
        &fixture.anchor.verifying_key().to_bytes(),
        options.session_id,
        &offer,
        &client_private,
        &client_public,
    )
    .unwrap_err();
    assert_eq!(err, servolink::Error::SignatureVerification);
}
