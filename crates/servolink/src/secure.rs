//! Secure-session handshake and per-action encryption.
//!
//! The backend offers an X25519 public key signed by the vendor's Ed25519
//! trust anchor. After verifying the signature, the client runs X25519 with
//! its own key pair and derives an AES-128-GCM session key by hashing the
//! shared secret with a session-bound salt. Encrypted actions then carry a
//! 12-byte IV after the frame header and a 12-byte truncated GCM tag at the
//! end; the clear part of the body is authenticated as AAD.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::aes::Aes128;
use aes_gcm::{AesGcm, KeyInit, Nonce};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};

use servolink_wire::{PublicKeyOffer, SecurityMethod, GCM_IV_SIZE, GCM_TAG_SIZE};

use crate::error::{Error, Result};

/// AES-128-GCM with 12-byte nonce and truncated 12-byte tag.
type ActionCipher = AesGcm<Aes128, U12, U12>;

/// The vendor trust anchor every key offer must be signed by.
pub const TRUST_ANCHOR_PUBLIC_KEY: [u8; 32] = [
    0x3f, 0xa1, 0x52, 0x09, 0xc8, 0x5e, 0x77, 0x10, 0x0b, 0xd4, 0x26, 0x98, 0xe1, 0x4b, 0x6f,
    0x83, 0x2a, 0x5d, 0x90, 0x37, 0xf2, 0x6c, 0x1e, 0xb5, 0x48, 0x0a, 0xd7, 0x61, 0x99, 0x2e,
    0xc3, 0x54,
];

const X25519_KEY_LEN: usize = 32;
const ED25519_SIG_LEN: usize = 64;

/// The secure-session offers published by one session's descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureSessionOptions {
    pub session_id: u32,
    pub offers: Vec<PublicKeyOffer>,
}

impl SecureSessionOptions {
    /// True when at least one offer uses a method this client implements.
    pub fn is_valid(&self) -> bool {
        self.offers
            .iter()
            .any(|o| o.method == SecurityMethod::X25519Aes128Gcm)
    }

    /// The first usable offer, if any.
    pub fn preferred_offer(&self) -> Option<&PublicKeyOffer> {
        self.offers
            .iter()
            .find(|o| o.method == SecurityMethod::X25519Aes128Gcm)
    }
}

/// Output of a successful key exchange.
#[derive(Clone, Debug)]
pub struct SecureSessionParameters {
    pub method: SecurityMethod,
    pub session_id: u32,
    pub controller_public_key: Vec<u8>,
    shared_secret: [u8; 32],
}

impl SecureSessionParameters {
    /// The raw shared secret; only the key derivation should consume this.
    pub(crate) fn shared_secret(&self) -> &[u8; 32] {
        &self.shared_secret
    }
}

/// Verify a key offer and run the X25519 agreement, using the built-in
/// trust anchor.
pub fn try_key_exchange(
    session_id: u32,
    offer: &PublicKeyOffer,
    client_private_key: &[u8],
    client_public_key: &[u8],
) -> Result<SecureSessionParameters> {
    try_key_exchange_with_anchor(
        &TRUST_ANCHOR_PUBLIC_KEY,
        session_id,
        offer,
        client_private_key,
        client_public_key,
    )
}

/// [`try_key_exchange`] against an explicit trust anchor.
pub fn try_key_exchange_with_anchor(
    trust_anchor: &[u8; 32],
    session_id: u32,
    offer: &PublicKeyOffer,
    client_private_key: &[u8],
    client_public_key: &[u8],
) -> Result<SecureSessionParameters> {
    if offer.method != SecurityMethod::X25519Aes128Gcm {
        return Err(Error::NotSupported);
    }
    if offer.public_key.len() != X25519_KEY_LEN {
        return Err(Error::NotSupported);
    }
    if client_private_key.len() != X25519_KEY_LEN {
        return Err(Error::InvalidPrivateKey);
    }
    if client_public_key.len() != X25519_KEY_LEN {
        return Err(Error::InvalidPublicKey);
    }
    if offer.signature.len() != ED25519_SIG_LEN {
        return Err(Error::SignatureVerification);
    }

    let anchor =
        VerifyingKey::from_bytes(trust_anchor).map_err(|_| Error::SignatureVerification)?;
    let signature =
        Signature::from_slice(&offer.signature).map_err(|_| Error::SignatureVerification)?;
    anchor
        .verify(&offer.public_key, &signature)
        .map_err(|_| Error::SignatureVerification)?;

    let mut private = [0u8; 32];
    private.copy_from_slice(client_private_key);
    let mut server_public = [0u8; 32];
    server_public.copy_from_slice(&offer.public_key);

    let secret = x25519_dalek::StaticSecret::from(private);
    let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(server_public));

    Ok(SecureSessionParameters {
        method: offer.method,
        session_id,
        controller_public_key: client_public_key.to_vec(),
        shared_secret: *shared.as_bytes(),
    })
}

/// Derive the AES-128 session key.
///
/// The shared secret is never used as the key directly; it is hashed with a
/// session-bound salt and the controller's id name, and the first 16 bytes
/// of the SHA-512 digest become the key.
pub fn derive_symmetric_key(session_id: u32, id_name: &str, shared_secret: &[u8]) -> [u8; 16] {
    let mut salt = [0u8; 8];
    salt[..4].copy_from_slice(&session_id.to_le_bytes());
    salt[4..].copy_from_slice(b"T_RY");

    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(id_name.as_bytes());
    hasher.update(shared_secret);
    let digest = hasher.finalize();

    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// An established secure session: negotiated parameters plus the symmetric
/// cipher state.
pub struct SecureSession {
    params: SecureSessionParameters,
    cipher: ActionCipher,
    iv: Mutex<Option<[u8; GCM_IV_SIZE]>>,
}

impl SecureSession {
    /// Derive the session key for `id_name` and set up the cipher.
    pub fn establish(params: SecureSessionParameters, id_name: &str) -> SecureSession {
        let key = derive_symmetric_key(params.session_id, id_name, params.shared_secret());
        let cipher = ActionCipher::new_from_slice(&key).expect("AES-128 key is 16 bytes");
        SecureSession {
            params,
            cipher,
            iv: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.params.session_id
    }

    pub fn parameters(&self) -> &SecureSessionParameters {
        &self.params
    }

    /// The first IV comes from the OS CSPRNG; every following one is the
    /// previous incremented as a little-endian counter, so IVs never repeat
    /// within a session.
    fn next_iv(&self) -> [u8; GCM_IV_SIZE] {
        let mut slot = self.iv.lock();
        let iv = match slot.as_mut() {
            Some(iv) => {
                for byte in iv.iter_mut() {
                    *byte = byte.wrapping_add(1);
                    if *byte != 0 {
                        break;
                    }
                }
                *iv
            }
            None => {
                let mut iv = [0u8; GCM_IV_SIZE];
                OsRng.fill_bytes(&mut iv);
                *slot = Some(iv);
                iv
            }
        };
        iv
    }

    /// Encrypt `body` in place, authenticating `aad` alongside it. The IV
    /// used is written into `iv_out` and the truncated tag into `tag_out`.
    pub fn encrypt(
        &self,
        iv_out: &mut [u8],
        aad: &[u8],
        body: &mut [u8],
        tag_out: &mut [u8],
    ) -> Result<()> {
        debug_assert_eq!(iv_out.len(), GCM_IV_SIZE);
        debug_assert_eq!(tag_out.len(), GCM_TAG_SIZE);

        let iv = self.next_iv();
        iv_out.copy_from_slice(&iv);
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), aad, body)
            .map_err(|_| Error::Protocol)?;
        tag_out.copy_from_slice(&tag);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn signed_offer(anchor: &SigningKey, server_public: &[u8; 32]) -> PublicKeyOffer {
        PublicKeyOffer {
            method: SecurityMethod::X25519Aes128Gcm,
            public_key: server_public.to_vec(),
            signature: anchor.sign(server_public).to_bytes().to_vec(),
        }
    }

    fn x25519_pair() -> ([u8; 32], [u8; 32]) {
        let mut private = [0u8; 32];
        OsRng.fill_bytes(&mut private);
        let secret = x25519_dalek::StaticSecret::from(private);
        let public = x25519_dalek::PublicKey::from(&secret);
        (private, *public.as_bytes())
    }

    #[test]
    fn key_exchange_agrees_on_both_sides() {
        let anchor = SigningKey::generate(&mut OsRng);
        let (server_private, server_public) = x25519_pair();
        let (client_private, client_public) = x25519_pair();
        let offer = signed_offer(&anchor, &server_public);

        let params = try_key_exchange_with_anchor(
            &anchor.verifying_key().to_bytes(),
            5,
            &offer,
            &client_private,
            &client_public,
        )
        .unwrap();

        // Backend side of the agreement.
        let server_secret = x25519_dalek::StaticSecret::from(server_private)
            .diffie_hellman(&x25519_dalek::PublicKey::from(client_public));
        assert_eq!(params.shared_secret(), server_secret.as_bytes());
        assert_eq!(params.session_id, 5);
        assert_eq!(params.controller_public_key, client_public.to_vec());
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let anchor = SigningKey::generate(&mut OsRng);
        let (_, server_public) = x25519_pair();
        let (client_private, client_public) = x25519_pair();
        let mut offer = signed_offer(&anchor, &server_public);
        offer.signature[0] ^= 0xff;

        let result = try_key_exchange_with_anchor(
            &anchor.verifying_key().to_bytes(),
            5,
            &offer,
            &client_private,
            &client_public,
        );
        assert_eq!(result.unwrap_err(), Error::SignatureVerification);
    }

    #[test]
    fn wrong_key_lengths_are_rejected() {
        let anchor = SigningKey::generate(&mut OsRng);
        let (_, server_public) = x25519_pair();
        let (client_private, client_public) = x25519_pair();
        let offer = signed_offer(&anchor, &server_public);
        let anchor_bytes = anchor.verifying_key().to_bytes();

        assert_eq!(
            try_key_exchange_with_anchor(&anchor_bytes, 5, &offer, &[0u8; 31], &client_public)
                .unwrap_err(),
            Error::InvalidPrivateKey
        );
        assert_eq!(
            try_key_exchange_with_anchor(&anchor_bytes, 5, &offer, &client_private, &[0u8; 31])
                .unwrap_err(),
            Error::InvalidPublicKey
        );

        let mut short_key_offer = offer.clone();
        short_key_offer.public_key.truncate(16);
        assert_eq!(
            try_key_exchange_with_anchor(
                &anchor_bytes,
                5,
                &short_key_offer,
                &client_private,
                &client_public
            )
            .unwrap_err(),
            Error::NotSupported
        );
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let offer = PublicKeyOffer {
            method: SecurityMethod::Unknown(9),
            public_key: vec![0; 32],
            signature: vec![0; 64],
        };
        assert_eq!(
            try_key_exchange(3, &offer, &[0; 32], &[0; 32]).unwrap_err(),
            Error::NotSupported
        );
    }

    #[test]
    fn derived_key_is_deterministic_and_input_sensitive() {
        let secret = [7u8; 32];
        let a = derive_symmetric_key(9, "example", &secret);
        let b = derive_symmetric_key(9, "example", &secret);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        assert_ne!(a, derive_symmetric_key(10, "example", &secret));
        assert_ne!(a, derive_symmetric_key(9, "other", &secret));
        assert_ne!(a, derive_symmetric_key(9, "example", &[8u8; 32]));

        // Pin the construction: SHA-512(session_id_le || "T_RY" || name || secret).
        let mut hasher = Sha512::new();
        hasher.update(9u32.to_le_bytes());
        hasher.update(b"T_RY");
        hasher.update(b"example");
        hasher.update(secret);
        assert_eq!(a, hasher.finalize()[..16]);
    }

    #[test]
    fn encrypt_produces_decryptable_frames_with_fresh_ivs() {
        let params = SecureSessionParameters {
            method: SecurityMethod::X25519Aes128Gcm,
            session_id: 11,
            controller_public_key: vec![0; 32],
            shared_secret: [3u8; 32],
        };
        let session = SecureSession::establish(params, "example");

        let aad = [0xaa; 16];
        let plaintext = [0x42u8; 32];

        let mut body1 = plaintext;
        let mut iv1 = [0u8; GCM_IV_SIZE];
        let mut tag1 = [0u8; GCM_TAG_SIZE];
        session.encrypt(&mut iv1, &aad, &mut body1, &mut tag1).unwrap();
        assert_ne!(body1, plaintext);

        let mut body2 = plaintext;
        let mut iv2 = [0u8; GCM_IV_SIZE];
        let mut tag2 = [0u8; GCM_TAG_SIZE];
        session.encrypt(&mut iv2, &aad, &mut body2, &mut tag2).unwrap();
        assert_ne!(iv1, iv2, "IVs must not repeat");

        // Decrypt with an independently derived cipher.
        let key = derive_symmetric_key(11, "example", &[3u8; 32]);
        let cipher = ActionCipher::new_from_slice(&key).unwrap();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&iv1),
                &aad,
                &mut body1,
                aes_gcm::Tag::<U12>::from_slice(&tag1),
            )
            .unwrap();
        assert_eq!(body1, plaintext);

        // A flipped AAD bit must fail authentication.
        let mut bad_aad = aad;
        bad_aad[0] ^= 1;
        assert!(cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&iv2),
                &bad_aad,
                &mut body2,
                aes_gcm::Tag::<U12>::from_slice(&tag2),
            )
            .is_err());
    }
}
