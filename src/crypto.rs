//! C1 — crypto primitives: RSA-2048 OAEP/PKCS#1v1.5 and AES-256-GCM.
//!
//! Everything here is a thin wrapper over `rsa`/`aes-gcm`/`sha2`; the wire
//! format and handshake sequencing that use these primitives live in
//! [`crate::codec`] and [`crate::handshake`].
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

/// RSA-2048 is normative (spec.md §6).
pub const RSA_KEY_BITS: usize = 2048;
/// AES-256 key size in bytes.
pub const AES_KEY_LEN: usize = 32;
/// AES-GCM nonce size in bytes; prepended to every sealed record (spec.md §4.3).
pub const NONCE_LEN: usize = 12;

pub struct RsaKeyPair {
    pub private: RsaPrivateKey,
    pub public: RsaPublicKey,
}

impl RsaKeyPair {
    pub fn generate() -> anyhow::Result<Self> {
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }
}

/// PEM-wrap a PKIX (`pkcs8`) public key for transport in step 1/2 of the handshake.
pub fn encode_public_key_pem(key: &RsaPublicKey) -> anyhow::Result<String> {
    Ok(key.to_public_key_pem(LineEnding::LF)?)
}

pub fn decode_public_key_pem(pem: &str) -> anyhow::Result<RsaPublicKey> {
    Ok(RsaPublicKey::from_public_key_pem(pem)?)
}

/// RSA-OAEP-SHA256 encrypt (used to wrap an AES key for transport).
pub fn rsa_encrypt(public: &RsaPublicKey, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut rng = OsRng;
    Ok(public.encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)?)
}

/// RSA-OAEP-SHA256 decrypt.
pub fn rsa_decrypt(private: &RsaPrivateKey, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
    Ok(private.decrypt(Oaep::new::<Sha256>(), ciphertext)?)
}

/// RSA PKCS#1v1.5-SHA256 sign over the plaintext AES key (spec.md §4.3 step 3/4).
pub fn rsa_sign(private: &RsaPrivateKey, message: &[u8]) -> anyhow::Result<Vec<u8>> {
    let signing_key = SigningKey::<Sha256>::new(private.clone());
    let mut rng = OsRng;
    let sig = signing_key.sign_with_rng(&mut rng, message);
    Ok(sig.to_vec())
}

/// RSA PKCS#1v1.5-SHA256 verify against the claimed sender's public key.
pub fn rsa_verify(public: &RsaPublicKey, message: &[u8], signature: &[u8]) -> anyhow::Result<()> {
    let verifying_key = VerifyingKey::<Sha256>::new(public.clone());
    let sig = Signature::try_from(signature)?;
    verifying_key.verify(message, &sig)?;
    Ok(())
}

/// Generate a fresh random AES-256 key.
pub fn generate_aes_key() -> [u8; AES_KEY_LEN] {
    let mut key = [0u8; AES_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// AES-256-GCM seal: fresh random nonce, prepended to the ciphertext (spec.md §4.3).
pub fn aes_seal(key: &[u8; AES_KEY_LEN], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    // Key is fixed-size and the plaintext is always our own well-formed inner
    // structure, so only a misconfigured cipher would make this fail.
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("AES-256-GCM seal of a well-formed inner record cannot fail");
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

/// AES-256-GCM open: splits the leading nonce, decrypts the remainder.
pub fn aes_open(key: &[u8; AES_KEY_LEN], sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        anyhow::bail!("sealed record shorter than nonce ({} bytes)", sealed.len());
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow::anyhow!("AES-GCM authentication failed"))?;
    Ok(plaintext)
}
