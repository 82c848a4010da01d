use std::fmt;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, aead::{Aead, KeyInit}};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use log::{debug, info};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::packet::seq_distance;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

const INFO_INITIATOR_TO_RESPONDER: &[u8] = b"parley v1 audio initiator->responder";
const INFO_RESPONDER_TO_INITIATOR: &[u8] = b"parley v1 audio responder->initiator";
const SIGNATURE_CONTEXT: &[u8] = b"parley v1 key exchange";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("payload failed authentication")]
    Auth,
    #[error("encryption failed")]
    Encrypt,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("invalid key exchange: {0}")]
    InvalidKeyExchange(String),
    #[error("peer identity is not trusted")]
    UntrustedPeer,
    #[error("key exchange already completed")]
    AlreadyCompleted,
}

/// Symmetric key material. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Cipher primitive and key-derivation function used by [`CryptoSession`]
pub trait CipherSuite: Send + Sync {
    fn derive_key(&self, secret: &[u8], salt: &[u8], info: &[u8]) -> Result<SessionKey, CryptoError>;

    fn encrypt(
        &self,
        key: &SessionKey,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(
        &self,
        key: &SessionKey,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// ChaCha20-Poly1305 AEAD with HKDF-SHA256 key derivation
#[derive(Debug, Default, Clone, Copy)]
pub struct ChaChaCipher;

impl CipherSuite for ChaChaCipher {
    fn derive_key(&self, secret: &[u8], salt: &[u8], info: &[u8]) -> Result<SessionKey, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), secret);
        let mut okm = [0u8; KEY_LEN];
        hk.expand(info, &mut okm)
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(SessionKey(okm))
    }

    fn encrypt(
        &self,
        key: &SessionKey,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        cipher.encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)
    }

    fn decrypt(
        &self,
        key: &SessionKey,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        cipher.decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Auth)
    }
}

/// Which side of the call we are; selects the directional keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Role::Initiator => 0x01,
            Role::Responder => 0x02,
        }
    }
}

/// Builds nonces from sequence numbers, counting wraps of the 32-bit space.
///
/// Layout: direction tag, three zero bytes, rollover epoch (BE), sequence (BE).
#[derive(Debug, Clone)]
struct NonceSequence {
    direction: u8,
    epoch: u32,
    highest: Option<u32>,
}

impl NonceSequence {
    fn new(direction: u8) -> Self {
        Self { direction, epoch: 0, highest: None }
    }

    /// Epoch a sequence number belongs to, relative to the highest one seen
    fn epoch_for(&self, seq: u32) -> u32 {
        match self.highest {
            None => self.epoch,
            Some(highest) => {
                let ahead = seq_distance(seq, highest) > 0;
                if ahead && seq < highest {
                    self.epoch.wrapping_add(1)
                } else if !ahead && seq > highest {
                    self.epoch.wrapping_sub(1)
                } else {
                    self.epoch
                }
            }
        }
    }

    fn commit(&mut self, seq: u32, epoch: u32) {
        let newer = match self.highest {
            None => true,
            Some(highest) => seq_distance(seq, highest) > 0,
        };
        if newer {
            self.highest = Some(seq);
            self.epoch = epoch;
        }
    }

    fn nonce(&self, seq: u32, epoch: u32) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[0] = self.direction;
        nonce[4..8].copy_from_slice(&epoch.to_be_bytes());
        nonce[8..12].copy_from_slice(&seq.to_be_bytes());
        nonce
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CryptoStats {
    pub packets_encrypted: u64,
    pub packets_decrypted: u64,
    pub auth_failures: u64,
}

/// Per-call encryption state for the audio stream
pub struct CryptoSession {
    suite: Arc<dyn CipherSuite>,
    send_key: SessionKey,
    recv_key: SessionKey,
    send_nonces: NonceSequence,
    recv_nonces: NonceSequence,
    peer_identity: Option<VerifyingKey>,
    stats: CryptoStats,
}

impl CryptoSession {
    /// Build a session from already-derived directional keys
    pub fn new(suite: Arc<dyn CipherSuite>, role: Role, send_key: SessionKey, recv_key: SessionKey) -> Self {
        Self {
            suite,
            send_key,
            recv_key,
            send_nonces: NonceSequence::new(role.tag()),
            recv_nonces: NonceSequence::new(role.peer().tag()),
            peer_identity: None,
            stats: CryptoStats::default(),
        }
    }

    /// Derive both directional keys from a shared secret
    pub fn derive(
        suite: Arc<dyn CipherSuite>,
        role: Role,
        secret: &[u8],
        salt: &[u8],
    ) -> Result<Self, CryptoError> {
        let i2r = suite.derive_key(secret, salt, INFO_INITIATOR_TO_RESPONDER)?;
        let r2i = suite.derive_key(secret, salt, INFO_RESPONDER_TO_INITIATOR)?;
        let (send_key, recv_key) = match role {
            Role::Initiator => (i2r, r2i),
            Role::Responder => (r2i, i2r),
        };
        Ok(Self::new(suite, role, send_key, recv_key))
    }

    pub fn encrypt(&mut self, sequence_number: u32, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let epoch = self.send_nonces.epoch_for(sequence_number);
        let nonce = self.send_nonces.nonce(sequence_number, epoch);
        let ciphertext = self.suite.encrypt(&self.send_key, &nonce, plaintext)?;
        self.send_nonces.commit(sequence_number, epoch);
        self.stats.packets_encrypted += 1;
        Ok(ciphertext)
    }

    pub fn decrypt(&mut self, sequence_number: u32, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let epoch = self.recv_nonces.epoch_for(sequence_number);
        let nonce = self.recv_nonces.nonce(sequence_number, epoch);
        match self.suite.decrypt(&self.recv_key, &nonce, ciphertext) {
            Ok(plaintext) => {
                self.recv_nonces.commit(sequence_number, epoch);
                self.stats.packets_decrypted += 1;
                Ok(plaintext)
            }
            Err(e) => {
                self.stats.auth_failures += 1;
                debug!("Payload authentication failed: seq={}", sequence_number);
                Err(e)
            }
        }
    }

    pub fn peer_identity(&self) -> Option<&VerifyingKey> {
        self.peer_identity.as_ref()
    }

    pub fn peer_fingerprint(&self) -> Option<String> {
        self.peer_identity.as_ref().map(fingerprint)
    }

    pub fn stats(&self) -> &CryptoStats {
        &self.stats
    }
}

impl fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoSession")
            .field("peer", &self.peer_fingerprint())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Short printable fingerprint of an identity key
pub fn fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
}

/// Long-term Ed25519 identity used to sign key exchange material
#[derive(Clone)]
pub struct IdentityKey {
    signing_key: SigningKey,
}

impl IdentityKey {
    pub fn generate() -> Self {
        Self { signing_key: SigningKey::from_bytes(&rand::random::<[u8; 32]>()) }
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64.decode(encoded)
            .map_err(|e| CryptoError::InvalidKeyExchange(format!("identity key: {}", e)))?;
        let secret: [u8; 32] = bytes.try_into()
            .map_err(|_| CryptoError::InvalidKeyExchange("identity key length".into()))?;
        Ok(Self { signing_key: SigningKey::from_bytes(&secret) })
    }

    /// Export the secret key for storage in the config file
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.signing_key.to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_base64(&self) -> String {
        BASE64.encode(self.verifying_key().as_bytes())
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", fingerprint(&self.verifying_key()))
    }
}

pub fn parse_verifying_key(encoded: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = BASE64.decode(encoded)
        .map_err(|e| CryptoError::InvalidKeyExchange(format!("identity encoding: {}", e)))?;
    let array: [u8; 32] = bytes.try_into()
        .map_err(|_| CryptoError::InvalidKeyExchange("identity length".into()))?;
    VerifyingKey::from_bytes(&array)
        .map_err(|e| CryptoError::InvalidKeyExchange(format!("identity key: {}", e)))
}

/// Key material carried in a KeyExchange signaling message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct KeyExchangePayload {
    pub identity_public_key: String,
    pub ephemeral_public_key: String,
    pub signature: String,
}

fn signed_transcript(session_id: &Uuid, role: Role, ephemeral: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SIGNATURE_CONTEXT);
    hasher.update(session_id.as_bytes());
    hasher.update([role.tag()]);
    hasher.update(ephemeral);
    hasher.finalize().into()
}

/// One side of an ephemeral X25519 exchange authenticated by Ed25519 identities
pub struct KeyAgreement {
    identity: IdentityKey,
    role: Role,
    session_id: Uuid,
    ephemeral_secret: Option<EphemeralSecret>,
    ephemeral_public: X25519PublicKey,
    pre_shared_secret: Option<String>,
    trusted_peers: Vec<VerifyingKey>,
}

impl KeyAgreement {
    pub fn new(identity: IdentityKey, role: Role, session_id: Uuid) -> Self {
        let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

        Self {
            identity,
            role,
            session_id,
            ephemeral_secret: Some(ephemeral_secret),
            ephemeral_public,
            pre_shared_secret: None,
            trusted_peers: Vec::new(),
        }
    }

    /// Mix a passphrase both sides know into the derived keys
    pub fn with_pre_shared_secret(mut self, secret: Option<String>) -> Self {
        self.pre_shared_secret = secret.filter(|s| !s.is_empty());
        self
    }

    /// Restrict accepted peers; an empty list accepts any verified identity
    pub fn with_trusted_peers(mut self, peers: Vec<VerifyingKey>) -> Self {
        self.trusted_peers = peers;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_payload(&self) -> KeyExchangePayload {
        let transcript = signed_transcript(&self.session_id, self.role, self.ephemeral_public.as_bytes());
        let signature = self.identity.signing_key.sign(&transcript);

        KeyExchangePayload {
            identity_public_key: self.identity.public_base64(),
            ephemeral_public_key: BASE64.encode(self.ephemeral_public.as_bytes()),
            signature: BASE64.encode(signature.to_bytes()),
        }
    }

    /// Verify the peer's payload and derive the audio session keys
    pub fn complete(
        &mut self,
        remote: &KeyExchangePayload,
        suite: Arc<dyn CipherSuite>,
    ) -> Result<CryptoSession, CryptoError> {
        let peer_identity = parse_verifying_key(&remote.identity_public_key)?;
        if !self.trusted_peers.is_empty() && !self.trusted_peers.contains(&peer_identity) {
            return Err(CryptoError::UntrustedPeer);
        }

        let ephemeral_bytes: [u8; 32] = BASE64.decode(&remote.ephemeral_public_key)
            .map_err(|e| CryptoError::InvalidKeyExchange(format!("ephemeral encoding: {}", e)))?
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyExchange("ephemeral key length".into()))?;
        let signature_bytes: [u8; 64] = BASE64.decode(&remote.signature)
            .map_err(|e| CryptoError::InvalidKeyExchange(format!("signature encoding: {}", e)))?
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyExchange("signature length".into()))?;
        let signature = Signature::from_bytes(&signature_bytes);

        let transcript = signed_transcript(&self.session_id, self.role.peer(), &ephemeral_bytes);
        peer_identity.verify(&transcript, &signature)
            .map_err(|_| CryptoError::InvalidKeyExchange("signature verification failed".into()))?;

        let ephemeral_secret = self.ephemeral_secret.take()
            .ok_or(CryptoError::AlreadyCompleted)?;
        let shared_secret = ephemeral_secret.diffie_hellman(&X25519PublicKey::from(ephemeral_bytes));
        if !shared_secret.was_contributory() {
            return Err(CryptoError::InvalidKeyExchange("non-contributory shared secret".into()));
        }

        let mut ikm = shared_secret.as_bytes().to_vec();
        if let Some(ref psk) = self.pre_shared_secret {
            ikm.extend_from_slice(psk.as_bytes());
        }

        let mut session = CryptoSession::derive(suite, self.role, &ikm, self.session_id.as_bytes())?;
        session.peer_identity = Some(peer_identity);

        info!("Audio keys derived for session {} (peer {})",
              self.session_id, fingerprint(&peer_identity));
        Ok(session)
    }
}
