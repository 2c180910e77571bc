//! Control Bus — authenticated transport for policy updates.
//!
//! The authority signs each message (Ed25519 over canonical JSON) and
//! addresses it to an enforcer VM; enforcers verify the signature, a
//! timestamp skew window, and nonce uniqueness before trusting the
//! payload. A verification failure discards the message with a warning —
//! never fatal to the receiving process. Delivery is at-least-once and
//! possibly reordered, so consumers apply payloads latest-wins and
//! idempotently.
//!
//! The transport itself is a trait seam; [`DirTransport`] (one
//! line-delimited JSON file per target) stands in for the platform's
//! virtio-serial channel.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Control bus failure.
#[derive(Debug, Error)]
pub enum BusError {
    /// Message cannot be (de)serialized.
    #[error("malformed bus message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Signature does not verify against the authority key.
    #[error("signature verification failed")]
    BadSignature,
    /// Message timestamp outside the accepted skew window.
    #[error("message timestamp outside skew window ({age_secs}s)")]
    StaleTimestamp {
        /// Absolute age of the message in seconds.
        age_secs: i64,
    },
    /// Nonce already seen — replay attempt.
    #[error("replayed nonce rejected")]
    ReplayedNonce,
    /// Key material missing or the wrong length.
    #[error("bad key material at {path}: {reason}")]
    BadKey {
        /// Key file path.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },
    /// Transport I/O failure.
    #[error("bus transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Signed-over message body.
///
/// Field declaration order is alphabetical on purpose: serde serializes
/// struct fields in declaration order, and the map payload is a sorted
/// `BTreeMap`, so `serde_json::to_string` of this struct *is* the
/// canonical form both sides sign and verify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Command verb, e.g. `reload_policy`.
    pub command: String,
    /// 16 random bytes, base64 — replay protection.
    pub nonce: String,
    /// Toggle key → value set carried by this update.
    pub payload: BTreeMap<String, String>,
    /// Target VM role, e.g. `gateway`.
    pub target: String,
    /// Epoch seconds at send time.
    pub timestamp: i64,
    /// Wire format version.
    pub version: u32,
}

/// Message plus detached signature, as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The signed-over body.
    pub msg: ControlMessage,
    /// Base64 Ed25519 signature over the canonical body.
    pub signature: String,
}

/// Canonical byte form of a message: compact JSON of the alphabetical
/// struct (see [`ControlMessage`]). Deterministic on both sides.
fn canonical(msg: &ControlMessage) -> Result<Vec<u8>, BusError> {
    Ok(serde_json::to_vec(msg)?)
}

/// Generate a fresh base64 nonce (16 random bytes).
fn fresh_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

fn read_key_bytes(path: &Path) -> Result<[u8; 32], BusError> {
    let bytes = std::fs::read(path).map_err(|e| BusError::BadKey {
        path: path.to_owned(),
        reason: e.to_string(),
    })?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| BusError::BadKey {
        path: path.to_owned(),
        reason: format!("expected 32 bytes, found {}", bytes.len()),
    })
}

/// Write an Ed25519 keypair to `secret_path` / `public_path` (raw 32-byte
/// files), creating parent directories. Used by `postured keygen` to
/// bootstrap an authority identity.
///
/// # Errors
///
/// Returns an error on I/O failure.
pub fn generate_keypair(secret_path: &Path, public_path: &Path) -> Result<(), BusError> {
    let signing = SigningKey::generate(&mut rand::rngs::OsRng);
    for (path, bytes) in [
        (secret_path, signing.to_bytes()),
        (public_path, signing.verifying_key().to_bytes()),
    ] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
    }
    info!(
        secret = %secret_path.display(),
        public = %public_path.display(),
        "authority keypair written"
    );
    Ok(())
}

// ── Signing side (authority) ────────────────────────────────────

/// Signs outbound control messages with the authority key.
pub struct MessageSigner {
    key: SigningKey,
}

impl MessageSigner {
    /// Wrap an in-memory signing key.
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Load the 32-byte signing key from disk.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::BadKey`] when the file is missing or malformed.
    pub fn from_file(path: &Path) -> Result<Self, BusError> {
        Ok(Self::new(SigningKey::from_bytes(&read_key_bytes(path)?)))
    }

    /// Build and sign a message.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Malformed`] if canonicalization fails.
    pub fn sign(
        &self,
        target: &str,
        command: &str,
        payload: &BTreeMap<String, String>,
        timestamp: i64,
    ) -> Result<Envelope, BusError> {
        let msg = ControlMessage {
            command: command.to_owned(),
            nonce: fresh_nonce(),
            payload: payload.clone(),
            target: target.to_owned(),
            timestamp,
            version: 1,
        };
        let signature = self.key.sign(&canonical(&msg)?);
        Ok(Envelope {
            msg,
            signature: BASE64.encode(signature.to_bytes()),
        })
    }
}

// ── Verifying side (enforcers) ──────────────────────────────────

/// Verifies inbound envelopes: structure, signature, timestamp skew,
/// nonce uniqueness.
pub struct MessageVerifier {
    key: VerifyingKey,
    skew_secs: i64,
    seen_nonces: Mutex<HashSet<String>>,
}

impl MessageVerifier {
    /// Wrap an in-memory verifying key with the given skew window.
    pub fn new(key: VerifyingKey, skew_secs: i64) -> Self {
        Self {
            key,
            skew_secs,
            seen_nonces: Mutex::new(HashSet::new()),
        }
    }

    /// Load the 32-byte verifying key from disk.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::BadKey`] when the file is missing or malformed.
    pub fn from_file(path: &Path, skew_secs: i64) -> Result<Self, BusError> {
        let key = VerifyingKey::from_bytes(&read_key_bytes(path)?).map_err(|e| {
            BusError::BadKey {
                path: path.to_owned(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self::new(key, skew_secs))
    }

    /// Check an envelope and return its message if trustworthy.
    ///
    /// # Errors
    ///
    /// [`BusError::BadSignature`], [`BusError::StaleTimestamp`] or
    /// [`BusError::ReplayedNonce`]. Callers discard the message and log;
    /// none of these is fatal to the receiving process.
    pub fn verify(&self, envelope: &Envelope, now: i64) -> Result<ControlMessage, BusError> {
        let sig_bytes = BASE64
            .decode(&envelope.signature)
            .map_err(|_| BusError::BadSignature)?;
        let sig_array =
            <[u8; 64]>::try_from(sig_bytes.as_slice()).map_err(|_| BusError::BadSignature)?;
        let signature = Signature::from_bytes(&sig_array);

        self.key
            .verify(&canonical(&envelope.msg)?, &signature)
            .map_err(|_| BusError::BadSignature)?;

        let age_secs = now.saturating_sub(envelope.msg.timestamp).saturating_abs();
        if age_secs > self.skew_secs {
            return Err(BusError::StaleTimestamp { age_secs });
        }

        let mut seen = self
            .seen_nonces
            .lock()
            .map_err(|_| BusError::ReplayedNonce)?;
        if !seen.insert(envelope.msg.nonce.clone()) {
            return Err(BusError::ReplayedNonce);
        }

        debug!(target = %envelope.msg.target, command = %envelope.msg.command, "bus message verified");
        Ok(envelope.msg.clone())
    }
}

// ── Transport ───────────────────────────────────────────────────

/// Delivery seam between the authority and enforcer VMs.
pub trait BusTransport: Send + Sync {
    /// Deliver one envelope to the named target VM.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Io`] on delivery failure; the caller treats
    /// this as best-effort.
    fn send(&self, target: &str, envelope: &Envelope) -> Result<(), BusError>;
}

/// Directory-backed transport: appends line-delimited JSON to
/// `{dir}/{target}.bus`. Stands in for the virtio-serial channel.
#[derive(Debug, Clone)]
pub struct DirTransport {
    dir: PathBuf,
}

impl DirTransport {
    /// Create a transport rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Consume all queued envelopes for `target`, removing the file.
    /// Undecodable lines are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Io`] if the file exists but cannot be read or
    /// removed.
    pub fn drain(&self, target: &str) -> Result<Vec<Envelope>, BusError> {
        let path = self.dir.join(format!("{target}.bus"));
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BusError::Io(e)),
        };
        std::fs::remove_file(&path)?;

        let mut envelopes = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(env) => envelopes.push(env),
                Err(e) => warn!(target, error = %e, "dropping undecodable bus line"),
            }
        }
        Ok(envelopes)
    }
}

impl BusTransport for DirTransport {
    fn send(&self, target: &str, envelope: &Envelope) -> Result<(), BusError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{target}.bus"));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let line = serde_json::to_string(envelope)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// Authority-side publisher: sign then send.
pub struct Publisher {
    signer: MessageSigner,
    transport: Box<dyn BusTransport>,
}

impl Publisher {
    /// Combine a signer with a transport.
    pub fn new(signer: MessageSigner, transport: Box<dyn BusTransport>) -> Self {
        Self { signer, transport }
    }

    /// Sign and deliver one policy update.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] on signing or delivery failure.
    pub fn publish(
        &self,
        target: &str,
        command: &str,
        payload: &BTreeMap<String, String>,
        timestamp: i64,
    ) -> Result<(), BusError> {
        let envelope = self.signer.sign(target, command, payload, timestamp)?;
        self.transport.send(target, &envelope)?;
        debug!(target, command, keys = payload.len(), "bus message published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (MessageSigner, MessageVerifier) {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let verifier = MessageVerifier::new(signing.verifying_key(), 300);
        (MessageSigner::new(signing), verifier)
    }

    fn payload(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn sign_verify_round_trip() {
        let (signer, verifier) = keypair();
        let env = signer
            .sign("gateway", "reload_policy", &payload(&[("RADIO_ISOLATION", "on")]), 1000)
            .expect("sign");
        let msg = verifier.verify(&env, 1000).expect("verify");
        assert_eq!(msg.target, "gateway");
        assert_eq!(msg.payload.get("RADIO_ISOLATION").map(String::as_str), Some("on"));
    }

    #[test]
    fn tampered_payload_rejected() {
        let (signer, verifier) = keypair();
        let mut env = signer
            .sign("gateway", "reload_policy", &payload(&[("RADIO_ISOLATION", "on")]), 1000)
            .expect("sign");
        env.msg
            .payload
            .insert("RADIO_ISOLATION".to_owned(), "off".to_owned());
        assert!(matches!(
            verifier.verify(&env, 1000),
            Err(BusError::BadSignature)
        ));
    }

    #[test]
    fn wrong_key_rejected() {
        let (signer, _) = keypair();
        let (_, other_verifier) = keypair();
        let env = signer
            .sign("gateway", "reload_policy", &payload(&[]), 1000)
            .expect("sign");
        assert!(matches!(
            other_verifier.verify(&env, 1000),
            Err(BusError::BadSignature)
        ));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let (signer, verifier) = keypair();
        let env = signer
            .sign("gateway", "reload_policy", &payload(&[]), 1000)
            .expect("sign");
        // 301 seconds in the future relative to the message.
        assert!(matches!(
            verifier.verify(&env, 1301),
            Err(BusError::StaleTimestamp { .. })
        ));
        // Future-dated within skew is accepted.
        let env2 = signer
            .sign("gateway", "reload_policy", &payload(&[]), 1100)
            .expect("sign");
        assert!(verifier.verify(&env2, 1000).is_ok());
    }

    #[test]
    fn replayed_nonce_rejected() {
        let (signer, verifier) = keypair();
        let env = signer
            .sign("gateway", "reload_policy", &payload(&[]), 1000)
            .expect("sign");
        verifier.verify(&env, 1000).expect("first delivery");
        assert!(matches!(
            verifier.verify(&env, 1001),
            Err(BusError::ReplayedNonce)
        ));
    }

    #[test]
    fn canonical_form_is_deterministic() {
        let msg = ControlMessage {
            command: "reload_policy".to_owned(),
            nonce: "n".to_owned(),
            payload: payload(&[("B", "2"), ("A", "1")]),
            target: "gateway".to_owned(),
            timestamp: 5,
            version: 1,
        };
        let a = canonical(&msg).expect("canonical");
        let b = canonical(&msg).expect("canonical");
        assert_eq!(a, b);
        // Map keys serialize sorted regardless of insertion order.
        let text = String::from_utf8(a).expect("utf8");
        let a_pos = text.find("\"A\"").expect("A present");
        let b_pos = text.find("\"B\"").expect("B present");
        assert!(a_pos < b_pos);
    }

    #[test]
    fn dir_transport_delivers_and_drains() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = DirTransport::new(dir.path());
        let (signer, verifier) = keypair();

        let publisher = Publisher::new(signer, Box::new(transport.clone()));
        publisher
            .publish("gateway", "reload_policy", &payload(&[("AUDIT_UPLOAD", "on")]), 1000)
            .expect("publish");
        publisher
            .publish("gateway", "reload_policy", &payload(&[("AUDIT_UPLOAD", "off")]), 1001)
            .expect("publish");

        let envelopes = transport.drain("gateway").expect("drain");
        assert_eq!(envelopes.len(), 2);
        for env in &envelopes {
            verifier.verify(env, 1001).expect("verify");
        }
        // Drained queue is empty afterwards.
        assert!(transport.drain("gateway").expect("drain").is_empty());
    }

    #[test]
    fn keypair_files_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let secret = dir.path().join("keys/authority.sec");
        let public = dir.path().join("keys/authority.pub");
        generate_keypair(&secret, &public).expect("keygen");

        let signer = MessageSigner::from_file(&secret).expect("load secret");
        let verifier = MessageVerifier::from_file(&public, 300).expect("load public");
        let env = signer
            .sign("ui", "reload_policy", &payload(&[("TRUSTED_OVERLAY", "on")]), 10)
            .expect("sign");
        verifier.verify(&env, 10).expect("verify");
    }
}
