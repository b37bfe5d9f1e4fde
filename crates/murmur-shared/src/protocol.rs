use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::constants::{KDF_CONTEXT_ENVELOPE_ID, MAX_ENVELOPE_SIZE, NONCE_SIZE, SIGNATURE_SIZE};
use crate::crypto::{verify, SigningKeyPair};
use crate::error::{EnvelopeError, IdentityError};
use crate::identity::PeerIdentity;
use crate::types::{EnvelopeId, GroupId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    DirectMessage,
    GroupMessage,
    PresenceAnnouncement,
}

impl EnvelopeKind {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::DirectMessage => "direct_message",
            Self::GroupMessage => "group_message",
            Self::PresenceAnnouncement => "user_status",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "direct_message" => Some(Self::DirectMessage),
            "group_message" => Some(Self::GroupMessage),
            "user_status" => Some(Self::PresenceAnnouncement),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::DirectMessage => 0x01,
            Self::GroupMessage => 0x02,
            Self::PresenceAnnouncement => 0x03,
        }
    }
}

/// The unit exchanged over every delivery channel.
///
/// Fields are private; an envelope cannot change after construction.
/// Signing consumes the envelope and returns a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    kind: EnvelopeKind,
    sender_id: UserId,
    recipient_id: Option<UserId>,
    group_id: Option<GroupId>,
    /// nonce || ciphertext for direct/group, clear JSON for presence
    content: Vec<u8>,
    /// Milliseconds since the Unix epoch, as claimed by the sender
    timestamp: i64,
    signature: Option<[u8; SIGNATURE_SIZE]>,
    id: EnvelopeId,
}

impl Envelope {
    pub fn direct(sender_id: UserId, recipient_id: UserId, content: Vec<u8>, timestamp: i64) -> Self {
        Self::build(
            EnvelopeKind::DirectMessage,
            sender_id,
            Some(recipient_id),
            None,
            content,
            timestamp,
            None,
        )
    }

    pub fn group(sender_id: UserId, group_id: GroupId, content: Vec<u8>, timestamp: i64) -> Self {
        Self::build(
            EnvelopeKind::GroupMessage,
            sender_id,
            None,
            Some(group_id),
            content,
            timestamp,
            None,
        )
    }

    pub fn presence(payload: &PresencePayload) -> Result<Self, EnvelopeError> {
        let sender_id = UserId::from_hex(&payload.user_id).map_err(|e| EnvelopeError::InvalidField {
            field: "userId",
            reason: e.to_string(),
        })?;
        let content =
            serde_json::to_vec(payload).map_err(|e| EnvelopeError::Json(e.to_string()))?;
        Ok(Self::build(
            EnvelopeKind::PresenceAnnouncement,
            sender_id,
            None,
            None,
            content,
            payload.timestamp,
            None,
        ))
    }

    fn build(
        kind: EnvelopeKind,
        sender_id: UserId,
        recipient_id: Option<UserId>,
        group_id: Option<GroupId>,
        content: Vec<u8>,
        timestamp: i64,
        signature: Option<[u8; SIGNATURE_SIZE]>,
    ) -> Self {
        let id = compute_id(kind, &sender_id, timestamp, &content);
        Self {
            kind,
            sender_id,
            recipient_id,
            group_id,
            content,
            timestamp,
            signature,
            id,
        }
    }

    /// Attach a detached Ed25519 signature over [`Envelope::signing_bytes`].
    pub fn signed(mut self, signer: &SigningKeyPair) -> Self {
        self.signature = Some(signer.sign(&self.signing_bytes()));
        self
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn sender_id(&self) -> &UserId {
        &self.sender_id
    }

    pub fn recipient_id(&self) -> Option<&UserId> {
        self.recipient_id.as_ref()
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        self.group_id.as_ref()
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn signature(&self) -> Option<&[u8; SIGNATURE_SIZE]> {
        self.signature.as_ref()
    }

    pub fn id(&self) -> EnvelopeId {
        self.id
    }

    /// The AEAD nonce carried at the front of the content, if any.
    pub fn nonce(&self) -> Option<&[u8]> {
        match self.kind {
            EnvelopeKind::PresenceAnnouncement => None,
            _ => self.content.get(..NONCE_SIZE),
        }
    }

    /// Canonical bytes covered by the signature: every field except the
    /// signature itself, length-prefixed where variable.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 32 + 33 + 17 + 8 + 8 + self.content.len());
        out.push(self.kind.tag());
        out.extend_from_slice(&self.sender_id.0);
        match &self.recipient_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.0);
            }
            None => out.push(0),
        }
        match &self.group_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(id.0.as_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&(self.content.len() as u64).to_be_bytes());
        out.extend_from_slice(&self.content);
        out
    }

    /// `false` when unsigned or when the signature does not verify.
    pub fn verify_signature(&self, signing_public: &[u8; 32]) -> bool {
        match &self.signature {
            Some(signature) => verify(&self.signing_bytes(), signature, signing_public),
            None => false,
        }
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        let wire = WireEnvelope {
            kind: self.kind.wire_name().to_string(),
            sender_id: self.sender_id.to_hex(),
            recipient_id: self.recipient_id.map(|id| id.to_hex()),
            group_id: self.group_id.map(|id| id.to_string()),
            content: BASE64.encode(&self.content),
            timestamp: self.timestamp,
            signature: self.signature.map(|sig| BASE64.encode(sig)),
        };
        let json = serde_json::to_string(&wire).map_err(|e| EnvelopeError::Json(e.to_string()))?;
        if json.len() > MAX_ENVELOPE_SIZE {
            return Err(EnvelopeError::TooLarge {
                size: json.len(),
                max: MAX_ENVELOPE_SIZE,
            });
        }
        Ok(json)
    }

    pub fn from_json(json: &str) -> Result<Self, EnvelopeError> {
        if json.len() > MAX_ENVELOPE_SIZE {
            return Err(EnvelopeError::TooLarge {
                size: json.len(),
                max: MAX_ENVELOPE_SIZE,
            });
        }

        let wire: WireEnvelope =
            serde_json::from_str(json).map_err(|e| EnvelopeError::Json(e.to_string()))?;

        let kind = EnvelopeKind::from_wire_name(&wire.kind)
            .ok_or_else(|| EnvelopeError::UnknownType(wire.kind.clone()))?;

        let sender_id = parse_user_id("senderId", &wire.sender_id)?;
        let recipient_id = wire
            .recipient_id
            .as_deref()
            .map(|s| parse_user_id("recipientId", s))
            .transpose()?;
        let group_id = wire
            .group_id
            .as_deref()
            .map(|s| {
                GroupId::parse(s).map_err(|e| EnvelopeError::InvalidField {
                    field: "groupId",
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let addressing_ok = match kind {
            EnvelopeKind::DirectMessage => recipient_id.is_some() && group_id.is_none(),
            EnvelopeKind::GroupMessage => recipient_id.is_none() && group_id.is_some(),
            EnvelopeKind::PresenceAnnouncement => recipient_id.is_none() && group_id.is_none(),
        };
        if !addressing_ok {
            return Err(EnvelopeError::Addressing);
        }

        let content = BASE64
            .decode(wire.content.as_bytes())
            .map_err(|e| EnvelopeError::InvalidField {
                field: "content",
                reason: e.to_string(),
            })?;

        let signature = wire
            .signature
            .as_deref()
            .map(|s| {
                let bytes = BASE64.decode(s.as_bytes()).map_err(|e| EnvelopeError::InvalidField {
                    field: "signature",
                    reason: e.to_string(),
                })?;
                <[u8; SIGNATURE_SIZE]>::try_from(bytes.as_slice()).map_err(|_| {
                    EnvelopeError::InvalidField {
                        field: "signature",
                        reason: format!("expected {SIGNATURE_SIZE} bytes, got {}", bytes.len()),
                    }
                })
            })
            .transpose()?;

        Ok(Self::build(
            kind,
            sender_id,
            recipient_id,
            group_id,
            content,
            wire.timestamp,
            signature,
        ))
    }
}

fn parse_user_id(field: &'static str, value: &str) -> Result<UserId, EnvelopeError> {
    UserId::from_hex(value).map_err(|e| EnvelopeError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

fn compute_id(kind: EnvelopeKind, sender: &UserId, timestamp: i64, content: &[u8]) -> EnvelopeId {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_ENVELOPE_ID);
    hasher.update(&[kind.tag()]);
    hasher.update(&sender.0);
    hasher.update(&timestamp.to_be_bytes());
    hasher.update(content);
    EnvelopeId(*hasher.finalize().as_bytes())
}

/// JSON shape on the wire.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_id: Option<String>,
    content: String,
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

/// Clear-text body of a `user_status` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_public_key: Option<String>,
    pub username: String,
    pub timestamp: i64,
}

impl PresencePayload {
    pub fn from_identity(identity: &PeerIdentity, timestamp: i64) -> Self {
        Self {
            user_id: identity.id.to_hex(),
            public_key: hex::encode(identity.public_key),
            signing_public_key: identity.signing_public_key.map(hex::encode),
            username: identity.username.clone(),
            timestamp,
        }
    }

    pub fn decode(content: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(content).map_err(|e| EnvelopeError::Json(e.to_string()))
    }

    /// Parse the announced identity, enforcing `id == hash(publicKey)`.
    pub fn identity(&self) -> Result<PeerIdentity, IdentityError> {
        let id = UserId::from_hex(&self.user_id).map_err(|_| IdentityError::InvalidKeyBytes)?;
        let public_key = decode_key(&self.public_key)?;
        let signing_public_key = self
            .signing_public_key
            .as_deref()
            .map(decode_key)
            .transpose()?;
        PeerIdentity::from_claimed(id, public_key, signing_public_key, self.username.clone())
    }
}

fn decode_key(hex_key: &str) -> Result<[u8; 32], IdentityError> {
    let mut key = [0u8; 32];
    hex::decode_to_slice(hex_key, &mut key).map_err(|_| IdentityError::InvalidKeyBytes)?;
    Ok(key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    System,
}

/// Encrypted body of a direct or group message. The ephemeral expiry lives
/// here, inside the ciphertext, so relays never see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub text: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl MessagePayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Json(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Json(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_signing_key_pair;
    use crate::identity::KeyMaterial;

    fn sample_direct() -> Envelope {
        Envelope::direct(UserId([1u8; 32]), UserId([2u8; 32]), vec![7u8; 48], 1_700_000_000_000)
    }

    #[test]
    fn test_wire_json_shape() {
        let json = sample_direct().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "direct_message");
        assert_eq!(value["senderId"], UserId([1u8; 32]).to_hex());
        assert_eq!(value["recipientId"], UserId([2u8; 32]).to_hex());
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);
        assert!(value.get("groupId").is_none());
        assert!(value.get("signature").is_none());
    }

    #[test]
    fn test_json_roundtrip_preserves_id() {
        let signer = generate_signing_key_pair();
        let envelope = sample_direct().signed(&signer);
        let restored = Envelope::from_json(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(restored, envelope);
        assert_eq!(restored.id(), envelope.id());
        assert!(restored.verify_signature(signer.public_key()));
    }

    #[test]
    fn test_addressing_enforced() {
        let json = r#"{"type":"direct_message","senderId":"0101010101010101010101010101010101010101010101010101010101010101","content":"","timestamp":1}"#;
        assert_eq!(Envelope::from_json(json).unwrap_err(), EnvelopeError::Addressing);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{"type":"typing","senderId":"01","content":"","timestamp":1}"#;
        assert!(matches!(
            Envelope::from_json(json),
            Err(EnvelopeError::UnknownType(_))
        ));
    }

    #[test]
    fn test_signature_covers_content() {
        let signer = generate_signing_key_pair();
        let envelope = sample_direct().signed(&signer);

        let forged = Envelope::direct(
            *envelope.sender_id(),
            UserId([3u8; 32]),
            envelope.content().to_vec(),
            envelope.timestamp(),
        );
        let mut json: serde_json::Value = serde_json::from_str(&forged.to_json().unwrap()).unwrap();
        json["signature"] = serde_json::Value::String(BASE64.encode(envelope.signature().unwrap()));
        let forged = Envelope::from_json(&json.to_string()).unwrap();

        assert!(!forged.verify_signature(signer.public_key()));
    }

    #[test]
    fn test_presence_payload_identity_check() {
        let keys = KeyMaterial::generate();
        let identity = keys.to_identity("alice");
        let payload = PresencePayload::from_identity(&identity, 42);

        let envelope = Envelope::presence(&payload).unwrap();
        assert_eq!(envelope.sender_id(), &identity.id);
        assert_eq!(envelope.nonce(), None);

        let decoded = PresencePayload::decode(envelope.content()).unwrap();
        assert_eq!(decoded.identity().unwrap(), identity);

        let mut spoofed = payload.clone();
        spoofed.user_id = UserId([5u8; 32]).to_hex();
        assert_eq!(spoofed.identity().unwrap_err(), IdentityError::IdMismatch);
    }

    #[test]
    fn test_ids_differ_with_content() {
        let a = Envelope::group(UserId([1u8; 32]), GroupId::new(), vec![1], 5);
        let b = Envelope::group(UserId([1u8; 32]), GroupId::new(), vec![2], 5);
        assert_ne!(a.id(), b.id());
    }
}
