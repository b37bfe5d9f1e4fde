//! Domain records shared between the router and the persistence layer.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed to
//! a UI layer or written to disk as-is.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::SymmetricKey;
use crate::identity::PeerIdentity;
use crate::protocol::MessageType;
use crate::types::{ChatId, GroupId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A decrypted application message. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Same as the id of the envelope that carried it.
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: Option<UserId>,
    pub group_id: Option<GroupId>,
    pub plaintext: String,
    /// Milliseconds since the Unix epoch, as claimed by the sender.
    pub timestamp: i64,
    pub message_type: MessageType,
    pub is_ephemeral: bool,
    pub expires_at: Option<i64>,
    /// Whether the message had already expired when it was built.
    pub is_expired: bool,
}

impl Message {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    /// The conversation this message belongs to, seen from `local`.
    pub fn chat_id(&self, local: &UserId) -> ChatId {
        match (self.group_id, self.recipient_id) {
            (Some(group_id), _) => ChatId::Group(group_id),
            (None, Some(recipient)) if self.sender_id == *local => ChatId::Direct(recipient),
            _ => ChatId::Direct(self.sender_id),
        }
    }

    pub fn belongs_to(&self, chat: &ChatId) -> bool {
        match chat {
            ChatId::Group(group_id) => self.group_id.as_ref() == Some(group_id),
            ChatId::Direct(peer) => {
                self.group_id.is_none()
                    && (self.sender_id == *peer || self.recipient_id.as_ref() == Some(peer))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

/// A peer whose public key we hold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub identity: PeerIdentity,
    pub added_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            added_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &UserId {
        &self.identity.id
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// A group conversation. The key is shared out of band and never rotated.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub symmetric_key: SymmetricKey,
    pub members: BTreeSet<UserId>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("members", &self.members.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnvelopeId;

    fn message(sender: u8, recipient: Option<u8>, group: Option<GroupId>) -> Message {
        Message {
            id: EnvelopeId([0u8; 32]),
            sender_id: UserId([sender; 32]),
            recipient_id: recipient.map(|r| UserId([r; 32])),
            group_id: group,
            plaintext: "hi".into(),
            timestamp: 10,
            message_type: MessageType::Text,
            is_ephemeral: false,
            expires_at: None,
            is_expired: false,
        }
    }

    #[test]
    fn test_chat_id_direction() {
        let me = UserId([1u8; 32]);
        let outgoing = message(1, Some(2), None);
        let incoming = message(2, Some(1), None);

        assert_eq!(outgoing.chat_id(&me), ChatId::Direct(UserId([2u8; 32])));
        assert_eq!(incoming.chat_id(&me), ChatId::Direct(UserId([2u8; 32])));
        assert!(outgoing.belongs_to(&ChatId::Direct(UserId([2u8; 32]))));
        assert!(incoming.belongs_to(&ChatId::Direct(UserId([2u8; 32]))));
    }

    #[test]
    fn test_group_messages_not_in_direct_chat() {
        let group = GroupId::new();
        let msg = message(2, None, Some(group));
        assert!(msg.belongs_to(&ChatId::Group(group)));
        assert!(!msg.belongs_to(&ChatId::Direct(UserId([2u8; 32]))));
    }

    #[test]
    fn test_expiry() {
        let mut msg = message(1, Some(2), None);
        assert!(!msg.is_expired_at(i64::MAX));
        msg.expires_at = Some(100);
        assert!(!msg.is_expired_at(100));
        assert!(msg.is_expired_at(101));
    }
}
