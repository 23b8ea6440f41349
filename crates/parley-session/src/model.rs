//! Conversation data model.

use std::fmt;
use std::str::FromStr;

use parley_crypto::PublicKeyBytes;
use serde::{Deserialize, Serialize};

/// Server-assigned conversation id. `0` means "not yet created".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub u64);

impl ChatId {
    pub const UNASSIGNED: Self = Self(0);

    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local handshake status of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatStatus {
    NoSession,
    /// I sent the invite; waiting for the peer.
    Invited,
    /// The peer invited me; waiting for my decision.
    AwaitingMyAcceptance,
    Active,
    Blocked,
    Expired,
}

impl ChatStatus {
    /// `Blocked` and `Expired` end the handshake for this chat id.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Blocked | Self::Expired)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoSession => "no_session",
            Self::Invited => "invited",
            Self::AwaitingMyAcceptance => "awaiting_my_acceptance",
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chat status as reported by the server in `JoinChat` replies and the
/// conversation list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerStatus {
    Pending,
    Active,
    Blocked,
}

impl ServerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Active => "Active",
            Self::Blocked => "Blocked",
        }
    }
}

impl FromStr for ServerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "blocked" => Ok(Self::Blocked),
            other => Err(format!("unknown chat status: {other}")),
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and handshake progress of one encrypted channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub chat_id: ChatId,
    pub counterpart_id: UserId,
    pub counterpart_name: String,
    pub status: ChatStatus,
    pub accepted_by_me: bool,
    /// The server or the peer has acknowledged the invite.
    pub handshake_confirmed: bool,
}

impl Conversation {
    pub fn new(chat_id: ChatId, counterpart_id: UserId, counterpart_name: impl Into<String>) -> Self {
        Self {
            chat_id,
            counterpart_id,
            counterpart_name: counterpart_name.into(),
            status: ChatStatus::NoSession,
            accepted_by_me: false,
            handshake_confirmed: false,
        }
    }
}

/// Everything the client knows about one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub conversation: Conversation,
    pub my_public_key: Option<PublicKeyBytes>,
    pub counterpart_public_key: Option<PublicKeyBytes>,
}

impl SessionState {
    pub const fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            my_public_key: None,
            counterpart_public_key: None,
        }
    }

    /// Initial state for a conversation reported by the conversation list.
    /// Keys are never known up front, so a server-side `Active` chat starts
    /// out confirmed but `Invited` until both keys load.
    pub fn from_summary(summary: &ConversationSummary) -> Self {
        let mut conversation = Conversation::new(
            summary.chat_id,
            summary.counterpart_id,
            summary.counterpart_name.clone(),
        );
        conversation.accepted_by_me = summary.accepted_by_me;
        conversation.status = if summary.chat_id.is_assigned() {
            match summary.server_status {
                ServerStatus::Pending if summary.accepted_by_me => ChatStatus::Invited,
                ServerStatus::Pending => ChatStatus::AwaitingMyAcceptance,
                ServerStatus::Active => {
                    conversation.handshake_confirmed = true;
                    ChatStatus::Invited
                }
                ServerStatus::Blocked => ChatStatus::Blocked,
            }
        } else {
            ChatStatus::NoSession
        };
        Self::new(conversation)
    }

    pub const fn chat_id(&self) -> ChatId {
        self.conversation.chat_id
    }

    pub const fn status(&self) -> ChatStatus {
        self.conversation.status
    }

    pub const fn has_both_keys(&self) -> bool {
        self.my_public_key.is_some() && self.counterpart_public_key.is_some()
    }

    /// `Active` exactly when both public keys are present.
    pub const fn is_consistent(&self) -> bool {
        matches!(self.conversation.status, ChatStatus::Active) == self.has_both_keys()
    }
}

/// One row of the conversation-list collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub chat_id: ChatId,
    pub counterpart_id: UserId,
    pub counterpart_name: String,
    pub server_status: ServerStatus,
    pub accepted_by_me: bool,
}

/// An invitation surfaced by `NotifyReceiver`, waiting for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingInvitation {
    pub creator_id: UserId,
    pub chat_id: ChatId,
    pub received_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Whose public key a stored ciphertext was sealed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyOwner {
    Own,
    Counterpart,
}

/// One stored message. Ciphertext is base64 exactly as sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    pub id: i64,
    pub direction: Direction,
    pub ciphertext: String,
    pub encrypted_under: KeyOwner,
    pub received_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Undecryptable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub id: i64,
    pub direction: Direction,
    pub body: MessageBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(status: ServerStatus, accepted_by_me: bool) -> ConversationSummary {
        ConversationSummary {
            chat_id: ChatId(5),
            counterpart_id: UserId(2),
            counterpart_name: "bob".into(),
            server_status: status,
            accepted_by_me,
        }
    }

    #[test]
    fn server_status_parses_case_insensitively() {
        assert_eq!("Pending".parse::<ServerStatus>(), Ok(ServerStatus::Pending));
        assert_eq!("ACTIVE".parse::<ServerStatus>(), Ok(ServerStatus::Active));
        assert_eq!("blocked".parse::<ServerStatus>(), Ok(ServerStatus::Blocked));
        assert!("gone".parse::<ServerStatus>().is_err());
    }

    #[test]
    fn summary_maps_to_local_status() {
        let cases = [
            (ServerStatus::Pending, true, ChatStatus::Invited),
            (ServerStatus::Pending, false, ChatStatus::AwaitingMyAcceptance),
            (ServerStatus::Active, true, ChatStatus::Invited),
            (ServerStatus::Blocked, true, ChatStatus::Blocked),
        ];
        for (server, accepted, expected) in cases {
            let state = SessionState::from_summary(&summary(server, accepted));
            assert_eq!(state.status(), expected, "{server} accepted={accepted}");
            assert!(state.is_consistent());
        }
    }

    #[test]
    fn unassigned_summary_has_no_session() {
        let mut s = summary(ServerStatus::Pending, true);
        s.chat_id = ChatId::UNASSIGNED;
        assert_eq!(SessionState::from_summary(&s).status(), ChatStatus::NoSession);
    }

    #[test]
    fn message_serializes_camel_case() {
        let msg = EncryptedMessage {
            id: 7,
            direction: Direction::Outbound,
            ciphertext: "AAAA".into(),
            encrypted_under: KeyOwner::Own,
            received_at: 7,
        };
        let json = serde_json::to_string(&msg).unwrap_or_default();
        assert!(json.contains("\"encryptedUnder\":\"Own\""));
        assert!(json.contains("\"receivedAt\":7"));
    }
}
