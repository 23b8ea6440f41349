//! The single reducer over handshake events.
//!
//! Every change to a [`SessionState`]'s status or key presence goes through
//! [`reduce`], so the two can never drift apart.

use parley_crypto::PublicKeyBytes;

use crate::model::{ChatId, ChatStatus, ServerStatus, SessionState};

/// Closed set of state changes a conversation can undergo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// My `JoinChat(accepted = true)` returned. Starts a fresh cycle.
    InviteSent { server_status: ServerStatus },
    /// The peer accepted my invite.
    InviteAccepted,
    /// Either side refused.
    InviteRefused,
    /// Public keys became known. `None` leaves the current value.
    KeysLoaded {
        mine: Option<PublicKeyBytes>,
        theirs: Option<PublicKeyBytes>,
    },
    Expired,
    /// The server assigned a canonical id.
    IdReassigned { new_id: ChatId },
}

impl SessionEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::InviteSent { .. } => "invite_sent",
            Self::InviteAccepted => "invite_accepted",
            Self::InviteRefused => "invite_refused",
            Self::KeysLoaded { .. } => "keys_loaded",
            Self::Expired => "expired",
            Self::IdReassigned { .. } => "id_reassigned",
        }
    }
}

/// Apply `event` to `state`.
pub fn reduce(mut state: SessionState, event: SessionEvent) -> SessionState {
    let status = state.conversation.status;
    match event {
        SessionEvent::InviteSent { server_status } => {
            if status.is_terminal() {
                // Fresh cycle: nothing from the previous one carries over.
                state.my_public_key = None;
                state.counterpart_public_key = None;
                state.conversation.handshake_confirmed = false;
            }
            state.conversation.accepted_by_me = true;
            match server_status {
                ServerStatus::Pending => state.conversation.status = ChatStatus::Invited,
                ServerStatus::Active => {
                    state.conversation.handshake_confirmed = true;
                    state.conversation.status = ChatStatus::Invited;
                }
                ServerStatus::Blocked => block(&mut state),
            }
        }
        SessionEvent::InviteAccepted => {
            if !status.is_terminal() {
                state.conversation.handshake_confirmed = true;
            }
        }
        SessionEvent::InviteRefused => block(&mut state),
        SessionEvent::KeysLoaded { mine, theirs } => {
            if !status.is_terminal() {
                if mine.is_some() {
                    state.my_public_key = mine;
                }
                // A counterpart key is only trusted once the handshake is confirmed.
                if theirs.is_some() && state.conversation.handshake_confirmed {
                    state.counterpart_public_key = theirs;
                }
            }
        }
        SessionEvent::Expired => {
            state.my_public_key = None;
            state.counterpart_public_key = None;
            if status != ChatStatus::Blocked {
                state.conversation.status = ChatStatus::Expired;
            }
        }
        SessionEvent::IdReassigned { new_id } => state.conversation.chat_id = new_id,
    }
    promote(state)
}

fn block(state: &mut SessionState) {
    state.conversation.status = ChatStatus::Blocked;
    state.counterpart_public_key = None;
}

/// Enter `Active` once both keys are present on a confirmed handshake.
fn promote(mut state: SessionState) -> SessionState {
    let conversation = &mut state.conversation;
    if !conversation.status.is_terminal()
        && conversation.handshake_confirmed
        && state.my_public_key.is_some()
        && state.counterpart_public_key.is_some()
    {
        conversation.status = ChatStatus::Active;
    }
    normalize(state)
}

/// Demote an `Active` conversation that lost a key back to `Invited`.
pub fn normalize(mut state: SessionState) -> SessionState {
    if state.conversation.status == ChatStatus::Active && !state.has_both_keys() {
        state.conversation.status = ChatStatus::Invited;
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Conversation, UserId};
    use parley_crypto::ConversationKeyPair;

    fn fresh() -> SessionState {
        SessionState::new(Conversation::new(ChatId(5), UserId(2), "bob"))
    }

    fn key() -> PublicKeyBytes {
        ConversationKeyPair::generate().public_key()
    }

    fn run(events: &[SessionEvent]) -> SessionState {
        events.iter().fold(fresh(), |state, event| {
            let next = reduce(state, *event);
            assert!(next.is_consistent(), "inconsistent after {}: {next:?}", event.name());
            next
        })
    }

    #[test]
    fn invite_then_accept_then_keys_is_active() {
        let state = run(&[
            SessionEvent::InviteSent {
                server_status: ServerStatus::Pending,
            },
            SessionEvent::KeysLoaded {
                mine: Some(key()),
                theirs: None,
            },
        ]);
        assert_eq!(state.status(), ChatStatus::Invited);
        assert!(state.conversation.accepted_by_me);

        let state = reduce(state, SessionEvent::InviteAccepted);
        assert_eq!(state.status(), ChatStatus::Invited);

        let state = reduce(
            state,
            SessionEvent::KeysLoaded {
                mine: None,
                theirs: Some(key()),
            },
        );
        assert_eq!(state.status(), ChatStatus::Active);
        assert!(state.has_both_keys());
    }

    #[test]
    fn active_needs_both_keys() {
        let state = run(&[
            SessionEvent::InviteSent {
                server_status: ServerStatus::Active,
            },
            SessionEvent::KeysLoaded {
                mine: None,
                theirs: Some(key()),
            },
        ]);
        assert_eq!(state.status(), ChatStatus::Invited);
        assert!(state.my_public_key.is_none());
    }

    #[test]
    fn unconfirmed_counterpart_key_is_not_trusted() {
        let state = run(&[
            SessionEvent::InviteSent {
                server_status: ServerStatus::Pending,
            },
            SessionEvent::KeysLoaded {
                mine: Some(key()),
                theirs: Some(key()),
            },
        ]);
        assert_eq!(state.status(), ChatStatus::Invited);
        assert!(state.counterpart_public_key.is_none());
    }

    #[test]
    fn refuse_blocks_regardless_of_acceptance() {
        for accepted in [false, true] {
            let mut state = fresh();
            state.conversation.accepted_by_me = accepted;
            let state = reduce(state, SessionEvent::InviteRefused);
            assert_eq!(state.status(), ChatStatus::Blocked);
        }

        let active = run(&[
            SessionEvent::InviteSent {
                server_status: ServerStatus::Active,
            },
            SessionEvent::KeysLoaded {
                mine: Some(key()),
                theirs: Some(key()),
            },
            SessionEvent::InviteRefused,
        ]);
        assert_eq!(active.status(), ChatStatus::Blocked);
        assert!(active.counterpart_public_key.is_none());
    }

    #[test]
    fn terminal_states_ignore_late_events() {
        let expired = run(&[
            SessionEvent::InviteSent {
                server_status: ServerStatus::Active,
            },
            SessionEvent::Expired,
            SessionEvent::InviteAccepted,
            SessionEvent::KeysLoaded {
                mine: Some(key()),
                theirs: Some(key()),
            },
        ]);
        assert_eq!(expired.status(), ChatStatus::Expired);
        assert!(expired.my_public_key.is_none());

        let blocked = run(&[SessionEvent::InviteRefused, SessionEvent::Expired]);
        assert_eq!(blocked.status(), ChatStatus::Blocked);
    }

    #[test]
    fn invite_after_expiry_starts_fresh() {
        let state = run(&[
            SessionEvent::InviteSent {
                server_status: ServerStatus::Active,
            },
            SessionEvent::Expired,
            SessionEvent::InviteSent {
                server_status: ServerStatus::Pending,
            },
        ]);
        assert_eq!(state.status(), ChatStatus::Invited);
        assert!(!state.conversation.handshake_confirmed);
    }

    #[test]
    fn id_reassignment_keeps_everything_else() {
        let state = run(&[
            SessionEvent::InviteSent {
                server_status: ServerStatus::Pending,
            },
            SessionEvent::IdReassigned { new_id: ChatId(9) },
        ]);
        assert_eq!(state.chat_id(), ChatId(9));
        assert_eq!(state.status(), ChatStatus::Invited);
    }

    #[test]
    fn normalize_demotes_active_without_keys() {
        let mut state = fresh();
        state.conversation.status = ChatStatus::Active;
        state.my_public_key = Some(key());
        assert_eq!(normalize(state).status(), ChatStatus::Invited);
    }
}
