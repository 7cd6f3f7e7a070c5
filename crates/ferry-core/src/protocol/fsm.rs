//! Per-channel state machine
//!
//! `INIT -> AUTHENT -> REQUEST -> DATA* -> END_TRANSFER -> END_REQUEST -> CLOSE`,
//! with `ERROR` reachable from any live state. Incoming packets are checked
//! against [`transition`]; anything not listed is a protocol error.
//!
//! AUTHENT takes three packets: the requester's hello with a challenge, the
//! responder's answer with its proof and own challenge, then the requester's
//! proof. The responder thus sees two AUTHENT packets, the requester one.

use super::packet::PacketType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Init,
    Authent,
    Request,
    Data,
    EndTransfer,
    EndRequest,
    Close,
    Error,
}

impl ChannelState {
    pub fn is_authenticated(self) -> bool {
        matches!(
            self,
            ChannelState::Request | ChannelState::Data | ChannelState::EndTransfer | ChannelState::EndRequest
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, ChannelState::Close | ChannelState::Error)
    }
}

/// What the channel handler must do with an accepted packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Authenticate,
    Request,
    Data,
    EndTransfer,
    EndRequest,
    /// Receiver confirmed blocks up to a rank
    Ack,
    /// Answer to a control request
    Valid,
    /// Out-of-band control (stop, cancel, bandwidth, ...)
    Control,
    RemoteError,
}

/// Transition table keyed by (state, packet type)
pub fn transition(state: ChannelState, kind: PacketType) -> Option<(Action, ChannelState)> {
    use ChannelState as S;
    use PacketType as P;

    if state.is_finished() {
        return None;
    }

    let next = match (state, kind) {
        (_, P::Error) => (Action::RemoteError, S::Error),

        (S::Init, P::Authent) => (Action::Authenticate, S::Authent),
        (S::Authent, P::Authent) => (Action::Authenticate, S::Request),

        (S::Request, P::Request) => (Action::Request, S::Data),
        (S::Request, P::Valid) => (Action::Valid, S::Close),

        (S::Data, P::Data) => (Action::Data, S::Data),
        (S::Data, P::EndTransfer) => (Action::EndTransfer, S::EndTransfer),
        (S::Data, P::RankAck) => (Action::Ack, S::Data),

        (S::EndTransfer, P::EndTransfer) => (Action::EndTransfer, S::EndRequest),
        (S::EndTransfer, P::EndRequest) | (S::EndRequest, P::EndRequest) => (Action::EndRequest, S::Close),

        (_, P::KeepAlive) => (Action::Control, state),

        // Aborting controls end the channel they arrive on.
        (s, P::Stop | P::Cancel | P::Shutdown) if s.is_authenticated() => (Action::Control, S::Close),

        // Informational and shared-state controls leave the channel as is.
        (s, P::Bandwidth | P::Test | P::Information | P::Business | P::Block) if s.is_authenticated() => {
            (Action::Control, s)
        }

        _ => return None,
    };
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChannelState as S;
    use PacketType as P;

    #[test]
    fn happy_path_reaches_close() {
        let mut state = S::Init;
        for (kind, expected) in [
            (P::Authent, Action::Authenticate),
            (P::Authent, Action::Authenticate),
            (P::Request, Action::Request),
            (P::Data, Action::Data),
            (P::RankAck, Action::Ack),
            (P::Data, Action::Data),
            (P::EndTransfer, Action::EndTransfer),
            (P::EndTransfer, Action::EndTransfer),
            (P::EndRequest, Action::EndRequest),
        ] {
            let (action, next) = transition(state, kind).unwrap();
            assert_eq!(action, expected, "in {state:?} on {kind:?}");
            state = next;
        }
        assert_eq!(state, S::Close);
    }

    #[test]
    fn data_before_request_is_rejected() {
        assert_eq!(transition(S::Init, P::Data), None);
        assert_eq!(transition(S::Authent, P::Data), None);
        assert_eq!(transition(S::Authent, P::Request), None);
        assert_eq!(transition(S::Request, P::Data), None);
        assert_eq!(transition(S::Data, P::Request), None);
        assert_eq!(transition(S::Request, P::RankAck), None);
        assert_eq!(transition(S::EndRequest, P::RankAck), None);
    }

    #[test]
    fn controls_need_authentication() {
        assert_eq!(transition(S::Init, P::Stop), None);
        assert_eq!(transition(S::Init, P::Bandwidth), None);
        assert_eq!(transition(S::Data, P::Stop), Some((Action::Control, S::Close)));
        assert_eq!(transition(S::Data, P::Bandwidth), Some((Action::Control, S::Data)));
        assert_eq!(transition(S::Init, P::KeepAlive), Some((Action::Control, S::Init)));
    }

    #[test]
    fn error_is_reachable_from_every_live_state() {
        for state in [S::Init, S::Authent, S::Request, S::Data, S::EndTransfer, S::EndRequest] {
            assert_eq!(transition(state, P::Error), Some((Action::RemoteError, S::Error)));
        }
        assert_eq!(transition(S::Close, P::Error), None);
        assert_eq!(transition(S::Error, P::KeepAlive), None);
    }
}
