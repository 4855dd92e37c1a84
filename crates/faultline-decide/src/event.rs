//! Decision event codes.
//!
//! Every question the harness asks is tagged by one of these events. The
//! one-letter code is what appears in the decision trace; the ordinal is
//! the token recorded in the visited trie.

/// Trie token recorded after a decision that let the operation proceed.
pub const SUCCESS_TOKEN: u32 = 20;

/// Trie token recorded after a decision that injected a fault.
pub const FAILURE_TOKEN: u32 = 21;

/// A nondeterministic question asked by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Bytes handed to a `getrandom` call.
    Random,
    /// Which actor runs next.
    NextNode,
    /// Whether a queued proxy message is released now.
    SendMsg,
    /// Whether a node dies on send.
    Send,
    /// Whether a node dies on connect.
    Connect,
    /// Whether a node's write is torn.
    Write,
    /// Whether a node dies on fsync.
    FsyncFail,
    /// Whether pending renames are committed by an fsync.
    FsyncRename,
    /// Whether a dead node comes back.
    Revive,
    /// Whether a client dies on send.
    ClientSend,
    /// Whether a client dies on connect.
    ClientConnect,
}

impl Event {
    /// All events in ordinal order.
    pub const ALL: [Event; 11] = [
        Event::Random,
        Event::NextNode,
        Event::SendMsg,
        Event::Send,
        Event::Connect,
        Event::Write,
        Event::FsyncFail,
        Event::FsyncRename,
        Event::Revive,
        Event::ClientSend,
        Event::ClientConnect,
    ];

    /// The character tagging this event in a decision trace.
    pub const fn code(self) -> char {
        match self {
            Event::Random => 'r',
            Event::NextNode => 'n',
            Event::SendMsg => 'm',
            Event::Send => 's',
            Event::Connect => 'c',
            Event::Write => 'w',
            Event::FsyncFail => 'f',
            Event::FsyncRename => 'a',
            Event::Revive => 'v',
            Event::ClientSend => 'p',
            Event::ClientConnect => 'q',
        }
    }

    /// Looks up an event by its trace character.
    pub fn from_code(code: char) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.code() == code)
    }

    /// The token used for this event in the visited trie.
    pub const fn token(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique_and_round_trip() {
        for event in Event::ALL {
            assert_eq!(Event::from_code(event.code()), Some(event));
        }
        assert_eq!(Event::from_code('x'), None);
    }

    #[test]
    fn tokens_follow_declaration_order() {
        assert_eq!(Event::Random.token(), 0);
        assert_eq!(Event::SendMsg.token(), 2);
        assert_eq!(Event::ClientConnect.token(), 10);
        assert!(Event::ALL.iter().all(|e| e.token() < SUCCESS_TOKEN));
    }
}
