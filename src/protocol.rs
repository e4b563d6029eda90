use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Protocol version announced when nothing else is configured.
pub const DEFAULT_VERSION: u32 = 6;

/// Largest body chunk carried by a single body or replace-body packet.
pub const MILTER_CHUNK_SIZE: usize = 65535;

/// Upper bound on a frame length accepted from a peer.
pub const MAX_PACKET_SIZE: u32 = 64 * 1024 * 1024;

pub mod command {
    pub const ABORT: u8 = b'A';
    pub const BODY: u8 = b'B';
    pub const CONNECT: u8 = b'C';
    pub const DEFINE_MACRO: u8 = b'D';
    pub const END_OF_MESSAGE: u8 = b'E';
    pub const HELO: u8 = b'H';
    pub const QUIT_NEW_CONNECTION: u8 = b'K';
    pub const HEADER: u8 = b'L';
    pub const ENVELOPE_FROM: u8 = b'M';
    pub const END_OF_HEADER: u8 = b'N';
    pub const NEGOTIATE: u8 = b'O';
    pub const QUIT: u8 = b'Q';
    pub const ENVELOPE_RECIPIENT: u8 = b'R';
    pub const DATA: u8 = b'T';
    pub const UNKNOWN: u8 = b'U';
}

pub mod reply {
    pub const ADD_RECIPIENT: u8 = b'+';
    pub const DELETE_RECIPIENT: u8 = b'-';
    pub const ADD_RECIPIENT_WITH_PARAMETERS: u8 = b'2';
    pub const SHUTDOWN: u8 = b'4';
    pub const ACCEPT: u8 = b'a';
    pub const REPLACE_BODY: u8 = b'b';
    pub const CONTINUE: u8 = b'c';
    pub const DISCARD: u8 = b'd';
    pub const CHANGE_FROM: u8 = b'e';
    pub const CONNECTION_FAILURE: u8 = b'f';
    pub const ADD_HEADER: u8 = b'h';
    pub const INSERT_HEADER: u8 = b'i';
    pub const SET_SYMBOL_LIST: u8 = b'l';
    pub const CHANGE_HEADER: u8 = b'm';
    pub const NEGOTIATE: u8 = b'O';
    pub const PROGRESS: u8 = b'p';
    pub const QUARANTINE: u8 = b'q';
    pub const REJECT: u8 = b'r';
    pub const SKIP: u8 = b's';
    pub const TEMPORARY_FAILURE: u8 = b't';
    pub const REPLY_CODE: u8 = b'y';
}

bitflags! {
    /// Message modifications a filter asks to be allowed to make.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ActionFlags: u32 {
        const ADD_HEADERS = 0x0001;
        const CHANGE_BODY = 0x0002;
        const ADD_ENVELOPE_RECIPIENT = 0x0004;
        const DELETE_ENVELOPE_RECIPIENT = 0x0008;
        const CHANGE_HEADERS = 0x0010;
        const QUARANTINE = 0x0020;
        const CHANGE_ENVELOPE_FROM = 0x0040;
        const ADD_ENVELOPE_RECIPIENT_WITH_PARAMETERS = 0x0080;
        const SET_SYMBOL_LIST = 0x0100;
    }
}

bitflags! {
    /// Protocol steps: events a filter does not want, replies it will not
    /// send, and optional behaviours it can handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct StepFlags: u32 {
        const NO_CONNECT = 0x0000_0001;
        const NO_HELO = 0x0000_0002;
        const NO_ENVELOPE_FROM = 0x0000_0004;
        const NO_ENVELOPE_RECIPIENT = 0x0000_0008;
        const NO_BODY = 0x0000_0010;
        const NO_HEADERS = 0x0000_0020;
        const NO_END_OF_HEADER = 0x0000_0040;
        const NO_REPLY_HEADER = 0x0000_0080;
        const NO_UNKNOWN = 0x0000_0100;
        const NO_DATA = 0x0000_0200;
        const SKIP = 0x0000_0400;
        const ENVELOPE_RECIPIENT_REJECTED = 0x0000_0800;
        const NO_REPLY_CONNECT = 0x0000_1000;
        const NO_REPLY_HELO = 0x0000_2000;
        const NO_REPLY_ENVELOPE_FROM = 0x0000_4000;
        const NO_REPLY_ENVELOPE_RECIPIENT = 0x0000_8000;
        const NO_REPLY_DATA = 0x0001_0000;
        const NO_REPLY_UNKNOWN = 0x0002_0000;
        const NO_REPLY_END_OF_HEADER = 0x0004_0000;
        const NO_REPLY_BODY = 0x0008_0000;
        const HEADER_VALUE_WITH_LEADING_SPACE = 0x0010_0000;
    }
}

impl StepFlags {
    pub const NO_EVENT_MASK: StepFlags = StepFlags::from_bits_retain(
        StepFlags::NO_CONNECT.bits()
            | StepFlags::NO_HELO.bits()
            | StepFlags::NO_ENVELOPE_FROM.bits()
            | StepFlags::NO_ENVELOPE_RECIPIENT.bits()
            | StepFlags::NO_BODY.bits()
            | StepFlags::NO_HEADERS.bits()
            | StepFlags::NO_END_OF_HEADER.bits()
            | StepFlags::NO_UNKNOWN.bits()
            | StepFlags::NO_DATA.bits(),
    );

    pub const NO_REPLY_MASK: StepFlags = StepFlags::from_bits_retain(
        StepFlags::NO_REPLY_HEADER.bits()
            | StepFlags::NO_REPLY_CONNECT.bits()
            | StepFlags::NO_REPLY_HELO.bits()
            | StepFlags::NO_REPLY_ENVELOPE_FROM.bits()
            | StepFlags::NO_REPLY_ENVELOPE_RECIPIENT.bits()
            | StepFlags::NO_REPLY_DATA.bits()
            | StepFlags::NO_REPLY_UNKNOWN.bits()
            | StepFlags::NO_REPLY_END_OF_HEADER.bits()
            | StepFlags::NO_REPLY_BODY.bits(),
    );

    /// Steps that are only honoured when every participant can live with them.
    pub const NO_MASK: StepFlags =
        StepFlags::from_bits_retain(Self::NO_EVENT_MASK.bits() | Self::NO_REPLY_MASK.bits());

    /// Capabilities that are enabled as soon as one participant needs them.
    pub const YES_MASK: StepFlags = StepFlags::from_bits_retain(
        StepFlags::SKIP.bits()
            | StepFlags::ENVELOPE_RECIPIENT_REJECTED.bits()
            | StepFlags::HEADER_VALUE_WITH_LEADING_SPACE.bits(),
    );
}

/// Result of handling one protocol event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Continue,
    Reject,
    Discard,
    Accept,
    TemporaryFailure,
    Skip,
    AllOptions,
    Progress,
    NoReply,
    NotChange,
    Default,
    Abort,
}

impl Status {
    /// Position in the aggregation order. Zero means the status never wins.
    pub fn rank(self) -> u8 {
        match self {
            Status::Reject => 6,
            Status::Discard => 5,
            Status::TemporaryFailure => 4,
            Status::Accept => 3,
            Status::Continue => 2,
            Status::Skip => 1,
            Status::AllOptions
            | Status::Progress
            | Status::NoReply
            | Status::NotChange
            | Status::Default
            | Status::Abort => 0,
        }
    }

    /// Ends processing of the current message (or connection) for whoever
    /// returned it.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Reject | Status::Discard | Status::Accept | Status::TemporaryFailure
        )
    }

    /// Carries no opinion in an aggregation.
    pub fn is_abstention(self) -> bool {
        self.rank() == 0
    }

    /// Accumulator used when several participants answer the same event.
    pub fn accumulate(self, other: Status) -> Status {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    /// Reduces a set of statuses, `None` when every one abstains.
    pub fn aggregate<I>(statuses: I) -> Option<Status>
    where
        I: IntoIterator<Item = Status>,
    {
        let winner = statuses
            .into_iter()
            .fold(Status::NotChange, Status::accumulate);
        if winner.is_abstention() {
            None
        } else {
            Some(winner)
        }
    }

    /// Whether the status maps onto a reply packet the MTA understands.
    pub fn is_replyable(self) -> bool {
        self.rank() > 0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Continue => "continue",
            Status::Reject => "reject",
            Status::Discard => "discard",
            Status::Accept => "accept",
            Status::TemporaryFailure => "temporary-failure",
            Status::Skip => "skip",
            Status::AllOptions => "all-options",
            Status::Progress => "progress",
            Status::NoReply => "no-reply",
            Status::NotChange => "not-change",
            Status::Default => "default",
            Status::Abort => "abort",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "continue" => Status::Continue,
            "reject" => Status::Reject,
            "discard" => Status::Discard,
            "accept" => Status::Accept,
            "temporary-failure" | "tempfail" => Status::TemporaryFailure,
            "skip" => Status::Skip,
            "all-options" => Status::AllOptions,
            "progress" => Status::Progress,
            "no-reply" => Status::NoReply,
            "not-change" => Status::NotChange,
            "default" => Status::Default,
            "abort" => Status::Abort,
            other => return Err(format!("unknown status: {other}")),
        };
        Ok(status)
    }
}

/// Protocol phase of an SMTP transaction as seen by a milter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Start,
    Negotiate,
    Connect,
    Helo,
    EnvelopeFrom,
    EnvelopeRecipient,
    Data,
    Unknown,
    Header,
    EndOfHeader,
    Body,
    EndOfMessage,
    Abort,
    Quit,
    Finished,
}

impl Phase {
    /// Command byte that carries this phase; also the macro context byte.
    pub fn command_code(self) -> Option<u8> {
        let code = match self {
            Phase::Negotiate => command::NEGOTIATE,
            Phase::Connect => command::CONNECT,
            Phase::Helo => command::HELO,
            Phase::EnvelopeFrom => command::ENVELOPE_FROM,
            Phase::EnvelopeRecipient => command::ENVELOPE_RECIPIENT,
            Phase::Data => command::DATA,
            Phase::Unknown => command::UNKNOWN,
            Phase::Header => command::HEADER,
            Phase::EndOfHeader => command::END_OF_HEADER,
            Phase::Body => command::BODY,
            Phase::EndOfMessage => command::END_OF_MESSAGE,
            Phase::Abort => command::ABORT,
            Phase::Quit => command::QUIT,
            Phase::Start | Phase::Finished => return None,
        };
        Some(code)
    }

    /// Phase named by a define-macro context byte.
    pub fn from_macro_context(code: u8) -> Option<Phase> {
        let phase = match code {
            command::CONNECT => Phase::Connect,
            command::HELO => Phase::Helo,
            command::ENVELOPE_FROM => Phase::EnvelopeFrom,
            command::ENVELOPE_RECIPIENT => Phase::EnvelopeRecipient,
            command::DATA => Phase::Data,
            command::UNKNOWN => Phase::Unknown,
            command::HEADER => Phase::Header,
            command::END_OF_HEADER => Phase::EndOfHeader,
            command::BODY => Phase::Body,
            command::END_OF_MESSAGE => Phase::EndOfMessage,
            _ => return None,
        };
        Some(phase)
    }

    /// Step bit a participant sets to not receive this event at all.
    pub fn no_event_step(self) -> Option<StepFlags> {
        let step = match self {
            Phase::Connect => StepFlags::NO_CONNECT,
            Phase::Helo => StepFlags::NO_HELO,
            Phase::EnvelopeFrom => StepFlags::NO_ENVELOPE_FROM,
            Phase::EnvelopeRecipient => StepFlags::NO_ENVELOPE_RECIPIENT,
            Phase::Data => StepFlags::NO_DATA,
            Phase::Unknown => StepFlags::NO_UNKNOWN,
            Phase::Header => StepFlags::NO_HEADERS,
            Phase::EndOfHeader => StepFlags::NO_END_OF_HEADER,
            Phase::Body => StepFlags::NO_BODY,
            _ => return None,
        };
        Some(step)
    }

    /// Step bit a participant sets to receive this event without replying.
    pub fn no_reply_step(self) -> Option<StepFlags> {
        let step = match self {
            Phase::Connect => StepFlags::NO_REPLY_CONNECT,
            Phase::Helo => StepFlags::NO_REPLY_HELO,
            Phase::EnvelopeFrom => StepFlags::NO_REPLY_ENVELOPE_FROM,
            Phase::EnvelopeRecipient => StepFlags::NO_REPLY_ENVELOPE_RECIPIENT,
            Phase::Data => StepFlags::NO_REPLY_DATA,
            Phase::Unknown => StepFlags::NO_REPLY_UNKNOWN,
            Phase::Header => StepFlags::NO_REPLY_HEADER,
            Phase::EndOfHeader => StepFlags::NO_REPLY_END_OF_HEADER,
            Phase::Body => StepFlags::NO_REPLY_BODY,
            _ => return None,
        };
        Some(step)
    }

    /// Stage used in macro request lists.
    pub fn macro_stage(self) -> Option<MacroStage> {
        let stage = match self {
            Phase::Connect => MacroStage::Connect,
            Phase::Helo => MacroStage::Helo,
            Phase::EnvelopeFrom => MacroStage::EnvelopeFrom,
            Phase::EnvelopeRecipient => MacroStage::EnvelopeRecipient,
            Phase::Data => MacroStage::Data,
            Phase::EndOfMessage => MacroStage::EndOfMessage,
            Phase::EndOfHeader => MacroStage::EndOfHeader,
            _ => return None,
        };
        Some(stage)
    }

    /// Phases that expect a reply packet from the filter side.
    pub fn expects_reply(self) -> bool {
        !matches!(
            self,
            Phase::Start | Phase::Abort | Phase::Quit | Phase::Finished
        )
    }

    /// Phases that belong to a message transaction.
    pub fn is_message(self) -> bool {
        matches!(
            self,
            Phase::EnvelopeFrom
                | Phase::EnvelopeRecipient
                | Phase::Data
                | Phase::Header
                | Phase::EndOfHeader
                | Phase::Body
                | Phase::EndOfMessage
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::Negotiate => "negotiate",
            Phase::Connect => "connect",
            Phase::Helo => "helo",
            Phase::EnvelopeFrom => "envelope-from",
            Phase::EnvelopeRecipient => "envelope-recipient",
            Phase::Data => "data",
            Phase::Unknown => "unknown",
            Phase::Header => "header",
            Phase::EndOfHeader => "end-of-header",
            Phase::Body => "body",
            Phase::EndOfMessage => "end-of-message",
            Phase::Abort => "abort",
            Phase::Quit => "quit",
            Phase::Finished => "finished",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage numbers used by the set-symbol-list extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MacroStage {
    Connect = 0,
    Helo = 1,
    EnvelopeFrom = 2,
    EnvelopeRecipient = 3,
    Data = 4,
    EndOfMessage = 5,
    EndOfHeader = 6,
}

impl MacroStage {
    pub fn from_u32(value: u32) -> Option<MacroStage> {
        let stage = match value {
            0 => MacroStage::Connect,
            1 => MacroStage::Helo,
            2 => MacroStage::EnvelopeFrom,
            3 => MacroStage::EnvelopeRecipient,
            4 => MacroStage::Data,
            5 => MacroStage::EndOfMessage,
            6 => MacroStage::EndOfHeader,
            _ => return None,
        };
        Some(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOTING: [Status; 6] = [
        Status::Reject,
        Status::Discard,
        Status::TemporaryFailure,
        Status::Accept,
        Status::Continue,
        Status::Skip,
    ];

    #[test]
    fn test_precedence_order() {
        assert!(Status::Reject.rank() > Status::Discard.rank());
        assert!(Status::Discard.rank() > Status::TemporaryFailure.rank());
        assert!(Status::TemporaryFailure.rank() > Status::Accept.rank());
        assert!(Status::Accept.rank() > Status::Continue.rank());
        assert!(Status::Continue.rank() > Status::Skip.rank());
        for sentinel in [Status::NotChange, Status::Default, Status::Progress] {
            assert!(sentinel.is_abstention());
        }
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        // every ordered pair and triple of voting statuses
        for a in VOTING {
            for b in VOTING {
                for c in VOTING {
                    let forward = Status::aggregate([a, b, c]);
                    let backward = Status::aggregate([c, b, a]);
                    let rotated = Status::aggregate([b, c, a]);
                    assert_eq!(forward, backward);
                    assert_eq!(forward, rotated);
                    let expected = [a, b, c].into_iter().max_by_key(|s| s.rank());
                    assert_eq!(forward, expected);
                }
            }
        }
    }

    #[test]
    fn test_aggregate_ignores_sentinels() {
        assert_eq!(
            Status::aggregate([Status::NotChange, Status::Default]),
            None
        );
        assert_eq!(
            Status::aggregate([Status::NotChange, Status::Continue, Status::Progress]),
            Some(Status::Continue)
        );
        assert_eq!(Status::aggregate(Vec::new()), None);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("temporary-failure".parse::<Status>(), Ok(Status::TemporaryFailure));
        assert_eq!("TEMPFAIL".parse::<Status>(), Ok(Status::TemporaryFailure));
        assert_eq!("not_change".parse::<Status>(), Ok(Status::NotChange));
        assert!("maybe".parse::<Status>().is_err());
    }

    #[test]
    fn test_step_masks_are_disjoint() {
        assert!(StepFlags::NO_EVENT_MASK
            .intersection(StepFlags::NO_REPLY_MASK)
            .is_empty());
        assert!(StepFlags::NO_MASK.intersection(StepFlags::YES_MASK).is_empty());
        assert_eq!(
            StepFlags::NO_MASK.union(StepFlags::YES_MASK),
            StepFlags::all()
        );
    }

    #[test]
    fn test_phase_tables() {
        assert_eq!(Phase::from_macro_context(b'M'), Some(Phase::EnvelopeFrom));
        assert_eq!(Phase::from_macro_context(b'Z'), None);
        assert_eq!(Phase::Body.no_reply_step(), Some(StepFlags::NO_REPLY_BODY));
        assert_eq!(Phase::EndOfMessage.no_event_step(), None);
        assert_eq!(Phase::EndOfHeader.macro_stage(), Some(MacroStage::EndOfHeader));
        assert!(!Phase::Quit.expects_reply());
    }
}
