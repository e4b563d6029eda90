//! Protocol state machine shared by the MTA-facing session and every
//! upstream child connection.

use crate::error::ContextError;
use crate::protocol::Phase;
use std::fmt;

/// Which side of the milter conversation an agent plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Talks to the MTA; receives commands, sends replies.
    Downstream,
    /// Talks to a child filter; sends commands, receives replies.
    Upstream,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Downstream => "session",
            Role::Upstream => "child",
        }
    }
}

/// Current phase and whether it has been answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    pub phase: Phase,
    pub replied: bool,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.replied && self.phase.expects_reply() {
            write!(f, "{}-replied", self.phase)
        } else {
            write!(f, "{}", self.phase)
        }
    }
}

fn ordinal(phase: Phase) -> u8 {
    match phase {
        Phase::Start => 0,
        Phase::Negotiate => 1,
        Phase::Connect => 2,
        Phase::Helo => 3,
        Phase::EnvelopeFrom => 4,
        Phase::EnvelopeRecipient => 5,
        Phase::Data => 6,
        Phase::Header => 7,
        Phase::EndOfHeader => 8,
        Phase::Body => 9,
        Phase::EndOfMessage => 10,
        Phase::Unknown | Phase::Abort | Phase::Quit => 11,
        Phase::Finished => 12,
    }
}

fn repeatable(phase: Phase) -> bool {
    matches!(
        phase,
        Phase::Helo | Phase::EnvelopeRecipient | Phase::Header | Phase::Body
    )
}

/// Ordering rules for one milter conversation.
///
/// Phases only move forward, skipping is allowed because either side may
/// negotiate events away. HELO, recipients, headers and body chunks repeat.
/// `unknown` may arrive at any point after connect without moving the
/// position. A new message may start once the previous one was answered
/// at end-of-message or aborted.
#[derive(Debug)]
pub struct Agent {
    role: Role,
    tag: String,
    state: State,
    position: Phase,
    in_message: bool,
}

impl Agent {
    pub fn new(role: Role, name: impl fmt::Display) -> Self {
        Agent {
            role,
            tag: format!("[{}][{}]", role.as_str(), name),
            state: State {
                phase: Phase::Start,
                replied: false,
            },
            position: Phase::Start,
            in_message: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Prefix for log lines about this conversation.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn in_message(&self) -> bool {
        self.in_message
    }

    pub fn is_finished(&self) -> bool {
        self.state.phase == Phase::Finished
    }

    /// Whether `phase` may be entered from the current state.
    pub fn can_enter(&self, phase: Phase) -> bool {
        if self.is_finished() {
            return false;
        }
        match phase {
            Phase::Start | Phase::Finished => false,
            Phase::Quit => true,
            Phase::Negotiate => self.position == Phase::Start,
            Phase::Unknown | Phase::Abort => ordinal(self.position) >= ordinal(Phase::Connect),
            Phase::Connect => ordinal(self.position) < ordinal(Phase::Connect),
            Phase::Helo | Phase::EnvelopeFrom if !self.in_message => {
                ordinal(self.position) >= ordinal(Phase::Negotiate)
                    && (ordinal(phase) > ordinal(self.position)
                        || (phase == self.position && repeatable(phase))
                        || self.position == Phase::EndOfMessage)
            }
            Phase::Helo | Phase::EnvelopeFrom => false,
            _ => {
                self.in_message
                    && (ordinal(phase) > ordinal(self.position)
                        || (phase == self.position && repeatable(phase)))
            }
        }
    }

    /// Moves to `phase`, failing without side effects if the protocol
    /// forbids it.
    pub fn enter(&mut self, phase: Phase) -> Result<(), ContextError> {
        if !self.can_enter(phase) {
            return Err(ContextError::invalid_state(phase.as_str(), self.state));
        }
        log::trace!("{} {} -> {}", self.tag, self.state, phase);
        self.state = State {
            phase,
            replied: false,
        };
        match phase {
            Phase::EnvelopeFrom => {
                self.in_message = true;
                self.position = phase;
            }
            Phase::Abort => {
                self.in_message = false;
                self.position = Phase::EndOfMessage;
            }
            Phase::Unknown | Phase::Quit => {}
            _ => self.position = phase,
        }
        Ok(())
    }

    /// Marks the current phase as answered.
    pub fn reply(&mut self) -> Result<(), ContextError> {
        if self.state.replied || !self.state.phase.expects_reply() {
            return Err(ContextError::invalid_state("reply", self.state));
        }
        self.state.replied = true;
        if self.state.phase == Phase::EndOfMessage {
            self.in_message = false;
        }
        Ok(())
    }

    /// Ends the message early, as a terminal reply inside a message does.
    pub fn close_message(&mut self) {
        if self.in_message {
            self.in_message = false;
            self.position = Phase::EndOfMessage;
        }
    }

    /// Back to the state right after negotiation, for a reused connection.
    pub fn reset_connection(&mut self) {
        self.state = State {
            phase: Phase::Negotiate,
            replied: true,
        };
        self.position = Phase::Negotiate;
        self.in_message = false;
    }

    pub fn finish(&mut self) {
        self.state = State {
            phase: Phase::Finished,
            replied: false,
        };
        self.in_message = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(agent: &mut Agent, phases: &[Phase]) {
        for phase in phases {
            agent.enter(*phase).unwrap();
            if phase.expects_reply() {
                agent.reply().unwrap();
            }
        }
    }

    #[test]
    fn test_full_transaction() {
        let mut agent = Agent::new(Role::Downstream, 1);
        walk(
            &mut agent,
            &[
                Phase::Negotiate,
                Phase::Connect,
                Phase::Helo,
                Phase::EnvelopeFrom,
                Phase::EnvelopeRecipient,
                Phase::EnvelopeRecipient,
                Phase::Data,
                Phase::Header,
                Phase::Header,
                Phase::EndOfHeader,
                Phase::Body,
                Phase::Body,
                Phase::EndOfMessage,
                // second message on the same connection
                Phase::EnvelopeFrom,
                Phase::EnvelopeRecipient,
                Phase::EndOfMessage,
                Phase::Quit,
            ],
        );
        assert!(!agent.in_message());
    }

    #[test]
    fn test_out_of_order_is_rejected() {
        let mut agent = Agent::new(Role::Upstream, "spamd");
        walk(&mut agent, &[Phase::Negotiate, Phase::Connect]);
        let err = agent.enter(Phase::Header).unwrap_err();
        assert!(matches!(err, ContextError::InvalidState { .. }));
        // failed transition leaves the state alone
        assert_eq!(agent.phase(), Phase::Connect);

        walk(&mut agent, &[Phase::Helo, Phase::EnvelopeFrom, Phase::Data]);
        assert!(agent.enter(Phase::EnvelopeRecipient).is_err());
        assert!(agent.enter(Phase::Connect).is_err());
    }

    #[test]
    fn test_abort_inside_message() {
        let mut agent = Agent::new(Role::Downstream, 7);
        walk(
            &mut agent,
            &[
                Phase::Negotiate,
                Phase::Connect,
                Phase::EnvelopeFrom,
                Phase::EnvelopeRecipient,
                Phase::Header,
            ],
        );
        agent.enter(Phase::Abort).unwrap();
        assert!(!agent.in_message());
        assert!(agent.reply().is_err());
        assert!(agent.enter(Phase::Body).is_err());
        agent.enter(Phase::EnvelopeFrom).unwrap();
        assert!(agent.in_message());
    }

    #[test]
    fn test_unknown_does_not_move_position() {
        let mut agent = Agent::new(Role::Downstream, 2);
        walk(
            &mut agent,
            &[
                Phase::Negotiate,
                Phase::Connect,
                Phase::EnvelopeFrom,
                Phase::Unknown,
                Phase::EnvelopeRecipient,
            ],
        );
        assert_eq!(agent.phase(), Phase::EnvelopeRecipient);
        assert!(agent.enter(Phase::Unknown).is_ok());
    }

    #[test]
    fn test_double_reply_is_rejected() {
        let mut agent = Agent::new(Role::Downstream, 3);
        agent.enter(Phase::Negotiate).unwrap();
        agent.reply().unwrap();
        assert!(agent.reply().is_err());
        assert_eq!(agent.state().to_string(), "negotiate-replied");
    }

    #[test]
    fn test_finished_accepts_nothing() {
        let mut agent = Agent::new(Role::Downstream, 4);
        agent.finish();
        assert!(agent.enter(Phase::Quit).is_err());
        assert!(agent.enter(Phase::Negotiate).is_err());
    }

    #[test]
    fn test_reset_connection_allows_new_session() {
        let mut agent = Agent::new(Role::Downstream, 5);
        walk(
            &mut agent,
            &[Phase::Negotiate, Phase::Connect, Phase::Helo, Phase::EnvelopeFrom],
        );
        agent.reset_connection();
        walk(&mut agent, &[Phase::Connect, Phase::Helo]);
    }
}
