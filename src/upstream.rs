//! Manager side of a conversation with one child filter.

use crate::agent::{Agent, Role};
use crate::codec::{encode_command, Command, MacroRequests, MtaCodec, Reply};
use crate::error::{CodecError, ContextError};
use crate::macros::{filter_requested, MacroMap};
use crate::option::MilterOption;
use crate::protocol::{ActionFlags, Phase, Status};
use crate::socket::{BoxedStream, ConnectionSpec};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;

/// Opens streams to child filters.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, spec: &ConnectionSpec) -> io::Result<BoxedStream>;
}

/// Connects over real unix or TCP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketConnector;

#[async_trait]
impl Connector for SocketConnector {
    async fn connect(&self, spec: &ConnectionSpec) -> io::Result<BoxedStream> {
        spec.connect().await
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to {spec}: {source}")]
    Connect {
        spec: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("timed out while {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unexpected {reply} reply at {phase}")]
    Unexpected { reply: &'static str, phase: Phase },
    #[error("child closed the connection")]
    Closed,
    #[error("child reported a connection failure")]
    ConnectionFailure,
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    State(#[from] ContextError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildTimeouts {
    pub connection: Duration,
    pub writing: Duration,
    pub reading: Duration,
    pub end_of_message: Duration,
}

impl Default for ChildTimeouts {
    fn default() -> Self {
        ChildTimeouts {
            connection: Duration::from_secs(300),
            writing: Duration::from_secs(10),
            reading: Duration::from_secs(10),
            end_of_message: Duration::from_secs(300),
        }
    }
}

/// A message modification requested by a child at end-of-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    AddHeader { name: String, value: String },
    InsertHeader { index: u32, name: String, value: String },
    ChangeHeader { index: u32, name: String, value: String },
    ChangeFrom { from: String, parameters: Option<String> },
    AddRecipient { recipient: String, parameters: Option<String> },
    DeleteRecipient(String),
    ReplaceBody(Bytes),
    Quarantine(String),
}

impl Edit {
    fn from_reply(reply: Reply) -> Result<Edit, Reply> {
        let edit = match reply {
            Reply::AddHeader { name, value } => Edit::AddHeader { name, value },
            Reply::InsertHeader { index, name, value } => Edit::InsertHeader { index, name, value },
            Reply::ChangeHeader { index, name, value } => Edit::ChangeHeader { index, name, value },
            Reply::ChangeFrom { from, parameters } => Edit::ChangeFrom { from, parameters },
            Reply::AddRecipient {
                recipient,
                parameters,
            } => Edit::AddRecipient {
                recipient,
                parameters,
            },
            Reply::DeleteRecipient(recipient) => Edit::DeleteRecipient(recipient),
            Reply::ReplaceBody(chunk) => Edit::ReplaceBody(chunk),
            Reply::Quarantine(reason) => Edit::Quarantine(reason),
            other => return Err(other),
        };
        Ok(edit)
    }

    /// Action bit the session must hold to forward this edit.
    pub fn required_action(&self) -> ActionFlags {
        match self {
            Edit::AddHeader { .. } | Edit::InsertHeader { .. } => ActionFlags::ADD_HEADERS,
            Edit::ChangeHeader { .. } => ActionFlags::CHANGE_HEADERS,
            Edit::ChangeFrom { .. } => ActionFlags::CHANGE_ENVELOPE_FROM,
            Edit::AddRecipient {
                parameters: Some(_),
                ..
            } => ActionFlags::ADD_ENVELOPE_RECIPIENT_WITH_PARAMETERS,
            Edit::AddRecipient { .. } => ActionFlags::ADD_ENVELOPE_RECIPIENT,
            Edit::DeleteRecipient(_) => ActionFlags::DELETE_ENVELOPE_RECIPIENT,
            Edit::ReplaceBody(_) => ActionFlags::CHANGE_BODY,
            Edit::Quarantine(_) => ActionFlags::QUARANTINE,
        }
    }
}

/// What a child answered for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildResponse {
    pub status: Status,
    pub reply_code: Option<String>,
    pub edits: Vec<Edit>,
    pub progress: u32,
}

impl ChildResponse {
    /// Response for an event the child never answers.
    pub fn abstain() -> Self {
        ChildResponse {
            status: Status::NotChange,
            reply_code: None,
            edits: Vec::new(),
            progress: 0,
        }
    }
}

struct Connection {
    reader: FramedRead<ReadHalf<BoxedStream>, MtaCodec>,
    writer: WriteHalf<BoxedStream>,
}

enum Outcome {
    Done(ChildResponse),
    Shutdown,
    Failed(UpstreamError),
}

pub struct UpstreamContext {
    name: String,
    agent: Agent,
    spec: ConnectionSpec,
    timeouts: ChildTimeouts,
    allowed_actions: ActionFlags,
    connection: Option<Connection>,
    option: Option<MilterOption>,
    macro_requests: MacroRequests,
}

impl UpstreamContext {
    pub fn new(
        name: &str,
        spec: ConnectionSpec,
        timeouts: ChildTimeouts,
        allowed_actions: ActionFlags,
    ) -> Self {
        UpstreamContext {
            name: name.to_string(),
            agent: Agent::new(Role::Upstream, name),
            spec,
            timeouts,
            allowed_actions,
            connection: None,
            option: None,
            macro_requests: MacroRequests::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        self.agent.tag()
    }

    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    /// Option the child agreed to, clamped to what it was offered.
    pub fn option(&self) -> Option<&MilterOption> {
        self.option.as_ref()
    }

    pub fn macro_requests(&self) -> &MacroRequests {
        &self.macro_requests
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn phase(&self) -> Phase {
        self.agent.phase()
    }

    pub fn in_message(&self) -> bool {
        self.agent.in_message()
    }

    pub async fn connect(&mut self, connector: &dyn Connector) -> Result<(), UpstreamError> {
        if self.connection.is_some() {
            return Ok(());
        }
        log::debug!("{} connecting to {}", self.tag(), self.spec);
        let stream = match timeout(self.timeouts.connection, connector.connect(&self.spec)).await {
            Err(_) => return Err(UpstreamError::Timeout("connecting")),
            Ok(Err(source)) => {
                return Err(UpstreamError::Connect {
                    spec: self.spec.to_string(),
                    source,
                })
            }
            Ok(Ok(stream)) => stream,
        };
        let (read_half, write_half) = tokio::io::split(stream);
        self.connection = Some(Connection {
            reader: FramedRead::new(read_half, MtaCodec),
            writer: write_half,
        });
        Ok(())
    }

    /// Offers `offered`, minus the actions this child may not use, and
    /// records what the child asks for.
    pub async fn negotiate(&mut self, offered: &MilterOption) -> Result<MilterOption, UpstreamError> {
        let result = self.exchange_negotiate(offered).await;
        if result.is_err() {
            self.disconnect();
        }
        result
    }

    async fn exchange_negotiate(&mut self, offered: &MilterOption) -> Result<MilterOption, UpstreamError> {
        self.agent.enter(Phase::Negotiate)?;
        let request = offered.restrict_actions(self.allowed_actions);
        let mut buffer = BytesMut::new();
        encode_command(&Command::Negotiate(request), &mut buffer);
        self.write(&buffer).await?;

        let reading = self.timeouts.reading;
        let connection = self.connection.as_mut().ok_or(UpstreamError::NotConnected)?;
        let reply = match timeout(reading, connection.reader.next()).await {
            Err(_) => return Err(UpstreamError::Timeout("reading")),
            Ok(None) => return Err(UpstreamError::Closed),
            Ok(Some(reply)) => reply?,
        };
        let Reply::Negotiate {
            option,
            macro_requests,
        } = reply
        else {
            return Err(UpstreamError::Unexpected {
                reply: reply.name(),
                phase: Phase::Negotiate,
            });
        };
        let option = option.intersect(&request);
        log::debug!(
            "{} negotiated version {} actions {:?} steps {:?}",
            self.tag(),
            option.version,
            option.actions,
            option.steps
        );
        self.option = Some(option);
        self.macro_requests = macro_requests;
        self.agent.reply()?;
        Ok(option)
    }

    /// Sends one event, with the macros defined for it, and waits for the
    /// child's answer when one is due.
    ///
    /// Any error leaves the child disconnected.
    pub async fn send(
        &mut self,
        command: &Command,
        macros: Option<&MacroMap>,
    ) -> Result<ChildResponse, UpstreamError> {
        let result = self.exchange(command, macros).await;
        if result.is_err() {
            self.disconnect();
        }
        result
    }

    async fn exchange(
        &mut self,
        command: &Command,
        macros: Option<&MacroMap>,
    ) -> Result<ChildResponse, UpstreamError> {
        let phase = command.phase();
        let option = self
            .option
            .ok_or_else(|| ContextError::invalid_state(command.name(), self.agent.state()))?;
        if self.connection.is_none() {
            return Err(UpstreamError::NotConnected);
        }

        self.agent.enter(phase)?;
        if option.skips_event(phase.no_event_step()) {
            log::trace!("{} skips {}", self.tag(), phase);
            if phase.expects_reply() {
                self.agent.reply()?;
            }
            return Ok(ChildResponse::abstain());
        }

        let mut buffer = BytesMut::new();
        if let Some(macros) = macros {
            let macros = filter_requested(macros, phase, &self.macro_requests);
            if !macros.is_empty() {
                encode_command(&Command::DefineMacro { phase, macros }, &mut buffer);
            }
        }
        encode_command(command, &mut buffer);
        log::trace!("{} send {}", self.tag(), command.name());
        self.write(&buffer).await?;

        if !phase.expects_reply() {
            return Ok(ChildResponse::abstain());
        }
        if option.skips_event(phase.no_reply_step()) {
            self.agent.reply()?;
            return Ok(ChildResponse::abstain());
        }

        let response = match self.read_response(phase).await {
            Outcome::Done(response) => response,
            Outcome::Shutdown => {
                log::info!("{} child shut down at {}", self.tag(), phase);
                self.agent.reply()?;
                self.quit().await;
                let mut response = ChildResponse::abstain();
                response.status = Status::TemporaryFailure;
                return Ok(response);
            }
            Outcome::Failed(e) => return Err(e),
        };
        self.agent.reply()?;
        log::debug!("{} replied {} at {}", self.tag(), response.status, phase);

        let recipient_scoped = phase == Phase::EnvelopeRecipient
            && matches!(response.status, Status::Reject | Status::TemporaryFailure);
        if phase.is_message() && response.status.is_terminal() && !recipient_scoped {
            self.agent.close_message();
        }
        Ok(response)
    }

    async fn read_response(&mut self, phase: Phase) -> Outcome {
        let wait = if phase == Phase::EndOfMessage {
            self.timeouts.end_of_message
        } else {
            self.timeouts.reading
        };
        let Some(connection) = self.connection.as_mut() else {
            return Outcome::Failed(UpstreamError::NotConnected);
        };
        let mut response = ChildResponse::abstain();
        loop {
            // every packet, progress included, re-arms the wait
            let reply = match timeout(wait, connection.reader.next()).await {
                Err(_) => return Outcome::Failed(UpstreamError::Timeout("reading")),
                Ok(None) => return Outcome::Failed(UpstreamError::Closed),
                Ok(Some(Err(e))) => return Outcome::Failed(e.into()),
                Ok(Some(Ok(reply))) => reply,
            };
            response.status = match reply {
                Reply::Continue => Status::Continue,
                Reply::Reject => Status::Reject,
                Reply::Discard => Status::Discard,
                Reply::Accept => Status::Accept,
                Reply::TemporaryFailure => Status::TemporaryFailure,
                Reply::Skip => Status::Skip,
                Reply::ReplyCode(text) => {
                    let status = match text.as_bytes().first() {
                        Some(b'4') => Status::TemporaryFailure,
                        Some(b'5') => Status::Reject,
                        _ => {
                            return Outcome::Failed(UpstreamError::Unexpected {
                                reply: "reply-code",
                                phase,
                            })
                        }
                    };
                    response.reply_code = Some(text);
                    status
                }
                Reply::Progress => {
                    response.progress += 1;
                    continue;
                }
                Reply::Shutdown => return Outcome::Shutdown,
                Reply::ConnectionFailure => {
                    return Outcome::Failed(UpstreamError::ConnectionFailure)
                }
                other if phase == Phase::EndOfMessage => match Edit::from_reply(other) {
                    Ok(edit) => {
                        response.edits.push(edit);
                        continue;
                    }
                    Err(other) => {
                        return Outcome::Failed(UpstreamError::Unexpected {
                            reply: other.name(),
                            phase,
                        })
                    }
                },
                other => {
                    return Outcome::Failed(UpstreamError::Unexpected {
                        reply: other.name(),
                        phase,
                    })
                }
            };
            return Outcome::Done(response);
        }
    }

    async fn write(&mut self, buffer: &[u8]) -> Result<(), UpstreamError> {
        let writing = self.timeouts.writing;
        let connection = self.connection.as_mut().ok_or(UpstreamError::NotConnected)?;
        let writer = &mut connection.writer;
        let write = async move {
            writer.write_all(buffer).await?;
            writer.flush().await
        };
        match timeout(writing, write).await {
            Err(_) => Err(UpstreamError::Timeout("writing")),
            Ok(result) => Ok(result?),
        }
    }

    /// Tells the child the current message is over. Nothing is sent when
    /// the child has no message open.
    pub async fn abort(&mut self) -> Result<(), UpstreamError> {
        let phase = self.agent.phase();
        let open = self.agent.in_message() || (phase.is_message() && phase != Phase::EndOfMessage);
        if self.connection.is_none() || !open {
            return Ok(());
        }
        self.agent.enter(Phase::Abort)?;
        let mut buffer = BytesMut::new();
        encode_command(&Command::Abort, &mut buffer);
        log::trace!("{} send abort", self.tag());
        let result = self.write(&buffer).await;
        if result.is_err() {
            self.disconnect();
        }
        result
    }

    /// Ends the conversation politely; errors only get logged.
    pub async fn quit(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            self.agent.finish();
            return;
        };
        let mut buffer = BytesMut::new();
        encode_command(&Command::Quit, &mut buffer);
        let writing = self.timeouts.writing;
        let write = async {
            connection.writer.write_all(&buffer).await?;
            connection.writer.shutdown().await
        };
        match timeout(writing, write).await {
            Ok(Ok(())) => log::debug!("{} quit", self.tag()),
            Ok(Err(e)) => log::debug!("{} quit: {}", self.tag(), e),
            Err(_) => log::debug!("{} quit timed out", self.tag()),
        }
        self.agent.finish();
    }

    fn disconnect(&mut self) {
        if self.connection.take().is_some() {
            log::debug!("{} disconnected", self.tag());
        }
        self.agent.finish();
    }

    /// Points the child at a new target; the next connect uses it.
    pub async fn retarget(&mut self, spec: ConnectionSpec) {
        self.quit().await;
        log::info!("{} retargeted to {}", self.tag(), spec);
        self.spec = spec;
        self.reset();
    }

    /// Forgets the conversation so the child can be negotiated again.
    pub fn reset(&mut self) {
        self.connection = None;
        self.agent = Agent::new(Role::Upstream, &self.name);
        self.option = None;
        self.macro_requests = MacroRequests::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ConnectAddress;
    use crate::protocol::StepFlags;
    use crate::test_support::{scripted, FakeConnector};
    use std::sync::Arc;

    fn connect_command() -> Command {
        Command::Connect {
            host: "mx.example.org".into(),
            address: ConnectAddress::Inet {
                port: 25,
                address: "192.0.2.1".into(),
            },
        }
    }

    fn short_timeouts() -> ChildTimeouts {
        ChildTimeouts {
            connection: Duration::from_secs(1),
            writing: Duration::from_secs(1),
            reading: Duration::from_millis(100),
            end_of_message: Duration::from_millis(200),
        }
    }

    async fn negotiated(
        connector: &FakeConnector,
        spec: &str,
        allowed: ActionFlags,
    ) -> UpstreamContext {
        let mut child = UpstreamContext::new("test", spec.parse().unwrap(), short_timeouts(), allowed);
        child.connect(connector).await.unwrap();
        child.negotiate(&MilterOption::default()).await.unwrap();
        child
    }

    #[tokio::test]
    async fn test_negotiate_restricts_actions() {
        let connector = FakeConnector::default();
        let log = connector.add(
            "unix:/fake/a",
            scripted(MilterOption::new(6, ActionFlags::all(), StepFlags::NO_HELO), |_| {
                vec![Reply::Continue]
            }),
        );
        let child = negotiated(&connector, "unix:/fake/a", ActionFlags::ADD_HEADERS).await;

        let option = child.option().unwrap();
        assert_eq!(option.actions, ActionFlags::ADD_HEADERS);
        assert!(option.steps.is_empty());
        let offered = log.lock().unwrap()[0].clone();
        let Command::Negotiate(offered) = offered else {
            panic!("expected negotiate");
        };
        assert_eq!(offered.actions, ActionFlags::ADD_HEADERS);
    }

    #[tokio::test]
    async fn test_skipped_event_is_not_sent() {
        let connector = FakeConnector::default();
        let log = connector.add(
            "unix:/fake/a",
            scripted(MilterOption::new(6, ActionFlags::all(), StepFlags::NO_CONNECT), |_| {
                vec![Reply::Continue]
            }),
        );
        let mut child = UpstreamContext::new(
            "test",
            "unix:/fake/a".parse().unwrap(),
            short_timeouts(),
            ActionFlags::all(),
        );
        child.connect(&connector).await.unwrap();
        child
            .negotiate(&MilterOption::new(6, ActionFlags::all(), StepFlags::NO_MASK))
            .await
            .unwrap();

        let response = child.send(&connect_command(), None).await.unwrap();
        assert_eq!(response.status, Status::NotChange);
        child.send(&Command::Helo("client".into()), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let names: Vec<&str> = log.lock().unwrap().iter().map(Command::name).collect();
        assert_eq!(names, vec!["negotiate", "helo"]);
    }

    #[tokio::test]
    async fn test_macros_are_filtered_by_request() {
        let connector = FakeConnector::default();
        let log = connector.add(
            "unix:/fake/a",
            Arc::new(|command: &Command| match command {
                Command::Negotiate(_) => {
                    let mut requests = MacroRequests::new();
                    requests.insert(crate::protocol::MacroStage::Connect, vec!["{client_addr}".into()]);
                    vec![Reply::Negotiate {
                        option: MilterOption::default(),
                        macro_requests: requests,
                    }]
                }
                Command::DefineMacro { .. } | Command::Abort => vec![],
                _ => vec![Reply::Continue],
            }),
        );
        let mut child = negotiated(&connector, "unix:/fake/a", ActionFlags::all()).await;

        let mut macros = MacroMap::new();
        macros.insert("client_addr".into(), "192.0.2.1".into());
        macros.insert("j".into(), "mx".into());
        child.send(&connect_command(), Some(&macros)).await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(
            log[1],
            Command::DefineMacro {
                phase: Phase::Connect,
                macros: vec![("client_addr".into(), "192.0.2.1".into())],
            }
        );
        assert_eq!(log[2].name(), "connect");
    }

    #[tokio::test]
    async fn test_end_of_message_collects_edits_and_progress() {
        let connector = FakeConnector::default();
        connector.add(
            "unix:/fake/a",
            scripted(MilterOption::default(), |command| match command {
                Command::EndOfMessage(_) => vec![
                    Reply::Progress,
                    Reply::AddHeader {
                        name: "X-Spam".into(),
                        value: "no".into(),
                    },
                    Reply::Quarantine("held".into()),
                    Reply::Accept,
                ],
                _ => vec![Reply::Continue],
            }),
        );
        let mut child = negotiated(&connector, "unix:/fake/a", ActionFlags::all()).await;
        for command in [
            connect_command(),
            Command::EnvelopeFrom {
                address: "<a@example.org>".into(),
                parameters: vec![],
            },
        ] {
            assert_eq!(child.send(&command, None).await.unwrap().status, Status::Continue);
        }
        let response = child
            .send(&Command::EndOfMessage(Bytes::new()), None)
            .await
            .unwrap();
        assert_eq!(response.status, Status::Accept);
        assert_eq!(response.progress, 1);
        assert_eq!(
            response.edits,
            vec![
                Edit::AddHeader {
                    name: "X-Spam".into(),
                    value: "no".into()
                },
                Edit::Quarantine("held".into()),
            ]
        );
        assert!(!child.in_message());
    }

    #[tokio::test]
    async fn test_reply_code_maps_to_status() {
        let connector = FakeConnector::default();
        connector.add(
            "unix:/fake/a",
            scripted(MilterOption::default(), |command| match command {
                Command::Helo(_) => vec![Reply::ReplyCode("451 4.7.1 later".into())],
                _ => vec![Reply::Continue],
            }),
        );
        let mut child = negotiated(&connector, "unix:/fake/a", ActionFlags::all()).await;
        child.send(&connect_command(), None).await.unwrap();
        let response = child.send(&Command::Helo("x".into()), None).await.unwrap();
        assert_eq!(response.status, Status::TemporaryFailure);
        assert_eq!(response.reply_code.as_deref(), Some("451 4.7.1 later"));
    }

    #[tokio::test]
    async fn test_silent_child_times_out_and_disconnects() {
        let connector = FakeConnector::default();
        connector.add(
            "unix:/fake/a",
            scripted(MilterOption::default(), |command| match command {
                Command::Helo(_) => vec![],
                _ => vec![Reply::Continue],
            }),
        );
        let mut child = negotiated(&connector, "unix:/fake/a", ActionFlags::all()).await;
        child.send(&connect_command(), None).await.unwrap();
        let err = child.send(&Command::Helo("x".into()), None).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Timeout("reading")));
        assert!(!child.is_connected());
    }

    #[tokio::test]
    async fn test_shutdown_votes_temporary_failure() {
        let connector = FakeConnector::default();
        connector.add(
            "unix:/fake/a",
            scripted(MilterOption::default(), |_| vec![Reply::Shutdown]),
        );
        let mut child = negotiated(&connector, "unix:/fake/a", ActionFlags::all()).await;
        let response = child.send(&connect_command(), None).await.unwrap();
        assert_eq!(response.status, Status::TemporaryFailure);
        assert!(!child.is_connected());
    }

    #[tokio::test]
    async fn test_connection_failure_is_an_error() {
        let connector = FakeConnector::default();
        connector.add(
            "unix:/fake/a",
            scripted(MilterOption::default(), |_| vec![Reply::ConnectionFailure]),
        );
        let mut child = negotiated(&connector, "unix:/fake/a", ActionFlags::all()).await;
        let err = child.send(&connect_command(), None).await.unwrap_err();
        assert!(matches!(err, UpstreamError::ConnectionFailure));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let connector = FakeConnector::default();
        let mut child = UpstreamContext::new(
            "gone",
            "unix:/fake/missing".parse().unwrap(),
            short_timeouts(),
            ActionFlags::all(),
        );
        let err = child.connect(&connector).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Connect { .. }));
    }
}
