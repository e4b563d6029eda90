//! MTA-facing side of a milter conversation.

use crate::agent::{Agent, Role, State};
use crate::codec::{encode_reply, Command, ConnectAddress, FilterCodec, MacroRequests, Reply};
use crate::error::ContextError;
use crate::macros::MacroStore;
use crate::message_result::{EditCounts, MessageResult};
use crate::option::MilterOption;
use crate::protocol::{ActionFlags, Phase, Status, StepFlags, MILTER_CHUNK_SIZE};
use crate::reply::ReplyCode;
use crate::socket::BoxedStream;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;

/// Knobs for one MTA-facing session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// How long to wait for the next command or for a write to complete.
    pub timeout: Duration,
    /// Buffered edit bytes that trigger an early flush; zero buffers until
    /// the final reply.
    pub packet_buffer_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            timeout: Duration::from_secs(7210),
            packet_buffer_size: 0,
        }
    }
}

pub struct SessionContext {
    id: u64,
    agent: Agent,
    reader: FramedRead<ReadHalf<BoxedStream>, FilterCodec>,
    writer: WriteHalf<BoxedStream>,
    output: BytesMut,
    macros: MacroStore,
    offered: Option<MilterOption>,
    option: Option<MilterOption>,
    macro_requests: MacroRequests,
    preset: Option<Status>,
    message_status: Status,
    reply_code: Option<ReplyCode>,
    quarantine: Option<String>,
    message: Option<MessageResult>,
    finished_messages: Vec<MessageResult>,
    settings: SessionSettings,
}

impl SessionContext {
    pub fn new(id: u64, stream: BoxedStream, settings: SessionSettings) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        SessionContext {
            id,
            agent: Agent::new(Role::Downstream, id),
            reader: FramedRead::new(read_half, FilterCodec),
            writer: write_half,
            output: BytesMut::new(),
            macros: MacroStore::new(),
            offered: None,
            option: None,
            macro_requests: MacroRequests::new(),
            preset: None,
            message_status: Status::NotChange,
            reply_code: None,
            quarantine: None,
            message: None,
            finished_messages: Vec::new(),
            settings,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tag(&self) -> &str {
        self.agent.tag()
    }

    pub fn state(&self) -> State {
        self.agent.state()
    }

    pub fn macros(&self) -> &MacroStore {
        &self.macros
    }

    /// Option the MTA offered in its negotiate packet.
    pub fn offered_option(&self) -> Option<&MilterOption> {
        self.offered.as_ref()
    }

    /// Option agreed with the MTA.
    pub fn option(&self) -> Option<&MilterOption> {
        self.option.as_ref()
    }

    pub fn message_result(&self) -> Option<&MessageResult> {
        self.message.as_ref()
    }

    /// Message results closed since the last call.
    pub fn take_message_results(&mut self) -> Vec<MessageResult> {
        std::mem::take(&mut self.finished_messages)
    }

    fn steps(&self) -> StepFlags {
        self.option.map(|o| o.steps).unwrap_or(StepFlags::empty())
    }

    fn actions(&self) -> ActionFlags {
        self.option.map(|o| o.actions).unwrap_or(ActionFlags::empty())
    }

    /// Fixes the option and macro requests sent in the negotiate reply.
    pub fn set_negotiated(&mut self, option: MilterOption, macro_requests: MacroRequests) {
        self.option = Some(option);
        self.macro_requests = macro_requests;
    }

    /// Status used when the current phase is answered with `not-change`.
    pub fn set_status(&mut self, status: Status) {
        self.preset = Some(status);
    }

    pub fn set_reply(
        &mut self,
        code: u16,
        extended: Option<&str>,
        message: Option<&str>,
    ) -> Result<(), ContextError> {
        self.reply_code = Some(ReplyCode::new(code, extended, message)?);
        Ok(())
    }

    pub fn set_reply_code(&mut self, reply: ReplyCode) {
        self.reply_code = Some(reply);
    }

    pub fn format_reply(&self) -> Option<String> {
        self.reply_code.as_ref().map(ReplyCode::format)
    }

    /// Reads commands until one that drives the state machine arrives.
    /// Define-macro packets are absorbed into the macro store. Returns
    /// `None` once the MTA closed the connection.
    pub async fn next_event(&mut self) -> Result<Option<Command>, ContextError> {
        loop {
            if self.agent.is_finished() {
                return Ok(None);
            }
            let waiting = self.agent.phase();
            let read = timeout(self.settings.timeout, self.reader.next()).await;
            let packet = match read {
                Err(_) => {
                    log::warn!("{} timed out after {}", self.tag(), self.agent.state());
                    self.finish();
                    return Err(ContextError::Timeout(waiting));
                }
                Ok(None) => {
                    log::debug!("{} MTA closed the connection", self.tag());
                    self.finish();
                    return Ok(None);
                }
                Ok(Some(Err(e))) => {
                    log::error!("{} failed to decode command: {}", self.tag(), e);
                    self.finish();
                    return Err(e.into());
                }
                Ok(Some(Ok(packet))) => packet,
            };

            log::trace!("{} received {}", self.tag(), packet.name());
            if let Command::DefineMacro { phase, macros } = packet {
                self.macros.define(phase, macros);
                continue;
            }
            self.accept(&packet)?;
            return Ok(Some(packet));
        }
    }

    fn accept(&mut self, packet: &Command) -> Result<(), ContextError> {
        if let Command::QuitNewConnection = packet {
            log::debug!("{} MTA reuses the connection", self.tag());
            self.close_message(Phase::Quit);
            self.macros.clear();
            self.agent.reset_connection();
            return Ok(());
        }

        let phase = packet.phase();
        self.agent.enter(phase)?;
        if !matches!(phase, Phase::Abort | Phase::Quit) {
            self.macros.enter(phase);
        }
        self.preset = None;

        match packet {
            Command::Negotiate(option) => self.offered = Some(*option),
            Command::EnvelopeFrom { address, .. } => {
                let mut result = MessageResult::new();
                result.from = Some(address.clone());
                self.message = Some(result);
                self.message_status = Status::NotChange;
            }
            Command::EnvelopeRecipient { address, .. } => {
                if let Some(result) = self.message.as_mut() {
                    result.recipients.push(address.clone());
                }
            }
            Command::Header { .. } => {
                if let Some(result) = self.message.as_mut() {
                    result.header_count += 1;
                }
            }
            Command::Body(chunk) => {
                if let Some(result) = self.message.as_mut() {
                    result.body_size += chunk.len() as u64;
                }
            }
            Command::Abort => self.abort_message(),
            _ => {}
        }
        Ok(())
    }

    fn abort_message(&mut self) {
        // a verdict already given stands only while it did not end the message
        if self.message_status.is_terminal() {
            self.message_status = Status::Abort;
        }
        self.close_message(Phase::Abort);
        self.macros.leave_message();
        self.output.clear();
        self.quarantine = None;
        self.reply_code = None;
    }

    fn close_message(&mut self, state: Phase) {
        if let Some(mut result) = self.message.take() {
            let status = if self.message_status.is_abstention() {
                Status::Abort
            } else {
                self.message_status
            };
            result.close(state, status);
            self.finished_messages.push(result);
        }
    }

    fn negotiate_reply(&mut self, status: Status) -> Reply {
        let option = match self.option {
            Some(option) => option,
            None => {
                let offered = self.offered.unwrap_or_default();
                let option = match status {
                    Status::AllOptions => MilterOption::new(
                        offered.version,
                        offered.actions,
                        StepFlags::empty(),
                    ),
                    _ => offered,
                };
                self.option = Some(option);
                option
            }
        };
        let macro_requests = if self
            .offered
            .is_some_and(|o| o.actions.contains(ActionFlags::SET_SYMBOL_LIST))
        {
            self.macro_requests.clone()
        } else {
            MacroRequests::new()
        };
        Reply::Negotiate {
            option,
            macro_requests,
        }
    }

    fn reply_for(&mut self, phase: Phase, status: Status) -> Reply {
        if phase == Phase::Negotiate {
            return self.negotiate_reply(status);
        }
        let code = self.reply_code.take();
        match status {
            Status::Reject => match code {
                Some(code) if !code.is_temporary() => Reply::ReplyCode(code.format()),
                _ => Reply::Reject,
            },
            Status::TemporaryFailure | Status::Abort => match code {
                Some(code) if code.is_temporary() => Reply::ReplyCode(code.format()),
                _ => Reply::TemporaryFailure,
            },
            Status::Discard => Reply::Discard,
            Status::Accept => Reply::Accept,
            Status::Skip if phase == Phase::Body && self.steps().contains(StepFlags::SKIP) => {
                Reply::Skip
            }
            _ => Reply::Continue,
        }
    }

    async fn write_buffer(&mut self, buffer: &[u8]) -> Result<(), ContextError> {
        let writer = &mut self.writer;
        let write = async move {
            writer.write_all(buffer).await?;
            writer.flush().await
        };
        let written = timeout(self.settings.timeout, write).await;
        match written {
            Ok(result) => result.map_err(ContextError::from),
            Err(_) => Err(ContextError::Timeout(self.agent.phase())),
        }
    }

    async fn flush_output(&mut self) -> Result<(), ContextError> {
        if self.output.is_empty() {
            return Ok(());
        }
        let buffer = self.output.split().freeze();
        log::trace!("{} flushing {} buffered bytes", self.tag(), buffer.len());
        self.write_buffer(&buffer).await
    }

    async fn write_final(&mut self, reply: Reply) -> Result<(), ContextError> {
        self.flush_output().await?;
        let mut buffer = BytesMut::new();
        if let Some(reason) = self.quarantine.take() {
            encode_reply(&Reply::Quarantine(reason), &mut buffer);
        }
        log::debug!("{} reply {} at {}", self.tag(), reply.name(), self.agent.phase());
        encode_reply(&reply, &mut buffer);
        self.write_buffer(&buffer).await
    }

    /// Answers the current phase.
    ///
    /// `not-change` reuses the status set with [`set_status`](Self::set_status),
    /// `default` becomes the phase default and `progress` sends nothing and
    /// leaves the phase open.
    pub async fn respond(&mut self, status: Status) -> Result<(), ContextError> {
        let state = self.agent.state();
        if state.replied || !state.phase.expects_reply() {
            return Err(ContextError::invalid_state("respond", state));
        }
        let phase = state.phase;
        let status = match status {
            Status::NotChange => self.preset.unwrap_or(Status::Default),
            other => other,
        };
        let status = match status {
            Status::Default if phase == Phase::Negotiate => Status::AllOptions,
            Status::Default => Status::Continue,
            other => other,
        };
        if status == Status::Progress {
            return Ok(());
        }

        let silent = status == Status::NoReply
            || phase
                .no_reply_step()
                .is_some_and(|step| self.steps().contains(step));
        if silent {
            log::trace!("{} no reply for {}", self.tag(), phase);
            self.reply_code = None;
        } else {
            let reply = self.reply_for(phase, status);
            if let Err(e) = self.write_final(reply).await {
                log::error!("{} failed to reply: {}", self.tag(), e);
                self.finish();
                return Err(e);
            }
        }

        self.agent.reply()?;
        self.after_reply(phase, status);
        Ok(())
    }

    fn after_reply(&mut self, phase: Phase, status: Status) {
        self.preset = None;
        if !phase.is_message() {
            return;
        }
        if phase == Phase::EnvelopeRecipient {
            if let Some(result) = self.message.as_mut() {
                result.recipient_status(status);
            }
            if matches!(status, Status::Reject | Status::TemporaryFailure) {
                return;
            }
        }
        if !status.is_abstention() {
            self.message_status = status;
        }
        if phase == Phase::EndOfMessage || status.is_terminal() {
            self.close_message(phase);
            self.macros.leave_message();
            self.agent.close_message();
        }
    }

    fn guard_edit(
        &self,
        operation: &'static str,
        required: Option<ActionFlags>,
    ) -> Result<(), ContextError> {
        let state = self.agent.state();
        if state.phase != Phase::EndOfMessage || state.replied {
            return Err(ContextError::invalid_state(operation, state));
        }
        if let Some(required) = required {
            if !self.actions().contains(required) {
                return Err(ContextError::InvalidAction {
                    operation,
                    required,
                });
            }
        }
        Ok(())
    }

    async fn push_reply(&mut self, reply: Reply) -> Result<(), ContextError> {
        log::trace!("{} buffer {}", self.tag(), reply.name());
        encode_reply(&reply, &mut self.output);
        let threshold = self.settings.packet_buffer_size;
        if threshold > 0 && self.output.len() >= threshold {
            self.flush_output().await?;
        }
        Ok(())
    }

    fn edits(&mut self) -> Option<&mut EditCounts> {
        self.message.as_mut().map(|result| &mut result.edits)
    }

    pub async fn add_header(&mut self, name: &str, value: &str) -> Result<(), ContextError> {
        self.guard_edit("add-header", Some(ActionFlags::ADD_HEADERS))?;
        if name.is_empty() {
            return Err(ContextError::Empty("header name"));
        }
        self.push_reply(Reply::AddHeader {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await?;
        if let Some(edits) = self.edits() {
            edits.added_headers += 1;
        }
        Ok(())
    }

    pub async fn insert_header(
        &mut self,
        index: u32,
        name: &str,
        value: &str,
    ) -> Result<(), ContextError> {
        self.guard_edit("insert-header", Some(ActionFlags::ADD_HEADERS))?;
        if name.is_empty() {
            return Err(ContextError::Empty("header name"));
        }
        self.push_reply(Reply::InsertHeader {
            index,
            name: name.to_string(),
            value: value.to_string(),
        })
        .await?;
        if let Some(edits) = self.edits() {
            edits.added_headers += 1;
        }
        Ok(())
    }

    /// Changes the `index`-th (1 based) occurrence of a header. An empty
    /// value removes it.
    pub async fn change_header(
        &mut self,
        name: &str,
        index: u32,
        value: &str,
    ) -> Result<(), ContextError> {
        self.guard_edit("change-header", Some(ActionFlags::CHANGE_HEADERS))?;
        if name.is_empty() {
            return Err(ContextError::Empty("header name"));
        }
        self.push_reply(Reply::ChangeHeader {
            index,
            name: name.to_string(),
            value: value.to_string(),
        })
        .await?;
        if let Some(edits) = self.edits() {
            if value.is_empty() {
                edits.removed_headers += 1;
            } else {
                edits.changed_headers += 1;
            }
        }
        Ok(())
    }

    pub async fn delete_header(&mut self, name: &str, index: u32) -> Result<(), ContextError> {
        self.change_header(name, index, "").await
    }

    pub async fn change_from(
        &mut self,
        from: &str,
        parameters: Option<&str>,
    ) -> Result<(), ContextError> {
        self.guard_edit("change-from", Some(ActionFlags::CHANGE_ENVELOPE_FROM))?;
        if from.is_empty() {
            return Err(ContextError::Empty("envelope from"));
        }
        self.push_reply(Reply::ChangeFrom {
            from: from.to_string(),
            parameters: parameters.filter(|p| !p.is_empty()).map(str::to_string),
        })
        .await?;
        if let Some(edits) = self.edits() {
            edits.changed_from = true;
        }
        Ok(())
    }

    pub async fn add_recipient(
        &mut self,
        recipient: &str,
        parameters: Option<&str>,
    ) -> Result<(), ContextError> {
        let parameters = parameters.filter(|p| !p.is_empty());
        let required = if parameters.is_some() {
            ActionFlags::ADD_ENVELOPE_RECIPIENT_WITH_PARAMETERS
        } else {
            ActionFlags::ADD_ENVELOPE_RECIPIENT
        };
        self.guard_edit("add-recipient", Some(required))?;
        if recipient.is_empty() {
            return Err(ContextError::Empty("recipient"));
        }
        self.push_reply(Reply::AddRecipient {
            recipient: recipient.to_string(),
            parameters: parameters.map(str::to_string),
        })
        .await?;
        if let Some(edits) = self.edits() {
            edits.added_recipients += 1;
        }
        Ok(())
    }

    pub async fn delete_recipient(&mut self, recipient: &str) -> Result<(), ContextError> {
        self.guard_edit("delete-recipient", Some(ActionFlags::DELETE_ENVELOPE_RECIPIENT))?;
        if recipient.is_empty() {
            return Err(ContextError::Empty("recipient"));
        }
        self.push_reply(Reply::DeleteRecipient(recipient.to_string()))
            .await?;
        if let Some(edits) = self.edits() {
            edits.removed_recipients += 1;
        }
        Ok(())
    }

    /// Replaces the body, split into protocol sized chunks. Repeated calls
    /// append to the replacement.
    pub async fn replace_body(&mut self, body: &[u8]) -> Result<(), ContextError> {
        self.guard_edit("replace-body", Some(ActionFlags::CHANGE_BODY))?;
        if body.is_empty() {
            self.push_reply(Reply::ReplaceBody(Bytes::new())).await?;
        }
        for chunk in body.chunks(MILTER_CHUNK_SIZE) {
            self.push_reply(Reply::ReplaceBody(Bytes::copy_from_slice(chunk)))
                .await?;
        }
        if let Some(edits) = self.edits() {
            edits.replaced_body_bytes += body.len() as u64;
        }
        Ok(())
    }

    /// Tells the MTA more time is needed. Written immediately.
    pub async fn progress(&mut self) -> Result<(), ContextError> {
        self.guard_edit("progress", None)?;
        self.flush_output().await?;
        let mut buffer = BytesMut::new();
        encode_reply(&Reply::Progress, &mut buffer);
        self.write_buffer(&buffer).await
    }

    /// Quarantines the message; sent right before the final reply.
    pub async fn quarantine(&mut self, reason: &str) -> Result<(), ContextError> {
        self.guard_edit("quarantine", Some(ActionFlags::QUARANTINE))?;
        if reason.is_empty() {
            return Err(ContextError::Empty("quarantine reason"));
        }
        self.quarantine = Some(reason.to_string());
        if let Some(edits) = self.edits() {
            edits.quarantined = true;
        }
        Ok(())
    }

    /// Stops the session; no further replies are sent.
    pub fn finish(&mut self) {
        if self.agent.is_finished() {
            return;
        }
        let phase = self.agent.phase();
        self.close_message(phase);
        self.agent.finish();
    }

    pub async fn close(&mut self) {
        self.finish();
        if let Err(e) = self.writer.shutdown().await {
            log::debug!("{} shutdown: {}", self.tag(), e);
        }
    }
}

/// Per-event callbacks driven by [`run_session`].
///
/// Every event method defaults to `not-change`, which lets the session
/// answer with the phase default.
#[async_trait]
pub trait SessionHandler: Send {
    async fn negotiate(
        &mut self,
        _ctx: &mut SessionContext,
        _offered: &MilterOption,
    ) -> Result<Status, ContextError> {
        Ok(Status::NotChange)
    }

    async fn connect(
        &mut self,
        _ctx: &mut SessionContext,
        _host: &str,
        _address: &ConnectAddress,
    ) -> Result<Status, ContextError> {
        Ok(Status::NotChange)
    }

    async fn helo(&mut self, _ctx: &mut SessionContext, _fqdn: &str) -> Result<Status, ContextError> {
        Ok(Status::NotChange)
    }

    async fn envelope_from(
        &mut self,
        _ctx: &mut SessionContext,
        _address: &str,
        _parameters: &[String],
    ) -> Result<Status, ContextError> {
        Ok(Status::NotChange)
    }

    async fn envelope_recipient(
        &mut self,
        _ctx: &mut SessionContext,
        _address: &str,
        _parameters: &[String],
    ) -> Result<Status, ContextError> {
        Ok(Status::NotChange)
    }

    async fn data(&mut self, _ctx: &mut SessionContext) -> Result<Status, ContextError> {
        Ok(Status::NotChange)
    }

    async fn unknown(&mut self, _ctx: &mut SessionContext, _command: &str) -> Result<Status, ContextError> {
        Ok(Status::NotChange)
    }

    async fn header(
        &mut self,
        _ctx: &mut SessionContext,
        _name: &str,
        _value: &str,
    ) -> Result<Status, ContextError> {
        Ok(Status::NotChange)
    }

    async fn end_of_header(&mut self, _ctx: &mut SessionContext) -> Result<Status, ContextError> {
        Ok(Status::NotChange)
    }

    async fn body(&mut self, _ctx: &mut SessionContext, _chunk: &Bytes) -> Result<Status, ContextError> {
        Ok(Status::NotChange)
    }

    async fn end_of_message(
        &mut self,
        _ctx: &mut SessionContext,
        _chunk: &Bytes,
    ) -> Result<Status, ContextError> {
        Ok(Status::NotChange)
    }

    async fn abort(&mut self, _ctx: &mut SessionContext) -> Result<(), ContextError> {
        Ok(())
    }

    /// The MTA keeps the socket for a new SMTP connection.
    async fn reset(&mut self, _ctx: &mut SessionContext) -> Result<(), ContextError> {
        Ok(())
    }

    /// Called once when the session ends, cleanly or not.
    async fn finished(&mut self, _ctx: &mut SessionContext, _error: Option<&ContextError>) {}
}

/// Routes one event to its handler method.
pub async fn dispatch(
    handler: &mut dyn SessionHandler,
    ctx: &mut SessionContext,
    event: &Command,
) -> Result<Status, ContextError> {
    match event {
        Command::Negotiate(offered) => handler.negotiate(ctx, offered).await,
        Command::Connect { host, address } => handler.connect(ctx, host, address).await,
        Command::Helo(fqdn) => handler.helo(ctx, fqdn).await,
        Command::EnvelopeFrom {
            address,
            parameters,
        } => handler.envelope_from(ctx, address, parameters).await,
        Command::EnvelopeRecipient {
            address,
            parameters,
        } => handler.envelope_recipient(ctx, address, parameters).await,
        Command::Data => handler.data(ctx).await,
        Command::Unknown(command) => handler.unknown(ctx, command).await,
        Command::Header { name, value } => handler.header(ctx, name, value).await,
        Command::EndOfHeader => handler.end_of_header(ctx).await,
        Command::Body(chunk) => handler.body(ctx, chunk).await,
        Command::EndOfMessage(chunk) => handler.end_of_message(ctx, chunk).await,
        Command::DefineMacro { .. }
        | Command::Abort
        | Command::Quit
        | Command::QuitNewConnection => Ok(Status::NoReply),
    }
}

/// Drives a session until the MTA quits, the connection drops or an error
/// ends it.
pub async fn run_session(
    ctx: &mut SessionContext,
    handler: &mut dyn SessionHandler,
) -> Result<(), ContextError> {
    let result = loop {
        let event = match ctx.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        let outcome = match &event {
            Command::Abort => handler.abort(ctx).await,
            Command::QuitNewConnection => handler.reset(ctx).await,
            Command::Quit => break Ok(()),
            _ => match dispatch(handler, ctx, &event).await {
                // the handler may already have answered on its own
                Ok(_) if ctx.state().replied => Ok(()),
                Ok(status) => ctx.respond(status).await,
                Err(e) => Err(e),
            },
        };
        if let Err(e) = outcome {
            break Err(e);
        }
    };

    if let Err(e) = &result {
        log::warn!("{} session ended: {}", ctx.tag(), e);
    }
    handler.finished(ctx, result.as_ref().err()).await;
    ctx.close().await;
    result
}
