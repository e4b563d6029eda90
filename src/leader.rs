//! Fans every MTA event out to the children and answers the MTA with the
//! combined verdict.

use crate::children::ChildrenRegistry;
use crate::codec::{Command, ConnectAddress};
use crate::condition::ConnectInfo;
use crate::config::ManagerConfig;
use crate::error::ContextError;
use crate::macros::MacroMap;
use crate::option::MilterOption;
use crate::protocol::{ActionFlags, Phase, Status, StepFlags};
use crate::reply::ReplyCode;
use crate::session::{SessionContext, SessionHandler};
use crate::statistics::{StatEvent, StatisticsCollector};
use crate::upstream::{ChildResponse, Edit, UpstreamError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LeaderSettings {
    /// Sent when no participating child has an opinion.
    pub fallback_status: Status,
    /// Vote of a child that failed while answering.
    pub fallback_status_at_disconnect: Status,
    /// Keepalive period towards the MTA while children work on
    /// end-of-message.
    pub progress_interval: Option<Duration>,
}

impl Default for LeaderSettings {
    fn default() -> Self {
        LeaderSettings {
            fallback_status: Status::Continue,
            fallback_status_at_disconnect: Status::TemporaryFailure,
            progress_interval: None,
        }
    }
}

impl LeaderSettings {
    pub fn from_config(config: &ManagerConfig) -> Self {
        LeaderSettings {
            fallback_status: config.fallback_status,
            fallback_status_at_disconnect: config.fallback_status_at_disconnect,
            progress_interval: config.progress_interval(),
        }
    }
}

/// Combined answer of the children for one event.
#[derive(Debug)]
struct Verdict {
    status: Status,
    winner: Option<usize>,
    reply_code: Option<String>,
    /// Children that gave a terminal answer, with that answer.
    terminal: Vec<(usize, Status)>,
    skipped: Vec<usize>,
    /// End-of-message edits in the order the children completed.
    edits: Vec<(usize, Vec<Edit>)>,
}

impl Verdict {
    fn new() -> Self {
        Verdict {
            status: Status::NotChange,
            winner: None,
            reply_code: None,
            terminal: Vec::new(),
            skipped: Vec::new(),
            edits: Vec::new(),
        }
    }
}

fn recipient_scoped(phase: Phase, status: Status) -> bool {
    phase == Phase::EnvelopeRecipient
        && matches!(status, Status::Reject | Status::TemporaryFailure)
}

pub struct Leader {
    children: ChildrenRegistry,
    settings: LeaderSettings,
    offered: Option<MilterOption>,
    renegotiate: bool,
    statistics: Option<Arc<StatisticsCollector>>,
}

impl Leader {
    pub fn new(children: ChildrenRegistry, settings: LeaderSettings) -> Self {
        Leader {
            children,
            settings,
            offered: None,
            renegotiate: false,
            statistics: None,
        }
    }

    pub fn with_statistics(mut self, statistics: Arc<StatisticsCollector>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn children(&self) -> &ChildrenRegistry {
        &self.children
    }

    fn record(&self, event: StatEvent) {
        if let Some(statistics) = &self.statistics {
            statistics.record_event(event);
        }
    }

    async fn fan_out(&mut self, ctx: &mut SessionContext, command: &Command) -> Result<Status, ContextError> {
        let phase = command.phase();
        let macros = ctx.macros().defined(phase).cloned();
        let responses = if phase == Phase::EndOfMessage {
            self.broadcast_with_progress(ctx, command, macros.as_ref()).await?
        } else {
            self.children.broadcast(command, macros.as_ref()).await
        };
        let verdict = self.reduce(ctx.tag(), phase, responses);
        log::debug!(
            "{} {} -> {}{}",
            ctx.tag(),
            phase,
            verdict.status,
            verdict
                .winner
                .map(|index| format!(" ({})", self.children.child(index).name()))
                .unwrap_or_default()
        );
        self.conclude(ctx, phase, verdict).await
    }

    /// Broadcasts end-of-message while keeping the MTA from timing out.
    async fn broadcast_with_progress(
        &mut self,
        ctx: &mut SessionContext,
        command: &Command,
        macros: Option<&MacroMap>,
    ) -> Result<Vec<(usize, Result<ChildResponse, UpstreamError>)>, ContextError> {
        let Some(period) = self.settings.progress_interval else {
            return Ok(self.children.broadcast(command, macros).await);
        };
        let broadcast = self.children.broadcast(command, macros);
        tokio::pin!(broadcast);
        let mut keepalive = tokio::time::interval(period);
        // the first tick completes immediately
        keepalive.tick().await;
        loop {
            tokio::select! {
                responses = &mut broadcast => return Ok(responses),
                _ = keepalive.tick() => ctx.progress().await?,
            }
        }
    }

    fn reduce(
        &self,
        tag: &str,
        phase: Phase,
        responses: Vec<(usize, Result<ChildResponse, UpstreamError>)>,
    ) -> Verdict {
        let mut verdict = Verdict::new();
        for (index, result) in responses {
            let child = self.children.child(index);
            let (vote, reply_code) = match result {
                Ok(response) => {
                    if !response.status.is_abstention() {
                        self.record(StatEvent::ChildVerdict {
                            child_name: child.name().to_string(),
                            status: response.status,
                            evaluation: child.evaluation_mode(),
                        });
                    }
                    if response.status.is_terminal() {
                        verdict.terminal.push((index, response.status));
                    }
                    if response.status == Status::Skip {
                        verdict.skipped.push(index);
                    }
                    if child.evaluation_mode() {
                        if !response.status.is_abstention() {
                            log::info!(
                                "{} evaluation child {} answered {} at {}",
                                tag,
                                child.name(),
                                response.status,
                                phase
                            );
                        }
                        continue;
                    }
                    if !response.edits.is_empty() {
                        verdict.edits.push((index, response.edits));
                    }
                    (response.status, response.reply_code)
                }
                Err(e) => {
                    self.record(StatEvent::ChildFailure {
                        child_name: child.name().to_string(),
                        reason: e.to_string(),
                    });
                    (self.settings.fallback_status_at_disconnect, None)
                }
            };
            if vote.rank() > verdict.status.rank() {
                verdict.status = vote;
                verdict.winner = Some(index);
                verdict.reply_code = reply_code;
            }
        }
        if verdict.status.is_abstention() {
            verdict.status = self.settings.fallback_status;
            verdict.winner = None;
            verdict.reply_code = None;
        }
        verdict
    }

    async fn conclude(
        &mut self,
        ctx: &mut SessionContext,
        phase: Phase,
        verdict: Verdict,
    ) -> Result<Status, ContextError> {
        let status = verdict.status;
        for index in &verdict.skipped {
            self.children.skip_body(*index);
        }

        // a terminal answer ends the answering child's part
        for (index, own) in &verdict.terminal {
            match phase {
                Phase::Connect | Phase::Helo => self.children.stop(*index).await,
                p if p.is_message() && !recipient_scoped(p, *own) => {
                    self.children.finish_message(*index)
                }
                _ => {}
            }
        }

        if status.is_terminal() && !recipient_scoped(phase, status) {
            match phase {
                Phase::Connect | Phase::Helo => self.children.quit_all().await,
                p if p.is_message() && p != Phase::EndOfMessage => {
                    let done: Vec<usize> = verdict.terminal.iter().map(|(index, _)| *index).collect();
                    self.children.abort_message(&done).await;
                }
                _ => {}
            }
        }

        if phase == Phase::EndOfMessage && matches!(status, Status::Continue | Status::Accept) {
            self.apply_edits(ctx, verdict.edits).await?;
        }

        if matches!(status, Status::Reject | Status::TemporaryFailure) {
            if let Some(text) = verdict.reply_code {
                match ReplyCode::parse(&text) {
                    Ok(code) if code.is_temporary() == (status == Status::TemporaryFailure) => {
                        ctx.set_reply_code(code)
                    }
                    Ok(_) => log::warn!("{} reply code <{}> does not match {}", ctx.tag(), text, status),
                    Err(e) => log::warn!("{} dropping reply code: {}", ctx.tag(), e),
                }
            }
        }
        Ok(status)
    }

    fn negotiated_actions(&self, index: usize) -> ActionFlags {
        self.children
            .child(index)
            .context()
            .option()
            .map(|option| option.actions)
            .unwrap_or(ActionFlags::empty())
    }

    /// Forwards end-of-message edits, child by child in completion order.
    /// Only one child's body replacement reaches the MTA: the last child to
    /// complete that was allowed to replace the body.
    async fn apply_edits(
        &mut self,
        ctx: &mut SessionContext,
        edits: Vec<(usize, Vec<Edit>)>,
    ) -> Result<(), ContextError> {
        let body_owner = edits
            .iter()
            .rev()
            .find(|(index, edits)| {
                self.negotiated_actions(*index).contains(ActionFlags::CHANGE_BODY)
                    && edits.iter().any(|edit| matches!(edit, Edit::ReplaceBody(_)))
            })
            .map(|(index, _)| *index);
        for (index, edits) in edits {
            let name = self.children.child(index).name().to_string();
            let allowed = self.negotiated_actions(index);
            let mut dropped_body = false;
            for edit in edits {
                let required = edit.required_action();
                if !allowed.contains(required) {
                    log::warn!("{} {} sent {:?} without negotiating it", ctx.tag(), name, required);
                    continue;
                }
                if matches!(edit, Edit::ReplaceBody(_)) && body_owner != Some(index) {
                    if !dropped_body {
                        dropped_body = true;
                        if let Some(owner) = body_owner {
                            log::info!(
                                "{} dropping body replacement from {} in favour of {}",
                                ctx.tag(),
                                name,
                                self.children.child(owner).name()
                            );
                        }
                    }
                    continue;
                }
                let result = match &edit {
                    Edit::AddHeader { name, value } => ctx.add_header(name, value).await,
                    Edit::InsertHeader { index, name, value } => {
                        ctx.insert_header(*index, name, value).await
                    }
                    Edit::ChangeHeader { index, name, value } => {
                        ctx.change_header(name, *index, value).await
                    }
                    Edit::ChangeFrom { from, parameters } => {
                        ctx.change_from(from, parameters.as_deref()).await
                    }
                    Edit::AddRecipient {
                        recipient,
                        parameters,
                    } => ctx.add_recipient(recipient, parameters.as_deref()).await,
                    Edit::DeleteRecipient(recipient) => ctx.delete_recipient(recipient).await,
                    Edit::ReplaceBody(chunk) => ctx.replace_body(chunk).await,
                    Edit::Quarantine(reason) => ctx.quarantine(reason).await,
                };
                match result {
                    Ok(()) => {}
                    Err(e @ (ContextError::InvalidAction { .. } | ContextError::Empty(_))) => {
                        log::warn!("{} dropping edit from {}: {}", ctx.tag(), name, e)
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SessionHandler for Leader {
    async fn negotiate(
        &mut self,
        ctx: &mut SessionContext,
        offered: &MilterOption,
    ) -> Result<Status, ContextError> {
        self.offered = Some(*offered);
        let (merged, requests) = self.children.negotiate(offered).await;
        let option = match merged {
            Some(merged) => merged.intersect(offered),
            None => {
                log::warn!("{} no child could be negotiated", ctx.tag());
                MilterOption::new(offered.version, ActionFlags::empty(), StepFlags::empty())
            }
        };
        log::debug!(
            "{} negotiated version {} actions {:?} steps {:?}",
            ctx.tag(),
            option.version,
            option.actions,
            option.steps
        );
        ctx.set_negotiated(option, requests);
        Ok(Status::AllOptions)
    }

    async fn connect(
        &mut self,
        ctx: &mut SessionContext,
        host: &str,
        address: &ConnectAddress,
    ) -> Result<Status, ContextError> {
        if self.renegotiate {
            self.renegotiate = false;
            if let Some(offered) = self.offered {
                let (merged, _) = self.children.negotiate(&offered).await;
                if merged.is_none() {
                    log::warn!("{} no child could be negotiated again", ctx.tag());
                }
            }
        }
        let option = ctx.option().copied().unwrap_or_default();
        let info = ConnectInfo {
            host,
            address,
            macros: ctx.macros(),
        };
        self.children.apply_conditions(&info, &option).await;
        log::info!("{} connect from {} [{:?}]", ctx.tag(), host, address);
        let command = Command::Connect {
            host: host.to_string(),
            address: address.clone(),
        };
        self.fan_out(ctx, &command).await
    }

    async fn helo(&mut self, ctx: &mut SessionContext, fqdn: &str) -> Result<Status, ContextError> {
        self.fan_out(ctx, &Command::Helo(fqdn.to_string())).await
    }

    async fn envelope_from(
        &mut self,
        ctx: &mut SessionContext,
        address: &str,
        parameters: &[String],
    ) -> Result<Status, ContextError> {
        self.children.reset_message();
        let command = Command::EnvelopeFrom {
            address: address.to_string(),
            parameters: parameters.to_vec(),
        };
        self.fan_out(ctx, &command).await
    }

    async fn envelope_recipient(
        &mut self,
        ctx: &mut SessionContext,
        address: &str,
        parameters: &[String],
    ) -> Result<Status, ContextError> {
        let command = Command::EnvelopeRecipient {
            address: address.to_string(),
            parameters: parameters.to_vec(),
        };
        self.fan_out(ctx, &command).await
    }

    async fn data(&mut self, ctx: &mut SessionContext) -> Result<Status, ContextError> {
        self.fan_out(ctx, &Command::Data).await
    }

    async fn unknown(&mut self, ctx: &mut SessionContext, command: &str) -> Result<Status, ContextError> {
        self.fan_out(ctx, &Command::Unknown(command.to_string())).await
    }

    async fn header(
        &mut self,
        ctx: &mut SessionContext,
        name: &str,
        value: &str,
    ) -> Result<Status, ContextError> {
        let command = Command::Header {
            name: name.to_string(),
            value: value.to_string(),
        };
        self.fan_out(ctx, &command).await
    }

    async fn end_of_header(&mut self, ctx: &mut SessionContext) -> Result<Status, ContextError> {
        self.fan_out(ctx, &Command::EndOfHeader).await
    }

    async fn body(&mut self, ctx: &mut SessionContext, chunk: &Bytes) -> Result<Status, ContextError> {
        self.fan_out(ctx, &Command::Body(chunk.clone())).await
    }

    async fn end_of_message(
        &mut self,
        ctx: &mut SessionContext,
        chunk: &Bytes,
    ) -> Result<Status, ContextError> {
        self.fan_out(ctx, &Command::EndOfMessage(chunk.clone())).await
    }

    async fn abort(&mut self, ctx: &mut SessionContext) -> Result<(), ContextError> {
        log::debug!("{} abort", ctx.tag());
        self.children.abort_message(&[]).await;
        self.children.reset_message();
        Ok(())
    }

    async fn reset(&mut self, ctx: &mut SessionContext) -> Result<(), ContextError> {
        log::debug!("{} children start over for a new connection", ctx.tag());
        self.children.prepare_new_connection().await;
        self.renegotiate = true;
        Ok(())
    }

    async fn finished(&mut self, ctx: &mut SessionContext, error: Option<&ContextError>) {
        if let Some(e) = error {
            log::debug!("{} closing children after error: {}", ctx.tag(), e);
        }
        self.children.abort_message(&[]).await;
        self.children.quit_all().await;
    }
}
