//! The set of child filters serving one MTA session.

use crate::codec::{Command, MacroRequests};
use crate::condition::{ConditionSet, ConnectInfo};
use crate::config::{ChildConfig, ConditionAction, Config};
use crate::macros::{merge_requests, MacroMap};
use crate::option::MilterOption;
use crate::protocol::{ActionFlags, Phase};
use crate::upstream::{ChildResponse, Connector, UpstreamContext, UpstreamError};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;

/// Whether a child takes part in the rest of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participation {
    Active,
    /// Sat out by an applicable condition or a terminal verdict at
    /// connection level.
    Stopped,
    /// Broke the protocol, timed out or went away.
    Failed,
}

pub struct Child {
    context: UpstreamContext,
    applicable_conditions: Vec<String>,
    evaluation_mode: bool,
    participation: Participation,
    message_done: bool,
    skip_body: bool,
}

impl Child {
    fn new(config: &ChildConfig, allowed_actions: ActionFlags) -> Self {
        Child {
            context: UpstreamContext::new(
                &config.name,
                config.connection_spec.clone(),
                config.timeouts(),
                allowed_actions,
            ),
            applicable_conditions: config.applicable_conditions.clone(),
            evaluation_mode: config.evaluation_mode,
            participation: Participation::Active,
            message_done: false,
            skip_body: false,
        }
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    pub fn context(&self) -> &UpstreamContext {
        &self.context
    }

    pub fn evaluation_mode(&self) -> bool {
        self.evaluation_mode
    }

    pub fn participation(&self) -> Participation {
        self.participation
    }

    pub fn is_active(&self) -> bool {
        self.participation == Participation::Active
    }

    /// Whether the child should see an event of `phase` now.
    fn participates(&self, phase: Phase) -> bool {
        if !self.is_active() {
            return false;
        }
        if phase.is_message() && self.message_done {
            return false;
        }
        !(phase == Phase::Body && self.skip_body)
    }

    fn fail(&mut self, error: &UpstreamError) {
        log::warn!("{} removed from session: {}", self.context.tag(), error);
        self.participation = Participation::Failed;
    }
}

pub struct ChildrenRegistry {
    children: Vec<Child>,
    conditions: Arc<ConditionSet>,
    connector: Arc<dyn Connector>,
}

/// Builds the per-session children from the configuration. Disabled
/// children and children with unusable action lists are left out.
pub fn create_children_for_session(
    config: &Config,
    conditions: Arc<ConditionSet>,
    connector: Arc<dyn Connector>,
) -> ChildrenRegistry {
    let children = config
        .children
        .iter()
        .filter(|child| child.enabled)
        .filter_map(|child| match child.allowed_actions() {
            Ok(allowed) => Some(Child::new(child, allowed)),
            Err(e) => {
                log::error!("skipping child: {e}");
                None
            }
        })
        .collect();
    ChildrenRegistry {
        children,
        conditions,
        connector,
    }
}

impl ChildrenRegistry {
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn child(&self, index: usize) -> &Child {
        &self.children[index]
    }

    pub fn children(&self) -> impl Iterator<Item = &Child> {
        self.children.iter()
    }

    pub fn active_count(&self) -> usize {
        self.children.iter().filter(|child| child.is_active()).count()
    }

    /// Connects every active child and negotiates with it concurrently.
    /// Returns the merged option of the children that answered, `None`
    /// when none did, and their merged macro requests.
    pub async fn negotiate(&mut self, offered: &MilterOption) -> (Option<MilterOption>, MacroRequests) {
        let connector = self.connector.as_ref();
        let mut pending: FuturesUnordered<_> = self
            .children
            .iter_mut()
            .enumerate()
            .filter(|(_, child)| child.is_active())
            .map(|(index, child)| async move {
                let result = match child.context.connect(connector).await {
                    Ok(()) => child.context.negotiate(offered).await,
                    Err(e) => Err(e),
                };
                (index, result)
            })
            .collect();
        let mut results = Vec::new();
        while let Some(result) = pending.next().await {
            results.push(result);
        }
        drop(pending);

        let mut merged: Option<MilterOption> = None;
        for (index, result) in results {
            let child = &mut self.children[index];
            match result {
                Ok(option) => match merged.as_mut() {
                    Some(merged) => merged.merge(&option),
                    None => merged = Some(option),
                },
                Err(e) => child.fail(&e),
            }
        }
        let requests = merge_requests(
            self.children
                .iter()
                .filter(|child| child.is_active())
                .map(|child| child.context.macro_requests()),
        );
        (merged, requests)
    }

    /// Evaluates applicable conditions for the new SMTP client. Stopped
    /// children are told to quit; retargeted children are reconnected and
    /// negotiated again with `option`.
    pub async fn apply_conditions(&mut self, info: &ConnectInfo<'_>, option: &MilterOption) {
        for index in 0..self.children.len() {
            let child = &self.children[index];
            if !child.is_active() || child.applicable_conditions.is_empty() {
                continue;
            }
            let Some(action) = self.conditions.check(&child.applicable_conditions, info) else {
                continue;
            };
            let action = action.clone();
            let child = &mut self.children[index];
            match action {
                ConditionAction::Stop => {
                    log::info!("{} stopped for {}", child.context.tag(), info.host);
                    child.context.quit().await;
                    child.participation = Participation::Stopped;
                }
                ConditionAction::Retarget { connection_spec } => {
                    if *child.context.spec() == connection_spec {
                        continue;
                    }
                    child.context.retarget(connection_spec).await;
                    let result = match child.context.connect(self.connector.as_ref()).await {
                        Ok(()) => child.context.negotiate(option).await.map(|_| ()),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        child.fail(&e);
                    }
                }
            }
        }
    }

    /// Sends `command` to every participating child at once and collects
    /// their answers in completion order. Children that fail are removed
    /// from the rest of the session.
    pub async fn broadcast(
        &mut self,
        command: &Command,
        macros: Option<&MacroMap>,
    ) -> Vec<(usize, Result<ChildResponse, UpstreamError>)> {
        let phase = command.phase();
        let mut pending: FuturesUnordered<_> = self
            .children
            .iter_mut()
            .enumerate()
            .filter(|(_, child)| child.participates(phase))
            .map(|(index, child)| async move { (index, child.context.send(command, macros).await) })
            .collect();
        let mut responses = Vec::new();
        while let Some(response) = pending.next().await {
            responses.push(response);
        }
        drop(pending);

        for (index, response) in &responses {
            if let Err(e) = response {
                self.children[*index].fail(e);
            }
        }
        responses
    }

    /// The child has nothing more to say about the current message.
    pub fn finish_message(&mut self, index: usize) {
        self.children[index].message_done = true;
    }

    /// The child skips the remaining body chunks of the current message.
    pub fn skip_body(&mut self, index: usize) {
        self.children[index].skip_body = true;
    }

    /// Aborts the current message at every active child still inside it,
    /// except the ones listed.
    pub async fn abort_message(&mut self, except: &[usize]) {
        let mut pending: FuturesUnordered<_> = self
            .children
            .iter_mut()
            .enumerate()
            .filter(|(index, child)| child.is_active() && !except.contains(index))
            .map(|(index, child)| async move {
                child.message_done = true;
                (index, child.context.abort().await)
            })
            .collect();
        let mut failures = Vec::new();
        while let Some((index, result)) = pending.next().await {
            if let Err(e) = result {
                failures.push((index, e));
            }
        }
        drop(pending);
        for (index, e) in failures {
            self.children[index].fail(&e);
        }
    }

    /// Clears per-message flags before the next message.
    pub fn reset_message(&mut self) {
        for child in &mut self.children {
            child.message_done = false;
            child.skip_body = false;
        }
    }

    /// Ends the connection for one child.
    pub async fn stop(&mut self, index: usize) {
        let child = &mut self.children[index];
        if child.is_active() {
            child.context.quit().await;
            child.participation = Participation::Stopped;
        }
    }

    /// Ends the connection for every child still talking.
    pub async fn quit_all(&mut self) {
        let pending: FuturesUnordered<_> = self
            .children
            .iter_mut()
            .filter(|child| child.context.is_connected())
            .map(|child| async move {
                child.context.quit().await;
                if child.participation == Participation::Active {
                    child.participation = Participation::Stopped;
                }
            })
            .collect();
        pending.collect::<Vec<()>>().await;
    }

    /// Starts over for a new SMTP connection on the same MTA socket:
    /// every child quits and becomes eligible again, to be negotiated on
    /// the next connect.
    pub async fn prepare_new_connection(&mut self) {
        self.quit_all().await;
        for child in &mut self.children {
            child.context.reset();
            child.participation = Participation::Active;
            child.message_done = false;
            child.skip_body = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ConnectAddress, Reply};
    use crate::macros::MacroStore;
    use crate::protocol::{Status, StepFlags};
    use crate::test_support::{continuing, names, scripted, FakeConnector};

    fn config(children: &[(&str, &str)]) -> Config {
        Config {
            children: children
                .iter()
                .map(|(name, spec)| ChildConfig::new(name, spec.parse().unwrap()))
                .collect(),
            applicable_conditions: Vec::new(),
            ..Config::default()
        }
    }

    fn registry(config: &Config, connector: &FakeConnector) -> ChildrenRegistry {
        let conditions = ConditionSet::compile(&config.applicable_conditions).unwrap();
        create_children_for_session(config, Arc::new(conditions), Arc::new(connector.clone()))
    }

    fn connect() -> Command {
        Command::Connect {
            host: "client.example.org".into(),
            address: ConnectAddress::Inet {
                port: 4000,
                address: "192.0.2.8".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_negotiate_merges_children() {
        let connector = FakeConnector::default();
        connector.add(
            "unix:/fake/a",
            scripted(
                MilterOption::new(6, ActionFlags::ADD_HEADERS, StepFlags::NO_BODY | StepFlags::NO_HELO),
                |_| vec![Reply::Continue],
            ),
        );
        connector.add(
            "unix:/fake/b",
            scripted(
                MilterOption::new(6, ActionFlags::QUARANTINE, StepFlags::NO_BODY),
                |_| vec![Reply::Continue],
            ),
        );
        let config = config(&[("a", "unix:/fake/a"), ("b", "unix:/fake/b")]);
        let mut children = registry(&config, &connector);

        let offered = MilterOption::new(6, ActionFlags::all(), StepFlags::NO_MASK);
        let (merged, _) = children.negotiate(&offered).await;
        let merged = merged.unwrap();
        assert_eq!(merged.actions, ActionFlags::ADD_HEADERS | ActionFlags::QUARANTINE);
        assert_eq!(merged.steps, StepFlags::NO_BODY);
    }

    #[tokio::test]
    async fn test_unreachable_child_is_failed() {
        let connector = FakeConnector::default();
        connector.add("unix:/fake/a", continuing());
        let config = config(&[("a", "unix:/fake/a"), ("gone", "unix:/fake/gone")]);
        let mut children = registry(&config, &connector);

        let (merged, _) = children.negotiate(&MilterOption::default()).await;
        assert!(merged.is_some());
        assert_eq!(children.child(1).participation(), Participation::Failed);
        assert_eq!(children.active_count(), 1);

        let responses = children.broadcast(&connect(), None).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, 0);
    }

    #[tokio::test]
    async fn test_disabled_child_is_not_created() {
        let connector = FakeConnector::default();
        let mut config = config(&[("a", "unix:/fake/a"), ("b", "unix:/fake/b")]);
        config.children[1].enabled = false;
        let children = registry(&config, &connector);
        assert_eq!(children.len(), 1);
        assert_eq!(children.child(0).name(), "a");
    }

    #[tokio::test]
    async fn test_stop_condition_quits_child() {
        let connector = FakeConnector::default();
        let a = connector.add("unix:/fake/a", continuing());
        let b = connector.add("unix:/fake/b", continuing());
        let mut config = config(&[("a", "unix:/fake/a"), ("b", "unix:/fake/b")]);
        config.applicable_conditions = vec![crate::config::ConditionConfig {
            name: "documentation".into(),
            description: None,
            criteria: crate::config::Criteria::RemoteNetwork {
                networks: vec!["192.0.2.0/24".into()],
            },
            action: ConditionAction::Stop,
        }];
        config.children[1].applicable_conditions = vec!["documentation".into()];
        let mut children = registry(&config, &connector);

        let (merged, _) = children.negotiate(&MilterOption::default()).await;
        let option = merged.unwrap();
        let macros = MacroStore::new();
        let address = ConnectAddress::Inet {
            port: 4000,
            address: "192.0.2.8".into(),
        };
        let info = ConnectInfo {
            host: "client.example.org",
            address: &address,
            macros: &macros,
        };
        children.apply_conditions(&info, &option).await;
        assert_eq!(children.child(1).participation(), Participation::Stopped);

        let responses = children.broadcast(&connect(), None).await;
        assert_eq!(responses.len(), 1);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(names(&a), vec!["negotiate", "connect"]);
        assert_eq!(names(&b), vec!["negotiate", "quit"]);
    }

    #[tokio::test]
    async fn test_retarget_condition_reconnects() {
        let connector = FakeConnector::default();
        let original = connector.add("unix:/fake/a", continuing());
        let moved = connector.add("unix:/fake/a-local", continuing());
        let mut config = config(&[("a", "unix:/fake/a")]);
        config.applicable_conditions = vec![crate::config::ConditionConfig {
            name: "local".into(),
            description: None,
            criteria: crate::config::Criteria::LocalConnection,
            action: ConditionAction::Retarget {
                connection_spec: "unix:/fake/a-local".parse().unwrap(),
            },
        }];
        config.children[0].applicable_conditions = vec!["local".into()];
        let mut children = registry(&config, &connector);
        let (merged, _) = children.negotiate(&MilterOption::default()).await;

        let macros = MacroStore::new();
        let address = ConnectAddress::Unix("/run/smtp".into());
        let info = ConnectInfo {
            host: "localhost",
            address: &address,
            macros: &macros,
        };
        children.apply_conditions(&info, &merged.unwrap()).await;
        let responses = children.broadcast(&connect(), None).await;
        assert_eq!(responses[0].1.as_ref().unwrap().status, Status::Continue);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(names(&original), vec!["negotiate", "quit"]);
        assert_eq!(names(&moved), vec!["negotiate", "connect"]);
    }

    #[tokio::test]
    async fn test_finished_message_skips_children_until_reset() {
        let connector = FakeConnector::default();
        connector.add("unix:/fake/a", continuing());
        connector.add("unix:/fake/b", continuing());
        let config = config(&[("a", "unix:/fake/a"), ("b", "unix:/fake/b")]);
        let mut children = registry(&config, &connector);
        children.negotiate(&MilterOption::default()).await;
        children.broadcast(&connect(), None).await;

        let from = Command::EnvelopeFrom {
            address: "<a@example.org>".into(),
            parameters: vec![],
        };
        assert_eq!(children.broadcast(&from, None).await.len(), 2);
        children.finish_message(0);
        let rcpt = Command::EnvelopeRecipient {
            address: "<b@example.org>".into(),
            parameters: vec![],
        };
        let responses = children.broadcast(&rcpt, None).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, 1);

        children.abort_message(&[]).await;
        children.reset_message();
        assert_eq!(children.broadcast(&from, None).await.len(), 2);
    }
}
