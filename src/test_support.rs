//! Socket-free fakes for MTA and child filter peers.

use crate::codec::{Command, FilterCodec, MacroRequests, MtaCodec, Reply};
use crate::option::MilterOption;
use crate::protocol::Phase;
use crate::session::{SessionContext, SessionSettings};
use crate::socket::{BoxedStream, ConnectionSpec};
use crate::upstream::Connector;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

pub(crate) type MtaSide = Framed<DuplexStream, MtaCodec>;

/// Answers of a fake child, by command.
pub(crate) type Script = Arc<dyn Fn(&Command) -> Vec<Reply> + Send + Sync>;

/// Commands a fake child received, in order.
pub(crate) type CommandLog = Arc<Mutex<Vec<Command>>>;

pub(crate) fn mta_pair(settings: SessionSettings) -> (SessionContext, MtaSide) {
    let (ours, theirs) = tokio::io::duplex(1 << 20);
    let ctx = SessionContext::new(1, Box::new(ours), settings);
    (ctx, Framed::new(theirs, MtaCodec))
}

pub(crate) async fn send(mta: &mut MtaSide, command: Command) {
    mta.send(command).await.unwrap();
}

pub(crate) async fn recv_reply(mta: &mut MtaSide) -> Reply {
    tokio::time::timeout(Duration::from_secs(2), mta.next())
        .await
        .expect("reply in time")
        .expect("connection open")
        .unwrap()
}

pub(crate) async fn assert_silent(mta: &mut MtaSide) {
    let next = tokio::time::timeout(Duration::from_millis(50), mta.next()).await;
    assert!(next.is_err(), "unexpected packet: {next:?}");
}

/// Child that negotiates `option` and answers everything else with `answer`.
pub(crate) fn scripted<F>(option: MilterOption, answer: F) -> Script
where
    F: Fn(&Command) -> Vec<Reply> + Send + Sync + 'static,
{
    Arc::new(move |command: &Command| match command {
        Command::Negotiate(_) => vec![Reply::Negotiate {
            option,
            macro_requests: MacroRequests::new(),
        }],
        other => answer(other),
    })
}

/// Child that continues at every event.
pub(crate) fn continuing() -> Script {
    scripted(MilterOption::default(), |_| vec![Reply::Continue])
}

/// Extra wait before a child answers commands of one phase.
#[derive(Clone, Copy)]
pub(crate) struct Delay {
    pub phase: Phase,
    pub wait: Duration,
}

#[derive(Clone)]
struct FakeChild {
    script: Script,
    log: CommandLog,
    delay: Option<Delay>,
}

async fn serve(stream: DuplexStream, child: FakeChild) {
    let mut framed = Framed::new(stream, FilterCodec);
    while let Some(Ok(command)) = framed.next().await {
        child.log.lock().unwrap().push(command.clone());
        let replies = match command {
            Command::DefineMacro { .. } | Command::Abort => continue,
            Command::Quit => break,
            ref other => (child.script)(other),
        };
        if let Some(delay) = child.delay.filter(|d| d.phase == command.phase()) {
            tokio::time::sleep(delay.wait).await;
        }
        for reply in replies {
            if framed.send(reply).await.is_err() {
                return;
            }
        }
    }
}

/// Maps connection specs to in-memory scripted children.
#[derive(Default, Clone)]
pub(crate) struct FakeConnector {
    children: Arc<Mutex<HashMap<String, FakeChild>>>,
}

impl FakeConnector {
    pub(crate) fn add(&self, spec: &str, script: Script) -> CommandLog {
        self.add_delayed(spec, script, None)
    }

    pub(crate) fn add_delayed(&self, spec: &str, script: Script, delay: Option<Delay>) -> CommandLog {
        let log = CommandLog::default();
        let key = spec.parse::<ConnectionSpec>().unwrap().to_string();
        let child = FakeChild {
            script,
            log: log.clone(),
            delay,
        };
        self.children.lock().unwrap().insert(key, child);
        log
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, spec: &ConnectionSpec) -> io::Result<BoxedStream> {
        let key = spec.to_string();
        let entry = self.children.lock().unwrap().get(&key).cloned();
        let Some(child) = entry else {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, key));
        };
        let (ours, theirs) = tokio::io::duplex(1 << 20);
        tokio::spawn(serve(theirs, child));
        Ok(Box::new(ours))
    }
}

/// Names of the commands in a log, for compact assertions.
pub(crate) fn names(log: &CommandLog) -> Vec<&'static str> {
    log.lock().unwrap().iter().map(Command::name).collect()
}
