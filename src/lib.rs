pub mod agent;
pub mod children;
pub mod codec;
pub mod condition;
pub mod config;
pub mod error;
pub mod leader;
pub mod macros;
pub mod message_result;
pub mod option;
pub mod protocol;
pub mod reply;
pub mod server;
pub mod session;
pub mod socket;
pub mod statistics;
pub mod upstream;

#[cfg(test)]
mod test_support;

pub use children::{create_children_for_session, ChildrenRegistry};
pub use codec::{Command, ConnectAddress, Reply};
pub use config::Config;
pub use error::{CodecError, ContextError};
pub use leader::{Leader, LeaderSettings};
pub use option::MilterOption;
pub use protocol::{ActionFlags, Phase, Status, StepFlags};
pub use server::{ManagerContext, SessionObserver, SessionSummary};
pub use session::{run_session, SessionContext, SessionHandler};
pub use statistics::{StatEvent, StatisticsCollector};
