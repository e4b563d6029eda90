use crate::protocol::{ActionFlags, Status};
use crate::session::SessionSettings;
use crate::socket::ConnectionSpec;
use crate::upstream::ChildTimeouts;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate child name '{0}'")]
    DuplicateChild(String),
    #[error("duplicate condition name '{0}'")]
    DuplicateCondition(String),
    #[error("child '{child}' refers to unknown condition '{condition}'")]
    UnknownCondition { child: String, condition: String },
    #[error("child '{child}': unknown action '{action}'")]
    UnknownAction { child: String, action: String },
    #[error("{field} must be a status that can be sent to the MTA, not '{status}'")]
    UnsendableStatus { field: &'static str, status: Status },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub children: Vec<ChildConfig>,
    #[serde(default)]
    pub applicable_conditions: Vec<ConditionConfig>,
    #[serde(default)]
    pub statistics: Option<StatisticsConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeFlavor {
    CurrentThread,
    MultiThread,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub connection_spec: ConnectionSpec,
    pub fallback_status: Status,
    pub fallback_status_at_disconnect: Status,
    /// Seconds of MTA silence before a session is dropped.
    pub session_timeout: u64,
    pub packet_buffer_size: usize,
    /// Concurrent sessions before new connections wait; 0 disables.
    pub max_connections: usize,
    pub suspend_time_on_unacceptable: u64,
    /// Finished sessions between maintenance runs.
    pub maintenance_interval: u32,
    pub shutdown_timeout: u64,
    /// Seconds between progress packets sent to the MTA while children
    /// work on end-of-message; 0 disables.
    pub progress_interval: u64,
    pub runtime: RuntimeFlavor,
    pub worker_threads: Option<usize>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            connection_spec: ConnectionSpec::Inet {
                port: 10025,
                host: Some("127.0.0.1".to_string()),
            },
            fallback_status: Status::Continue,
            fallback_status_at_disconnect: Status::TemporaryFailure,
            session_timeout: 7210,
            packet_buffer_size: 0,
            max_connections: 0,
            suspend_time_on_unacceptable: 5,
            maintenance_interval: 10,
            shutdown_timeout: 30,
            progress_interval: 60,
            runtime: RuntimeFlavor::MultiThread,
            worker_threads: None,
        }
    }
}

impl ManagerConfig {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            timeout: Duration::from_secs(self.session_timeout),
            packet_buffer_size: self.packet_buffer_size,
        }
    }

    pub fn progress_interval(&self) -> Option<Duration> {
        (self.progress_interval > 0).then(|| Duration::from_secs(self.progress_interval))
    }
}

fn default_true() -> bool {
    true
}

fn default_connection_timeout() -> u64 {
    300
}

fn default_writing_timeout() -> u64 {
    10
}

fn default_reading_timeout() -> u64 {
    10
}

fn default_end_of_message_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildConfig {
    pub name: String,
    pub connection_spec: ConnectionSpec,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Verdicts are logged but never sent to the MTA.
    #[serde(default)]
    pub evaluation_mode: bool,
    /// Actions the child may use, e.g. `add-headers`; all when unset.
    #[serde(default)]
    pub actions: Option<Vec<String>>,
    #[serde(default)]
    pub applicable_conditions: Vec<String>,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default = "default_writing_timeout")]
    pub writing_timeout: u64,
    #[serde(default = "default_reading_timeout")]
    pub reading_timeout: u64,
    #[serde(default = "default_end_of_message_timeout")]
    pub end_of_message_timeout: u64,
}

/// Parses an action name such as `add-headers` or `ADD_HEADERS`.
pub fn parse_action(name: &str) -> Option<ActionFlags> {
    ActionFlags::from_name(&name.trim().to_ascii_uppercase().replace('-', "_"))
}

impl ChildConfig {
    pub fn new(name: &str, connection_spec: ConnectionSpec) -> Self {
        ChildConfig {
            name: name.to_string(),
            connection_spec,
            enabled: true,
            evaluation_mode: false,
            actions: None,
            applicable_conditions: Vec::new(),
            connection_timeout: default_connection_timeout(),
            writing_timeout: default_writing_timeout(),
            reading_timeout: default_reading_timeout(),
            end_of_message_timeout: default_end_of_message_timeout(),
        }
    }

    pub fn allowed_actions(&self) -> Result<ActionFlags, ConfigError> {
        let Some(names) = &self.actions else {
            return Ok(ActionFlags::all());
        };
        names.iter().try_fold(ActionFlags::empty(), |allowed, name| {
            parse_action(name)
                .map(|action| allowed | action)
                .ok_or_else(|| ConfigError::UnknownAction {
                    child: self.name.clone(),
                    action: name.clone(),
                })
        })
    }

    pub fn timeouts(&self) -> ChildTimeouts {
        ChildTimeouts {
            connection: Duration::from_secs(self.connection_timeout),
            writing: Duration::from_secs(self.writing_timeout),
            reading: Duration::from_secs(self.reading_timeout),
            end_of_message: Duration::from_secs(self.end_of_message_timeout),
        }
    }
}

/// Named rule deciding, at connect, what happens to the children that
/// list it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub criteria: Criteria,
    pub action: ConditionAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Criteria {
    /// Regex over the host name the MTA reported.
    HostPattern { pattern: String },
    /// Regex over the textual client address (IP or socket path).
    AddressPattern { pattern: String },
    /// Client IP inside any of the CIDR blocks.
    RemoteNetwork { networks: Vec<String> },
    /// Loopback or unix socket clients.
    LocalConnection,
    /// Regex over a connect-time macro, e.g. `daemon_name`.
    MacroPattern { name: String, pattern: String },
    And { criteria: Vec<Criteria> },
    Or { criteria: Vec<Criteria> },
    Not { criteria: Box<Criteria> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConditionAction {
    /// The child sits this connection out.
    Stop,
    /// The child is reached at another address for this connection.
    Retarget { connection_spec: ConnectionSpec },
}

fn default_flush_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    pub enabled: bool,
    /// JSON snapshot file.
    pub path: String,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_seconds: u64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        StatisticsConfig {
            enabled: true,
            path: "/var/lib/milter-fanout/stats.json".to_string(),
            flush_interval_seconds: default_flush_interval(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut spamd = ChildConfig::new(
            "spamd",
            ConnectionSpec::Unix("/var/run/spamass-milter.sock".into()),
        );
        spamd.actions = Some(vec!["add-headers".to_string(), "change-headers".to_string()]);
        spamd.applicable_conditions = vec!["trusted-network".to_string()];
        let clamav = ChildConfig::new(
            "clamav",
            ConnectionSpec::Inet {
                port: 7357,
                host: Some("127.0.0.1".to_string()),
            },
        );
        Config {
            manager: ManagerConfig::default(),
            children: vec![spamd, clamav],
            applicable_conditions: vec![ConditionConfig {
                name: "trusted-network".to_string(),
                description: Some("Skip spam scoring for local submissions".to_string()),
                criteria: Criteria::Or {
                    criteria: vec![
                        Criteria::LocalConnection,
                        Criteria::RemoteNetwork {
                            networks: vec!["10.0.0.0/8".to_string(), "192.168.0.0/16".to_string()],
                        },
                    ],
                },
                action: ConditionAction::Stop,
            }],
            statistics: Some(StatisticsConfig::default()),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Checks everything serde cannot: names, references and statuses.
    /// Condition regexes are checked when they are compiled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, status) in [
            ("fallback_status", self.manager.fallback_status),
            (
                "fallback_status_at_disconnect",
                self.manager.fallback_status_at_disconnect,
            ),
        ] {
            if !status.is_replyable() || status == Status::Skip {
                return Err(ConfigError::UnsendableStatus { field, status });
            }
        }
        if self.manager.session_timeout == 0 {
            return Err(ConfigError::Zero("session_timeout"));
        }
        if self.manager.maintenance_interval == 0 {
            return Err(ConfigError::Zero("maintenance_interval"));
        }

        let mut conditions = HashSet::new();
        for condition in &self.applicable_conditions {
            if !conditions.insert(condition.name.as_str()) {
                return Err(ConfigError::DuplicateCondition(condition.name.clone()));
            }
        }

        let mut names = HashSet::new();
        for child in &self.children {
            if !names.insert(child.name.as_str()) {
                return Err(ConfigError::DuplicateChild(child.name.clone()));
            }
            child.allowed_actions()?;
            for condition in &child.applicable_conditions {
                if !conditions.contains(condition.as_str()) {
                    return Err(ConfigError::UnknownCondition {
                        child: child.name.clone(),
                        condition: condition.clone(),
                    });
                }
            }
            if child.reading_timeout == 0 || child.end_of_message_timeout == 0 {
                return Err(ConfigError::Zero("child read timeouts"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.manager.fallback_status, Status::Continue);
        assert_eq!(
            config.manager.fallback_status_at_disconnect,
            Status::TemporaryFailure
        );
        assert_eq!(config.manager.session_timeout, 7210);
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.children.len(), 2);
        assert_eq!(parsed.children[0].name, "spamd");
        assert_eq!(
            parsed.applicable_conditions[0].action,
            ConditionAction::Stop
        );
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
manager:
  connection_spec: "unix:/run/fanout.sock"
  fallback_status: temporary-failure
children:
  - name: clamav
    connection_spec: "inet:7357@127.0.0.1"
    actions: [add-headers, QUARANTINE]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.manager.fallback_status, Status::TemporaryFailure);
        assert_eq!(config.manager.maintenance_interval, 10);
        let child = &config.children[0];
        assert!(child.enabled);
        assert_eq!(child.reading_timeout, 10);
        assert_eq!(
            child.allowed_actions().unwrap(),
            ActionFlags::ADD_HEADERS | ActionFlags::QUARANTINE
        );
    }

    #[test]
    fn test_criteria_yaml() {
        let yaml = r#"
name: retarget-submission
criteria:
  type: And
  criteria:
    - type: HostPattern
      pattern: "\\.example\\.org$"
    - type: Not
      criteria:
        type: LocalConnection
action:
  type: Retarget
  connection_spec: "inet:11025@127.0.0.1"
"#;
        let condition: ConditionConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(condition.criteria, Criteria::And { .. }));
        assert_eq!(
            condition.action,
            ConditionAction::Retarget {
                connection_spec: "inet:11025@127.0.0.1".parse().unwrap()
            }
        );
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let mut config = Config::default();
        config.children[1].name = "spamd".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateChild(_))));

        let mut config = Config::default();
        config.children[0].applicable_conditions = vec!["nope".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownCondition { .. })
        ));

        let mut config = Config::default();
        config.children[0].actions = Some(vec!["teleport".to_string()]);
        assert!(matches!(config.validate(), Err(ConfigError::UnknownAction { .. })));

        let mut config = Config::default();
        config.manager.fallback_status = Status::NotChange;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsendableStatus { .. })
        ));
    }

    #[test]
    fn test_status_names_accepted() {
        let config: ManagerConfig = serde_yaml::from_str("fallback_status: reject").unwrap();
        assert_eq!(config.fallback_status, Status::Reject);
        assert!(serde_yaml::from_str::<ManagerConfig>("fallback_status: maybe").is_err());
    }
}
