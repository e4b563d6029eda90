//! Connect-time rules that stop or retarget individual children.

use crate::codec::ConnectAddress;
use crate::config::{ConditionAction, ConditionConfig, Criteria};
use crate::macros::MacroStore;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;

/// What a condition sees of the SMTP client.
#[derive(Debug, Clone, Copy)]
pub struct ConnectInfo<'a> {
    pub host: &'a str,
    pub address: &'a ConnectAddress,
    pub macros: &'a MacroStore,
}

impl ConnectInfo<'_> {
    fn address_text(&self) -> &str {
        match self.address {
            ConnectAddress::Unknown => "",
            ConnectAddress::Unix(path) => path,
            ConnectAddress::Inet { address, .. } | ConnectAddress::Inet6 { address, .. } => {
                address.strip_prefix("IPv6:").unwrap_or(address)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Network {
    base: IpAddr,
    prefix: u8,
}

impl Network {
    fn parse(text: &str) -> anyhow::Result<Self> {
        let (address, prefix) = match text.split_once('/') {
            Some((address, prefix)) => (address, Some(prefix)),
            None => (text, None),
        };
        let base: IpAddr = address
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid network '{}': {}", text, e))?;
        let width = if base.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(prefix) => prefix
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= width)
                .ok_or_else(|| anyhow::anyhow!("Invalid prefix length in '{}'", text))?,
            None => width,
        };
        Ok(Network { base, prefix })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.base, ip) {
            (IpAddr::V4(base), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(base) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(base), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(base) & mask == u128::from(ip) & mask
            }
            (IpAddr::V4(_), IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(v4) => self.contains(IpAddr::V4(v4)),
                None => false,
            },
            (IpAddr::V6(_), IpAddr::V4(_)) => false,
        }
    }
}

struct Condition {
    criteria: Criteria,
    action: ConditionAction,
}

/// Compiled applicable conditions, looked up by name.
#[derive(Default)]
pub struct ConditionSet {
    conditions: HashMap<String, Condition>,
    compiled_patterns: HashMap<String, Regex>,
    networks: HashMap<String, Network>,
}

impl ConditionSet {
    pub fn compile(configs: &[ConditionConfig]) -> anyhow::Result<Self> {
        let mut set = ConditionSet::default();
        for config in configs {
            set.compile_criteria(&config.criteria)?;
            set.conditions.insert(
                config.name.clone(),
                Condition {
                    criteria: config.criteria.clone(),
                    action: config.action.clone(),
                },
            );
        }
        Ok(set)
    }

    fn compile_pattern(&mut self, pattern: &str) -> anyhow::Result<()> {
        if !self.compiled_patterns.contains_key(pattern) {
            let regex = Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("Invalid regex pattern '{}': {}", pattern, e))?;
            self.compiled_patterns.insert(pattern.to_string(), regex);
        }
        Ok(())
    }

    fn compile_criteria(&mut self, criteria: &Criteria) -> anyhow::Result<()> {
        match criteria {
            Criteria::HostPattern { pattern }
            | Criteria::AddressPattern { pattern }
            | Criteria::MacroPattern { pattern, .. } => self.compile_pattern(pattern)?,
            Criteria::RemoteNetwork { networks } => {
                for network in networks {
                    if !self.networks.contains_key(network) {
                        self.networks.insert(network.clone(), Network::parse(network)?);
                    }
                }
            }
            Criteria::LocalConnection => {}
            Criteria::And { criteria } | Criteria::Or { criteria } => {
                for criteria in criteria {
                    self.compile_criteria(criteria)?;
                }
            }
            Criteria::Not { criteria } => self.compile_criteria(criteria)?,
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    fn pattern_matches(&self, pattern: &str, text: &str) -> bool {
        self.compiled_patterns
            .get(pattern)
            .is_some_and(|regex| regex.is_match(text))
    }

    fn evaluate(&self, criteria: &Criteria, info: &ConnectInfo<'_>) -> bool {
        match criteria {
            Criteria::HostPattern { pattern } => self.pattern_matches(pattern, info.host),
            Criteria::AddressPattern { pattern } => {
                self.pattern_matches(pattern, info.address_text())
            }
            Criteria::RemoteNetwork { networks } => match info.address.ip() {
                Some(ip) => networks
                    .iter()
                    .filter_map(|network| self.networks.get(network))
                    .any(|network| network.contains(ip)),
                None => false,
            },
            Criteria::LocalConnection => match info.address {
                ConnectAddress::Unix(_) => true,
                other => other.ip().is_some_and(|ip| ip.is_loopback()),
            },
            Criteria::MacroPattern { name, pattern } => info
                .macros
                .get(name)
                .is_some_and(|value| self.pattern_matches(pattern, value)),
            Criteria::And { criteria } => criteria.iter().all(|c| self.evaluate(c, info)),
            Criteria::Or { criteria } => criteria.iter().any(|c| self.evaluate(c, info)),
            Criteria::Not { criteria } => !self.evaluate(criteria, info),
        }
    }

    /// Action of the first listed condition that matches.
    pub fn check(&self, names: &[String], info: &ConnectInfo<'_>) -> Option<&ConditionAction> {
        names.iter().find_map(|name| {
            let condition = self.conditions.get(name)?;
            if self.evaluate(&condition.criteria, info) {
                log::debug!("condition '{}' matched {}", name, info.host);
                Some(&condition.action)
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Phase;

    fn inet(address: &str) -> ConnectAddress {
        ConnectAddress::Inet {
            port: 40000,
            address: address.to_string(),
        }
    }

    fn condition(name: &str, criteria: Criteria, action: ConditionAction) -> ConditionConfig {
        ConditionConfig {
            name: name.to_string(),
            description: None,
            criteria,
            action,
        }
    }

    #[test]
    fn test_network_contains() {
        let network = Network::parse("192.0.2.0/24").unwrap();
        assert!(network.contains("192.0.2.77".parse().unwrap()));
        assert!(!network.contains("192.0.3.1".parse().unwrap()));
        assert!(network.contains("::ffff:192.0.2.1".parse().unwrap()));

        let host = Network::parse("2001:db8::1").unwrap();
        assert!(host.contains("2001:db8::1".parse().unwrap()));
        assert!(!host.contains("2001:db8::2".parse().unwrap()));

        let everything = Network::parse("0.0.0.0/0").unwrap();
        assert!(everything.contains("203.0.113.9".parse().unwrap()));

        assert!(Network::parse("10.0.0.0/33").is_err());
        assert!(Network::parse("ten/8").is_err());
    }

    #[test]
    fn test_first_matching_condition_wins() {
        let set = ConditionSet::compile(&[
            condition(
                "local",
                Criteria::LocalConnection,
                ConditionAction::Stop,
            ),
            condition(
                "partner",
                Criteria::And {
                    criteria: vec![
                        Criteria::HostPattern {
                            pattern: r"\.partner\.example$".into(),
                        },
                        Criteria::RemoteNetwork {
                            networks: vec!["198.51.100.0/24".into()],
                        },
                    ],
                },
                ConditionAction::Retarget {
                    connection_spec: "inet:11025@127.0.0.1".parse().unwrap(),
                },
            ),
        ])
        .unwrap();
        let macros = MacroStore::new();
        let names = vec!["local".to_string(), "partner".to_string()];

        let address = inet("127.0.0.1");
        let info = ConnectInfo {
            host: "localhost",
            address: &address,
            macros: &macros,
        };
        assert_eq!(set.check(&names, &info), Some(&ConditionAction::Stop));

        let address = inet("198.51.100.4");
        let info = ConnectInfo {
            host: "mx1.partner.example",
            address: &address,
            macros: &macros,
        };
        assert!(matches!(
            set.check(&names, &info),
            Some(ConditionAction::Retarget { .. })
        ));

        let info = ConnectInfo {
            host: "mx1.stranger.example",
            address: &address,
            macros: &macros,
        };
        assert_eq!(set.check(&names, &info), None);
    }

    #[test]
    fn test_not_and_macro_criteria() {
        let set = ConditionSet::compile(&[condition(
            "outbound",
            Criteria::Not {
                criteria: Box::new(Criteria::MacroPattern {
                    name: "{daemon_name}".into(),
                    pattern: "^MTA-IN$".into(),
                }),
            },
            ConditionAction::Stop,
        )])
        .unwrap();
        let names = vec!["outbound".to_string()];
        let address = ConnectAddress::Unix("/var/run/client".into());

        let mut macros = MacroStore::new();
        macros.define(Phase::Connect, [("{daemon_name}", "MTA-IN")]);
        macros.enter(Phase::Connect);
        let info = ConnectInfo {
            host: "h",
            address: &address,
            macros: &macros,
        };
        assert_eq!(set.check(&names, &info), None);

        let mut macros = MacroStore::new();
        macros.define(Phase::Connect, [("{daemon_name}", "MSA")]);
        macros.enter(Phase::Connect);
        let info = ConnectInfo {
            host: "h",
            address: &address,
            macros: &macros,
        };
        assert_eq!(set.check(&names, &info), Some(&ConditionAction::Stop));
    }

    #[test]
    fn test_address_pattern_strips_ipv6_prefix() {
        let set = ConditionSet::compile(&[condition(
            "docnet",
            Criteria::AddressPattern {
                pattern: "^2001:db8:".into(),
            },
            ConditionAction::Stop,
        )])
        .unwrap();
        let macros = MacroStore::new();
        let address = ConnectAddress::Inet6 {
            port: 25,
            address: "IPv6:2001:db8::5".into(),
        };
        let info = ConnectInfo {
            host: "h",
            address: &address,
            macros: &macros,
        };
        assert!(set.check(&["docnet".to_string()], &info).is_some());
        assert!(set.check(&["unknown".to_string()], &info).is_none());
    }

    #[test]
    fn test_invalid_regex_fails_compile() {
        let result = ConditionSet::compile(&[condition(
            "broken",
            Criteria::HostPattern {
                pattern: "(unclosed".into(),
            },
            ConditionAction::Stop,
        )]);
        assert!(result.is_err());
    }
}
