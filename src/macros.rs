use crate::codec::MacroRequests;
use crate::protocol::Phase;
use std::collections::{BTreeMap, HashMap};

pub type MacroMap = BTreeMap<String, String>;

/// Strips the `{}` wrapping long macro names arrive with.
pub fn normalize_name(name: &str) -> &str {
    name.strip_prefix('{')
        .and_then(|inner| inner.strip_suffix('}'))
        .unwrap_or(name)
}

/// Per-phase macro tables supplied by the MTA.
///
/// A table lives from its define-macro packet until its phase is left.
/// Connect and HELO tables are kept for the whole connection.
#[derive(Debug, Default)]
pub struct MacroStore {
    scopes: HashMap<Phase, MacroMap>,
    current: Option<Phase>,
}

impl MacroStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_retained(phase: Phase) -> bool {
        matches!(phase, Phase::Connect | Phase::Helo)
    }

    /// Replaces the table for `phase`.
    pub fn define<I, K, V>(&mut self, phase: Phase, macros: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let table = macros
            .into_iter()
            .map(|(name, value)| (normalize_name(name.as_ref()).to_string(), value.into()))
            .collect();
        self.scopes.insert(phase, table);
    }

    /// Moves to `phase`, dropping the previous phase's table unless it is
    /// connection scoped or the same phase repeats.
    pub fn enter(&mut self, phase: Phase) {
        if let Some(previous) = self.current {
            if previous != phase && !Self::is_retained(previous) {
                self.scopes.remove(&previous);
            }
        }
        self.current = Some(phase);
    }

    /// Table defined for exactly this phase.
    pub fn defined(&self, phase: Phase) -> Option<&MacroMap> {
        self.scopes.get(&phase)
    }

    /// Looks a macro up in the current phase, then the connection scopes.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = normalize_name(name);
        let current = self.current.into_iter();
        current
            .chain([Phase::Helo, Phase::Connect])
            .filter_map(|phase| self.scopes.get(&phase))
            .find_map(|table| table.get(name))
            .map(String::as_str)
    }

    /// Drops every message scoped table.
    pub fn leave_message(&mut self) {
        self.scopes.retain(|phase, _| Self::is_retained(*phase));
        if self.current.is_some_and(Phase::is_message) {
            self.current = None;
        }
    }

    pub fn clear(&mut self) {
        self.scopes.clear();
        self.current = None;
    }
}

/// Restricts a table to the names a participant asked for at `phase`.
/// Participants without a request list for the stage get everything.
pub fn filter_requested(
    table: &MacroMap,
    phase: Phase,
    requests: &MacroRequests,
) -> Vec<(String, String)> {
    let wanted = phase.macro_stage().and_then(|stage| requests.get(&stage));
    table
        .iter()
        .filter(|(name, _)| {
            wanted.map_or(true, |wanted| {
                wanted.iter().any(|w| normalize_name(w) == name.as_str())
            })
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Union of several request lists, without duplicates.
pub fn merge_requests<'a, I>(lists: I) -> MacroRequests
where
    I: IntoIterator<Item = &'a MacroRequests>,
{
    let mut merged = MacroRequests::new();
    for list in lists {
        for (stage, names) in list {
            let entry = merged.entry(*stage).or_default();
            for name in names {
                if !entry.contains(name) {
                    entry.push(name.clone());
                }
            }
        }
    }
    merged
}
