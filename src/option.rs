use crate::protocol::{ActionFlags, StepFlags, DEFAULT_VERSION};
use serde::{Deserialize, Serialize};

/// Negotiated capability set: protocol version, actions and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilterOption {
    pub version: u32,
    pub actions: ActionFlags,
    pub steps: StepFlags,
}

impl Default for MilterOption {
    fn default() -> Self {
        MilterOption {
            version: DEFAULT_VERSION,
            actions: ActionFlags::all(),
            steps: StepFlags::empty(),
        }
    }
}

impl MilterOption {
    pub fn new(version: u32, actions: ActionFlags, steps: StepFlags) -> Self {
        MilterOption {
            version,
            actions,
            steps,
        }
    }

    /// Option of a participant that asks for nothing and tolerates everything.
    pub fn empty(version: u32) -> Self {
        MilterOption::new(version, ActionFlags::empty(), StepFlags::NO_MASK)
    }

    /// Folds another participant's request into this one.
    ///
    /// Actions are unioned, "no" steps survive only when both sides set them
    /// and "yes" steps are enabled when either side does. Bits outside the
    /// known masks are unioned so they survive untouched.
    pub fn merge(&mut self, other: &MilterOption) {
        let mine = self.steps.bits();
        let theirs = other.steps.bits();
        let no_mask = StepFlags::NO_MASK.bits();
        let steps = (mine & theirs & no_mask) | ((mine | theirs) & !no_mask);

        self.version = self.version.max(other.version);
        self.actions = ActionFlags::from_bits_retain(self.actions.bits() | other.actions.bits());
        self.steps = StepFlags::from_bits_retain(steps);
    }

    /// Clamps this request to what the peer offered.
    pub fn intersect(&self, offered: &MilterOption) -> MilterOption {
        MilterOption {
            version: self.version.min(offered.version),
            actions: ActionFlags::from_bits_retain(self.actions.bits() & offered.actions.bits()),
            steps: StepFlags::from_bits_retain(self.steps.bits() & offered.steps.bits()),
        }
    }

    /// Removes actions the configuration does not let a participant use.
    pub fn restrict_actions(&self, allowed: ActionFlags) -> MilterOption {
        MilterOption {
            actions: ActionFlags::from_bits_retain(self.actions.bits() & allowed.bits()),
            ..*self
        }
    }

    pub fn skips_event(&self, step: Option<StepFlags>) -> bool {
        step.is_some_and(|step| self.steps.contains(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_unions_actions_and_intersects_no_steps() {
        let mut merged = MilterOption::new(
            2,
            ActionFlags::ADD_HEADERS,
            StepFlags::NO_CONNECT | StepFlags::NO_BODY | StepFlags::SKIP,
        );
        let other = MilterOption::new(
            6,
            ActionFlags::CHANGE_BODY | ActionFlags::QUARANTINE,
            StepFlags::NO_BODY | StepFlags::NO_REPLY_HEADER,
        );
        merged.merge(&other);

        assert_eq!(merged.version, 6);
        assert_eq!(
            merged.actions,
            ActionFlags::ADD_HEADERS | ActionFlags::CHANGE_BODY | ActionFlags::QUARANTINE
        );
        // only NO_BODY is shared; SKIP is a yes-step and stays on
        assert_eq!(merged.steps, StepFlags::NO_BODY | StepFlags::SKIP);
    }

    #[test]
    fn test_merge_starting_from_empty_keeps_the_child_request() {
        let mut merged = MilterOption::empty(6);
        let child = MilterOption::new(
            6,
            ActionFlags::ADD_HEADERS,
            StepFlags::NO_HELO | StepFlags::NO_REPLY_BODY,
        );
        merged.merge(&child);
        assert_eq!(merged.actions, ActionFlags::ADD_HEADERS);
        assert_eq!(merged.steps, StepFlags::NO_HELO | StepFlags::NO_REPLY_BODY);
    }

    #[test]
    fn test_reserved_bits_survive_merge_and_intersect() {
        let reserved = 0x8000_0000;
        let mut merged = MilterOption::new(
            6,
            ActionFlags::from_bits_retain(reserved),
            StepFlags::from_bits_retain(reserved),
        );
        merged.merge(&MilterOption::empty(6));
        assert_eq!(merged.actions.bits() & reserved, reserved);
        assert_eq!(merged.steps.bits() & reserved, reserved);

        let offered = MilterOption::new(
            6,
            ActionFlags::from_bits_retain(u32::MAX),
            StepFlags::from_bits_retain(u32::MAX),
        );
        let clamped = merged.intersect(&offered);
        assert_eq!(clamped.steps.bits() & reserved, reserved);
    }

    #[test]
    fn test_intersect_clamps_to_offer() {
        let request = MilterOption::new(
            6,
            ActionFlags::ADD_HEADERS | ActionFlags::CHANGE_ENVELOPE_FROM,
            StepFlags::NO_CONNECT | StepFlags::SKIP,
        );
        let offered = MilterOption::new(2, ActionFlags::ADD_HEADERS, StepFlags::NO_CONNECT);
        let effective = request.intersect(&offered);
        assert_eq!(effective.version, 2);
        assert_eq!(effective.actions, ActionFlags::ADD_HEADERS);
        assert_eq!(effective.steps, StepFlags::NO_CONNECT);
    }
}
