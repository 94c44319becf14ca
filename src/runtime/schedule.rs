//! Turn scheduling for turn-based missions
//!
//! Participants that take turns report a requested position when they
//! become ready. Explicit requests are honoured first-come; participants
//! whose request was taken (or who had none) follow in reverse arrival
//! order. The finished schedule cycles: the last entry's successor is the
//! first.

use std::collections::BTreeMap;

/// Collects turn requests while participants assemble
#[derive(Debug, Clone, Default)]
pub struct TurnScheduleBuilder {
    explicit: BTreeMap<u32, String>,
    unplaced: Vec<String>,
}

impl TurnScheduleBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `identity` takes turns, at `position` if it is still free
    pub fn request(&mut self, identity: impl Into<String>, position: Option<u32>) {
        let identity = identity.into();
        if self.contains(&identity) {
            return;
        }
        match position {
            Some(position) if !self.explicit.contains_key(&position) => {
                self.explicit.insert(position, identity);
            }
            _ => self.unplaced.push(identity),
        }
    }

    /// Whether `identity` has already been recorded
    pub fn contains(&self, identity: &str) -> bool {
        self.explicit.values().any(|id| id == identity) || self.unplaced.iter().any(|id| id == identity)
    }

    /// Whether no one has asked to take turns
    pub fn is_empty(&self) -> bool {
        self.explicit.is_empty() && self.unplaced.is_empty()
    }

    /// Forget every request
    pub fn clear(&mut self) {
        self.explicit.clear();
        self.unplaced.clear();
    }

    /// Fix the order
    pub fn build(&self) -> TurnSchedule {
        let order = self
            .explicit
            .values()
            .cloned()
            .chain(self.unplaced.iter().rev().cloned())
            .collect();
        TurnSchedule { order }
    }
}

/// Cyclic order in which participants take turns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnSchedule {
    order: Vec<String>,
}

impl TurnSchedule {
    /// Schedule with an explicit order
    pub fn from_order<I, S>(order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            order: order.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether anyone takes turns
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Number of participants taking turns
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Who goes first
    pub fn first(&self) -> Option<&str> {
        self.order.first().map(String::as_str)
    }

    /// Who goes after `identity`, wrapping around
    pub fn successor(&self, identity: &str) -> Option<&str> {
        let index = self.order.iter().position(|id| id == identity)?;
        let next = (index + 1) % self.order.len();
        self.order.get(next).map(String::as_str)
    }

    /// Drop `identity`; returns whether it was present
    pub fn remove(&mut self, identity: &str) -> bool {
        match self.order.iter().position(|id| id == identity) {
            Some(index) => {
                self.order.remove(index);
                true
            }
            None => false,
        }
    }

    /// Forget everyone
    pub fn clear(&mut self) {
        self.order.clear();
    }

    /// The order as a slice
    pub fn as_slice(&self) -> &[String] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraparound_and_removal() {
        let mut schedule = TurnSchedule::from_order(["A", "B", "C"]);
        assert_eq!(schedule.successor("C"), Some("A"));
        assert!(schedule.remove("B"));
        assert_eq!(schedule.successor("A"), Some("C"));
        assert!(!schedule.remove("B"));
        assert_eq!(schedule.successor("B"), None);
    }

    #[test]
    fn test_single_entry_is_its_own_successor() {
        let schedule = TurnSchedule::from_order(["solo"]);
        assert_eq!(schedule.successor("solo"), Some("solo"));
    }

    #[test]
    fn test_explicit_positions_then_reverse_arrival() {
        let mut builder = TurnScheduleBuilder::new();
        builder.request("late", None);
        builder.request("second", Some(1));
        builder.request("clash", Some(1));
        builder.request("first", Some(0));
        builder.request("first", Some(5));
        let schedule = builder.build();
        assert_eq!(schedule.as_slice(), ["first", "second", "clash", "late"]);
    }

    #[test]
    fn test_empty_schedule() {
        let schedule = TurnScheduleBuilder::new().build();
        assert!(schedule.is_empty());
        assert_eq!(schedule.first(), None);
        assert_eq!(schedule.successor("anyone"), None);
    }
}
