use std::collections::{BTreeSet, VecDeque};

/// Fleet-wide skill concurrency limiter with head-of-line fairness.
///
/// A caller that is not already inside joins the waiting FIFO; only the
/// head of the FIFO may take a free slot. This keeps a burst of agents
/// from starving whoever asked first.
#[derive(Debug)]
pub struct SkillLimiter {
    capacity: usize,
    active: BTreeSet<String>,
    waiters: VecDeque<String>,
}

impl SkillLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            active: BTreeSet::new(),
            waiters: VecDeque::new(),
        }
    }

    pub fn try_enter(&mut self, bot_id: &str) -> bool {
        if self.active.contains(bot_id) {
            return true;
        }
        if !self.waiters.iter().any(|w| w == bot_id) {
            self.waiters.push_back(bot_id.to_string());
        }
        if self.waiters.front().map(String::as_str) == Some(bot_id)
            && self.active.len() < self.capacity
        {
            self.waiters.pop_front();
            self.active.insert(bot_id.to_string());
            return true;
        }
        false
    }

    pub fn leave(&mut self, bot_id: &str) {
        self.active.remove(bot_id);
        self.waiters.retain(|w| w != bot_id);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiters.len()
    }
}

/// Bounded set of agents allowed to run exploration at once.
#[derive(Debug)]
pub struct ExplorerLimiter {
    capacity: usize,
    active: BTreeSet<String>,
}

impl ExplorerLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            active: BTreeSet::new(),
        }
    }

    pub fn try_enter(&mut self, bot_id: &str) -> bool {
        if self.active.contains(bot_id) {
            return true;
        }
        if self.active.len() < self.capacity {
            self.active.insert(bot_id.to_string());
            return true;
        }
        false
    }

    pub fn leave(&mut self, bot_id: &str) {
        self.active.remove(bot_id);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_of_line_wins_the_freed_slot() {
        let mut lim = SkillLimiter::new(1);
        assert!(lim.try_enter("occupant"));
        // A asked before B; neither can enter while the slot is held.
        assert!(!lim.try_enter("a"));
        assert!(!lim.try_enter("b"));
        lim.leave("occupant");
        // B retries first but is not at the head.
        assert!(!lim.try_enter("b"));
        assert!(lim.try_enter("a"));
        lim.leave("a");
        assert!(lim.try_enter("b"));
    }

    #[test]
    fn try_enter_is_idempotent_while_inside() {
        let mut lim = SkillLimiter::new(1);
        assert!(lim.try_enter("a"));
        assert!(lim.try_enter("a"));
        assert_eq!(lim.active_count(), 1);
        assert_eq!(lim.waiting_count(), 0);
    }

    #[test]
    fn waiting_is_idempotent() {
        let mut lim = SkillLimiter::new(1);
        assert!(lim.try_enter("occupant"));
        assert!(!lim.try_enter("a"));
        assert!(!lim.try_enter("a"));
        assert_eq!(lim.waiting_count(), 1);
    }

    #[test]
    fn leave_removes_from_waiters_too() {
        let mut lim = SkillLimiter::new(1);
        assert!(lim.try_enter("occupant"));
        assert!(!lim.try_enter("a"));
        assert!(!lim.try_enter("b"));
        lim.leave("a");
        lim.leave("occupant");
        // With A gone, B is now the head.
        assert!(lim.try_enter("b"));
    }

    #[test]
    fn explorer_limiter_bounds_and_idempotence() {
        let mut lim = ExplorerLimiter::new(2);
        assert!(lim.try_enter("a"));
        assert!(lim.try_enter("a"));
        assert!(lim.try_enter("b"));
        assert!(!lim.try_enter("c"));
        lim.leave("a");
        assert!(lim.try_enter("c"));
    }
}
