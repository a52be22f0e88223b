//! Branch and loop labeling over a step sequence.
//!
//! A branch step selects a label. The run continues at the first step after
//! the branch step carrying that label, or failing that at the first such
//! step anywhere in the chain. A branch step whose own tag is one of its
//! labels closes a loop: selecting its own tag goes back to the start of
//! the contiguous run of steps carrying that tag. Every backward jump draws
//! from a per-target budget so loops always terminate.

use std::collections::HashMap;
use tracing::{debug, info};

use super::{Step, StepKind};

pub const DEFAULT_LOOP_LIMIT: u32 = 10;

/// Where the run goes after a branch step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Goto { index: usize, branch: String },
    End,
}

pub struct FlowMap<'a> {
    steps: &'a [Step],
}

impl<'a> FlowMap<'a> {
    pub fn new(steps: &'a [Step]) -> Self {
        Self { steps }
    }

    fn tag(&self, index: usize) -> &str {
        &self.steps[index].branch
    }

    /// Whether the step at `index` may send the run back to a loop entry.
    pub fn can_loop(&self, index: usize) -> bool {
        match self.steps.get(index).map(|s| &s.kind) {
            Some(StepKind::Branch { branches, .. }) => {
                branches.iter().any(|b| b == self.tag(index))
            }
            _ => false,
        }
    }

    /// First step of the contiguous run sharing the tag of `index`.
    pub fn loop_entry(&self, index: usize) -> usize {
        let tag = self.tag(index);
        let mut entry = index;
        while entry > 0 && self.tag(entry - 1) == tag {
            entry -= 1;
        }
        entry
    }

    /// Target of `label` selected at `from`: forward first, then from the top.
    pub fn resolve(&self, from: usize, label: &str) -> Option<usize> {
        (from + 1..self.steps.len())
            .find(|&i| self.tag(i) == label)
            .or_else(|| (0..self.steps.len()).find(|&i| self.tag(i) == label))
    }

    /// Computes the next position after the branch step at `index` returned
    /// `label`, one of its `declared` labels.
    pub fn after_branch(
        &self,
        index: usize,
        label: &str,
        declared: &[String],
        budget: &mut LoopBudget,
    ) -> Next {
        let target = if self.can_loop(index) && label == self.tag(index) {
            Some(self.loop_entry(index))
        } else {
            self.resolve(index, label)
        };

        match target {
            // Nothing carries the label; the remaining steps are all skipped.
            None => Next::Goto {
                index: index + 1,
                branch: label.to_string(),
            },
            Some(target) if target > index => Next::Goto {
                index: target,
                branch: label.to_string(),
            },
            Some(target) if budget.try_repeat(target) => {
                debug!(from = index, to = target, branch = label, "jumping back");
                Next::Goto {
                    index: target,
                    branch: label.to_string(),
                }
            }
            Some(target) => {
                info!(from = index, to = target, branch = label, "loop budget exhausted");
                self.exit(index, label, declared, budget)
            }
        }
    }

    /// Leaves an exhausted loop through the first other declared label.
    fn exit(
        &self,
        index: usize,
        selected: &str,
        declared: &[String],
        budget: &mut LoopBudget,
    ) -> Next {
        let Some(exit) = declared.iter().find(|l| l.as_str() != selected) else {
            return Next::End;
        };
        match self.resolve(index, exit) {
            None => Next::Goto {
                index: index + 1,
                branch: exit.clone(),
            },
            Some(target) if target > index || budget.try_repeat(target) => Next::Goto {
                index: target,
                branch: exit.clone(),
            },
            Some(_) => Next::End,
        }
    }
}

/// Traversal counts per loop entry. The first pass counts as one.
#[derive(Debug, Clone)]
pub struct LoopBudget {
    limit: u32,
    traversals: HashMap<usize, u32>,
}

impl Default for LoopBudget {
    fn default() -> Self {
        Self::new(DEFAULT_LOOP_LIMIT)
    }
}

impl LoopBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            traversals: HashMap::new(),
        }
    }

    /// Records another traversal of `target` if the limit allows it.
    pub fn try_repeat(&mut self, target: usize) -> bool {
        let used = self.traversals.entry(target).or_insert(1);
        if *used < self.limit {
            *used += 1;
            true
        } else {
            false
        }
    }

    pub fn traversals(&self, target: usize) -> u32 {
        self.traversals.get(&target).copied().unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(ls: &[&str]) -> Vec<String> {
        ls.iter().map(|l| l.to_string()).collect()
    }

    fn goto(index: usize, branch: &str) -> Next {
        Next::Goto {
            index,
            branch: branch.to_string(),
        }
    }

    fn looping_chain() -> Vec<Step> {
        vec![
            Step::snippet("return 1", "x").on_branch("loop"),
            Step::snippet("return 2", "y").on_branch("loop"),
            Step::branch("return 'loop'", &["loop", "done"]).on_branch("loop"),
            Step::snippet("return 3", "z").on_branch("done"),
        ]
    }

    #[test]
    fn forward_labels_resolve_to_first_tagged_step() {
        let steps = vec![
            Step::branch("return 'b'", &["a", "b"]),
            Step::snippet("return 1", "x").on_branch("a"),
            Step::snippet("return 2", "y").on_branch("b"),
        ];
        let flow = FlowMap::new(&steps);
        let mut budget = LoopBudget::default();
        assert_eq!(
            flow.after_branch(0, "b", &labels(&["a", "b"]), &mut budget),
            goto(2, "b")
        );
        assert!(!flow.can_loop(0));
    }

    #[test]
    fn loop_closing_point_returns_to_entry() {
        let steps = looping_chain();
        let flow = FlowMap::new(&steps);
        assert!(flow.can_loop(2));
        assert_eq!(flow.loop_entry(2), 0);

        let mut budget = LoopBudget::default();
        assert_eq!(
            flow.after_branch(2, "loop", &labels(&["loop", "done"]), &mut budget),
            goto(0, "loop")
        );
        assert_eq!(budget.traversals(0), 2);
    }

    #[test]
    fn exhausted_loop_exits_through_other_label() {
        let steps = looping_chain();
        let flow = FlowMap::new(&steps);
        let declared = labels(&["loop", "done"]);
        let mut budget = LoopBudget::new(3);

        let mut jumps = 0;
        while flow.after_branch(2, "loop", &declared, &mut budget)
            == goto(0, "loop")
        {
            jumps += 1;
        }
        assert_eq!(jumps, 2);
        assert_eq!(budget.traversals(0), 3);
        assert_eq!(
            flow.after_branch(2, "loop", &declared, &mut budget),
            goto(3, "done")
        );
    }

    #[test]
    fn exhausted_loop_without_exit_ends() {
        let steps = vec![Step::branch("return 'again'", &["again"]).on_branch("again")];
        let flow = FlowMap::new(&steps);
        let mut budget = LoopBudget::new(1);
        assert_eq!(
            flow.after_branch(0, "again", &labels(&["again"]), &mut budget),
            Next::End
        );
    }

    #[test]
    fn backward_label_jumps_consume_budget() {
        let steps = vec![
            Step::snippet("return 1", "x").on_branch("a"),
            Step::branch("return 'a'", &["a", "b"]),
            Step::snippet("return 2", "y").on_branch("b"),
        ];
        let flow = FlowMap::new(&steps);
        let declared = labels(&["a", "b"]);
        let mut budget = LoopBudget::new(2);
        assert_eq!(
            flow.after_branch(1, "a", &declared, &mut budget),
            goto(0, "a")
        );
        assert_eq!(
            flow.after_branch(1, "a", &declared, &mut budget),
            goto(2, "b")
        );
    }
}
