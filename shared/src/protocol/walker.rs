//! Step-by-step traversal of a protocol tree.
//!
//! A walker covers one level of the tree and hands off to a boxed child
//! walker while the current node is a loop. Leaf indices follow the same
//! depth-first numbering the codec assigns, so an index reported by the
//! device can be matched against the walker's position.

use super::ProtocolError;
use crate::types::stimulation::{StimProtocol, SubprotocolNode};

/// Outcome of [`ProtocolWalker::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The walker now sits on a new leaf.
    Advanced,
    /// Every iteration has run; the walker did not move.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct ProtocolWalker {
    nodes: Vec<SubprotocolNode>,
    /// `None` until the first advance.
    node_idx: Option<usize>,
    /// Leaf index of the first leaf at this level.
    start_idx: usize,
    /// Leaf index the next leaf at this level will receive.
    flat_idx: usize,
    /// Passes left after the current one. `None` runs forever.
    iterations_remaining: Option<u32>,
    child: Option<Box<ProtocolWalker>>,
    exhausted: bool,
    /// When false every loop below this level runs once.
    repeat_loops: bool,
}

impl ProtocolWalker {
    /// Walker over `nodes`, repeated `num_iterations` times (forever if `None`),
    /// numbering leaves from `start_idx`.
    pub fn new(nodes: Vec<SubprotocolNode>, num_iterations: Option<u32>, start_idx: usize) -> Self {
        Self {
            nodes,
            node_idx: None,
            start_idx,
            flat_idx: start_idx,
            iterations_remaining: num_iterations.map(|n| n.saturating_sub(1)),
            child: None,
            exhausted: false,
            repeat_loops: true,
        }
    }

    /// Walker over a whole protocol. Protocols that run until stopped never complete.
    pub fn for_protocol(protocol: &StimProtocol) -> Result<Self, ProtocolError> {
        let (children, num_iterations) = protocol.root_loop()?;
        let iterations = (!protocol.run_until_stopped).then_some(num_iterations);
        Ok(Self::new(children.to_vec(), iterations, 0))
    }

    /// The active leaf and its index, or `None` before the first advance and
    /// after exhaustion.
    pub fn current(&self) -> Option<(usize, &SubprotocolNode)> {
        if self.exhausted {
            return None;
        }
        if let Some(child) = &self.child {
            return child.current();
        }
        let idx = self.node_idx?;
        Some((self.flat_idx - 1, &self.nodes[idx]))
    }

    pub fn current_leaf_idx(&self) -> Option<usize> {
        self.current().map(|(idx, _)| idx)
    }

    /// Move to the next leaf.
    pub fn advance(&mut self) -> Advance {
        if self.exhausted || self.nodes.is_empty() {
            self.exhausted = true;
            return Advance::Exhausted;
        }

        if let Some(child) = self.child.as_mut() {
            if child.advance() == Advance::Advanced {
                return Advance::Advanced;
            }
            self.flat_idx = child.flat_idx;
            self.child = None;
        }

        // bounds the search for a runnable node when every loop here is empty
        let mut skipped = 0;
        loop {
            let mut next = self.node_idx.map_or(0, |idx| idx + 1);
            if next >= self.nodes.len() {
                match self.iterations_remaining {
                    Some(0) => {
                        self.exhausted = true;
                        return Advance::Exhausted;
                    }
                    Some(n) => self.iterations_remaining = Some(n - 1),
                    None => {}
                }
                self.flat_idx = self.start_idx;
                next = 0;
            }
            self.node_idx = Some(next);

            match &self.nodes[next] {
                SubprotocolNode::Loop {
                    num_iterations,
                    children,
                } => {
                    let iterations = if self.repeat_loops {
                        *num_iterations
                    } else {
                        (*num_iterations).min(1)
                    };
                    let mut child = ProtocolWalker::new(children.clone(), Some(iterations), self.flat_idx);
                    child.repeat_loops = self.repeat_loops;
                    if iterations > 0 && child.advance() == Advance::Advanced {
                        self.child = Some(Box::new(child));
                        return Advance::Advanced;
                    }
                    self.flat_idx += self.nodes[next].leaf_count();
                    skipped += 1;
                    if skipped > self.nodes.len() {
                        self.exhausted = true;
                        return Advance::Exhausted;
                    }
                }
                _ => {
                    self.flat_idx += 1;
                    return Advance::Advanced;
                }
            }
        }
    }

    /// True once the final leaf of the final iteration is active (or has finished).
    pub fn complete(&self) -> bool {
        if self.exhausted {
            return true;
        }
        let at_last = match (self.node_idx, self.nodes.len()) {
            (Some(idx), len) => idx + 1 == len,
            (None, _) => false,
        };
        at_last
            && self.iterations_remaining == Some(0)
            && self.child.as_ref().map_or(true, |child| child.complete())
    }

    /// Number of distinct leaf indices this walker can visit.
    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().map(SubprotocolNode::leaf_count).sum()
    }

    /// Advance until the active leaf is `leaf_idx`, taking at most `max_steps`
    /// steps. Returns whether the target was reached.
    ///
    /// Loops whose leaves do not include `leaf_idx` are left without running
    /// their remaining iterations, so reaching any leaf of the tree takes at
    /// most two passes over its leaves.
    pub fn sync_to(&mut self, leaf_idx: usize, max_steps: usize) -> bool {
        for _ in 0..=max_steps {
            if self.current_leaf_idx() == Some(leaf_idx) {
                return true;
            }
            self.leave_loops_without(leaf_idx);
            if self.advance() == Advance::Exhausted {
                return false;
            }
        }
        false
    }

    /// Drop the innermost active loops that cannot reach `leaf_idx`. The next
    /// advance then moves past them.
    fn leave_loops_without(&mut self, leaf_idx: usize) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let end = child.start_idx + child.leaf_count();
        if (child.start_idx..end).contains(&leaf_idx) {
            child.leave_loops_without(leaf_idx);
        } else {
            self.flat_idx = end;
            self.child = None;
        }
    }

    /// Each leaf of the protocol once, in leaf-index order. Loops contribute
    /// their leaves a single time whatever their iteration count.
    pub fn leaf_table(protocol: &StimProtocol) -> Result<Vec<SubprotocolNode>, ProtocolError> {
        let (children, _) = protocol.root_loop()?;
        let mut walker = Self::new(children.to_vec(), Some(1), 0);
        walker.repeat_loops = false;
        let mut table = Vec::new();
        while walker.advance() == Advance::Advanced {
            if let Some((_, node)) = walker.current() {
                table.push(node.clone());
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::stimulation::tests::{biphasic, monophasic};
    use crate::types::stimulation::StimulationType;

    fn delay(duration_ms: u64) -> SubprotocolNode {
        SubprotocolNode::Delay {
            duration_us: duration_ms * 1_000,
        }
    }

    #[test]
    fn test_two_leaves_three_iterations_completes_on_sixth_advance() {
        let mut protocol = StimProtocol::new(
            StimulationType::Current,
            false,
            vec![biphasic(10), delay(200)],
        );
        protocol.root = SubprotocolNode::Loop {
            num_iterations: 3,
            children: vec![biphasic(10), delay(200)],
        };
        let mut walker = ProtocolWalker::for_protocol(&protocol).unwrap();
        assert!(walker.current().is_none());

        for step in 1..=6 {
            assert!(!walker.complete(), "complete before advance {}", step);
            assert_eq!(walker.advance(), Advance::Advanced);
            assert_eq!(walker.current_leaf_idx(), Some((step - 1) % 2));
        }
        assert!(walker.complete());

        assert_eq!(walker.advance(), Advance::Exhausted);
        assert!(walker.complete());
        assert!(walker.current().is_none());
    }

    #[test]
    fn test_nested_loops_follow_codec_numbering() {
        let protocol = StimProtocol::new(
            StimulationType::Current,
            false,
            vec![
                biphasic(10),
                SubprotocolNode::Loop {
                    num_iterations: 2,
                    children: vec![
                        monophasic(10),
                        SubprotocolNode::Loop {
                            num_iterations: 2,
                            children: vec![delay(100)],
                        },
                    ],
                },
                delay(300),
            ],
        );
        let mut walker = ProtocolWalker::for_protocol(&protocol).unwrap();
        let mut indices = Vec::new();
        while walker.advance() == Advance::Advanced {
            indices.extend(walker.current_leaf_idx());
        }
        assert_eq!(indices, vec![0, 1, 2, 2, 1, 2, 2, 3]);
        assert_eq!(
            ProtocolWalker::leaf_table(&protocol).unwrap(),
            vec![biphasic(10), monophasic(10), delay(100), delay(300)]
        );

        let mut walker = ProtocolWalker::for_protocol(&protocol).unwrap();
        for _ in 0..7 {
            walker.advance();
            assert!(!walker.complete());
        }
        walker.advance();
        assert_eq!(walker.current(), Some((3, &delay(300))));
        assert!(walker.complete());
    }

    #[test]
    fn test_complete_when_last_node_is_a_loop() {
        let protocol = StimProtocol::new(
            StimulationType::Current,
            false,
            vec![
                delay(100),
                SubprotocolNode::Loop {
                    num_iterations: 2,
                    children: vec![biphasic(10)],
                },
            ],
        );
        let mut walker = ProtocolWalker::for_protocol(&protocol).unwrap();
        walker.advance();
        walker.advance();
        assert!(!walker.complete());
        walker.advance();
        assert_eq!(walker.current_leaf_idx(), Some(1));
        assert!(walker.complete());
        assert_eq!(walker.advance(), Advance::Exhausted);
    }

    #[test]
    fn test_run_until_stopped_never_completes() {
        let protocol = StimProtocol::new(StimulationType::Voltage, true, vec![delay(100), delay(200)]);
        let mut walker = ProtocolWalker::for_protocol(&protocol).unwrap();
        for _ in 0..1_000 {
            assert_eq!(walker.advance(), Advance::Advanced);
            assert!(!walker.complete());
        }
    }

    #[test]
    fn test_sync_to_reported_index() {
        let protocol = StimProtocol::new(
            StimulationType::Current,
            true,
            vec![delay(100), biphasic(10), delay(200)],
        );
        let mut walker = ProtocolWalker::for_protocol(&protocol).unwrap();
        assert!(walker.sync_to(2, 10));
        assert_eq!(walker.current(), Some((2, &delay(200))));
        // wraps around to the start of the next pass
        assert!(walker.sync_to(0, 10));
        assert!(!walker.sync_to(7, 10));
    }

    #[test]
    fn test_sync_leaves_loops_that_cannot_reach_the_target() {
        let protocol = StimProtocol::new(
            StimulationType::Current,
            false,
            vec![
                SubprotocolNode::Loop {
                    num_iterations: u32::MAX,
                    children: vec![biphasic(10), delay(100)],
                },
                delay(200),
            ],
        );
        let mut walker = ProtocolWalker::for_protocol(&protocol).unwrap();
        let max_steps = 2 * walker.leaf_count();
        assert!(walker.sync_to(1, max_steps));
        // back to the start of the loop is its next iteration
        assert!(walker.sync_to(0, max_steps));
        // the leaf after the loop is reached without running its iterations
        assert!(walker.sync_to(2, max_steps));
        assert!(walker.complete());
        // a single-pass protocol cannot go back
        assert!(!walker.sync_to(0, max_steps));
    }

    #[test]
    fn test_leaf_table_ignores_repeats() {
        let protocol = StimProtocol::new(
            StimulationType::Current,
            true,
            vec![SubprotocolNode::Loop {
                num_iterations: 1_000_000,
                children: vec![
                    delay(100),
                    SubprotocolNode::Loop {
                        num_iterations: 1_000_000,
                        children: vec![biphasic(10)],
                    },
                ],
            }],
        );
        assert_eq!(
            ProtocolWalker::leaf_table(&protocol).unwrap(),
            vec![delay(100), biphasic(10)]
        );
    }

    #[test]
    fn test_empty_loops_are_skipped() {
        let protocol = StimProtocol::new(
            StimulationType::Current,
            false,
            vec![
                SubprotocolNode::Loop {
                    num_iterations: 3,
                    children: vec![],
                },
                delay(100),
            ],
        );
        let mut walker = ProtocolWalker::for_protocol(&protocol).unwrap();
        assert_eq!(walker.advance(), Advance::Advanced);
        assert_eq!(walker.current_leaf_idx(), Some(0));
        assert!(walker.complete());
    }
}
