//! Explicit delegation stack.
//!
//! Each delegated sub-run pushes a [`DelegationFrame`] and pops it when the
//! child returns, so the depth of a chain is always known and capped
//! instead of living implicitly on the call stack.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// One active delegation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationFrame {
    pub parent_session: String,
    pub parent_agent: String,
    pub child_agent: String,
    pub task: String,
    /// Depth of the child run (the session's agent runs at 0).
    pub depth: u32,
}

/// The frames of one turn. Parallel sibling delegations share it.
#[derive(Debug)]
pub struct DelegationStack {
    max_depth: u32,
    frames: Mutex<Vec<DelegationFrame>>,
}

impl DelegationStack {
    pub fn new(max_depth: u32) -> Self {
        Self {
            max_depth,
            frames: Mutex::new(Vec::new()),
        }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Push a frame, or refuse when its depth exceeds the cap.
    pub fn push(&self, frame: DelegationFrame) -> Result<FrameGuard<'_>> {
        if frame.depth > self.max_depth {
            return Err(AgentError::DelegationDepthExceeded {
                depth: frame.depth,
                max_depth: self.max_depth,
            });
        }
        let depth = frame.depth;
        let child = frame.child_agent.clone();
        self.lock().push(frame);
        Ok(FrameGuard {
            stack: self,
            depth,
            child,
        })
    }

    /// Snapshot of the active frames, outermost first.
    pub fn frames(&self) -> Vec<DelegationFrame> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DelegationFrame>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Pops its frame when the sub-run ends, including on cancellation.
#[derive(Debug)]
pub struct FrameGuard<'a> {
    stack: &'a DelegationStack,
    depth: u32,
    child: String,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let mut frames = self.stack.lock();
        // Siblings may finish in any order, so remove this frame by identity.
        if let Some(pos) = frames
            .iter()
            .rposition(|f| f.depth == self.depth && f.child_agent == self.child)
        {
            frames.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(child: &str, depth: u32) -> DelegationFrame {
        DelegationFrame {
            parent_session: "s".into(),
            parent_agent: "orchestrator".into(),
            child_agent: child.into(),
            task: "t".into(),
            depth,
        }
    }

    #[test]
    fn frames_pop_when_guards_drop() {
        let stack = DelegationStack::new(5);
        {
            let _a = stack.push(frame("a", 1)).unwrap();
            let _b = stack.push(frame("b", 2)).unwrap();
            assert_eq!(stack.len(), 2);
            assert_eq!(stack.frames()[1].child_agent, "b");
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn depth_cap_is_enforced() {
        let stack = DelegationStack::new(2);
        let _ok = stack.push(frame("a", 2)).unwrap();
        match stack.push(frame("a", 3)) {
            Err(AgentError::DelegationDepthExceeded { depth, max_depth }) => {
                assert_eq!((depth, max_depth), (3, 2));
            }
            other => panic!("expected depth error, got {other:?}"),
        }
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn siblings_can_finish_out_of_order() {
        let stack = DelegationStack::new(5);
        let a = stack.push(frame("a", 1)).unwrap();
        let b = stack.push(frame("b", 1)).unwrap();
        drop(a);
        assert_eq!(stack.frames(), vec![frame("b", 1)]);
        drop(b);
        assert!(stack.is_empty());
    }
}
