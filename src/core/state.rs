//! 会话状态机
//!
//! Planning → [FeedbackOnPlan] → Executing → QualityCheck → [FeedbackOnResult] → Completed，
//! 回边：FeedbackOnPlan / Executing / QualityCheck / FeedbackOnResult → Planning。
//! Planning 可以停留在自身（无效计划、只有思考的回复），也可以在模型直接作答时跳到 QualityCheck。

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    Planning,
    FeedbackOnPlan,
    Executing,
    QualityCheck,
    FeedbackOnResult,
    Completed,
}

impl SessionPhase {
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Planning, Planning)
                | (Planning, FeedbackOnPlan)
                | (Planning, QualityCheck)
                | (FeedbackOnPlan, Planning)
                | (FeedbackOnPlan, Executing)
                | (Executing, Planning)
                | (Executing, QualityCheck)
                | (QualityCheck, Planning)
                | (QualityCheck, FeedbackOnResult)
                | (FeedbackOnResult, Planning)
                | (FeedbackOnResult, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionPhase::Completed
    }
}

/// 记录阶段轨迹；非法转移只告警（状态机由编排器驱动，轨迹用于审计与测试）
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    current: SessionPhase,
    trace: Vec<SessionPhase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            current: SessionPhase::Planning,
            trace: vec![SessionPhase::Planning],
        }
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> SessionPhase {
        self.current
    }

    pub fn advance(&mut self, next: SessionPhase) {
        if !self.current.can_transition_to(next) {
            tracing::warn!(from = ?self.current, to = ?next, "unexpected session phase transition");
        }
        tracing::debug!(from = ?self.current, to = ?next, "session phase");
        self.current = next;
        self.trace.push(next);
    }

    pub fn trace(&self) -> &[SessionPhase] {
        &self.trace
    }

    pub fn into_trace(self) -> Vec<SessionPhase> {
        self.trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_valid() {
        use SessionPhase::*;
        let path = [Planning, FeedbackOnPlan, Executing, QualityCheck, FeedbackOnResult, Completed];
        assert!(path.windows(2).all(|w| w[0].can_transition_to(w[1])));
        assert!(Completed.is_terminal());
    }

    #[test]
    fn test_no_edges_out_of_completed() {
        use SessionPhase::*;
        for next in [Planning, FeedbackOnPlan, Executing, QualityCheck, FeedbackOnResult, Completed] {
            assert!(!Completed.can_transition_to(next));
        }
        assert!(!Planning.can_transition_to(Executing));
    }

    #[test]
    fn test_tracker_records_loop_back() {
        let mut t = PhaseTracker::new();
        t.advance(SessionPhase::QualityCheck);
        t.advance(SessionPhase::Planning);
        assert_eq!(t.current(), SessionPhase::Planning);
        assert_eq!(t.trace().len(), 3);
    }
}
