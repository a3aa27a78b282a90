use std::collections::{HashMap, HashSet};

use buddy_types::{Step, StepId, StepState};
use serde::Serialize;

use crate::PlanError;

/// Dependency-aware view over a task's steps.
pub struct StepScheduler;

impl StepScheduler {
    /// Pending steps whose dependencies have all succeeded.
    pub fn ready_steps(steps: &[Step]) -> Vec<&Step> {
        let succeeded = Self::ids_in(steps, |state| state == StepState::Succeeded);
        steps
            .iter()
            .filter(|step| {
                step.state == StepState::Pending
                    && step
                        .depends_on
                        .iter()
                        .all(|dep| succeeded.contains(dep.as_str()))
            })
            .collect()
    }

    /// Non-terminal steps that can never run because a dependency ended without success.
    pub fn unreachable_steps(steps: &[Step]) -> Vec<&Step> {
        let dead = Self::ids_in(steps, |state| {
            matches!(state, StepState::Failed | StepState::Skipped)
        });
        steps
            .iter()
            .filter(|step| {
                !step.state.is_terminal()
                    && step.depends_on.iter().any(|dep| dead.contains(dep.as_str()))
            })
            .collect()
    }

    /// Dependencies of `step` that have not succeeded yet.
    pub fn unmet_dependencies(steps: &[Step], step: &Step) -> Vec<StepId> {
        let succeeded = Self::ids_in(steps, |state| state == StepState::Succeeded);
        step.depends_on
            .iter()
            .filter(|dep| !succeeded.contains(dep.as_str()))
            .cloned()
            .collect()
    }

    pub fn all_terminal(steps: &[Step]) -> bool {
        steps.iter().all(|step| step.state.is_terminal())
    }

    pub fn detect_cycle(steps: &[Step]) -> Option<Vec<String>> {
        let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut visited = HashSet::new();

        for step in steps {
            let mut path = Vec::new();
            if Self::dfs_cycle(step.id.as_str(), &by_id, &mut visited, &mut path) {
                return Some(path);
            }
        }
        None
    }

    fn dfs_cycle(
        step_id: &str,
        by_id: &HashMap<&str, &Step>,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        if path.iter().any(|seen| seen == step_id) {
            path.push(step_id.to_string());
            return true;
        }
        if visited.contains(step_id) {
            return false;
        }

        visited.insert(step_id.to_string());
        path.push(step_id.to_string());

        if let Some(step) = by_id.get(step_id) {
            for dep in &step.depends_on {
                if Self::dfs_cycle(dep.as_str(), by_id, visited, path) {
                    return true;
                }
            }
        }

        path.pop();
        false
    }

    /// Structural checks a plan must pass before any step is dispatched.
    pub fn validate(steps: &[Step]) -> Result<(), PlanError> {
        if steps.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut ids = HashSet::new();
        for step in steps {
            if !ids.insert(step.id.as_str()) {
                return Err(PlanError::DuplicateStep(step.id.to_string()));
            }
        }

        for step in steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        step_id: step.id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
            }
        }

        if let Some(path) = Self::detect_cycle(steps) {
            return Err(PlanError::Cycle { path });
        }
        Ok(())
    }

    pub fn progress(steps: &[Step]) -> StepProgress {
        let mut progress = StepProgress::default();
        for step in steps {
            match step.state {
                StepState::Pending => progress.pending += 1,
                StepState::PendingApproval => progress.awaiting_approval += 1,
                StepState::Dispatched => progress.dispatched += 1,
                StepState::Succeeded => progress.succeeded += 1,
                StepState::Failed => progress.failed += 1,
                StepState::Skipped => progress.skipped += 1,
            }
        }
        progress.total = steps.len();
        progress
    }

    fn ids_in(steps: &[Step], keep: impl Fn(StepState) -> bool) -> HashSet<&str> {
        steps
            .iter()
            .filter(|step| keep(step.state))
            .map(|step| step.id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StepProgress {
    pub total: usize,
    pub pending: usize,
    pub awaiting_approval: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StepProgress {
    pub fn completion_percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let finished = self.succeeded + self.failed + self.skipped;
        (finished as f64 / self.total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buddy_types::Capability;

    fn step(id: &str, deps: &[&str]) -> Step {
        let mut step = Step::new(id, Capability::Grounding, "answer");
        step.depends_on = deps.iter().map(|d| StepId::new(*d)).collect();
        step
    }

    #[test]
    fn ready_steps_wait_for_successful_dependencies() {
        let mut steps = vec![step("a", &[]), step("b", &["a"]), step("c", &[])];
        let ready: Vec<_> = StepScheduler::ready_steps(&steps)
            .iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ready, vec!["a", "c"]);

        steps[0].state = StepState::Succeeded;
        let ready: Vec<_> = StepScheduler::ready_steps(&steps)
            .iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ready, vec!["b", "c"]);
    }

    #[test]
    fn failed_dependency_makes_dependents_unreachable() {
        let mut steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        steps[0].state = StepState::Failed;
        let unreachable: Vec<_> = StepScheduler::unreachable_steps(&steps)
            .iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(unreachable, vec!["b"]);
    }

    #[test]
    fn validate_rejects_bad_graphs() {
        assert!(matches!(StepScheduler::validate(&[]), Err(PlanError::Empty)));
        assert!(matches!(
            StepScheduler::validate(&[step("a", &[]), step("a", &[])]),
            Err(PlanError::DuplicateStep(_))
        ));
        assert!(matches!(
            StepScheduler::validate(&[step("a", &["ghost"])]),
            Err(PlanError::UnknownDependency { .. })
        ));
        assert!(matches!(
            StepScheduler::validate(&[step("a", &["b"]), step("b", &["a"])]),
            Err(PlanError::Cycle { .. })
        ));
        assert!(StepScheduler::validate(&[step("a", &[]), step("b", &["a"])]).is_ok());
    }

    #[test]
    fn progress_counts_each_state() {
        let mut steps = vec![step("a", &[]), step("b", &[]), step("c", &[])];
        steps[0].state = StepState::Succeeded;
        steps[1].state = StepState::PendingApproval;
        let progress = StepScheduler::progress(&steps);
        assert_eq!(progress.total, 3);
        assert_eq!(progress.succeeded, 1);
        assert_eq!(progress.awaiting_approval, 1);
        assert_eq!(progress.pending, 1);
        assert!((progress.completion_percentage() - 33.333).abs() < 0.01);
    }
}
