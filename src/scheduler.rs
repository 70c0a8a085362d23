//! Plan scheduler — picks the next executable step.
//!
//! A step is executable when every dependency it still waits on resolves to a
//! completed step, its own status is non-terminal, and it carries a runnable
//! command payload. Among executable steps the lowest numeric priority wins;
//! steps without a priority sort last; ties break by list position. The
//! selection is re-run after every command completes, because a completion
//! can unblock dependents and the plan mutates between selections.

use crate::plan::{Plan, PlanStep, StepStatus};

/// Index of the next executable step, or `None` when nothing can run.
pub fn select_next(plan: &Plan) -> Option<usize> {
    plan.steps()
        .iter()
        .enumerate()
        .filter(|(_, step)| is_executable(plan, step))
        .min_by_key(|(idx, step)| (step.priority.unwrap_or(i64::MAX), *idx))
        .map(|(idx, _)| idx)
}

fn is_executable(plan: &Plan, step: &PlanStep) -> bool {
    if step.status.is_terminal() {
        return false;
    }
    let Some(command) = &step.command else {
        return false;
    };
    if !command.has_payload() {
        return false;
    }
    dependencies_satisfied(plan, step)
}

/// A dependency id that resolves to no step is dropped, not blocking; one
/// that resolves is satisfied only by a completed step.
fn dependencies_satisfied(plan: &Plan, step: &PlanStep) -> bool {
    step.waiting_for_id.iter().all(|dep| match plan.find(dep) {
        Some(target) => target.status == StepStatus::Completed,
        None => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Command, PlanStep, step};
    use proptest::prelude::*;

    fn prioritized(id: &str, priority: Option<i64>, run: &str) -> PlanStep {
        PlanStep {
            priority,
            ..step(id, StepStatus::Pending, &[], Some(run))
        }
    }

    #[test]
    fn empty_plan_selects_nothing() {
        assert_eq!(select_next(&Plan::default()), None);
    }

    #[test]
    fn lowest_priority_wins_and_none_sorts_last() {
        let plan = Plan::new(vec![
            prioritized("none", None, "n"),
            prioritized("two", Some(2), "t"),
            prioritized("zero", Some(0), "z"),
        ]);
        assert_eq!(select_next(&plan), Some(2));
    }

    #[test]
    fn ties_break_by_list_position() {
        let plan = Plan::new(vec![
            prioritized("first", Some(1), "f"),
            prioritized("second", Some(1), "s"),
        ]);
        assert_eq!(select_next(&plan), Some(0));
    }

    #[test]
    fn unmet_dependency_blocks_selection() {
        let plan = Plan::new(vec![
            step("dep", StepStatus::Running, &[], Some("d")),
            step("blocked", StepStatus::Pending, &["dep"], Some("b")),
        ]);
        // "dep" itself is executable; "blocked" is not.
        assert_eq!(select_next(&plan), Some(0));
    }

    #[test]
    fn failed_dependency_keeps_dependents_blocked() {
        let plan = Plan::new(vec![
            step("dep", StepStatus::Failed, &[], Some("d")),
            step("blocked", StepStatus::Pending, &["dep"], Some("b")),
        ]);
        assert_eq!(select_next(&plan), None);
    }

    #[test]
    fn vanished_dependency_does_not_block() {
        let plan = Plan::new(vec![step("only", StepStatus::Pending, &["ghost"], Some("o"))]);
        assert_eq!(select_next(&plan), Some(0));
    }

    #[test]
    fn terminal_and_payloadless_steps_are_skipped() {
        let mut no_payload = step("silent", StepStatus::Pending, &[], None);
        no_payload.command = Some(Command {
            reason: Some("thinking".to_string()),
            ..Command::default()
        });
        let plan = Plan::new(vec![
            step("done", StepStatus::Completed, &[], Some("d")),
            no_payload,
            step("ready", StepStatus::Pending, &[], Some("r")),
        ]);
        assert_eq!(select_next(&plan), Some(2));
    }

    #[test]
    fn running_steps_remain_selectable() {
        let plan = Plan::new(vec![step("active", StepStatus::Running, &[], Some("a"))]);
        assert_eq!(select_next(&plan), Some(0));
    }

    #[test]
    fn dependency_ids_resolve_case_insensitively() {
        let plan = Plan::new(vec![
            step("Build", StepStatus::Completed, &[], Some("b")),
            step("test", StepStatus::Pending, &["BUILD"], Some("t")),
        ]);
        assert_eq!(select_next(&plan), Some(1));
    }

    fn arb_plan() -> impl Strategy<Value = Plan> {
        let statuses = prop_oneof![
            Just(StepStatus::Pending),
            Just(StepStatus::Running),
            Just(StepStatus::Completed),
            Just(StepStatus::Failed),
            Just(StepStatus::Abandoned),
        ];
        prop::collection::vec(
            (
                "[a-e]",
                statuses,
                prop::collection::btree_set("[a-e]", 0..3),
                prop::option::of(0i64..4),
            ),
            0..8,
        )
        .prop_map(|raw| {
            let mut seen = std::collections::HashSet::new();
            let steps = raw
                .into_iter()
                .filter(|(id, _, _, _)| seen.insert(id.clone()))
                .map(|(id, status, deps, priority)| {
                    let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                    PlanStep {
                        priority,
                        ..step(&id, status, &deps, Some("run"))
                    }
                })
                .collect();
            Plan::new(steps)
        })
    }

    proptest! {
        // The selected step never waits on a resolvable dependency that is
        // anything other than completed.
        #[test]
        fn selection_respects_dependency_safety(plan in arb_plan()) {
            if let Some(idx) = select_next(&plan) {
                let chosen = &plan.steps()[idx];
                prop_assert!(!chosen.status.is_terminal());
                for dep in &chosen.waiting_for_id {
                    if let Some(target) = plan.find(dep) {
                        prop_assert_eq!(target.status, StepStatus::Completed);
                    }
                }
            }
        }
    }
}
