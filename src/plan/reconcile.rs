//! Plan reconciliation — merging a model-proposed plan into local state.
//!
//! The local plan is authoritative for execution outcomes. The model proposes
//! structure (steps, titles, commands, dependencies); it never gets to decide
//! that work already happened, and it cannot silently downgrade or reopen
//! finished work by resending the same command.

use std::collections::HashSet;

use crate::plan::{IncomingStep, Plan, PlanStep, StepStatus};

/// Merge `incoming` into `local`.
///
/// With merging disabled an incoming plan wholesale replaces the local one
/// (all statuses forced to pending), and an empty incoming plan clears it.
/// With merging enabled an empty incoming plan means "no update", and
/// non-empty plans merge by case-insensitive id.
pub fn reconcile(local: &mut Plan, incoming: &[IncomingStep], merge_enabled: bool) {
    if incoming.is_empty() {
        if !merge_enabled {
            local.clear();
        }
        return;
    }

    if !merge_enabled {
        let steps = dedup_incoming(incoming)
            .into_iter()
            .map(IncomingStep::into_pending_step)
            .collect();
        *local = Plan::new(steps);
        return;
    }

    let incoming = dedup_incoming(incoming);
    let mut consumed: HashSet<usize> = HashSet::new();
    let mut merged: Vec<PlanStep> = Vec::with_capacity(local.steps.len() + incoming.len());

    for inc in incoming {
        let matched = local
            .steps
            .iter()
            .position(|step| step.matches_id(&inc.id))
            .filter(|idx| !consumed.contains(idx));
        match matched {
            Some(idx) => {
                consumed.insert(idx);
                let mut step = local.steps[idx].clone();
                apply_incoming(&mut step, inc);
                merged.push(step);
            }
            None => merged.push(inc.into_pending_step()),
        }
    }

    // Steps the model omitted are preserved as-is, after the incoming order.
    for (idx, step) in local.steps.iter().enumerate() {
        if !consumed.contains(&idx) {
            merged.push(step.clone());
        }
    }

    *local = Plan::new(merged);
}

/// Update one matched local step from its incoming counterpart.
fn apply_incoming(step: &mut PlanStep, inc: IncomingStep) {
    if step.status.is_terminal() {
        let identical = match (&step.command, &inc.command) {
            (None, None) => true,
            (Some(local), Some(incoming)) => local.same_invocation(incoming),
            _ => false,
        };
        if identical {
            // Finished or failed work resent unchanged: local state wins.
            return;
        }
        match step.status {
            // A changed command on a failed or abandoned step is a
            // deliberate retry.
            StepStatus::Failed | StepStatus::Abandoned => {
                step.status = StepStatus::Pending;
                step.command = inc.command;
                step.observation = None;
                step.title = inc.title;
                step.waiting_for_id = inc.waiting_for_id;
                step.priority = inc.priority;
            }
            // Completed work is not reopened by an incidental rewrite.
            StepStatus::Completed => {}
            StepStatus::Pending | StepStatus::Running => unreachable!("terminal checked above"),
        }
        return;
    }

    // Non-terminal: structure follows the model, status follows execution.
    step.title = inc.title;
    step.command = inc.command;
    step.waiting_for_id = inc.waiting_for_id;
    step.priority = inc.priority;
}

/// Drop repeated ids within one incoming plan; the first occurrence wins.
fn dedup_incoming(incoming: &[IncomingStep]) -> Vec<IncomingStep> {
    let mut seen: HashSet<String> = HashSet::new();
    incoming
        .iter()
        .filter(|step| seen.insert(step.id.to_ascii_lowercase()))
        .cloned()
        .collect()
}
