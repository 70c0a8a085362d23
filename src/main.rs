mod approval;
mod cli;
mod config;
mod events;
mod history;
mod llm;
mod observation;
mod parse;
mod pass;
mod persist;
mod plan;
mod prompts;
mod runtime;
mod scheduler;
mod shell_completion;
mod subagent;
mod usage;
mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use approval::TerminalDecisionProvider;
use cli::{Cli, Command};
use config::ProjectConfig;
use events::{ConsoleEventSink, EventSink, FanoutEventSink, JsonlEventSink};
use history::History;
use llm::HttpCompletionClient;
use pass::{
    CancelFlag, Dependencies, LoopEnd, PassConfig, PassExecutor, SystemClock,
};
use persist::{JsonPlanStore, PlanStore};
use plan::StepStatus;
use runtime::ShellProcessRunner;
use usage::{NoopUsageCounter, SqliteUsageCounter, UsageCounter};
use validate::{JsonSchemaValidator, PlanSemanticValidator};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let quiet_command = matches!(cli.command, Command::Config | Command::Completions { .. });

    let filter = match cli.verbose {
        0 if quiet_command => "planrun=warn",
        0 => "planrun=info",
        1 => "planrun=debug",
        _ => "planrun=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !quiet_command {
        match &config_path {
            Some(path) => info!("loaded config from {}", path.display()),
            None => info!("no .planrun/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Run {
            goal,
            auto_approve,
            no_merge,
            model,
            resume,
            max_passes,
        } => run_session(
            &goal,
            RunOverrides {
                auto_approve,
                no_merge,
                model,
                resume,
                max_passes,
            },
            &config,
            config_path.as_deref(),
            &cwd,
        ),
        Command::Plan { json } => show_plan(&config_path, &cwd, json),
        Command::Config => {
            print!("{}", render_config(&config, config_path.as_deref()));
            Ok(())
        }
        Command::Completions { shell } => shell_completion::print(shell),
    }
}

struct RunOverrides {
    auto_approve: bool,
    no_merge: bool,
    model: Option<String>,
    resume: bool,
    max_passes: Option<u32>,
}

fn run_session(
    goal: &str,
    overrides: RunOverrides,
    config: &ProjectConfig,
    config_path: Option<&Path>,
    cwd: &Path,
) -> Result<()> {
    let state_dir = ProjectConfig::state_dir(config_path, cwd);

    let cancel = CancelFlag::default();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())
            .context("failed to install interrupt handler")?;
    }

    let session_id = uuid::Uuid::new_v4();
    let log_path = state_dir
        .join("logs")
        .join(format!("session-{session_id}.jsonl"));
    let jsonl = JsonlEventSink::new(&log_path)?;
    let events: Arc<dyn EventSink> = Arc::new(FanoutEventSink::new(vec![
        Arc::new(ConsoleEventSink),
        Arc::new(jsonl),
    ]));

    let usage: Arc<dyn UsageCounter> = match SqliteUsageCounter::open(&state_dir.join("usage.db")) {
        Ok(counter) => Arc::new(counter),
        Err(err) => {
            warn!(%err, "usage db unavailable; command usage will not be recorded");
            Arc::new(NoopUsageCounter)
        }
    };

    let store = Arc::new(JsonPlanStore::new(&state_dir.join("plan.json")));
    let initial_plan = if overrides.resume { store.load() } else { None };
    if overrides.resume && initial_plan.is_none() {
        info!("no plan snapshot to resume; starting fresh");
    }

    let api_key = std::env::var(&config.llm.api_key_env).ok();
    if api_key.is_none() {
        warn!(
            "no API key in ${}; the completion endpoint may reject requests",
            config.llm.api_key_env
        );
    }
    let completion = HttpCompletionClient::new(
        config.llm.endpoint.clone(),
        api_key,
        cancel.clone(),
        Duration::from_secs(config.llm.request_timeout_secs),
    );

    let deps = Dependencies {
        completion: Arc::new(completion),
        runner: Arc::new(ShellProcessRunner),
        decisions: Arc::new(TerminalDecisionProvider),
        schema: Arc::new(JsonSchemaValidator::new()),
        semantics: Arc::new(PlanSemanticValidator::new(config.limits.max_plan_steps)),
        store,
        events,
        usage,
        clock: Arc::new(SystemClock),
        cancel,
    };

    let pass_config = PassConfig {
        model: overrides.model.unwrap_or_else(|| config.defaults.model.clone()),
        merge_plan_updates: config.defaults.merge_plan_updates && !overrides.no_merge,
        auto_approve: config.defaults.auto_approve || overrides.auto_approve,
        extra_allowlist: config.approval.allow.clone(),
        default_shell: config.defaults.shell.clone(),
        default_timeout: Duration::from_secs(config.defaults.timeout_secs),
        max_consecutive_nudges: config.limits.max_consecutive_nudges,
        subagent_max_passes: config.limits.subagent_max_passes,
        subagent_max_depth: config.limits.subagent_max_depth,
        depth: 0,
    };

    info!(model = %pass_config.model, session = %session_id, "starting session");
    let history = History::seeded(prompts::SYSTEM_PROMPT, goal);
    let mut executor = PassExecutor::new(pass_config, deps, history, initial_plan);

    let cap = overrides.max_passes.unwrap_or(config.defaults.max_passes);
    match executor.run_to_completion(Some(cap)) {
        LoopEnd::Stopped => info!("session finished"),
        LoopEnd::CapReached => warn!("session hit the pass cap ({cap}); plan snapshot kept"),
    }

    print!("{}", render_plan_summary(executor.plan()));
    info!("event log: {}", log_path.display());
    Ok(())
}

fn show_plan(config_path: &Option<PathBuf>, cwd: &Path, json: bool) -> Result<()> {
    let state_dir = ProjectConfig::state_dir(config_path.as_deref(), cwd);
    let store = JsonPlanStore::new(&state_dir.join("plan.json"));
    let Some(plan) = store.load() else {
        println!("no plan snapshot found");
        return Ok(());
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&plan).context("failed to render plan as JSON")?
        );
    } else {
        print!("{}", render_plan_summary(&plan));
    }
    Ok(())
}

fn status_glyph(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "·",
        StepStatus::Running => "→",
        StepStatus::Completed => "✓",
        StepStatus::Failed => "✗",
        StepStatus::Abandoned => "—",
    }
}

fn render_plan_summary(plan: &plan::Plan) -> String {
    if plan.is_empty() {
        return "plan: (empty)\n".to_string();
    }
    let mut out = String::from("plan:\n");
    for step in plan.steps() {
        out.push_str(&format!(
            "  {} {}  {}",
            status_glyph(step.status),
            step.id,
            step.title
        ));
        if !step.waiting_for_id.is_empty() {
            let deps: Vec<&str> = step.waiting_for_id.iter().map(String::as_str).collect();
            out.push_str(&format!("  (waits on {})", deps.join(", ")));
        }
        out.push('\n');
    }
    out
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<24} {value}\n"));
}

fn render_config(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut out = String::new();
    out.push_str("Defaults\n");
    push_kv(&mut out, "model", &config.defaults.model);
    push_kv(&mut out, "merge_plan_updates", config.defaults.merge_plan_updates);
    push_kv(&mut out, "auto_approve", config.defaults.auto_approve);
    push_kv(&mut out, "shell", &config.defaults.shell);
    push_kv(&mut out, "timeout_secs", config.defaults.timeout_secs);
    push_kv(&mut out, "max_passes", config.defaults.max_passes);
    out.push('\n');

    out.push_str("Approval\n");
    if config.approval.allow.is_empty() {
        push_kv(&mut out, "extra allowlist", "(none)");
    } else {
        push_kv(&mut out, "extra allowlist", config.approval.allow.join(", "));
    }
    out.push('\n');

    out.push_str("Llm\n");
    push_kv(&mut out, "endpoint", &config.llm.endpoint);
    push_kv(&mut out, "api_key_env", &config.llm.api_key_env);
    push_kv(&mut out, "request_timeout_secs", config.llm.request_timeout_secs);
    out.push('\n');

    out.push_str("Limits\n");
    push_kv(&mut out, "max_plan_steps", config.limits.max_plan_steps);
    push_kv(&mut out, "max_consecutive_nudges", config.limits.max_consecutive_nudges);
    push_kv(&mut out, "subagent_max_passes", config.limits.subagent_max_passes);
    push_kv(&mut out, "subagent_max_depth", config.limits.subagent_max_depth);
    out.push('\n');

    out.push_str("Source Path\n");
    push_kv(
        &mut out,
        "path",
        config_path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults — no .planrun/config.toml found)".to_string()),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::step;

    #[test]
    fn plan_summary_shows_status_and_dependencies() {
        let plan = plan::Plan::new(vec![
            step("build", StepStatus::Completed, &[], Some("make")),
            step("test", StepStatus::Pending, &["build"], Some("make test")),
        ]);
        let rendered = render_plan_summary(&plan);
        assert!(rendered.contains("✓ build"));
        assert!(rendered.contains("· test"));
        assert!(rendered.contains("(waits on build)"));
    }

    #[test]
    fn config_render_includes_every_section() {
        let rendered = render_config(&ProjectConfig::default(), None);
        for section in ["Defaults", "Approval", "Llm", "Limits", "Source Path"] {
            assert!(rendered.contains(section), "missing section {section}");
        }
        assert!(rendered.contains("gpt-4o-mini"));
    }
}
