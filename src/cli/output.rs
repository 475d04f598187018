//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying plans, pass
//! reports and stored state in text or JSON, and a progress sink that
//! prints events to stderr as they happen.

use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::PropertyMap;
use crate::events::{LifecyclePhase, PassStatus, ProgressEvent, ProgressSink};
use crate::orchestrator::PassReport;
use crate::planner::{ExecutionPlan, OperationKind, OperationOutcome};
use crate::reconciler::RefreshStatus;
use crate::state::{LockInfo, StackState};

use super::commands::OutputFormat;

/// Placeholder printed instead of a sensitive value.
pub const MASK: &str = "********";

/// Output formatter for CLI.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    type_name: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Operation result row for table display.
#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Stored resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    type_name: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "Properties")]
    properties: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ExecutionPlan) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&PlanJson::from(plan)).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &ExecutionPlan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - stack is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::from("\nExecution Plan\n\n");
        let rows: Vec<PlanRow> = plan
            .actionable()
            .into_iter()
            .enumerate()
            .map(|(i, op)| PlanRow {
                index: i + 1,
                action: Self::format_kind(op.kind),
                resource: op.name.clone(),
                type_name: op.type_name().to_string(),
                reason: Self::truncate(&op.reason, 40),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            plan.count(OperationKind::Create).to_string().green(),
            plan.count(OperationKind::Update).to_string().yellow(),
            plan.count(OperationKind::Replace).to_string().yellow(),
            plan.count(OperationKind::Delete).to_string().red()
        );
        output
    }

    /// Formats the report of a finished pass.
    #[must_use]
    pub fn format_report(&self, report: &PassReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &PassReport) -> String {
        let mut output = String::new();

        if let Some(refresh) = &report.refresh {
            let changed: Vec<_> = refresh
                .entries
                .iter()
                .filter(|e| e.status != RefreshStatus::InSync)
                .collect();
            if changed.is_empty() {
                let _ = writeln!(output, "{} Refresh: {} resources in sync", "✓".green(), refresh.entries.len());
            } else {
                let _ = writeln!(output, "{} Refresh found changes:", "⚠".yellow());
                for entry in changed {
                    let _ = writeln!(output, "   - {}: {}", entry.name, entry.status);
                }
            }
        }

        let rows: Vec<ResultRow> = report
            .execution
            .results
            .iter()
            .filter(|r| r.kind != OperationKind::Noop || !r.outcome.is_success())
            .map(|r| ResultRow {
                resource: r.name.clone(),
                action: Self::format_kind(r.kind),
                outcome: Self::format_outcome(&r.outcome),
                detail: match &r.outcome {
                    OperationOutcome::Failed { reason, kind } => {
                        Self::truncate(&format!("{kind}: {reason}"), 60)
                    }
                    OperationOutcome::Skipped { reason } => Self::truncate(reason, 60),
                    OperationOutcome::Succeeded | OperationOutcome::Unchanged => {
                        r.provider_id.clone().unwrap_or_default()
                    }
                },
            })
            .collect();
        if !rows.is_empty() {
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let status = if report.success() {
            format!("{} {} succeeded", "✓".green(), report.operation)
        } else {
            format!("{} {} failed", "✗".red(), report.operation)
        };
        let _ = write!(output, "\n{status} for stack '{}'", report.stack);
        if report.state_removed {
            output.push_str(" (state removed)");
        } else {
            let _ = write!(output, " (sequence {})", report.sequence);
        }
        output.push('\n');

        let execution = &report.execution;
        let _ = writeln!(
            output,
            "   Succeeded: {}  Unchanged: {}  Failed: {}  Skipped: {}",
            execution.succeeded(),
            execution.unchanged(),
            execution.failed(),
            execution.skipped()
        );
        if let Some(kind) = report.failure_kind() {
            let _ = writeln!(output, "   {kind}: {}", report.failure_summary());
        }
        output
    }

    /// Formats stored state with sensitive values masked.
    #[must_use]
    pub fn format_state(&self, state: &StackState) -> String {
        let masked = mask_state(state);
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&masked).unwrap_or_default(),
            OutputFormat::Text => Self::format_state_text(&masked),
        }
    }

    fn format_state_text(state: &StackState) -> String {
        let mut output = String::new();

        let _ = write!(output, "\nState: {}", state.stack);
        if !state.project.is_empty() {
            let _ = write!(output, " (project {})", state.project);
        }
        output.push_str("\n\n");
        let _ = writeln!(output, "   Sequence: {}", state.sequence);
        let _ = writeln!(output, "   Last updated: {}", state.last_updated);
        let _ = writeln!(output, "   Resources: {}", state.resources.len());

        if !state.resources.is_empty() {
            let rows: Vec<ResourceRow> = state
                .resources
                .values()
                .map(|r| ResourceRow {
                    name: r.name.clone(),
                    type_name: r.type_name.clone(),
                    id: Self::truncate(&r.provider_id, 24),
                    dependencies: r.dependencies.join(", "),
                    properties: Self::truncate(&Self::inline_properties(&r.properties), 50),
                })
                .collect();
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        if !state.history.is_empty() {
            let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
            for entry in state.history.iter().rev().take(5) {
                let status = if entry.success { "✓" } else { "✗" };
                let _ = write!(
                    output,
                    "     {status} {} - {} ({})",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    entry.operation,
                    entry.resources.join(", ")
                );
                if let Some(error) = &entry.error {
                    let _ = write!(output, ": {error}");
                }
                output.push('\n');
            }
        }

        output
    }

    /// Formats the lock holder of a stack.
    #[must_use]
    pub fn format_lock(&self, stack: &str, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "stack": stack,
                "lock": lock,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => lock.map_or_else(
                || format!("Stack '{stack}' is not locked.\n"),
                |info| {
                    let state = if info.is_expired() {
                        "expired".yellow().to_string()
                    } else {
                        format!("{}s left", info.remaining_secs())
                    };
                    format!(
                        "Stack '{stack}' is locked by {} since {} ({state})\n   Lock ID: {}\n",
                        info.holder, info.acquired_at, info.lock_id
                    )
                },
            ),
        }
    }

    fn format_kind(kind: OperationKind) -> String {
        match kind {
            OperationKind::Create => "+create".green().to_string(),
            OperationKind::Update => "~update".yellow().to_string(),
            OperationKind::Replace => "-/+replace".yellow().to_string(),
            OperationKind::Delete => "-delete".red().to_string(),
            OperationKind::Noop => "noop".dimmed().to_string(),
        }
    }

    fn format_outcome(outcome: &OperationOutcome) -> String {
        match outcome {
            OperationOutcome::Succeeded => "succeeded".green().to_string(),
            OperationOutcome::Unchanged => "unchanged".dimmed().to_string(),
            OperationOutcome::Failed { .. } => "failed".red().to_string(),
            OperationOutcome::Skipped { .. } => "skipped".yellow().to_string(),
        }
    }

    fn inline_properties(properties: &PropertyMap) -> String {
        properties
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}={s}"),
                other => format!("{k}={other}"),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

/// Returns a copy of `state` with every sensitive value replaced by [`MASK`].
#[must_use]
pub fn mask_state(state: &StackState) -> StackState {
    let mut masked = state.clone();
    for resource in masked.resources.values_mut() {
        for key in &resource.sensitive {
            for map in [&mut resource.properties, &mut resource.outputs] {
                if let Some(value) = map.get_mut(key) {
                    *value = Value::String(MASK.to_string());
                }
            }
        }
    }
    masked
}

/// Prints progress events to stderr as they arrive.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleSink {
    format: OutputFormat,
}

impl ConsoleSink {
    /// Creates a sink printing in the given format.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Renders one event as a text line. Returns `None` for events not worth
    /// a line of their own.
    #[must_use]
    pub fn render(event: &ProgressEvent) -> Option<String> {
        match event {
            ProgressEvent::Phase { phase } => match phase {
                LifecyclePhase::Locking => Some(format!("{} Acquiring stack lock", "→".cyan())),
                LifecyclePhase::Refreshing => Some(format!("{} Refreshing", "→".cyan())),
                LifecyclePhase::Applying => Some(format!("{} Applying", "→".cyan())),
                LifecyclePhase::Unlocked(PassStatus::Failed) => {
                    Some(format!("{} Lock released after failure", "✗".red()))
                }
                _ => None,
            },
            ProgressEvent::OperationStarted { resource, kind } => {
                Some(format!("   {kind} {resource}..."))
            }
            ProgressEvent::OperationFinished {
                resource,
                kind,
                outcome,
            } => {
                let mark = match outcome {
                    OperationOutcome::Succeeded => "✓".green(),
                    OperationOutcome::Unchanged => return None,
                    OperationOutcome::Failed { .. } => "✗".red(),
                    OperationOutcome::Skipped { .. } => "-".yellow(),
                };
                Some(format!("   {mark} {kind} {resource}: {outcome}"))
            }
            ProgressEvent::Drift { resource, detail } => {
                Some(format!("   {} {resource}: {detail}", "⚠".yellow()))
            }
        }
    }
}

impl ProgressSink for ConsoleSink {
    fn emit(&self, event: ProgressEvent) {
        match self.format {
            OutputFormat::Json => {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{line}");
                }
            }
            OutputFormat::Text => {
                if let Some(line) = Self::render(&event) {
                    eprintln!("{line}");
                }
            }
        }
    }
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson {
    created_at: String,
    creates: usize,
    updates: usize,
    replaces: usize,
    deletes: usize,
    operations: Vec<OperationJson>,
}

#[derive(Serialize)]
struct OperationJson {
    kind: OperationKind,
    resource: String,
    #[serde(rename = "type")]
    type_name: String,
    reason: String,
    depends_on: Vec<String>,
}

impl From<&ExecutionPlan> for PlanJson {
    fn from(plan: &ExecutionPlan) -> Self {
        Self {
            created_at: plan.created_at.to_rfc3339(),
            creates: plan.count(OperationKind::Create),
            updates: plan.count(OperationKind::Update),
            replaces: plan.count(OperationKind::Replace),
            deletes: plan.count(OperationKind::Delete),
            operations: plan
                .operations
                .iter()
                .map(|op| OperationJson {
                    kind: op.kind,
                    resource: op.name.clone(),
                    type_name: op.type_name().to_string(),
                    reason: op.reason.clone(),
                    depends_on: op
                        .dependencies
                        .iter()
                        .filter_map(|&i| plan.operations.get(i).map(|d| d.name.clone()))
                        .collect(),
                })
                .collect(),
        }
    }
}
