//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{StackDescription, ValidationResult};
use crate::graph::ResourceGraph;
use crate::planner::{ApplyReport, OpKind, OpStatus, Plan};
use crate::state::{LockInfo, ProvisionedState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct PlanOpRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "ID")]
    id: String,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// Graph node row for table display.
#[derive(Tabled, Serialize)]
struct GraphRow {
    #[tabled(rename = "#")]
    position: usize,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns the output format.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. Infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan for stack {}", plan.stack.bold());
        let _ = writeln!(
            output,
            "   Description hash: {}\n",
            Self::short(&plan.description_hash)
        );

        let rows: Vec<PlanOpRow> = plan
            .actionable()
            .enumerate()
            .map(|(i, op)| PlanOpRow {
                index: i + 1,
                action: Self::format_kind(op.kind),
                resource: op.identity(),
                reason: Self::truncate(&op.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            let _ = writeln!(output, "\nDetailed changes:");
            for op in plan.actionable() {
                let _ = writeln!(output, "  {op}");
                for field in &op.changed_fields {
                    let _ = writeln!(output, "      ~ {field}");
                }
                if !op.dependencies.is_empty() {
                    let deps: Vec<&str> = op.dependencies.iter().map(String::as_str).collect();
                    let _ = writeln!(output, "      after: {}", deps.join(", "));
                }
            }
        }

        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete.",
            plan.count(OpKind::Create).to_string().green(),
            plan.count(OpKind::Update).to_string().yellow(),
            plan.count(OpKind::Replace).to_string().magenta(),
            plan.count(OpKind::Delete).to_string().red()
        );

        output
    }

    /// Formats the report of an apply or destroy run.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.outcomes.is_empty() {
                    return format!("{} Nothing to do.\n", "✓".green());
                }

                let status = if report.is_success() {
                    format!("{} Apply complete", "✓".green())
                } else if report.cancelled {
                    format!("{} Apply cancelled", "⚠".yellow())
                } else {
                    format!("{} Apply failed", "✗".red())
                };

                let mut output = format!("\n{status}\n\n");
                let rows: Vec<OutcomeRow> = report
                    .outcomes
                    .iter()
                    .map(|o| OutcomeRow {
                        resource: o.identity.clone(),
                        action: o.kind.to_string(),
                        status: Self::format_status(o.status),
                        attempts: o.attempts,
                        id: o.provider_id.clone().unwrap_or_default(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let errors: Vec<_> = report
                    .outcomes
                    .iter()
                    .filter_map(|o| o.error.as_ref().map(|e| (&o.identity, e)))
                    .collect();
                if !errors.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for (identity, error) in errors {
                        let _ = writeln!(output, "   - {identity}: {error}");
                    }
                }

                let _ = writeln!(
                    output,
                    "\n{} succeeded, {} failed, {} skipped, {} not started ({}s)",
                    report.succeeded().len(),
                    report.failed().len(),
                    report.skipped().len(),
                    report.not_started().len(),
                    (report.finished_at - report.started_at).num_seconds()
                );
                output
            }
        }
    }

    /// Formats validation results.
    #[must_use]
    pub fn format_validation(
        &self,
        description: &StackDescription,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                if result.is_valid() {
                    let _ = writeln!(output, "{} Stack description is valid.", "✓".green());
                } else {
                    let _ = writeln!(
                        output,
                        "{} {} error(s) found:",
                        "✗".red(),
                        result.error_count()
                    );
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                    }
                }

                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = writeln!(output, "\nStack summary:");
                let _ = writeln!(output, "   Stack: {}", description.qualified_name());
                let _ = writeln!(output, "   Resources: {}", description.resources.len());
                let _ = writeln!(output, "   Provider: {:?}", description.provider.kind);
                output
            }
        }
    }

    /// Formats the resolved dependency order.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph) -> String {
        let rows: Vec<GraphRow> = graph
            .in_order()
            .enumerate()
            .map(|(i, spec)| GraphRow {
                position: i + 1,
                resource: spec.id.to_string(),
                dependencies: spec
                    .dependencies
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
            .collect();

        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&rows).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("\nDependency order for {}\n\n", graph.stack().bold());
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats provisioned state.
    #[must_use]
    pub fn format_state(&self, state: &ProvisionedState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}\n\n", state.stack.bold());
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(
                    output,
                    "   Description hash: {}",
                    Self::short(&state.description_hash)
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}\n", state.len());

                if !state.is_empty() {
                    let rows: Vec<ResourceRow> = state
                        .resources
                        .values()
                        .map(|r| ResourceRow {
                            name: r.name.clone(),
                            resource_type: r.resource_type.to_string(),
                            id: r.provider_id.clone(),
                            hash: Self::short(&r.spec_hash),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} succeeded, {} failed)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.succeeded.len(),
                            entry.failed.len()
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(lock).unwrap_or_default(),
            OutputFormat::Text => format!(
                "State locked: {} (holder {}, expires in {}s)",
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a status message.
    #[must_use]
    pub fn message(&self, level: MessageLevel, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": level.as_str(), "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let marker = match level {
                    MessageLevel::Success => "✓".green(),
                    MessageLevel::Warning => "⚠".yellow(),
                    MessageLevel::Error => "✗".red(),
                };
                format!("{marker} {message}")
            }
        }
    }

    /// Formats a kind with color.
    fn format_kind(kind: OpKind) -> String {
        match kind {
            OpKind::Create => "+ create".green().to_string(),
            OpKind::Update => "~ update".yellow().to_string(),
            OpKind::Replace => "-/+ replace".magenta().to_string(),
            OpKind::Delete => "- delete".red().to_string(),
            OpKind::NoOp => "no-op".dimmed().to_string(),
        }
    }

    /// Formats a status with color.
    fn format_status(status: OpStatus) -> String {
        match status {
            OpStatus::Succeeded => "succeeded".green().to_string(),
            OpStatus::Failed => "failed".red().to_string(),
            OpStatus::Skipped => "skipped".yellow().to_string(),
            OpStatus::NotStarted | OpStatus::Pending => status.to_string().dimmed().to_string(),
            OpStatus::InProgress => "in progress".cyan().to_string(),
        }
    }

    fn short(hash: &str) -> String {
        if hash.is_empty() {
            String::from("-")
        } else {
            hash.chars().take(8).collect()
        }
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

/// Severity of a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    /// Something completed.
    Success,
    /// Something needs attention.
    Warning,
    /// Something failed.
    Error,
}

impl MessageLevel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DescriptionParser;
    use crate::graph::GraphBuilder;
    use crate::planner::DiffEngine;

    fn plan() -> Plan {
        let yaml = r"
version: 1
stack: { prefix: demo }
resources:
  vpc:
    type: network
    properties: { cidr: 10.0.0.0/16 }
";
        let description = DescriptionParser::new().parse_yaml(yaml, None).unwrap();
        let graph = GraphBuilder::new().build(&description).unwrap();
        let state = ProvisionedState::new(graph.stack());
        let diff = DiffEngine::new().compute_diff(&graph, &state);
        Plan::from_diff(&diff, &graph, &state, "0123456789abcdef").unwrap()
    }

    #[test]
    fn test_plan_json_lists_operations() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let json: serde_json::Value =
            serde_json::from_str(&formatter.format_plan(&plan(), false)).unwrap();

        assert_eq!(json["stack"], "demo-dev");
        assert_eq!(json["ops"][0]["kind"], "create");
        assert_eq!(json["ops"][0]["resource"], "vpc");
    }

    #[test]
    fn test_plan_text_has_summary() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan(), true);

        assert!(text.contains("network/vpc"));
        assert!(text.contains("01234567"));
        assert!(text.contains("1 to create"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééééé", 6), "ééé...");
    }
}
