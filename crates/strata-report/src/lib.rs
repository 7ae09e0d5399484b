use std::collections::BTreeMap;
use std::fmt::Write;
use std::io::{self, IsTerminal};

use console::Style;
use strata_domain::{
    Change, ChangeAction, Changeset, NodeId, NodeOutcome, NodeResult, ResourceType, RunOutcome,
    RunReport,
};

mod error;
mod options;
mod redaction;

pub use error::ReportError;
pub use options::{ColorChoice, OutputFormat, RenderOptions};
pub use redaction::redact_sensitive;

/// Render a changeset in the requested output format.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn render_plan(
    changeset: &Changeset,
    format: OutputFormat,
    options: &RenderOptions,
) -> std::result::Result<String, ReportError> {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(changeset).map_err(|source| ReportError::JsonSerialize {
                what: "changeset",
                source,
            })
        }
        OutputFormat::Text => Ok(render_plan_text(changeset, options)),
    }
}

/// Render a run report in the requested output format.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn render_run(
    report: &RunReport,
    format: OutputFormat,
    options: &RenderOptions,
) -> std::result::Result<String, ReportError> {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(report).map_err(|source| ReportError::JsonSerialize {
                what: "run report",
                source,
            })
        }
        OutputFormat::Text => Ok(render_run_text(report, options)),
    }
}

// ---------------------------------------------------------------------------
// Plan text
// ---------------------------------------------------------------------------

fn render_plan_text(changeset: &Changeset, options: &RenderOptions) -> String {
    let mut output = String::new();
    let style = TextStyle::new(options.color);

    let command = options.command.as_deref().unwrap_or("plan");
    append_header(&mut output, command, options.target.as_deref(), &style);

    if changeset.operations.is_empty() {
        let _ = writeln!(output, "  Nothing to do.");
        append_warnings(&mut output, &changeset.warnings, &style);
        return output;
    }

    let (changed, noops): (Vec<(usize, &Change)>, Vec<(usize, &Change)>) = changeset
        .operations
        .iter()
        .enumerate()
        .partition(|(_, change)| change.action.mutates());

    append_warnings(&mut output, &changeset.warnings, &style);
    let _ = writeln!(output);
    for (index, change) in &changed {
        append_change_line(&mut output, *index, change, options, &style);
    }
    if options.verbose {
        for (index, change) in &noops {
            append_change_line(&mut output, *index, change, options, &style);
        }
    } else if !noops.is_empty() {
        if !changed.is_empty() {
            let _ = writeln!(output);
        }
        let counts = UnchangedCounts::from_types(noops.iter().map(|(_, change)| change.resource_type));
        let _ = writeln!(output, "  {}", style.dim(&counts.format()));
    }

    let _ = writeln!(output);
    let summary = changeset.summary();
    let mut parts = Vec::new();
    if summary.create > 0 {
        parts.push(style.label(Tone::Add, &format!("{} to create", summary.create)));
    }
    if summary.update > 0 {
        parts.push(style.label(Tone::Change, &format!("{} to update", summary.update)));
    }
    if summary.delete > 0 {
        parts.push(style.label(Tone::Delete, &format!("{} to delete", summary.delete)));
    }
    if summary.no_op > 0 {
        parts.push(style.dim(&format!("{} unchanged", summary.no_op)));
    }
    let _ = writeln!(output, "{}", tally_line(&style, "Plan:", &parts));

    output
}

fn append_change_line(
    output: &mut String,
    index: usize,
    change: &Change,
    options: &RenderOptions,
    style: &TextStyle,
) {
    let (symbol, label) = change_symbol_and_label(change, style);
    let detail = node_detail(change.node.as_str(), change.resource_type, style);
    let _ = write!(output, "  {symbol} {label}{detail}");
    if let Some(reason) = &change.reason {
        let _ = write!(output, "  {}", style.dim(reason));
    }
    let _ = writeln!(output);

    if options.verbose {
        let mut meta = format!("#{index} {}", change.phase.as_str());
        if !change.depends_on.is_empty() {
            let after: Vec<String> = change
                .depends_on
                .iter()
                .map(|dependency| format!("#{dependency}"))
                .collect();
            let _ = write!(meta, " after {}", after.join(", "));
        }
        if change.probe {
            meta.push_str(" (probe first)");
        }
        let _ = writeln!(output, "    {}", style.dim(&meta));
        if let Some(fingerprint) = &change.fingerprint {
            let short = &fingerprint[..fingerprint.len().min(12)];
            let _ = writeln!(
                output,
                "    {}",
                style.dim(&format!("inputs:   sha256:{short}"))
            );
        }
    }
}

fn change_symbol_and_label(change: &Change, style: &TextStyle) -> (String, String) {
    match (change.action, change.replacement) {
        (ChangeAction::Create, false) => (
            style.symbol(Tone::Add, "+"),
            TextStyle::pad_label(&style.label(Tone::Add, "create")),
        ),
        (ChangeAction::Create, true) => (
            style.symbol(Tone::Add, "+"),
            TextStyle::pad_label(&style.label(Tone::Add, "replace (create)")),
        ),
        (ChangeAction::Update, _) => (
            style.symbol(Tone::Change, "~"),
            TextStyle::pad_label(&style.label(Tone::Change, "update")),
        ),
        (ChangeAction::Delete, false) => (
            style.symbol(Tone::Delete, "-"),
            TextStyle::pad_label(&style.label(Tone::Delete, "delete")),
        ),
        (ChangeAction::Delete, true) => (
            style.symbol(Tone::Delete, "-"),
            TextStyle::pad_label(&style.label(Tone::Delete, "replace (delete)")),
        ),
        (ChangeAction::NoOp, _) => (
            style.symbol(Tone::Quiet, "="),
            TextStyle::pad_label(&style.label(Tone::Quiet, "unchanged")),
        ),
    }
}

// ---------------------------------------------------------------------------
// Run text
// ---------------------------------------------------------------------------

fn render_run_text(report: &RunReport, options: &RenderOptions) -> String {
    let mut output = String::new();
    let style = TextStyle::new(options.color);

    let command = options.command.as_deref().unwrap_or("apply");
    append_header(&mut output, command, options.target.as_deref(), &style);

    if report.results.is_empty() {
        let _ = writeln!(output, "  Nothing to do.");
        append_warnings(&mut output, &report.changeset.warnings, &style);
        return output;
    }

    let (active, unchanged): (Vec<&NodeResult>, Vec<&NodeResult>) = report
        .results
        .iter()
        .partition(|result| result.outcome != NodeOutcome::Unchanged);

    append_warnings(&mut output, &report.changeset.warnings, &style);
    let _ = writeln!(output);
    for result in &active {
        append_result_line(&mut output, report, result, options, &style);
    }
    if options.verbose {
        for result in &unchanged {
            append_result_line(&mut output, report, result, options, &style);
        }
    } else if !unchanged.is_empty() {
        if !active.is_empty() {
            let _ = writeln!(output);
        }
        let counts = UnchangedCounts::from_types(
            unchanged
                .iter()
                .filter_map(|result| report.changeset.operations.get(result.index))
                .map(|change| change.resource_type),
        );
        let _ = writeln!(output, "  {}", style.dim(&counts.format()));
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "{}", RunTally::from_results(&report.results).format(&style));
    match report.outcome() {
        RunOutcome::Succeeded => {}
        RunOutcome::PartiallyFailed => {
            let failed: Vec<&str> = report.failed.iter().map(NodeId::as_str).collect();
            let _ = writeln!(
                output,
                "{} {}",
                style.error_prefix("Partially failed:"),
                failed.join(", ")
            );
        }
        RunOutcome::Cancelled => {
            let _ = writeln!(
                output,
                "{} pending nodes were not started",
                style.warn_prefix("Cancelled:")
            );
        }
    }

    output
}

fn append_result_line(
    output: &mut String,
    report: &RunReport,
    result: &NodeResult,
    options: &RenderOptions,
    style: &TextStyle,
) {
    let change = report.changeset.operations.get(result.index);
    let (symbol, label) = result_symbol_and_label(result, change, style);
    let detail = change.map_or_else(
        || style.primary_text(result.node.as_str()),
        |change| node_detail(change.node.as_str(), change.resource_type, style),
    );
    let _ = writeln!(output, "  {symbol} {label}{detail}");

    match result.outcome {
        NodeOutcome::Failed => {
            if let Some(error) = &result.error {
                let _ = writeln!(output, "                     {}", style.error_detail(error));
            }
        }
        NodeOutcome::Blocked => {
            if let Some(by) = &result.blocked_by {
                let _ = writeln!(
                    output,
                    "                     {}",
                    style.dim(&format!("blocked by {by}"))
                );
            }
        }
        NodeOutcome::Applied | NodeOutcome::Unchanged | NodeOutcome::Cancelled => {}
    }

    if options.verbose && !result.transitions.is_empty() {
        let path: Vec<&str> = result.transitions.iter().map(|status| status.as_str()).collect();
        let _ = writeln!(
            output,
            "    {}",
            style.dim(&format!("#{} {}", result.index, path.join(" -> ")))
        );
    }
}

fn result_symbol_and_label(
    result: &NodeResult,
    change: Option<&Change>,
    style: &TextStyle,
) -> (String, String) {
    match result.outcome {
        NodeOutcome::Failed => {
            let label = if result.timed_out { "timed out" } else { "failed" };
            (
                style.symbol(Tone::Failed, "!"),
                TextStyle::pad_label(&style.label(Tone::Failed, label)),
            )
        }
        NodeOutcome::Blocked => (
            style.symbol(Tone::Blocked, "!"),
            TextStyle::pad_label(&style.label(Tone::Blocked, "blocked")),
        ),
        NodeOutcome::Cancelled => (
            style.symbol(Tone::Quiet, "-"),
            TextStyle::pad_label(&style.label(Tone::Quiet, "not started")),
        ),
        NodeOutcome::Unchanged => (
            style.symbol(Tone::Quiet, "="),
            TextStyle::pad_label(&style.label(Tone::Quiet, "unchanged")),
        ),
        NodeOutcome::Applied => {
            let replacement = change.is_some_and(|change| change.replacement);
            match result.action {
                ChangeAction::Create if replacement => (
                    style.symbol(Tone::Add, "+"),
                    TextStyle::pad_label(&style.label(Tone::Add, "recreated")),
                ),
                ChangeAction::Create => (
                    style.symbol(Tone::Add, "+"),
                    TextStyle::pad_label(&style.label(Tone::Add, "created")),
                ),
                ChangeAction::Update => (
                    style.symbol(Tone::Change, "~"),
                    TextStyle::pad_label(&style.label(Tone::Change, "updated")),
                ),
                ChangeAction::NoOp => (
                    style.symbol(Tone::Change, "~"),
                    TextStyle::pad_label(&style.label(Tone::Change, "updated (drift)")),
                ),
                ChangeAction::Delete => (
                    style.symbol(Tone::Delete, "-"),
                    TextStyle::pad_label(&style.label(Tone::Delete, "deleted")),
                ),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared line renderers
// ---------------------------------------------------------------------------

fn append_header(output: &mut String, command: &str, target: Option<&str>, style: &TextStyle) {
    let _ = write!(output, "{}", style.header_command(command));
    if let Some(t) = target {
        let _ = write!(output, " {}", style.header_target(t));
    }
    let _ = writeln!(output);
}

fn append_warnings(output: &mut String, warnings: &[String], style: &TextStyle) {
    if warnings.is_empty() {
        return;
    }
    let _ = writeln!(output);
    for warning in warnings {
        let _ = writeln!(output, "  {} {warning}", style.warn_prefix("warn:"));
    }
}

fn node_detail(node: &str, resource_type: ResourceType, style: &TextStyle) -> String {
    format!(
        "{} {}",
        style.primary_text(node),
        style.dim(&format!("({resource_type})"))
    )
}

fn tally_line(style: &TextStyle, label: &str, parts: &[String]) -> String {
    if parts.is_empty() {
        format!("{} nothing to do", style.tally_label(label))
    } else {
        format!("{} {}", style.tally_label(label), parts.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Unchanged Counts
// ---------------------------------------------------------------------------

struct UnchangedCounts {
    by_type: BTreeMap<ResourceType, usize>,
}

impl UnchangedCounts {
    fn from_types(types: impl Iterator<Item = ResourceType>) -> Self {
        let mut by_type = BTreeMap::new();
        for resource_type in types {
            *by_type.entry(resource_type).or_insert(0) += 1;
        }
        Self { by_type }
    }

    fn format(&self) -> String {
        let total: usize = self.by_type.values().sum();
        let parts: Vec<String> = self
            .by_type
            .iter()
            .map(|(resource_type, count)| format!("{count} {resource_type}"))
            .collect();
        if parts.is_empty() {
            format!("{total} unchanged")
        } else {
            format!("{total} unchanged ({})", parts.join(", "))
        }
    }
}

// ---------------------------------------------------------------------------
// Run Tally
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RunTally {
    created: usize,
    updated: usize,
    deleted: usize,
    failed: usize,
    blocked: usize,
    not_started: usize,
    unchanged: usize,
}

impl RunTally {
    fn from_results(results: &[NodeResult]) -> Self {
        let mut tally = Self::default();
        for result in results {
            match (result.outcome, result.action) {
                (NodeOutcome::Failed, _) => tally.failed += 1,
                (NodeOutcome::Blocked, _) => tally.blocked += 1,
                (NodeOutcome::Cancelled, _) => tally.not_started += 1,
                (NodeOutcome::Unchanged, _) => tally.unchanged += 1,
                (NodeOutcome::Applied, ChangeAction::Create) => tally.created += 1,
                (NodeOutcome::Applied, ChangeAction::Update | ChangeAction::NoOp) => {
                    tally.updated += 1;
                }
                (NodeOutcome::Applied, ChangeAction::Delete) => tally.deleted += 1,
            }
        }
        tally
    }

    fn format(&self, style: &TextStyle) -> String {
        let mut parts = Vec::new();
        if self.created > 0 {
            parts.push(style.label(Tone::Add, &format!("{} created", self.created)));
        }
        if self.updated > 0 {
            parts.push(style.label(Tone::Change, &format!("{} updated", self.updated)));
        }
        if self.deleted > 0 {
            parts.push(style.label(Tone::Delete, &format!("{} deleted", self.deleted)));
        }
        if self.failed > 0 {
            parts.push(style.label(Tone::Failed, &format!("{} failed", self.failed)));
        }
        if self.blocked > 0 {
            parts.push(style.label(Tone::Blocked, &format!("{} blocked", self.blocked)));
        }
        if self.not_started > 0 {
            parts.push(style.dim(&format!("{} not started", self.not_started)));
        }
        if self.unchanged > 0 {
            parts.push(style.dim(&format!("{} unchanged", self.unchanged)));
        }
        tally_line(style, "Applied:", &parts)
    }
}

// ---------------------------------------------------------------------------
// TextStyle
// ---------------------------------------------------------------------------

const LABEL_WIDTH: usize = 18;

#[derive(Debug, Clone, Copy)]
enum Tone {
    Add,
    Change,
    Delete,
    Blocked,
    Failed,
    Quiet,
}

impl Tone {
    fn style(self) -> Style {
        match self {
            Self::Add => Style::new().green(),
            Self::Change => Style::new().cyan(),
            Self::Delete => Style::new().magenta(),
            Self::Blocked => Style::new().yellow(),
            Self::Failed => Style::new().red(),
            Self::Quiet => Style::new().dim(),
        }
    }
}

#[derive(Debug, Clone)]
struct TextStyle {
    color_enabled: bool,
    primary_style: Style,
    dim_style: Style,
    error_detail_style: Style,
    header_cmd_style: Style,
    header_target_style: Style,
    warn_prefix_style: Style,
    error_prefix_style: Style,
    tally_label_style: Style,
}

impl TextStyle {
    fn new(choice: ColorChoice) -> Self {
        Self {
            color_enabled: should_color(choice),
            primary_style: Style::new().white(),
            dim_style: Style::new().dim(),
            error_detail_style: Style::new().red(),
            header_cmd_style: Style::new().white().bold(),
            header_target_style: Style::new().dim(),
            warn_prefix_style: Style::new().yellow().bold(),
            error_prefix_style: Style::new().red().bold(),
            tally_label_style: Style::new().white().bold(),
        }
    }

    fn paint<T: std::fmt::Display>(&self, style: &Style, text: T) -> String {
        if self.color_enabled {
            style.apply_to(text).to_string()
        } else {
            text.to_string()
        }
    }

    fn pad_label(painted: &str) -> String {
        // Visible width, ANSI codes excluded
        let visible_len = console::measure_text_width(painted);
        if visible_len < LABEL_WIDTH {
            format!("{painted}{}", " ".repeat(LABEL_WIDTH - visible_len))
        } else {
            format!("{painted} ")
        }
    }

    fn symbol(&self, tone: Tone, s: &str) -> String {
        let style = match tone {
            Tone::Quiet => tone.style(),
            _ => tone.style().bold(),
        };
        self.paint(&style, s)
    }

    fn label(&self, tone: Tone, s: &str) -> String {
        self.paint(&tone.style(), s)
    }

    fn primary_text(&self, s: &str) -> String {
        self.paint(&self.primary_style, s)
    }

    fn dim(&self, s: &str) -> String {
        self.paint(&self.dim_style, s)
    }

    fn error_detail(&self, s: &str) -> String {
        self.paint(&self.error_detail_style, s)
    }

    fn header_command(&self, s: &str) -> String {
        self.paint(&self.header_cmd_style, s)
    }

    fn header_target(&self, s: &str) -> String {
        self.paint(&self.header_target_style, s)
    }

    fn warn_prefix(&self, s: &str) -> String {
        self.paint(&self.warn_prefix_style, s)
    }

    fn error_prefix(&self, s: &str) -> String {
        self.paint(&self.error_prefix_style, s)
    }

    fn tally_label(&self, s: &str) -> String {
        self.paint(&self.tally_label_style, s)
    }
}

fn should_color(choice: ColorChoice) -> bool {
    match choice {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => io::stdout().is_terminal(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests;
