use std::io::IsTerminal;

use anstyle::{AnsiColor, Effects, Style};
use anyhow::{Context, Result};
use click_db::{GcEntry, RemovalOutcome};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    if std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none() {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

fn status_style(status: &str) -> Style {
    let color = match status {
        "removed" | "unregistered" => AnsiColor::Yellow,
        "kept" | "in-use" => AnsiColor::BrightBlue,
        _ => AnsiColor::Green,
    };
    Style::new().fg_color(Some(color.into())).effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => format!("{status}: {message}"),
        OutputStyle::Rich => format!("{} {message}", colorize(status_style(status), status)),
    }
}

pub(crate) fn format_package_lines<'a>(
    entries: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Vec<String> {
    entries
        .into_iter()
        .map(|(package, version)| format!("{package}\t{version}"))
        .collect()
}

pub(crate) fn format_gc_lines(style: OutputStyle, entries: &[GcEntry]) -> Vec<String> {
    entries
        .iter()
        .filter_map(|entry| {
            let status = match entry.outcome {
                RemovalOutcome::Removed => "removed",
                RemovalOutcome::InUse => "in-use",
                RemovalOutcome::Registered | RemovalOutcome::Absent => return None,
            };
            Some(render_status_line(
                style,
                status,
                &format!("{} {}", entry.package, entry.version),
            ))
        })
        .collect()
}

/// Drop report-only `_` keys from a manifest object.
pub(crate) fn strip_dynamic(value: Value) -> Value {
    match value {
        Value::Object(object) => Value::Object(click_core::strip_dynamic_keys(object)),
        other => other,
    }
}

/// Sorted keys, four-space indent.
pub(crate) fn render_json(value: &Value) -> Result<String> {
    let mut out = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    value
        .serialize(&mut serializer)
        .context("failed to render JSON")?;
    String::from_utf8(out).context("rendered JSON is not UTF-8")
}
