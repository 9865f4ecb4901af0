//! Colorful console output for compiler events.
//!
//! Provides a custom `tracing` layer that formats fastexpr events with colors.
//!
//! ## Log Levels
//!
//! - **INFO**: Native code installed for a unit
//! - **DEBUG**: Compiled units, declined trees, interpreter fallbacks
//! - **TRACE**: Pipeline stages and nested capture promotion

use num_format::{Locale, ToFormattedString};
use owo_colors::OwoColorize;
use std::io::{self, Write};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};


static INIT: OnceLock<()> = OnceLock::new();
static EPOCH: OnceLock<Instant> = OnceLock::new();

const DEFAULT_DIRECTIVE: &str = "fastexpr=info";

/// Initializes console output for the compiler.
///
/// Safe to call multiple times - only the first call has effect. The
/// `RUST_LOG` environment variable overrides the default `fastexpr=info`.
pub fn init() {
    INIT.get_or_init(|| {
        EPOCH.get_or_init(Instant::now);

        let filter = match DEFAULT_DIRECTIVE.parse() {
            Ok(directive) => EnvFilter::builder()
                .with_default_directive(directive)
                .from_env_lossy(),
            Err(_) => EnvFilter::from_default_env(),
        };

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(CompilerConsoleLayer)
            .try_init();
    });
}

fn elapsed_secs() -> f64 {
    EPOCH
        .get()
        .map_or(0.0, |epoch| epoch.elapsed().as_secs_f64())
}

/// A tracing layer that formats compiler events with colors.
pub struct CompilerConsoleLayer;

impl<S: Subscriber> Layer<S> for CompilerConsoleLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !metadata.target().starts_with("fastexpr") {
            return;
        }

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        let output = format_event(&visitor, *metadata.level());
        if !output.is_empty() {
            let _ = writeln!(io::stdout(), "{}", output);
        }
    }
}

#[derive(Default)]
struct EventVisitor {
    event: Option<String>,
    unit: Option<String>,
    reason: Option<String>,
    closure: Option<String>,
    stage: Option<String>,
    error: Option<String>,
    arity: Option<u64>,
    items: Option<u64>,
    instructions: Option<u64>,
}

impl Visit for EventVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let s = format!("{:?}", value);
        let s = s.trim_matches('"').to_string();
        match field.name() {
            "event" => self.event = Some(s),
            "unit" => self.unit = Some(s),
            "reason" => self.reason = Some(s),
            "closure" => self.closure = Some(s),
            "stage" => self.stage = Some(s),
            "error" => self.error = Some(s),
            _ => {}
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        match field.name() {
            "arity" => self.arity = Some(value),
            "items" => self.items = Some(value),
            "instructions" => self.instructions = Some(value),
            _ => {}
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_u64(field, value.max(0) as u64);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "event" => self.event = Some(value.to_string()),
            "unit" => self.unit = Some(value.to_string()),
            "reason" => self.reason = Some(value.to_string()),
            "error" => self.error = Some(value.to_string()),
            _ => {}
        }
    }
}

fn format_event(v: &EventVisitor, level: Level) -> String {
    let event = v.event.as_deref().unwrap_or("");

    match event {
        "compile" => format_compile(v),
        "native_install" => format_native_install(v),
        "native_skip" => format_native_skip(v),
        "native_failed" => format_native_failed(v),
        "decline" => format_decline(v),
        "fallback" => format_fallback(v),
        "stage" => format_stage(v, level),
        _ => String::new(),
    }
}

fn format_elapsed() -> String {
    format!("{:>7.3}s", elapsed_secs())
        .bright_black()
        .to_string()
}

fn unit_name(v: &EventVisitor) -> &str {
    v.unit.as_deref().unwrap_or("?")
}

fn format_compile(v: &EventVisitor) -> String {
    let instructions = v.instructions.unwrap_or(0);
    let closure = match v.closure.as_deref() {
        None | Some("None") => "bare".to_string(),
        Some(strategy) => strategy
            .trim_start_matches("Some(")
            .trim_end_matches(')')
            .to_lowercase(),
    };

    let mut output = format!(
        "{} {} {} │ arity {} │ {} instructions │ {}",
        format_elapsed(),
        "▶".bright_green().bold(),
        unit_name(v).white().bold(),
        v.arity.unwrap_or(0).bright_yellow(),
        instructions
            .to_formatted_string(&Locale::en)
            .bright_yellow(),
        closure.bright_magenta()
    );

    if let Some(items) = v.items.filter(|&n| n > 0) {
        output.push_str(&format!(" │ {} captured", items.bright_yellow()));
    }

    output
}

fn format_native_install(v: &EventVisitor) -> String {
    format!(
        "{} {} {} native │ {} instructions",
        format_elapsed(),
        "⚡".bright_cyan(),
        unit_name(v).white().bold(),
        v.instructions
            .unwrap_or(0)
            .to_formatted_string(&Locale::en)
            .bright_magenta()
            .bold()
    )
}

fn format_native_skip(v: &EventVisitor) -> String {
    format!(
        "{} {} {} stays on the VM │ {}",
        format_elapsed(),
        "·".bright_black(),
        unit_name(v).bright_black(),
        v.reason.as_deref().unwrap_or("unsupported").bright_black()
    )
}

fn format_native_failed(v: &EventVisitor) -> String {
    format!(
        "{} {} {} native lowering failed │ {}",
        format_elapsed(),
        "✗".bright_red(),
        unit_name(v).white().bold(),
        v.error.as_deref().unwrap_or("unknown error").bright_red()
    )
}

fn format_decline(v: &EventVisitor) -> String {
    format!(
        "{} {} {} declined │ {}",
        format_elapsed(),
        "■".yellow().bold(),
        unit_name(v).white().bold(),
        v.reason.as_deref().unwrap_or("unknown reason").yellow()
    )
}

fn format_fallback(v: &EventVisitor) -> String {
    format!(
        "{} {} Interpreting │ {}",
        format_elapsed(),
        "↺".bright_blue(),
        v.reason.as_deref().unwrap_or("unknown reason").yellow()
    )
}

fn format_stage(v: &EventVisitor, level: Level) -> String {
    if level != Level::TRACE {
        return String::new();
    }

    format!(
        "{} {} {} │ {}",
        format_elapsed(),
        "·".bright_black(),
        unit_name(v).bright_black(),
        v.stage.as_deref().unwrap_or("?").bright_black()
    )
}
