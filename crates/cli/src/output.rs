//! Output formatting for CLI

use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};

use utf_harness::lifecycle::{ModuleResult, TestRecord};
use utf_harness::{RunSummary, TestStatus};

/// Print per-module results, warnings and the summary table
pub fn print_summary(summary: &RunSummary, show_time: bool) {
    for module in &summary.modules {
        print_module(module, show_time);
    }

    for warning in &summary.warnings {
        print_warning(&format!("Skipped {}: {}", warning.path.display(), warning.reason));
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "Modules", "Tests", "Passed", "Failed", "Not run", "Aborted", "Module failures", "Time",
    ]);
    table.add_row(vec![
        summary.modules.len().to_string(),
        summary.total.to_string(),
        summary.passed.to_string(),
        summary.failed.to_string(),
        summary.not_run.to_string(),
        summary.aborted_modules.to_string(),
        summary.module_failures.to_string(),
        format!("{:.2}s", summary.duration_ms as f64 / 1000.0),
    ]);
    println!();
    println!("{table}");

    if summary.success() {
        print_success("All tests passed");
    } else {
        print_error("Some tests failed");
    }
}

fn print_module(module: &ModuleResult, show_time: bool) {
    println!();
    println!("{} {}", "Testing module:".bold(), module.module.bold());

    if let Some(reason) = &module.abort_reason {
        println!("  {} {}", "[ ABORTED ]".red().bold(), reason);
    }

    for record in &module.tests {
        print_test(record, show_time);
    }

    for failure in &module.failures {
        println!("  {} {}", "[ MODULE FAILURE ]".red().bold(), failure);
    }
}

fn print_test(record: &TestRecord, show_time: bool) {
    let label = match &record.status {
        TestStatus::Passed => "[ PASS ]".green(),
        TestStatus::Failed { .. } => "[ FAIL ]".red(),
        TestStatus::NotRun { .. } => "[ SKIP ]".yellow(),
    };
    let time = if show_time {
        format!(" {}", format!("({} ms)", record.duration_ms).dimmed())
    } else {
        String::new()
    };
    println!("  {:<50} {}{}", record.file.file_name(), label, time);

    if let TestStatus::Failed { reason } = &record.status {
        for line in reason.lines() {
            println!("      {}", line.dimmed());
        }
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}
