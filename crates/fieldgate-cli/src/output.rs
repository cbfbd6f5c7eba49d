use anyhow::Result;
use colored::Colorize;
use fieldgate::{AccessResult, AuthorizerState, RefreshStats};
use serde_json::json;
use tabled::builder::Builder;
use tabled::settings::Style;

use crate::cli::OutputFormat;

pub fn print_access(kind: &str, result: &AccessResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let value = json!({
                "access": kind,
                "allowed": result.allowed,
                "fields": result.fields,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Table => {
            if !result.allowed {
                println!("{} no {kind} access", "✗".red());
                return Ok(());
            }
            let mut builder = Builder::default();
            builder.push_record(["Field", "Access"]);
            for field in &result.fields {
                builder.push_record([field.as_str(), kind]);
            }
            println!("{}", builder.build().with(Style::rounded()));
        }
    }
    Ok(())
}

pub fn print_stats(
    site: &str,
    state: AuthorizerState,
    stats: &RefreshStats,
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let value = json!({
                "site": site,
                "state": state,
                "stats": stats,
            });
            println!("{}", serde_json::to_string(&value)?);
        }
        OutputFormat::Table => {
            let last_success = stats
                .last_success
                .map_or_else(|| "-".to_string(), |t| t.to_string());
            let last_error = stats.last_error.as_deref().unwrap_or("-");

            let mut builder = Builder::default();
            builder.push_record([
                "Site",
                "State",
                "Version",
                "Cycles",
                "Failed",
                "Last success",
                "Last error",
            ]);
            builder.push_record([
                site.to_string(),
                state.to_string(),
                stats.version.to_string(),
                stats.cycles.to_string(),
                stats.failed().to_string(),
                last_success,
                last_error.to_string(),
            ]);
            println!("{}", builder.build().with(Style::rounded()));
        }
    }
    Ok(())
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}
