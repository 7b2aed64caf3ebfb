use std::path::Path;

use chatrelay::auth::AllowList;
use chatrelay::config::Config;
use chatrelay::filter::Denylist;
use chatrelay::prompt::PromptShaper;
use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct CheckCommand {}

/// What a successful startup would load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub listen_addr: String,
    pub routes: usize,
    pub auth_enabled: bool,
    pub auth_keys: usize,
    pub banwords: usize,
    pub poi_entries: Option<usize>,
    pub timezone: String,
}

impl CheckCommand {
    pub async fn execute(&self, config_path: Option<&Path>, format: OutputFormat) -> CliResult<()> {
        let report = run_checks(config_path)?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "ok": true,
                    "listen_addr": report.listen_addr,
                    "routes": report.routes,
                    "auth_enabled": report.auth_enabled,
                    "auth_keys": report.auth_keys,
                    "banwords": report.banwords,
                    "poi_entries": report.poi_entries,
                    "timezone": report.timezone,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Check", "Result"]);

                table.add_row(["Listen address", report.listen_addr.as_str()]);
                table.add_row(["Routes", &report.routes.to_string()]);
                let auth = if report.auth_enabled {
                    format!("{} keys", report.auth_keys)
                } else {
                    "disabled".to_string()
                };
                table.add_row(["Auth", auth.as_str()]);
                table.add_row(["Banwords", &report.banwords.to_string()]);
                let poi = report
                    .poi_entries
                    .map(|n| format!("{n} entries"))
                    .unwrap_or_else(|| "none".to_string());
                table.add_row(["POI table", poi.as_str()]);
                table.add_row(["Time zone", report.timezone.as_str()]);

                println!("{table}\n");
                println!("Config OK");
            }
        }

        Ok(())
    }
}

/// Load and validate everything the server loads at startup
pub fn run_checks(config_path: Option<&Path>) -> CliResult<CheckReport> {
    let config = Config::load(config_path)?;
    config.validate()?;

    let auth_keys = if config.auth.enabled {
        AllowList::from_config(&config.auth)?.len()
    } else {
        0
    };
    let denylist = Denylist::from_config(&config.filter)?;
    let shaper = PromptShaper::from_config(&config.prompt)?;

    Ok(CheckReport {
        listen_addr: config.server.listen_addr.clone(),
        routes: config.routes.len(),
        auth_enabled: config.auth.enabled,
        auth_keys,
        banwords: denylist.len(),
        poi_entries: shaper.poi_table().map(|t| t.len()),
        timezone: config.prompt.timezone.clone(),
    })
}
