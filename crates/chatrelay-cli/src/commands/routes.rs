use std::path::Path;

use chatrelay::config::{Config, RouteConfig};
use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

use crate::error::CliResult;
use crate::output::{OutputFormat, truncate_string, yes_no};

#[derive(Parser)]
pub struct RoutesCommand {
    #[clap(long, help = "Show full system prompts")]
    pub full: bool,
}

impl RoutesCommand {
    pub async fn execute(&self, config_path: Option<&Path>, format: OutputFormat) -> CliResult<()> {
        let config = Config::load(config_path)?;

        match format {
            OutputFormat::Json => {
                let routes: Vec<_> = config.routes.iter().map(route_json).collect();
                println!("{}", serde_json::to_string_pretty(&routes)?);
            }
            OutputFormat::Table => {
                if config.routes.is_empty() {
                    println!("No routes configured.");
                    return Ok(());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header([
                        "Path",
                        "Provider",
                        "Target",
                        "Stream",
                        "Knowledge",
                        "Profiles",
                        "Prompt",
                    ]);

                for route in &config.routes {
                    let prompt = if self.full {
                        route.prompt.clone()
                    } else {
                        truncate_string(&route.prompt, 40)
                    };
                    table.add_row([
                        route.path.as_str(),
                        route.provider.as_str(),
                        target(route),
                        yes_no(route.stream),
                        route.knowledge_id.as_deref().unwrap_or("-"),
                        &profile_names(route).join(", "),
                        prompt.as_str(),
                    ]);
                }

                println!("{table}");
                println!("\nTotal: {} routes", config.routes.len());
            }
        }

        Ok(())
    }
}

/// Model for Zhipu routes, bot id for Coze routes
fn target(route: &RouteConfig) -> &str {
    route
        .model
        .as_deref()
        .or(route.bot_id.as_deref())
        .unwrap_or("-")
}

fn profile_names(route: &RouteConfig) -> Vec<&str> {
    let mut names: Vec<&str> = route.profiles.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
}

fn route_json(route: &RouteConfig) -> serde_json::Value {
    serde_json::json!({
        "path": route.path,
        "provider": route.provider.as_str(),
        "model": route.model,
        "bot_id": route.bot_id,
        "stream": route.stream,
        "knowledge_id": route.knowledge_id,
        "time_hint": route.time_hint,
        "allow_overrides": route.allow_overrides,
        "profiles": profile_names(route),
    })
}
