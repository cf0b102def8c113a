//! `tether jobs`: list registered jobs.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tether_types::trigger::TriggerSpec;

use crate::state::AppState;

/// Human-readable trigger column.
fn trigger_label(trigger: &TriggerSpec) -> String {
    match trigger {
        TriggerSpec::Event { name, .. } => format!("event:{name}"),
        TriggerSpec::Interval { seconds } => format!("every {seconds}s"),
        TriggerSpec::Invoke { .. } => "invoke".to_string(),
    }
}

pub async fn list_jobs(state: &AppState, json: bool) -> Result<()> {
    let mut jobs = state.engine.registry().list();
    jobs.sort_by(|a, b| a.id.cmp(&b.id));

    if json {
        let out: Vec<_> = jobs
            .iter()
            .map(|j| {
                serde_json::json!({
                    "id": j.id,
                    "name": j.name,
                    "version": j.version,
                    "enabled": j.enabled,
                    "trigger": j.trigger,
                    "integrations": j.integrations.ids(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!();
        println!("  No jobs registered.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Version"),
            Cell::new("Trigger"),
            Cell::new("Integrations"),
            Cell::new("Enabled"),
        ]);

    for j in &jobs {
        let enabled = if j.enabled {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(&j.id),
            Cell::new(&j.name),
            Cell::new(&j.version),
            Cell::new(trigger_label(&j.trigger)),
            Cell::new(j.integrations.ids().join(", ")),
            enabled,
        ]);
    }

    println!();
    println!("{table}");
    println!(
        "  Invoke one with: {}",
        style("tether invoke <job> --payload '{...}'").dim()
    );
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_labels() {
        assert_eq!(trigger_label(&TriggerSpec::event("auto.yield.1")), "event:auto.yield.1");
        assert_eq!(trigger_label(&TriggerSpec::interval(180)), "every 180s");
        assert_eq!(trigger_label(&TriggerSpec::invoke()), "invoke");
    }
}
