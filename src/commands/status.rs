//! status 命令 - 显示状态文件中记录的任务

use crate::active_task::TaskState;
use crate::storage::StateFile;
use anyhow::Result;
use colored::Colorize;
use prettytable::{format, Cell, Row, Table};
use std::path::Path;

pub fn execute(state_file: &Path, json: bool) -> Result<()> {
    let records = StateFile::new(state_file).load()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("{}", "No active tasks".yellow());
        println!("  (state file: {})", state_file.display());
        return Ok(());
    }

    println!("{}", format!("Active tasks ({})", state_file.display().to_string().cyan()));
    println!();

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
    table.add_row(Row::new(vec![
        Cell::new("SLOT").style_spec("b"),
        Cell::new("PROJECT").style_spec("b"),
        Cell::new("TASK").style_spec("b"),
        Cell::new("STATE").style_spec("b"),
        Cell::new("CPU").style_spec("b"),
        Cell::new("CHECKPOINT").style_spec("b"),
        Cell::new("DONE").style_spec("b"),
    ]));

    for record in &records {
        table.add_row(Row::new(vec![
            Cell::new(&record.slot.to_string()),
            Cell::new(&record.project_url),
            Cell::new(&record.task_name),
            Cell::new(&colored_state(record.task_state)),
            Cell::new(&format!("{:.1}s", record.current_cpu_time)),
            Cell::new(&format!("{:.1}s", record.checkpoint_cpu_time)),
            Cell::new(&format!("{:.0}%", record.fraction_done * 100.0)),
        ]));
    }
    table.printstd();
    Ok(())
}

fn colored_state(state: TaskState) -> String {
    let text = state.as_str();
    match state {
        TaskState::Executing => text.green().to_string(),
        TaskState::Suspended | TaskState::QuitPending | TaskState::Uninitialized => {
            text.yellow().to_string()
        }
        TaskState::Exited => text.normal().to_string(),
        _ => text.red().to_string(),
    }
}
