//! slots 命令 - 列出槽位目录及其占用情况

use crate::descriptor::DataDirLayout;
use crate::platform::process_alive;
use crate::resource::dir_size;
use crate::task_set::read_lock_pid;
use anyhow::Result;
use colored::Colorize;
use prettytable::{format, Cell, Row, Table};
use std::fs;
use std::io;

#[derive(Debug, Clone, PartialEq)]
pub struct SlotInfo {
    pub slot: u32,
    pub lock_pid: Option<u32>,
    pub alive: bool,
    pub bytes: f64,
}

/// Every numbered directory under the slots directory, lowest first.
pub fn slot_report(layout: &DataDirLayout) -> io::Result<Vec<SlotInfo>> {
    let dir = layout.slots_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut slots = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(slot) = entry.file_name().to_str().and_then(|name| name.parse().ok()) else {
            continue;
        };
        let lock_pid = read_lock_pid(&entry.path());
        slots.push(SlotInfo {
            slot,
            lock_pid,
            alive: lock_pid.map(process_alive).unwrap_or(false),
            bytes: dir_size(&entry.path()),
        });
    }
    slots.sort_by_key(|info| info.slot);
    Ok(slots)
}

pub fn execute(layout: &DataDirLayout) -> Result<()> {
    let slots = slot_report(layout)?;
    if slots.is_empty() {
        println!("{}", "No slot directories".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
    table.add_row(Row::new(vec![
        Cell::new("SLOT").style_spec("b"),
        Cell::new("PID").style_spec("b"),
        Cell::new("STATUS").style_spec("b"),
        Cell::new("SIZE").style_spec("b"),
    ]));
    for info in &slots {
        let status = if info.alive {
            "in use".green().to_string()
        } else {
            "free".normal().to_string()
        };
        let pid = info
            .lock_pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(Row::new(vec![
            Cell::new(&info.slot.to_string()),
            Cell::new(&pid),
            Cell::new(&status),
            Cell::new(&format!("{:.1} KB", info.bytes / 1024.0)),
        ]));
    }
    table.printstd();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LOCK_FILE;
    use crate::descriptor::PathLayout;

    #[test]
    fn reports_numbered_slots_only() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataDirLayout::new(dir.path());
        for slot in [2, 0] {
            fs::create_dir_all(layout.slot_dir(slot)).unwrap();
        }
        fs::create_dir_all(layout.slots_dir().join("scratch")).unwrap();
        fs::write(layout.slot_dir(2).join(LOCK_FILE), "0").unwrap();

        let slots = slot_report(&layout).unwrap();
        let numbers: Vec<u32> = slots.iter().map(|info| info.slot).collect();
        assert_eq!(numbers, vec![0, 2]);
        assert_eq!(slots[1].lock_pid, Some(0));
        assert!(!slots[1].alive);
    }

    #[test]
    fn missing_slots_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(slot_report(&DataDirLayout::new(dir.path().join("nope"))).unwrap().is_empty());
    }
}
