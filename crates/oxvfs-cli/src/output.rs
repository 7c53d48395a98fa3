use comfy_table::Table;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;

use oxvfs_core::LockMetricsSnapshot;

/// Create a styled table for output
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS);
    table
}

/// Format a byte size into a human-readable string
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b >= GB => format!("{:.1}G", b as f64 / GB as f64),
        b if b >= MB => format!("{:.1}M", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1}K", b as f64 / KB as f64),
        b => format!("{b}B"),
    }
}

/// Lock counters as printed by `--stats` (on stderr, after the command's own output).
pub fn print_metrics(snapshot: &LockMetricsSnapshot) {
    let mut table = create_table();
    table.set_header(vec!["Counter", "Value"]);
    for (name, value) in snapshot.entries() {
        table.add_row(vec![name.to_string(), value.to_string()]);
    }
    table.add_row(vec![
        "fast-path hit rate".to_string(),
        format!("{:.1}%", snapshot.fast_path_hit_rate() * 100.0),
    ]);
    eprintln!("{table}");
}
