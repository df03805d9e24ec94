use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Table};
use storage::Record;

use crate::engine::EngineStats;

pub fn print_records(records: &[Record]) {
    if records.is_empty() {
        println!("(no rows)");
        return;
    }
    let width = records
        .iter()
        .map(|record| record.attrs.len())
        .max()
        .unwrap_or(0);
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    let mut header = vec![Cell::new("id")];
    header.extend((0..width).map(|index| Cell::new(format!("attr{index}"))));
    table.set_header(header);
    for record in records {
        let mut row = vec![record.id.to_string()];
        row.extend(record.attrs.iter().cloned());
        table.add_row(row);
    }
    println!("{table}");
    println!("{} row(s)", records.len());
}

pub fn print_stats(stats: &EngineStats) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["metric", "value"]);
    table.add_row(vec!["keys".to_string(), stats.key_count.to_string()]);
    table.add_row(vec!["tree height".to_string(), stats.tree_height.to_string()]);
    table.add_row(vec![
        "queries".to_string(),
        stats.query_stats.total_queries.to_string(),
    ]);
    table.add_row(vec![
        "avg access (us)".to_string(),
        format!("{:.1}", stats.query_stats.avg_access_time_us),
    ]);
    table.add_row(vec![
        "operations".to_string(),
        stats.index_health.total_operations.to_string(),
    ]);
    table.add_row(vec![
        "deletes".to_string(),
        stats.index_health.delete_operations.to_string(),
    ]);
    table.add_row(vec![
        "fragmentation".to_string(),
        format!("{:.3}", stats.index_health.fragmentation_ratio),
    ]);
    table.add_row(vec![
        "hash buckets".to_string(),
        stats.hash_buckets.to_string(),
    ]);
    table.add_row(vec![
        "hash entries".to_string(),
        stats.hash_entries.to_string(),
    ]);
    table.add_row(vec![
        "hash load factor".to_string(),
        format!("{:.3}", stats.hash_load_factor),
    ]);
    println!("{table}");
}
