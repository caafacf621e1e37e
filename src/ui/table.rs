use tabled::{settings::Style, Table, Tabled};

use crate::database::DbStats;

#[derive(Tabled)]
struct TableRow {
    #[tabled(rename = "Table")]
    table: String,
    #[tabled(rename = "Rows")]
    rows: i64,
}

#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Value")]
    value: String,
}

/// Row counts per stored table.
pub fn tables_table(stats: &DbStats) -> String {
    if stats.tables.is_empty() {
        return String::new();
    }
    let rows: Vec<TableRow> = stats
        .tables
        .iter()
        .map(|(table, rows)| TableRow {
            table: table.clone(),
            rows: *rows,
        })
        .collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

pub fn metrics_table(metrics: &[(&str, String)]) -> String {
    let rows: Vec<MetricRow> = metrics
        .iter()
        .map(|(metric, value)| MetricRow {
            metric: metric.to_string(),
            value: value.clone(),
        })
        .collect();
    Table::new(rows).with(Style::rounded()).to_string()
}
