#![allow(dead_code)]

use holdfast::{ColumnDef, Database, Entity, FieldType, HoldfastConfig, Record, Result, TableDef};
use std::path::Path;
use tempfile::TempDir;

pub static OWNER: TableDef = TableDef::new(
    "Owner",
    &[
        ColumnDef::id("id"),
        ColumnDef::leaf("name", FieldType::TEXT).max_length(16),
        ColumnDef::one_to_many("widgets", &WIDGET, "owner"),
        ColumnDef::mapped_one_to_one("badge", &BADGE, "holder"),
    ],
);

pub static WIDGET: TableDef = TableDef::new(
    "Widget",
    &[
        ColumnDef::id("id"),
        ColumnDef::leaf("name", FieldType::TEXT).max_length(16),
        ColumnDef::leaf("weight", FieldType::INT).not_null(),
        ColumnDef::many_to_one("owner", &OWNER),
        ColumnDef::stream("manual"),
        ColumnDef::one_to_many("parts", &PART, "widget").cascade(),
    ],
);

pub static PART: TableDef = TableDef::new(
    "Part",
    &[
        ColumnDef::id("id"),
        ColumnDef::leaf("label", FieldType::TEXT),
        ColumnDef::many_to_one("widget", &WIDGET).not_null(),
        ColumnDef::stream("drawing"),
    ],
);

pub static BADGE: TableDef = TableDef::new(
    "Badge",
    &[
        ColumnDef::id("id"),
        ColumnDef::leaf("code", FieldType::TEXT),
        ColumnDef::one_to_one("holder", &OWNER).unique(),
    ],
);

/// Points at widgets without any link back, so nothing cascades into it.
pub static REVIEW: TableDef = TableDef::new(
    "Review",
    &[
        ColumnDef::id("id"),
        ColumnDef::leaf("stars", FieldType::INT),
        ColumnDef::many_to_one("widget", &WIDGET).not_null(),
    ],
);

pub static SAMPLE: TableDef = TableDef::new(
    "Sample",
    &[
        ColumnDef::id("id"),
        ColumnDef::leaf("flag", FieldType::BOOL),
        ColumnDef::leaf("small", FieldType::INT),
        ColumnDef::leaf("big", FieldType::LONG),
        ColumnDef::leaf("ratio", FieldType::FLOAT),
        ColumnDef::leaf("precise", FieldType::DOUBLE),
        ColumnDef::leaf("label", FieldType::TEXT),
        ColumnDef::leaf("raw", FieldType::BYTES),
        ColumnDef::leaf("at", FieldType::TIMESTAMP),
        ColumnDef::leaf("tags", FieldType::Array(holdfast::ScalarType::Text)),
        ColumnDef::leaf("scores", FieldType::Array(holdfast::ScalarType::Double)),
    ],
);

pub struct Widget(Record);

impl Entity for Widget {
    fn table() -> &'static TableDef {
        &WIDGET
    }

    fn from_record(record: Record) -> Self {
        Widget(record)
    }

    fn record(&self) -> &Record {
        &self.0
    }
}

impl Widget {
    pub fn name(&self) -> Result<Option<String>> {
        self.0.get_as("name")
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        self.0.set("name", name)
    }

    pub fn weight(&self) -> Result<i32> {
        self.0.get_as("weight")
    }

    pub fn set_weight(&self, weight: i32) -> Result<()> {
        self.0.set("weight", weight)
    }
}

pub fn config() -> HoldfastConfig {
    HoldfastConfig {
        max_connections: 4,
        acquire_timeout_ms: Some(5_000),
        fetch_scale: 8,
        ..Default::default()
    }
}

pub fn open_at(root: &Path) -> Database {
    Database::open(root, config()).unwrap()
}

/// A database with the widget graph registered.
pub fn open() -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let db = open_at(dir.path());
    db.register::<Widget>().unwrap();
    (dir, db)
}

pub fn widget(db: &Database, name: &str, weight: i32) -> Record {
    let w = db.new_record("Widget").unwrap();
    w.set("name", name).unwrap();
    w.set("weight", weight).unwrap();
    w
}
