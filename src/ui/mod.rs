//! Terminal output for the `holdfast` binary

pub mod icons;
pub mod output;
pub mod spinner;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{error, header, human_bytes, info, section, status, success, summary_row, timing, warn};
pub use spinner::Spinner;
pub use table::{metrics_table, tables_table};
pub use theme::{err_theme, theme, Theme};
