use crate::ui::theme::{err_theme, theme};
use crate::ui::Icons;
use owo_colors::OwoColorize;
use std::time::Duration;

pub fn header(text: &str) {
    println!("{} {}", Icons::DATABASE, text.style(theme().title.clone()));
}

pub fn success(label: &str) {
    println!("{} {}", Icons::CHECK, label.style(theme().ok.clone()));
}

pub fn error(label: &str) {
    eprintln!("{} {}", Icons::CROSS, label.style(err_theme().fail.clone()));
}

pub fn warn(label: &str) {
    eprintln!("{} {}", Icons::WARN, label.style(err_theme().caution.clone()));
}

/// `label: value` line with the info marker.
pub fn info(label: &str, value: &str) {
    let t = theme();
    println!(
        "{} {}: {}",
        Icons::INFO,
        label.style(t.label.clone()),
        value.style(t.figure.clone())
    );
}

pub fn status(icon: &str, label: &str, value: &str) {
    let t = theme();
    println!("{} {}: {}", icon, label.style(t.label.clone()), value.style(t.figure.clone()));
}

pub fn section(title: &str) {
    println!();
    println!("{} {}", Icons::STATS, title.style(theme().title.clone()));
}

pub fn summary_row(label: &str, value: &str) {
    println!("  {} {}", label.style(theme().label.clone()), value.style(theme().muted.clone()));
}

pub fn timing(elapsed: Duration) {
    println!("{} took {}", Icons::CLOCK, format!("{:.2?}", elapsed).style(theme().muted.clone()));
}

/// Binary-prefixed size, one decimal above bytes.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024 + 512 * 1024), "5.5 MiB");
    }
}
