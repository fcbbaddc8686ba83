use colored::Colorize;
use serde::Serialize;

pub fn header(title: &str) {
    println!("{}", title.bold().underline());
}

pub fn subheader(title: &str) {
    println!("{}", title.bold());
}

pub fn hint(msg: &str) {
    println!("{} {}", "hint:".cyan().bold(), msg.dimmed());
}

pub fn info(msg: &str) {
    eprintln!("{} {}", "info:".blue().bold(), msg);
}

pub fn warn(msg: &str) {
    eprintln!("{} {}", "warning:".yellow().bold(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {}", "error:".red().bold(), msg);
}

pub fn success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Aligned `label: value` line.
pub fn field(label: &str, value: impl std::fmt::Display) {
    println!("  {:<16} {}", format!("{label}:"), value.to_string().cyan());
}

/// Pretty JSON on stdout.
pub fn json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn status_color(status: &str) -> colored::ColoredString {
    match status {
        "active" => status.green(),
        "archived" => status.yellow(),
        _ => status.red()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printers_do_not_panic() {
        header("Header");
        subheader("Subheader");
        hint("hint");
        info("info");
        warn("warning");
        error("error");
        success("success");
        field("label", 42);
    }

    #[test]
    fn test_json_prints_serializable() {
        json(&serde_json::json!({"a": 1})).unwrap();
    }

    #[test]
    fn test_status_color_keeps_text() {
        assert!(status_color("active").to_string().contains("active"));
        assert!(status_color("corrupted").to_string().contains("corrupted"));
    }
}
