use chrono::{DateTime, Utc};
use tracing_subscriber::{EnvFilter, fmt};

pub fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}

pub fn format_timestamp(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "n/a".to_string(),
    }
}

pub fn format_range(first: Option<DateTime<Utc>>, last: Option<DateTime<Utc>>) -> String {
    match (first, last) {
        (Some(a), Some(b)) if a == b => format_timestamp(Some(a)),
        (Some(_), Some(_)) => format!("{} .. {}", format_timestamp(first), format_timestamp(last)),
        _ => format_timestamp(first.or(last)),
    }
}

/// Shorten to at most `max_chars` characters, ending in "..." when cut.
pub fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    if max_chars <= 3 {
        return input.chars().take(max_chars).collect();
    }
    let head: String = input.chars().take(max_chars - 3).collect();
    format!("{head}...")
}

/// First line of a message, for single-line listings.
pub fn one_line(input: &str, max_chars: usize) -> String {
    let first = input.lines().next().unwrap_or_default().trim();
    truncate(first, max_chars)
}
