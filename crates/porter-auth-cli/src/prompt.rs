//! Line and password prompts on the controlling terminal.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};

/// Ask for a line of input. An empty answer falls back to `default`.
pub fn line(label: &str, default: Option<&str>) -> Result<String> {
    match default {
        Some(d) if !d.is_empty() => print!("{} [{}]: ", label, d),
        _ => print!("{}: ", label),
    }
    io::stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    io::stdin()
        .lock()
        .read_line(&mut input)
        .context("Failed to read from stdin")?;

    let input = input.trim();
    Ok(match default {
        Some(d) if input.is_empty() => d.to_string(),
        _ => input.to_string(),
    })
}

/// Ask for a secret without echoing it.
pub fn password(label: &str) -> Result<String> {
    rpassword::prompt_password(format!("{}: ", label)).context("Failed to read password")
}
