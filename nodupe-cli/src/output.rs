use clap::ValueEnum;
use serde::Serialize;
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output for scripting
    Json,
}

impl OutputFormat {
    /// Print a result either as its human rendering or as JSON.
    pub fn print<T: Serialize>(self, value: &T, human: impl FnOnce() -> String) -> anyhow::Result<()> {
        let mut stdout = io::stdout();
        match self {
            OutputFormat::Human => writeln!(stdout, "{}", human())?,
            OutputFormat::Json => {
                serde_json::to_writer_pretty(&mut stdout, value)?;
                writeln!(stdout)?;
            }
        }
        Ok(())
    }
}
