use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::completion::AgentOutcome;

const SEPARATOR: &str = "----------------------------------------";

#[derive(Error, Debug)]
#[error("could not write report '{path}': {source}")]
pub struct ReportError {
    path: String,
    #[source]
    source: std::io::Error,
}

/// Appends one section per analyzed file; earlier runs are kept.
pub struct ReportWriter {
    path: PathBuf,
}

impl ReportWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(
        &self,
        source_file: &str,
        results: &[(String, AgentOutcome)],
    ) -> Result<(), ReportError> {
        let section = render_section(source_file, results);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.error(source))?;
        file.write_all(section.as_bytes())
            .map_err(|source| self.error(source))?;

        info!(path = %self.path.display(), agents = results.len(), "report written");
        Ok(())
    }

    fn error(&self, source: std::io::Error) -> ReportError {
        ReportError {
            path: self.path.display().to_string(),
            source,
        }
    }
}

pub fn render_section(source_file: &str, results: &[(String, AgentOutcome)]) -> String {
    let mut out = String::new();
    let _ = write!(out, "\nAnalysis Report for {}:\n", source_file);
    for (name, outcome) in results {
        let text = match outcome {
            AgentOutcome::Completed(text) => text.clone(),
            AgentOutcome::Failed(reason) => format!("Error: Analysis failed ({})", reason),
        };
        let _ = write!(out, "\n{} Report:\n{}\n", name, text);
    }
    let _ = write!(out, "\n{}\n", SEPARATOR);
    out
}
