//! Result packaging.
//!
//! Turns a terminal session into a deliverable:
//! - `json`: the structured [`DiagnosticReport`]
//! - `zip`: raw artifacts per task plus a `status.txt` label for every task
//! - `both`: the zip with `report.json` inside
//!
//! Packaging reads only the session's recorded state, never re-runs a task,
//! and produces identical bytes for the same session.

mod archive;
mod report;

pub use report::{ArtifactReport, ContentEncoding, DiagnosticReport, ReportSummary, TaskReport};

use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{DiagError, DiagResult};
use crate::session::Session;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Zip,
    #[default]
    Both,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Zip | Self::Both => "zip",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Zip | Self::Both => "application/zip",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "zip" => Ok(Self::Zip),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown output format '{}' (expected json, zip or both)", other)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Zip => write!(f, "zip"),
            Self::Both => write!(f, "both"),
        }
    }
}

/// A packaged session, ready to be served or written out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedOutput {
    pub format: OutputFormat,
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Bytes,
}

impl PackagedOutput {
    /// Write the bundle into `dir` under its file name.
    pub async fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(&self.file_name);
        tokio::fs::write(&path, &self.bytes).await?;
        Ok(path)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ResultPackager;

impl ResultPackager {
    pub fn new() -> Self {
        Self
    }

    /// Package a terminal session. Fails with `SessionNotTerminal` otherwise.
    pub fn package(&self, session: &Session, format: OutputFormat) -> DiagResult<PackagedOutput> {
        if !session.status.is_terminal() {
            return Err(DiagError::SessionNotTerminal {
                id: session.id,
                status: session.status,
            });
        }

        let bytes = match format {
            OutputFormat::Json => report_json(session)?,
            OutputFormat::Zip => archive::build(session, None)?,
            OutputFormat::Both => {
                let json = report_json(session)?;
                archive::build(session, Some(&json))?
            }
        };

        Ok(PackagedOutput {
            format,
            file_name: bundle_file_name(session, format),
            content_type: format.content_type(),
            bytes: Bytes::from(bytes),
        })
    }
}

pub fn bundle_file_name(session: &Session, format: OutputFormat) -> String {
    format!("hostdiag_{}.{}", session.id, format.extension())
}

fn report_json(session: &Session) -> DiagResult<Vec<u8>> {
    serde_json::to_vec_pretty(&DiagnosticReport::from_session(session))
        .map_err(|e| DiagError::Packaging(e.to_string()))
}
