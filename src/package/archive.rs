//! Zip bundle of raw task artifacts.
//!
//! Layout:
//!
//! ```text
//! status.txt                 one line per task, selection order
//! report.json                only for `OutputFormat::Both`
//! <task_id>/<artifact>       raw bytes of each captured artifact
//! ```
//!
//! Every entry carries the same fixed timestamp so identical sessions give
//! identical bytes.

use std::fmt::Write as _;
use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{DiagError, DiagResult};
use crate::session::{Session, TaskStatus};

pub(crate) fn build(session: &Session, report_json: Option<&[u8]>) -> DiagResult<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    add_entry(&mut zip, "status.txt", status_text(session).as_bytes(), options)?;
    if let Some(json) = report_json {
        add_entry(&mut zip, "report.json", json, options)?;
    }

    for state in &session.task_states {
        let Some(output) = &state.output else {
            continue;
        };
        for artifact in &output.artifacts {
            let entry = format!("{}/{}", state.task_id, artifact.name);
            add_entry(&mut zip, &entry, &artifact.data, options)?;
        }
    }

    let cursor = zip.finish().map_err(packaging_error)?;
    Ok(cursor.into_inner())
}

fn add_entry(
    zip: &mut ZipWriter<Cursor<Vec<u8>>>,
    name: &str,
    data: &[u8],
    options: SimpleFileOptions,
) -> DiagResult<()> {
    zip.start_file(name, options).map_err(packaging_error)?;
    zip.write_all(data)?;
    Ok(())
}

fn packaging_error(e: zip::result::ZipError) -> DiagError {
    DiagError::Packaging(e.to_string())
}

/// Human-readable label for every task of the session.
pub(crate) fn status_text(session: &Session) -> String {
    let mut out = format!("Session {}: {}\n\n", session.id, session.status);
    for state in &session.task_states {
        let label = match (state.status, &state.error) {
            (TaskStatus::Failed, Some(error)) => format!("failed: {}", error),
            (status, _) => status.to_string(),
        };
        let _ = writeln!(out, "{} ({}): {}", state.task_id, state.name, label);
    }
    if let Some(failure) = &session.failure {
        let _ = writeln!(out, "\nSession error: {}", failure);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::OutputFormat;
    use crate::session::SessionStatus;
    use crate::testing::finished_session;
    use std::io::Read;

    #[test]
    fn test_archive_layout() {
        let session = finished_session(
            OutputFormat::Zip,
            &[
                ("Alpha", TaskStatus::Succeeded),
                ("Beta", TaskStatus::Failed),
                ("Gamma", TaskStatus::Cancelled),
            ],
        );
        assert_eq!(session.status, SessionStatus::Cancelled);

        let bytes = build(&session, None).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names: Vec<_> = archive.file_names().map(|n| n.to_string()).collect();
        assert!(names.contains(&"status.txt".to_string()));
        assert!(names.contains(&"alpha/alpha.txt".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("beta/") || n.starts_with("gamma/")));

        let mut status = String::new();
        archive
            .by_name("status.txt")
            .unwrap()
            .read_to_string(&mut status)
            .unwrap();
        assert!(status.contains("alpha (Alpha): succeeded"));
        assert!(status.contains("beta (Beta): failed: Beta broke"));
        assert!(status.contains("gamma (Gamma): cancelled"));
    }

    #[test]
    fn test_archive_is_deterministic() {
        let session = finished_session(OutputFormat::Both, &[("Alpha", TaskStatus::Succeeded)]);
        let first = build(&session, Some(b"{}")).unwrap();
        let second = build(&session, Some(b"{}")).unwrap();
        assert_eq!(first, second);
    }
}
