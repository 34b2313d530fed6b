//! Vehicle Signal Specification importer.
//!
//! Line-oriented text: `#` starts a comment, the first non-comment line
//! carrying exactly one token is the version string, and every other line is
//! `NAME SIGNAL_ID [PRIVATE_ID]`. Each signal line becomes one definition in
//! [`VSS_DOMAIN`](crate::types::VSS_DOMAIN). Ragged lines are logged and
//! skipped rather than failing the import.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use vsi_shm::Shm;

use crate::error::Error;
use crate::index;
use crate::types::VSS_DOMAIN;

/// Outcome of an import run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Version string from the file, if present.
    pub version: Option<String>,
    /// Signals defined.
    pub defined: usize,
    /// Malformed lines skipped.
    pub skipped: usize,
}

/// Errors that abort an import.
#[derive(Debug)]
pub enum ImportError {
    Io(io::Error),
    /// A well-formed line failed to define (for example, out of shared
    /// memory or a name collision).
    Define {
        line: usize,
        name: String,
        source: Error,
    },
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Define { line, name, source } => {
                write!(f, "line {}: defining {:?} failed: {}", line, name, source)
            }
        }
    }
}

impl std::error::Error for ImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Define { source, .. } => Some(source),
        }
    }
}

pub(crate) fn import(shm: &Shm, path: &Path) -> Result<ImportSummary, ImportError> {
    let file = File::open(path).map_err(ImportError::Io)?;
    let reader = BufReader::new(file);

    let mut summary = ImportSummary::default();
    for (idx, line) in reader.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.map_err(ImportError::Io)?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if summary.version.is_none() && tokens.len() == 1 {
            summary.version = Some(tokens[0].to_string());
            continue;
        }

        if tokens.len() < 2 || tokens.len() > 3 {
            tracing::warn!(line = lineno, "malformed VSS line, skipping");
            summary.skipped += 1;
            continue;
        }
        let name = tokens[0];
        let Ok(signal) = tokens[1].parse::<u32>() else {
            tracing::warn!(line = lineno, token = tokens[1], "bad signal id, skipping");
            summary.skipped += 1;
            continue;
        };
        let private_id = match tokens.get(2) {
            None => 0,
            Some(t) => match t.parse::<u32>() {
                Ok(p) => p,
                Err(_) => {
                    tracing::warn!(line = lineno, token = *t, "bad private id, skipping");
                    summary.skipped += 1;
                    continue;
                }
            },
        };

        index::define(shm, VSS_DOMAIN, signal, private_id, Some(name)).map_err(|source| {
            ImportError::Define {
                line: lineno,
                name: name.to_string(),
                source,
            }
        })?;
        summary.defined += 1;
    }

    tracing::debug!(
        defined = summary.defined,
        skipped = summary.skipped,
        version = summary.version.as_deref().unwrap_or("-"),
        "VSS import complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsi_shm::ShmConfig;

    fn test_shm(tag: &str) -> (Shm, ShmConfig) {
        let dir = std::env::temp_dir();
        let cfg = ShmConfig {
            user_path: dir.join(format!("vsi_vss_user_{}_{}", tag, std::process::id())),
            sys_path: dir.join(format!("vsi_vss_sys_{}_{}", tag, std::process::id())),
            user_len: 512 * 1024,
            sys_len: 256 * 1024,
        };
        (Shm::create(&cfg).unwrap(), cfg)
    }

    fn cleanup(cfg: &ShmConfig) {
        std::fs::remove_file(&cfg.user_path).ok();
        std::fs::remove_file(&cfg.sys_path).ok();
    }

    #[test]
    fn parses_comments_version_and_signals() {
        let (shm, cfg) = test_shm("parse");
        let path = std::env::temp_dir().join(format!("vsi_vss_file_{}", std::process::id()));
        std::fs::write(
            &path,
            "# demo VSS file\n\
             VSS_1.0\n\
             Vehicle.Speed 5\n\
             Vehicle.Engine.RPM 6 600\n\
             this line is not a signal at all\n\
             Vehicle.Brake notanumber\n",
        )
        .unwrap();

        let summary = import(&shm, &path).unwrap();
        assert_eq!(summary.version.as_deref(), Some("VSS_1.0"));
        assert_eq!(summary.defined, 2);
        assert_eq!(summary.skipped, 2);

        assert_eq!(index::name_to_id(&shm, VSS_DOMAIN, "Vehicle.Speed"), Ok(5));
        assert_eq!(
            index::name_to_id(&shm, VSS_DOMAIN, "Vehicle.Engine.RPM"),
            Ok(6)
        );
        assert_eq!(index::private_to_id(&shm, 600), Ok((VSS_DOMAIN, 6)));
        assert_eq!(
            index::id_to_name(&shm, VSS_DOMAIN, 5).as_deref(),
            Ok("Vehicle.Speed")
        );

        std::fs::remove_file(&path).ok();
        cleanup(&cfg);
    }
}
