//! Persistent artifacts
//!
//! The surrogate builder runs once per report; everything downstream
//! (enumeration, compilation, validation) reloads the server list from a
//! JSON artifact. The encoding is deterministic — operands are hex strings,
//! maps are ordered — and must round-trip: a reloaded list produces the same
//! formulas as the one that was saved. I/O failures here are fatal, unlike
//! everything else in a run.

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::server::Server;

/// Versioned on-disk wrapper around the server list.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ServerArtifact {
    version: u16,
    servers: Vec<Server>,
}

const ARTIFACT_VERSION: u16 = 1;

/// Errors from artifact persistence. Always fatal for the step that hit them.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// Filesystem failure.
    #[error("artifact i/o failure at `{path}`: {source}")]
    Io {
        /// The path involved.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Encoding/decoding failure.
    #[error("artifact encoding failure at `{path}`: {source}")]
    Encoding {
        /// The path involved.
        path: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// The artifact's version tag is not one this build understands.
    #[error("unsupported artifact version {found} at `{path}` (expected {expected})")]
    Version {
        /// Version found in the file.
        found: u16,
        /// Version this build writes.
        expected: u16,
        /// The path involved.
        path: String,
    },
}

/// Serialize a server list to deterministic JSON text.
pub fn servers_to_json(servers: &[Server]) -> Result<String, serde_json::Error> {
    let artifact = ServerArtifact { version: ARTIFACT_VERSION, servers: servers.to_vec() };
    serde_json::to_string_pretty(&artifact)
}

/// Parse a server list from JSON text, restoring model invariants.
pub fn servers_from_json(text: &str, path: &str) -> Result<Vec<Server>, ArtifactError> {
    let artifact: ServerArtifact = serde_json::from_str(text)
        .map_err(|source| ArtifactError::Encoding { path: path.to_string(), source })?;
    if artifact.version != ARTIFACT_VERSION {
        return Err(ArtifactError::Version {
            found: artifact.version,
            expected: ARTIFACT_VERSION,
            path: path.to_string(),
        });
    }
    let mut servers = artifact.servers;
    for s in &mut servers {
        s.restore_invariants();
    }
    Ok(servers)
}

/// Write the server-list artifact.
pub fn save_servers(path: &Path, servers: &[Server]) -> Result<(), ArtifactError> {
    let text = servers_to_json(servers)
        .map_err(|source| ArtifactError::Encoding { path: path.display().to_string(), source })?;
    fs::write(path, text)
        .map_err(|source| ArtifactError::Io { path: path.display().to_string(), source })
}

/// Reload a server-list artifact.
pub fn load_servers(path: &Path) -> Result<Vec<Server>, ArtifactError> {
    let text = fs::read_to_string(path)
        .map_err(|source| ArtifactError::Io { path: path.display().to_string(), source })?;
    servers_from_json(&text, &path.display().to_string())
}

/// Write any serializable run output (summaries, candidate lists) as JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|source| ArtifactError::Encoding { path: path.display().to_string(), source })?;
    fs::write(path, text)
        .map_err(|source| ArtifactError::Io { path: path.display().to_string(), source })
}
