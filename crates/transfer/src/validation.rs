use std::path::{Component, Path};

use crate::StoreError;

/// Longest accepted session id.
const MAX_SESSION_ID_LEN: usize = 128;

/// Longest file name kept when naming artifacts.
const MAX_FILE_NAME_LEN: usize = 128;

/// Validates a session id.
///
/// Session ids double as storage namespace names, so only
/// `[A-Za-z0-9_-]` is accepted, 1 to 128 characters long.
pub fn validate_session_id(session_id: &str) -> Result<(), StoreError> {
    if session_id.is_empty() {
        return Err(StoreError::InvalidSessionId("empty session id".into()));
    }

    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(StoreError::InvalidSessionId(format!(
            "session id longer than {MAX_SESSION_ID_LEN} characters"
        )));
    }

    if let Some(bad) = session_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(StoreError::InvalidSessionId(format!(
            "unexpected character {bad:?} in {session_id:?}"
        )));
    }

    Ok(())
}

/// Validates that an artifact name is a single plain path component.
///
/// Rejects:
/// - Empty names
/// - Absolute paths
/// - Parent or current directory components
/// - Anything with more than one component
pub fn validate_artifact_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::InvalidArtifactName("empty name".into()));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir | Component::CurDir), _) => Err(
            StoreError::InvalidArtifactName(format!("directory reference not allowed: {name}")),
        ),
        (Some(Component::RootDir | Component::Prefix(_)), _) => Err(
            StoreError::InvalidArtifactName(format!("absolute path not allowed: {name}")),
        ),
        _ => Err(StoreError::InvalidArtifactName(format!(
            "nested path not allowed: {name}"
        ))),
    }
}

/// Reduces an untrusted declared file name to a safe single component.
///
/// Keeps the last path segment, replaces anything outside
/// `[A-Za-z0-9._-]` with `_`, strips leading dots and falls back to
/// `upload` when nothing usable remains.
pub fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '_') {
        return "upload".into();
    }

    // Only ASCII survives the mapping above, so byte slicing is safe.
    let keep = trimmed.len().min(MAX_FILE_NAME_LEN);
    trimmed[trimmed.len() - keep..].to_string()
}
