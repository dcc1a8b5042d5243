//! Conflict copy naming
//!
//! When both sides changed, the local file is set aside under
//! `<base> (conflicted copy YYYY-MM-DD HHMMSS).<ext>` before the remote
//! version is downloaded to the original name.

use chrono::{DateTime, Utc};

/// Builds the conflict-copy name for `name` at `when`.
///
/// `"report.docx"` becomes
/// `"report (conflicted copy 2026-02-07 093000).docx"`.
pub fn conflict_copy_name(name: &str, when: DateTime<Utc>) -> String {
    let stamp = when.format("%Y-%m-%d %H%M%S");
    match name.rfind('.') {
        Some(dot) if dot > 0 => {
            let (stem, ext) = name.split_at(dot);
            format!("{stem} (conflicted copy {stamp}){ext}")
        }
        _ => format!("{name} (conflicted copy {stamp})"),
    }
}

/// Like [`conflict_copy_name`] but avoids collisions with existing names.
pub fn unique_conflict_copy_name<F>(name: &str, when: DateTime<Utc>, mut exists: F) -> String
where
    F: FnMut(&str) -> bool,
{
    let candidate = conflict_copy_name(name, when);
    if !exists(&candidate) {
        return candidate;
    }

    for i in 2..=99 {
        let numbered = match candidate.rfind('.') {
            Some(dot) if dot > 0 => {
                let (stem, ext) = candidate.split_at(dot);
                format!("{stem} {i}{ext}")
            }
            _ => format!("{candidate} {i}"),
        };
        if !exists(&numbered) {
            return numbered;
        }
    }

    format!("{candidate}.{}", when.timestamp())
}
