//! Naming-conflict resolution for uploads.
//!
//! When the backend rejects a name as taken, the caller decides between
//! replacing the existing object, keeping both (the new upload takes the
//! next `name (n).ext`), or skipping the upload.

use zkd_core::types::{ConflictInfo, ConflictResolution};

// ── Disambiguation ────────────────────────────────────────────────────────────

/// Split `name` into stem and extension (including the dot).
///
/// A leading dot is part of the stem, so `.bashrc` has no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    }
}

/// Parse a trailing ` (n)` counter off a stem.
fn split_counter(stem: &str) -> (&str, Option<u64>) {
    let Some(body) = stem.strip_suffix(')') else {
        return (stem, None);
    };
    let Some(open) = body.rfind(" (") else {
        return (stem, None);
    };
    let digits = &body[open + 2..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return (stem, None);
    }
    match digits.parse::<u64>() {
        Ok(n) => (&stem[..open], Some(n)),
        Err(_) => (stem, None),
    }
}

/// Next name in the `name (n).ext` sequence.
///
/// `report.pdf` → `report (1).pdf`, `report (1).pdf` → `report (2).pdf`.
pub fn next_available_name(name: &str) -> String {
    let (stem, ext) = split_extension(name);
    match split_counter(stem) {
        (base, Some(n)) if n < u64::MAX => format!("{base} ({}){ext}", n + 1),
        _ => format!("{stem} (1){ext}"),
    }
}

// ── Resolution ────────────────────────────────────────────────────────────────

/// Trait for conflict resolution strategies.
///
/// Returning `None` leaves the conflict to the caller: the upload stops in
/// the `Conflict` state and surfaces `ZkdError::Conflict`.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &ConflictInfo) -> Option<ConflictResolution>;
}

/// Applies the same resolution to every conflict.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub ConflictResolution);

impl ConflictResolver for FixedResolver {
    fn resolve(&self, _conflict: &ConflictInfo) -> Option<ConflictResolution> {
        Some(self.0)
    }
}

impl<F> ConflictResolver for F
where
    F: Fn(&ConflictInfo) -> Option<ConflictResolution> + Send + Sync,
{
    fn resolve(&self, conflict: &ConflictInfo) -> Option<ConflictResolution> {
        self(conflict)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_duplicate() {
        assert_eq!(next_available_name("report.pdf"), "report (1).pdf");
    }

    #[test]
    fn test_existing_counter() {
        assert_eq!(next_available_name("report (1).pdf"), "report (2).pdf");
        assert_eq!(next_available_name("report (9).pdf"), "report (10).pdf");
    }

    #[test]
    fn test_no_extension() {
        assert_eq!(next_available_name("README"), "README (1)");
        assert_eq!(next_available_name("README (3)"), "README (4)");
    }

    #[test]
    fn test_dotfile() {
        assert_eq!(next_available_name(".bashrc"), ".bashrc (1)");
    }

    #[test]
    fn test_multi_dot_uses_last_extension() {
        assert_eq!(next_available_name("backup.tar.gz"), "backup.tar (1).gz");
    }

    #[test]
    fn test_non_numeric_parens_are_kept() {
        assert_eq!(next_available_name("notes (draft).txt"), "notes (draft) (1).txt");
        assert_eq!(next_available_name("x ().txt"), "x () (1).txt");
    }

    #[test]
    fn test_fixed_resolver() {
        let info = ConflictInfo {
            conflicting_name: "a.txt".into(),
            existing_object_id: "o1".into(),
            proposed_name: Some("a (1).txt".into()),
        };
        assert_eq!(
            FixedResolver(ConflictResolution::Skip).resolve(&info),
            Some(ConflictResolution::Skip)
        );
        let by_id = |c: &ConflictInfo| {
            (c.existing_object_id == "o1").then_some(ConflictResolution::Replace)
        };
        assert_eq!(by_id.resolve(&info), Some(ConflictResolution::Replace));
    }
}
