use crate::metadata_store::ImageRecord;
use crate::object_store::ObjectEntry;
use std::collections::HashSet;
use tracing::debug;

/// Recompute the image record set from the live bucket listing.
///
/// Records whose storage key still exists in the listing are kept exactly
/// as they are; their ids are never regenerated. Listing keys with no
/// matching record each get a fresh record with an undetermined conversion
/// flag. Records whose key vanished from the bucket are dropped. Duplicate
/// listing keys count once, since membership is tested by key.
///
/// Output order carries no meaning; the store is keyed by id.
pub fn reconcile(listing: &[ObjectEntry], current: Vec<ImageRecord>) -> Vec<ImageRecord> {
    let live_keys: HashSet<&str> = listing.iter().map(|entry| entry.key.as_str()).collect();

    let mut records: Vec<ImageRecord> = current
        .into_iter()
        .filter(|record| live_keys.contains(record.storage_key.as_str()))
        .collect();
    let kept = records.len();

    let mut seen: HashSet<String> = records
        .iter()
        .map(|record| record.storage_key.clone())
        .collect();

    for entry in listing {
        if seen.insert(entry.key.clone()) {
            records.push(ImageRecord::new(
                entry.key.clone(),
                entry.last_modified.clone(),
            ));
        }
    }

    debug!(
        kept,
        created = records.len() - kept,
        "Reconciled image records"
    );
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_store::ConvertibleState;

    fn entry(key: &str) -> ObjectEntry {
        ObjectEntry {
            key: key.to_string(),
            last_modified: "2024/01/15 10:30:45.123".to_string(),
        }
    }

    fn record(id: &str, key: &str) -> ImageRecord {
        ImageRecord {
            id: id.to_string(),
            storage_key: key.to_string(),
            last_modified: "2024/01/01 00:00:00.000".to_string(),
            convertible: ConvertibleState::Enabled,
        }
    }

    #[test]
    fn test_kept_record_survives_unchanged_and_new_key_is_added() {
        let current = vec![record("a", "images/2024/01/f1.jpg")];
        let listing = vec![entry("images/2024/01/f1.jpg"), entry("images/2024/01/f2.jpg")];

        let result = reconcile(&listing, current);

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].id, "a");
        assert_eq!(result[0].storage_key, "images/2024/01/f1.jpg");
        assert_eq!(result[0].last_modified, "2024/01/01 00:00:00.000");
        assert_eq!(result[0].convertible, ConvertibleState::Enabled);

        assert_eq!(result[1].storage_key, "images/2024/01/f2.jpg");
        assert_eq!(result[1].convertible, ConvertibleState::Undetermined);
        assert_ne!(result[1].id, "a");
    }

    #[test]
    fn test_empty_listing_drops_every_record() {
        let current = vec![record("a", "x.jpg")];

        let result = reconcile(&[], current);

        assert!(result.is_empty());
    }

    #[test]
    fn test_empty_current_creates_a_record_per_listing_entry() {
        let listing = vec![entry("images/a.png"), entry("images/b.png")];

        let result = reconcile(&listing, Vec::new());

        assert_eq!(result.len(), 2);
        assert!(result
            .iter()
            .all(|r| r.convertible == ConvertibleState::Undetermined));
        assert_eq!(result[0].last_modified, "2024/01/15 10:30:45.123");
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let listing = vec![entry("images/a.png"), entry("images/b.png")];

        let first = reconcile(&listing, vec![record("a", "images/a.png")]);
        let second = reconcile(&listing, first.clone());

        // No bucket change between runs: same ids, same fields, nothing new.
        assert_eq!(second, first);
    }

    #[test]
    fn test_duplicate_listing_keys_count_once() {
        let listing = vec![entry("images/a.png"), entry("images/a.png")];

        let result = reconcile(&listing, Vec::new());

        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_new_records_get_distinct_ids() {
        let listing = vec![entry("images/a.png"), entry("images/b.png")];

        let result = reconcile(&listing, Vec::new());

        assert_ne!(result[0].id, result[1].id);
    }

    #[test]
    fn test_mixed_keep_add_drop() {
        let current = vec![
            record("keep", "images/keep.png"),
            record("drop", "images/gone.png"),
        ];
        let listing = vec![entry("images/keep.png"), entry("images/new.png")];

        let result = reconcile(&listing, current);

        assert_eq!(result.len(), 2);
        assert!(result.iter().any(|r| r.id == "keep"));
        assert!(!result.iter().any(|r| r.id == "drop"));
        assert!(result.iter().any(|r| r.storage_key == "images/new.png"));
    }
}
