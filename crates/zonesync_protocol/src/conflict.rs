//! Field-level last-writer-wins conflict resolution.

use crate::types::LogicalTimestamp;
use crate::value::{FieldMap, FieldValue};

/// Which side of a conflicting field was kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The committed value stays.
    KeepExisting,
    /// The incoming value replaces it.
    TakeIncoming,
}

/// A field both sides wrote with different values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldConflict {
    /// Field name.
    pub field: String,
    /// Committed value and its timestamp.
    pub existing: (FieldValue, LogicalTimestamp),
    /// Incoming value and its timestamp.
    pub incoming: (FieldValue, LogicalTimestamp),
    /// Outcome.
    pub resolution: Resolution,
}

/// Result of [`merge_fields`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The merged field map.
    pub fields: FieldMap,
    /// True if `fields` differs from the existing map.
    pub changed: bool,
    /// Fields whose values disagreed.
    pub conflicts: Vec<FieldConflict>,
}

/// Merges `incoming` into `existing`, field by field.
///
/// For each field the value with the strictly greater timestamp wins. On
/// equal timestamps the existing value is kept. Fields present on only one
/// side are carried over. With no existing row pass an empty map: the result
/// is the incoming fields.
pub fn merge_fields(existing: &FieldMap, incoming: &FieldMap) -> MergeOutcome {
    let mut fields = existing.clone();
    let mut changed = false;
    let mut conflicts = Vec::new();

    for (name, theirs) in incoming {
        match fields.get_mut(name) {
            None => {
                fields.insert(name.clone(), theirs.clone());
                changed = true;
            }
            Some(ours) => {
                let take = theirs.timestamp > ours.timestamp;
                if ours.value != theirs.value {
                    conflicts.push(FieldConflict {
                        field: name.clone(),
                        existing: (ours.value.clone(), ours.timestamp),
                        incoming: (theirs.value.clone(), theirs.timestamp),
                        resolution: if take {
                            Resolution::TakeIncoming
                        } else {
                            Resolution::KeepExisting
                        },
                    });
                }
                if take {
                    *ours = theirs.clone();
                    changed = true;
                }
            }
        }
    }

    MergeOutcome {
        fields,
        changed,
        conflicts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Field;
    use proptest::prelude::*;

    fn map(entries: &[(&str, i64, u64)]) -> FieldMap {
        entries
            .iter()
            .map(|(name, v, t)| {
                (
                    (*name).to_string(),
                    Field::new(*v, LogicalTimestamp::new(*t)),
                )
            })
            .collect()
    }

    #[test]
    fn later_timestamp_wins_per_field() {
        let existing = map(&[("title", 1, 5), ("done", 0, 1)]);
        let incoming = map(&[("title", 2, 4), ("done", 1, 2)]);

        let out = merge_fields(&existing, &incoming);
        assert!(out.changed);
        assert_eq!(out.fields, map(&[("title", 1, 5), ("done", 1, 2)]));
        assert_eq!(out.conflicts.len(), 2);
        assert_eq!(out.conflicts[0].field, "done");
        assert_eq!(out.conflicts[0].resolution, Resolution::TakeIncoming);
        assert_eq!(out.conflicts[1].resolution, Resolution::KeepExisting);
    }

    #[test]
    fn tie_keeps_existing() {
        let existing = map(&[("title", 1, 3)]);
        let incoming = map(&[("title", 2, 3)]);

        let out = merge_fields(&existing, &incoming);
        assert!(!out.changed);
        assert_eq!(out.fields, existing);
        assert_eq!(out.conflicts[0].resolution, Resolution::KeepExisting);
    }

    #[test]
    fn empty_existing_takes_incoming() {
        let incoming = map(&[("a", 1, 1), ("b", 2, 1)]);
        let out = merge_fields(&FieldMap::new(), &incoming);
        assert!(out.changed);
        assert_eq!(out.fields, incoming);
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn one_sided_fields_survive() {
        let existing = map(&[("a", 1, 1)]);
        let incoming = map(&[("b", 2, 1)]);
        let out = merge_fields(&existing, &incoming);
        assert_eq!(out.fields, map(&[("a", 1, 1), ("b", 2, 1)]));
    }

    #[test]
    fn identical_input_is_unchanged() {
        let existing = map(&[("a", 1, 1)]);
        let out = merge_fields(&existing, &existing);
        assert!(!out.changed);
        assert!(out.conflicts.is_empty());
    }

    // Timestamps are unique per field across all generated maps, so no ties.
    fn field_maps(count: usize) -> impl Strategy<Value = Vec<FieldMap>> {
        let names = ["a", "b", "c", "d"];
        prop::collection::vec(
            prop::collection::vec((any::<bool>(), -3_i64..3), names.len()),
            count,
        )
        .prop_map(move |maps| {
            maps.into_iter()
                .enumerate()
                .map(|(i, entries)| {
                    entries
                        .into_iter()
                        .enumerate()
                        .filter(|(_, (present, _))| *present)
                        .map(|(j, (_, v))| {
                            let ts = ((j * 31 + i * 7) % 97) as u64 * 10 + i as u64;
                            (names[j].to_string(), Field::new(v, LogicalTimestamp::new(ts)))
                        })
                        .collect()
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn merge_is_commutative(maps in field_maps(2)) {
            let ab = merge_fields(&maps[0], &maps[1]).fields;
            let ba = merge_fields(&maps[1], &maps[0]).fields;
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn merge_is_associative(maps in field_maps(3)) {
            let left = merge_fields(&merge_fields(&maps[0], &maps[1]).fields, &maps[2]).fields;
            let right = merge_fields(&maps[0], &merge_fields(&maps[1], &maps[2]).fields).fields;
            prop_assert_eq!(left, right);
        }

        #[test]
        fn merge_is_idempotent(maps in field_maps(2)) {
            let once = merge_fields(&maps[0], &maps[1]);
            let twice = merge_fields(&once.fields, &maps[1]);
            prop_assert!(!twice.changed);
            prop_assert_eq!(once.fields, twice.fields);
        }
    }
}
