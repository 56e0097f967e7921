use pretty_assertions::assert_eq;
use proptest::prelude::*;
use setrecon_service::{GenerationRange, SetContent};
use setrecon_types::Element;
use std::collections::BTreeSet;

fn el(n: u8) -> Element {
    Element::from_bytes(vec![n])
}

fn members(content: &SetContent, generation: u32, excluded: &[GenerationRange]) -> BTreeSet<u8> {
    content
        .view(generation, excluded)
        .iter()
        .map(|(_, e)| e.data[0])
        .collect()
}

// ── Snapshots ───────────────────────────────────────────────────

#[test]
fn readers_see_their_own_generation_only() {
    let mut content = SetContent::new();
    content.add(el(1), 0, &[]);
    content.add(el(2), 1, &[]);
    assert!(content.remove(&el(1).hash(), 2, &[]));

    assert_eq!(members(&content, 0, &[]), BTreeSet::from([1]));
    assert_eq!(members(&content, 1, &[]), BTreeSet::from([1, 2]));
    assert_eq!(members(&content, 2, &[]), BTreeSet::from([2]));
    assert_eq!(content.entry_count(), 2);
}

#[test]
fn duplicate_add_and_absent_remove_change_nothing() {
    let mut content = SetContent::new();
    assert!(content.add(el(1), 0, &[]).is_some());
    assert!(content.add(el(1), 0, &[]).is_none());
    assert!(!content.remove(&el(9).hash(), 0, &[]));

    let entry = content.entry(&el(1).hash()).unwrap();
    assert_eq!(entry.mutations.len(), 1);
}

#[test]
fn forks_hide_each_others_mutations() {
    // Set X stays at generation 1; its copy Y moved to 2 and hides X's
    // later generations.
    let mut content = SetContent::new();
    content.add(el(1), 0, &[]);
    let y_excluded = [GenerationRange { start: 1, end: 2 }];

    content.add(el(2), 1, &[]);
    content.add(el(3), 2, &y_excluded);
    content.remove(&el(1).hash(), 2, &y_excluded);

    assert_eq!(members(&content, 1, &[]), BTreeSet::from([1, 2]));
    assert_eq!(members(&content, 2, &y_excluded), BTreeSet::from([3]));
}

#[test]
fn view_count_matches_iteration() {
    let mut content = SetContent::new();
    for n in 0..10 {
        content.add(el(n), 0, &[]);
    }
    for n in 0..4 {
        content.remove(&el(n).hash(), 1, &[]);
    }
    let view = content.view(1, &[]);
    assert_eq!(view.count(), 6);
    assert!(view.contains(&el(7).hash()));
    assert!(view.get(&el(2).hash()).is_none());
    assert_eq!(content.view(0, &[]).count(), 10);
}

// ── Model check ─────────────────────────────────────────────────

proptest! {
    /// Applying mutations generation by generation matches a plain set
    /// snapshotted after each generation.
    #[test]
    fn generations_match_snapshots(
        steps in prop::collection::vec(
            prop::collection::vec((0u8..16, any::<bool>()), 0..12),
            1..6,
        )
    ) {
        let mut content = SetContent::new();
        let mut model = BTreeSet::new();
        let mut snapshots = Vec::new();

        for (generation, ops) in steps.iter().enumerate() {
            let generation = generation as u32;
            for (n, add) in ops {
                if *add {
                    content.add(el(*n), generation, &[]);
                    model.insert(*n);
                } else {
                    content.remove(&el(*n).hash(), generation, &[]);
                    model.remove(n);
                }
            }
            snapshots.push(model.clone());
        }

        for (generation, expected) in snapshots.iter().enumerate() {
            prop_assert_eq!(&members(&content, generation as u32, &[]), expected);
        }
    }
}
