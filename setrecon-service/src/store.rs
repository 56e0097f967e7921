//! Generational element store.
//!
//! A [`SetContent`] is shared by a set and all of its lazy copies. Every
//! add or remove is recorded as a mutation tagged with the mutating set's
//! generation instead of being applied in place. A reader at generation `G`
//! that hides a list of excluded ranges replays the mutations it can see, so
//! running operations keep a stable snapshot and copies never see each
//! other's changes.

use crate::handle::SetId;
use setrecon_types::{Element, ElementHash};
use std::collections::HashMap;

/// Generation counter of a set.
pub type Generation = u32;

/// Half-open range `[start, end)` of generations hidden from a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationRange {
    pub start: Generation,
    pub end: Generation,
}

impl GenerationRange {
    #[must_use]
    pub fn contains(&self, generation: Generation) -> bool {
        self.start <= generation && generation < self.end
    }
}

fn is_excluded(generation: Generation, excluded: &[GenerationRange]) -> bool {
    excluded.iter().any(|r| r.contains(generation))
}

/// One add or remove, in the generation it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationEvent {
    pub generation: Generation,
    pub added: bool,
}

/// An element with its mutation history.
#[derive(Debug, Clone)]
pub struct ElementEntry {
    pub element: Element,
    /// Unsorted across forks. Empty means present in every generation.
    pub mutations: Vec<MutationEvent>,
}

impl ElementEntry {
    /// Membership at `generation`, ignoring mutations from excluded
    /// generations.
    #[must_use]
    pub fn is_member(&self, generation: Generation, excluded: &[GenerationRange]) -> bool {
        if self.mutations.is_empty() {
            return true;
        }
        if is_excluded(generation, excluded) {
            return false;
        }
        let mut present = false;
        for m in &self.mutations {
            if m.generation > generation || is_excluded(m.generation, excluded) {
                continue;
            }
            present = m.added;
        }
        present
    }
}

/// A client mutation deferred while the content is being iterated.
#[derive(Debug, Clone)]
pub(crate) struct PendingMutation {
    pub(crate) set: SetId,
    pub(crate) element: Element,
    pub(crate) added: bool,
}

/// Shared backing store of a set and its lazy copies.
#[derive(Debug, Default)]
pub struct SetContent {
    elements: HashMap<ElementHash, ElementEntry>,
    latest_generation: Generation,
    pub(crate) pending: Vec<PendingMutation>,
    pub(crate) iterator_count: u32,
    pub(crate) owners: u32,
}

impl SetContent {
    /// Empty content owned by one set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            owners: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn latest_generation(&self) -> Generation {
        self.latest_generation
    }

    pub(crate) fn set_latest_generation(&mut self, generation: Generation) {
        self.latest_generation = generation;
    }

    /// Number of distinct elements ever stored, in any generation.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn entry(&self, hash: &ElementHash) -> Option<&ElementEntry> {
        self.elements.get(hash)
    }

    /// Records an add. Returns the element hash if membership changed.
    pub fn add(
        &mut self,
        element: Element,
        generation: Generation,
        excluded: &[GenerationRange],
    ) -> Option<ElementHash> {
        let hash = element.hash();
        let entry = self.elements.entry(hash).or_insert_with(|| ElementEntry {
            element,
            mutations: Vec::new(),
        });
        if !entry.mutations.is_empty() && entry.is_member(generation, excluded) {
            return None;
        }
        entry.mutations.push(MutationEvent {
            generation,
            added: true,
        });
        Some(hash)
    }

    /// Records a remove. Returns true if membership changed.
    pub fn remove(
        &mut self,
        hash: &ElementHash,
        generation: Generation,
        excluded: &[GenerationRange],
    ) -> bool {
        let Some(entry) = self.elements.get_mut(hash) else {
            return false;
        };
        if !entry.is_member(generation, excluded) {
            return false;
        }
        entry.mutations.push(MutationEvent {
            generation,
            added: false,
        });
        true
    }

    /// Read-only snapshot at a generation.
    #[must_use]
    pub fn view<'a>(&'a self, generation: Generation, excluded: &'a [GenerationRange]) -> SetView<'a> {
        SetView {
            content: self,
            generation,
            excluded,
        }
    }
}

/// Membership of a content as seen by one set at one generation.
#[derive(Debug, Clone, Copy)]
pub struct SetView<'a> {
    content: &'a SetContent,
    generation: Generation,
    excluded: &'a [GenerationRange],
}

impl<'a> SetView<'a> {
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[must_use]
    pub fn contains(&self, hash: &ElementHash) -> bool {
        self.get(hash).is_some()
    }

    /// The element with this hash, if it is a member.
    #[must_use]
    pub fn get(&self, hash: &ElementHash) -> Option<&'a Element> {
        self.content
            .elements
            .get(hash)
            .filter(|e| e.is_member(self.generation, self.excluded))
            .map(|e| &e.element)
    }

    /// Members with their hashes, in no particular order.
    pub fn iter(self) -> impl Iterator<Item = (&'a ElementHash, &'a Element)> + 'a {
        let generation = self.generation;
        let excluded = self.excluded;
        self.content
            .elements
            .iter()
            .filter(move |(_, e)| e.is_member(generation, excluded))
            .map(|(h, e)| (h, &e.element))
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.iter().count() as u64
    }
}
