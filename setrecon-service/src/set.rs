//! Client sets.

use crate::handle::ContentId;
use crate::store::{Generation, GenerationRange, SetContent};
use setrecon_sketch::{derive_ibf_key, StrataEstimator};
use setrecon_types::{ElementHash, OperationType};

/// Per-type state a set maintains alongside its content.
#[derive(Debug, Clone)]
pub enum SetState {
    /// Live strata estimator over the set's current members.
    Union(Box<StrataEstimator>),
    Intersection,
}

impl SetState {
    pub(crate) fn new(op_type: OperationType) -> Self {
        match op_type {
            OperationType::Union => Self::Union(Box::default()),
            OperationType::Intersection => Self::Intersection,
        }
    }

    pub(crate) fn on_add(&mut self, hash: &ElementHash) {
        if let Self::Union(se) = self {
            se.insert(derive_ibf_key(hash));
        }
    }

    pub(crate) fn on_remove(&mut self, hash: &ElementHash) {
        if let Self::Union(se) = self {
            se.remove(derive_ibf_key(hash));
        }
    }
}

/// An in-progress client iteration over a snapshot of the set.
#[derive(Debug)]
pub(crate) struct SetIteration {
    pub(crate) hashes: Vec<ElementHash>,
    pub(crate) position: usize,
}

/// A client handle onto a [`SetContent`].
#[derive(Debug)]
pub struct Set {
    pub(crate) content: ContentId,
    pub(crate) current_generation: Generation,
    pub(crate) excluded: Vec<GenerationRange>,
    pub(crate) op_type: OperationType,
    pub(crate) state: SetState,
    pub(crate) iteration: Option<SetIteration>,
}

impl Set {
    pub(crate) fn new(content: ContentId, op_type: OperationType) -> Self {
        Self {
            content,
            current_generation: 0,
            excluded: Vec::new(),
            op_type,
            state: SetState::new(op_type),
            iteration: None,
        }
    }

    /// Lazy copy sharing `content`. The caller advances both generations.
    pub(crate) fn lazy_copy(&self) -> Self {
        Self {
            content: self.content,
            current_generation: self.current_generation,
            excluded: self.excluded.clone(),
            op_type: self.op_type,
            state: self.state.clone(),
            iteration: None,
        }
    }

    #[must_use]
    pub fn operation_type(&self) -> OperationType {
        self.op_type
    }

    #[must_use]
    pub fn current_generation(&self) -> Generation {
        self.current_generation
    }

    #[must_use]
    pub fn excluded_generations(&self) -> &[GenerationRange] {
        &self.excluded
    }

    /// Moves this set to a fresh generation no other set has used.
    ///
    /// If another handle advanced the content in the meantime, the
    /// generations in between belong to it and are excluded here.
    pub(crate) fn advance_generation(&mut self, content: &mut SetContent) {
        let latest = content.latest_generation();
        if self.current_generation == latest {
            content.set_latest_generation(latest + 1);
            self.current_generation = latest + 1;
            return;
        }
        let range = GenerationRange {
            start: self.current_generation + 1,
            end: latest + 1,
        };
        content.set_latest_generation(range.end);
        self.current_generation = range.end;
        self.excluded.push(range);
    }
}
