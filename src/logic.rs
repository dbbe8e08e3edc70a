//! Logic kernel: boolean terms, conjunctions and disjunctions in DNF.
//!
//! Terms are `(id, polarity)` pairs referring to interned condition
//! terms. Sets are ordered so that serialised output is canonical: two
//! equal formulas always print the same way, and simplification is a
//! deterministic function of its input.

use std::collections::BTreeSet;

/// Identifier of an interned condition term.
pub type TermId = u32;

/// A single literal: a condition term taken positively or negated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Term {
    pub id: TermId,
    pub positive: bool,
}

impl Term {
    pub fn positive(id: TermId) -> Self {
        Term { id, positive: true }
    }

    pub fn negative(id: TermId) -> Self {
        Term {
            id,
            positive: false,
        }
    }

    pub fn negated(self) -> Self {
        Term {
            id: self.id,
            positive: !self.positive,
        }
    }
}

/// An unordered set of terms, denoting their conjunction. The empty
/// conjunction is `true`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Conjunction(BTreeSet<Term>);

impl Conjunction {
    pub fn new() -> Self {
        Conjunction(BTreeSet::new())
    }

    pub fn insert(&mut self, term: Term) {
        self.0.insert(term);
    }

    pub fn with(mut self, term: Term) -> Self {
        self.insert(term);
        self
    }

    pub fn is_true(&self) -> bool {
        self.0.is_empty()
    }

    pub fn terms(&self) -> impl Iterator<Item = &Term> {
        self.0.iter()
    }

    /// A conjunction containing both a term and its negation denotes
    /// `false` and can be dropped from any disjunction.
    pub fn is_contradiction(&self) -> bool {
        self.0
            .iter()
            .any(|t| t.positive && self.0.contains(&t.negated()))
    }

    /// Set containment: `self ⊆ other`. When it holds, `other` is at
    /// least as strict and `self ∨ other = self`.
    pub fn subsumes(&self, other: &Conjunction) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Term> for Conjunction {
    fn from_iter<I: IntoIterator<Item = Term>>(iter: I) -> Self {
        Conjunction(iter.into_iter().collect())
    }
}

/// An unordered set of conjunctions, denoting their disjunction (DNF).
/// The empty disjunction is `false`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Disjunction(BTreeSet<Conjunction>);

impl Disjunction {
    pub fn new() -> Self {
        Disjunction(BTreeSet::new())
    }

    pub fn insert(&mut self, conjunction: Conjunction) {
        self.0.insert(conjunction);
    }

    pub fn union(&mut self, other: &Disjunction) {
        for c in &other.0 {
            self.0.insert(c.clone());
        }
    }

    pub fn is_false(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the disjunction contains the empty conjunction and is
    /// therefore trivially `true`.
    pub fn is_trivially_true(&self) -> bool {
        self.0.iter().any(Conjunction::is_true)
    }

    pub fn conjunctions(&self) -> impl Iterator<Item = &Conjunction> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ids of every term referenced by this disjunction.
    pub fn referenced_terms(&self) -> BTreeSet<TermId> {
        self.0
            .iter()
            .flat_map(|c| c.terms().map(|t| t.id))
            .collect()
    }
}

impl FromIterator<Conjunction> for Disjunction {
    fn from_iter<I: IntoIterator<Item = Conjunction>>(iter: I) -> Self {
        Disjunction(iter.into_iter().collect())
    }
}

/// Simplify a DNF formula: drop contradictory conjunctions, then drop
/// every conjunction strictly subsumed by a weaker one. Idempotent and
/// monotone; the result only ever loses redundant conjunctions.
pub fn simplify(d: &Disjunction) -> Disjunction {
    let live: Vec<&Conjunction> = d
        .0
        .iter()
        .filter(|c| !c.is_contradiction())
        .collect();

    let mut kept = Disjunction::new();
    for c in &live {
        let absorbed = live
            .iter()
            .any(|other| other.subsumes(c) && !c.subsumes(other));
        if !absorbed {
            kept.insert((*c).clone());
        }
    }
    kept
}
