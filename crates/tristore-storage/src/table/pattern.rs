//! Triple patterns and their routing to an index.

use std::fmt;
use tristore_common::{ResourceComponent, ResourceId, Triple};

/// One position of a triple pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternTerm {
    Bound(ResourceId),
    /// Free position; positions sharing a variable must hold equal ids.
    Variable(u8),
}

impl PatternTerm {
    pub fn bound_value(&self) -> Option<ResourceId> {
        match self {
            PatternTerm::Bound(id) => Some(*id),
            PatternTerm::Variable(_) => None,
        }
    }
}

impl fmt::Display for PatternTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternTerm::Bound(id) => write!(f, "{}", id),
            PatternTerm::Variable(variable) => write!(f, "?{}", variable),
        }
    }
}

/// Which positions of a pattern are bound, in S, P, O order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryShape {
    /// `***`
    Unbound,
    /// `s**`
    S,
    /// `*p*`
    P,
    /// `sp*`
    SP,
    /// `**o`
    O,
    /// `s*o`
    SO,
    /// `*po`
    PO,
    /// `spo`
    SPO,
}

/// Subject, predicate and object terms of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriplePattern {
    pub terms: [PatternTerm; 3],
}

impl TriplePattern {
    pub fn new(s: PatternTerm, p: PatternTerm, o: PatternTerm) -> Self {
        Self { terms: [s, p, o] }
    }

    /// Pattern matching exactly one triple.
    pub fn from_triple(triple: &Triple) -> Self {
        Self::new(
            PatternTerm::Bound(triple[0]),
            PatternTerm::Bound(triple[1]),
            PatternTerm::Bound(triple[2]),
        )
    }

    /// Pattern with three distinct variables.
    pub fn all() -> Self {
        Self::new(
            PatternTerm::Variable(0),
            PatternTerm::Variable(1),
            PatternTerm::Variable(2),
        )
    }

    pub fn term(&self, component: ResourceComponent) -> PatternTerm {
        self.terms[component.index()]
    }

    pub fn is_bound(&self, component: ResourceComponent) -> bool {
        self.term(component).bound_value().is_some()
    }

    pub fn shape(&self) -> QueryShape {
        use ResourceComponent::{O, P, S};
        match (self.is_bound(S), self.is_bound(P), self.is_bound(O)) {
            (false, false, false) => QueryShape::Unbound,
            (true, false, false) => QueryShape::S,
            (false, true, false) => QueryShape::P,
            (true, true, false) => QueryShape::SP,
            (false, false, true) => QueryShape::O,
            (true, false, true) => QueryShape::SO,
            (false, true, true) => QueryShape::PO,
            (true, true, true) => QueryShape::SPO,
        }
    }

    /// Bound values with `ResourceId::INVALID` in free positions; the form
    /// index lookups take.
    pub fn key(&self) -> Triple {
        self.terms
            .map(|term| term.bound_value().unwrap_or(ResourceId::INVALID))
    }

    /// Returns true if `triple` agrees with every bound position and with
    /// every repeated variable.
    pub fn matches(&self, triple: &Triple) -> bool {
        for (position, term) in self.terms.iter().enumerate() {
            match term {
                PatternTerm::Bound(id) => {
                    if triple[position] != *id {
                        return false;
                    }
                }
                PatternTerm::Variable(variable) => {
                    for later in position + 1..3 {
                        if self.terms[later] == PatternTerm::Variable(*variable)
                            && triple[later] != triple[position]
                        {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }
}

impl fmt::Display for TriplePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.terms[0], self.terms[1], self.terms[2])
    }
}
