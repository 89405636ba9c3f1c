//! Core data model: triples, the six index orders, and query criteria.
//!
//! A triple is three dense `u32` ids assigned by the
//! [`Dictionary`](crate::dictionary::Dictionary).  Every on-disk index keeps
//! the same triples, permuted into one of six orders so that any bound
//! prefix of (subject, predicate, object) maps to a contiguous key range.
//!
//! The **primary value** of an order is the first component of its
//! projection (e.g. the subject id for SPO): page files group triples by
//! primary value, and lookup tables are keyed by it.


use crate::encoding::{Decode, Encode, EncodingError};

/// Size in bytes of one encoded triple record (`[s:4][p:4][o:4]`, LE).
pub const TRIPLE_RECORD_SIZE: usize = 12;

// ------------------------------------------------------------------------------------------------
// Triple
// ------------------------------------------------------------------------------------------------

/// A (subject, predicate, object) tuple of interned ids.
///
/// Triples are value types: identity is the tuple itself, and duplicates
/// collapse on insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Triple {
    /// Subject id.
    pub s: u32,
    /// Predicate id.
    pub p: u32,
    /// Object id.
    pub o: u32,
}

impl Triple {
    pub fn new(s: u32, p: u32, o: u32) -> Self {
        Self { s, p, o }
    }

    /// Canonical tombstone / edge-property key, `"sId:pId:oId"`.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.s, self.p, self.o)
    }
}

impl Encode for Triple {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.s.encode_to(buf)?;
        self.p.encode_to(buf)?;
        self.o.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Triple {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (s, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (p, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (o, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { s, p, o }, offset))
    }
}

/// Decode a raw page payload into triples.
///
/// The payload must be a whole number of 12-byte records; a trailing
/// fragment is rejected so that a mis-sliced page surfaces as an error
/// rather than a silently short result.
pub fn decode_triple_records(bytes: &[u8]) -> Result<Vec<Triple>, EncodingError> {
    if bytes.len() % TRIPLE_RECORD_SIZE != 0 {
        return Err(EncodingError::Custom(format!(
            "page payload length {} is not a multiple of {TRIPLE_RECORD_SIZE}",
            bytes.len()
        )));
    }
    let mut triples = Vec::with_capacity(bytes.len() / TRIPLE_RECORD_SIZE);
    let mut offset = 0;
    while offset < bytes.len() {
        let (t, n) = Triple::decode_from(&bytes[offset..])?;
        offset += n;
        triples.push(t);
    }
    Ok(triples)
}

/// Encode triples into a raw page payload (concatenated 12-byte records).
pub fn encode_triple_records(triples: &[Triple]) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::with_capacity(triples.len() * TRIPLE_RECORD_SIZE);
    for t in triples {
        t.encode_to(&mut buf)?;
    }
    Ok(buf)
}

// ------------------------------------------------------------------------------------------------
// Orders
// ------------------------------------------------------------------------------------------------

/// The six permutations of triple component ordering.
///
/// Serializes as its upper-case name (`"SPO"`, …), matching the manifest
/// schema.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum TripleOrder {
    Spo,
    Sop,
    Pos,
    Pso,
    Osp,
    Ops,
}

impl TripleOrder {
    /// All six orders, in the fixed catalog order.
    pub const ALL: [TripleOrder; 6] = [
        TripleOrder::Spo,
        TripleOrder::Sop,
        TripleOrder::Pos,
        TripleOrder::Pso,
        TripleOrder::Osp,
        TripleOrder::Ops,
    ];

    /// Upper-case name used in the manifest and for page file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            TripleOrder::Spo => "SPO",
            TripleOrder::Sop => "SOP",
            TripleOrder::Pos => "POS",
            TripleOrder::Pso => "PSO",
            TripleOrder::Osp => "OSP",
            TripleOrder::Ops => "OPS",
        }
    }

    /// Parse a manifest order name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "SPO" => Some(TripleOrder::Spo),
            "SOP" => Some(TripleOrder::Sop),
            "POS" => Some(TripleOrder::Pos),
            "PSO" => Some(TripleOrder::Pso),
            "OSP" => Some(TripleOrder::Osp),
            "OPS" => Some(TripleOrder::Ops),
            _ => None,
        }
    }

    /// Project a triple into this order's component sequence.
    #[inline]
    pub fn project(&self, t: &Triple) -> (u32, u32, u32) {
        match self {
            TripleOrder::Spo => (t.s, t.p, t.o),
            TripleOrder::Sop => (t.s, t.o, t.p),
            TripleOrder::Pos => (t.p, t.o, t.s),
            TripleOrder::Pso => (t.p, t.s, t.o),
            TripleOrder::Osp => (t.o, t.s, t.p),
            TripleOrder::Ops => (t.o, t.p, t.s),
        }
    }

    /// The order's primary key value for a triple (first projection slot).
    #[inline]
    pub fn primary(&self, t: &Triple) -> u32 {
        self.project(t).0
    }

    /// Projection-lexicographic comparison of two triples under this order.
    #[inline]
    pub fn cmp_triples(&self, a: &Triple, b: &Triple) -> std::cmp::Ordering {
        self.project(a).cmp(&self.project(b))
    }
}

impl std::fmt::Display for TripleOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ------------------------------------------------------------------------------------------------
// Query criteria
// ------------------------------------------------------------------------------------------------

/// Id-level query criteria: each bound component must match exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TripleFilter {
    pub s: Option<u32>,
    pub p: Option<u32>,
    pub o: Option<u32>,
}

impl TripleFilter {
    pub fn new(s: Option<u32>, p: Option<u32>, o: Option<u32>) -> Self {
        Self { s, p, o }
    }

    /// True when no component is bound (full scan).
    pub fn is_empty(&self) -> bool {
        self.s.is_none() && self.p.is_none() && self.o.is_none()
    }

    #[inline]
    pub fn matches(&self, t: &Triple) -> bool {
        self.s.is_none_or(|s| s == t.s)
            && self.p.is_none_or(|p| p == t.p)
            && self.o.is_none_or(|o| o == t.o)
    }

    /// The index order whose key prefix covers the most bound components.
    ///
    /// | S | P | O | Order |
    /// |---|---|---|-------|
    /// | ✓ | ✓ | * | SPO   |
    /// | ✓ |   | ✓ | SOP   |
    /// |   | ✓ | ✓ | POS   |
    /// | ✓ |   |   | SPO   |
    /// |   | ✓ |   | POS   |
    /// |   |   | ✓ | OSP   |
    /// |   |   |   | SPO (full scan) |
    pub fn best_order(&self) -> TripleOrder {
        match (self.s.is_some(), self.p.is_some(), self.o.is_some()) {
            (true, true, _) => TripleOrder::Spo,
            (true, false, true) => TripleOrder::Sop,
            (false, true, true) => TripleOrder::Pos,
            (true, false, false) => TripleOrder::Spo,
            (false, true, false) => TripleOrder::Pos,
            (false, false, true) => TripleOrder::Osp,
            (false, false, false) => TripleOrder::Spo,
        }
    }

    /// The primary-key value under the chosen best order, if bound.
    pub fn primary_for(&self, order: TripleOrder) -> Option<u32> {
        match order {
            TripleOrder::Spo | TripleOrder::Sop => self.s,
            TripleOrder::Pos | TripleOrder::Pso => self.p,
            TripleOrder::Osp | TripleOrder::Ops => self.o,
        }
    }

    /// Bound prefix of the order's projection, longest first.
    ///
    /// Returns `(first, second)` where `second` is only meaningful when
    /// `first` is bound; used by the staging index's two-sided binary
    /// search.
    pub fn prefix_for(&self, order: TripleOrder) -> (Option<u32>, Option<u32>) {
        let (a, b) = match order {
            TripleOrder::Spo => (self.s, self.p),
            TripleOrder::Sop => (self.s, self.o),
            TripleOrder::Pos => (self.p, self.o),
            TripleOrder::Pso => (self.p, self.s),
            TripleOrder::Osp => (self.o, self.s),
            TripleOrder::Ops => (self.o, self.p),
        };
        match a {
            Some(_) => (a, b),
            None => (None, None),
        }
    }
}
