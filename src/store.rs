//! Ordered in-memory tuple store.
//!
//! A multiset of defined tuples kept sorted by the total order of
//! [`crate::tuple`]. Matching retrieval walks the index in order and
//! returns the first verified match, which makes "arbitrary match"
//! deterministic and identical across replicas applying the same command
//! log. The store itself is single-owner; the replicated state machine
//! guards it with its lock.

use std::cmp::Ordering;

use crate::codec;
use crate::error::Error;
use crate::tuple::Tuple;

/// Ordered multiset of defined tuples.
#[derive(Debug, Clone, Default)]
pub struct TupleSpace {
    tuples: Vec<Tuple>,
}

impl TupleSpace {
    pub fn new() -> Self {
        TupleSpace { tuples: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Insert a tuple at its ordered position. Duplicates coexist.
    /// Tuples containing wildcards or `None` are rejected; only defined
    /// tuples may enter the index.
    pub fn write(&mut self, tuple: Tuple) -> Result<(), Error> {
        if !tuple.is_defined() {
            return Err(Error::Undefined);
        }
        let at = self
            .tuples
            .partition_point(|t| t.order(&tuple) == Ordering::Less);
        self.tuples.insert(at, tuple);
        Ok(())
    }

    /// First tuple in index order matching the query, without removal.
    pub fn read(&self, query: &Tuple) -> Option<&Tuple> {
        self.position(query).map(|i| &self.tuples[i])
    }

    /// First tuple in index order matching the query, removed from the
    /// store.
    pub fn take(&mut self, query: &Tuple) -> Option<Tuple> {
        self.position(query).map(|i| self.tuples.remove(i))
    }

    /// Iterate tuples in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Tuple> {
        self.tuples.iter()
    }

    // Full in-order scan with match verification. The wildcard-equality
    // comparator makes the region of order-equal tuples non-contiguous,
    // and float matching tolerates tuples that order strictly before the
    // query, so ordered pruning cannot be trusted here; matching must be
    // verified either way.
    fn position(&self, query: &Tuple) -> Option<usize> {
        self.tuples.iter().position(|t| t.matches(query))
    }

    /// Serialize the store as a stream of tuple encodings, each framed
    /// by a `u32` little-endian byte length.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        for tuple in &self.tuples {
            let bytes = codec::encode(tuple)?;
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    /// Rebuild a store from a [`serialize`](Self::serialize) stream.
    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        let mut tuples = Vec::new();
        let mut i = 0;
        while i < data.len() {
            let raw_len = data
                .get(i..i + 4)
                .ok_or(Error::Protocol("truncated snapshot frame".into()))?;
            let len = u32::from_le_bytes(raw_len.try_into().unwrap()) as usize;
            i += 4;
            let frame = data
                .get(i..i + len)
                .ok_or(Error::Protocol("truncated snapshot frame".into()))?;
            tuples.push(codec::decode(frame)?);
            i += len;
        }
        // the stream was written in index order; restore it verbatim
        Ok(TupleSpace { tuples })
    }
}
