//! Deterministic mapping of a [Row] to the index of the downstream partition that owns it. A
//! partitioner is stateless, the same row always lands on the same partition.

use std::hash::{DefaultHasher, Hasher};

use crate::message::Row;

pub trait Partitioner: Send + Sync {
    /// Number of target partitions this partitioner routes to.
    fn partitions(&self) -> u16;

    /// Index of the partition the row belongs to, always `< self.partitions()`.
    fn partition(&self, row: &Row) -> u16;
}

/// Routes by hashing the row payload.
#[derive(Debug, Clone)]
pub struct HashPartitioner {
    partitions: u16,
}

impl HashPartitioner {
    pub fn new(partitions: u16) -> Self {
        Self { partitions }
    }
}

impl Partitioner for HashPartitioner {
    fn partitions(&self) -> u16 {
        self.partitions
    }

    fn partition(&self, row: &Row) -> u16 {
        determine_partition(&row.payload, self.partitions)
    }
}

/// Sends every row to the same partition.
#[derive(Debug, Clone)]
pub struct ConstantPartitioner {
    target: u16,
    partitions: u16,
}

impl ConstantPartitioner {
    pub fn new(target: u16, partitions: u16) -> Self {
        Self { target, partitions }
    }
}

impl Partitioner for ConstantPartitioner {
    fn partitions(&self) -> u16 {
        self.partitions
    }

    fn partition(&self, _row: &Row) -> u16 {
        self.target
    }
}

/// Partitioner backed by a closure.
pub struct FnPartitioner<F> {
    partitions: u16,
    f: F,
}

impl<F> FnPartitioner<F>
where
    F: Fn(&Row) -> u16 + Send + Sync,
{
    pub fn new(partitions: u16, f: F) -> Self {
        Self { partitions, f }
    }
}

impl<F> Partitioner for FnPartitioner<F>
where
    F: Fn(&Row) -> u16 + Send + Sync,
{
    fn partitions(&self) -> u16 {
        self.partitions
    }

    fn partition(&self, row: &Row) -> u16 {
        (self.f)(row)
    }
}

/// determine the partition to write the row to by hashing its payload
fn determine_partition(payload: &[u8], partitions_count: u16) -> u16 {
    if partitions_count <= 1 {
        return 0;
    }
    let mut hash = DefaultHasher::new();
    hash.write(payload);
    (hash.finish() % partitions_count as u64) as u16
}
