//! Splits a sequence set into ordered, bounded batches.

use crate::core::artifact::{ArtifactNamer, Batch, SequenceSet};
use crate::error::{Error, Result};
use crate::fasta;
use crate::plog;
use std::num::NonZeroUsize;

/// A contiguous slice of the input, with its 1-based position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<T> {
    pub index: usize,
    pub items: Vec<T>,
}

/// Partition `items` into consecutive chunks of at most `size` elements.
///
/// Every element lands in exactly one chunk and order is preserved, so
/// concatenating the chunks reproduces the input. Only the last chunk may
/// be short. An empty input yields no chunks.
pub fn chunk<T: Clone>(items: &[T], size: NonZeroUsize) -> Vec<Chunk<T>> {
    items
        .chunks(size.get())
        .enumerate()
        .map(|(i, items)| Chunk {
            index: i + 1,
            items: items.to_vec(),
        })
        .collect()
}

/// Split a FASTA sequence set into batch files named by `namer`.
///
/// # Errors
/// A zero `batch_size` is a validation error, as is malformed FASTA.
pub fn chunk_sequences(
    set: &SequenceSet,
    batch_size: usize,
    namer: &ArtifactNamer,
) -> Result<Vec<Batch>> {
    let size = NonZeroUsize::new(batch_size)
        .ok_or_else(|| Error::Validation("batch size must be positive".to_string()))?;
    let records = fasta::read(&set.path)?;
    std::fs::create_dir_all(namer.dir())?;

    let mut batches = Vec::new();
    for Chunk { index, items } in chunk(&records, size) {
        let path = namer.batch_sequences(index);
        fasta::write(&path, &items)?;
        batches.push(Batch {
            index,
            sequences: SequenceSet::new(&format!("{}.batch_{:04}", namer.label(), index), path),
            names: items.into_iter().map(|r| r.name).collect(),
        });
    }
    plog!(
        "Chunked {} sequences from {} into {} batch(es) of at most {}",
        records.len(),
        set.name,
        batches.len(),
        size
    );
    Ok(batches)
}
