//! # Stage-2 Estimation over the Persisted Pair Set
//!
//! The reference set for stage 2 is the R^2 pair records written by augmentation, which
//! never fit in memory together. `PairReader` walks the pairs and targets streams in
//! lockstep, one record at a time, and `predict_pair` folds each record into the same
//! Gaussian weighted mean used by stage 1.
//!
//! The kernel distance covers the two concatenated rows (2 * C values). The pseudo-label
//! fields travel with each record but are not part of the distance.

use crate::augment::ArtifactNames;
use crate::error::GrnnError;
use crate::kernel::{WeightedMean, gaussian_weight, squared_distance};
use crate::record::{PairLayout, PairRecord, TARGET_RECORD_BYTES, TargetRecord};
use crate::storage::{OpenMode, Storage, StreamHandle, read_exact};
use log::trace;

/// Sequential reader over the aligned pairs and targets streams.
pub struct PairReader {
    pairs: Box<dyn StreamHandle>,
    targets: Box<dyn StreamHandle>,
    record: PairRecord,
    record_bytes: Vec<u8>,
}

impl PairReader {
    pub fn open<S: Storage + ?Sized>(
        storage: &S,
        names: &ArtifactNames,
        layout: PairLayout,
    ) -> Result<Self, GrnnError> {
        let pairs = storage.open(&names.pairs, OpenMode::Read)?;
        let targets = match storage.open(&names.targets, OpenMode::Read) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = pairs.close();
                return Err(e.into());
            }
        };
        Ok(Self {
            pairs,
            targets,
            record: PairRecord::zeroed(layout),
            record_bytes: vec![0u8; layout.record_bytes()],
        })
    }

    /// Reads the next pair and its target. A short read on either stream is an error.
    pub fn next_pair(&mut self) -> Result<(&PairRecord, f64), GrnnError> {
        read_exact(self.pairs.as_mut(), &mut self.record_bytes)?;
        self.record.decode_from(&self.record_bytes);
        let mut target = [0u8; TARGET_RECORD_BYTES];
        read_exact(self.targets.as_mut(), &mut target)?;
        Ok((&self.record, TargetRecord::decode(target).0))
    }

    pub fn close(self) -> Result<(), GrnnError> {
        let pairs_closed = self.pairs.close();
        let targets_closed = self.targets.close();
        pairs_closed?;
        targets_closed?;
        Ok(())
    }
}

/// Kernel estimate of the residual for `query` against the first `pair_count` persisted
/// pairs. Fails without a partial result if any record cannot be read in full.
pub fn predict_pair<S: Storage + ?Sized>(
    storage: &S,
    names: &ArtifactNames,
    query: &PairRecord,
    pair_count: u64,
    sigma2: f64,
) -> Result<f64, GrnnError> {
    let mut reader = PairReader::open(storage, names, query.layout())?;
    let accumulated = accumulate(&mut reader, query, pair_count, sigma2);
    let closed = reader.close();
    let mean = accumulated?;
    closed?;

    if mean.is_floored() {
        trace!("Stage-2 weight total {:e} floored", mean.weight_sum());
    }
    Ok(mean.finish())
}

fn accumulate(
    reader: &mut PairReader,
    query: &PairRecord,
    pair_count: u64,
    sigma2: f64,
) -> Result<WeightedMean, GrnnError> {
    let mut mean = WeightedMean::new();
    for _ in 0..pair_count {
        let (record, target) = reader.next_pair()?;
        let weight = gaussian_weight(squared_distance(query.rows(), record.rows()), sigma2);
        mean.push(weight, target);
    }
    Ok(mean)
}
