// ========================================================================================
//
//                            PAIR AUGMENTATION
//
// ========================================================================================
//
// ### Purpose ###
//
// Stage 2 learns from every ordered pair of training rows. For R rows that is R^2
// examples, which does not fit in device RAM for any useful R, so the pairs are written
// straight to storage as they are generated. Only one pair record and its encoded bytes
// are ever held in memory, so the footprint is O(C) regardless of R.
//
// Ordinal k = i * R + j addresses the same pair in both streams. Self-pairs (i == j) are
// written like any other pair and always carry a zero residual.

use crate::data::TrainingMatrix;
use crate::error::GrnnError;
use crate::record::{F64_BYTES, PairLayout, PairRecord, TargetRecord};
use crate::storage::{OpenMode, Storage, StreamHandle, write_exact};
use itertools::iproduct;
use log::{debug, info};
use ndarray::ArrayView1;

pub const PAIRS_SUFFIX: &str = "_pairs.bin";
pub const TARGETS_SUFFIX: &str = "_targets.bin";

/// Stream names of the persisted training artifacts for one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    pub pairs: String,
    pub targets: String,
}

impl ArtifactNames {
    /// Derives the artifact names by appending fixed suffixes to the full dataset
    /// identifier, extension included, so `data/hardness.csv` maps to
    /// `data/hardness.csv_pairs.bin` and `data/hardness.csv_targets.bin`. Datasets that
    /// differ only in their extension never share artifacts.
    pub fn for_dataset(dataset_id: &str) -> Self {
        Self {
            pairs: format!("{dataset_id}{PAIRS_SUFFIX}"),
            targets: format!("{dataset_id}{TARGETS_SUFFIX}"),
        }
    }
}

/// What a completed augmentation wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AugmentReport {
    pub pair_count: u64,
    pub pairs_bytes: u64,
    pub targets_bytes: u64,
}

/// Writes every ordered pair of `matrix` rows to the pairs stream and the residuals to
/// the targets stream, replacing whatever the streams held before.
///
/// Any failed or short write aborts the run. Both streams are closed either way; partial
/// output is left as is and must not be used.
pub fn augment<S: Storage + ?Sized>(
    storage: &S,
    names: &ArtifactNames,
    matrix: &TrainingMatrix,
    pseudo_labels: ArrayView1<f64>,
) -> Result<AugmentReport, GrnnError> {
    debug_assert_eq!(pseudo_labels.len(), matrix.nrows());
    let rows = matrix.nrows();
    info!(
        "Augmenting {rows} rows into {} pairs ('{}', '{}')",
        rows * rows,
        names.pairs,
        names.targets
    );

    let mut pairs = storage.open(&names.pairs, OpenMode::Write)?;
    let mut targets = match storage.open(&names.targets, OpenMode::Write) {
        Ok(handle) => handle,
        Err(e) => {
            let _ = pairs.close();
            return Err(e.into());
        }
    };

    let written = write_pairs(pairs.as_mut(), targets.as_mut(), matrix, pseudo_labels);
    let pairs_closed = pairs.close();
    let targets_closed = targets.close();
    let report = written?;
    pairs_closed?;
    targets_closed?;

    debug!(
        "Augmentation wrote {} bytes of pairs and {} bytes of targets",
        report.pairs_bytes, report.targets_bytes
    );
    Ok(report)
}

fn write_pairs(
    pairs: &mut dyn StreamHandle,
    targets: &mut dyn StreamHandle,
    matrix: &TrainingMatrix,
    pseudo_labels: ArrayView1<f64>,
) -> Result<AugmentReport, GrnnError> {
    let rows = matrix.nrows();
    let layout = PairLayout::new(matrix.ncols());
    let mut record = PairRecord::zeroed(layout);
    let mut bytes = vec![0u8; layout.record_bytes()];
    let mut pair_count = 0u64;

    for (i, j) in iproduct!(0..rows, 0..rows) {
        record.fill(matrix.row(i), matrix.row(j), pseudo_labels[i], pseudo_labels[j]);
        record.encode_into(&mut bytes);
        write_exact(pairs, &bytes)?;
        write_exact(targets, &TargetRecord(record.residual()).encode())?;
        pair_count += 1;
    }

    Ok(AugmentReport {
        pair_count,
        pairs_bytes: pair_count * layout.record_bytes() as u64,
        targets_bytes: pair_count * F64_BYTES as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, StorageError};
    use ndarray::array;

    #[test]
    fn artifact_names_keep_the_full_dataset_identifier() {
        let names = ArtifactNames::for_dataset("0:/Hardness.csv");
        assert_eq!(names.pairs, "0:/Hardness.csv_pairs.bin");
        assert_eq!(names.targets, "0:/Hardness.csv_targets.bin");

        let names = ArtifactNames::for_dataset("plain");
        assert_eq!(names.pairs, "plain_pairs.bin");

        assert_ne!(
            ArtifactNames::for_dataset("x.csv"),
            ArtifactNames::for_dataset("x.tsv")
        );
    }

    #[test]
    fn writes_r_squared_records_in_row_major_order() {
        let storage = MemoryStorage::new();
        let names = ArtifactNames::for_dataset("t.csv");
        let matrix =
            TrainingMatrix::from_rows(&[vec![1.0, 10.0], vec![2.0, 20.0], vec![3.0, 30.0]]).unwrap();
        let pseudo = array![11.0, 20.0, 29.0];

        let report = augment(&storage, &names, &matrix, pseudo.view()).unwrap();
        assert_eq!(report.pair_count, 9);

        let pairs = storage.contents(&names.pairs).unwrap();
        let targets = storage.contents(&names.targets).unwrap();
        assert_eq!(pairs.len() as u64, report.pairs_bytes);
        assert_eq!(pairs.len(), 9 * 6 * F64_BYTES);
        assert_eq!(targets.len(), 9 * F64_BYTES);

        // ordinal 1 * 3 + 2 is the pair (row 1, row 2)
        let layout = PairLayout::new(2);
        let k = 5;
        let mut record = PairRecord::zeroed(layout);
        record.decode_from(&pairs[k * layout.record_bytes()..(k + 1) * layout.record_bytes()]);
        assert_eq!(record.values(), &[2.0, 20.0, 3.0, 30.0, 20.0, 29.0]);

        let mut z = [0u8; F64_BYTES];
        z.copy_from_slice(&targets[k * F64_BYTES..(k + 1) * F64_BYTES]);
        assert_eq!(TargetRecord::decode(z).0, -9.0);
    }

    #[test]
    fn short_write_aborts_with_storage_error() {
        let storage = MemoryStorage::new().with_write_quota(100);
        let names = ArtifactNames::for_dataset("t.csv");
        let matrix = TrainingMatrix::from_rows(&[vec![1.0, 10.0], vec![2.0, 20.0]]).unwrap();
        let pseudo = array![20.0, 10.0];

        let err = augment(&storage, &names, &matrix, pseudo.view()).unwrap_err();
        assert!(matches!(
            err,
            GrnnError::Storage(StorageError::ShortWrite { .. })
        ));
    }
}
