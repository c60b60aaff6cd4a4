// ========================================================================================
//
//                       THE ENGINE: TRAIN, RESUME, PREDICT
//
// ========================================================================================
//
// ### Lifecycle ###
//
//   Unconfigured --configure--> Configured --train--> Training --> Ready | Failed
//
// `train` may be called again from `Ready` or `Failed`. `predict` is only valid in
// `Ready`. Reconfiguring the bandwidths invalidates any earlier training run.
//
// ### Resource model ###
//
// Everything runs on the caller's thread and blocks until done. Training performs R^2
// record writes and a prediction performs R full passes over the R^2 persisted pairs.
// That is the price of keeping memory at O(R * C): for the device capacity of 152 rows a
// single prediction reads roughly 3.5 million pair records. There is no cancellation.
//
// While `Ready`, the engine keeps the training rows and their stage-1 pseudo-labels
// (O(R * C)) for the query path. The pair set itself is only ever read from storage.

use crate::augment::{ArtifactNames, augment};
use crate::config::{EngineConfig, validate_bandwidth};
use crate::data::{TrainingMatrix, load_training_matrix};
use crate::error::GrnnError;
use crate::kernel::{estimate, fit_in_sample};
use crate::record::{F64_BYTES, PairLayout, PairRecord};
use crate::stage2::{PairReader, predict_pair};
use crate::storage::{Storage, StorageError};
use log::{debug, info, warn};
use ndarray::{Array1, ArrayView1};

/// Externally visible lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Unconfigured,
    Configured,
    Training,
    Ready,
    Failed,
}

/// What a successful training run (or resume) produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingSummary {
    pub rows: usize,
    pub cols: usize,
    pub pair_count: u64,
    pub pairs_bytes: u64,
    pub targets_bytes: u64,
    pub artifacts: ArtifactNames,
}

/// The resident part of a trained model.
#[derive(Debug)]
struct TrainedModel {
    dataset_id: String,
    artifacts: ArtifactNames,
    matrix: TrainingMatrix,
    pseudo_labels: Array1<f64>,
    pair_count: u64,
}

impl TrainedModel {
    fn summary(&self) -> TrainingSummary {
        let layout = PairLayout::new(self.matrix.ncols());
        TrainingSummary {
            rows: self.matrix.nrows(),
            cols: self.matrix.ncols(),
            pair_count: self.pair_count,
            pairs_bytes: self.pair_count * layout.record_bytes() as u64,
            targets_bytes: self.pair_count * F64_BYTES as u64,
            artifacts: self.artifacts.clone(),
        }
    }
}

#[derive(Debug)]
enum EngineState {
    Unconfigured,
    Configured,
    Training,
    Ready(TrainedModel),
    Failed { reason: String },
}

/// A stacked two-stage kernel regression engine bound to one storage backend.
///
/// The engine is not re-entrant: `train` takes `&mut self`, and a prediction borrows the
/// engine for its whole duration.
pub struct Engine<S: Storage> {
    storage: S,
    config: EngineConfig,
    configured: bool,
    state: EngineState,
}

impl<S: Storage> Engine<S> {
    /// Creates a configured engine. Fails if the configuration is invalid.
    pub fn new(storage: S, config: EngineConfig) -> Result<Self, GrnnError> {
        config.validate()?;
        Ok(Self {
            storage,
            config,
            configured: true,
            state: EngineState::Configured,
        })
    }

    /// Creates an engine with default capacities and no bandwidths. `configure` must be
    /// called before `train`.
    pub fn unconfigured(storage: S) -> Self {
        Self {
            storage,
            config: EngineConfig::default(),
            configured: false,
            state: EngineState::Unconfigured,
        }
    }

    /// Sets both kernel bandwidths. Any earlier training run is discarded.
    pub fn configure(&mut self, sigma1: f64, sigma2: f64) -> Result<(), GrnnError> {
        validate_bandwidth("sigma1", sigma1)?;
        validate_bandwidth("sigma2", sigma2)?;
        self.config.sigma1 = sigma1;
        self.config.sigma2 = sigma2;
        self.configured = true;
        self.state = EngineState::Configured;
        debug!("Configured sigma1 = {sigma1}, sigma2 = {sigma2}");
        Ok(())
    }

    pub fn phase(&self) -> EnginePhase {
        match self.state {
            EngineState::Unconfigured => EnginePhase::Unconfigured,
            EngineState::Configured => EnginePhase::Configured,
            EngineState::Training => EnginePhase::Training,
            EngineState::Ready(_) => EnginePhase::Ready,
            EngineState::Failed { .. } => EnginePhase::Failed,
        }
    }

    /// Why the last training run failed, while the engine is in `Failed`.
    pub fn failure_reason(&self) -> Option<&str> {
        match &self.state {
            EngineState::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Stage-1 pseudo-labels of the current model, if one is ready.
    pub fn pseudo_labels(&self) -> Option<ArrayView1<'_, f64>> {
        match &self.state {
            EngineState::Ready(model) => Some(model.pseudo_labels.view()),
            _ => None,
        }
    }

    /// Identifier of the dataset the current model was trained on.
    pub fn dataset_id(&self) -> Option<&str> {
        match &self.state {
            EngineState::Ready(model) => Some(&model.dataset_id),
            _ => None,
        }
    }

    /// Loads `dataset_id`, computes stage-1 pseudo-labels and persists the pair set,
    /// replacing the artifacts of any earlier run on the same dataset.
    ///
    /// Blocks for the whole O(R^2) augmentation. On failure the engine is left in
    /// `Failed` and nothing from the run is kept.
    pub fn train(&mut self, dataset_id: &str) -> Result<TrainingSummary, GrnnError> {
        if !self.configured {
            return Err(GrnnError::NotConfigured);
        }
        self.state = EngineState::Training;
        info!(
            "Training on '{dataset_id}' (sigma1 = {}, sigma2 = {})",
            self.config.sigma1, self.config.sigma2
        );

        match self.run_training(dataset_id) {
            Ok(model) => {
                let summary = model.summary();
                info!(
                    "Training complete: {} rows, {} pairs persisted",
                    summary.rows, summary.pair_count
                );
                self.state = EngineState::Ready(model);
                Ok(summary)
            }
            Err(e) => {
                warn!("Training on '{dataset_id}' failed: {e}");
                self.state = EngineState::Failed {
                    reason: e.to_string(),
                };
                Err(e)
            }
        }
    }

    fn run_training(&self, dataset_id: &str) -> Result<TrainedModel, GrnnError> {
        let matrix = load_training_matrix(&self.storage, dataset_id, &self.config)?;
        let pseudo_labels = fit_in_sample(
            &matrix,
            self.config.sigma1,
            self.config.include_self_in_stage1,
        );
        let artifacts = ArtifactNames::for_dataset(dataset_id);
        let report = augment(&self.storage, &artifacts, &matrix, pseudo_labels.view())?;
        Ok(TrainedModel {
            dataset_id: dataset_id.to_string(),
            artifacts,
            matrix,
            pseudo_labels,
            pair_count: report.pair_count,
        })
    }

    /// Re-attaches the persisted artifacts of an earlier `train` on `dataset_id`, e.g.
    /// after a restart.
    ///
    /// The table shape is recovered from the stream lengths, and the resident rows and
    /// pseudo-labels are read back from the first R pair records (pair `0 * R + j` carries
    /// row `j` and its pseudo-label). The current state is untouched on failure.
    pub fn resume(&mut self, dataset_id: &str) -> Result<TrainingSummary, GrnnError> {
        if !self.configured {
            return Err(GrnnError::NotConfigured);
        }
        let artifacts = ArtifactNames::for_dataset(dataset_id);
        let (rows, layout) = self.recover_shape(&artifacts)?;

        let (row_data, pseudo) = if rows > 0 {
            let mut reader = PairReader::open(&self.storage, &artifacts, layout)?;
            let outcome = read_resident_rows(&mut reader, rows);
            let closed = reader.close();
            let resident = outcome?;
            closed?;
            resident
        } else {
            (Vec::new(), Vec::new())
        };

        let matrix = TrainingMatrix::from_rows(&row_data)?;
        let model = TrainedModel {
            dataset_id: dataset_id.to_string(),
            artifacts,
            matrix,
            pseudo_labels: Array1::from_vec(pseudo),
            pair_count: (rows * rows) as u64,
        };
        let summary = model.summary();
        info!(
            "Resumed '{dataset_id}': {} rows x {} columns",
            summary.rows, summary.cols
        );
        self.state = EngineState::Ready(model);
        Ok(summary)
    }

    fn recover_shape(&self, artifacts: &ArtifactNames) -> Result<(usize, PairLayout), GrnnError> {
        let corrupt = |stream: &str, reason: String| StorageError::CorruptArtifact {
            stream: stream.to_string(),
            reason,
        };

        let targets_len = self.storage.stream_len(&artifacts.targets)?;
        let pairs_len = self.storage.stream_len(&artifacts.pairs)?;
        if targets_len % F64_BYTES as u64 != 0 {
            return Err(corrupt(
                &artifacts.targets,
                format!("length {targets_len} is not a whole number of records"),
            )
            .into());
        }
        let pair_count = targets_len / F64_BYTES as u64;
        let rows = pair_count.isqrt();
        if rows * rows != pair_count {
            return Err(corrupt(
                &artifacts.targets,
                format!("{pair_count} records is not a square pair count"),
            )
            .into());
        }
        if rows > self.config.max_rows as u64 {
            return Err(GrnnError::ResourceExhausted {
                capacity: self.config.max_rows,
            });
        }
        if pair_count == 0 {
            if pairs_len != 0 {
                return Err(corrupt(
                    &artifacts.pairs,
                    "pairs stream is not empty but targets stream is".to_string(),
                )
                .into());
            }
            return Ok((0, PairLayout::new(0)));
        }

        let layout = if pairs_len % pair_count == 0 {
            PairLayout::from_record_bytes((pairs_len / pair_count) as usize)
        } else {
            None
        };
        let layout = layout.ok_or_else(|| {
            corrupt(
                &artifacts.pairs,
                format!("length {pairs_len} does not split into {pair_count} pair records"),
            )
        })?;
        if layout.cols() > self.config.max_cols {
            return Err(corrupt(
                &artifacts.pairs,
                format!(
                    "records hold {} columns, above the capacity of {}",
                    layout.cols(),
                    self.config.max_cols
                ),
            )
            .into());
        }
        Ok((rows as usize, layout))
    }

    /// Estimates the label for one feature vector of length C - 1.
    ///
    /// 1. Stage-1 estimate of the query against every training row, with sigma2.
    /// 2. For every training row j, a query pair [query, stage1(query)] ‖ row_j ‖
    ///    stage1(query) ‖ pseudo[j] is scored by stage 2 against the persisted pairs.
    /// 3. Each stage-2 value is the predicted shift of the query relative to row j, so
    ///    `pseudo[j] + correction_j` is one estimate of the query label per row. The
    ///    result is the mean of those R estimates: the sum of the stage-2 corrections
    ///    plus the sum of the pseudo-labels, divided by R.
    ///
    /// Blocks for R full passes over the persisted pair set.
    pub fn predict(&self, query: &[f64]) -> Result<f64, GrnnError> {
        let model = match &self.state {
            EngineState::Ready(model) if !model.matrix.is_empty() => model,
            _ => return Err(GrnnError::NotTrained),
        };
        let matrix = &model.matrix;
        if query.len() != matrix.n_features() {
            return Err(GrnnError::QueryShape {
                expected: matrix.n_features(),
                found: query.len(),
            });
        }
        let sigma2 = self.config.sigma2;

        let stage_one = estimate(ArrayView1::from(query), matrix, sigma2, None).finish();
        debug!("Stage-1 estimate for query: {stage_one}");

        let mut left_row = Vec::with_capacity(matrix.ncols());
        left_row.extend_from_slice(query);
        left_row.push(stage_one);
        let left = ArrayView1::from(left_row.as_slice());

        let mut pair = PairRecord::zeroed(PairLayout::new(matrix.ncols()));
        let mut correction_sum = 0.0;
        for (j, &pseudo_j) in model.pseudo_labels.iter().enumerate() {
            pair.fill(left, matrix.row(j), stage_one, pseudo_j);
            correction_sum +=
                predict_pair(&self.storage, &model.artifacts, &pair, model.pair_count, sigma2)?;
        }

        let pseudo_sum = model.pseudo_labels.sum();
        let prediction = (correction_sum + pseudo_sum) / matrix.nrows() as f64;
        debug!(
            "Stage-2 corrections sum {correction_sum}, pseudo-label sum {pseudo_sum}, prediction {prediction}"
        );
        Ok(prediction)
    }
}

/// Pairs `0 * R + j` for j in `0..rows` carry every training row on their right side.
fn read_resident_rows(
    reader: &mut PairReader,
    rows: usize,
) -> Result<(Vec<Vec<f64>>, Vec<f64>), GrnnError> {
    let mut row_data = Vec::with_capacity(rows);
    let mut pseudo = Vec::with_capacity(rows);
    for _ in 0..rows {
        let (record, _) = reader.next_pair()?;
        row_data.push(record.right().to_vec());
        pseudo.push(record.right_pseudo());
    }
    Ok((row_data, pseudo))
}
