//! Checkpoint directories: `model.mpk`, `optimizer.mpk` and `meta.json`.
//!
//! Stacking checkpoints live at
//! `<weights_dir>/<model>/<model>_fold<f>_best_epoch_<e>/`; base-model
//! checkpoints use the same file layout at configured paths.

use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::record::{
    FullPrecisionSettings, HalfPrecisionSettings, NamedMpkFileRecorder, Record, Recorder,
    RecorderError,
};
use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

use super::error::{Result, StackError};

pub const MODEL_FILE: &str = "model";
pub const OPTIMIZER_FILE: &str = "optimizer";
pub const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Full,
    Half,
}

impl Precision {
    pub fn from_fp16(fp16: bool) -> Self {
        if fp16 {
            Self::Half
        } else {
            Self::Full
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub model_name: String,
    pub fold: usize,
    pub epoch: usize,
    pub loss: f32,
    /// Validation accuracy rounded to four decimals.
    pub accuracy: f64,
    pub precision: Precision,
}

impl CheckpointMeta {
    pub fn new(
        model_name: &str,
        fold: usize,
        epoch: usize,
        loss: f32,
        accuracy: f64,
        precision: Precision,
    ) -> Self {
        Self {
            model_name: model_name.to_string(),
            fold,
            epoch,
            loss,
            accuracy: round4(accuracy),
            precision,
        }
    }
}

pub fn round4(value: f64) -> f64 {
    (value * 1e4).round() / 1e4
}

pub fn checkpoint_dir(weights_dir: &Path, model: &str, fold: usize, epoch: usize) -> PathBuf {
    weights_dir
        .join(model)
        .join(format!("{model}_fold{fold}_best_epoch_{epoch}"))
}

/// Epoch encoded in a checkpoint directory name for `model` and `fold`.
fn parse_epoch(dir_name: &str, model: &str, fold: usize) -> Option<usize> {
    dir_name
        .strip_prefix(&format!("{model}_fold{fold}_best_epoch_"))?
        .parse()
        .ok()
}

/// The checkpoint with the highest epoch for `fold`, if any was written.
///
/// Checkpoints are only written on improvement and a fold's old ones are
/// cleared when its training starts, so the latest is the best.
pub fn best_checkpoint(weights_dir: &Path, model: &str, fold: usize) -> Result<Option<PathBuf>> {
    let root = weights_dir.join(model);
    if !root.is_dir() {
        return Ok(None);
    }
    let entries = std::fs::read_dir(&root).map_err(|err| StackError::io(&root, err))?;
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(|err| StackError::io(&root, err))?;
        let name = entry.file_name();
        let Some(epoch) = name.to_str().and_then(|n| parse_epoch(n, model, fold)) else {
            continue;
        };
        if best.as_ref().map_or(true, |(e, _)| epoch > *e) {
            best = Some((epoch, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}

fn write_record<B: Backend, R: Record<B>>(
    record: R,
    path: PathBuf,
    precision: Precision,
) -> std::result::Result<(), RecorderError> {
    match precision {
        Precision::Full => Recorder::<B>::record(
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            record,
            path,
        ),
        Precision::Half => Recorder::<B>::record(
            &NamedMpkFileRecorder::<HalfPrecisionSettings>::new(),
            record,
            path,
        ),
    }
}

fn read_record<B: Backend, R: Record<B>>(
    path: PathBuf,
    precision: Precision,
    device: &B::Device,
) -> std::result::Result<R, RecorderError> {
    match precision {
        Precision::Full => Recorder::<B>::load(
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            path,
            device,
        ),
        Precision::Half => Recorder::<B>::load(
            &NamedMpkFileRecorder::<HalfPrecisionSettings>::new(),
            path,
            device,
        ),
    }
}

fn create_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|err| StackError::CheckpointWrite {
        path: dir.to_path_buf(),
        reason: err.to_string(),
    })
}

fn write_failed(path: PathBuf, err: RecorderError) -> StackError {
    StackError::CheckpointWrite {
        path,
        reason: err.to_string(),
    }
}

/// Write only the model parameters into `dir`.
pub fn save_model<B: Backend, M: Module<B>>(model: &M, dir: &Path, precision: Precision) -> Result<()> {
    create_dir(dir)?;
    let path = dir.join(MODEL_FILE);
    write_record::<B, _>(model.clone().into_record(), path.clone(), precision)
        .map_err(|err| write_failed(path, err))
}

pub fn write_meta(dir: &Path, meta: &CheckpointMeta) -> Result<()> {
    let path = dir.join(META_FILE);
    let file = File::create(&path).map_err(|err| StackError::CheckpointWrite {
        path: path.clone(),
        reason: err.to_string(),
    })?;
    serde_json::to_writer_pretty(file, meta).map_err(|err| StackError::CheckpointWrite {
        path,
        reason: err.to_string(),
    })
}

/// `None` when the directory has no `meta.json`.
pub fn read_meta(dir: &Path) -> Result<Option<CheckpointMeta>> {
    let path = dir.join(META_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(&path).map_err(|err| StackError::io(&path, err))?;
    serde_json::from_reader(file)
        .map(Some)
        .map_err(|source| StackError::Json { path, source })
}

/// Persist model parameters, optimizer state and metadata into `dir`.
///
/// # Errors
/// `StackError::CheckpointWrite` if any of the three files cannot be written.
pub fn save_checkpoint<B, M, O>(dir: &Path, model: &M, optimizer: &O, meta: &CheckpointMeta) -> Result<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    save_model::<B, M>(model, dir, meta.precision)?;
    let path = dir.join(OPTIMIZER_FILE);
    write_record::<B, _>(optimizer.to_record(), path.clone(), meta.precision)
        .map_err(|err| write_failed(path, err))?;
    write_meta(dir, meta)
}

/// Load the parameters stored in `dir` into `model`.
///
/// The record precision is taken from `meta.json` when present, full
/// precision otherwise. Shapes are not checked here; see
/// [`ensure_same_shapes`](super::architectures::shapes::ensure_same_shapes).
pub fn load_model<B: Backend, M: Module<B>>(
    model: M,
    dir: &Path,
    device: &B::Device,
) -> Result<(M, Option<CheckpointMeta>)> {
    if !dir.is_dir() {
        return Err(StackError::MissingInput {
            what: "checkpoint directory",
            path: dir.to_path_buf(),
        });
    }
    let meta = read_meta(dir)?;
    let precision = meta.as_ref().map_or(Precision::Full, |m| m.precision);
    let path = dir.join(MODEL_FILE);
    let record = read_record::<B, M::Record>(path.clone(), precision, device)
        .map_err(|source| StackError::CheckpointLoad { path, source })?;
    Ok((model.load_record(record), meta))
}

pub fn load_optimizer<B, M, O>(optimizer: O, dir: &Path, device: &B::Device) -> Result<O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let precision = read_meta(dir)?.map_or(Precision::Full, |m| m.precision);
    let path = dir.join(OPTIMIZER_FILE);
    let record = read_record::<B, O::Record>(path.clone(), precision, device)
        .map_err(|source| StackError::CheckpointLoad { path, source })?;
    Ok(optimizer.load_record(record))
}

/// Tracks the best validation accuracy of one fold and writes a checkpoint
/// each time it strictly improves.
#[derive(Debug, Clone)]
pub struct CheckpointKeeper {
    weights_dir: PathBuf,
    model_name: String,
    fold: usize,
    precision: Precision,
    best_accuracy: f64,
    best_epoch: Option<usize>,
    written: Vec<PathBuf>,
}

impl CheckpointKeeper {
    pub fn new(
        weights_dir: &Path,
        model_name: &str,
        fold: usize,
        precision: Precision,
        initial_best: f64,
    ) -> Self {
        Self {
            weights_dir: weights_dir.to_path_buf(),
            model_name: model_name.to_string(),
            fold,
            precision,
            best_accuracy: initial_best,
            best_epoch: None,
            written: Vec::new(),
        }
    }

    pub fn best_accuracy(&self) -> f64 {
        self.best_accuracy
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    /// Remove checkpoints an earlier run left for this model and fold, so
    /// [`best_checkpoint`] only sees what this run writes.
    pub fn clear_stale(&self) -> Result<usize> {
        let root = self.weights_dir.join(&self.model_name);
        if !root.is_dir() {
            return Ok(0);
        }
        let entries = std::fs::read_dir(&root).map_err(|err| StackError::io(&root, err))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|err| StackError::io(&root, err))?;
            let name = entry.file_name();
            if name.to_str().and_then(|n| parse_epoch(n, &self.model_name, self.fold)).is_none() {
                continue;
            }
            let path = entry.path();
            std::fs::remove_dir_all(&path).map_err(|err| StackError::CheckpointWrite {
                path: path.clone(),
                reason: err.to_string(),
            })?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(fold = self.fold, removed, "removed checkpoints from an earlier run");
        }
        Ok(removed)
    }

    pub fn improves(&self, accuracy: f64) -> bool {
        accuracy > self.best_accuracy
    }

    /// Write a checkpoint iff `accuracy` beats the best so far.
    ///
    /// Returns the checkpoint directory when one was written.
    pub fn observe<B, M, O>(
        &mut self,
        epoch: usize,
        loss: f32,
        accuracy: f64,
        model: &M,
        optimizer: &O,
    ) -> Result<Option<PathBuf>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        if !self.improves(accuracy) {
            return Ok(None);
        }
        let dir = checkpoint_dir(&self.weights_dir, &self.model_name, self.fold, epoch);
        let meta = CheckpointMeta::new(&self.model_name, self.fold, epoch, loss, accuracy, self.precision);
        save_checkpoint::<B, M, O>(&dir, model, optimizer, &meta)?;

        tracing::info!(
            fold = self.fold,
            epoch,
            previous = self.best_accuracy,
            accuracy = meta.accuracy,
            dir = %dir.display(),
            "validation accuracy improved, checkpoint saved"
        );
        self.best_accuracy = accuracy;
        self.best_epoch = Some(epoch);
        self.written.push(dir.clone());
        Ok(Some(dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_dir_layout() {
        let dir = checkpoint_dir(Path::new("/w"), "cnn-stack", 2, 17);
        assert_eq!(dir, PathBuf::from("/w/cnn-stack/cnn-stack_fold2_best_epoch_17"));
    }

    #[test]
    fn test_parse_epoch_matches_fold_only() {
        assert_eq!(parse_epoch("cnn-stack_fold2_best_epoch_17", "cnn-stack", 2), Some(17));
        assert_eq!(parse_epoch("cnn-stack_fold3_best_epoch_17", "cnn-stack", 2), None);
        assert_eq!(parse_epoch("cnn-stack_fold2_best_epoch_x", "cnn-stack", 2), None);
    }

    #[test]
    fn test_best_checkpoint_picks_highest_epoch() {
        let dir = tempfile::tempdir().unwrap();
        for epoch in [3, 12, 7] {
            std::fs::create_dir_all(checkpoint_dir(dir.path(), "m", 0, epoch)).unwrap();
        }
        std::fs::create_dir_all(checkpoint_dir(dir.path(), "m", 1, 40)).unwrap();

        let best = best_checkpoint(dir.path(), "m", 0).unwrap().unwrap();
        assert!(best.ends_with("m_fold0_best_epoch_12"));
        assert!(best_checkpoint(dir.path(), "m", 4).unwrap().is_none());
        assert!(best_checkpoint(dir.path(), "other", 0).unwrap().is_none());
    }

    #[test]
    fn test_meta_rounds_accuracy() {
        let meta = CheckpointMeta::new("m", 0, 1, 0.5, 0.876_543_21, Precision::Full);
        assert_eq!(meta.accuracy, 0.8765);

        let dir = tempfile::tempdir().unwrap();
        write_meta(dir.path(), &meta).unwrap();
        assert_eq!(read_meta(dir.path()).unwrap(), Some(meta));
    }

    #[test]
    fn test_clear_stale_only_touches_own_fold() {
        let dir = tempfile::tempdir().unwrap();
        for (fold, epoch) in [(0, 40), (0, 3), (1, 40)] {
            std::fs::create_dir_all(checkpoint_dir(dir.path(), "m", fold, epoch)).unwrap();
        }
        let keeper = CheckpointKeeper::new(dir.path(), "m", 0, Precision::Full, 0.0);
        assert_eq!(keeper.clear_stale().unwrap(), 2);
        assert!(best_checkpoint(dir.path(), "m", 0).unwrap().is_none());
        assert!(best_checkpoint(dir.path(), "m", 1).unwrap().is_some());
        assert_eq!(keeper.clear_stale().unwrap(), 0);
    }

    #[test]
    fn test_keeper_threshold_is_strict() {
        let keeper = CheckpointKeeper::new(Path::new("/w"), "m", 0, Precision::Full, 0.5);
        assert!(!keeper.improves(0.5));
        assert!(keeper.improves(0.5001));
        assert_eq!(keeper.best_epoch(), None);
    }
}
