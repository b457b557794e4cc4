//! Per-model logit cache written once by the create-data phase.

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder};
use burn::tensor::Int;
use std::path::{Path, PathBuf};

use super::error::{Result, StackError};
use super::scorer::FoldLogits;

/// Three parallel per-fold sequences, stored under the `preds` key.
#[derive(Record)]
pub struct PredsRecord<B: Backend> {
    pub logits: Vec<Tensor<B, 3>>,
    pub targets: Vec<Tensor<B, 1, Int>>,
    pub image_ids: Vec<Vec<String>>,
}

#[derive(Record)]
pub struct LogitCacheRecord<B: Backend> {
    pub preds: PredsRecord<B>,
}

/// `<cache_dir>/result_<model>_<K>folds` (the recorder adds `.mpk`).
pub fn cache_path(cache_dir: &Path, model: &str, num_folds: usize) -> PathBuf {
    cache_dir.join(format!("result_{model}_{num_folds}folds"))
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// Out-of-fold logits of one base model, indexed by fold.
#[derive(Debug, Clone)]
pub struct LogitCache<B: Backend> {
    model_name: String,
    logits: Vec<Tensor<B, 3>>,
    targets: Vec<Tensor<B, 1, Int>>,
    image_ids: Vec<Vec<String>>,
}

impl<B: Backend> LogitCache<B> {
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            logits: Vec::new(),
            targets: Vec::new(),
            image_ids: Vec::new(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn num_folds(&self) -> usize {
        self.logits.len()
    }

    /// Append the scoring output of `fold`; folds must arrive in order.
    pub fn push_fold(&mut self, fold: usize, scored: FoldLogits<B>) -> Result<()> {
        if fold != self.num_folds() {
            return Err(StackError::config(format!(
                "cache for {} expected fold {}, got fold {fold}",
                self.model_name,
                self.num_folds()
            )));
        }
        check_fold(&self.model_name, fold, &scored)?;
        self.logits.push(scored.logits);
        self.targets.push(scored.targets);
        self.image_ids.push(scored.image_ids);
        Ok(())
    }

    pub fn fold(&self, fold: usize) -> Option<FoldLogits<B>> {
        Some(FoldLogits {
            logits: self.logits.get(fold)?.clone(),
            targets: self.targets.get(fold)?.clone(),
            image_ids: self.image_ids.get(fold)?.clone(),
        })
    }

    pub fn save(&self, cache_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(cache_dir).map_err(|err| StackError::io(cache_dir, err))?;
        let path = cache_path(cache_dir, &self.model_name, self.num_folds());
        let record = LogitCacheRecord {
            preds: PredsRecord {
                logits: self.logits.clone(),
                targets: self.targets.clone(),
                image_ids: self.image_ids.clone(),
            },
        };
        Recorder::<B>::record(&recorder(), record, path.clone()).map_err(|err| {
            StackError::CheckpointWrite {
                path: path.clone(),
                reason: err.to_string(),
            }
        })?;
        tracing::info!(model = %self.model_name, path = %path.display(), "logit cache written");
        Ok(path)
    }

    /// # Errors
    /// `CacheMissing` when the create-data phase has not produced the file,
    /// `LengthMismatch` when the stored fold count or per-fold lengths differ.
    pub fn load(cache_dir: &Path, model_name: &str, num_folds: usize, device: &B::Device) -> Result<Self> {
        let path = cache_path(cache_dir, model_name, num_folds);
        if !path.with_extension("mpk").exists() {
            return Err(StackError::CacheMissing {
                model: model_name.to_string(),
                path: path.with_extension("mpk"),
            });
        }
        let record: LogitCacheRecord<B> = Recorder::<B>::load(&recorder(), path.clone(), device)
            .map_err(|source| StackError::CheckpointLoad { path: path.clone(), source })?;
        let PredsRecord {
            logits,
            targets,
            image_ids,
        } = record.preds;

        for (what, found) in [("logits", logits.len()), ("targets", targets.len()), ("image ids", image_ids.len())] {
            if found != num_folds {
                return Err(StackError::LengthMismatch {
                    context: format!("{what} folds in cache of {model_name}"),
                    expected: num_folds,
                    found,
                });
            }
        }
        let cache = Self {
            model_name: model_name.to_string(),
            logits,
            targets,
            image_ids,
        };
        for fold in 0..num_folds {
            if let Some(scored) = cache.fold(fold) {
                check_fold(model_name, fold, &scored)?;
            }
        }
        tracing::info!(model = model_name, num_folds, "logit cache loaded");
        Ok(cache)
    }
}

fn check_fold<B: Backend>(model: &str, fold: usize, scored: &FoldLogits<B>) -> Result<()> {
    let [examples, _, _] = scored.logits.dims();
    let [targets] = scored.targets.dims();
    for (what, found) in [("targets", targets), ("image ids", scored.image_ids.len())] {
        if found != examples {
            return Err(StackError::LengthMismatch {
                context: format!("{what} of {model} fold {fold}"),
                expected: examples,
                found,
            });
        }
    }
    Ok(())
}
