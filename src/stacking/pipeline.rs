//! Run phases: create the logit caches, train the stacking model per fold,
//! and optionally predict the submission table.

use burn::prelude::*;
use burn::tensor::activation;
use burn::tensor::backend::AutodiffBackend;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use super::architectures::{ensure_same_shapes, load_fold_models, StackModel, StackModelConfig};
use super::builder::{build_fold_split, stack_models};
use super::cache::LogitCache;
use super::checkpoint;
use super::data::{Example, FoldAssignment, ImageSource, Metadata};
use super::error::{Result, StackError};
use super::loss_utils::argmax_with_tie_break_smallest;
use super::scorer::{score_examples, ScoreOptions};
use super::settings::Settings;
use super::train::{run_fold, FoldReport};
use super::tta::Tta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    CreateData,
    Train,
    Predict,
}

impl Phase {
    /// `create_data` selects data creation instead of training; `predict`
    /// appends the prediction phase.
    pub fn plan(settings: &Settings) -> Vec<Phase> {
        let mut phases = vec![if settings.run.create_data {
            Phase::CreateData
        } else {
            Phase::Train
        }];
        if settings.run.predict {
            phases.push(Phase::Predict);
        }
        phases
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub caches: Vec<PathBuf>,
    pub folds: Vec<FoldReport>,
    pub submission: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct SubmissionRow<'a> {
    image_id: &'a str,
    label: usize,
}

/// The whole stacking run over one settings value and one image source.
pub struct Pipeline<'a> {
    settings: &'a Settings,
    source: Arc<dyn ImageSource>,
}

impl<'a> Pipeline<'a> {
    pub fn new(settings: &'a Settings, source: Arc<dyn ImageSource>) -> Self {
        Self { settings, source }
    }

    fn score_options(&self) -> ScoreOptions {
        ScoreOptions {
            batch_size: self.settings.run.batch_size,
            image_size: self.settings.data.image_size,
            num_workers: self.settings.run.num_workers,
            tta: self.settings.run.tta,
        }
    }

    fn cache_dir(&self) -> PathBuf {
        self.settings.data.resolve(&self.settings.data.cache_dir)
    }

    fn weights_dir(&self) -> PathBuf {
        self.settings.data.resolve(&self.settings.data.weights_dir)
    }

    /// Run every planned phase in order.
    pub fn run<B: AutodiffBackend>(&self, device: &B::Device) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut metadata = None;
        for phase in Phase::plan(self.settings) {
            tracing::info!(?phase, "starting phase");
            match phase {
                Phase::CreateData => {
                    let loaded = self.load_metadata(&mut metadata)?;
                    summary.caches = self.create_data::<B::InnerBackend>(loaded, device)?;
                }
                Phase::Train => summary.folds = self.train::<B>(device)?,
                Phase::Predict => {
                    let loaded = self.load_metadata(&mut metadata)?;
                    summary.submission = Some(self.predict::<B::InnerBackend>(loaded, device)?);
                }
            }
        }
        Ok(summary)
    }

    fn load_metadata<'m>(&self, slot: &'m mut Option<Metadata>) -> Result<&'m Metadata> {
        if slot.is_none() {
            *slot = Some(Metadata::load(&self.settings.data, self.settings.run.num_classes)?);
        }
        slot.as_ref()
            .ok_or_else(|| StackError::config("metadata unavailable"))
    }

    /// Score every fold with every base model and write one cache per model.
    pub fn create_data<B: Backend>(&self, metadata: &Metadata, device: &B::Device) -> Result<Vec<PathBuf>> {
        let run = &self.settings.run;
        let examples = metadata.training_examples(self.settings.data.use_external);
        let labels: Vec<usize> = examples.iter().map(|e| e.label).collect();
        let assignment = FoldAssignment::stratified(&labels, run.num_folds, run.seed)?;
        tracing::info!(
            examples = examples.len(),
            fold_sizes = ?assignment.fold_sizes(),
            tta_variants = Tta::variants(run.tta).len(),
            "fold assignment ready"
        );

        let mut caches: Vec<LogitCache<B>> = self
            .settings
            .base_models
            .iter()
            .map(|spec| LogitCache::new(&spec.name))
            .collect();
        let options = self.score_options();

        for fold in 0..run.num_folds {
            let held_out: Vec<Example> = assignment
                .fold_indices(fold)
                .into_iter()
                .map(|idx| examples[idx].clone())
                .collect();
            tracing::info!(fold, examples = held_out.len(), "creating stacking data on held-out fold");

            let models = load_fold_models::<B>(
                &self.settings.base_models,
                fold,
                run.num_classes,
                |path| self.settings.data.resolve(path),
                device,
            )?;
            let scored = score_examples(&models, Arc::clone(&self.source), &held_out, &options, device)?;
            for (cache, fold_logits) in caches.iter_mut().zip(scored) {
                cache.push_fold(fold, fold_logits)?;
            }
        }

        let cache_dir = self.cache_dir();
        caches.iter().map(|cache| cache.save(&cache_dir)).collect()
    }

    /// Load the caches and train one stacking model per configured fold.
    pub fn train<B: AutodiffBackend>(&self, device: &B::Device) -> Result<Vec<FoldReport>> {
        let run = &self.settings.run;
        let cache_dir = self.cache_dir();
        let caches = self
            .settings
            .base_models
            .iter()
            .map(|spec| LogitCache::<B::InnerBackend>::load(&cache_dir, &spec.name, run.num_folds, device))
            .collect::<Result<Vec<_>>>()?;

        let weights_dir = self.weights_dir();
        let mut reports = Vec::with_capacity(run.folds.len());
        for &fold in &run.folds {
            let split = build_fold_split(&caches, run.num_folds, fold)?;
            reports.push(run_fold::<B>(&split, run, &weights_dir, device)?);
        }

        if !reports.is_empty() {
            let cv = reports.iter().map(|r| r.best_accuracy).sum::<f64>() / reports.len() as f64;
            tracing::info!(folds = reports.len(), cv_accuracy = cv, "stacking training finished");
        }
        Ok(reports)
    }

    /// Average per-fold stacking probabilities over the submission images
    /// and write `image_id,label` rows.
    pub fn predict<B: Backend>(&self, metadata: &Metadata, device: &B::Device) -> Result<PathBuf> {
        let run = &self.settings.run;
        if metadata.submission.is_empty() {
            return Err(StackError::MissingInput {
                what: "submission template",
                path: self.settings.data.resolve(&self.settings.data.submission_csv),
            });
        }
        let weights_dir = self.weights_dir();
        let options = self.score_options();
        let mut total: Option<Tensor<B, 2>> = None;
        let mut image_ids = Vec::new();

        for &fold in &run.folds {
            let dir = checkpoint::best_checkpoint(&weights_dir, &run.model, fold)?.ok_or_else(|| {
                StackError::MissingInput {
                    what: "stacking checkpoint",
                    path: weights_dir.join(&run.model),
                }
            })?;
            let models = load_fold_models::<B>(
                &self.settings.base_models,
                fold,
                run.num_classes,
                |path| self.settings.data.resolve(path),
                device,
            )?;
            let scored = score_examples(&models, Arc::clone(&self.source), &metadata.submission, &options, device)?;
            image_ids = scored
                .first()
                .map(|reference| reference.image_ids.clone())
                .ok_or_else(|| StackError::config("prediction needs at least one base model"))?;
            let inputs = stack_models(scored.into_iter().map(|s| s.logits).collect());

            let stack = load_stack_model::<B>(&inputs, run.hidden_size, run.dropout, &dir, device)?;
            let probs = predict_probabilities(&stack, inputs, run.batch_size);
            total = Some(match total {
                Some(sum) => sum + probs,
                None => probs,
            });
            tracing::info!(fold, checkpoint = %dir.display(), "fold predictions added");
        }

        let total = total.ok_or_else(|| StackError::config("no folds configured for prediction"))?;
        let mean = total / run.folds.len() as f32;
        let labels: Vec<i64> = argmax_with_tie_break_smallest(mean)
            .into_data()
            .convert::<i64>()
            .to_vec()
            .map_err(|err| StackError::config(format!("prediction readback failed: {err:?}")))?;

        let out = self.settings.data.resolve(&self.settings.data.submission_out);
        write_submission(&out, &image_ids, &labels)?;
        for class in 0..run.num_classes {
            let count = labels.iter().filter(|&&l| l as usize == class).count();
            let name = metadata.label_map.name(class).unwrap_or("unknown");
            tracing::info!(class, name, count, "predicted class count");
        }
        Ok(out)
    }
}

fn load_stack_model<B: Backend>(
    inputs: &Tensor<B, 4>,
    hidden_size: usize,
    dropout: f64,
    dir: &std::path::Path,
    device: &B::Device,
) -> Result<StackModel<B>> {
    let [_, num_models, num_tta, num_classes] = inputs.dims();
    let fresh = StackModelConfig::new(num_models, num_tta, num_classes)
        .with_hidden_size(hidden_size)
        .with_dropout(dropout)
        .init::<B>(device)?;
    let (loaded, _) = checkpoint::load_model(fresh.clone(), dir, device)?;
    ensure_same_shapes(&dir.display().to_string(), &fresh, &loaded)?;
    Ok(loaded.eval())
}

/// Softmax probabilities `[examples, classes]`, computed batch by batch.
pub fn predict_probabilities<B: Backend>(
    model: &StackModel<B>,
    inputs: Tensor<B, 4>,
    batch_size: usize,
) -> Tensor<B, 2> {
    let [examples, _, _, _] = inputs.dims();
    let batch_size = batch_size.max(1);
    let parts: Vec<Tensor<B, 2>> = (0..examples)
        .step_by(batch_size)
        .map(|start| {
            let end = (start + batch_size).min(examples);
            let batch = inputs.clone().slice([start..end]);
            activation::softmax(model.forward(batch), 1)
        })
        .collect();
    Tensor::cat(parts, 0)
}

fn write_submission(path: &std::path::Path, image_ids: &[String], labels: &[i64]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| StackError::io(parent, err))?;
    }
    let csv_err = |source| StackError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    for (image_id, &label) in image_ids.iter().zip(labels) {
        writer
            .serialize(SubmissionRow {
                image_id,
                label: label as usize,
            })
            .map_err(csv_err)?;
    }
    writer.flush().map_err(|err| StackError::io(path, err))?;
    tracing::info!(path = %path.display(), rows = image_ids.len(), "submission written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_plan() {
        let mut settings = Settings::default();
        assert_eq!(Phase::plan(&settings), vec![Phase::Train]);

        settings.run.create_data = true;
        assert_eq!(Phase::plan(&settings), vec![Phase::CreateData]);

        settings.run.predict = true;
        assert_eq!(Phase::plan(&settings), vec![Phase::CreateData, Phase::Predict]);
    }

    #[test]
    fn test_write_submission() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/submission.csv");
        write_submission(&path, &["a.jpg".to_string(), "b.jpg".to_string()], &[3, 0]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "image_id,label\na.jpg,3\nb.jpg,0\n");
    }
}
