//! Settings module for the stacking pipeline.
//!
//! Settings are loaded once (defaults, then an optional TOML file), validated,
//! and passed by reference into every component. Nothing reads them from a
//! global.

use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::{Result, StackError};

/// Directory under the home directory used when no data root is configured.
pub const DEFAULT_DATA_SUBDIR: &str = "cassava/stacking/data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Wgpu,
}

impl Default for DeviceKind {
    fn default() -> Self {
        Self::Cpu
    }
}

/// Training and scoring options for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    /// Identifier of the stacking model; names the checkpoint directory.
    pub model: String,
    pub seed: u64,
    pub num_folds: usize,
    /// Held-out folds to train a stacking model for.
    pub folds: Vec<usize>,
    pub num_classes: usize,
    pub device: DeviceKind,
    /// Store checkpoints with half-precision record settings.
    pub fp16: bool,
    pub batch_size: usize,
    pub lr: f64,
    /// Floor of the cosine schedule.
    pub lr_min: f64,
    /// Epochs per cosine warm restart. `None` keeps `lr` constant.
    pub restart_period: Option<usize>,
    pub weight_decay: f32,
    pub epochs: usize,
    pub num_workers: usize,
    pub mixup: bool,
    pub mixup_alpha: f64,
    pub fmix: bool,
    /// Region mixing replaces mixup for epochs strictly greater than this.
    pub fmix_start_epoch: usize,
    pub fmix_alpha: f64,
    pub fmix_decay_power: f64,
    pub tta: bool,
    pub create_data: bool,
    pub predict: bool,
    pub smooth_label: f64,
    pub gradient_accumulation_steps: usize,
    /// Validation accuracy a fold must beat before its first checkpoint.
    pub initial_best_accuracy: f64,
    pub hidden_size: usize,
    pub dropout: f64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            model: "cnn-stack".to_string(),
            seed: 42,
            num_folds: 5,
            folds: vec![0, 1, 2, 3, 4],
            num_classes: 5,
            device: DeviceKind::Cpu,
            fp16: false,
            batch_size: 64,
            lr: 1e-3,
            lr_min: 1e-8,
            restart_period: None,
            weight_decay: 1e-2,
            epochs: 100,
            num_workers: 2,
            mixup: true,
            mixup_alpha: 1.0,
            fmix: false,
            fmix_start_epoch: 10,
            fmix_alpha: 1.0,
            fmix_decay_power: 5.0,
            tta: true,
            create_data: false,
            predict: false,
            smooth_label: 0.1,
            gradient_accumulation_steps: 1,
            initial_best_accuracy: 0.0,
            hidden_size: 1024,
            dropout: 0.5,
        }
    }
}

/// Locations of the input tables, images and pipeline outputs.
///
/// Every relative path is resolved against `root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    pub root: PathBuf,
    pub train_csv: PathBuf,
    pub train_images: PathBuf,
    pub external_train_csv: PathBuf,
    pub external_pseudo_csv: PathBuf,
    pub external_images: PathBuf,
    pub submission_csv: PathBuf,
    pub test_images: PathBuf,
    pub label_map: PathBuf,
    pub cache_dir: PathBuf,
    pub weights_dir: PathBuf,
    pub submission_out: PathBuf,
    /// Merge external and pseudo-labeled rows into the folded training set.
    pub use_external: bool,
    /// Side length base-model inputs are resized to.
    pub image_size: usize,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            root: default_data_root(),
            train_csv: "train.csv".into(),
            train_images: "train_images".into(),
            external_train_csv: "external/train_external.csv".into(),
            external_pseudo_csv: "external/test_external_pseudo.csv".into(),
            external_images: "external/images".into(),
            submission_csv: "sample_submission.csv".into(),
            test_images: "test_images".into(),
            label_map: "label_num_to_disease_map.json".into(),
            cache_dir: "cache".into(),
            weights_dir: "weights".into(),
            submission_out: "submission.csv".into(),
            use_external: false,
            image_size: 384,
        }
    }
}

impl DataSettings {
    /// Resolve a configured path against the data root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Layout of a base-model convolutional classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureSpec {
    pub in_channels: usize,
    pub stem_channels: usize,
    /// Output channels of each residual stage; every stage halves resolution.
    pub stage_channels: Vec<usize>,
}

impl Default for ArchitectureSpec {
    fn default() -> Self {
        Self {
            in_channels: 3,
            stem_channels: 32,
            stage_channels: vec![64, 128, 256],
        }
    }
}

/// One frozen base model: architecture record plus one checkpoint per fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseModelSpec {
    pub name: String,
    pub architecture: ArchitectureSpec,
    pub drop_rate: f64,
    pub drop_path_rate: f64,
    /// Checkpoint directory for each fold, index = fold.
    pub checkpoints: Vec<PathBuf>,
}

impl BaseModelSpec {
    fn with_default_checkpoints(
        name: &str,
        architecture: ArchitectureSpec,
        drop_path_rate: f64,
        num_folds: usize,
    ) -> Self {
        let checkpoints = (0..num_folds)
            .map(|fold| PathBuf::from(format!("base/{name}/{name}_fold{fold}")))
            .collect();
        Self {
            name: name.to_string(),
            architecture,
            drop_rate: 0.2,
            drop_path_rate,
            checkpoints,
        }
    }
}

fn default_base_models(num_folds: usize) -> Vec<BaseModelSpec> {
    vec![
        BaseModelSpec::with_default_checkpoints(
            "resnest26d",
            ArchitectureSpec::default(),
            0.0,
            num_folds,
        ),
        BaseModelSpec::with_default_checkpoints(
            "resnest50d",
            ArchitectureSpec {
                stage_channels: vec![64, 128, 256, 512],
                ..ArchitectureSpec::default()
            },
            0.0,
            num_folds,
        ),
        BaseModelSpec::with_default_checkpoints(
            "tf_efficientnet_b4_ns",
            ArchitectureSpec {
                stem_channels: 48,
                stage_channels: vec![96, 192, 384],
                ..ArchitectureSpec::default()
            },
            0.3,
            num_folds,
        ),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub run: RunOptions,
    pub data: DataSettings,
    pub base_models: Vec<BaseModelSpec>,
}

impl Default for Settings {
    fn default() -> Self {
        let run = RunOptions::default();
        let base_models = default_base_models(run.num_folds);
        Self {
            run,
            data: DataSettings::default(),
            base_models,
        }
    }
}

impl Settings {
    /// Load settings from defaults overlaid with an optional TOML file.
    ///
    /// A missing file is not an error; the defaults are validated either way.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML text layered over the defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let run = &self.run;
        if run.num_folds < 2 {
            return Err(StackError::config(format!(
                "num_folds must be at least 2, got {}",
                run.num_folds
            )));
        }
        if let Some(&fold) = run.folds.iter().find(|&&f| f >= run.num_folds) {
            return Err(StackError::config(format!(
                "fold {fold} is outside [0, {})",
                run.num_folds
            )));
        }
        if run.num_classes < 2 {
            return Err(StackError::config("num_classes must be at least 2"));
        }
        if run.batch_size == 0 {
            return Err(StackError::config("batch_size must be positive"));
        }
        if run.gradient_accumulation_steps == 0 {
            return Err(StackError::config(
                "gradient_accumulation_steps must be positive",
            ));
        }
        if !(0.0..1.0).contains(&run.smooth_label) {
            return Err(StackError::config(format!(
                "smooth_label must be in [0, 1), got {}",
                run.smooth_label
            )));
        }
        if !(0.0..1.0).contains(&run.dropout) {
            return Err(StackError::config("dropout must be in [0, 1)"));
        }
        if run.lr_min > run.lr {
            return Err(StackError::config("lr_min must not exceed lr"));
        }
        if run.restart_period == Some(0) {
            return Err(StackError::config("restart_period must be positive"));
        }
        if self.base_models.is_empty() {
            return Err(StackError::config("at least one base model is required"));
        }
        for spec in &self.base_models {
            if spec.checkpoints.len() != run.num_folds {
                return Err(StackError::config(format!(
                    "base model {} lists {} checkpoints for {} folds",
                    spec.name,
                    spec.checkpoints.len(),
                    run.num_folds
                )));
            }
            if spec.architecture.stage_channels.is_empty() {
                return Err(StackError::config(format!(
                    "base model {} has no stages",
                    spec.name
                )));
            }
        }
        let mut names: Vec<&str> = self.base_models.iter().map(|m| m.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.base_models.len() {
            return Err(StackError::config("base model names must be unique"));
        }
        Ok(())
    }
}

/// `$HOME/cassava/stacking/data`, or a relative path when no home exists.
pub fn default_data_root() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(DEFAULT_DATA_SUBDIR))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_SUBDIR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        settings.validate().expect("defaults should validate");

        assert_eq!(settings.run.num_folds, 5);
        assert_eq!(settings.run.batch_size, 64);
        assert!(settings.run.mixup);
        assert!(!settings.run.fmix);
        assert_eq!(settings.base_models.len(), 3);
        assert!(settings.data.root.ends_with(DEFAULT_DATA_SUBDIR));
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [run]
            batch_size = 16
            mixup = false
            epochs = 3
            "#,
        )
        .expect("should parse");

        assert_eq!(settings.run.batch_size, 16);
        assert!(!settings.run.mixup);
        assert_eq!(settings.run.epochs, 3);
        assert_eq!(settings.run.lr, 1e-3);
    }

    #[test]
    fn test_rejects_single_fold() {
        let mut settings = Settings::default();
        settings.run.num_folds = 1;
        settings.run.folds = vec![0];
        assert!(matches!(settings.validate(), Err(StackError::Config(_))));
    }

    #[test]
    fn test_rejects_checkpoint_count_mismatch() {
        let mut settings = Settings::default();
        settings.base_models[1].checkpoints.pop();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("resnest50d"));
    }

    #[test]
    fn test_resolve_keeps_absolute_paths() {
        let mut data = DataSettings::default();
        data.root = PathBuf::from("/data");
        assert_eq!(data.resolve(Path::new("train.csv")), PathBuf::from("/data/train.csv"));
        assert_eq!(data.resolve(Path::new("/abs/x.csv")), PathBuf::from("/abs/x.csv"));
    }

    #[test]
    fn test_settings_serialization_roundtrip() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).expect("Should serialize to JSON");
        let back: Settings = serde_json::from_str(&json).expect("Should deserialize from JSON");
        assert_eq!(back.base_models, settings.base_models);
        assert_eq!(back.run.model, "cnn-stack");
    }
}
