use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use logit_stack::stacking::data::FolderImageSource;
use logit_stack::stacking::DeviceKind;
use logit_stack::{logging, Pipeline, Result, Settings, StackError};

fn run(config: Option<PathBuf>) -> Result<()> {
    let settings = Settings::load(config.as_deref())?;
    tracing::info!(
        model = %settings.run.model,
        folds = ?settings.run.folds,
        device = ?settings.run.device,
        data_root = %settings.data.root.display(),
        "settings loaded"
    );
    let pipeline = Pipeline::new(&settings, Arc::new(FolderImageSource));

    let summary = match settings.run.device {
        DeviceKind::Cpu => {
            let device = Default::default();
            pipeline.run::<Autodiff<NdArray<f32>>>(&device)?
        }
        #[cfg(feature = "wgpu")]
        DeviceKind::Wgpu => {
            let device = burn::backend::wgpu::WgpuDevice::default();
            pipeline.run::<Autodiff<burn::backend::Wgpu>>(&device)?
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceKind::Wgpu => {
            return Err(StackError::config(
                "device = \"wgpu\" requires building with the `wgpu` feature",
            ))
        }
    };

    for report in &summary.folds {
        tracing::info!(
            fold = report.fold,
            best_accuracy = report.best_accuracy,
            best_epoch = ?report.best_epoch,
            "fold summary"
        );
    }
    if let Some(path) = &summary.submission {
        tracing::info!(path = %path.display(), "submission ready");
    }
    Ok(())
}

fn main() -> ExitCode {
    if let Err(err) = logging::init() {
        eprintln!("logging unavailable: {err}");
    }
    let config = std::env::args_os().nth(1).map(PathBuf::from);
    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
