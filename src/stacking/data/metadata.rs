//! Metadata tables: labeled image lists, the submission template and the
//! class-name map.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::stacking::error::{Result, StackError};
use crate::stacking::settings::DataSettings;

/// One labeled image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub id: String,
    pub label: usize,
    pub image_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct LabelRow {
    image_id: String,
    label: i64,
}

/// Class index to disease name, read from a JSON object keyed by the
/// stringified index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMap(BTreeMap<usize, String>);

impl LabelMap {
    pub fn load(path: &Path) -> Result<Self> {
        let file = open(path, "label map")?;
        let raw: BTreeMap<String, String> =
            serde_json::from_reader(file).map_err(|source| StackError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_raw(raw).map_err(|key| {
            StackError::config(format!(
                "label map {} has non-numeric key {key:?}",
                path.display()
            ))
        })
    }

    fn from_raw(raw: BTreeMap<String, String>) -> std::result::Result<Self, String> {
        raw.into_iter()
            .map(|(key, name)| key.trim().parse::<usize>().map(|idx| (idx, name)).map_err(|_| key))
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()
            .map(Self)
    }

    pub fn name(&self, class: usize) -> Option<&str> {
        self.0.get(&class).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn open(path: &Path, what: &'static str) -> Result<File> {
    if !path.exists() {
        return Err(StackError::MissingInput {
            what,
            path: path.to_path_buf(),
        });
    }
    File::open(path).map_err(|err| StackError::io(path, err))
}

/// Read an `image_id,label` table, attaching each id to `image_dir`.
///
/// With `num_classes` set, labels outside `[0, num_classes)` are rejected.
pub fn read_examples(
    csv_path: &Path,
    image_dir: &Path,
    num_classes: Option<usize>,
) -> Result<Vec<Example>> {
    let file = open(csv_path, "metadata table")?;
    let mut reader = csv::Reader::from_reader(file);
    let mut examples = Vec::new();
    for row in reader.deserialize::<LabelRow>() {
        let row = row.map_err(|source| StackError::Csv {
            path: csv_path.to_path_buf(),
            source,
        })?;
        let in_range = row.label >= 0
            && num_classes.map_or(true, |classes| (row.label as usize) < classes);
        if !in_range {
            return Err(StackError::config(format!(
                "{} lists label {} for {}",
                csv_path.display(),
                row.label,
                row.image_id
            )));
        }
        examples.push(Example {
            image_path: image_dir.join(&row.image_id),
            id: row.image_id,
            label: row.label as usize,
        });
    }
    Ok(examples)
}

/// Every table the pipeline reads.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub train: Vec<Example>,
    pub external_train: Vec<Example>,
    pub external_pseudo: Vec<Example>,
    pub submission: Vec<Example>,
    pub label_map: LabelMap,
}

impl Metadata {
    /// Load the training table, label map and submission template. The
    /// external tables are read only when `use_external` is set.
    pub fn load(data: &DataSettings, num_classes: usize) -> Result<Self> {
        let train = read_examples(
            &data.resolve(&data.train_csv),
            &data.resolve(&data.train_images),
            Some(num_classes),
        )?;
        let (external_train, external_pseudo) = if data.use_external {
            let images = data.resolve(&data.external_images);
            (
                read_examples(&data.resolve(&data.external_train_csv), &images, Some(num_classes))?,
                read_examples(&data.resolve(&data.external_pseudo_csv), &images, Some(num_classes))?,
            )
        } else {
            (Vec::new(), Vec::new())
        };
        let submission_path = data.resolve(&data.submission_csv);
        let submission = if submission_path.exists() {
            read_examples(&submission_path, &data.resolve(&data.test_images), None)?
        } else {
            Vec::new()
        };
        let label_map = LabelMap::load(&data.resolve(&data.label_map))?;
        if label_map.len() != num_classes {
            tracing::warn!(
                names = label_map.len(),
                num_classes,
                "label map size differs from the configured class count"
            );
        }

        tracing::info!(
            train = train.len(),
            external = external_train.len(),
            pseudo = external_pseudo.len(),
            submission = submission.len(),
            "metadata loaded"
        );
        Ok(Self {
            train,
            external_train,
            external_pseudo,
            submission,
            label_map,
        })
    }

    /// Examples that take part in fold assignment.
    ///
    /// External and pseudo-labeled rows are appended after the competition
    /// rows; an id already present is kept only once.
    pub fn training_examples(&self, use_external: bool) -> Vec<Example> {
        let mut examples = self.train.clone();
        if use_external {
            let mut seen: std::collections::HashSet<String> =
                examples.iter().map(|e| e.id.clone()).collect();
            for example in self.external_train.iter().chain(&self.external_pseudo) {
                if seen.insert(example.id.clone()) {
                    examples.push(example.clone());
                }
            }
        }
        examples
    }
}
