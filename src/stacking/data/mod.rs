pub mod folds;
pub mod images;
pub mod metadata;
pub mod prefetch;

pub use folds::FoldAssignment;
pub use images::{FolderImageSource, ImageSource};
pub use metadata::{Example, LabelMap, Metadata};
pub use prefetch::{ImageBatch, OrderedPrefetcher};
