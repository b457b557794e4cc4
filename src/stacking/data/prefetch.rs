//! Ordered image-batch prefetching on worker threads.
//!
//! Worker `w` decodes batches `w, w + n, w + 2n, ...` and sends them over a
//! bounded channel. The consumer parks early arrivals in a reorder buffer, so
//! batches always come out in index order no matter which worker finishes
//! first.

use std::collections::BTreeMap;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::images::ImageSource;
use super::metadata::Example;
use crate::stacking::error::{Result, StackError};

/// A decoded batch: `pixels` is `[len, 3, size, size]` flattened.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    pub index: usize,
    pub pixels: Vec<f32>,
    pub labels: Vec<usize>,
    pub ids: Vec<String>,
    pub size: usize,
}

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn load_batch(
    source: &dyn ImageSource,
    examples: &[Example],
    index: usize,
    size: usize,
) -> Result<ImageBatch> {
    let mut pixels = Vec::with_capacity(examples.len() * 3 * size * size);
    for example in examples {
        pixels.extend(source.load(example, size)?);
    }
    Ok(ImageBatch {
        index,
        pixels,
        labels: examples.iter().map(|e| e.label).collect(),
        ids: examples.iter().map(|e| e.id.clone()).collect(),
        size,
    })
}

pub struct OrderedPrefetcher {
    rx: Option<Receiver<(usize, Result<ImageBatch>)>>,
    workers: Vec<JoinHandle<()>>,
    pending: BTreeMap<usize, Result<ImageBatch>>,
    next: usize,
    num_batches: usize,
    failed: bool,
}

impl OrderedPrefetcher {
    /// Start decoding `examples` in batches of `batch_size` on `num_workers`
    /// threads (at least one).
    pub fn spawn(
        source: Arc<dyn ImageSource>,
        examples: Vec<Example>,
        batch_size: usize,
        size: usize,
        num_workers: usize,
    ) -> Self {
        let batch_size = batch_size.max(1);
        let num_workers = num_workers.max(1);
        let num_batches = examples.len().div_ceil(batch_size);
        let examples = Arc::new(examples);
        let (tx, rx) = sync_channel(num_workers * 2);

        let workers = (0..num_workers)
            .map(|worker| {
                let tx = tx.clone();
                let source = Arc::clone(&source);
                let examples = Arc::clone(&examples);
                std::thread::spawn(move || {
                    for index in (worker..num_batches).step_by(num_workers) {
                        let start = index * batch_size;
                        let end = (start + batch_size).min(examples.len());
                        let batch = load_batch(source.as_ref(), &examples[start..end], index, size);
                        let failed = batch.is_err();
                        if tx.send((index, batch)).is_err() || failed {
                            break;
                        }
                    }
                })
            })
            .collect();

        tracing::debug!(num_batches, num_workers, "prefetcher started");
        Self {
            rx: Some(rx),
            workers,
            pending: BTreeMap::new(),
            next: 0,
            num_batches,
            failed: false,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    fn finish(&mut self) {
        self.rx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("prefetch worker panicked");
            }
        }
    }
}

impl Iterator for OrderedPrefetcher {
    type Item = Result<ImageBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next >= self.num_batches {
            return None;
        }
        loop {
            if let Some(batch) = self.pending.remove(&self.next) {
                self.next += 1;
                if batch.is_err() {
                    self.failed = true;
                    self.finish();
                }
                return Some(batch);
            }
            let received = self.rx.as_ref().map(|rx| rx.recv());
            match received {
                Some(Ok((index, batch))) => {
                    self.pending.insert(index, batch);
                }
                // every worker exited before sending batch `next`
                _ => {
                    self.failed = true;
                    self.finish();
                    return Some(Err(StackError::config(format!(
                        "prefetch workers stopped before batch {} of {}",
                        self.next, self.num_batches
                    ))));
                }
            }
        }
    }
}

impl Drop for OrderedPrefetcher {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    /// Fills every pixel with the example's label; sleeps longer for
    /// early examples so workers finish out of order.
    struct SlowSource;

    impl ImageSource for SlowSource {
        fn load(&self, example: &Example, size: usize) -> Result<Vec<f32>> {
            std::thread::sleep(Duration::from_millis((10 - example.label.min(10)) as u64));
            if example.id == "broken" {
                return Err(StackError::MissingInput {
                    what: "image",
                    path: example.image_path.clone(),
                });
            }
            Ok(vec![example.label as f32; 3 * size * size])
        }
    }

    struct PanickingSource;

    impl ImageSource for PanickingSource {
        fn load(&self, example: &Example, size: usize) -> Result<Vec<f32>> {
            if example.id == "img5" {
                panic!("decoder crashed on {}", example.id);
            }
            Ok(vec![0.0; 3 * size * size])
        }
    }

    fn examples(n: usize) -> Vec<Example> {
        (0..n)
            .map(|i| Example {
                id: format!("img{i}"),
                label: i % 10,
                image_path: PathBuf::from(format!("img{i}.jpg")),
            })
            .collect()
    }

    #[test]
    fn test_batches_arrive_in_index_order() {
        let prefetcher = OrderedPrefetcher::spawn(Arc::new(SlowSource), examples(23), 4, 2, 3);
        assert_eq!(prefetcher.num_batches(), 6);

        let batches: Vec<ImageBatch> = prefetcher.map(|b| b.unwrap()).collect();
        let indices: Vec<usize> = batches.iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);

        let ids: Vec<String> = batches.iter().flat_map(|b| b.ids.clone()).collect();
        let expected: Vec<String> = (0..23).map(|i| format!("img{i}")).collect();
        assert_eq!(ids, expected);
        assert_eq!(batches[5].len(), 3);
        assert_eq!(batches[0].pixels.len(), 4 * 3 * 2 * 2);
    }

    #[test]
    fn test_error_stops_iteration() {
        let mut items = examples(8);
        items[5].id = "broken".to_string();
        let results: Vec<Result<ImageBatch>> =
            OrderedPrefetcher::spawn(Arc::new(SlowSource), items, 2, 1, 2).collect();

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok() && results[1].is_ok());
        assert!(results[2].is_err());
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let results: Vec<Result<ImageBatch>> =
            OrderedPrefetcher::spawn(Arc::new(PanickingSource), examples(12), 2, 1, 1).collect();

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok() && results[1].is_ok());
        assert!(matches!(results[2], Err(StackError::Config(ref msg)) if msg.contains("batch 2 of 6")));
    }
}
