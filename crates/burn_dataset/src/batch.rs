//! Batch iteration for training and validation.
//!
//! [`PatchSampler`] is an endless stream of randomly cropped, randomly
//! augmented patches for training; [`SequentialBatches`] walks a set in order
//! without augmentation for validation and prediction.

use crate::aug::{AugmentationPolicy, PatchTransform};
use crate::types::{BurnDatasetError, DatasetResult, PatchBatch, SegmentationSet};
use ndarray::{ArrayD, Axis, IxDyn, Slice};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub batch_size: usize,
    /// Patch extent per spatial axis.
    pub patch: Vec<usize>,
    /// Apply random flips/rotations.
    pub augment: bool,
    /// Seed for reproducible sampling.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub batches: usize,
    pub samples: usize,
    pub flips: usize,
    pub rotations: usize,
}

/// Where one patch comes from and what happens to it.
#[derive(Debug, Clone)]
struct PatchPlan {
    index: usize,
    offsets: Vec<usize>,
    transform: PatchTransform,
}

pub struct PatchSampler<'a> {
    set: &'a SegmentationSet,
    cfg: SamplerConfig,
    policy: AugmentationPolicy,
    rng: StdRng,
    stats: SamplerStats,
}

impl<'a> PatchSampler<'a> {
    pub fn new(set: &'a SegmentationSet, cfg: SamplerConfig) -> DatasetResult<Self> {
        if set.is_empty() {
            return Err(BurnDatasetError::Other(
                "cannot sample patches from an empty set".to_string(),
            ));
        }
        if cfg.batch_size == 0 {
            return Err(BurnDatasetError::Other("batch size must be > 0".to_string()));
        }
        let extent = set.spatial_shape();
        if cfg.patch.len() != extent.len() {
            return Err(BurnDatasetError::InvalidPatch(format!(
                "patch {:?} has {} axes, data has {} spatial axes",
                cfg.patch,
                cfg.patch.len(),
                extent.len()
            )));
        }
        for (axis, (&patch, &size)) in cfg.patch.iter().zip(extent).enumerate() {
            if patch == 0 {
                return Err(BurnDatasetError::InvalidPatch(format!(
                    "patch extent on axis {axis} is zero"
                )));
            }
            if patch > size {
                return Err(BurnDatasetError::InvalidPatch(format!(
                    "patch is too large on axis {axis}: {patch} > {size}"
                )));
            }
        }

        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let policy = if cfg.augment {
            AugmentationPolicy::default()
        } else {
            AugmentationPolicy::disabled()
        };
        Ok(Self {
            set,
            cfg,
            policy,
            rng,
            stats: SamplerStats::default(),
        })
    }

    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    /// Draws the next batch. Sample indices come from a fresh permutation per
    /// batch, so a sample appears at most once unless the set is smaller than
    /// the batch.
    pub fn next_batch(&mut self) -> PatchBatch {
        let plans: Vec<PatchPlan> = self
            .draw_indices()
            .into_iter()
            .map(|index| self.plan(index))
            .collect();

        let set = self.set;
        let patch = &self.cfg.patch;
        let patches: Vec<(ArrayD<f32>, ArrayD<f32>)> = plans
            .par_iter()
            .map(|plan| extract(set, patch, plan))
            .collect();

        for plan in &plans {
            if plan.transform.flipped() {
                self.stats.flips += 1;
            }
            if plan.transform.rotated() {
                self.stats.rotations += 1;
            }
        }
        self.stats.batches += 1;
        self.stats.samples += plans.len();

        assemble(
            patches,
            self.set.image_channels(),
            self.set.mask_channels(),
            patch,
        )
    }

    fn draw_indices(&mut self) -> Vec<usize> {
        let n = self.set.len();
        let wanted = self.cfg.batch_size;
        let mut picked = Vec::with_capacity(wanted);
        while picked.len() < wanted {
            let mut perm: Vec<usize> = (0..n).collect();
            perm.shuffle(&mut self.rng);
            let take = (wanted - picked.len()).min(n);
            picked.extend_from_slice(&perm[..take]);
        }
        picked
    }

    fn plan(&mut self, index: usize) -> PatchPlan {
        let offsets = self
            .set
            .spatial_shape()
            .iter()
            .zip(&self.cfg.patch)
            .map(|(&size, &patch)| {
                if size == patch {
                    0
                } else {
                    self.rng.random_range(0..size - patch)
                }
            })
            .collect();
        let transform = self.policy.draw(&self.cfg.patch, &mut self.rng);
        PatchPlan {
            index,
            offsets,
            transform,
        }
    }
}

impl Iterator for PatchSampler<'_> {
    type Item = PatchBatch;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

fn extract(set: &SegmentationSet, patch: &[usize], plan: &PatchPlan) -> (ArrayD<f32>, ArrayD<f32>) {
    let crop = |arr: &ArrayD<f32>| {
        let sample = arr.index_axis(Axis(0), plan.index);
        let view = sample.slice_each_axis(|ax| {
            if ax.axis.index() == 0 {
                Slice::from(..)
            } else {
                let spatial = ax.axis.index() - 1;
                let start = plan.offsets[spatial];
                Slice::from(start..start + patch[spatial])
            }
        });
        plan.transform.apply(view)
    };
    (crop(&set.images), crop(&set.masks))
}

fn assemble(
    patches: Vec<(ArrayD<f32>, ArrayD<f32>)>,
    image_channels: usize,
    mask_channels: usize,
    patch: &[usize],
) -> PatchBatch {
    let shape = |channels: usize| {
        let mut dims = Vec::with_capacity(patch.len() + 2);
        dims.push(patches.len());
        dims.push(channels);
        dims.extend_from_slice(patch);
        IxDyn(&dims)
    };
    let mut images = ArrayD::<f32>::zeros(shape(image_channels));
    let mut masks = ArrayD::<f32>::zeros(shape(mask_channels));
    for (i, (img, msk)) in patches.iter().enumerate() {
        images.index_axis_mut(Axis(0), i).assign(img);
        masks.index_axis_mut(Axis(0), i).assign(msk);
    }
    PatchBatch { images, masks }
}

/// In-order, unaugmented batches over a whole set. The last batch may be short.
pub struct SequentialBatches<'a> {
    set: &'a SegmentationSet,
    batch_size: usize,
    cursor: usize,
}

impl<'a> SequentialBatches<'a> {
    pub fn new(set: &'a SegmentationSet, batch_size: usize) -> Self {
        Self {
            set,
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }
}

impl Iterator for SequentialBatches<'_> {
    type Item = PatchBatch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.set.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.set.len());
        let chunk = self.set.slice_samples(self.cursor..end);
        self.cursor = end;
        Some(PatchBatch {
            images: chunk.images,
            masks: chunk.masks,
        })
    }
}

pub fn iter_batches(set: &SegmentationSet, batch_size: usize) -> SequentialBatches<'_> {
    SequentialBatches::new(set, batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    /// Pixel value encodes sample, row and column so crops can be traced back.
    fn coded_set(samples: usize, h: usize, w: usize) -> SegmentationSet {
        let images = Array::from_shape_fn(IxDyn(&[samples, 1, h, w]), |idx| {
            (idx[0] * 10_000 + idx[2] * 100 + idx[3]) as f32
        });
        let masks = images.mapv(|v| v + 0.5);
        SegmentationSet::new(images, masks).unwrap()
    }

    fn cfg(batch_size: usize, patch: Vec<usize>, augment: bool) -> SamplerConfig {
        SamplerConfig {
            batch_size,
            patch,
            augment,
            seed: Some(42),
        }
    }

    #[test]
    fn batch_has_requested_shape() {
        let set = coded_set(5, 16, 12);
        let mut sampler = PatchSampler::new(&set, cfg(3, vec![8, 8], true)).unwrap();
        let batch = sampler.next_batch();
        assert_eq!(batch.images.shape(), &[3, 1, 8, 8]);
        assert_eq!(batch.masks.shape(), &[3, 1, 8, 8]);
    }

    #[test]
    fn crops_are_contiguous_windows_without_augmentation() {
        let set = coded_set(4, 16, 16);
        let mut sampler = PatchSampler::new(&set, cfg(4, vec![4, 4], false)).unwrap();
        let batch = sampler.next_batch();
        for sample in batch.images.axis_iter(Axis(0)) {
            let origin = sample[[0, 0, 0]];
            let (row0, col0) = (((origin as usize) % 10_000) / 100, (origin as usize) % 100);
            assert!(row0 < 12 && col0 < 12, "offset must stay below extent - patch");
            for r in 0..4 {
                for c in 0..4 {
                    assert_eq!(sample[[0, r, c]], origin + (r * 100 + c) as f32);
                }
            }
        }
    }

    #[test]
    fn masks_follow_images_through_augmentation() {
        let set = coded_set(6, 8, 8);
        let mut sampler = PatchSampler::new(&set, cfg(6, vec![8, 8], true)).unwrap();
        for _ in 0..10 {
            let batch = sampler.next_batch();
            let diff = &batch.masks - &batch.images;
            assert!(diff.iter().all(|d| (d - 0.5).abs() < 1e-4));
        }
        let stats = sampler.stats();
        assert_eq!(stats.batches, 10);
        assert_eq!(stats.samples, 60);
        assert!(stats.flips > 0);
        assert!(stats.rotations <= stats.flips);
    }

    #[test]
    fn full_extent_patch_uses_zero_offset() {
        let set = coded_set(2, 8, 8);
        let mut sampler = PatchSampler::new(&set, cfg(2, vec![8, 8], false)).unwrap();
        let batch = sampler.next_batch();
        for sample in batch.images.axis_iter(Axis(0)) {
            assert_eq!(sample[[0, 0, 0]] as usize % 10_000, 0);
        }
    }

    #[test]
    fn samples_are_distinct_within_a_batch() {
        let set = coded_set(8, 4, 4);
        let mut sampler = PatchSampler::new(&set, cfg(8, vec![4, 4], false)).unwrap();
        let batch = sampler.next_batch();
        let mut ids: Vec<usize> = batch
            .images
            .axis_iter(Axis(0))
            .map(|s| s[[0, 0, 0]] as usize / 10_000)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn small_sets_still_fill_the_batch() {
        let set = coded_set(2, 4, 4);
        let mut sampler = PatchSampler::new(&set, cfg(5, vec![4, 4], false)).unwrap();
        assert_eq!(sampler.next_batch().len(), 5);
    }

    #[test]
    fn seeded_samplers_agree() {
        let set = coded_set(5, 16, 16);
        let mut a = PatchSampler::new(&set, cfg(4, vec![8, 8], true)).unwrap();
        let mut b = PatchSampler::new(&set, cfg(4, vec![8, 8], true)).unwrap();
        for _ in 0..3 {
            assert_eq!(a.next_batch().images, b.next_batch().images);
        }
    }

    #[test]
    fn oversized_patch_is_rejected() {
        let set = coded_set(2, 8, 8);
        let err = PatchSampler::new(&set, cfg(1, vec![16, 8], false)).err();
        assert!(matches!(err, Some(BurnDatasetError::InvalidPatch(_))));
    }

    #[test]
    fn volumes_are_cropped_on_every_axis() {
        let images = ArrayD::<f32>::ones(IxDyn(&[3, 2, 8, 12, 12]));
        let masks = ArrayD::<f32>::zeros(IxDyn(&[3, 1, 8, 12, 12]));
        let set = SegmentationSet::new(images, masks).unwrap();
        let mut sampler = PatchSampler::new(&set, cfg(2, vec![4, 8, 8], true)).unwrap();
        let batch = sampler.next_batch();
        assert_eq!(batch.images.shape(), &[2, 2, 4, 8, 8]);
        assert_eq!(batch.masks.shape(), &[2, 1, 4, 8, 8]);
    }

    #[test]
    fn sequential_batches_cover_the_set_in_order() {
        let set = coded_set(5, 4, 4);
        let sizes: Vec<usize> = iter_batches(&set, 2).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let first = iter_batches(&set, 2).next().unwrap();
        assert_eq!(first.images[[1, 0, 0, 0]], 10_000.0);
    }
}
