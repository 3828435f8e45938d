//! Reading training/test splits from `.npz` archives and writing predictions.
//!
//! On disk arrays are channels-last (`[samples, spatial..., channels]`), the
//! layout produced by the preprocessing scripts. In memory everything is
//! channels-first to match Burn's convolution layout.

use crate::types::{BurnDatasetError, DatasetResult, DatasetSplits, SegmentationSet};
use ndarray::{ArrayD, Axis, IxDyn, Slice};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError};
use std::fs::File;
use std::path::Path;

pub const IMAGES_TRAIN: &str = "images_train";
pub const MASKS_TRAIN: &str = "masks_train";
pub const IMAGES_TEST: &str = "images_test";
pub const MASKS_TEST: &str = "masks_test";

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// 2 for images, 3 for volumes.
    pub spatial_dims: usize,
    /// Keep only the first `n` image channels.
    pub num_input_channels: Option<usize>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            spatial_dims: 2,
            num_input_channels: None,
        }
    }
}

/// Loads both splits from one archive.
pub fn load_splits(path: &Path, opts: &LoadOptions) -> DatasetResult<DatasetSplits> {
    let file = File::open(path).map_err(|source| BurnDatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut npz = NpzReader::new(file).map_err(|source| npz_err(path, source))?;

    let train = load_set(&mut npz, path, IMAGES_TRAIN, MASKS_TRAIN, opts)?;
    let test = load_set(&mut npz, path, IMAGES_TEST, MASKS_TEST, opts)?;
    tracing::debug!(
        path = %path.display(),
        train = train.len(),
        test = test.len(),
        "loaded segmentation splits"
    );
    Ok(DatasetSplits { train, test })
}

fn load_set(
    npz: &mut NpzReader<File>,
    path: &Path,
    images_key: &str,
    masks_key: &str,
    opts: &LoadOptions,
) -> DatasetResult<SegmentationSet> {
    let images = read_array(npz, path, images_key, true)?;
    let masks = read_array(npz, path, masks_key, false)?;

    let mut images = to_channels_first(images, opts.spatial_dims, images_key)?;
    let masks = to_channels_first(masks, opts.spatial_dims, masks_key)?;

    if let Some(keep) = opts.num_input_channels {
        let available = images.shape()[1];
        if keep == 0 || keep > available {
            return Err(BurnDatasetError::Shape(format!(
                "{images_key}: requested {keep} input channels, archive has {available}"
            )));
        }
        if keep < available {
            images = images
                .slice_axis(Axis(1), Slice::from(0..keep))
                .to_owned();
        }
    }

    SegmentationSet::new(images, masks)
}

fn npz_err(path: &Path, source: ReadNpzError) -> BurnDatasetError {
    BurnDatasetError::NpzRead {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads `key` (with or without the `.npy` suffix numpy adds) as f32.
/// f64 and u8 arrays are converted; u8 images are scaled to [0, 1].
fn read_array(
    npz: &mut NpzReader<File>,
    path: &Path,
    key: &str,
    scale_u8: bool,
) -> DatasetResult<ArrayD<f32>> {
    let names = npz.names().map_err(|source| npz_err(path, source))?;
    let with_ext = format!("{key}.npy");
    let Some(entry) = names
        .iter()
        .find(|name| name.as_str() == key || name.as_str() == with_ext)
        .cloned()
    else {
        return Err(BurnDatasetError::MissingArray {
            path: path.to_path_buf(),
            name: key.to_string(),
            available: names,
        });
    };

    let first_err = match npz.by_name::<ndarray::OwnedRepr<f32>, IxDyn>(&entry) {
        Ok(arr) => return Ok(arr),
        Err(e) => e,
    };
    if let Ok(arr) = npz.by_name::<ndarray::OwnedRepr<f64>, IxDyn>(&entry) {
        return Ok(arr.mapv(|v| v as f32));
    }
    if let Ok(arr) = npz.by_name::<ndarray::OwnedRepr<u8>, IxDyn>(&entry) {
        let scale = if scale_u8 { 1.0 / 255.0 } else { 1.0 };
        return Ok(arr.mapv(|v| v as f32 * scale));
    }
    Err(npz_err(path, first_err))
}

/// `[N, spatial..., C]` (or `[N, spatial...]`) to `[N, C, spatial...]`.
pub fn to_channels_first(
    arr: ArrayD<f32>,
    spatial_dims: usize,
    name: &str,
) -> DatasetResult<ArrayD<f32>> {
    let rank = arr.ndim();
    if rank == spatial_dims + 1 {
        return Ok(arr.insert_axis(Axis(1)));
    }
    if rank != spatial_dims + 2 {
        return Err(BurnDatasetError::Shape(format!(
            "{name}: expected rank {} or {} for {spatial_dims} spatial dims, got shape {:?}",
            spatial_dims + 1,
            spatial_dims + 2,
            arr.shape()
        )));
    }
    let mut perm = Vec::with_capacity(rank);
    perm.push(0);
    perm.push(rank - 1);
    perm.extend(1..rank - 1);
    Ok(arr
        .permuted_axes(IxDyn(&perm))
        .as_standard_layout()
        .into_owned())
}

/// `[N, C, spatial...]` back to `[N, spatial..., C]`.
pub fn to_channels_last(arr: &ArrayD<f32>) -> ArrayD<f32> {
    let rank = arr.ndim();
    let mut perm = Vec::with_capacity(rank);
    perm.push(0);
    perm.extend(2..rank);
    perm.push(1);
    arr.view()
        .permuted_axes(IxDyn(&perm))
        .as_standard_layout()
        .into_owned()
}

/// Writes channels-first predictions as a channels-last `.npy` file.
pub fn write_predictions(path: &Path, predictions: &ArrayD<f32>) -> DatasetResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| BurnDatasetError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let out = to_channels_last(predictions);
    ndarray_npy::write_npy(path, &out).map_err(|source| BurnDatasetError::NpyWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes both splits in the on-disk layout [`load_splits`] expects.
pub fn write_splits(path: &Path, splits: &DatasetSplits) -> DatasetResult<()> {
    let file = File::create(path).map_err(|source| BurnDatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let write_err = |source| BurnDatasetError::NpzWrite {
        path: path.to_path_buf(),
        source,
    };
    let mut npz = NpzWriter::new(file);
    for (key, arr) in [
        (IMAGES_TRAIN, &splits.train.images),
        (MASKS_TRAIN, &splits.train.masks),
        (IMAGES_TEST, &splits.test.images),
        (MASKS_TEST, &splits.test.masks),
    ] {
        npz.add_array(key, &to_channels_last(arr))
            .map_err(write_err)?;
    }
    npz.finish().map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn channels_round_trip_preserves_values() {
        let arr = Array::from_shape_fn(IxDyn(&[2, 3, 4, 5]), |idx| {
            (idx[0] * 1000 + idx[1] * 100 + idx[2] * 10 + idx[3]) as f32
        });
        let first = to_channels_first(arr.clone(), 2, "x").unwrap();
        assert_eq!(first.shape(), &[2, 5, 3, 4]);
        assert_eq!(first[[1, 4, 2, 3]], arr[[1, 2, 3, 4]]);
        assert_eq!(to_channels_last(&first), arr);
    }

    #[test]
    fn missing_channel_axis_is_inserted() {
        let arr = ArrayD::<f32>::zeros(IxDyn(&[4, 8, 8]));
        let first = to_channels_first(arr, 2, "masks").unwrap();
        assert_eq!(first.shape(), &[4, 1, 8, 8]);
    }

    #[test]
    fn wrong_rank_is_rejected() {
        let arr = ArrayD::<f32>::zeros(IxDyn(&[4, 8]));
        assert!(matches!(
            to_channels_first(arr, 2, "images"),
            Err(BurnDatasetError::Shape(_))
        ));
    }
}
