use crate::error::{TrainError, TrainResult};
use burn::tensor::TensorData;
use burn::tensor::{backend::Backend, Tensor};
use burn_dataset::PatchBatch;
use ndarray::{ArrayD, IxDyn};

/// A batch on device: `[batch, channels, spatial...]`.
#[derive(Debug, Clone)]
pub struct CollatedBatch<B: Backend, const D: usize> {
    pub images: Tensor<B, D>,
    pub masks: Tensor<B, D>,
}

impl<B: Backend, const D: usize> CollatedBatch<B, D> {
    pub fn batch_size(&self) -> usize {
        self.images.dims()[0]
    }
}

/// Copies a host array onto the device; its rank must equal `D`.
pub fn array_to_tensor<B: Backend, const D: usize>(
    arr: &ArrayD<f32>,
    device: &B::Device,
) -> TrainResult<Tensor<B, D>> {
    if arr.ndim() != D {
        return Err(TrainError::Shape(format!(
            "expected a rank-{D} array, got shape {:?}",
            arr.shape()
        )));
    }
    let shape = arr.shape().to_vec();
    let values: Vec<f32> = arr.iter().copied().collect();
    Ok(Tensor::<B, D>::from_data(
        TensorData::new(values, shape),
        device,
    ))
}

pub fn tensor_to_array<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> TrainResult<ArrayD<f32>> {
    let dims = tensor.dims();
    let values = tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| TrainError::Tensor(format!("{e:?}")))?;
    ArrayD::from_shape_vec(IxDyn(&dims), values).map_err(|e| TrainError::Shape(e.to_string()))
}

pub fn collate<B: Backend, const D: usize>(
    batch: &PatchBatch,
    device: &B::Device,
) -> TrainResult<CollatedBatch<B, D>> {
    if batch.is_empty() {
        return Err(TrainError::Shape("empty batch".to_string()));
    }
    Ok(CollatedBatch {
        images: array_to_tensor(&batch.images, device)?,
        masks: array_to_tensor(&batch.masks, device)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use ndarray::Array;

    type B = NdArray<f32>;

    #[test]
    fn host_device_round_trip() {
        let arr = Array::from_shape_fn(IxDyn(&[2, 1, 3, 4]), |idx| (idx[0] * 100 + idx[2] * 10 + idx[3]) as f32);
        let t = array_to_tensor::<B, 4>(&arr, &Default::default()).unwrap();
        assert_eq!(t.dims(), [2, 1, 3, 4]);
        assert_eq!(tensor_to_array(t).unwrap(), arr);
    }

    #[test]
    fn rank_mismatch_is_rejected() {
        let arr = ArrayD::<f32>::zeros(IxDyn(&[2, 1, 3, 4, 5]));
        assert!(array_to_tensor::<B, 4>(&arr, &Default::default()).is_err());
    }

    #[test]
    fn empty_batch_fails_to_collate() {
        let batch = PatchBatch {
            images: ArrayD::zeros(IxDyn(&[0, 1, 4, 4])),
            masks: ArrayD::zeros(IxDyn(&[0, 1, 4, 4])),
        };
        assert!(collate::<B, 4>(&batch, &Default::default()).is_err());
    }
}
