//! Length masks and host read-back helpers for padded batches.

use anyhow::{anyhow, Result};
use burn::tensor::{backend::Backend, Bool, Int, Tensor, TensorData};

/// Bool mask `[batch, max_len]` that is `true` at padded positions (`t >= length`).
pub fn padding_mask<B: Backend>(
    lengths: &[usize],
    max_len: usize,
    device: &B::Device,
) -> Tensor<B, 2, Bool> {
    let values: Vec<bool> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| t >= len))
        .collect();
    Tensor::from_data(TensorData::new(values, [lengths.len(), max_len]), device)
}

/// Float mask `[batch, max_len]` holding 1.0 at valid positions and 0.0 at padding.
pub fn valid_mask<B: Backend>(
    lengths: &[usize],
    max_len: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let values: Vec<f32> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| if t < len { 1.0 } else { 0.0 }))
        .collect();
    Tensor::from_data(TensorData::new(values, [lengths.len(), max_len]), device)
}

/// Gather indices `[batch, max_len]` that reverse each row within its own length.
///
/// Positions past the length map to themselves so padding stays in place.
pub fn reverse_within_length_indices<B: Backend>(
    lengths: &[usize],
    max_len: usize,
    device: &B::Device,
) -> Tensor<B, 2, Int> {
    let values: Vec<i64> = lengths
        .iter()
        .flat_map(|&len| {
            let len = len.min(max_len);
            (0..max_len).map(move |t| if t < len { (len - 1 - t) as i64 } else { t as i64 })
        })
        .collect();
    Tensor::from_data(TensorData::new(values, [lengths.len(), max_len]), device)
}

/// Copy a float tensor back to the host as a flat `Vec<f32>`.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("failed to read tensor data: {e:?}"))
}

/// Read a one-element float tensor as `f32`.
pub fn tensor_to_scalar<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<f32> {
    let values = tensor_to_vec(tensor)?;
    match values.as_slice() {
        [value] => Ok(*value),
        other => Err(anyhow!("expected a single value, found {}", other.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn padding_mask_marks_positions_past_length() {
        let device = NdArrayDevice::default();
        let mask = padding_mask::<TestBackend>(&[3, 1], 4, &device);
        let values = mask.into_data().to_vec::<bool>().expect("bools");
        assert_eq!(
            values,
            vec![false, false, false, true, false, true, true, true]
        );
    }

    #[test]
    fn valid_mask_is_complement_of_padding() {
        let device = NdArrayDevice::default();
        let mask = valid_mask::<TestBackend>(&[2, 4], 4, &device);
        assert_eq!(
            tensor_to_vec(mask).expect("floats"),
            vec![1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]
        );
    }

    #[test]
    fn reverse_indices_leave_padding_in_place() {
        let device = NdArrayDevice::default();
        let indices = reverse_within_length_indices::<TestBackend>(&[3, 5], 5, &device);
        let values = indices.into_data().convert::<i64>().to_vec::<i64>().expect("ints");
        assert_eq!(values, vec![2, 1, 0, 3, 4, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn scalar_read_rejects_multiple_values() {
        let device = NdArrayDevice::default();
        let tensor = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0], &device);
        assert!(tensor_to_scalar(tensor).is_err());
        let single = Tensor::<TestBackend, 1>::from_floats([4.5], &device);
        assert_eq!(tensor_to_scalar(single).expect("scalar"), 4.5);
    }
}
