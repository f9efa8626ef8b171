use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Class id stored per pixel in label arrays.
pub type Label = i64;

pub type FloatArray = Array<f32>;
pub type LabelArray = Array<Label>;

#[derive(Debug, Error, PartialEq)]
pub enum ContractError {
    #[error("shape {shape:?} holds {expected} values, got {actual}")]
    ValueCount {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("cannot concatenate an empty list of {0}")]
    Empty(&'static str),
    #[error("field `{field}` has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        field: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("field `{0}` is present in some blobs but not in others")]
    PartialField(&'static str),
    #[error("blob has no `{0}` field")]
    MissingField(&'static str),
    #[error("array shape has no batch axis")]
    NoBatchAxis,
}

/// Dense row-major array with an explicit shape. Axis 0 is always the batch axis.
///
/// Deserialization goes through [`Array::new`], so the value count always matches the shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "RawArray<T>",
    bound(deserialize = "T: Clone + Deserialize<'de>")
)]
pub struct Array<T> {
    shape: Vec<usize>,
    values: Vec<T>,
}

#[derive(Deserialize)]
struct RawArray<T> {
    shape: Vec<usize>,
    values: Vec<T>,
}

impl<T: Clone> TryFrom<RawArray<T>> for Array<T> {
    type Error = ContractError;

    fn try_from(raw: RawArray<T>) -> Result<Self, Self::Error> {
        Array::new(raw.shape, raw.values)
    }
}

impl<T: Clone> Array<T> {
    pub fn new(shape: Vec<usize>, values: Vec<T>) -> Result<Self, ContractError> {
        if shape.is_empty() {
            return Err(ContractError::NoBatchAxis);
        }
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(ContractError::ValueCount {
                shape,
                expected,
                actual: values.len(),
            });
        }
        Ok(Self { shape, values })
    }

    pub fn filled(shape: Vec<usize>, value: T) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            values: vec![value; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn into_values(self) -> Vec<T> {
        self.values
    }

    pub fn batch(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Number of values per batch entry.
    pub fn sample_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    pub fn sample(&self, index: usize) -> &[T] {
        let len = self.sample_len();
        &self.values[index * len..(index + 1) * len]
    }

    pub fn reshape(self, shape: Vec<usize>) -> Result<Self, ContractError> {
        Self::new(shape, self.values)
    }

    /// Concatenate along the batch axis. Trailing dimensions must agree.
    pub fn concat(parts: &[&Array<T>], field: &'static str) -> Result<Self, ContractError> {
        let first = parts.first().ok_or(ContractError::Empty(field))?;
        let trailing = &first.shape[1..];
        let mut batch = 0;
        let mut values = Vec::with_capacity(parts.iter().map(|p| p.values.len()).sum());
        for part in parts {
            if &part.shape[1..] != trailing {
                return Err(ContractError::ShapeMismatch {
                    field,
                    expected: first.shape.clone(),
                    actual: part.shape.clone(),
                });
            }
            batch += part.batch();
            values.extend_from_slice(&part.values);
        }
        let mut shape = vec![batch];
        shape.extend_from_slice(trailing);
        Ok(Self { shape, values })
    }
}

/// One step's worth of aligned arrays exchanged between data source, cropper and network.
///
/// `data` is `(batch, *spatial, 1)`; `labels` and `weight` are `(batch, *spatial)`.
/// `crops`/`crops_labels` carry pre-cut patches from generators that crop on their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    pub data: FloatArray,
    pub labels: Option<LabelArray>,
    pub weight: Option<FloatArray>,
    pub crops: Option<FloatArray>,
    pub crops_labels: Option<LabelArray>,
}

impl Blob {
    pub fn new(data: FloatArray) -> Self {
        Self {
            data,
            labels: None,
            weight: None,
            crops: None,
            crops_labels: None,
        }
    }

    pub fn with_labels(mut self, labels: LabelArray) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_weight(mut self, weight: FloatArray) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.data.batch()
    }

    /// Shape every per-pixel field must have: `data` without its channel axis.
    pub fn pixel_shape(&self) -> Vec<usize> {
        let shape = self.data.shape();
        shape[..shape.len().saturating_sub(1)].to_vec()
    }

    /// Check that labels and weights line up with the image pixels.
    pub fn validate(&self) -> Result<(), ContractError> {
        let expected = self.pixel_shape();
        if let Some(labels) = &self.labels {
            check_shape("labels", &expected, labels.shape())?;
        }
        if let Some(weight) = &self.weight {
            check_shape("weight", &expected, weight.shape())?;
        }
        Ok(())
    }

    /// Join blobs along the batch axis.
    pub fn concat(blobs: &[Blob]) -> Result<Blob, ContractError> {
        if blobs.is_empty() {
            return Err(ContractError::Empty("blobs"));
        }
        let data: Vec<&FloatArray> = blobs.iter().map(|b| &b.data).collect();
        Ok(Blob {
            data: Array::concat(&data, "data")?,
            labels: concat_optional(blobs, "labels", |b| b.labels.as_ref())?,
            weight: concat_optional(blobs, "weight", |b| b.weight.as_ref())?,
            crops: concat_optional(blobs, "crops", |b| b.crops.as_ref())?,
            crops_labels: concat_optional(blobs, "crops_labels", |b| b.crops_labels.as_ref())?,
        })
    }

    /// Replace `data`/`labels` with the pre-cut `crops`/`crops_labels`, one crop per batch entry.
    pub fn promote_crops(mut self, crop_size: usize, dims: usize) -> Result<Blob, ContractError> {
        let crops = self.crops.clone().ok_or(ContractError::MissingField("crops"))?;
        let crops_labels = self
            .crops_labels
            .clone()
            .ok_or(ContractError::MissingField("crops_labels"))?;
        let crop_len = crop_size.pow(dims as u32);
        let count = crops.values().len() / crop_len.max(1);

        let mut pixel_shape = vec![count];
        pixel_shape.extend(std::iter::repeat(crop_size).take(dims));
        let mut image_shape = pixel_shape.clone();
        image_shape.push(1);

        self.data = crops.reshape(image_shape)?;
        self.labels = Some(crops_labels.reshape(pixel_shape)?);
        self.weight = None;
        Ok(self)
    }
}

fn check_shape(
    field: &'static str,
    expected: &[usize],
    actual: &[usize],
) -> Result<(), ContractError> {
    if expected != actual {
        return Err(ContractError::ShapeMismatch {
            field,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

fn concat_optional<T, F>(
    blobs: &[Blob],
    field: &'static str,
    get: F,
) -> Result<Option<Array<T>>, ContractError>
where
    T: Clone,
    F: Fn(&Blob) -> Option<&Array<T>>,
{
    let present: Vec<&Array<T>> = blobs.iter().filter_map(&get).collect();
    if present.is_empty() {
        return Ok(None);
    }
    if present.len() != blobs.len() {
        return Err(ContractError::PartialField(field));
    }
    Array::concat(&present, field).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(batch: usize, fill: f32) -> Blob {
        Blob::new(Array::filled(vec![batch, 2, 2, 1], fill))
            .with_labels(Array::filled(vec![batch, 2, 2], 1))
    }

    #[test]
    fn array_rejects_wrong_value_count() {
        let err = Array::new(vec![1, 2, 2], vec![0.0f32; 3]).unwrap_err();
        assert_eq!(
            err,
            ContractError::ValueCount {
                shape: vec![1, 2, 2],
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn concat_stacks_along_batch_axis() {
        let joined = Blob::concat(&[blob(1, 0.5), blob(2, 1.0)]).unwrap();
        assert_eq!(joined.data.shape(), &[3, 2, 2, 1]);
        assert_eq!(joined.labels.as_ref().unwrap().shape(), &[3, 2, 2]);
        assert_eq!(joined.data.sample(0), &[0.5; 4]);
        assert_eq!(joined.data.sample(2), &[1.0; 4]);
        assert!(joined.weight.is_none());
    }

    #[test]
    fn concat_rejects_partially_present_fields() {
        let with_weight = blob(1, 0.0).with_weight(Array::filled(vec![1, 2, 2], 1.0));
        let err = Blob::concat(&[with_weight, blob(1, 0.0)]).unwrap_err();
        assert_eq!(err, ContractError::PartialField("weight"));
    }

    #[test]
    fn validate_flags_label_shape_mismatch() {
        let bad = Blob::new(Array::filled(vec![1, 4, 4, 1], 0.0))
            .with_labels(Array::filled(vec![1, 2, 2], 0));
        assert!(matches!(
            bad.validate(),
            Err(ContractError::ShapeMismatch { field: "labels", .. })
        ));
    }

    #[test]
    fn promote_crops_flattens_patches_into_batch() {
        let mut source = blob(1, 0.0);
        source.crops = Some(Array::filled(vec![1, 4, 2, 2], 2.0));
        source.crops_labels = Some(Array::filled(vec![1, 4, 2, 2], 1));
        let promoted = source.promote_crops(2, 2).unwrap();
        assert_eq!(promoted.data.shape(), &[4, 2, 2, 1]);
        assert_eq!(promoted.labels.unwrap().shape(), &[4, 2, 2]);
    }
}
