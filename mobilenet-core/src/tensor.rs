use anyhow::{Context, Result};
use std::{fmt, sync::Arc};

use crate::layers::ShapedTensor;

/// Describes the dimensionality of a tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorShape {
    dims: Vec<usize>,
    elements: usize,
}

impl TensorShape {
    /// Create a tensor shape from the provided dimensions.
    pub fn new<D>(dims: D) -> Result<Self>
    where
        D: Into<Vec<usize>>,
    {
        let dims_vec = dims.into();
        anyhow::ensure!(
            !dims_vec.is_empty(),
            "tensor shape must have at least one dimension"
        );
        let mut elements = 1usize;
        for (idx, dim) in dims_vec.iter().enumerate() {
            anyhow::ensure!(
                *dim > 0,
                "dimension {idx} must be greater than zero (got {dim})"
            );
            elements = elements
                .checked_mul(*dim)
                .with_context(|| format!("tensor shape would overflow usize at dimension {idx}"))?;
        }
        Ok(Self {
            dims: dims_vec,
            elements,
        })
    }

    /// Total number of elements described by this shape.
    pub fn elements(&self) -> usize {
        self.elements
    }

    pub fn size_bytes(&self) -> u64 {
        (self.elements * std::mem::size_of::<f32>()) as u64
    }

    /// Returns the underlying dimensions.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }
}

impl From<TensorShape> for Vec<usize> {
    fn from(value: TensorShape) -> Self {
        value.dims
    }
}

/// Host-resident `f32` tensor.
///
/// The data sits behind an `Arc` so clones are cheap; the CPU executor keeps
/// block inputs alive for residual adds the same way GPU tensors do.
#[derive(Clone, PartialEq)]
pub struct HostTensor {
    shape: TensorShape,
    data: Arc<[f32]>,
}

impl HostTensor {
    pub fn new<D>(dims: D, data: Vec<f32>) -> Result<Self>
    where
        D: Into<Vec<usize>>,
    {
        let shape = TensorShape::new(dims)?;
        anyhow::ensure!(
            data.len() == shape.elements(),
            "tensor data has {} values but shape {:?} needs {}",
            data.len(),
            shape.dims(),
            shape.elements()
        );
        Ok(Self {
            shape,
            data: data.into(),
        })
    }

    pub fn filled<D>(dims: D, value: f32) -> Result<Self>
    where
        D: Into<Vec<usize>>,
    {
        let shape = TensorShape::new(dims)?;
        let data = vec![value; shape.elements()];
        Ok(Self {
            shape,
            data: data.into(),
        })
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.to_vec()
    }
}

impl ShapedTensor for HostTensor {
    fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    fn elements(&self) -> usize {
        self.shape.elements()
    }
}

impl fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTensor")
            .field("dims", &self.shape.dims())
            .finish()
    }
}
