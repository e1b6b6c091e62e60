use anyhow::{Context, Result, anyhow};
use bytemuck::cast_slice;
use mobilenet_utils::gpu::{GpuBufferPool, GpuContext};
use std::{
    fmt,
    sync::{Arc, mpsc},
};
use wgpu::util::DeviceExt;

use crate::layers::ShapedTensor;
use crate::tensor::TensorShape;

/// Wrapper around a GPU buffer representing an `f32` tensor.
///
/// Clones share the buffer. When the last handle drops, a pooled buffer goes
/// back to its [`GpuBufferPool`] for the next layer or the next pass.
pub struct GpuTensor {
    inner: Arc<GpuTensorInner>,
}

struct GpuTensorInner {
    context: Arc<GpuContext>,
    buffer: wgpu::Buffer,
    shape: TensorShape,
    size_bytes: u64,
    pool: Option<Arc<GpuBufferPool>>,
}

impl Drop for GpuTensorInner {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            // Best-fit reuse can hand out a larger buffer than the shape needs.
            pool.recycle(self.buffer.clone(), self.buffer.size(), tensor_usage());
        }
    }
}

impl GpuTensor {
    /// Upload host data into a GPU tensor. The data length must match the shape's element count.
    pub fn from_slice<D>(
        context: Arc<GpuContext>,
        dims: D,
        data: &[f32],
        label: Option<&str>,
    ) -> Result<Self>
    where
        D: Into<Vec<usize>>,
    {
        Self::from_slice_with_pool(context, None, dims, data, label)
    }

    /// Upload host data into a GPU tensor backed by the provided pool.
    pub fn from_slice_with_pool<D>(
        context: Arc<GpuContext>,
        pool: Option<Arc<GpuBufferPool>>,
        dims: D,
        data: &[f32],
        label: Option<&str>,
    ) -> Result<Self>
    where
        D: Into<Vec<usize>>,
    {
        let shape = TensorShape::new(dims)?;
        anyhow::ensure!(
            data.len() == shape.elements(),
            "tensor upload expected {} values, got {}",
            shape.elements(),
            data.len()
        );
        let size_bytes = shape.size_bytes();
        let usage = tensor_usage();
        let buffer = if let Some(pool_ref) = pool.as_ref() {
            let buffer = pool_ref.acquire(size_bytes, usage, label)?;
            context.queue().write_buffer(&buffer, 0, cast_slice(data));
            buffer
        } else {
            context
                .device()
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label,
                    contents: cast_slice(data),
                    usage,
                })
        };
        Ok(Self::from_parts(context, pool, buffer, shape, size_bytes))
    }

    /// Allocate a GPU tensor with undefined contents for the provided shape.
    pub fn uninitialized_with_pool<D>(
        context: Arc<GpuContext>,
        pool: Option<Arc<GpuBufferPool>>,
        dims: D,
        label: Option<&str>,
    ) -> Result<Self>
    where
        D: Into<Vec<usize>>,
    {
        let shape = TensorShape::new(dims)?;
        let size_bytes = shape.size_bytes();
        let usage = tensor_usage();
        let buffer = if let Some(pool_ref) = pool.as_ref() {
            pool_ref.acquire(size_bytes, usage, label)?
        } else {
            context.device().create_buffer(&wgpu::BufferDescriptor {
                label,
                size: size_bytes,
                usage,
                mapped_at_creation: false,
            })
        };
        Ok(Self::from_parts(context, pool, buffer, shape, size_bytes))
    }

    /// Overwrite the tensor contents. The data length must match the element count.
    pub fn write(&self, data: &[f32]) -> Result<()> {
        anyhow::ensure!(
            data.len() == self.shape().elements(),
            "write data length {} does not match tensor elements {}",
            data.len(),
            self.shape().elements()
        );
        self.context()
            .queue()
            .write_buffer(&self.inner.buffer, 0, cast_slice(data));
        Ok(())
    }

    /// Download the tensor contents back to the host.
    ///
    /// Waits for every submitted command that writes this tensor.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        let device = self.context().device();
        let size_bytes = self.inner.size_bytes;
        let usage = wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ;

        let readback = match &self.inner.pool {
            Some(pool) => pool.acquire(size_bytes, usage, Some("mobilenet_tensor_readback"))?,
            None => device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("mobilenet_tensor_readback"),
                size: size_bytes,
                usage,
                mapped_at_creation: false,
            }),
        };

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("mobilenet_tensor_readback_encoder"),
        });
        encoder.copy_buffer_to_buffer(self.buffer(), 0, &readback, 0, size_bytes);
        self.context().queue().submit(Some(encoder.finish()));

        let result = read_buffer(
            device,
            &readback,
            self.shape().elements(),
            "gpu tensor readback",
        );

        // `read_buffer` unmaps before returning, so the buffer is reusable.
        if let Some(pool) = &self.inner.pool {
            let capacity = readback.size();
            pool.recycle(readback, capacity, usage);
        }

        result
    }

    /// Returns the associated tensor shape.
    pub fn shape(&self) -> &TensorShape {
        &self.inner.shape
    }

    /// Returns the inner buffer for binding setups.
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.inner.buffer
    }

    /// Returns the tensor's GPU context (used for pointer equality checks).
    pub fn context(&self) -> &Arc<GpuContext> {
        &self.inner.context
    }

    fn from_parts(
        context: Arc<GpuContext>,
        pool: Option<Arc<GpuBufferPool>>,
        buffer: wgpu::Buffer,
        shape: TensorShape,
        size_bytes: u64,
    ) -> Self {
        let inner = GpuTensorInner {
            context,
            buffer,
            shape,
            size_bytes,
            pool,
        };
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl Clone for GpuTensor {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ShapedTensor for GpuTensor {
    fn dims(&self) -> &[usize] {
        self.shape().dims()
    }

    fn elements(&self) -> usize {
        self.shape().elements()
    }
}

impl fmt::Debug for GpuTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuTensor")
            .field("dims", &self.shape().dims())
            .finish()
    }
}

fn tensor_usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
}

fn read_buffer(
    device: &wgpu::Device,
    buffer: &wgpu::Buffer,
    elements: usize,
    label: &str,
) -> Result<Vec<f32>> {
    let size_bytes = (elements * std::mem::size_of::<f32>()) as u64;
    let slice = buffer.slice(0..size_bytes);
    let (sender, receiver) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device
        .poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        })
        .map_err(|e| anyhow!("device poll failed during {label}: {e}"))?;
    receiver
        .recv()
        .with_context(|| format!("{label} callback dropped"))?
        .map_err(|e| anyhow!("failed to map {label}: {e}"))?;

    let data = slice.get_mapped_range();
    let floats: Vec<f32> = cast_slice(&data).to_vec();
    drop(data);
    buffer.unmap();
    anyhow::ensure!(
        floats.len() == elements,
        "{label} returned {} elements, expected {}",
        floats.len(),
        elements
    );
    Ok(floats)
}
