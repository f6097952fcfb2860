//! Accelerator backend using wgpu.
//!
//! Each `WgpuBackend` binds one adapter. Fields are stored in f32 on the
//! device with an f64 interface on the host. wgpu exposes no cross-device
//! memory mapping, so adjacent workers always exchange through host memory.

use std::convert::Infallible;

use wgpu::util::DeviceExt;

use crate::error::{PoissonError, Result};

use super::backend::{DeviceField, FieldId, PeerEnable, StencilBackend};
use super::gpu_shaders;
use super::kernel::{self, KernelVariant, StencilParams, TILE};

const DIFF_WORKGROUP_SIZE: u32 = 256;
const MAX_DISPATCH: u32 = 65535;
/// Partial written by `max_abs_diff` for a NaN difference.
const DIVERGED: f32 = f32::MAX;

// Shader `Params` layout: five u32 followed by three f32, 32 bytes.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuParams {
    nx: u32,
    rows: u32,
    local_ny: u32,
    is_first: u32,
    is_last: u32,
    dx2: f32,
    dy2: f32,
    div_term: f32,
}

impl GpuParams {
    fn new(p: &StencilParams) -> Result<Self> {
        Ok(Self {
            nx: to_u32(p.nx)?,
            rows: to_u32(p.rows())?,
            local_ny: to_u32(p.local_ny)?,
            is_first: p.is_first as u32,
            is_last: p.is_last as u32,
            dx2: p.dx2 as f32,
            dy2: p.dy2 as f32,
            div_term: p.div_term as f32,
        })
    }
}

fn to_u32(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| PoissonError::Device(format!("dimension {n} exceeds u32")))
}

/// Device-resident f32 field.
pub struct WgpuField {
    id: FieldId,
    rows: usize,
    cols: usize,
    buffer: wgpu::Buffer,
}

impl WgpuField {
    fn row_offset(&self, row: usize, len: usize) -> Result<u64> {
        if row >= self.rows || len != self.cols {
            return Err(PoissonError::Device(format!(
                "row {row} (len {len}) out of bounds for {}x{} field {}",
                self.rows, self.cols, self.id
            )));
        }
        Ok((row * self.cols * std::mem::size_of::<f32>()) as u64)
    }

    fn len(&self) -> usize {
        self.rows * self.cols
    }
}

impl DeviceField for WgpuField {
    fn id(&self) -> FieldId {
        self.id
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }
}

/// One wgpu adapter with the stencil pipelines compiled.
pub struct WgpuBackend {
    ordinal: usize,
    info: wgpu::AdapterInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    reference_pipeline: wgpu::ComputePipeline,
    tiled_pipeline: wgpu::ComputePipeline,
    boundary_pipeline: wgpu::ComputePipeline,
    diff_pipeline: wgpu::ComputePipeline,
}

impl WgpuBackend {
    /// Bind the adapter at position `ordinal` in enumeration order.
    pub fn new(ordinal: usize) -> Result<Self> {
        pollster::block_on(Self::new_async(ordinal))
    }

    /// Number of adapters visible to this process.
    pub fn adapter_count() -> usize {
        Self::instance().enumerate_adapters(wgpu::Backends::all()).len()
    }

    fn instance() -> wgpu::Instance {
        wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        })
    }

    async fn new_async(ordinal: usize) -> Result<Self> {
        let adapter = Self::instance()
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .nth(ordinal)
            .ok_or_else(|| PoissonError::Device(format!("no GPU adapter at ordinal {ordinal}")))?;
        let info = adapter.get_info();

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("halopoisson_gpu"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await
            .map_err(|e| PoissonError::Device(format!("failed to get GPU device {ordinal}: {e}")))?;

        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("halopoisson_stencil"),
            source: wgpu::ShaderSource::Wgsl(gpu_shaders::STENCIL_SHADER_SOURCE.into()),
        });

        let make_pipeline = |entry_point: &str| -> wgpu::ComputePipeline {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: None,
                module: &shader_module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
        };

        let reference_pipeline = make_pipeline("stencil_reference");
        let tiled_pipeline = make_pipeline("stencil_tiled");
        let boundary_pipeline = make_pipeline("apply_boundary");
        let diff_pipeline = make_pipeline("max_abs_diff");

        tracing::info!(ordinal, adapter = %info.name, backend = ?info.backend, "GPU device ready");

        Ok(Self {
            ordinal,
            info,
            device,
            queue,
            reference_pipeline,
            tiled_pipeline,
            boundary_pipeline,
            diff_pipeline,
        })
    }

    fn params_buffer(&self, params: &StencilParams) -> Result<wgpu::Buffer> {
        let params = GpuParams::new(params)?;
        Ok(self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("stencil_params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        }))
    }

    fn check_shape(field: &WgpuField, params: &StencilParams) -> Result<()> {
        if field.rows != params.rows() || field.cols != params.nx {
            return Err(PoissonError::Device(format!(
                "field {} is {}x{}, stencil expects {}x{}",
                field.id,
                field.rows,
                field.cols,
                params.rows(),
                params.nx
            )));
        }
        Ok(())
    }

    /// Workgroups covering the local array in `TILE x TILE` blocks.
    fn tile_grid(params: &StencilParams) -> Result<(u32, u32)> {
        let x = to_u32(params.nx.div_ceil(TILE))?;
        let y = to_u32(params.rows().div_ceil(TILE))?;
        if x > MAX_DISPATCH || y > MAX_DISPATCH {
            return Err(PoissonError::Device(format!(
                "{}x{} local array exceeds the dispatch limit",
                params.rows(),
                params.nx
            )));
        }
        Ok((x, y))
    }

    fn dispatch(
        &self,
        pipeline: &wgpu::ComputePipeline,
        entries: &[wgpu::BindGroupEntry<'_>],
        groups: (u32, u32),
    ) {
        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &pipeline.get_bind_group_layout(0),
            entries,
        });
        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, Some(&bg), &[]);
            pass.dispatch_workgroups(groups.0, groups.1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
    }

    fn poll_wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map(|_| ())
            .map_err(|e| PoissonError::Device(format!("{}: {e}", self.name())))
    }

    /// Copy `count` f32 values starting at byte `offset` of `src` back to the host.
    fn read_buffer_f32(&self, src: &wgpu::Buffer, offset: u64, count: usize) -> Result<Vec<f32>> {
        let size = (count * std::mem::size_of::<f32>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("read_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(src, offset, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = sender.send(r);
        });
        self.poll_wait()?;
        receiver
            .recv()
            .map_err(|e| PoissonError::Device(format!("readback channel closed: {e}")))?
            .map_err(|e| PoissonError::Device(format!("readback failed: {e}")))?;

        let data = slice.get_mapped_range();
        let result: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(result)
    }
}

impl StencilBackend for WgpuBackend {
    type Field = WgpuField;
    type PeerView = Infallible;

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn name(&self) -> String {
        format!("gpu:{} ({})", self.ordinal, self.info.name)
    }

    fn alloc_field(&self, rows: usize, cols: usize) -> Result<WgpuField> {
        let bytes = rows
            .checked_mul(cols)
            .and_then(|n| n.checked_mul(std::mem::size_of::<f32>()))
            .ok_or_else(|| PoissonError::Device(format!("field size {rows}x{cols} overflows")))?
            as u64;
        let limits = self.device.limits();
        if bytes > limits.max_storage_buffer_binding_size as u64 || bytes > limits.max_buffer_size {
            return Err(PoissonError::Device(format!(
                "{rows}x{cols} field ({bytes} bytes) exceeds the storage limit of {}",
                self.name()
            )));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("field"),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(WgpuField {
            id: FieldId::next(),
            rows,
            cols,
            buffer,
        })
    }

    fn upload(&self, field: &WgpuField, data: &[f64]) -> Result<()> {
        if data.len() != field.len() {
            return Err(PoissonError::Device(format!(
                "upload of {} values into field {} of {}",
                data.len(),
                field.id,
                field.len()
            )));
        }
        let data_f32: Vec<f32> = data.iter().map(|&v| v as f32).collect();
        self.queue.write_buffer(&field.buffer, 0, bytemuck::cast_slice(&data_f32));
        Ok(())
    }

    fn download(&self, field: &WgpuField, out: &mut [f64]) -> Result<()> {
        if out.len() != field.len() {
            return Err(PoissonError::Device(format!(
                "download of field {} ({} values) into {}",
                field.id,
                field.len(),
                out.len()
            )));
        }
        let values = self.read_buffer_f32(&field.buffer, 0, field.len())?;
        for (dst, src) in out.iter_mut().zip(values) {
            *dst = src as f64;
        }
        Ok(())
    }

    fn read_row(&self, field: &WgpuField, row: usize, out: &mut [f64]) -> Result<()> {
        let offset = field.row_offset(row, out.len())?;
        let values = self.read_buffer_f32(&field.buffer, offset, field.cols)?;
        for (dst, src) in out.iter_mut().zip(values) {
            *dst = src as f64;
        }
        Ok(())
    }

    fn write_row(&self, field: &WgpuField, row: usize, data: &[f64]) -> Result<()> {
        let offset = field.row_offset(row, data.len())?;
        let data_f32: Vec<f32> = data.iter().map(|&v| v as f32).collect();
        self.queue.write_buffer(&field.buffer, offset, bytemuck::cast_slice(&data_f32));
        Ok(())
    }

    fn launch_stencil(
        &self,
        variant: KernelVariant,
        out: &WgpuField,
        prev: &WgpuField,
        source: &WgpuField,
        params: &StencilParams,
    ) -> Result<()> {
        if out.id == prev.id || out.id == source.id {
            return Err(PoissonError::Device(format!(
                "stencil launch: output field {} aliases an input",
                out.id
            )));
        }
        for field in [out, prev, source] {
            Self::check_shape(field, params)?;
        }
        let pipeline = match variant {
            KernelVariant::Reference => &self.reference_pipeline,
            KernelVariant::Tiled => &self.tiled_pipeline,
        };
        let params_buf = self.params_buffer(params)?;
        self.dispatch(
            pipeline,
            &[
                wgpu::BindGroupEntry { binding: 0, resource: out.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: prev.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: source.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: params_buf.as_entire_binding() },
            ],
            Self::tile_grid(params)?,
        );
        Ok(())
    }

    fn apply_boundary(&self, field: &WgpuField, params: &StencilParams) -> Result<()> {
        Self::check_shape(field, params)?;
        let params_buf = self.params_buffer(params)?;
        self.dispatch(
            &self.boundary_pipeline,
            &[
                wgpu::BindGroupEntry { binding: 0, resource: field.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: params_buf.as_entire_binding() },
            ],
            Self::tile_grid(params)?,
        );
        Ok(())
    }

    fn max_abs_diff(&self, a: &WgpuField, b: &WgpuField, params: &StencilParams) -> Result<f64> {
        if a.id == b.id {
            return Err(PoissonError::Device(format!(
                "convergence diff: both operands are field {}",
                a.id
            )));
        }
        Self::check_shape(a, params)?;
        Self::check_shape(b, params)?;

        let owned = to_u32(params.local_ny * params.nx)?;
        let groups = owned.div_ceil(DIFF_WORKGROUP_SIZE).clamp(1, MAX_DISPATCH);
        let partials_buf = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("diff_partials"),
            size: groups as u64 * std::mem::size_of::<f32>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let params_buf = self.params_buffer(params)?;
        self.dispatch(
            &self.diff_pipeline,
            &[
                wgpu::BindGroupEntry { binding: 0, resource: a.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: b.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: partials_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: params_buf.as_entire_binding() },
            ],
            (groups, 1),
        );

        let partials = self.read_buffer_f32(&partials_buf, 0, groups as usize)?;
        Ok(partials
            .into_iter()
            .map(|v| if v >= DIVERGED { f64::NAN } else { v as f64 })
            .fold(0.0, kernel::nan_max))
    }

    fn synchronize(&self) -> Result<()> {
        self.poll_wait()
    }

    fn can_access_peer(&self, _peer: &Self) -> bool {
        false
    }

    fn enable_peer_access(&self, peer: &Self) -> Result<PeerEnable> {
        Err(PoissonError::Device(format!(
            "{} cannot map memory of {}",
            self.name(),
            peer.name()
        )))
    }

    fn export_peer(&self, _field: &WgpuField) -> Option<Infallible> {
        None
    }

    fn copy_row_from_peer(
        &self,
        src: &Infallible,
        _src_row: usize,
        _dst: &WgpuField,
        _dst_row: usize,
    ) -> Result<()> {
        match *src {}
    }
}
