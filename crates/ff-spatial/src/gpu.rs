//! wgpu compute backend for spatial operator evaluation.
//!
//! Device arrays are f32 storage buffers; results transfer back to host
//! f64 grids as the final step of each top-level computation. The backend
//! is created per computation and destroys its device on drop, so device
//! memory cannot accumulate across sequential frame renders.

use ff_expr::{BinaryOp, MathFunction};
use ff_grid::Grid;
use zerocopy::{Immutable, IntoBytes};

use crate::SpatialError;
use crate::backend::{Axis, Backend};

const WORKGROUP_SIZE: u32 = 64;

const SHADER_SOURCE: &str = r#"
struct ElementwiseParams {
    op: u32,
    len: u32,
}

struct GradientParams {
    rows: u32,
    cols: u32,
    axis: u32,
    _padding: u32,
}

@group(0) @binding(0) var<storage, read> in_a: array<f32>;
@group(0) @binding(1) var<storage, read> in_b: array<f32>;
@group(0) @binding(2) var<storage, read_write> out_data: array<f32>;
@group(0) @binding(3) var<uniform> ew: ElementwiseParams;

fn nan_f32() -> f32 {
    return bitcast<f32>(0x7FC00000u);
}

@compute @workgroup_size(64)
fn elementwise_main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= ew.len) {
        return;
    }
    let a = in_a[i];
    let b = in_b[i];
    var v: f32;
    switch ew.op {
        case 0u: { v = a + b; }
        case 1u: { v = a - b; }
        case 2u: { v = a * b; }
        case 3u: { v = a / b; }
        case 4u: { v = pow(a, b); }
        case 5u: { v = -a; }
        case 10u: { v = sin(a); }
        case 11u: { v = cos(a); }
        case 12u: { v = tan(a); }
        case 13u: { v = asin(a); }
        case 14u: { v = acos(a); }
        case 15u: { v = atan(a); }
        case 16u: { v = sinh(a); }
        case 17u: { v = cosh(a); }
        case 18u: { v = tanh(a); }
        case 19u: { v = exp(a); }
        case 20u: { v = log(a); }
        case 21u: { v = log(a) / log(10.0); }
        case 22u: { v = sqrt(a); }
        case 23u: { v = abs(a); }
        case 24u: { v = floor(a); }
        case 25u: { v = ceil(a); }
        case 26u: { v = round(a); }
        case 30u: { v = min(a, b); }
        case 31u: { v = max(a, b); }
        default: { v = nan_f32(); }
    }
    out_data[i] = v;
}

@group(0) @binding(0) var<storage, read> grad_field: array<f32>;
@group(0) @binding(1) var<storage, read> grad_coords: array<f32>;
@group(0) @binding(2) var<storage, read_write> grad_out: array<f32>;
@group(0) @binding(3) var<uniform> gp: GradientParams;

@compute @workgroup_size(64)
fn gradient_main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    let total = gp.rows * gp.cols;
    if (i >= total) {
        return;
    }
    let r = i / gp.cols;
    let c = i % gp.cols;

    var idx: u32;
    var n: u32;
    var stride: u32;
    if (gp.axis == 0u) {
        idx = c;
        n = gp.cols;
        stride = 1u;
    } else {
        idx = r;
        n = gp.rows;
        stride = gp.cols;
    }

    if (n < 2u) {
        grad_out[i] = nan_f32();
        return;
    }

    if (idx == 0u) {
        let j = i + stride;
        grad_out[i] = (grad_field[j] - grad_field[i]) / (grad_coords[j] - grad_coords[i]);
    } else if (idx == n - 1u) {
        let j = i - stride;
        grad_out[i] = (grad_field[i] - grad_field[j]) / (grad_coords[i] - grad_coords[j]);
    } else {
        let prev = i - stride;
        let next = i + stride;
        let h1 = grad_coords[i] - grad_coords[prev];
        let h2 = grad_coords[next] - grad_coords[i];
        grad_out[i] = -h2 / (h1 * (h1 + h2)) * grad_field[prev]
            + (h2 - h1) / (h1 * h2) * grad_field[i]
            + h1 / (h2 * (h1 + h2)) * grad_field[next];
    }
}
"#;

#[derive(Debug, IntoBytes, Immutable)]
#[repr(C)]
struct ElementwiseParams {
    op: u32,
    len: u32,
}

#[derive(Debug, IntoBytes, Immutable)]
#[repr(C)]
struct GradientParams {
    rows: u32,
    cols: u32,
    axis: u32,
    _padding: u32,
}

/// Device-resident field values.
pub struct GpuArray {
    buffer: wgpu::Buffer,
    rows: usize,
    cols: usize,
}

/// Backend executing element-wise operations and gradients on a wgpu
/// compute device.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    elementwise: wgpu::ComputePipeline,
    gradient: wgpu::ComputePipeline,
}

impl WgpuBackend {
    /// Build a context on the default adapter, or fail so the caller can
    /// fall back to the CPU path.
    pub fn new() -> Result<Self, SpatialError> {
        let instance = wgpu::Instance::default();
        let (device, queue) = pollster::block_on(async {
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions::default())
                .await
                .ok_or_else(|| SpatialError::Gpu("no compute adapter available".to_owned()))?;
            adapter
                .request_device(&wgpu::DeviceDescriptor::default(), None)
                .await
                .map_err(|error| SpatialError::Gpu(error.to_string()))
        })?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("fieldflow-spatial"),
            source: wgpu::ShaderSource::Wgsl(SHADER_SOURCE.into()),
        });
        let elementwise = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("elementwise"),
            layout: None,
            module: &shader,
            entry_point: Some("elementwise_main"),
            compilation_options: Default::default(),
            cache: None,
        });
        let gradient = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("gradient"),
            layout: None,
            module: &shader,
            entry_point: Some("gradient_main"),
            compilation_options: Default::default(),
            cache: None,
        });

        Ok(Self {
            device,
            queue,
            elementwise,
            gradient,
        })
    }

    fn storage_buffer(&self, label: &str, data: &[f32]) -> wgpu::Buffer {
        use wgpu::util::DeviceExt;
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: data.as_bytes(),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            })
    }

    fn output_buffer(&self, len: usize) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("out"),
            size: (len * std::mem::size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }

    fn uniform_buffer(&self, label: &str, contents: &[u8]) -> wgpu::Buffer {
        use wgpu::util::DeviceExt;
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    fn dispatch(
        &self,
        pipeline: &wgpu::ComputePipeline,
        bindings: [&wgpu::Buffer; 4],
        invocations: usize,
    ) {
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: bindings[0].as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: bindings[1].as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: bindings[2].as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: bindings[3].as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let groups = (invocations as u32).div_ceil(WORKGROUP_SIZE);
            pass.dispatch_workgroups(groups, 1, 1);
        }
        self.queue.submit([encoder.finish()]);
    }

    fn elementwise_op(
        &self,
        op: u32,
        left: &GpuArray,
        right: &GpuArray,
    ) -> Result<GpuArray, SpatialError> {
        if left.rows != right.rows || left.cols != right.cols {
            return Err(SpatialError::Gpu("device array shape mismatch".to_owned()));
        }
        let len = left.rows * left.cols;
        let out = self.output_buffer(len);
        let params = ElementwiseParams {
            op,
            len: len as u32,
        };
        let params_buf = self.uniform_buffer("ew-params", params.as_bytes());
        self.dispatch(
            &self.elementwise,
            [&left.buffer, &right.buffer, &out, &params_buf],
            len,
        );
        Ok(GpuArray {
            buffer: out,
            rows: left.rows,
            cols: left.cols,
        })
    }

    fn read_back(&self, array: &GpuArray) -> Result<Vec<f32>, SpatialError> {
        let len = array.rows * array.cols;
        let size = (len * std::mem::size_of::<f32>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        encoder.copy_buffer_to_buffer(&array.buffer, 0, &staging, 0, size);
        self.queue.submit([encoder.finish()]);

        let (tx, rx) = std::sync::mpsc::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| SpatialError::Gpu("map callback dropped".to_owned()))?
            .map_err(|error| SpatialError::Gpu(error.to_string()))?;

        let data = staging.slice(..).get_mapped_range();
        let values = data
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        drop(data);
        staging.unmap();
        Ok(values)
    }
}

impl Drop for WgpuBackend {
    fn drop(&mut self) {
        // release device memory pools at the end of each top-level
        // computation rather than letting them grow across renders
        self.device.destroy();
    }
}

fn math1_op(f: MathFunction) -> u32 {
    match f {
        MathFunction::Sin => 10,
        MathFunction::Cos => 11,
        MathFunction::Tan => 12,
        MathFunction::Asin => 13,
        MathFunction::Acos => 14,
        MathFunction::Atan => 15,
        MathFunction::Sinh => 16,
        MathFunction::Cosh => 17,
        MathFunction::Tanh => 18,
        MathFunction::Exp => 19,
        MathFunction::Log => 20,
        MathFunction::Log10 => 21,
        MathFunction::Sqrt => 22,
        MathFunction::Abs => 23,
        MathFunction::Floor => 24,
        MathFunction::Ceil => 25,
        MathFunction::Round => 26,
        MathFunction::Min | MathFunction::Max | MathFunction::Pow => u32::MAX,
    }
}

fn math2_op(f: MathFunction) -> u32 {
    match f {
        MathFunction::Min => 30,
        MathFunction::Max => 31,
        MathFunction::Pow => 4,
        _ => u32::MAX,
    }
}

impl Backend for WgpuBackend {
    type Array = GpuArray;

    fn upload(&self, grid: &Grid) -> Result<GpuArray, SpatialError> {
        let data: Vec<f32> = grid.data().iter().map(|&v| v as f32).collect();
        Ok(GpuArray {
            buffer: self.storage_buffer("field", &data),
            rows: grid.rows(),
            cols: grid.cols(),
        })
    }

    fn to_host(&self, array: &GpuArray) -> Result<Grid, SpatialError> {
        let values = self.read_back(array)?;
        let mut out = Grid::filled(array.rows, array.cols, 0.0);
        for r in 0..array.rows {
            for c in 0..array.cols {
                out.set(r, c, f64::from(values[r * array.cols + c]));
            }
        }
        Ok(out)
    }

    fn binary(&self, op: BinaryOp, left: &GpuArray, right: &GpuArray) -> Result<GpuArray, SpatialError> {
        let code = match op {
            BinaryOp::Add => 0,
            BinaryOp::Sub => 1,
            BinaryOp::Mul => 2,
            BinaryOp::Div => 3,
            BinaryOp::Pow => 4,
        };
        self.elementwise_op(code, left, right)
    }

    fn negate(&self, array: &GpuArray) -> Result<GpuArray, SpatialError> {
        self.elementwise_op(5, array, array)
    }

    fn math1(&self, f: MathFunction, array: &GpuArray) -> Result<GpuArray, SpatialError> {
        self.elementwise_op(math1_op(f), array, array)
    }

    fn math2(
        &self,
        f: MathFunction,
        left: &GpuArray,
        right: &GpuArray,
    ) -> Result<GpuArray, SpatialError> {
        self.elementwise_op(math2_op(f), left, right)
    }

    fn gradient(
        &self,
        field: &GpuArray,
        coords: &GpuArray,
        axis: Axis,
    ) -> Result<GpuArray, SpatialError> {
        if field.rows != coords.rows || field.cols != coords.cols {
            return Err(SpatialError::Gpu("device array shape mismatch".to_owned()));
        }
        let len = field.rows * field.cols;
        let out = self.output_buffer(len);
        let params = GradientParams {
            rows: field.rows as u32,
            cols: field.cols as u32,
            axis: match axis {
                Axis::X => 0,
                Axis::Y => 1,
            },
            _padding: 0,
        };
        let params_buf = self.uniform_buffer("grad-params", params.as_bytes());
        self.dispatch(
            &self.gradient,
            [&field.buffer, &coords.buffer, &out, &params_buf],
            len,
        );
        Ok(GpuArray {
            buffer: out,
            rows: field.rows,
            cols: field.cols,
        })
    }
}
