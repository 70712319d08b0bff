// gpu/matcher.rs — GPU brute-force Hamming match engine.
//
// Launches matcher.wgsl: one thread per source descriptor slot, each
// scanning every target descriptor. Writes best-target indices (or the
// sentinel -1) into the source slot's match buffer and enqueues the copy
// into its staging mirror, all on the caller's stream. Non-blocking — the
// host must join the stream before reading the mirror, and the mutual
// cross-check is undefined until both directions' streams are joined.

use wgpu::util::DeviceExt;

use crate::gpu::arena::{ImageSlot, ScratchArena};
use crate::gpu::device::{GpuDevice, GpuError, WORKGROUP_1D};
use crate::gpu::gray::{storage_binding, uniform_binding};
use crate::gpu::stream::ExecutionStream;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct MatchParams {
    count_a: u32,
    count_b: u32,
    threshold: u32,
    _pad: u32,
}

/// GPU match engine. Create once; enqueue once per direction per pair.
pub struct GpuMatchEngine {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

impl GpuMatchEngine {
    pub fn new(gpu: &GpuDevice) -> Result<Self, GpuError> {
        gpu.scoped("matcher pipeline", || {
            let shader_template = include_str!("../shaders/matcher.wgsl");
            let shader_src = shader_template.replace("{{WG_X}}", &WORKGROUP_1D.to_string());

            let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("matcher.wgsl"),
                source: wgpu::ShaderSource::Wgsl(shader_src.into()),
            });

            let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuMatchEngine BGL"),
                entries: &[
                    storage_binding(0, true),  // source descriptors
                    storage_binding(1, true),  // target descriptors
                    storage_binding(2, false), // best indices out
                    uniform_binding(3),
                ],
            });

            let layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("GpuMatchEngine pipeline layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });

            let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("match_all"),
                layout: Some(&layout),
                module: &shader,
                entry_point: "match_all",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

            GpuMatchEngine { pipeline, bgl }
        })
    }

    /// Enqueue matching of `source`'s descriptors against `target`'s, best
    /// indices landing in `source`'s match buffer (and its staging mirror).
    ///
    /// With `count_target == 0` every source slot receives the sentinel.
    /// With `count_source == 0` there is nothing to compute or read and the
    /// call is a no-op.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &self,
        gpu: &GpuDevice,
        arena: &ScratchArena,
        stream: &ExecutionStream,
        source: ImageSlot,
        target: ImageSlot,
        count_source: usize,
        count_target: usize,
        threshold: u32,
    ) -> Result<(), GpuError> {
        if count_source == 0 {
            return Ok(());
        }

        gpu.scoped("match enqueue", || {
            let params = MatchParams {
                count_a: count_source as u32,
                count_b: count_target as u32,
                threshold,
                _pad: 0,
            };
            let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("GpuMatchEngine params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

            let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("GpuMatchEngine BG"),
                layout: &self.bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: arena.desc[source as usize].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: arena.desc[target as usize].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: arena.matches[source as usize].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry { binding: 3, resource: params_buf.as_entire_binding() },
                ],
            });

            let mut encoder = stream.encoder("GpuMatchEngine dispatch");
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("match_all"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(gpu.dispatch_1d(count_source as u32), 1, 1);
            }
            arena.copy_matches_to_staging(&mut encoder, source);
            stream.submit(encoder.finish());
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
