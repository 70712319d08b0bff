// gpu/descriptor.rs — GPU descriptor extraction engine.
//
// Launches descriptor.wgsl over the staged keypoints of one image slot:
// one workgroup per keypoint, one thread per descriptor word. The call
// only enqueues — completion is observable through the target stream, not
// through the return value. Descriptor slots 0..count-1 of the arena are
// overwritten; slots at and beyond count are untouched.

use wgpu::util::DeviceExt;

use crate::descriptor::Descriptor;
use crate::gpu::arena::{ImageSlot, ScratchArena};
use crate::gpu::device::{GpuDevice, GpuError};
use crate::gpu::gray::{storage_binding, uniform_binding};
use crate::gpu::stream::ExecutionStream;
use crate::table::DESCRIPTOR_WORDS;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct DescParams {
    count: u32,
    width: u32,
    height: u32,
    _pad: u32,
}

/// GPU descriptor engine. Create once (compiles the shader); enqueue per
/// image.
pub struct GpuDescriptorEngine {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

impl GpuDescriptorEngine {
    pub fn new(gpu: &GpuDevice) -> Result<Self, GpuError> {
        gpu.scoped("descriptor pipeline", || {
            // Workgroup size is the word count of a descriptor and lives in
            // the shader source; no substitution needed.
            let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("descriptor.wgsl"),
                source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/descriptor.wgsl").into()),
            });

            let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuDescriptorEngine BGL"),
                entries: &[
                    storage_binding(0, true),  // gray
                    storage_binding(1, true),  // keypoints
                    storage_binding(2, true),  // sampling table
                    storage_binding(3, true),  // word mask
                    storage_binding(4, false), // descriptors out
                    uniform_binding(5),
                ],
            });

            let layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("GpuDescriptorEngine pipeline layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });

            let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("extract"),
                layout: Some(&layout),
                module: &shader,
                entry_point: "extract",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

            GpuDescriptorEngine { pipeline, bgl }
        })
    }

    /// Enqueue descriptor extraction for `count` staged keypoints of the
    /// slot, sampling the slot's grayscale buffer at the given dimensions.
    /// Non-blocking; the caller joins the stream when it needs the result.
    pub fn enqueue(
        &self,
        gpu: &GpuDevice,
        arena: &ScratchArena,
        stream: &ExecutionStream,
        slot: ImageSlot,
        width: u32,
        height: u32,
        count: usize,
    ) -> Result<(), GpuError> {
        if count == 0 {
            return Ok(());
        }
        let frame = arena.frame().expect("set_image_size before descriptor enqueue");

        gpu.scoped("descriptor enqueue", || {
            let params = DescParams {
                count: count as u32,
                width,
                height,
                _pad: 0,
            };
            let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("GpuDescriptorEngine params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

            let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("GpuDescriptorEngine BG"),
                layout: &self.bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: frame.gray[slot as usize].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: arena.kp_dev[slot as usize].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry { binding: 2, resource: arena.table_buf.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 3, resource: arena.mask_buf.as_entire_binding() },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: arena.desc[slot as usize].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry { binding: 5, resource: params_buf.as_entire_binding() },
                ],
            });

            let mut encoder = stream.encoder("GpuDescriptorEngine dispatch");
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("extract"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                // One workgroup per keypoint slot.
                pass.dispatch_workgroups(count as u32, 1, 1);
            }
            stream.submit(encoder.finish());
        })
    }

    /// Read `count` descriptors back from a slot. Expensive and blocking —
    /// stalls the GPU pipeline. Used by validation tests, never on the hot
    /// path (the match kernel consumes descriptors device-side).
    pub fn read_descriptors(
        &self,
        gpu: &GpuDevice,
        arena: &ScratchArena,
        slot: ImageSlot,
        count: usize,
    ) -> Vec<Descriptor> {
        if count == 0 {
            return Vec::new();
        }
        let bytes = (count * DESCRIPTOR_WORDS * 4) as u64;
        let readback = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuDescriptorEngine readback"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("GpuDescriptorEngine readback"),
            });
        encoder.copy_buffer_to_buffer(&arena.desc[slot as usize], 0, &readback, 0, bytes);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            tx.send(r).ok();
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .expect("map_async callback dropped")
            .expect("descriptor readback failed");

        let mapped = slice.get_mapped_range();
        let words: &[u32] = bytemuck::cast_slice(&mapped);
        let out = words
            .chunks_exact(DESCRIPTOR_WORDS)
            .map(|chunk| {
                let mut d = [0u32; DESCRIPTOR_WORDS];
                d.copy_from_slice(chunk);
                Descriptor(d)
            })
            .collect();
        drop(mapped);
        readback.unmap();
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
