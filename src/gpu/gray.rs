// gpu/gray.rs — color upload and GPU grayscale conversion.
//
// The pipeline's input frames are interleaved RGBA8; descriptor extraction
// and detection want single-channel intensity. Upload stages the raw bytes
// into the arena's per-slot RGBA buffer (one u32 per pixel — no row
// padding concerns, unlike texture uploads) and the compute pass writes
// BT.601 luma into the per-slot grayscale buffer, with a copy to the
// staging mirror so the host can bridge into detection.
//
// Validated against convert.rs::rgba_to_gray pixel-for-pixel.

use wgpu::util::DeviceExt;

use crate::gpu::arena::{ImageSlot, ScratchArena};
use crate::gpu::device::{GpuDevice, GpuError, WORKGROUP_2D};
use crate::gpu::stream::ExecutionStream;
use crate::image::ColorImage;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct GrayParams {
    width: u32,
    height: u32,
    _pad0: u32,
    _pad1: u32,
}

/// GPU grayscale converter. Create once; enqueue per frame.
pub struct GrayConverter {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

impl GrayConverter {
    pub fn new(gpu: &GpuDevice) -> Result<Self, GpuError> {
        gpu.scoped("grayscale pipeline", || {
            let shader_template = include_str!("../shaders/gray.wgsl");
            let shader_src = shader_template
                .replace("{{WG_X}}", &WORKGROUP_2D.0.to_string())
                .replace("{{WG_Y}}", &WORKGROUP_2D.1.to_string());

            let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("gray.wgsl"),
                source: wgpu::ShaderSource::Wgsl(shader_src.into()),
            });

            let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GrayConverter BGL"),
                entries: &[
                    storage_binding(0, true),
                    storage_binding(1, false),
                    uniform_binding(2),
                ],
            });

            let layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("GrayConverter pipeline layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });

            let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("to_gray"),
                layout: Some(&layout),
                module: &shader,
                entry_point: "to_gray",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

            GrayConverter { pipeline, bgl }
        })
    }

    /// Upload `img` into the slot's RGBA buffer and enqueue grayscale
    /// conversion plus the staging copy on `stream`. Non-blocking.
    ///
    /// `img` must not exceed the configured frame buffers; the pipeline
    /// enforces this before calling.
    pub fn enqueue(
        &self,
        gpu: &GpuDevice,
        arena: &ScratchArena,
        stream: &ExecutionStream,
        slot: ImageSlot,
        img: &ColorImage,
    ) -> Result<(), GpuError> {
        let frame = arena.frame().expect("set_image_size before grayscale enqueue");
        let width = img.width() as u32;
        let height = img.height() as u32;
        debug_assert!(width == frame.width && height <= frame.height);

        gpu.scoped("grayscale enqueue", || {
            stream
                .queue()
                .write_buffer(&frame.rgba[slot as usize], 0, img.as_bytes());

            let params = GrayParams { width, height, _pad0: 0, _pad1: 0 };
            let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("GrayConverter params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

            let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("GrayConverter BG"),
                layout: &self.bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: frame.rgba[slot as usize].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: frame.gray[slot as usize].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry { binding: 2, resource: params_buf.as_entire_binding() },
                ],
            });

            let (dx, dy) = gpu.dispatch_2d(width, height);
            let mut encoder = stream.encoder("GrayConverter dispatch");
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("to_gray"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(dx, dy, 1);
            }
            arena.copy_gray_to_staging(&mut encoder, slot);
            stream.submit(encoder.finish());
        })
    }
}

/// Shared by the sibling engines' bind group layouts.
pub(crate) fn storage_binding(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn uniform_binding(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert;
    use crate::image::Image;
    use crate::table::{BitMask, SamplingTable};

    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
            .output()
            .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_matches_cpu_reference() {
        // Pseudo-random RGBA frame.
        let mut rng = 424243u32;
        let mut img = ColorImage::new(96, 64);
        for y in 0..64 {
            for x in 0..96 {
                let mut px = [0u8; 4];
                for ch in px.iter_mut().take(3) {
                    rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
                    *ch = (rng >> 24) as u8;
                }
                px[3] = 255;
                img.set(x, y, px);
            }
        }

        let gpu = GpuDevice::new().unwrap();
        let table = SamplingTable::generate();
        let mask = BitMask::default();
        let mut arena = ScratchArena::new(&gpu, 4, &table, &mask).unwrap();
        arena.set_image_size(&gpu, 96, 64).unwrap();

        let converter = GrayConverter::new(&gpu).unwrap();
        let stream = ExecutionStream::new(&gpu, "test");
        converter.enqueue(&gpu, &arena, &stream, ImageSlot::A, &img).unwrap();
        stream.wait();

        let gray_f = arena.read_gray(&gpu.device, ImageSlot::A);
        let gpu_gray = convert::f32_raw_to_u8(&Image::from_vec(96, 64, gray_f));
        let cpu_gray = convert::rgba_to_gray(&img);

        for y in 0..64 {
            for x in 0..96 {
                let d = (gpu_gray.get(x, y) as i16 - cpu_gray.get(x, y) as i16).abs();
                assert!(d <= 1, "pixel ({x},{y}): gpu {} vs cpu {}", gpu_gray.get(x, y), cpu_gray.get(x, y));
            }
        }
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_gpu_matches_cpu_reference() {
        let out = run_gpu_test_in_subprocess("gpu::gray::tests::inner_gpu_matches_cpu_reference");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
