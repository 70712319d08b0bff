// gpu/arena.rs — preallocated, fixed-capacity device and host buffers.
//
// One arena per pipeline instance. Every buffer is sized at construction
// from the keypoint capacity M and reused by every subsequent call; nothing
// here ever grows. Slots are addressed by index — callers never see raw
// device addresses.
//
// Two of everything per-image: the dual-image pipeline runs image A and
// image B on independent streams, and a buffer written by both streams
// would race. (Keypoint staging in particular is split per image for this
// reason.)
//
// Buffer inventory, for capacity M and frame size W×H:
//   keypoints   2 × M×4 f32      host staging Vec + device STORAGE
//   descriptors 2 × M×64 u32     device STORAGE
//   matches     2 × M i32        device STORAGE + persistent MAP_READ mirror
//   mask        64 f32           device STORAGE, immutable
//   table       2048×6 i32       device STORAGE, immutable
//   frame       2 × W×H u32 rgba, 2 × W×H f32 gray (+ MAP_READ mirror)
//
// The persistent MAP_READ mirrors replace per-call readback allocation;
// they are mapped only between the pipeline's join point and the end of
// the call, never while a submission that writes them is in flight.

use wgpu::util::DeviceExt;

use crate::detect::Keypoint;
use crate::gpu::device::{GpuDevice, GpuError};
use crate::table::{BitMask, SamplingTable, DESCRIPTOR_WORDS};

/// Selects the per-image half of the arena's paired buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageSlot {
    A = 0,
    B = 1,
}

/// Buffers whose size depends on the configured frame dimensions.
/// (Re)created by [`ScratchArena::set_image_size`].
pub struct FrameBuffers {
    pub width: u32,
    pub height: u32,
    /// Interleaved RGBA8, one u32 per pixel, little-endian r|g<<8|b<<16|a<<24.
    pub rgba: [wgpu::Buffer; 2],
    /// Grayscale, one f32 per pixel (raw 0..255 luma).
    pub gray: [wgpu::Buffer; 2],
    gray_staging: [wgpu::Buffer; 2],
}

/// All fixed-capacity scratch state for one pipeline instance.
pub struct ScratchArena {
    capacity: usize,
    kp_host: [Vec<f32>; 2],
    pub kp_dev: [wgpu::Buffer; 2],
    pub desc: [wgpu::Buffer; 2],
    pub matches: [wgpu::Buffer; 2],
    match_staging: [wgpu::Buffer; 2],
    pub mask_buf: wgpu::Buffer,
    pub table_buf: wgpu::Buffer,
    frame: Option<FrameBuffers>,
}

impl ScratchArena {
    /// Allocate every capacity-sized buffer and upload the immutable table
    /// and mask. Fails (rather than half-constructing) if any allocation
    /// is rejected by the device.
    pub fn new(
        gpu: &GpuDevice,
        capacity: usize,
        table: &SamplingTable,
        mask: &BitMask,
    ) -> Result<Self, GpuError> {
        assert!(capacity > 0, "keypoint capacity must be > 0");

        gpu.scoped("arena allocation", || {
            let storage = |label: &str, size: u64| {
                gpu.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(label),
                    size,
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_DST
                        | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                })
            };
            let staging = |label: &str, size: u64| {
                gpu.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(label),
                    size,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            };

            let kp_size = (capacity * 4 * 4) as u64;
            let desc_size = (capacity * DESCRIPTOR_WORDS * 4) as u64;
            let match_size = (capacity * 4) as u64;

            // wgpu zero-fills new buffers, which gives descriptor and match
            // slots their defined all-zero initial state.
            ScratchArena {
                capacity,
                kp_host: [vec![0.0; capacity * 4], vec![0.0; capacity * 4]],
                kp_dev: [storage("arena keypoints A", kp_size), storage("arena keypoints B", kp_size)],
                desc: [storage("arena descriptors A", desc_size), storage("arena descriptors B", desc_size)],
                matches: [storage("arena matches A", match_size), storage("arena matches B", match_size)],
                match_staging: [
                    staging("arena match staging A", match_size),
                    staging("arena match staging B", match_size),
                ],
                mask_buf: gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("arena mask"),
                    contents: bytemuck::cast_slice(mask.weights()),
                    usage: wgpu::BufferUsages::STORAGE,
                }),
                table_buf: gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("arena sampling table"),
                    contents: bytemuck::cast_slice(table.as_raw()),
                    usage: wgpu::BufferUsages::STORAGE,
                }),
                frame: None,
            }
        })
    }

    /// Keypoint capacity M.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// (Re)allocate the frame-sized buffers. Must be called before the
    /// first detection; calling it again replaces the buffers and
    /// invalidates any in-flight work — never call it while a pipeline
    /// call is active.
    pub fn set_image_size(&mut self, gpu: &GpuDevice, width: u32, height: u32) -> Result<(), GpuError> {
        let pixels = (width as u64) * (height as u64);
        let frame = gpu.scoped("frame allocation", || {
            let make = |label: &str, usage: wgpu::BufferUsages| {
                gpu.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(label),
                    size: pixels * 4,
                    usage,
                    mapped_at_creation: false,
                })
            };
            let dev = wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC;
            let map = wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST;
            FrameBuffers {
                width,
                height,
                rgba: [make("frame rgba A", dev), make("frame rgba B", dev)],
                gray: [make("frame gray A", dev), make("frame gray B", dev)],
                gray_staging: [make("frame gray staging A", map), make("frame gray staging B", map)],
            }
        })?;
        self.frame = Some(frame);
        Ok(())
    }

    /// Frame buffers, if `set_image_size` has been called.
    pub fn frame(&self) -> Option<&FrameBuffers> {
        self.frame.as_ref()
    }

    /// Stage a keypoint list into the slot's device buffer via the queue.
    /// Keypoints beyond capacity are dropped; returns the staged count.
    ///
    /// The write is queue-ordered: it lands before any command buffer
    /// submitted afterwards on the same queue.
    pub fn write_keypoints(
        &mut self,
        queue: &wgpu::Queue,
        slot: ImageSlot,
        keypoints: &[Keypoint],
    ) -> usize {
        let count = keypoints.len().min(self.capacity);
        let host = &mut self.kp_host[slot as usize];
        for (i, kp) in keypoints.iter().take(count).enumerate() {
            host[i * 4] = kp.x;
            host[i * 4 + 1] = kp.y;
            host[i * 4 + 2] = kp.scale;
            host[i * 4 + 3] = kp.angle;
        }
        if count > 0 {
            queue.write_buffer(
                &self.kp_dev[slot as usize],
                0,
                bytemuck::cast_slice(&host[..count * 4]),
            );
        }
        count
    }

    /// Enqueue the copy of a slot's match buffer into its staging mirror.
    /// Record this on the same stream as the match kernel so the copy
    /// observes the kernel's output.
    pub fn copy_matches_to_staging(&self, encoder: &mut wgpu::CommandEncoder, slot: ImageSlot) {
        encoder.copy_buffer_to_buffer(
            &self.matches[slot as usize],
            0,
            &self.match_staging[slot as usize],
            0,
            (self.capacity * 4) as u64,
        );
    }

    /// Read the first `count` match indices from a slot's staging mirror.
    ///
    /// Blocking map; call only after the stream that wrote the mirror has
    /// been joined.
    pub fn read_matches(&self, device: &wgpu::Device, slot: ImageSlot, count: usize) -> Vec<i32> {
        read_i32(device, &self.match_staging[slot as usize], count)
    }

    /// Enqueue the copy of a slot's grayscale buffer into its staging
    /// mirror (for the host-side detection bridge).
    pub fn copy_gray_to_staging(&self, encoder: &mut wgpu::CommandEncoder, slot: ImageSlot) {
        let frame = self.frame.as_ref().expect("set_image_size before frame copies");
        let size = (frame.width as u64) * (frame.height as u64) * 4;
        encoder.copy_buffer_to_buffer(
            &frame.gray[slot as usize],
            0,
            &frame.gray_staging[slot as usize],
            0,
            size,
        );
    }

    /// Read a slot's grayscale staging mirror. Blocking map; call only
    /// after the writing stream has been joined.
    pub fn read_gray(&self, device: &wgpu::Device, slot: ImageSlot) -> Vec<f32> {
        let frame = self.frame.as_ref().expect("set_image_size before frame reads");
        let pixels = (frame.width as usize) * (frame.height as usize);
        read_f32(device, &frame.gray_staging[slot as usize], pixels)
    }
}

fn read_mapped(device: &wgpu::Device, buffer: &wgpu::Buffer, bytes: usize) -> Vec<u8> {
    if bytes == 0 {
        return Vec::new();
    }
    let slice = buffer.slice(..bytes as u64);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        tx.send(r).ok();
    });
    device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .expect("map_async callback dropped")
        .expect("staging buffer map failed");
    let data = slice.get_mapped_range().to_vec();
    buffer.unmap();
    data
}

// pod_collect_to_vec rather than cast_slice: a Vec<u8> allocation carries
// no 4-byte alignment guarantee.
fn read_i32(device: &wgpu::Device, buffer: &wgpu::Buffer, count: usize) -> Vec<i32> {
    let bytes = read_mapped(device, buffer, count * 4);
    bytemuck::pod_collect_to_vec(&bytes)
}

fn read_f32(device: &wgpu::Device, buffer: &wgpu::Buffer, count: usize) -> Vec<f32> {
    let bytes = read_mapped(device, buffer, count * 4);
    bytemuck::pod_collect_to_vec(&bytes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
