// gpu/stream.rs — ordered asynchronous execution streams.
//
// An `ExecutionStream` is an ordered queue of GPU work: submissions made
// through one stream execute in FIFO order relative to each other, and a
// caller can either block until the stream drains (`wait`) or register a
// one-shot completion callback (`on_done`). Work on two different streams
// has NO ordering guarantee at this API level — callers that read state
// produced on another stream must join explicitly first.
//
// MAPPING ONTO wgpu
// ──────────────────
// wgpu exposes one timeline queue per device, so a stream here is a
// completion frontier on that shared timeline: each stream remembers the
// `SubmissionIndex` of its own most recent submission, `wait` polls the
// device up to that index, and `on_done` hooks `on_submitted_work_done`.
// Per-stream FIFO holds because a stream's submissions are totally ordered
// on the queue. The queue additionally orders submissions *across* streams
// in submission order — stronger than the contract, and exactly the
// cross-stream visibility the descriptor→match handoff in the dual-image
// pipeline needs (it enqueues both descriptor passes before either match
// pass).
//
// CALLBACK DISCIPLINE
// ────────────────────
// `on_done` callbacks run on a detached poller thread, off the caller's
// stack, after all work submitted on the stream up to the registration
// point has finished. A callback runs exactly once. It must not block and
// must not re-enter the engine that scheduled it — the engine's buffers
// are only quiescent once the callback has returned.

use std::sync::{Arc, Mutex};

use crate::gpu::device::GpuDevice;

/// An ordered, independent queue of asynchronous GPU operations.
pub struct ExecutionStream {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    label: &'static str,
    /// Completion frontier: index of this stream's most recent submission.
    last: Mutex<Option<wgpu::SubmissionIndex>>,
}

impl ExecutionStream {
    pub fn new(gpu: &GpuDevice, label: &'static str) -> Self {
        ExecutionStream {
            device: gpu.device.clone(),
            queue: gpu.queue.clone(),
            label,
            last: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// The underlying queue, for staging writes (`write_buffer`). Staged
    /// writes happen-before any later submission on the same queue, so they
    /// order correctly with this stream's FIFO.
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Create a command encoder labelled for this stream.
    pub fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    /// Enqueue a finished command buffer. Returns immediately; the work
    /// runs asynchronously on the GPU timeline.
    pub fn submit(&self, commands: wgpu::CommandBuffer) -> wgpu::SubmissionIndex {
        let index = self.queue.submit(std::iter::once(commands));
        *self.last.lock().expect("submission-index lock poisoned") = Some(index.clone());
        index
    }

    /// Block the calling thread until every submission made through this
    /// stream has completed. Submissions on other streams are not waited
    /// for (beyond those the shared timeline has already ordered earlier).
    pub fn wait(&self) {
        let last = self.last.lock().expect("submission-index lock poisoned").clone();
        if let Some(index) = last {
            self.device
                .poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        }
    }

    /// Register a one-shot completion callback covering all work submitted
    /// on this stream up to this point.
    ///
    /// The callback is invoked exactly once, on a detached poller thread,
    /// after the covered work finishes. It must not block and must not
    /// re-enter the engine that scheduled the covered work.
    pub fn on_done(&self, callback: impl FnOnce() + Send + 'static) {
        self.queue.on_submitted_work_done(callback);
        // wgpu only delivers completion callbacks while the device is
        // polled; drive it from a detached thread so the caller's thread
        // stays free.
        let device = self.device.clone();
        std::thread::spawn(move || {
            device.poll(wgpu::Maintain::Wait);
        });
    }
}

impl std::fmt::Debug for ExecutionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExecutionStream({})", self.label)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
