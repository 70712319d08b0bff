// gpu/pipeline.rs — the feature pipeline: detect → describe → match →
// cross-check, orchestrated over asynchronous streams.
//
// STAGE ALLOCATION
// ─────────────────
//   Stage                GPU or CPU   Stream
//   ──────────────────   ──────────   ───────────────────────────────
//   Upload + grayscale   GPU          per-image stream
//   Gray readback        GPU→CPU      self-join on the image's stream
//   Keypoint detection   CPU          (host, after the self-join)
//   Descriptor extract   GPU          per-image stream
//   Hamming matching     GPU          A→B on stream A, B→A on stream B
//   Cross-check          CPU          after joining BOTH streams
//
// The dual-image mode runs image A's stages on stream A and image B's on
// stream B with no cross-ordering except two join points: each stream
// self-joins after grayscale so the host detector can consume the frame,
// and both streams are joined before the cross-check, which is the only
// stage reading state from both. (On wgpu's single-timeline queue the
// descriptor→match handoff across slots is additionally ordered by
// submission order; see gpu/stream.rs.)
//
// SHARED-RESOURCE POLICY
// ───────────────────────
// All scratch state lives in one ScratchArena owned by this instance and
// is overwritten by every call: at most ONE pipeline call may be in flight
// per instance. Overlapping calls on the same instance race on the arena
// and produce undefined results — concurrent workloads need separate
// instances. The borrow checker enforces this for the synchronous entry
// points (&mut self); for the async mode it holds only until the
// completion callback has fired, which is the caller's responsibility.
//
// A mid-call launch failure poisons the instance: the arena's contents are
// treated as contaminated and every later call fails with `Poisoned` until
// the instance is rebuilt. The process is never torn down.

use std::time::Instant;

use crate::convert;
use crate::detect::{FeatureDetector, Keypoint};
use crate::gpu::arena::{ImageSlot, ScratchArena};
use crate::gpu::descriptor::GpuDescriptorEngine;
use crate::gpu::device::{GpuDevice, GpuError};
use crate::gpu::gray::GrayConverter;
use crate::gpu::matcher::GpuMatchEngine;
use crate::gpu::stream::ExecutionStream;
use crate::image::{ColorImage, Image};
use crate::matcher;
use crate::pipeline::{FrameStats, MatchedPairs, PairStats, PipelineConfig, PipelineError, TimingStats};
use crate::table::{BitMask, SamplingTable};

/// GPU feature pipeline.
///
/// Construction compiles all three compute pipelines and allocates the
/// full arena; it either returns a fully working instance or an error,
/// never a partially initialized one.
pub struct FeaturePipeline {
    config: PipelineConfig,
    detector: Box<dyn FeatureDetector + Send>,
    gray_engine: GrayConverter,
    desc_engine: GpuDescriptorEngine,
    match_engine: GpuMatchEngine,
    arena: ScratchArena,
    primary: ExecutionStream,
    stream_a: ExecutionStream,
    stream_b: ExecutionStream,
    size: Option<(u32, u32)>,
    poisoned: bool,
}

/// Per-image staging result: the clamped keypoint list whose descriptors
/// are (asynchronously) being written to the slot.
struct StagedImage {
    keypoints: Vec<Keypoint>,
    count: usize,
    detected: usize,
    t_gray: f64,
    t_detect: f64,
}

impl FeaturePipeline {
    /// Build a pipeline with the built-in FAST detector.
    pub fn new(gpu: &GpuDevice, config: PipelineConfig) -> Result<Self, PipelineError> {
        let detector = Box::new(config.detector());
        Self::with_detector(gpu, config, detector)
    }

    /// Build a pipeline around a caller-supplied detector.
    pub fn with_detector(
        gpu: &GpuDevice,
        config: PipelineConfig,
        detector: Box<dyn FeatureDetector + Send>,
    ) -> Result<Self, PipelineError> {
        let table = SamplingTable::generate();
        let mask = BitMask::default();

        let gray_engine = GrayConverter::new(gpu).map_err(PipelineError::Allocation)?;
        let desc_engine = GpuDescriptorEngine::new(gpu).map_err(PipelineError::Allocation)?;
        let match_engine = GpuMatchEngine::new(gpu).map_err(PipelineError::Allocation)?;
        let arena = ScratchArena::new(gpu, config.max_keypoints, &table, &mask)
            .map_err(PipelineError::Allocation)?;

        Ok(FeaturePipeline {
            detector,
            gray_engine,
            desc_engine,
            match_engine,
            arena,
            primary: ExecutionStream::new(gpu, "primary"),
            stream_a: ExecutionStream::new(gpu, "pair-a"),
            stream_b: ExecutionStream::new(gpu, "pair-b"),
            size: None,
            poisoned: false,
            config,
        })
    }

    /// Declare the frame dimensions and (re)allocate the frame buffers.
    ///
    /// Must precede the first processing call. Calling it again replaces
    /// the buffers and invalidates in-flight work — never call it while a
    /// pipeline call is active.
    pub fn set_image_size(
        &mut self,
        gpu: &GpuDevice,
        width: u32,
        height: u32,
    ) -> Result<(), PipelineError> {
        if self.poisoned {
            return Err(PipelineError::Poisoned);
        }
        self.arena
            .set_image_size(gpu, width, height)
            .map_err(PipelineError::Allocation)?;
        self.size = Some((width, height));
        eprintln!("[descry] image size set: {width} {height}");
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    fn check_frame(&self, img: &ColorImage) -> Result<(u32, u32), PipelineError> {
        if self.poisoned {
            return Err(PipelineError::Poisoned);
        }
        let size = self.size.ok_or(PipelineError::NotConfigured)?;
        let got = (img.width() as u32, img.height() as u32);
        if got != size {
            return Err(PipelineError::WrongImageSize {
                expected: (size.0 as usize, size.1 as usize),
                got: (img.width(), img.height()),
            });
        }
        Ok(size)
    }

    /// Mark the instance contaminated and convert the error.
    fn poison(&mut self, e: GpuError) -> PipelineError {
        self.poisoned = true;
        PipelineError::Launch(e)
    }

    // -----------------------------------------------------------------------
    // Single-image mode (synchronous)
    // -----------------------------------------------------------------------

    /// Detect keypoints and compute their descriptors into the arena's
    /// A slot, blocking until the stream drains.
    ///
    /// Returns the clamped keypoint list — slot i of the arena holds the
    /// descriptor of keypoint i — plus statistics (including the number of
    /// detections dropped by the capacity clamp).
    pub fn identify_feature_points(
        &mut self,
        gpu: &GpuDevice,
        img: &ColorImage,
    ) -> Result<(Vec<Keypoint>, FrameStats), PipelineError> {
        self.check_frame(img)?;
        let t_total = Instant::now();

        if let Err(e) = self
            .gray_engine
            .enqueue(gpu, &self.arena, &self.primary, ImageSlot::A, img)
        {
            return Err(self.poison(e));
        }
        let staged = match detect_and_describe(
            gpu,
            &mut self.arena,
            self.detector.as_mut(),
            &self.desc_engine,
            &self.primary,
            ImageSlot::A,
            img.width() as u32,
            img.height() as u32,
        ) {
            Ok(s) => s,
            Err(e) => return Err(self.poison(e)),
        };

        let t = Instant::now();
        self.primary.wait();
        let describe = t.elapsed().as_secs_f64();

        let timing = TimingStats {
            grayscale: staged.t_gray,
            detect: staged.t_detect,
            describe,
            matching: 0.0,
            total: t_total.elapsed().as_secs_f64(),
        };
        Ok((
            staged.keypoints,
            FrameStats {
                detected: staged.detected,
                dropped: staged.detected - staged.count,
                timing,
            },
        ))
    }

    // -----------------------------------------------------------------------
    // Single-image mode (asynchronous)
    // -----------------------------------------------------------------------

    /// Identical staging to [`identify_feature_points`], but instead of
    /// blocking on the descriptor pass, registers `on_done` to fire exactly
    /// once when all enqueued work for this call has completed.
    ///
    /// The callback runs on a completion context off the caller's stack:
    /// it must not block and must not re-enter this pipeline. Results must
    /// be read in or after the callback; nothing is returned here beyond
    /// staging errors.
    ///
    /// This mode executes on a stream of its own rather than the
    /// instance's primary stream, matching the behavior of the system this
    /// pipeline descends from (see DESIGN.md open questions).
    pub fn identify_feature_points_async(
        &mut self,
        gpu: &GpuDevice,
        img: &ColorImage,
        on_done: impl FnOnce(Vec<Keypoint>, FrameStats) + Send + 'static,
    ) -> Result<(), PipelineError> {
        self.check_frame(img)?;
        let t_total = Instant::now();

        let stream = ExecutionStream::new(gpu, "default");
        if let Err(e) = self
            .gray_engine
            .enqueue(gpu, &self.arena, &stream, ImageSlot::A, img)
        {
            return Err(self.poison(e));
        }
        // Detection still requires its host bridge — the self-join below is
        // part of staging, not of the completion the callback observes.
        let staged = match detect_and_describe(
            gpu,
            &mut self.arena,
            self.detector.as_mut(),
            &self.desc_engine,
            &stream,
            ImageSlot::A,
            img.width() as u32,
            img.height() as u32,
        ) {
            Ok(s) => s,
            Err(e) => return Err(self.poison(e)),
        };

        let stats = FrameStats {
            detected: staged.detected,
            dropped: staged.detected - staged.count,
            timing: TimingStats {
                grayscale: staged.t_gray,
                detect: staged.t_detect,
                describe: 0.0,
                matching: 0.0,
                total: t_total.elapsed().as_secs_f64(),
            },
        };
        let keypoints = staged.keypoints;
        stream.on_done(move || on_done(keypoints, stats));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dual-image matching mode
    // -----------------------------------------------------------------------

    /// Detect, describe, and mutually match a pair of images, running each
    /// image's stages on its own stream.
    ///
    /// The pair guard cross-checks widths only; a second image taller than
    /// the configured frame cannot be staged in the fixed buffers. Either
    /// way the result is an empty set — a mismatched pair is not an error.
    pub fn identify_feature_points_between_images(
        &mut self,
        gpu: &GpuDevice,
        img_a: &ColorImage,
        img_b: &ColorImage,
    ) -> Result<MatchedPairs, PipelineError> {
        let (_, height) = self.check_frame(img_a)?;
        if img_b.width() != img_a.width() || img_b.height() > height as usize {
            return Ok(MatchedPairs::empty());
        }

        let t_total = Instant::now();

        // Upload + grayscale for both images, each on its own stream,
        // before either self-join: the two conversions overlap.
        if let Err(e) = self
            .gray_engine
            .enqueue(gpu, &self.arena, &self.stream_a, ImageSlot::A, img_a)
        {
            return Err(self.poison(e));
        }
        if let Err(e) = self
            .gray_engine
            .enqueue(gpu, &self.arena, &self.stream_b, ImageSlot::B, img_b)
        {
            return Err(self.poison(e));
        }

        // Per-stream self-join → host detection → descriptor enqueue.
        let staged_a = match detect_and_describe(
            gpu,
            &mut self.arena,
            self.detector.as_mut(),
            &self.desc_engine,
            &self.stream_a,
            ImageSlot::A,
            img_a.width() as u32,
            img_a.height() as u32,
        ) {
            Ok(s) => s,
            Err(e) => return Err(self.poison(e)),
        };
        let staged_b = match detect_and_describe(
            gpu,
            &mut self.arena,
            self.detector.as_mut(),
            &self.desc_engine,
            &self.stream_b,
            ImageSlot::B,
            img_b.width() as u32,
            img_b.height() as u32,
        ) {
            Ok(s) => s,
            Err(e) => return Err(self.poison(e)),
        };

        // Both descriptor passes are enqueued; now match in both
        // directions, one direction per stream.
        let threshold = self.config.match_threshold;
        let t_match = Instant::now();
        if let Err(e) = self.match_engine.enqueue(
            gpu,
            &self.arena,
            &self.stream_a,
            ImageSlot::A,
            ImageSlot::B,
            staged_a.count,
            staged_b.count,
            threshold,
        ) {
            return Err(self.poison(e));
        }
        if let Err(e) = self.match_engine.enqueue(
            gpu,
            &self.arena,
            &self.stream_b,
            ImageSlot::B,
            ImageSlot::A,
            staged_b.count,
            staged_a.count,
            threshold,
        ) {
            return Err(self.poison(e));
        }

        // Mandatory join: the cross-check reads both match arrays.
        self.stream_a.wait();
        self.stream_b.wait();

        let forward = self.arena.read_matches(&gpu.device, ImageSlot::A, staged_a.count);
        let backward = self.arena.read_matches(&gpu.device, ImageSlot::B, staged_b.count);
        let correspondences = matcher::cross_check(&forward, &backward);
        let matching = t_match.elapsed().as_secs_f64();

        let keypoints_a = correspondences
            .iter()
            .map(|c| staged_a.keypoints[c.source])
            .collect();
        let keypoints_b = correspondences
            .iter()
            .map(|c| staged_b.keypoints[c.target])
            .collect();

        Ok(MatchedPairs {
            keypoints_a,
            keypoints_b,
            correspondences,
            stats: PairStats {
                detected_a: staged_a.detected,
                detected_b: staged_b.detected,
                dropped_a: staged_a.detected - staged_a.count,
                dropped_b: staged_b.detected - staged_b.count,
                timing: TimingStats {
                    grayscale: staged_a.t_gray + staged_b.t_gray,
                    detect: staged_a.t_detect + staged_b.t_detect,
                    describe: 0.0,
                    matching,
                    total: t_total.elapsed().as_secs_f64(),
                },
            },
        })
    }
}

/// Join the stream for the slot's grayscale result, run host detection,
/// stage the clamped keypoints, and enqueue descriptor extraction.
///
/// Free function over disjoint pipeline fields so the callers can hold
/// their stream references alongside the mutable arena/detector borrows.
#[allow(clippy::too_many_arguments)]
fn detect_and_describe(
    gpu: &GpuDevice,
    arena: &mut ScratchArena,
    detector: &mut (dyn FeatureDetector + Send),
    desc_engine: &GpuDescriptorEngine,
    stream: &ExecutionStream,
    slot: ImageSlot,
    width: u32,
    height: u32,
) -> Result<StagedImage, GpuError> {
    // Self-join: the detector consumes the grayscale frame on the host.
    let t = Instant::now();
    stream.wait();
    let gray = gray_image(arena, gpu, slot, width as usize, height as usize);
    let t_gray = t.elapsed().as_secs_f64();

    let t = Instant::now();
    let mut keypoints = detector.detect(&gray);
    let t_detect = t.elapsed().as_secs_f64();

    let detected = keypoints.len();
    let count = arena.write_keypoints(stream.queue(), slot, &keypoints);
    keypoints.truncate(count);

    desc_engine.enqueue(gpu, arena, stream, slot, width, height, count)?;
    Ok(StagedImage { keypoints, count, detected, t_gray, t_detect })
}

/// Assemble the host grayscale frame from the slot's staging mirror.
/// The mirror holds full configured-frame rows; a shorter image reads only
/// its leading rows.
fn gray_image(
    arena: &ScratchArena,
    gpu: &GpuDevice,
    slot: ImageSlot,
    width: usize,
    height: usize,
) -> Image<u8> {
    let raw = arena.read_gray(&gpu.device, slot);
    let luma = Image::from_vec(width, height, raw[..width * height].to_vec());
    convert::f32_raw_to_u8(&luma)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
