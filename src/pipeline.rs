// pipeline.rs — shared pipeline types and the CPU reference orchestrator.
//
// `ReferencePipeline` runs the full detect → describe → match → cross-check
// flow synchronously on the host with the same clamping, guard, and
// tie-break semantics as `gpu::pipeline::FeaturePipeline`. The GPU pipeline
// is validated against it, and the property tests in tests/ exercise the
// shared semantics here where no GPU is needed.

use std::fmt;
use std::time::Instant;

use crate::convert;
use crate::descriptor::{Descriptor, DescriptorExtractor};
use crate::detect::{FastDetector, FeatureDetector, Keypoint};
use crate::image::ColorImage;
use crate::matcher::{self, Correspondence, MatcherConfig};
use crate::table::{BitMask, SamplingTable};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for both the reference and the GPU pipeline.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Fixed keypoint capacity M. Detections beyond M are dropped, never
    /// reallocated for.
    pub max_keypoints: usize,
    /// Hamming acceptance threshold (strict less-than).
    pub match_threshold: u32,
    /// FAST intensity threshold.
    pub detect_threshold: u8,
    /// FAST arc length (9..=12).
    pub arc_length: usize,
    /// NMS grid cell size in pixels.
    pub nms_cell: usize,
    /// Optional detection-count target; the detector adapts its threshold
    /// between calls to steer into `target ± tolerance`.
    pub target_keypoints: Option<usize>,
    pub target_tolerance: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_keypoints: 512,
            match_threshold: 12,
            detect_threshold: 20,
            arc_length: 9,
            nms_cell: 16,
            target_keypoints: None,
            target_tolerance: 200,
        }
    }
}

impl PipelineConfig {
    /// Build the detector this configuration describes.
    pub fn detector(&self) -> FastDetector {
        let det = FastDetector::new(self.detect_threshold, self.arc_length, self.nms_cell);
        match self.target_keypoints {
            Some(target) => det.with_target_count(target, self.target_tolerance),
            None => det,
        }
    }

    pub fn matcher(&self) -> MatcherConfig {
        MatcherConfig::new().with_threshold(self.match_threshold)
    }
}

// ---------------------------------------------------------------------------
// Results and statistics
// ---------------------------------------------------------------------------

/// Per-stage wall-clock timings in seconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimingStats {
    pub grayscale: f64,
    pub detect: f64,
    pub describe: f64,
    pub matching: f64,
    pub total: f64,
}

impl fmt::Display for TimingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gray {:.2}ms | detect {:.2}ms | describe {:.2}ms | match {:.2}ms | total {:.2}ms",
            self.grayscale * 1e3,
            self.detect * 1e3,
            self.describe * 1e3,
            self.matching * 1e3,
            self.total * 1e3,
        )
    }
}

/// Statistics for a single-image call.
///
/// `dropped` reports detections discarded by the capacity clamp — the
/// overflow is observable here rather than silent.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameStats {
    pub detected: usize,
    pub dropped: usize,
    pub timing: TimingStats,
}

/// Statistics for a dual-image call.
#[derive(Clone, Copy, Debug, Default)]
pub struct PairStats {
    pub detected_a: usize,
    pub detected_b: usize,
    pub dropped_a: usize,
    pub dropped_b: usize,
    pub timing: TimingStats,
}

/// Result of a dual-image call: the accepted keypoint pairs plus the slot
/// index pairs they came from. `correspondences[k]` indexes into the
/// *clamped per-image keypoint lists* (slot order), and `keypoints_a[k]` /
/// `keypoints_b[k]` are the keypoints at those slots.
#[derive(Clone, Debug, Default)]
pub struct MatchedPairs {
    pub keypoints_a: Vec<Keypoint>,
    pub keypoints_b: Vec<Keypoint>,
    pub correspondences: Vec<Correspondence>,
    pub stats: PairStats,
}

impl MatchedPairs {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.correspondences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.correspondences.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Pipeline-level failures. Dimension mismatch between a pair of images is
/// deliberately NOT here — it fast-fails to an empty [`MatchedPairs`].
#[derive(Debug)]
pub enum PipelineError {
    /// `set_image_size` has not been called.
    NotConfigured,
    /// The frame does not match the configured dimensions.
    WrongImageSize {
        expected: (usize, usize),
        got: (usize, usize),
    },
    /// Construction-time GPU allocation failed; the instance is unusable.
    Allocation(crate::gpu::device::GpuError),
    /// A kernel launch or submission failed mid-call. The call failed and
    /// the instance's buffers must be treated as contaminated: tear the
    /// instance down and rebuild it.
    Launch(crate::gpu::device::GpuError),
    /// A previous call failed with [`PipelineError::Launch`]; the instance
    /// refuses further work until reconstructed.
    Poisoned,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::NotConfigured => {
                write!(f, "set_image_size must be called before processing frames")
            }
            PipelineError::WrongImageSize { expected, got } => write!(
                f,
                "frame is {}x{} but the pipeline is configured for {}x{}",
                got.0, got.1, expected.0, expected.1
            ),
            PipelineError::Allocation(e) => write!(f, "buffer allocation failed: {e}"),
            PipelineError::Launch(e) => write!(f, "GPU submission failed: {e}"),
            PipelineError::Poisoned => write!(
                f,
                "a previous call failed; the instance must be rebuilt before reuse"
            ),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Allocation(e) | PipelineError::Launch(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ReferencePipeline
// ---------------------------------------------------------------------------

/// CPU mirror of the GPU pipeline.
///
/// Descriptor storage is fixed at `max_keypoints` slots per image and
/// overwritten in place on every call, exactly like the device arena.
pub struct ReferencePipeline {
    config: PipelineConfig,
    detector: FastDetector,
    extractor: DescriptorExtractor,
    desc_a: Vec<Descriptor>,
    desc_b: Vec<Descriptor>,
    count_a: usize,
    size: Option<(usize, usize)>,
}

impl ReferencePipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let detector = config.detector();
        let capacity = config.max_keypoints;
        ReferencePipeline {
            detector,
            extractor: DescriptorExtractor::new(SamplingTable::generate(), BitMask::default()),
            desc_a: vec![Descriptor::ZERO; capacity],
            desc_b: vec![Descriptor::ZERO; capacity],
            count_a: 0,
            size: None,
            config,
        }
    }

    /// Declare the frame dimensions. Must precede any processing call.
    pub fn set_image_size(&mut self, width: usize, height: usize) {
        self.size = Some((width, height));
    }

    fn check_frame(&self, img: &ColorImage) -> Result<(usize, usize), PipelineError> {
        let size = self.size.ok_or(PipelineError::NotConfigured)?;
        if (img.width(), img.height()) != size {
            return Err(PipelineError::WrongImageSize {
                expected: size,
                got: (img.width(), img.height()),
            });
        }
        Ok(size)
    }

    /// Detect keypoints and fill the image-A descriptor slots.
    ///
    /// Returns the clamped keypoint list (slot i holds keypoint i's
    /// descriptor) and frame statistics.
    pub fn identify_feature_points(
        &mut self,
        img: &ColorImage,
    ) -> Result<(Vec<Keypoint>, FrameStats), PipelineError> {
        self.check_frame(img)?;
        let t_total = Instant::now();
        let mut timing = TimingStats::default();

        let t = Instant::now();
        let gray = convert::rgba_to_gray(img);
        timing.grayscale = t.elapsed().as_secs_f64();

        let t = Instant::now();
        let mut kps = self.detector.detect(&gray);
        timing.detect = t.elapsed().as_secs_f64();

        let detected = kps.len();
        let kept = detected.min(self.config.max_keypoints);
        kps.truncate(kept);

        let t = Instant::now();
        self.count_a = self.extractor.extract(&gray, &kps, &mut self.desc_a);
        timing.describe = t.elapsed().as_secs_f64();

        timing.total = t_total.elapsed().as_secs_f64();
        Ok((
            kps,
            FrameStats { detected, dropped: detected - kept, timing },
        ))
    }

    /// Descriptors for the most recent single-image call (slots 0..count).
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.desc_a[..self.count_a]
    }

    /// Detect, describe, and mutually match a pair of equally sized images.
    ///
    /// Only the widths of the pair are cross-checked; a width mismatch
    /// fast-fails to an empty result. A second image taller than the
    /// configured height cannot be staged in the fixed buffers and
    /// fast-fails the same way.
    pub fn identify_feature_points_between_images(
        &mut self,
        img_a: &ColorImage,
        img_b: &ColorImage,
    ) -> Result<MatchedPairs, PipelineError> {
        let (_, height) = self.check_frame(img_a)?;
        if img_b.width() != img_a.width() || img_b.height() > height {
            return Ok(MatchedPairs::empty());
        }

        let t_total = Instant::now();
        let mut timing = TimingStats::default();

        let t = Instant::now();
        let gray_a = convert::rgba_to_gray(img_a);
        let gray_b = convert::rgba_to_gray(img_b);
        timing.grayscale = t.elapsed().as_secs_f64();

        let t = Instant::now();
        let mut kps_a = self.detector.detect(&gray_a);
        let mut kps_b = self.detector.detect(&gray_b);
        timing.detect = t.elapsed().as_secs_f64();

        let detected_a = kps_a.len();
        let detected_b = kps_b.len();
        kps_a.truncate(detected_a.min(self.config.max_keypoints));
        kps_b.truncate(detected_b.min(self.config.max_keypoints));

        let t = Instant::now();
        let count_a = self.extractor.extract(&gray_a, &kps_a, &mut self.desc_a);
        let count_b = self.extractor.extract(&gray_b, &kps_b, &mut self.desc_b);
        timing.describe = t.elapsed().as_secs_f64();

        let t = Instant::now();
        let cfg = self.config.matcher();
        let forward = matcher::match_descriptors(&self.desc_a[..count_a], &self.desc_b[..count_b], &cfg);
        let backward = matcher::match_descriptors(&self.desc_b[..count_b], &self.desc_a[..count_a], &cfg);
        let correspondences = matcher::cross_check(&forward, &backward);
        timing.matching = t.elapsed().as_secs_f64();

        let keypoints_a = correspondences.iter().map(|c| kps_a[c.source]).collect();
        let keypoints_b = correspondences.iter().map(|c| kps_b[c.target]).collect();

        timing.total = t_total.elapsed().as_secs_f64();
        Ok(MatchedPairs {
            keypoints_a,
            keypoints_b,
            correspondences,
            stats: PairStats {
                detected_a,
                detected_b,
                dropped_a: detected_a - detected_a.min(self.config.max_keypoints),
                dropped_b: detected_b - detected_b.min(self.config.max_keypoints),
                timing,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;

    /// Scene with a handful of bright rectangles on a dark background,
    /// optionally shifted. Rectangle corners are reliable FAST corners.
    pub fn make_scene(w: usize, h: usize, shift_x: usize, shift_y: usize) -> ColorImage {
        let mut gray = Image::from_vec(w, h, vec![25u8; w * h]);
        for &(rx, ry, rw, rh, val) in &[
            (30usize, 25usize, 20usize, 20usize, 200u8),
            (70, 20, 25, 15, 180),
            (110, 30, 18, 22, 210),
            (25, 65, 22, 25, 190),
            (75, 60, 30, 20, 170),
            (115, 70, 20, 18, 205),
        ] {
            for y in (ry + shift_y)..((ry + shift_y + rh).min(h)) {
                for x in (rx + shift_x)..((rx + shift_x + rw).min(w)) {
                    gray.set(x, y, val);
                }
            }
        }
        ColorImage::from_gray(&gray)
    }

    #[test]
    fn test_not_configured() {
        let mut p = ReferencePipeline::new(PipelineConfig::default());
        let img = make_scene(160, 120, 0, 0);
        assert!(matches!(
            p.identify_feature_points(&img),
            Err(PipelineError::NotConfigured)
        ));
    }

    #[test]
    fn test_wrong_image_size() {
        let mut p = ReferencePipeline::new(PipelineConfig::default());
        p.set_image_size(320, 240);
        let img = make_scene(160, 120, 0, 0);
        assert!(matches!(
            p.identify_feature_points(&img),
            Err(PipelineError::WrongImageSize { .. })
        ));
    }

    #[test]
    fn test_single_image_detects() {
        let mut p = ReferencePipeline::new(PipelineConfig::default());
        p.set_image_size(160, 120);
        let img = make_scene(160, 120, 0, 0);
        let (kps, stats) = p.identify_feature_points(&img).unwrap();
        assert!(!kps.is_empty());
        assert_eq!(stats.detected, kps.len());
        assert_eq!(stats.dropped, 0);
        assert_eq!(p.descriptors().len(), kps.len());
    }

    #[test]
    fn test_capacity_clamp_reports_dropped() {
        let config = PipelineConfig { max_keypoints: 3, ..Default::default() };
        let mut p = ReferencePipeline::new(config);
        p.set_image_size(160, 120);
        let img = make_scene(160, 120, 0, 0);
        let (kps, stats) = p.identify_feature_points(&img).unwrap();
        assert_eq!(kps.len(), 3);
        assert_eq!(stats.dropped, stats.detected - 3);
        assert!(stats.dropped > 0);
        assert_eq!(p.descriptors().len(), 3);
    }

    #[test]
    fn test_pair_width_mismatch_is_empty() {
        let mut p = ReferencePipeline::new(PipelineConfig::default());
        p.set_image_size(640, 480);
        let a = make_scene(640, 480, 0, 0);
        let b = make_scene(320, 240, 0, 0);
        let pairs = p.identify_feature_points_between_images(&a, &b).unwrap();
        assert!(pairs.is_empty());
        assert!(pairs.keypoints_a.is_empty());
        assert!(pairs.keypoints_b.is_empty());
    }

    #[test]
    fn test_self_match_is_identity() {
        let mut p = ReferencePipeline::new(PipelineConfig {
            match_threshold: 1,
            ..Default::default()
        });
        p.set_image_size(160, 120);
        let img = make_scene(160, 120, 0, 0);
        let pairs = p.identify_feature_points_between_images(&img, &img).unwrap();
        assert!(!pairs.is_empty());
        // Keypoints with duplicated descriptors (identical local texture)
        // lose the cross-check to the lowest duplicate; every survivor must
        // be a self-pair.
        assert!(pairs.len() <= pairs.stats.detected_a);
        for c in &pairs.correspondences {
            assert_eq!(c.source, c.target);
        }
    }

    #[test]
    fn test_blank_images_yield_zero_everything() {
        let mut p = ReferencePipeline::new(PipelineConfig::default());
        p.set_image_size(64, 64);
        let blank = ColorImage::from_gray(&Image::from_vec(64, 64, vec![128u8; 64 * 64]));
        let (kps, stats) = p.identify_feature_points(&blank).unwrap();
        assert!(kps.is_empty());
        assert_eq!(stats.detected, 0);
        let pairs = p.identify_feature_points_between_images(&blank, &blank).unwrap();
        assert!(pairs.is_empty());
    }
}
