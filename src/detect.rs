// detect.rs — keypoint detection: FAST segment test plus orientation.
//
// The descriptor stage rotates its sampling pattern by each keypoint's
// orientation, so detection here is FAST corners followed by an
// intensity-centroid orientation assignment (the moment-based angle used
// by rotation-aware binary descriptors).
//
// The detector is behind the `FeatureDetector` trait: the pipeline treats
// detection as a replaceable capability and only consumes the resulting
// keypoint list on the host.

use crate::image::Image;
use crate::nms::GridNms;

/// Bresenham circle of radius 3: 16 (dx, dy) offsets, clockwise from
/// 12 o'clock.
const CIRCLE_OFFSETS: [(isize, isize); 16] = [
    ( 0, -3), ( 1, -3), ( 2, -2), ( 3, -1),
    ( 3,  0), ( 3,  1), ( 2,  2), ( 1,  3),
    ( 0,  3), (-1,  3), (-2,  2), (-3,  1),
    (-3,  0), (-3, -1), (-2, -2), (-1, -3),
];

/// Half-width of the square patch used for the orientation centroid.
const ORIENTATION_RADIUS: isize = 7;

/// A detected feature point.
///
/// Immutable once produced by a detector; consumed by descriptor
/// extraction, which reads (x, y) and `angle`.
#[derive(Debug, Clone, Copy)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Detection scale. The built-in detector works at full resolution and
    /// reports 1.0.
    pub scale: f32,
    /// Orientation in radians, from the intensity centroid of the
    /// surrounding patch.
    pub angle: f32,
    /// Detector response. Higher = stronger corner.
    pub response: f32,
}

/// A source of keypoints. The pipeline host-synchronizes its image staging
/// before calling this, so implementations see a fully materialized
/// grayscale frame.
pub trait FeatureDetector {
    fn detect(&mut self, image: &Image<u8>) -> Vec<Keypoint>;
}

// ---------------------------------------------------------------------------
// FastDetector
// ---------------------------------------------------------------------------

/// FAST-N corner detector with grid NMS and orientation assignment.
///
/// When `target_count` is set, the threshold adapts between calls to steer
/// the post-NMS detection count into `target_count ± tolerance`. The
/// adaptation is deliberately slow (one threshold step per call) so a
/// single outlier frame cannot destabilize it.
pub struct FastDetector {
    /// Intensity difference threshold. A circle pixel counts as
    /// brighter/darker only if it differs from the center by more than this.
    pub threshold: u8,
    /// Minimum contiguous circle pixels, in [9, 12].
    pub arc_length: usize,
    target_count: Option<usize>,
    tolerance: usize,
    nms: GridNms,
}

impl FastDetector {
    /// # Panics
    /// Panics if `arc_length` is not in [9, 12] or `nms_cell == 0`.
    pub fn new(threshold: u8, arc_length: usize, nms_cell: usize) -> Self {
        assert!(
            (9..=12).contains(&arc_length),
            "arc_length must be 9..=12 (got {arc_length})"
        );
        FastDetector {
            threshold,
            arc_length,
            target_count: None,
            tolerance: 0,
            nms: GridNms::new(nms_cell),
        }
    }

    /// Enable threshold adaptation toward `target ± tolerance` detections.
    pub fn with_target_count(mut self, target: usize, tolerance: usize) -> Self {
        self.target_count = Some(target);
        self.tolerance = tolerance;
        self
    }

    /// Raw segment-test sweep, no NMS, no orientation. Response is the sum
    /// of `|diff| - threshold` over the qualifying arc's pixels.
    fn detect_raw(&self, image: &Image<u8>) -> Vec<Keypoint> {
        let w = image.width();
        let h = image.height();
        let mut out = Vec::new();

        // The circle has radius 3; skip a 3-pixel border.
        if w <= 6 || h <= 6 {
            return out;
        }

        let thresh = self.threshold as i16;
        let min_cardinals: u8 = if self.arc_length >= 12 { 3 } else { 2 };

        for y in 3..(h - 3) {
            for x in 3..(w - 3) {
                // SAFETY: x in [3, w-3), y in [3, h-3); circle offsets are
                // at most ±3, so every access below is in bounds.
                unsafe {
                    let center = image.get_unchecked(x, y) as i16;

                    // High-speed rejection on the 4 cardinal circle points.
                    let mut bright = 0u8;
                    let mut dark = 0u8;
                    for &ci in &[0usize, 4, 8, 12] {
                        let (dx, dy) = CIRCLE_OFFSETS[ci];
                        let p = image.get_unchecked(
                            (x as isize + dx) as usize,
                            (y as isize + dy) as usize,
                        ) as i16;
                        bright += (p > center + thresh) as u8;
                        dark += (p < center - thresh) as u8;
                    }
                    if bright < min_cardinals && dark < min_cardinals {
                        continue;
                    }

                    let mut circle = [0i16; 16];
                    for (i, &(dx, dy)) in CIRCLE_OFFSETS.iter().enumerate() {
                        circle[i] = image.get_unchecked(
                            (x as isize + dx) as usize,
                            (y as isize + dy) as usize,
                        ) as i16;
                    }

                    if let Some(score) = self.segment_score(center, &circle, thresh) {
                        out.push(Keypoint {
                            x: x as f32,
                            y: y as f32,
                            scale: 1.0,
                            angle: 0.0,
                            response: score,
                        });
                    }
                }
            }
        }

        out
    }

    /// Contiguous-arc test over the 16 circle samples. The wrap-around is
    /// handled by doubling the classification bitmask into a u32 and
    /// AND-shifting N-1 times; a nonzero accumulator means a run of N.
    ///
    /// Returns the corner score, or None if no qualifying arc exists.
    fn segment_score(&self, center: i16, circle: &[i16; 16], thresh: i16) -> Option<f32> {
        let n = self.arc_length;

        let mut bright_mask: u16 = 0;
        let mut dark_mask: u16 = 0;
        for (i, &p) in circle.iter().enumerate() {
            let diff = p - center;
            if diff > thresh {
                bright_mask |= 1 << i;
            } else if diff < -thresh {
                dark_mask |= 1 << i;
            }
        }

        let mut best: Option<f32> = None;
        for mask in [bright_mask, dark_mask] {
            if (mask.count_ones() as usize) < n {
                continue;
            }
            let doubled = (mask as u32) | ((mask as u32) << 16);
            let mut acc = doubled;
            for _ in 1..n {
                acc &= acc >> 1;
            }
            if acc == 0 {
                continue;
            }
            // Score: excess over threshold summed across all pixels of the
            // winning polarity.
            let mut score = 0.0f32;
            for (i, &p) in circle.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    score += ((p - center).abs() - thresh) as f32;
                }
            }
            best = Some(best.map_or(score, |b: f32| b.max(score)));
        }
        best
    }

    /// Intensity-centroid orientation: angle of the first-moment vector
    /// (m01, m10) of the patch around (x, y). Border samples clamp.
    fn orientation(image: &Image<u8>, x: f32, y: f32) -> f32 {
        let cx = x as i32;
        let cy = y as i32;
        let mut m10 = 0.0f32;
        let mut m01 = 0.0f32;
        for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
                let v = image.get_clamped(cx + dx as i32, cy + dy as i32) as f32;
                m10 += dx as f32 * v;
                m01 += dy as f32 * v;
            }
        }
        m01.atan2(m10)
    }

    /// Nudge the threshold toward the configured target count.
    fn adapt_threshold(&mut self, count: usize) {
        let Some(target) = self.target_count else {
            return;
        };
        if count > target + self.tolerance {
            self.threshold = self.threshold.saturating_add(2).min(120);
        } else if count + self.tolerance < target {
            self.threshold = self.threshold.saturating_sub(2).max(5);
        }
    }
}

impl FeatureDetector for FastDetector {
    fn detect(&mut self, image: &Image<u8>) -> Vec<Keypoint> {
        let raw = self.detect_raw(image);
        let mut kept = self.nms.suppress(&raw, image.width(), image.height());
        for kp in &mut kept {
            kp.angle = Self::orientation(image, kp.x, kp.y);
        }
        // Strongest first, so capacity clamping downstream drops the
        // weakest detections. Ties break on (y, x) to keep the order
        // deterministic.
        kept.sort_by(|a, b| {
            b.response
                .partial_cmp(&a.response)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (a.y as u32, a.x as u32).cmp(&(b.y as u32, b.x as u32)))
        });
        self.adapt_threshold(kept.len());
        kept
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
