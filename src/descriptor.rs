// descriptor.rs — the binary descriptor type and its CPU reference
// extraction.
//
// A descriptor is 2048 bits over 64 u32 words. Bit b compares the patch
// around a rotated anchor offset against the patches around two rotated
// candidate offsets: the bit is set iff the first candidate's patch is
// closer (smaller summed squared difference) to the anchor's than the
// second's.
//
// This module is the reference the GPU kernel (shaders/descriptor.wgsl)
// mirrors: loop order, rounding (floor(v + 0.5)), and border clamping are
// identical on both sides so they can be compared bit-for-bit.

use crate::detect::Keypoint;
use crate::image::Image;
use crate::table::{BitMask, SamplingTable, DESCRIPTOR_WORDS, PATCH_HALF};

/// A 2048-bit binary descriptor stored as 64 little-endian u32 words.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u32; DESCRIPTOR_WORDS]);

impl Descriptor {
    pub const ZERO: Descriptor = Descriptor([0u32; DESCRIPTOR_WORDS]);

    /// Hamming distance: number of differing bits. Symmetric by
    /// construction (XOR + popcount).
    #[inline]
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        let mut d = 0u32;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            d += (a ^ b).count_ones();
        }
        d
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Descriptor::ZERO
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Full 64-word dumps drown test output; show the leading words.
        write!(
            f,
            "Descriptor({:08x} {:08x} {:08x} {:08x} …)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

// ---------------------------------------------------------------------------
// Reference extraction
// ---------------------------------------------------------------------------

/// CPU reference descriptor extraction.
///
/// Pure function of (image, keypoint, table, mask): identical inputs yield
/// bit-identical descriptors.
pub struct DescriptorExtractor {
    table: SamplingTable,
    mask: BitMask,
}

impl DescriptorExtractor {
    pub fn new(table: SamplingTable, mask: BitMask) -> Self {
        DescriptorExtractor { table, mask }
    }

    pub fn table(&self) -> &SamplingTable {
        &self.table
    }

    pub fn mask(&self) -> &BitMask {
        &self.mask
    }

    /// Extract descriptors for `keypoints` into `out`, slot i holding
    /// keypoint i's descriptor.
    ///
    /// Keypoints beyond `out.len()` are dropped (clamp-and-continue).
    /// Returns the number of descriptors written; slots at and beyond that
    /// count are left untouched.
    pub fn extract(
        &self,
        image: &Image<u8>,
        keypoints: &[Keypoint],
        out: &mut [Descriptor],
    ) -> usize {
        let count = keypoints.len().min(out.len());
        for (kp, slot) in keypoints.iter().take(count).zip(out.iter_mut()) {
            *slot = self.describe_one(image, kp);
        }
        count
    }

    /// One keypoint's descriptor. Sampling footprints that leave the image
    /// clamp to the nearest in-bounds pixel; extraction never reads out of
    /// bounds and never fails.
    pub fn describe_one(&self, image: &Image<u8>, kp: &Keypoint) -> Descriptor {
        let (sin, cos) = kp.angle.sin_cos();
        let mut words = [0u32; DESCRIPTOR_WORDS];

        for (w, word_out) in words.iter_mut().enumerate() {
            if self.mask.suppresses(w) {
                continue;
            }
            let mut word = 0u32;
            for k in 0..32 {
                let [a, c1, c2] = self.table.triplet(w * 32 + k);
                let (ax, ay) = rotate_center(kp, a, sin, cos);
                let (bx, by) = rotate_center(kp, c1, sin, cos);
                let (cx, cy) = rotate_center(kp, c2, sin, cos);

                let mut d1 = 0.0f32;
                let mut d2 = 0.0f32;
                for py in -PATCH_HALF..=PATCH_HALF {
                    for px in -PATCH_HALF..=PATCH_HALF {
                        let ia = image.get_clamped(ax + px, ay + py) as f32;
                        let i1 = image.get_clamped(bx + px, by + py) as f32;
                        let i2 = image.get_clamped(cx + px, cy + py) as f32;
                        d1 += (ia - i1) * (ia - i1);
                        d2 += (ia - i2) * (ia - i2);
                    }
                }
                if d1 < d2 {
                    word |= 1 << k;
                }
            }
            *word_out = word;
        }

        Descriptor(words)
    }
}

/// Rotate a table offset by the keypoint orientation and resolve it to an
/// integer patch center. floor(v + 0.5) rather than round(): WGSL's round()
/// is round-half-even, so both sides use the same explicit formula.
#[inline]
fn rotate_center(kp: &Keypoint, offset: [i32; 2], sin: f32, cos: f32) -> (i32, i32) {
    let dx = offset[0] as f32;
    let dy = offset[1] as f32;
    let rx = dx * cos - dy * sin;
    let ry = dx * sin + dy * cos;
    (
        (kp.x + rx + 0.5).floor() as i32,
        (kp.y + ry + 0.5).floor() as i32,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
