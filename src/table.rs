// table.rs — the immutable patch-triplet sampling table and the per-word
// bit mask.
//
// Each descriptor bit is produced by one triplet of patch-center offsets
// (anchor, first candidate, second candidate) around the keypoint. The
// table is fixed at construction and shared read-only by every extraction
// call, on CPU and GPU alike; the GPU engine uploads `as_raw()` verbatim.

/// Descriptor width in bits.
pub const DESCRIPTOR_BITS: usize = 2048;
/// Descriptor width in 32-bit words.
pub const DESCRIPTOR_WORDS: usize = DESCRIPTOR_BITS / 32;
/// Offsets are drawn from [-WINDOW_RADIUS, WINDOW_RADIUS] in both axes.
pub const WINDOW_RADIUS: i32 = 12;
/// Half-width of the compared patches: patches are (2·PATCH_HALF+1)².
pub const PATCH_HALF: i32 = 3;

/// Fixed seed for the built-in table. The descriptor family is valid for
/// any bounded table; what matters is that every instance, on every
/// platform, derives the identical table.
const TABLE_SEED: u32 = 0x6d2b_79f5;

/// Immutable table of `DESCRIPTOR_BITS` patch-triplet offset triples.
///
/// Layout of the flat backing store: 6 i32 per bit —
/// `[anchor_x, anchor_y, first_x, first_y, second_x, second_y]`.
#[derive(Clone)]
pub struct SamplingTable {
    offsets: Vec<i32>,
}

impl SamplingTable {
    /// The built-in table, derived deterministically from a fixed seed.
    pub fn generate() -> Self {
        let mut state = TABLE_SEED;
        let span = (2 * WINDOW_RADIUS + 1) as u32;
        let mut next = move || {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((state >> 16) % span) as i32 - WINDOW_RADIUS
        };

        let mut offsets = Vec::with_capacity(DESCRIPTOR_BITS * 6);
        for _ in 0..DESCRIPTOR_BITS * 6 {
            offsets.push(next());
        }
        SamplingTable { offsets }
    }

    /// Wrap an externally supplied table.
    ///
    /// # Panics
    /// Panics if the length is not `DESCRIPTOR_BITS * 6` or any offset
    /// exceeds the window radius.
    pub fn from_offsets(offsets: Vec<i32>) -> Self {
        assert_eq!(
            offsets.len(),
            DESCRIPTOR_BITS * 6,
            "table length ({}) must be {} (6 per bit)",
            offsets.len(),
            DESCRIPTOR_BITS * 6,
        );
        assert!(
            offsets.iter().all(|&v| v.abs() <= WINDOW_RADIUS),
            "offsets must lie within the sampling window radius ({WINDOW_RADIUS})"
        );
        SamplingTable { offsets }
    }

    /// The (anchor, first, second) offset pairs for one bit.
    #[inline]
    pub fn triplet(&self, bit: usize) -> [[i32; 2]; 3] {
        let base = bit * 6;
        [
            [self.offsets[base], self.offsets[base + 1]],
            [self.offsets[base + 2], self.offsets[base + 3]],
            [self.offsets[base + 4], self.offsets[base + 5]],
        ]
    }

    /// Flat backing store, for device upload.
    #[inline]
    pub fn as_raw(&self) -> &[i32] {
        &self.offsets
    }
}

impl Default for SamplingTable {
    fn default() -> Self {
        Self::generate()
    }
}

// ---------------------------------------------------------------------------
// BitMask
// ---------------------------------------------------------------------------

/// Per-word weighting of the descriptor: one weight per 32-bit word.
/// A zero weight suppresses the word's bits; any nonzero weight keeps
/// them. Defaults to all-ones (no suppression).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BitMask {
    weights: [f32; DESCRIPTOR_WORDS],
}

impl BitMask {
    pub fn new(weights: [f32; DESCRIPTOR_WORDS]) -> Self {
        BitMask { weights }
    }

    #[inline]
    pub fn weights(&self) -> &[f32; DESCRIPTOR_WORDS] {
        &self.weights
    }

    /// Whether the given word's bits are forced to zero.
    #[inline]
    pub fn suppresses(&self, word: usize) -> bool {
        self.weights[word] == 0.0
    }
}

impl Default for BitMask {
    fn default() -> Self {
        BitMask { weights: [1.0; DESCRIPTOR_WORDS] }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
