// gpu/mod.rs — GPU acceleration layer.
//
// wgpu-based compute kernels mirroring the CPU algorithms in the parent
// crate. The CPU implementations remain the authoritative reference —
// every kernel is validated against them.
//
// Architecture: hybrid CPU/GPU model.
//
//   GPU handles the per-pixel and per-descriptor heavy compute:
//     image upload → grayscale conversion → descriptor extraction →
//     brute-force Hamming matching
//
//   CPU handles the stages that need host-resident data:
//     keypoint detection (the detector consumes a host grayscale frame)
//     and the mutual-consistency cross-check (joins both match arrays)
//
// The boundaries are two small readbacks: the grayscale frame before
// detection, and the two match-index arrays before the cross-check. Both
// are mandatory — detection results must be consumed on the host to bridge
// into descriptor extraction, and the cross-check is undefined until both
// match arrays are complete.

pub mod device;
pub mod stream;
pub mod arena;
pub mod gray;
pub mod descriptor;
pub mod matcher;
pub mod pipeline;
