// nms.rs — grid-based non-maximum suppression for detected keypoints.
//
// Divide the image into a grid of cells; within each cell keep only the
// keypoint with the highest response. Keeps detections spatially spread
// instead of clustered on one high-contrast texture, which matters when a
// fixed-capacity descriptor stage clamps the list downstream.

use crate::detect::Keypoint;

/// Grid-based non-maximum suppression.
pub struct GridNms {
    /// Cell size in pixels. Each cell keeps at most one keypoint.
    pub cell_size: usize,
}

impl GridNms {
    /// # Panics
    /// Panics if `cell_size == 0`.
    pub fn new(cell_size: usize) -> Self {
        assert!(cell_size > 0, "cell_size must be > 0");
        GridNms { cell_size }
    }

    /// Retain the highest-response keypoint per grid cell.
    ///
    /// Survivors are copied into a fresh vector in grid order; callers that
    /// need a response ordering sort afterwards.
    pub fn suppress(&self, keypoints: &[Keypoint], img_w: usize, img_h: usize) -> Vec<Keypoint> {
        if keypoints.is_empty() {
            return Vec::new();
        }

        let grid_cols = (img_w + self.cell_size - 1) / self.cell_size;
        let grid_rows = (img_h + self.cell_size - 1) / self.cell_size;

        // Each cell holds the index of the best keypoint seen so far.
        let mut grid: Vec<Option<usize>> = vec![None; grid_rows * grid_cols];

        for (i, kp) in keypoints.iter().enumerate() {
            let col = ((kp.x as usize) / self.cell_size).min(grid_cols - 1);
            let row = ((kp.y as usize) / self.cell_size).min(grid_rows - 1);
            let cell = row * grid_cols + col;

            match grid[cell] {
                None => grid[cell] = Some(i),
                Some(prev) => {
                    if kp.response > keypoints[prev].response {
                        grid[cell] = Some(i);
                    }
                }
            }
        }

        grid.iter()
            .filter_map(|&cell| cell.map(|i| keypoints[i]))
            .collect()
    }
}
