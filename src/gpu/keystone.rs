//! Keystone corner state and the projective matrix derived from it.
//!
//! Four corners in normalized device coordinates (`[-1, 1]` on each
//! axis) describe where the video quad's vertices land on screen. The
//! matrix is only recomputed when a corner actually moves, not per
//! frame — the render loop just uploads whatever is cached.

/// Clamp applied to every corner so three corners can never become
/// collinear or the quad self-intersect.
const MIN_SEPARATION: f32 = 0.05;

/// The four corners of the keystoned quad, in top-left, top-right,
/// bottom-right, bottom-left order.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Corners {
    pub top_left: (f32, f32),
    pub top_right: (f32, f32),
    pub bottom_right: (f32, f32),
    pub bottom_left: (f32, f32),
}

impl Corners {
    /// The untransformed full-screen quad.
    pub fn identity() -> Self {
        Self {
            top_left: (-1.0, 1.0),
            top_right: (1.0, 1.0),
            bottom_right: (1.0, -1.0),
            bottom_left: (-1.0, -1.0),
        }
    }

    fn as_array(&self) -> [(f32, f32); 4] {
        [self.top_left, self.top_right, self.bottom_right, self.bottom_left]
    }

    /// `false` if any pair of adjacent corners has collapsed closer than
    /// [`MIN_SEPARATION`] on both axes, which would make the quad
    /// degenerate (zero or negative area).
    pub fn is_non_degenerate(&self) -> bool {
        let corners = self.as_array();
        for i in 0..4 {
            let a = corners[i];
            let b = corners[(i + 1) % 4];
            let dx = (a.0 - b.0).abs();
            let dy = (a.1 - b.1).abs();
            if dx < MIN_SEPARATION && dy < MIN_SEPARATION {
                return false;
            }
        }
        signed_area(&corners).abs() > MIN_SEPARATION * MIN_SEPARATION
    }

    /// Nudge one corner by `(dx, dy)`, clamping the result to `[-1, 1]`
    /// and rejecting the move (leaving the corner unchanged) if it would
    /// make the quad degenerate.
    pub fn nudge(&mut self, index: usize, dx: f32, dy: f32) {
        assert!(index < 4, "corner index must be 0..=3");
        let mut corners = self.as_array();
        let (x, y) = corners[index];
        corners[index] = ((x + dx).clamp(-1.0, 1.0), (y + dy).clamp(-1.0, 1.0));
        let candidate = Self::from_array(corners);
        if candidate.is_non_degenerate() {
            *self = candidate;
        }
    }

    fn from_array(c: [(f32, f32); 4]) -> Self {
        Self {
            top_left: c[0],
            top_right: c[1],
            bottom_right: c[2],
            bottom_left: c[3],
        }
    }

    /// The 3×3 projective (homography) matrix mapping the unit quad
    /// `[(-1,1), (1,1), (1,-1), (-1,-1)]` onto these corners, row-major,
    /// ready for upload as a GLES uniform.
    pub fn to_matrix(&self) -> [f32; 9] {
        homography_from_unit_quad(&self.as_array())
    }
}

impl Default for Corners {
    fn default() -> Self {
        Self::identity()
    }
}

fn signed_area(corners: &[(f32, f32); 4]) -> f32 {
    let mut area = 0.0;
    for i in 0..4 {
        let (x0, y0) = corners[i];
        let (x1, y1) = corners[(i + 1) % 4];
        area += x0 * y1 - x1 * y0;
    }
    area / 2.0
}

/// Solve for the homography taking the canonical unit square's corners
/// to `dst`, via the standard 8-unknown linear system (direct linear
/// transform) specialized for a square source.
fn homography_from_unit_quad(dst: &[(f32, f32); 4]) -> [f32; 9] {
    // Source corners, matching the `Corners` field order.
    let src = [(-1.0_f32, 1.0), (1.0, 1.0), (1.0, -1.0), (-1.0, -1.0)];

    // Build the 8x8 linear system A*h = b for h = [a,b,c,d,e,f,g,h2],
    // with the homography normalized so the bottom-right entry is 1.
    let mut a = [[0.0_f32; 8]; 8];
    let mut b = [0.0_f32; 8];
    for i in 0..4 {
        let (x, y) = src[i];
        let (u, v) = dst[i];
        a[2 * i] = [x, y, 1.0, 0.0, 0.0, 0.0, -x * u, -y * u];
        b[2 * i] = u;
        a[2 * i + 1] = [0.0, 0.0, 0.0, x, y, 1.0, -x * v, -y * v];
        b[2 * i + 1] = v;
    }

    let h = solve_linear_system(a, b).unwrap_or([1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    [h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0]
}

/// Gaussian elimination with partial pivoting for a small, dense,
/// well-conditioned system (degenerate quads are rejected before this
/// is ever called).
fn solve_linear_system(mut a: [[f32; 8]; 8], mut b: [f32; 8]) -> Option<[f32; 8]> {
    for col in 0..8 {
        let pivot = (col..8).max_by(|&r1, &r2| a[r1][col].abs().partial_cmp(&a[r2][col].abs()).unwrap())?;
        if a[pivot][col].abs() < 1e-8 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        let scale = a[col][col];
        for v in a[col].iter_mut() {
            *v /= scale;
        }
        b[col] /= scale;

        for row in 0..8 {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for k in 0..8 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    Some(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_corners_produce_the_identity_homography() {
        let matrix = Corners::identity().to_matrix();
        let expected = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        for (got, want) in matrix.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-4, "{matrix:?} != {expected:?}");
        }
    }

    #[test]
    fn nudging_a_corner_outward_is_reflected_in_the_field() {
        let mut corners = Corners::identity();
        corners.nudge(0, -0.1, 0.05);
        assert!((corners.top_left.0 - (-1.0)).abs() < 1e-6); // clamped at -1
        assert!((corners.top_left.1 - 1.0).abs() < 1e-6); // clamped at 1
    }

    #[test]
    fn nudge_rejected_when_it_would_collapse_the_quad() {
        let mut corners = Corners::identity();
        // Push top_left almost on top of top_right repeatedly.
        for _ in 0..100 {
            corners.nudge(0, 2.0, 0.0);
        }
        assert!(corners.is_non_degenerate());
    }

    #[test]
    fn identity_quad_is_non_degenerate() {
        assert!(Corners::identity().is_non_degenerate());
    }

    #[test]
    fn collapsed_quad_is_degenerate() {
        let collapsed = Corners {
            top_left: (0.0, 0.0),
            top_right: (0.001, 0.0),
            bottom_right: (0.001, -0.001),
            bottom_left: (0.0, -0.001),
        };
        assert!(!collapsed.is_non_degenerate());
    }
}
