//! Geometric primitives shared by the tracker and the calibrator.
//!
//! Pixel coordinates are integer image positions (origin top-left). Table
//! coordinates are the normalized plane spanned by the four calibration
//! corners, conceptually `[0, 1] × [0, 1]`, with `z` fixed at 0 for planar
//! calibration.
//!
//! The homography solve follows the four-point perspective transform: eight
//! unknowns, eight linear equations, `H[2,2]` fixed to 1.

use base64::Engine;
use nalgebra::{Matrix3, Point2, SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;

/// OpenCV element type code for single-channel `f64`.
pub const MAT_TYPE_64F: i32 = 6;

/// Integer pixel coordinate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelPoint {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

impl PixelPoint {
    /// Creates a pixel coordinate.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to `other`.
    pub fn distance_sq(&self, other: &PixelPoint) -> f64 {
        let dx = i64::from(self.x) - i64::from(other.x);
        let dy = i64::from(self.y) - i64::from(other.y);
        (dx * dx + dy * dy) as f64
    }

    /// Converts to a floating point image point.
    pub fn to_point(self) -> Point2<f64> {
        Point2::new(f64::from(self.x), f64::from(self.y))
    }
}

/// Position on the calibrated table plane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TablePoint {
    /// Normalized horizontal position.
    pub x: f64,
    /// Normalized vertical position.
    pub y: f64,
    /// Height above the table; always 0 for planar calibration.
    pub z: f64,
}

impl TablePoint {
    /// True when the point lies inside the unit table square (edges included).
    pub fn is_on_table(&self) -> bool {
        (0.0..=1.0).contains(&self.x) && (0.0..=1.0).contains(&self.y)
    }
}

/// Planar projective transform from image pixels to table coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography(Matrix3<f64>);

impl Homography {
    /// Wraps an existing 3×3 matrix.
    pub fn from_matrix(matrix: Matrix3<f64>) -> Self {
        Self(matrix)
    }

    /// The underlying matrix.
    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.0
    }

    /// Solves the transform mapping each `src[i]` onto `dst[i]`.
    pub fn from_four_points(
        src: &[Point2<f64>; 4],
        dst: &[Point2<f64>; 4],
    ) -> Result<Self, CalibrationError> {
        if has_collinear_triple(src) || has_collinear_triple(dst) {
            return Err(CalibrationError::Degenerate);
        }

        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();

        for (i, (s, d)) in src.iter().zip(dst.iter()).enumerate() {
            let (x, y, u, v) = (s.x, s.y, d.x, d.y);
            let r0 = 2 * i;
            let r1 = r0 + 1;

            a[(r0, 0)] = x;
            a[(r0, 1)] = y;
            a[(r0, 2)] = 1.0;
            a[(r0, 6)] = -x * u;
            a[(r0, 7)] = -y * u;
            b[r0] = u;

            a[(r1, 3)] = x;
            a[(r1, 4)] = y;
            a[(r1, 5)] = 1.0;
            a[(r1, 6)] = -x * v;
            a[(r1, 7)] = -y * v;
            b[r1] = v;
        }

        let h = a.lu().solve(&b).ok_or(CalibrationError::Degenerate)?;
        if h.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::Degenerate);
        }

        Ok(Self(Matrix3::new(
            h[0], h[1], h[2], //
            h[3], h[4], h[5], //
            h[6], h[7], 1.0,
        )))
    }

    /// Maps an image point through the transform.
    ///
    /// Returns `None` for points on the line at infinity.
    pub fn apply(&self, point: Point2<f64>) -> Option<Point2<f64>> {
        let p = self.0 * Vector3::new(point.x, point.y, 1.0);
        if p.z.abs() < f64::EPSILON {
            return None;
        }
        Some(Point2::new(p.x / p.z, p.y / p.z))
    }

    /// Row-major matrix blob.
    pub fn to_mat(&self) -> SerializedMat {
        let mut values = Vec::with_capacity(9);
        for r in 0..3 {
            for c in 0..3 {
                values.push(self.0[(r, c)]);
            }
        }
        SerializedMat::from_f64(3, 3, &values)
    }

    /// Restores a transform from a 3×3 `f64` blob.
    pub fn from_mat(mat: &SerializedMat) -> Result<Self, CalibrationError> {
        if mat.rows != 3 || mat.cols != 3 {
            return Err(CalibrationError::InvalidMatrix(format!(
                "homography must be 3x3, got {}x{}",
                mat.rows, mat.cols
            )));
        }
        let values = mat.to_f64()?;
        Ok(Self(Matrix3::from_row_slice(&values)))
    }
}

fn has_collinear_triple(points: &[Point2<f64>; 4]) -> bool {
    const TRIPLES: [(usize, usize, usize); 4] = [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)];
    TRIPLES.iter().any(|&(i, j, k)| {
        let (p0, p1, p2) = (points[i], points[j], points[k]);
        let area = (p1.x - p0.x) * (p2.y - p0.y) - (p1.y - p0.y) * (p2.x - p0.x);
        area.abs() < 1e-9
    })
}

/// Matrix persisted as `{rows, cols, type, data}` with base64 raw bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedMat {
    /// Row count.
    pub rows: i32,
    /// Column count.
    pub cols: i32,
    /// Element type code.
    #[serde(rename = "type")]
    pub mat_type: i32,
    /// Base64 encoded little-endian element bytes.
    pub data: String,
}

impl SerializedMat {
    /// An empty matrix (no rows, no data).
    pub fn empty() -> Self {
        Self::default()
    }

    /// `n × n` identity matrix of `f64`.
    pub fn identity(n: usize) -> Self {
        let mut values = vec![0.0; n * n];
        for i in 0..n {
            values[i * n + i] = 1.0;
        }
        Self::from_f64(n as i32, n as i32, &values)
    }

    /// Encodes row-major `f64` values.
    pub fn from_f64(rows: i32, cols: i32, values: &[f64]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            rows,
            cols,
            mat_type: MAT_TYPE_64F,
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// True if the blob carries no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decodes row-major `f64` values.
    pub fn to_f64(&self) -> Result<Vec<f64>, CalibrationError> {
        if self.mat_type != MAT_TYPE_64F {
            return Err(CalibrationError::InvalidMatrix(format!(
                "expected element type {MAT_TYPE_64F}, got {}",
                self.mat_type
            )));
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| CalibrationError::InvalidMatrix(e.to_string()))?;

        let expected = (self.rows.max(0) as usize) * (self.cols.max(0) as usize) * 8;
        if bytes.len() != expected {
            return Err(CalibrationError::InvalidMatrix(format!(
                "{}x{} matrix needs {expected} bytes, got {}",
                self.rows,
                self.cols,
                bytes.len()
            )));
        }

        Ok(bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> [Point2<f64>; 4] {
        [
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(0.0, 1.0),
            Point2::new(1.0, 1.0),
        ]
    }

    #[test]
    fn test_distance_sq() {
        let a = PixelPoint::new(100, 100);
        let b = PixelPoint::new(105, 102);
        assert_eq!(a.distance_sq(&b), 29.0);
    }

    #[test]
    fn test_homography_maps_corners() {
        let pixels = [
            Point2::new(212.0, 95.0),
            Point2::new(1043.0, 120.0),
            Point2::new(180.0, 640.0),
            Point2::new(1101.0, 610.0),
        ];
        let h = Homography::from_four_points(&pixels, &unit_square()).unwrap();

        for (pixel, expected) in pixels.iter().zip(unit_square().iter()) {
            let mapped = h.apply(*pixel).unwrap();
            assert!((mapped.x - expected.x).abs() < 1e-6, "{mapped:?}");
            assert!((mapped.y - expected.y).abs() < 1e-6, "{mapped:?}");
        }
    }

    #[test]
    fn test_homography_rejects_collinear_points() {
        let pixels = [
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(2.0, 2.0),
            Point2::new(3.0, 3.0),
        ];
        assert!(Homography::from_four_points(&pixels, &unit_square()).is_err());
    }

    #[test]
    fn test_mat_blob_restores_homography() {
        let pixels = [
            Point2::new(10.0, 10.0),
            Point2::new(300.0, 12.0),
            Point2::new(8.0, 200.0),
            Point2::new(310.0, 205.0),
        ];
        let h = Homography::from_four_points(&pixels, &unit_square()).unwrap();
        let restored = Homography::from_mat(&h.to_mat()).unwrap();
        assert_eq!(h, restored);
    }

    #[test]
    fn test_mat_blob_rejects_short_data() {
        let mut mat = SerializedMat::identity(3);
        mat.rows = 4;
        assert!(mat.to_f64().is_err());
    }

    #[test]
    fn test_table_bounds() {
        assert!(TablePoint { x: 0.0, y: 1.0, z: 0.0 }.is_on_table());
        assert!(!TablePoint { x: -0.01, y: 0.5, z: 0.0 }.is_on_table());
        assert!(!TablePoint { x: 0.5, y: 1.2, z: 0.0 }.is_on_table());
    }
}
