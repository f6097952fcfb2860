//! Global grid geometry, point sources, and the assembled result field.

use crate::error::{PoissonError, Result};

/// Magnitude of the two point sources placed on every grid.
pub const SOURCE_STRENGTH: f64 = 100.0;

/// Physical extent of the domain. Only used to derive the grid spacing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            x_min: 0.0,
            x_max: 2.0,
            y_min: 0.0,
            y_max: 1.0,
        }
    }
}

/// A point source in global (row, col) coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointSource {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

/// The global discretisation. Immutable for the duration of a solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalGrid {
    pub nx: usize,
    pub ny: usize,
    pub bounds: Bounds,
}

impl GlobalGrid {
    pub fn new(nx: usize, ny: usize, bounds: Bounds) -> Result<Self> {
        if nx < 3 || ny < 3 {
            return Err(PoissonError::Configuration(format!(
                "grid must be at least 3x3, got {nx}x{ny}"
            )));
        }
        let finite = [bounds.x_min, bounds.x_max, bounds.y_min, bounds.y_max]
            .iter()
            .all(|v| v.is_finite());
        if !finite || bounds.x_max <= bounds.x_min || bounds.y_max <= bounds.y_min {
            return Err(PoissonError::Configuration(format!(
                "invalid domain bounds: {bounds:?}"
            )));
        }
        Ok(Self { nx, ny, bounds })
    }

    pub fn dx(&self) -> f64 {
        (self.bounds.x_max - self.bounds.x_min) / (self.nx - 1) as f64
    }

    pub fn dy(&self) -> f64 {
        (self.bounds.y_max - self.bounds.y_min) / (self.ny - 1) as f64
    }

    /// Characteristic size used by the scaled tolerance law.
    pub fn size(&self) -> usize {
        self.nx.max(self.ny)
    }

    /// Evenly spaced x coordinates of the grid columns.
    pub fn x_coords(&self) -> Vec<f64> {
        linspace(self.bounds.x_min, self.bounds.x_max, self.nx)
    }

    /// Evenly spaced y coordinates of the grid rows.
    pub fn y_coords(&self) -> Vec<f64> {
        linspace(self.bounds.y_min, self.bounds.y_max, self.ny)
    }

    /// The positive source at (ny/4, nx/4) and the negative one at (3ny/4, 3nx/4).
    pub fn sources(&self) -> [PointSource; 2] {
        [
            PointSource {
                row: self.ny / 4,
                col: self.nx / 4,
                value: SOURCE_STRENGTH,
            },
            PointSource {
                row: 3 * self.ny / 4,
                col: 3 * self.nx / 4,
                value: -SOURCE_STRENGTH,
            },
        ]
    }
}

fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    let step = (stop - start) / (n - 1) as f64;
    (0..n)
        .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
        .collect()
}

/// Host copy of a full `ny x nx` field, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalField {
    pub nx: usize,
    pub ny: usize,
    pub data: Vec<f64>,
}

impl GlobalField {
    pub fn zeros(nx: usize, ny: usize) -> Self {
        Self {
            nx,
            ny,
            data: vec![0.0; nx * ny],
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.nx + col]
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.nx..(row + 1) * self.nx]
    }

    /// Largest absolute value in the field.
    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0f64, |acc, v| acc.max(v.abs()))
    }

    /// Largest absolute element-wise difference to another field of the same shape.
    pub fn max_abs_diff(&self, other: &GlobalField) -> f64 {
        self.data
            .iter()
            .zip(&other.data)
            .fold(0.0f64, |acc, (a, b)| acc.max((a - b).abs()))
    }

    /// True when the four outer edges are exactly zero.
    pub fn edges_are_zero(&self) -> bool {
        let top_bottom = self.row(0).iter().chain(self.row(self.ny - 1)).all(|&v| v == 0.0);
        let sides = (0..self.ny).all(|r| self.get(r, 0) == 0.0 && self.get(r, self.nx - 1) == 0.0);
        top_bottom && sides
    }
}
