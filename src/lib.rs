//! Multi-device Jacobi solver for the 2D Poisson equation.
//!
//! The global grid is split into row blocks, one per worker. Each worker runs
//! a five-point stencil on its own device-resident fields and exchanges one
//! boundary row with each neighbour per iteration.

pub mod config;
pub mod error;
pub mod grid;
pub mod output;
pub mod solver;
pub mod stats;
