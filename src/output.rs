//! Results output formatting (CSV and console tables).

use std::io::Write;

use crate::error::Result;
use crate::grid::{GlobalField, GlobalGrid};
use crate::solver::SolveOutcome;

/// Write the final field as CSV, one line per grid point.
///
/// Format:
/// ```csv
/// x,y,p
/// 0,0,0
/// 0.04081632653061224,0,0
/// ```
pub fn write_field_csv<W: Write>(grid: &GlobalGrid, field: &GlobalField, writer: &mut W) -> Result<()> {
    let xs = grid.x_coords();
    let ys = grid.y_coords();
    writeln!(writer, "x,y,p")?;
    for (row, y) in ys.iter().enumerate() {
        for (col, x) in xs.iter().enumerate() {
            writeln!(writer, "{},{},{}", x, y, field.get(row, col))?;
        }
    }
    Ok(())
}

/// One-line summary of a solve.
///
/// ```text
/// 50x50 workers=1 status=max-iter iterations=2000 time=0.0123s gups=0.41
/// ```
pub fn write_summary<W: Write>(grid: &GlobalGrid, outcome: &SolveOutcome, writer: &mut W) -> Result<()> {
    write!(
        writer,
        "{}x{} workers={} status={} iterations={} time={:.4}s gups={:.2}",
        grid.nx,
        grid.ny,
        outcome.workers,
        outcome.status,
        outcome.iterations,
        outcome.elapsed.as_secs_f64(),
        outcome.gups()
    )?;
    if let Some(tol) = outcome.tolerance {
        write!(writer, " tol={tol:.1e}")?;
    }
    if let Some(diff) = outcome.final_diff {
        write!(writer, " diff={diff:.3e}")?;
    }
    writeln!(writer)?;
    Ok(())
}

/// Tabulate a sweep over square grid sizes.
pub fn write_sweep_table<W: Write>(rows: &[(usize, SolveOutcome)], writer: &mut W) -> Result<()> {
    writeln!(
        writer,
        "{:<12} | {:<10} | {:<10} | {:<10} | {:<8} | {:<10}",
        "Grid", "Tol Used", "Steps", "Time (s)", "GUPS", "Status"
    )?;
    writeln!(writer, "{}", "-".repeat(74))?;
    for (size, outcome) in rows {
        let tol = outcome
            .tolerance
            .map(|t| format!("{t:.1e}"))
            .unwrap_or_else(|| "-".into());
        writeln!(
            writer,
            "{:<12} | {:<10} | {:<10} | {:<10.4} | {:<8.3} | {:<10}",
            format!("{size}x{size}"),
            tol,
            outcome.iterations,
            outcome.elapsed.as_secs_f64(),
            outcome.gups(),
            outcome.status.to_string()
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Bounds;
    use crate::solver::SolveStatus;
    use std::time::Duration;

    fn outcome(nx: usize, ny: usize) -> SolveOutcome {
        SolveOutcome {
            iterations: 1200,
            elapsed: Duration::from_millis(250),
            warmup: Duration::ZERO,
            field: GlobalField::zeros(nx, ny),
            status: SolveStatus::Converged,
            final_diff: Some(8.5e-8),
            checks: 12,
            tolerance: Some(1e-7),
            workers: 2,
            peer_links: 1,
            staged_links: 0,
            peer_rows: 2400,
            staged_rows: 0,
        }
    }

    #[test]
    fn field_csv_has_one_line_per_point() {
        let grid = GlobalGrid::new(4, 3, Bounds::default()).unwrap();
        let mut field = GlobalField::zeros(4, 3);
        field.data[4 + 2] = 1.5;
        let mut buf = Vec::new();
        write_field_csv(&grid, &field, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "x,y,p");
        assert_eq!(lines.len(), 1 + 12);
        // Row 1, column 2: x = 2 * 2/3, y = 0.5.
        let fields: Vec<f64> = lines[1 + 4 + 2].split(',').map(|v| v.parse().unwrap()).collect();
        approx::assert_abs_diff_eq!(fields[0], 4.0 / 3.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(fields[1], 0.5, epsilon = 1e-12);
        assert_eq!(fields[2], 1.5);
    }

    #[test]
    fn summary_mentions_status_and_tolerance() {
        let grid = GlobalGrid::new(50, 50, Bounds::default()).unwrap();
        let mut buf = Vec::new();
        write_summary(&grid, &outcome(50, 50), &mut buf).unwrap();
        let line = String::from_utf8(buf).unwrap();
        assert!(line.starts_with("50x50 workers=2 status=converged iterations=1200"));
        assert!(line.contains("tol=1.0e-7"));
    }

    #[test]
    fn sweep_table_lists_every_size() {
        let rows = vec![(50, outcome(50, 50)), (100, outcome(100, 100))];
        let mut buf = Vec::new();
        write_sweep_table(&rows, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert!(text.contains("100x100"));
    }
}
