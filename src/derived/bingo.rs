use crate::models::BoardSize;

/// Output of the line detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineReport {
    /// Line identifiers: `row_i`, `col_i`, `diag_main`, `diag_anti`.
    pub completed_lines: Vec<String>,
    /// Every cell on the board is complete.
    pub full_board: bool,
}

impl LineReport {
    pub fn line_count(&self) -> i64 {
        self.completed_lines.len() as i64
    }
}

/// Finds completed rows, columns and diagonals on a row-major grid of
/// cell completion. Cells missing from a short slice count as
/// incomplete rather than erroring.
pub fn detect_lines(cells: &[bool], size: BoardSize) -> LineReport {
    let n = size.dimension();
    let cell = |row: usize, col: usize| cells.get(row * n + col).copied().unwrap_or(false);

    let mut completed_lines = Vec::new();

    for row in 0..n {
        if (0..n).all(|col| cell(row, col)) {
            completed_lines.push(format!("row_{}", row));
        }
    }
    for col in 0..n {
        if (0..n).all(|row| cell(row, col)) {
            completed_lines.push(format!("col_{}", col));
        }
    }
    if (0..n).all(|i| cell(i, i)) {
        completed_lines.push("diag_main".to_string());
    }
    if (0..n).all(|i| cell(i, n - 1 - i)) {
        completed_lines.push("diag_anti".to_string());
    }

    let full_board = (0..n * n).all(|i| cells.get(i).copied().unwrap_or(false));

    LineReport {
        completed_lines,
        full_board,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_grid_has_no_lines() {
        let report = detect_lines(&[false; 9], BoardSize::Three);
        assert!(report.completed_lines.is_empty());
        assert!(!report.full_board);
    }

    #[test]
    fn test_single_row() {
        let mut cells = [false; 9];
        cells[0] = true;
        cells[1] = true;
        cells[2] = true;
        let report = detect_lines(&cells, BoardSize::Three);
        assert_eq!(report.completed_lines, vec!["row_0".to_string()]);
        assert!(!report.full_board);
    }

    #[test]
    fn test_full_board_counts_all_lines() {
        let report = detect_lines(&[true; 9], BoardSize::Three);
        // 3 rows + 3 columns + 2 diagonals
        assert_eq!(report.completed_lines.len(), 8);
        assert!(report.full_board);
    }

    #[test]
    fn test_column_and_diagonals() {
        // col 0 plus main diagonal on a 3x3
        let mut cells = [false; 9];
        for row in 0..3 {
            cells[row * 3] = true; // col 0
            cells[row * 3 + row] = true; // diagonal
        }
        let report = detect_lines(&cells, BoardSize::Three);
        assert!(report.completed_lines.contains(&"col_0".to_string()));
        assert!(report.completed_lines.contains(&"diag_main".to_string()));
        assert!(!report.completed_lines.contains(&"diag_anti".to_string()));
    }

    #[test]
    fn test_anti_diagonal_five() {
        let n = 5;
        let mut cells = vec![false; n * n];
        for i in 0..n {
            cells[i * n + (n - 1 - i)] = true;
        }
        let report = detect_lines(&cells, BoardSize::Five);
        assert_eq!(report.completed_lines, vec!["diag_anti".to_string()]);
    }

    #[test]
    fn test_short_slice_treated_as_incomplete() {
        // Only 3 cells supplied for a 3x3 board
        let report = detect_lines(&[true, true, true], BoardSize::Three);
        assert_eq!(report.completed_lines, vec!["row_0".to_string()]);
        assert!(!report.full_board);
    }
}
