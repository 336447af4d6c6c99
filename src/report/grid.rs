//! Two-dimensional layout of nodes for the heat grid.

/// Rows and columns of the node grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
    pub rows: usize,
    pub cols: usize,
}

impl GridShape {
    /// Grid cell of node `index`, filled row by row.
    pub fn position(&self, index: usize) -> Option<(usize, usize)> {
        if self.cols == 0 || index >= self.rows * self.cols {
            return None;
        }
        Some((index / self.cols, index % self.cols))
    }

    pub fn cells(&self) -> usize {
        self.rows * self.cols
    }
}

/// Squarest grid holding `nodes` cells.
///
/// Uses the two middle proper divisors of the node count. A prime count has
/// no useful divisors and is padded by one, leaving one empty cell. Counts too
/// small to factor fall back to a single row.
pub fn grid_shape(nodes: usize) -> GridShape {
    if nodes == 0 {
        return GridShape { rows: 0, cols: 0 };
    }

    let mut number = nodes;
    let mut divisors = proper_divisors(number);
    if divisors.len() <= 1 {
        number += 1;
        divisors = proper_divisors(number);
    }

    let lower = divisors.get(divisors.len() / 2).copied();
    let upper = divisors.get(divisors.len().div_ceil(2)).copied();

    match (lower, upper) {
        (Some(cols), Some(rows)) if cols * rows == number => GridShape { rows, cols },
        _ => GridShape {
            rows: 1,
            cols: nodes,
        },
    }
}

/// Divisors of `n` in `1..=n/2`, ascending.
fn proper_divisors(n: usize) -> Vec<usize> {
    (1..=n / 2).filter(|i| n % i == 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_shapes() {
        assert_eq!(grid_shape(4), GridShape { rows: 2, cols: 2 });
        assert_eq!(grid_shape(6), GridShape { rows: 3, cols: 2 });
        assert_eq!(grid_shape(8), GridShape { rows: 4, cols: 2 });
        assert_eq!(grid_shape(9), GridShape { rows: 3, cols: 3 });
        assert_eq!(grid_shape(12), GridShape { rows: 4, cols: 3 });
    }

    #[test]
    fn test_prime_counts_are_padded() {
        assert_eq!(grid_shape(7), GridShape { rows: 4, cols: 2 });
        assert_eq!(grid_shape(3), GridShape { rows: 2, cols: 2 });
        assert_eq!(grid_shape(7).cells(), 8);
    }

    #[test]
    fn test_tiny_counts_use_a_single_row() {
        assert_eq!(grid_shape(1), GridShape { rows: 1, cols: 1 });
        assert_eq!(grid_shape(2), GridShape { rows: 1, cols: 2 });
        assert_eq!(grid_shape(0).cells(), 0);
    }

    #[test]
    fn test_position_is_row_major() {
        let shape = grid_shape(6);
        assert_eq!(shape.position(0), Some((0, 0)));
        assert_eq!(shape.position(3), Some((1, 1)));
        assert_eq!(shape.position(6), None);
    }
}
