//! Post-run correctness check of the working arrays.

use tracing::{debug, error, info};

use super::{StreamElement, SCALAR};

/// Offending elements kept per array for the debug log.
const MAX_REPORTED_ELEMENTS: usize = 8;

/// One element outside tolerance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffendingElement {
    pub index: usize,
    pub observed: f64,
}

/// Outcome of checking one array against its expected value.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayCheck {
    pub array: &'static str,
    pub expected: f64,
    pub avg_abs_err: f64,
    pub avg_rel_err: f64,
    pub failing_elements: usize,
    pub first_failing: Vec<OffendingElement>,
    pub passed: bool,
}

/// Validation of a, b and c after a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub epsilon: f64,
    pub checks: Vec<ArrayCheck>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Logs failures at error level and the offending elements at debug.
    pub fn log(&self, rank: usize) {
        if self.passed() {
            debug!(
                rank,
                epsilon = self.epsilon,
                "solution validates: avg error less than epsilon on all three arrays",
            );
            return;
        }

        for check in self.checks.iter().filter(|c| !c.passed) {
            error!(
                rank,
                array = check.array,
                expected = check.expected,
                avg_abs_err = check.avg_abs_err,
                avg_rel_err = check.avg_rel_err,
                failing_elements = check.failing_elements,
                epsilon = self.epsilon,
                "failed validation",
            );
            for element in &check.first_failing {
                debug!(
                    rank,
                    array = check.array,
                    index = element.index,
                    expected = check.expected,
                    observed = element.observed,
                    "offending element",
                );
            }
        }
        info!(rank, "results are still reported");
    }
}

/// Values every element of a, b and c must hold after `repetitions`
/// repetitions, computed with the same arithmetic as the kernels.
pub fn expected_values<T: StreamElement>(repetitions: usize) -> (T, T, T) {
    let scalar = T::from_f64(SCALAR);
    let mut aj = T::from_f64(1.0);
    let mut bj = T::from_f64(2.0);
    let mut cj = T::from_f64(0.0);

    aj = T::from_f64(2.0) * aj;
    for _ in 0..repetitions {
        cj = aj;
        bj = scalar * cj;
        cj = aj + bj;
        aj = bj + scalar * cj;
    }
    (aj, bj, cj)
}

/// Checks the arrays against [`expected_values`].
pub fn validate<T: StreamElement>(a: &[T], b: &[T], c: &[T], repetitions: usize) -> ValidationReport {
    let (aj, bj, cj) = expected_values::<T>(repetitions);
    ValidationReport {
        epsilon: T::EPSILON,
        checks: vec![
            check_array("a", a, aj.to_f64(), T::EPSILON),
            check_array("b", b, bj.to_f64(), T::EPSILON),
            check_array("c", c, cj.to_f64(), T::EPSILON),
        ],
    }
}

fn check_array<T: StreamElement>(name: &'static str, values: &[T], expected: f64, epsilon: f64) -> ArrayCheck {
    let sum_err: f64 = values.iter().map(|v| (v.to_f64() - expected).abs()).sum();
    let avg_abs_err = if values.is_empty() {
        0.0
    } else {
        sum_err / values.len() as f64
    };
    let avg_rel_err = (avg_abs_err / expected).abs();
    let passed = avg_rel_err <= epsilon;

    let mut failing_elements = 0;
    let mut first_failing = Vec::new();
    if !passed {
        for (j, v) in values.iter().enumerate() {
            let observed = v.to_f64();
            if (observed / expected - 1.0).abs() > epsilon {
                failing_elements += 1;
                if first_failing.len() < MAX_REPORTED_ELEMENTS {
                    first_failing.push(OffendingElement { index: j, observed });
                }
            }
        }
    }

    ArrayCheck {
        array: name,
        expected,
        avg_abs_err,
        avg_rel_err,
        failing_elements,
        first_failing,
        passed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_values_one_repetition() {
        // a=2 after calibration; c=2, b=6, c=8, a=6+24.
        let (a, b, c) = expected_values::<f64>(1);
        assert_eq!((a, b, c), (30.0, 6.0, 8.0));
    }

    #[test]
    fn test_validate_accepts_exact_arrays() {
        let (aj, bj, cj) = expected_values::<f64>(5);
        let report = validate(&[aj; 8], &[bj; 8], &[cj; 8], 5);
        assert!(report.passed());
        assert_eq!(report.checks.len(), 3);
    }

    #[test]
    fn test_validate_flags_corrupted_elements() {
        let (aj, bj, cj) = expected_values::<f64>(3);
        let mut b = vec![bj; 10];
        b[4] = 0.0;
        b[7] = bj * 2.0;

        let report = validate(&[aj; 10], &b, &[cj; 10], 3);
        assert!(!report.passed());

        let failed = &report.checks[1];
        assert_eq!(failed.array, "b");
        assert!(!failed.passed);
        assert_eq!(failed.failing_elements, 2);
        assert_eq!(
            failed.first_failing,
            vec![
                OffendingElement {
                    index: 4,
                    observed: 0.0
                },
                OffendingElement {
                    index: 7,
                    observed: bj * 2.0
                },
            ]
        );
        assert_eq!(failed.expected, bj);
        assert!(report.checks[0].passed);
        assert!(report.checks[2].passed);
    }

    #[test]
    fn test_single_precision_threshold_is_looser() {
        let (aj, bj, cj) = expected_values::<f32>(2);
        let nudged = aj * (1.0 + 1.0e-7);
        let report = validate(&[nudged; 4], &[bj; 4], &[cj; 4], 2);
        assert_eq!(report.epsilon, 1.0e-6);
        assert!(report.passed());
    }
}
