use statrs::distribution::{ContinuousCDF, StudentsT};

pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample standard deviation.
pub fn std_dev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairedTTest {
    pub t: f64,
    pub p: f64,
    pub n: usize,
}

/// Two-sided paired t-test of `a` against `b`. When the differences have no
/// variance the configured count deviation `fallback_std` takes its place;
/// without one, a nonzero mean yields an infinite statistic and
/// identically-zero differences yield NaN, which callers skip the way the
/// exporter does.
pub fn paired_t_test(a: &[f64], b: &[f64], fallback_std: f64) -> Option<PairedTTest> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let d: Vec<f64> = a.iter().zip(b).map(|(x, y)| x - y).collect();
    let n = d.len();
    let m = mean(&d);
    let mut s = std_dev(&d);
    if s == 0.0 {
        s = fallback_std;
    }
    if s == 0.0 {
        let t = if m == 0.0 {
            f64::NAN
        } else if m > 0.0 {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        };
        let p = if t.is_nan() { f64::NAN } else { 0.0 };
        return Some(PairedTTest { t, p, n });
    }
    let t = m / (s / (n as f64).sqrt());
    let dist = StudentsT::new(0.0, 1.0, (n - 1) as f64).ok()?;
    let p = 2.0 * (1.0 - dist.cdf(t.abs()));
    Some(PairedTTest { t, p, n })
}

#[cfg(test)]
mod test {
    use float_eq::assert_float_eq;

    use super::*;

    #[test]
    fn mean_and_std() {
        let xs = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_float_eq!(mean(&xs), 5.0, abs <= 1e-12);
        assert_float_eq!(std_dev(&xs), 2.138089935299395, abs <= 1e-9);
    }

    #[test]
    fn paired_test_detects_shift() {
        let a = [5.1, 4.9, 5.3, 5.2, 4.8, 5.0];
        let b = [3.0, 3.2, 2.9, 3.1, 3.0, 2.8];
        let result = paired_t_test(&a, &b, 0.0).unwrap();
        assert!(result.t > 5.0, "t = {}", result.t);
        assert!(result.p < 0.01, "p = {}", result.p);
    }

    #[test]
    fn constant_positive_difference_is_infinite() {
        let a = [2.0, 3.0, 4.0];
        let b = [1.0, 2.0, 3.0];
        let result = paired_t_test(&a, &b, 0.0).unwrap();
        assert!(result.t.is_infinite() && result.t > 0.0);
        assert_float_eq!(result.p, 0.0, abs <= 1e-12);
    }

    #[test]
    fn identical_samples_are_nan() {
        let a = [1.0, 2.0, 3.0];
        let result = paired_t_test(&a, &a, 0.0).unwrap();
        assert!(result.t.is_nan());
    }

    #[test]
    fn fallback_std_keeps_constant_differences_finite() {
        let a = [2.0, 3.0, 4.0];
        let b = [1.0, 2.0, 3.0];
        let result = paired_t_test(&a, &b, 5.0).unwrap();
        assert!(result.t.is_finite());
        assert!(result.t > 0.0);
    }

    #[test]
    fn mismatched_or_tiny_inputs_rejected() {
        assert!(paired_t_test(&[1.0], &[1.0], 0.0).is_none());
        assert!(paired_t_test(&[1.0, 2.0], &[1.0], 0.0).is_none());
    }
}
