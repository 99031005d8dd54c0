// =============================================================================
// Crossover predicate
// =============================================================================
//
// A three-valued test over the last two points of two series: did the first
// series cross above, cross below, or not cross the second at all. Shared by
// every strategy that reacts to one line crossing another (SMA crossover,
// MACD-vs-signal, price-vs-band).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossover {
    CrossUp,
    CrossDown,
    None,
}

/// Determine whether `a` crossed `b` between the previous and current
/// readings.
///
/// `CrossUp` when `a` was `<= b` and is now `> b`. `CrossDown` when `a` was
/// `>= b` and is now `< b`. `None` otherwise (including when either pair is
/// non-finite, since a crossover cannot be established from bad data).
pub fn crossover(prev_a: f64, prev_b: f64, curr_a: f64, curr_b: f64) -> Crossover {
    if ![prev_a, prev_b, curr_a, curr_b].iter().all(|v| v.is_finite()) {
        return Crossover::None;
    }

    if prev_a <= prev_b && curr_a > curr_b {
        Crossover::CrossUp
    } else if prev_a >= prev_b && curr_a < curr_b {
        Crossover::CrossDown
    } else {
        Crossover::None
    }
}

/// Apply [`crossover`] to the last two points of two equal-length series.
pub fn series_crossover(a: &[f64], b: &[f64]) -> Crossover {
    if a.len() < 2 || b.len() < 2 || a.len() != b.len() {
        return Crossover::None;
    }
    let n = a.len();
    crossover(a[n - 2], b[n - 2], a[n - 1], b[n - 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_cross_up() {
        assert_eq!(crossover(1.0, 2.0, 3.0, 2.0), Crossover::CrossUp);
    }

    #[test]
    fn detects_cross_down() {
        assert_eq!(crossover(3.0, 2.0, 1.0, 2.0), Crossover::CrossDown);
    }

    #[test]
    fn equal_then_equal_is_none() {
        assert_eq!(crossover(2.0, 2.0, 2.0, 2.0), Crossover::None);
    }

    #[test]
    fn touching_from_above_is_not_cross_up() {
        // a stays above b throughout: no cross.
        assert_eq!(crossover(3.0, 2.0, 4.0, 2.0), Crossover::None);
    }

    #[test]
    fn nan_input_is_none() {
        assert_eq!(crossover(f64::NAN, 2.0, 3.0, 2.0), Crossover::None);
    }

    #[test]
    fn series_crossover_needs_equal_length() {
        assert_eq!(series_crossover(&[1.0, 2.0], &[1.0]), Crossover::None);
    }

    #[test]
    fn series_crossover_basic() {
        let a = vec![1.0, 1.0, 3.0];
        let b = vec![2.0, 2.0, 2.0];
        assert_eq!(series_crossover(&a, &b), Crossover::CrossUp);
    }
}
