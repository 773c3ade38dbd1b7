// =============================================================================
// Bands — population-standard-deviation envelope around an SMA
// =============================================================================
//
// mid   = SMA(close, length)
// sigma = population standard deviation of the same window
// upper = mid + mult * sigma
// lower = mid - mult * sigma
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandsResult {
    pub upper: f64,
    pub mid: f64,
    pub lower: f64,
}

/// Compute the bands for the most recent `length`-sized window of `closes`.
///
/// Returns `None` when there are fewer than `length` closes or the middle
/// band is zero (degenerate input).
pub fn bands(closes: &[f64], length: usize, mult: f64) -> Option<BandsResult> {
    if length == 0 || closes.len() < length {
        return None;
    }

    let window = &closes[closes.len() - length..];
    let mid = window.iter().sum::<f64>() / length as f64;
    if mid == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - mid).powi(2)).sum::<f64>() / length as f64;
    let sigma = variance.sqrt();

    let upper = mid + mult * sigma;
    let lower = mid - mult * sigma;

    if upper.is_finite() && lower.is_finite() {
        Some(BandsResult { upper, mid, lower })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_basic() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let b = bands(&closes, 20, 1.0).unwrap();
        assert!(b.upper > b.mid);
        assert!(b.lower < b.mid);
    }

    #[test]
    fn bands_insufficient_data() {
        assert!(bands(&[1.0, 2.0], 20, 1.0).is_none());
    }

    #[test]
    fn bands_flat_series_zero_width() {
        let closes = vec![100.0; 20];
        let b = bands(&closes, 20, 1.0).unwrap();
        assert!((b.upper - b.lower).abs() < 1e-10);
    }
}
