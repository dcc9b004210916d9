//! Splitting of a global index range into contiguous device bands.

use crate::error::{Result, SpmvError};

/// Divides `[0, n)` into `weights.len()` contiguous bands.
///
/// Band `d` is `[part[d], part[d + 1])`. Each band size is proportional to the
/// device weight and rounded up to a multiple of `alignment`; the last
/// boundary is always `n`. A weight vector summing to zero is treated as
/// uniform.
pub fn partition(n: usize, weights: &[f64], alignment: usize) -> Result<Vec<usize>> {
    if weights.is_empty() {
        return Err(SpmvError::NoDevices);
    }
    if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
        return Err(SpmvError::InvalidWeights(format!(
            "device weights must be finite and non-negative, got {}",
            w
        )));
    }

    let alignment = alignment.max(1);
    let total: f64 = weights.iter().sum();
    let uniform = total <= 0.0;
    let nd = weights.len();

    let mut part = vec![0usize; nd + 1];
    let mut acc = 0.0f64;
    for (d, &w) in weights.iter().enumerate() {
        acc += if uniform { 1.0 } else { w };
        let share = if uniform { nd as f64 } else { total };
        let target = (n as f64 * acc / share).round() as usize;
        part[d + 1] = align_up(target, alignment).clamp(part[d], n);
    }
    part[nd] = n;

    log::trace!("partition of {} over {:?}: {:?}", n, weights, part);
    Ok(part)
}

fn align_up(n: usize, alignment: usize) -> usize {
    n.div_ceil(alignment) * alignment
}

/// Returns the band sizes of a partition.
pub fn band_sizes(part: &[usize]) -> Vec<usize> {
    part.windows(2).map(|w| w[1] - w[0]).collect()
}
