use anyhow::{Result, bail};
use rand::Rng;
use rand::rngs::SmallRng;

pub fn logsumexp(vals: &[f64]) -> f64 {
    let mut max = f64::NEG_INFINITY;
    for &v in vals {
        if v > max {
            max = v;
        }
    }
    if !max.is_finite() {
        return max;
    }
    let mut sum = 0.0;
    for &v in vals {
        sum += (v - max).exp();
    }
    max + sum.ln()
}

/// Draw an index proportionally to non-negative weights.
pub fn sample_index(weights: &[f64], rng: &mut SmallRng) -> Result<usize> {
    let total: f64 = weights.iter().sum();
    if !(total > 0.0) {
        bail!("cannot sample from a weight vector with no mass");
    }
    let mut r = rng.gen_range(0.0..total);
    for (i, w) in weights.iter().enumerate() {
        r -= w;
        if r < 0.0 {
            return Ok(i);
        }
    }
    Ok(weights.len() - 1)
}

/// Relative-or-absolute float comparison.
pub fn fequal(a: f64, b: f64, rel: f64, abs: f64) -> bool {
    let diff = (a - b).abs();
    if diff <= abs {
        return true;
    }
    diff / a.abs().max(b.abs()) <= rel
}
