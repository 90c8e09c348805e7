use anyhow::{Result, bail};

use crate::io::params::{ArgParamsFile, save_params};

/// Fraction of the first time step used as the branch-length floor.
const MINTIME_FRAC: f64 = 0.1;

/// Demographic and mutation model shared by every stage of threading.
///
/// Times are a strictly increasing grid; node ages index into it. `mintime`
/// floors every branch length so that zero-length branches cannot produce
/// degenerate substitution probabilities.
#[derive(Debug, Clone)]
pub struct ArgModel {
    pub ntimes: usize,
    pub times: Vec<f64>,
    pub popsizes: Vec<f64>,
    pub rho: f64,
    pub mu: f64,
    pub mintime: f64,
}

impl ArgModel {
    /// Build a model over an exponentially spaced time grid, the standard
    /// discretization for coalescent HMMs: fine near the present, coarse in
    /// the deep past.
    pub fn new(
        ntimes: usize,
        maxtime: f64,
        delta: f64,
        popsize: f64,
        rho: f64,
        mu: f64,
    ) -> Result<Self> {
        if ntimes < 2 {
            bail!("ntimes must be >= 2, got {ntimes}");
        }
        if !(maxtime > 0.0) || !(delta > 0.0) {
            bail!("maxtime and delta must be > 0");
        }
        let scale = (1.0 + delta * maxtime).ln() / (ntimes - 1) as f64;
        let times: Vec<f64> = (0..ntimes)
            .map(|i| ((scale * i as f64).exp() - 1.0) / delta)
            .collect();
        Self::from_times(times, vec![popsize; ntimes], rho, mu)
    }

    /// Build a model from an explicit time grid.
    pub fn from_times(times: Vec<f64>, popsizes: Vec<f64>, rho: f64, mu: f64) -> Result<Self> {
        let ntimes = times.len();
        if ntimes < 2 {
            bail!("time grid must have at least 2 points, got {ntimes}");
        }
        for w in times.windows(2) {
            if !(w[1] > w[0]) {
                bail!("time grid must be strictly increasing ({} !< {})", w[0], w[1]);
            }
        }
        if popsizes.len() != ntimes {
            bail!(
                "popsizes length {} does not match ntimes {}",
                popsizes.len(),
                ntimes
            );
        }
        for (k, n) in popsizes.iter().enumerate() {
            if !(*n > 0.0) {
                bail!("popsize at time {k} must be > 0, got {n}");
            }
        }
        if !(rho >= 0.0) || !(mu >= 0.0) {
            bail!("rho and mu must be >= 0");
        }
        let mintime = MINTIME_FRAC * times[1];
        Ok(Self {
            ntimes,
            times,
            popsizes,
            rho,
            mu,
            mintime,
        })
    }

    /// Sentinel age given to the root of a partial tree whose threading
    /// branch has been removed. Always greater than any real grid age.
    pub fn removed_root_time(&self) -> i32 {
        self.ntimes as i32 + 1
    }

    /// Model applying at a genomic coordinate. Mutation and recombination
    /// maps are uniform here, so every position sees the same parameters.
    pub fn local_model(&self, _pos: usize) -> &ArgModel {
        self
    }

    /// Grid time for an age index, clamping sentinel ages to the top level.
    pub fn time_at(&self, age: i32) -> f64 {
        let idx = (age.max(0) as usize).min(self.ntimes - 1);
        self.times[idx]
    }

    /// Width of the coalescence interval starting at level `t`.
    pub fn coal_interval(&self, t: usize) -> f64 {
        if t + 1 < self.ntimes {
            self.times[t + 1] - self.times[t]
        } else {
            self.times[self.ntimes - 1] - self.times[self.ntimes - 2]
        }
    }

    pub fn save_params(&self, path: &std::path::Path) -> Result<()> {
        let params = ArgParamsFile {
            times: self.times.clone(),
            popsizes: self.popsizes.clone(),
            rho: self.rho,
            mu: self.mu,
        };
        save_params(path, &params)
    }
}
