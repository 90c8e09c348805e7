use anyhow::{Result, bail};

use crate::model::ArgModel;
use crate::states::{NodeStateLookup, State, find_state};
use crate::tree::{LocalTree, Spr};
use crate::utils::logsumexp;

/// Per-time-level branch counts of a local tree.
///
/// `nbranches[t]` counts branches alive through the interval starting at
/// level `t`; `ncoals[t]` counts branches a new lineage arriving at level
/// `t` could coalesce onto. The (effective) root branch extends to the top
/// of the grid.
#[derive(Debug, Clone)]
pub struct LineageCounts {
    pub nbranches: Vec<usize>,
    pub ncoals: Vec<usize>,
}

impl LineageCounts {
    pub fn count(tree: &LocalTree, ntimes: usize, internal: bool) -> Self {
        let top = ntimes as i32 - 1;
        let root = tree.root as usize;
        let mut skip = vec![false; tree.nnodes()];
        let mut eff_root = root;
        if internal && tree.nodes[root].age > top {
            let subtree_root = tree.nodes[root].child[0] as usize;
            skip = tree.descendants_mask(subtree_root);
            skip[root] = true;
            eff_root = tree.nodes[root].child[1] as usize;
        }

        let mut nbranches = vec![0usize; ntimes];
        let mut ncoals = vec![0usize; ntimes];
        for i in 0..tree.nnodes() {
            if skip[i] {
                continue;
            }
            let age = tree.nodes[i].age.max(0);
            let parent_age = if i == eff_root {
                top
            } else {
                tree.nodes[tree.nodes[i].parent as usize].age.min(top)
            };
            for t in age..parent_age {
                nbranches[t as usize] += 1;
            }
            for t in age..=parent_age {
                ncoals[t as usize] += 1;
            }
        }
        Self { nbranches, ncoals }
    }
}

/// Factored within-block transition operator.
///
/// The transition from state `(node1, a)` to `(node2, b)` decomposes into a
/// time-only baseline `D[a]·E[b]·B[min(a,b)]` (recombination somewhere
/// below `a` on the threading lineage, survival up to `b`, coalescence onto
/// one of the `ncoals[b]` target branches) plus a same-branch correction
/// when `node1 == node2`: the threading lineage itself is one extra
/// coalescence target below `a`, and the no-recombination mass sits on the
/// diagonal. `get` is defined as exactly that sum, so the dense and
/// factored forward recurrences agree to the last bit.
#[derive(Debug, Clone)]
pub struct TransMatrix {
    pub ntimes: usize,
    pub minage: i32,
    pub internal: bool,
    d: Vec<f64>,
    e: Vec<f64>,
    bcum: Vec<f64>,
    norecombs: Vec<f64>,
}

impl TransMatrix {
    pub fn new(
        model: &ArgModel,
        tree: &LocalTree,
        lineages: &LineageCounts,
        internal: bool,
    ) -> Self {
        let ntimes = model.ntimes;
        let top = ntimes as i32 - 1;
        let root = tree.root as usize;
        let minage = if internal && tree.nodes[root].age > top {
            tree.nodes[tree.nodes[root].child[0] as usize].age
        } else {
            0
        };

        // total floored branch length, ignoring branches into a sentinel root
        let mut treelen = 0.0;
        for i in 0..tree.nnodes() {
            let parent = tree.nodes[i].parent;
            if parent == -1 || tree.nodes[parent as usize].age > top {
                continue;
            }
            treelen += tree.dist(i, &model.times).max(model.mintime);
        }

        // survival through each interval and per-level coalescence
        let mut g = vec![1.0f64; ntimes];
        for t in 0..ntimes - 1 {
            let rate = lineages.nbranches[t] as f64 / (2.0 * model.popsizes[t]);
            g[t + 1] = g[t] * (-rate * model.coal_interval(t)).exp();
        }
        let mut e = vec![0.0f64; ntimes];
        for b in 0..ntimes {
            if lineages.ncoals[b] == 0 {
                continue;
            }
            let coalprob = if b + 1 < ntimes {
                1.0 - (-model.coal_interval(b) / (2.0 * model.popsizes[b])).exp()
            } else {
                1.0
            };
            e[b] = g[b] * coalprob / lineages.ncoals[b] as f64;
        }

        // recombination opportunity below the source time
        let mut w = vec![0.0f64; ntimes];
        for r in 0..ntimes {
            w[r] = (lineages.nbranches[r.min(ntimes - 2)] as f64 + 1.0)
                * model.coal_interval(r).max(model.mintime);
        }
        let mut bcum = vec![0.0f64; ntimes];
        let mut wsum = vec![0.0f64; ntimes];
        let mut acc_b = 0.0;
        let mut acc_w = 0.0;
        for r in 0..ntimes {
            if r as i32 >= minage {
                acc_b += w[r] / g[r];
                acc_w += w[r];
            }
            bcum[r] = acc_b;
            wsum[r] = acc_w;
        }

        let mut d = vec![0.0f64; ntimes];
        let mut norecombs = vec![0.0f64; ntimes];
        for a in 0..ntimes {
            let new_branch =
                (model.times[a] - model.times[minage.max(0) as usize]).max(model.mintime);
            let full_len = treelen + new_branch;
            norecombs[a] = (-model.rho * full_len).exp();
            d[a] = if wsum[a] > 0.0 {
                (1.0 - norecombs[a]) / wsum[a]
            } else {
                0.0
            };
        }

        Self {
            ntimes,
            minage,
            internal,
            d,
            e,
            bcum,
            norecombs,
        }
    }

    /// Baseline transition mass from source time `a` to destination time
    /// `b`, independent of the destination branch.
    #[inline]
    pub fn time_only(&self, a: usize, b: usize) -> f64 {
        if (a as i32) < self.minage || (b as i32) < self.minage {
            return 0.0;
        }
        self.d[a] * self.e[b] * self.bcum[a.min(b)]
    }

    /// Extra mass for destinations on the branch carrying the source:
    /// recoalescence onto the threading lineage itself (possible only below
    /// the source time) and, on the diagonal, no recombination at all.
    #[inline]
    pub fn time_node_delta(&self, a: usize, dest: &State) -> f64 {
        let b = dest.time as usize;
        if (a as i32) < self.minage || (b as i32) < self.minage {
            return 0.0;
        }
        let mut p = 0.0;
        if b <= a {
            p += self.d[a] * self.e[b] * self.bcum[b];
        }
        if a == b {
            p += self.norecombs[a];
        }
        p
    }

    /// Dense accessor: probability of `states[j] -> states[k]`.
    pub fn get(&self, states: &[State], j: usize, k: usize) -> f64 {
        let a = states[j].time as usize;
        let mut p = self.time_only(a, states[k].time as usize);
        if states[j].node == states[k].node {
            p += self.time_node_delta(a, &states[k]);
        }
        p
    }

    /// Log-space companion of `get`, for the Viterbi maximizer.
    pub fn get_log(&self, states: &[State], j: usize, k: usize) -> f64 {
        self.get(states, j, k).ln()
    }
}

/// Normalized prior over coalescence states: survive past each level below
/// `b`, then coalesce onto one of the branches there.
pub fn calc_state_priors(
    states: &[State],
    lineages: &LineageCounts,
    model: &ArgModel,
    minage: i32,
) -> Vec<f64> {
    if states.is_empty() {
        return Vec::new();
    }
    let ntimes = model.ntimes;
    let mut g = vec![1.0f64; ntimes];
    for t in 0..ntimes - 1 {
        let rate = lineages.nbranches[t] as f64 / (2.0 * model.popsizes[t]);
        g[t + 1] = g[t] * (-rate * model.coal_interval(t)).exp();
    }
    let gmin = g[minage.max(0) as usize];

    let mut prior = vec![0.0f64; states.len()];
    let mut norm = 0.0;
    for (k, s) in states.iter().enumerate() {
        let b = s.time as usize;
        if lineages.ncoals[b] == 0 {
            continue;
        }
        let coalprob = if b + 1 < ntimes {
            1.0 - (-model.coal_interval(b) / (2.0 * model.popsizes[b])).exp()
        } else {
            1.0
        };
        prior[k] = g[b] / gmin * coalprob / lineages.ncoals[b] as f64;
        norm += prior[k];
    }
    if norm > 0.0 {
        for p in prior.iter_mut() {
            *p /= norm;
        }
    }
    prior
}

/// Cross-block transition operator at a recombination breakpoint.
///
/// Most sources map deterministically to the state their branch becomes
/// under the SPR. The two distinguished sources, the threading lineage
/// sitting exactly at the recombination point or at the recoalescence
/// point, spread over destinations per `recombrow`/`recoalrow`
/// (log-space, `-inf` for unreachable destinations).
#[derive(Debug, Clone)]
pub struct TransMatrixSwitch {
    pub nstates1: usize,
    pub nstates2: usize,
    pub recombsrc: i32,
    pub recoalsrc: i32,
    pub determ: Vec<i32>,
    pub determprob: Vec<f64>,
    pub recombrow: Vec<f64>,
    pub recoalrow: Vec<f64>,
}

impl TransMatrixSwitch {
    /// Identity switch over an unchanged state space.
    pub fn identity(nstates: usize) -> Self {
        Self {
            nstates1: nstates,
            nstates2: nstates,
            recombsrc: -1,
            recoalsrc: -1,
            determ: (0..nstates as i32).collect(),
            determprob: vec![0.0; nstates],
            recombrow: vec![f64::NEG_INFINITY; nstates.max(1)],
            recoalrow: vec![f64::NEG_INFINITY; nstates.max(1)],
        }
    }

    pub fn new(
        last_tree: &LocalTree,
        spr: &Spr,
        states1: &[State],
        states2: &[State],
        model: &ArgModel,
        lineages2: &LineageCounts,
        minage: i32,
    ) -> Result<Self> {
        let nstates1 = states1.len();
        let nstates2 = states2.len();
        let ntimes = model.ntimes;

        // degenerate internal blocks: a fully specified side acts as a
        // single pseudo-state
        if nstates2 == 0 {
            return Ok(Self {
                nstates1,
                nstates2: 0,
                recombsrc: -1,
                recoalsrc: -1,
                determ: vec![0; nstates1.max(1)],
                determprob: vec![0.0; nstates1.max(1)],
                recombrow: vec![f64::NEG_INFINITY; 1],
                recoalrow: vec![f64::NEG_INFINITY; 1],
            });
        }
        if nstates1 == 0 {
            let prior = calc_state_priors(states2, lineages2, model, minage);
            let recoalrow: Vec<f64> = prior.iter().map(|p| p.ln()).collect();
            return Ok(Self {
                nstates1: 0,
                nstates2,
                recombsrc: -1,
                recoalsrc: 0,
                determ: vec![-1],
                determprob: vec![0.0],
                recombrow: vec![f64::NEG_INFINITY; nstates2],
                recoalrow,
            });
        }

        let rnode = spr.recomb_node as usize;
        let recoal_broken = last_tree.nodes[rnode].parent;
        if recoal_broken == -1 {
            bail!("recombination branch {rnode} has no parent in the previous tree");
        }
        let sib = last_tree.sibling(rnode);
        let effective_coal = if spr.coal_node == recoal_broken {
            sib
        } else {
            spr.coal_node
        };

        let nnodes = last_tree.nnodes();
        let lookup2 = NodeStateLookup::new(states2, nnodes);

        let recombsrc = find_state(states1, State::new(spr.recomb_node, spr.recomb_time))
            .map_or(-1, |j| j as i32);
        let recoalsrc = find_state(states1, State::new(effective_coal, spr.coal_time))
            .map_or(-1, |j| j as i32);

        // deterministic branch remapping: the broken branch merges into the
        // recombination sibling, and the coalescence branch splits at the
        // coalescence time, its upper part becoming the reused node.
        let mut determ = vec![-1i32; nstates1];
        let determprob = vec![0.0f64; nstates1];
        for (j, s) in states1.iter().enumerate() {
            if j as i32 == recombsrc || j as i32 == recoalsrc {
                continue;
            }
            let mut node2 = s.node;
            if node2 == recoal_broken {
                node2 = sib;
            }
            if node2 == effective_coal && s.time > spr.coal_time {
                node2 = recoal_broken;
            }
            if node2 == spr.recomb_node && s.time > spr.coal_time {
                node2 = recoal_broken;
            }
            determ[j] = lookup2.lookup(node2 as usize, s.time);
        }

        // spread rows over the new tree's coalescence distribution
        let mut g = vec![1.0f64; ntimes];
        for t in 0..ntimes - 1 {
            let rate = lineages2.nbranches[t] as f64 / (2.0 * model.popsizes[t]);
            g[t + 1] = g[t] * (-rate * model.coal_interval(t)).exp();
        }
        let mut recombrow = vec![f64::NEG_INFINITY; nstates2.max(1)];
        if recombsrc != -1 {
            let floor = spr.recomb_time.max(minage);
            let gfloor = g[floor.max(0) as usize];
            for (k, s) in states2.iter().enumerate() {
                let b = s.time as usize;
                if s.time < floor || lineages2.ncoals[b] == 0 {
                    continue;
                }
                let coalprob = if b + 1 < ntimes {
                    1.0 - (-model.coal_interval(b) / (2.0 * model.popsizes[b])).exp()
                } else {
                    1.0
                };
                recombrow[k] = (g[b] / gfloor * coalprob / lineages2.ncoals[b] as f64).ln();
            }
            // every source row sums to one in probability space
            let norm = logsumexp(&recombrow);
            if norm.is_finite() {
                for v in recombrow.iter_mut() {
                    *v -= norm;
                }
            }
        }

        // the lineage at the recoalescence point reattaches to either side
        // of the newly inserted node
        let mut recoalrow = vec![f64::NEG_INFINITY; nstates2.max(1)];
        if recoalsrc != -1 {
            let k1 = lookup2.lookup(effective_coal as usize, spr.coal_time);
            let k2 = lookup2.lookup(recoal_broken as usize, spr.coal_time);
            match (k1, k2) {
                (-1, -1) => bail!(
                    "recoalescence state ({}, {}) has no destination",
                    spr.coal_node,
                    spr.coal_time
                ),
                (k1, -1) => recoalrow[k1 as usize] = 0.0,
                (-1, k2) => recoalrow[k2 as usize] = 0.0,
                (k1, k2) => {
                    recoalrow[k1 as usize] = 0.5f64.ln();
                    recoalrow[k2 as usize] = 0.5f64.ln();
                }
            }
        }

        Ok(Self {
            nstates1,
            nstates2,
            recombsrc,
            recoalsrc,
            determ,
            determprob,
            recombrow,
            recoalrow,
        })
    }

    /// Probability of source `j` switching to destination `k`.
    pub fn get(&self, j: usize, k: usize) -> f64 {
        if j as i32 == self.recombsrc {
            self.recombrow[k].exp()
        } else if j as i32 == self.recoalsrc {
            self.recoalrow[k].exp()
        } else if self.determ[j] == k as i32 {
            self.determprob[j].exp()
        } else {
            0.0
        }
    }

    pub fn get_log(&self, j: usize, k: usize) -> f64 {
        if j as i32 == self.recombsrc {
            self.recombrow[k]
        } else if j as i32 == self.recoalsrc {
            self.recoalrow[k]
        } else if self.determ[j] == k as i32 {
            self.determprob[j]
        } else {
            f64::NEG_INFINITY
        }
    }
}
