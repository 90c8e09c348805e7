use anyhow::{Context, Result, bail};
use ndarray::{Array2, ArrayView1};

use crate::matrices::ArgMatrixIter;
use crate::model::ArgModel;
use crate::states::{NodeStateLookup, State};
use crate::trans::{TransMatrix, TransMatrixSwitch, calc_state_priors};
use crate::tree::{LocalTree, LocalTrees};

/// Driver-owned forward lattice: one normalized column per genomic
/// position, ragged across blocks because the state space changes.
#[derive(Debug)]
pub struct ForwardTable {
    start_coord: usize,
    columns: Vec<Vec<f64>>,
}

impl ForwardTable {
    pub fn new(start_coord: usize, length: usize) -> Self {
        Self {
            start_coord,
            columns: vec![Vec::new(); length],
        }
    }

    /// Allocate zeroed columns for `[start, end)` with `nstates` entries
    /// each (at least one, for degenerate internal blocks).
    pub fn new_block(&mut self, start: usize, end: usize, nstates: usize) {
        for pos in start..end {
            self.columns[pos - self.start_coord] = vec![0.0; nstates.max(1)];
        }
    }

    pub fn col(&self, pos: usize) -> &[f64] {
        &self.columns[pos - self.start_coord]
    }

    pub fn col_mut(&mut self, pos: usize) -> &mut Vec<f64> {
        let i = pos - self.start_coord;
        &mut self.columns[i]
    }

    /// Borrow the column before `pos` and the column at `pos` together.
    fn step_pair(&mut self, pos: usize) -> (&[f64], &mut Vec<f64>) {
        let i = pos - self.start_coord;
        let (lo, hi) = self.columns.split_at_mut(i);
        (&lo[i - 1], &mut hi[0])
    }
}

fn check_column(col: &[f64], pos: usize) -> Result<()> {
    let top = col.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(top > 0.0) {
        bail!("forward column has no mass at position {pos}");
    }
    Ok(())
}

/// One block of the forward recurrence with the factored transition
/// operator: group the previous column by source time, contract against the
/// time-only table, then add the same-branch corrections along each
/// destination branch's contiguous run of source states.
///
/// Column `pos0` must be pre-populated. `emit_offset` shifts the emission
/// row used for table column `pos0 + i` (0 normally, -1 when continuing a
/// block across an unswitched boundary).
pub fn forward_block(
    tree: &LocalTree,
    ntimes: usize,
    blocklen: usize,
    states: &[State],
    trans: &TransMatrix,
    emit: &Array2<f64>,
    emit_offset: i32,
    fw: &mut ForwardTable,
    pos0: usize,
) -> Result<()> {
    if states.is_empty() {
        // fully specified internal block: carry the single column forward
        for i in 1..blocklen {
            let v = fw.col(pos0 + i - 1)[0];
            fw.col_mut(pos0 + i)[0] = v;
        }
        return Ok(());
    }

    let nstates = states.len();
    let minage = trans.minage;
    let nnodes = tree.nnodes();
    let root = tree.root as usize;

    let mut tmatrix = Array2::<f64>::zeros((ntimes, ntimes));
    for a in 0..ntimes {
        for b in 0..ntimes {
            let v = trans.time_only(a, b);
            if v.is_nan() {
                bail!("transition table has NaN at times ({a}, {b})");
            }
            tmatrix[[a, b]] = v;
        }
    }
    let mut tmatrix2 = Array2::<f64>::zeros((ntimes, nstates));
    for a in 0..ntimes {
        for (k, state) in states.iter().enumerate() {
            tmatrix2[[a, k]] = trans.time_node_delta(a, state);
        }
    }

    let maxtime = states.iter().map(|s| s.time).max().unwrap_or(0);
    let maintree_root = if trans.internal {
        tree.nodes[root].child[1]
    } else {
        -1
    };
    let lookup = NodeStateLookup::new(states, nnodes);
    let mut ages1 = vec![0i32; nnodes];
    let mut ages2 = vec![0i32; nnodes];
    let mut indexes = vec![-1i32; nnodes];
    for i in 0..nnodes {
        ages1[i] = tree.nodes[i].age.max(minage);
        indexes[i] = lookup.lookup(i, ages1[i]);
        ages2[i] = if i == root || i as i32 == maintree_root {
            maxtime
        } else {
            tree.nodes[tree.nodes[i].parent as usize].age
        };
    }

    let mut fgroups = vec![0.0f64; ntimes];
    let mut tf = vec![0.0f64; ntimes];
    for i in 1..blocklen {
        let emit_row = emit.row((i as i32 + emit_offset) as usize);
        let (col1, col2) = fw.step_pair(pos0 + i);

        fgroups.fill(0.0);
        for (j, s) in states.iter().enumerate() {
            fgroups[s.time as usize] += col1[j];
        }
        for b in 0..ntimes {
            let mut sum = 0.0;
            for a in 0..ntimes {
                sum += tmatrix[[a, b]] * fgroups[a];
            }
            tf[b] = sum;
        }

        let mut norm = 0.0;
        for (k, state) in states.iter().enumerate() {
            let node2 = state.node as usize;
            let mut sum = tf[state.time as usize];
            let mut j = indexes[node2];
            debug_assert!(j >= 0, "branch with a state has no state run");
            let mut a = ages1[node2];
            while a <= ages2[node2] {
                sum += tmatrix2[[a as usize, k]] * col1[j as usize];
                j += 1;
                a += 1;
            }
            let v = sum * emit_row[k];
            col2[k] = v;
            norm += v;
        }
        if !(norm > 0.0) {
            bail!("forward column has no mass at position {}", pos0 + i);
        }
        for v in col2.iter_mut() {
            *v /= norm;
        }
    }
    Ok(())
}

/// Dense reference for `forward_block`: materialize the full transition
/// matrix and do the quadratic recurrence.
pub fn forward_block_slow(
    blocklen: usize,
    states: &[State],
    trans: &TransMatrix,
    emit: &Array2<f64>,
    emit_offset: i32,
    fw: &mut ForwardTable,
    pos0: usize,
) -> Result<()> {
    if states.is_empty() {
        for i in 1..blocklen {
            let v = fw.col(pos0 + i - 1)[0];
            fw.col_mut(pos0 + i)[0] = v;
        }
        return Ok(());
    }
    let nstates = states.len();
    let mut transmat = Array2::<f64>::zeros((nstates, nstates));
    for j in 0..nstates {
        for k in 0..nstates {
            transmat[[j, k]] = trans.get(states, j, k);
        }
    }

    for i in 1..blocklen {
        let emit_row = emit.row((i as i32 + emit_offset) as usize);
        let (col1, col2) = fw.step_pair(pos0 + i);
        let mut norm = 0.0;
        for k in 0..nstates {
            let mut sum = 0.0;
            for j in 0..nstates {
                sum += col1[j] * transmat[[j, k]];
            }
            let v = sum * emit_row[k];
            col2[k] = v;
            norm += v;
        }
        if !(norm > 0.0) {
            bail!("forward column has no mass at position {}", pos0 + i);
        }
        for v in col2.iter_mut() {
            *v /= norm;
        }
    }
    Ok(())
}

/// Forward step across a recombination breakpoint: deterministic sources
/// concentrate on their targets, the two distinguished sources spread over
/// their rows, and the new block's first emission column applies.
pub fn forward_switch(
    col1: &[f64],
    col2: &mut [f64],
    switch_mat: &TransMatrixSwitch,
    emit_row: ArrayView1<f64>,
    pos: usize,
) -> Result<()> {
    let nstates1 = switch_mat.nstates1.max(1);
    let nstates2 = switch_mat.nstates2.max(1);
    for v in col2.iter_mut() {
        *v = 0.0;
    }

    for j in 0..nstates1 {
        let k = switch_mat.determ[j];
        if j as i32 != switch_mat.recombsrc && j as i32 != switch_mat.recoalsrc && k != -1 {
            col2[k as usize] += col1[j] * switch_mat.determprob[j].exp();
        }
    }

    let mut norm = 0.0;
    for (k, v) in col2.iter_mut().enumerate().take(nstates2) {
        if switch_mat.recombsrc != -1 && switch_mat.recombrow[k] > f64::NEG_INFINITY {
            *v += col1[switch_mat.recombsrc as usize] * switch_mat.recombrow[k].exp();
        }
        if switch_mat.recoalsrc != -1 && switch_mat.recoalrow[k] > f64::NEG_INFINITY {
            *v += col1[switch_mat.recoalsrc as usize] * switch_mat.recoalrow[k].exp();
        }
        *v *= emit_row[k];
        norm += *v;
    }

    check_column(col2, pos)?;
    for v in col2.iter_mut() {
        *v /= norm;
    }
    Ok(())
}

/// Run the forward algorithm over every block of the ARG.
///
/// The first column comes from the caller (`prior_given`) or from the state
/// prior; switch columns bridge recombination breakpoints; an unswitched
/// boundary extends the previous block's recurrence by one column.
pub fn forward_alg(
    trees: &LocalTrees,
    model: &ArgModel,
    iter: &mut ArgMatrixIter,
    fw: &mut ForwardTable,
    prior_given: bool,
    slow: bool,
) -> Result<()> {
    iter.seek_start()?;
    loop {
        {
            let block = iter.block()?;
            let pos = block.start;
            let local_model = model.local_model(pos);
            let emit = block
                .emit
                .as_ref()
                .context("forward pass needs an iterator with sequences")?;

            if pos > trees.start_coord || !prior_given {
                fw.new_block(pos, pos + block.blocklen, block.states.len());
            }

            let mut pos0 = pos;
            let mut blocklen = block.blocklen;
            let mut emit_offset = 0i32;
            if pos == trees.start_coord {
                if !prior_given {
                    let prior = calc_state_priors(
                        &block.states,
                        &block.lineages,
                        local_model,
                        block.trans.minage,
                    );
                    let col = fw.col_mut(pos);
                    if prior.is_empty() {
                        col[0] = 1.0;
                    } else {
                        col.copy_from_slice(&prior);
                    }
                }
            } else if let Some(switch_mat) = &block.switch_mat {
                let (col1, col2) = fw.step_pair(pos);
                forward_switch(col1, col2, switch_mat, emit.row(0), pos)?;
            } else {
                // same state space as the previous block: extend its
                // recurrence across the boundary
                pos0 = pos - 1;
                blocklen += 1;
                emit_offset = -1;
            }
            check_column(fw.col(pos0), pos0)?;

            if slow {
                forward_block_slow(blocklen, &block.states, &block.trans, emit, emit_offset, fw, pos0)?;
            } else {
                forward_block(
                    &trees.blocks[block.index].tree,
                    local_model.ntimes,
                    blocklen,
                    &block.states,
                    &block.trans,
                    emit,
                    emit_offset,
                    fw,
                    pos0,
                )?;
            }
            check_column(fw.col(pos + block.blocklen - 1), pos + block.blocklen - 1)?;
        }
        if !iter.advance()? {
            break;
        }
    }
    Ok(())
}
