use anyhow::{Context, Result, bail};
use rand::rngs::SmallRng;

use crate::forward::ForwardTable;
use crate::matrices::ArgMatrixIter;
use crate::states::State;
use crate::trans::{TransMatrix, TransMatrixSwitch};
use crate::tree::LocalTrees;
use crate::utils::sample_index;

/// Sample `path[pos0 .. pos0+blocklen-1]` backward within one block.
/// `path` holds state indices for the whole region; the entry after the
/// block's last sampled position must already be set.
fn sample_block(
    blocklen: usize,
    states: &[State],
    trans: &TransMatrix,
    fw: &ForwardTable,
    pos0: usize,
    path: &mut [i32],
    start_coord: usize,
    rng: &mut SmallRng,
) -> Result<()> {
    if states.is_empty() {
        for i in 0..blocklen.saturating_sub(1) {
            path[pos0 + i - start_coord] = 0;
        }
        return Ok(());
    }
    let nstates = states.len();
    let mut trans_col = vec![0.0f64; nstates];
    let mut weights = vec![0.0f64; nstates];
    let mut last_k = -1i32;

    for i in (0..blocklen - 1).rev() {
        let k = path[pos0 + i + 1 - start_coord];
        if k != last_k {
            for (j, t) in trans_col.iter_mut().enumerate() {
                *t = trans.get(states, j, k as usize);
            }
            last_k = k;
        }
        let col = fw.col(pos0 + i);
        for j in 0..nstates {
            weights[j] = col[j] * trans_col[j];
        }
        let j = sample_index(&weights, rng)
            .with_context(|| format!("traceback dead-end at position {}", pos0 + i))?;
        if trans_col[j] == 0.0 {
            bail!(
                "forward table and transition operator disagree at position {}",
                pos0 + i
            );
        }
        path[pos0 + i - start_coord] = j as i32;
    }
    Ok(())
}

fn sample_switch_step(
    switch_mat: &TransMatrixSwitch,
    col1: &[f64],
    state2: usize,
    pos: usize,
    rng: &mut SmallRng,
) -> Result<usize> {
    let nstates1 = switch_mat.nstates1.max(1);
    let weights: Vec<f64> = (0..nstates1)
        .map(|j| col1[j] * switch_mat.get(j, state2))
        .collect();
    sample_index(&weights, rng)
        .with_context(|| format!("traceback dead-end at switch position {pos}"))
}

/// Stochastic backward pass: walk blocks in reverse, sampling each state
/// proportionally to forward mass times the transition into the already
/// sampled successor.
///
/// The returned value is a diagnostic proxy, accumulated from the endpoint
/// column and the switch steps only; it is not a normalized likelihood.
pub fn stochastic_traceback(
    trees: &LocalTrees,
    iter: &mut ArgMatrixIter,
    fw: &ForwardTable,
    path: &mut [i32],
    last_state_given: bool,
    rng: &mut SmallRng,
) -> Result<f64> {
    let start_coord = trees.start_coord;
    let mut pos = trees.end_coord;
    let mut lnl = 0.0;

    iter.seek_end()?;
    if !last_state_given {
        let block = iter.block()?;
        let nstates = block.states.len().max(1);
        let col = fw.col(pos - 1);
        let k = sample_index(&col[..nstates], rng)
            .with_context(|| format!("degenerate final column at position {}", pos - 1))?;
        path[pos - 1 - start_coord] = k as i32;
        lnl = col[k].ln();
    }

    loop {
        {
            let block = iter.block()?;
            pos -= block.blocklen;
            sample_block(
                block.blocklen,
                &block.states,
                &block.trans,
                fw,
                pos,
                path,
                start_coord,
                rng,
            )?;

            // fill the last column of the preceding block
            if pos > start_coord {
                if let Some(switch_mat) = &block.switch_mat {
                    let i = pos - 1;
                    let k2 = path[pos - start_coord] as usize;
                    let col1 = fw.col(i);
                    let j = sample_switch_step(switch_mat, col1, k2, i, rng)?;
                    path[i - start_coord] = j as i32;
                    lnl += (col1[j] * switch_mat.get(j, k2)).ln();
                } else {
                    // unswitched boundary: one more step of this block's
                    // recurrence
                    sample_block(
                        2,
                        &block.states,
                        &block.trans,
                        fw,
                        pos - 1,
                        path,
                        start_coord,
                        rng,
                    )?;
                }
            }
        }
        if !iter.retreat()? {
            break;
        }
    }
    Ok(lnl)
}

/// Maximize `path[pos0 .. pos0+blocklen-1]` backward within one block, in
/// log space.
fn max_block(
    blocklen: usize,
    states: &[State],
    trans: &TransMatrix,
    fw: &ForwardTable,
    pos0: usize,
    path: &mut [i32],
    start_coord: usize,
) {
    if states.is_empty() {
        for i in 0..blocklen.saturating_sub(1) {
            path[pos0 + i - start_coord] = 0;
        }
        return;
    }
    let nstates = states.len();
    let mut trans_col = vec![0.0f64; nstates];
    let mut last_k = -1i32;

    for i in (0..blocklen - 1).rev() {
        let k = path[pos0 + i + 1 - start_coord];
        if k != last_k {
            for (j, t) in trans_col.iter_mut().enumerate() {
                *t = trans.get_log(states, j, k as usize);
            }
            last_k = k;
        }
        let col = fw.col(pos0 + i);
        let mut maxj = 0;
        let mut maxprob = col[0].ln() + trans_col[0];
        for j in 1..nstates {
            let prob = col[j].ln() + trans_col[j];
            if prob > maxprob {
                maxj = j;
                maxprob = prob;
            }
        }
        path[pos0 + i - start_coord] = maxj as i32;
    }
}

fn max_switch_step(switch_mat: &TransMatrixSwitch, col1: &[f64], state2: usize) -> usize {
    let nstates1 = switch_mat.nstates1.max(1);
    let mut maxj = 0;
    let mut maxprob = col1[0].ln() + switch_mat.get_log(0, state2);
    for j in 1..nstates1 {
        let prob = col1[j].ln() + switch_mat.get_log(j, state2);
        if prob > maxprob {
            maxj = j;
            maxprob = prob;
        }
    }
    maxj
}

/// Viterbi-style backward pass over the forward lattice, entirely in log
/// space.
pub fn max_traceback(
    trees: &LocalTrees,
    iter: &mut ArgMatrixIter,
    fw: &ForwardTable,
    path: &mut [i32],
    last_state_given: bool,
) -> Result<()> {
    let start_coord = trees.start_coord;
    let mut pos = trees.end_coord;

    iter.seek_end()?;
    if !last_state_given {
        let block = iter.block()?;
        let nstates = block.states.len().max(1);
        let col = fw.col(pos - 1);
        let mut maxi = 0;
        for i in 1..nstates {
            if col[i] > col[maxi] {
                maxi = i;
            }
        }
        path[pos - 1 - start_coord] = maxi as i32;
    }

    loop {
        {
            let block = iter.block()?;
            pos -= block.blocklen;
            max_block(
                block.blocklen,
                &block.states,
                &block.trans,
                fw,
                pos,
                path,
                start_coord,
            );

            if pos > start_coord {
                if let Some(switch_mat) = &block.switch_mat {
                    let i = pos - 1;
                    let k2 = path[pos - start_coord] as usize;
                    path[i - start_coord] = max_switch_step(switch_mat, fw.col(i), k2) as i32;
                } else {
                    max_block(
                        2,
                        &block.states,
                        &block.trans,
                        fw,
                        pos - 1,
                        path,
                        start_coord,
                    );
                }
            }
        }
        if !iter.retreat()? {
            break;
        }
    }
    Ok(())
}
