use anyhow::{Context, Result, bail};
use rand::rngs::SmallRng;

use crate::forward::{ForwardTable, forward_alg};
use crate::matrices::ArgMatrixIter;
use crate::model::ArgModel;
use crate::progress;
use crate::sequences::Sequences;
use crate::states::{State, find_state, get_coal_states};
use crate::traceback::{max_traceback, stochastic_traceback};
use crate::trans::LineageCounts;
use crate::tree::{LocalTreeSpr, LocalTrees, Spr};
use crate::utils::sample_index;

/// A recombination point along the chromosome: branch and grid time.
/// `node == -1` places the recombination on the threading lineage itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePoint {
    pub node: i32,
    pub time: i32,
}

fn block_minage(trees: &LocalTrees, block: usize, ntimes: usize, internal: bool) -> i32 {
    let tree = &trees.blocks[block].tree;
    let root = tree.root as usize;
    if internal && tree.nodes[root].age > ntimes as i32 - 1 {
        tree.nodes[tree.nodes[root].child[0] as usize].age
    } else {
        0
    }
}

fn recombinations(
    trees: &LocalTrees,
    model: &ArgModel,
    path: &[i32],
    internal: bool,
    mut choose: impl FnMut(&[f64]) -> Result<usize>,
) -> Result<Vec<(usize, NodePoint)>> {
    let start_coord = trees.start_coord;
    let ntimes = model.ntimes;
    let mut out = Vec::new();

    let mut pos = start_coord;
    for (b, block) in trees.blocks.iter().enumerate() {
        let states = get_coal_states(&block.tree, ntimes, internal);
        let lineages = LineageCounts::count(&block.tree, ntimes, internal);
        let minage = block_minage(trees, b, ntimes, internal);

        // interior positions, plus an unswitched boundary into this block
        let first = if b > 0 && block.spr.is_none() {
            pos
        } else {
            pos + 1
        };
        for i in first..pos + block.blocklen {
            let prev = path[i - 1 - start_coord];
            let cur = path[i - start_coord];
            if prev == cur || states.is_empty() {
                continue;
            }
            let a = states[prev as usize].time;
            let bt = states[cur as usize].time;
            let rmax = a.min(bt);
            if rmax < minage {
                bail!("path changes state below minage at position {i}");
            }
            let weights: Vec<f64> = (minage..=rmax)
                .map(|r| {
                    let seg = (r as usize).min(ntimes - 2);
                    (lineages.nbranches[seg] as f64 + 1.0)
                        * model.coal_interval(r as usize).max(model.mintime)
                })
                .collect();
            let r = minage + choose(&weights)? as i32;
            out.push((i, NodePoint { node: -1, time: r }));
        }
        pos += block.blocklen;
    }
    Ok(out)
}

/// Sample one recombination point for every within-block state change of
/// the path. Breakpoints the ARG already carries are not re-sampled.
pub fn sample_recombinations(
    trees: &LocalTrees,
    model: &ArgModel,
    path: &[i32],
    internal: bool,
    rng: &mut SmallRng,
) -> Result<Vec<(usize, NodePoint)>> {
    recombinations(trees, model, path, internal, |weights| {
        sample_index(weights, rng)
    })
}

/// Deterministic variant: take the highest-weight recombination time.
pub fn max_recombinations(
    trees: &LocalTrees,
    model: &ArgModel,
    path: &[i32],
    internal: bool,
) -> Result<Vec<(usize, NodePoint)>> {
    recombinations(trees, model, path, internal, |weights| {
        let mut maxi = 0;
        for i in 1..weights.len() {
            if weights[i] > weights[maxi] {
                maxi = i;
            }
        }
        Ok(maxi)
    })
}

/// Splice the sampled thread into the ARG: split blocks at the sampled
/// breakpoints, add the thread branch to every local tree per its path
/// state, and install the new recombinations while remapping the old ones
/// under the displacement convention.
pub fn add_arg_thread(
    trees: &mut LocalTrees,
    ntimes: usize,
    path: &[i32],
    new_chrom: usize,
    recombs: &[(usize, NodePoint)],
) -> Result<()> {
    let start_coord = trees.start_coord;
    let nleaves = trees.nleaves();
    if new_chrom != nleaves {
        bail!(
            "threading adds chromosome {} as the next leaf, got {}",
            nleaves,
            new_chrom
        );
    }
    let newleaf = nleaves as i32;

    let mut recomb_iter = recombs.iter().peekable();
    let mut new_blocks: Vec<LocalTreeSpr> = Vec::new();
    let mut pos = start_coord;
    for block in &trees.blocks {
        let states = get_coal_states(&block.tree, ntimes, false);
        let old_nnodes = block.tree.nnodes() as i32;
        let remap = |x: i32| if x == newleaf { old_nnodes } else { x };
        let block_end = pos + block.blocklen;

        // breakpoints inside this block, plus one exactly at an unswitched
        // boundary
        let mut boundaries: Vec<(usize, Option<NodePoint>)> = vec![(pos, None)];
        while let Some(&&(rpos, point)) = recomb_iter.peek() {
            if rpos >= block_end {
                break;
            }
            recomb_iter.next();
            if rpos == pos {
                boundaries[0].1 = Some(point);
            } else {
                boundaries.push((rpos, Some(point)));
            }
        }

        for (s, (seg_start, point)) in boundaries.iter().enumerate() {
            let seg_end = boundaries
                .get(s + 1)
                .map_or(block_end, |(next, _)| *next);
            let state_idx = path[seg_start - start_coord];
            let state = *states
                .get(state_idx as usize)
                .with_context(|| format!("path state {state_idx} out of range at {seg_start}"))?;

            let mut tree = block.tree.clone();
            tree.add_thread_branch(state.node as usize, state.time);

            let spr = match (point, s, &block.spr) {
                // sampled breakpoint: the thread lineage recombines and
                // recoalesces at the segment's state
                (Some(point), _, _) => Some(Spr {
                    recomb_node: if point.node == -1 {
                        newleaf
                    } else {
                        remap(point.node)
                    },
                    recomb_time: point.time,
                    coal_node: remap(state.node),
                    coal_time: state.time,
                }),
                // the ARG's own breakpoint, remapped into augmented indices
                (None, 0, Some(spr)) => Some(Spr {
                    recomb_node: remap(spr.recomb_node),
                    recomb_time: spr.recomb_time,
                    coal_node: remap(spr.coal_node),
                    coal_time: spr.coal_time,
                }),
                (None, _, _) => None,
            };
            new_blocks.push(LocalTreeSpr {
                tree,
                spr,
                blocklen: seg_end - seg_start,
            });
        }
        pos = block_end;
    }

    *trees = LocalTrees::new(start_coord, new_blocks)?;
    Ok(())
}

/// Internal-threading splice: regraft each block's pruned subtree at its
/// path state, restoring full local trees. SPR application preserves node
/// indices, so existing breakpoints carry over unchanged.
pub fn add_arg_thread_path(
    trees: &mut LocalTrees,
    ntimes: usize,
    path: &[i32],
    recombs: &[(usize, NodePoint)],
) -> Result<()> {
    let start_coord = trees.start_coord;
    let mut recomb_iter = recombs.iter().peekable();
    let mut new_blocks: Vec<LocalTreeSpr> = Vec::new();
    let mut pos = start_coord;
    for block in &trees.blocks {
        let states = get_coal_states(&block.tree, ntimes, true);
        let block_end = pos + block.blocklen;
        let root = block.tree.root as usize;
        let partial = block.tree.nodes[root].age > ntimes as i32 - 1;
        let subtree_root = block.tree.nodes[root].child[0];
        let subtree_age = if partial {
            block.tree.nodes[subtree_root as usize].age
        } else {
            0
        };

        let mut boundaries: Vec<(usize, Option<NodePoint>)> = vec![(pos, None)];
        while let Some(&&(rpos, point)) = recomb_iter.peek() {
            if rpos >= block_end {
                break;
            }
            recomb_iter.next();
            if rpos == pos {
                boundaries[0].1 = Some(point);
            } else {
                boundaries.push((rpos, Some(point)));
            }
        }

        for (s, (seg_start, point)) in boundaries.iter().enumerate() {
            let seg_end = boundaries
                .get(s + 1)
                .map_or(block_end, |(next, _)| *next);
            let mut tree = block.tree.clone();
            let mut seg_state = None;
            if partial && !states.is_empty() {
                let state_idx = path[seg_start - start_coord];
                let state = *states
                    .get(state_idx as usize)
                    .with_context(|| format!("path state {state_idx} out of range at {seg_start}"))?;
                tree.apply_spr(&Spr::new(subtree_root, subtree_age, state.node, state.time))?;
                seg_state = Some(state);
            }

            let spr = match (point, s, &block.spr) {
                (Some(point), _, _) => {
                    let state = seg_state
                        .context("sampled a breakpoint for a fully specified block")?;
                    Some(Spr {
                        recomb_node: if point.node == -1 {
                            subtree_root
                        } else {
                            point.node
                        },
                        recomb_time: point.time,
                        coal_node: state.node,
                        coal_time: state.time,
                    })
                }
                (None, 0, Some(spr)) => Some(*spr),
                (None, _, _) => None,
            };
            new_blocks.push(LocalTreeSpr {
                tree,
                spr,
                blocklen: seg_end - seg_start,
            });
        }
        pos = block_end;
    }

    *trees = LocalTrees::new(start_coord, new_blocks)?;
    Ok(())
}

/// Detach the last chromosome's lineage from every local tree. Breakpoints
/// carried by the detached lineage disappear, merging their blocks;
/// recoalescences onto it move to the branch that absorbed it.
pub fn remove_arg_thread(trees: &mut LocalTrees, chrom: usize) -> Result<()> {
    let nleaves = trees.nleaves();
    if chrom != nleaves - 1 {
        bail!(
            "only the last chromosome ({}) can be detached, got {}",
            nleaves - 1,
            chrom
        );
    }

    let mut maps = Vec::with_capacity(trees.ntrees());
    let mut attach = Vec::with_capacity(trees.ntrees());
    for block in &mut trees.blocks {
        let (map, node, time) = block.tree.remove_leaf_branch(chrom)?;
        maps.push(map);
        attach.push((node, time));
    }

    let blocks = std::mem::take(&mut trees.blocks);
    let mut new_blocks: Vec<LocalTreeSpr> = Vec::new();
    for (b, block) in blocks.into_iter().enumerate() {
        if b == 0 {
            new_blocks.push(block);
            continue;
        }
        let prev_map = &maps[b - 1];
        let mut spr = None;
        if let Some(old) = block.spr {
            let recomb_node = prev_map
                .get(old.recomb_node as usize)
                .copied()
                .unwrap_or(-1);
            if recomb_node == -1 {
                // the recombination was on the detached lineage
                let prev = new_blocks.last_mut().expect("first block is never merged");
                if prev.tree == block.tree {
                    prev.blocklen += block.blocklen;
                    continue;
                }
            } else {
                let mut coal_node = prev_map.get(old.coal_node as usize).copied().unwrap_or(-1);
                if coal_node == -1 {
                    coal_node = attach[b - 1].0 as i32;
                }
                spr = Some(Spr {
                    recomb_node,
                    recomb_time: old.recomb_time,
                    coal_node,
                    coal_time: old.coal_time,
                });
            }
        }
        new_blocks.push(LocalTreeSpr {
            tree: block.tree,
            spr,
            blocklen: block.blocklen,
        });
    }

    *trees = LocalTrees::new(trees.start_coord, new_blocks)?;
    Ok(())
}

/// Thread one new chromosome through the ARG: forward pass, stochastic
/// traceback, recombination sampling, splice.
pub fn sample_arg_thread(
    model: &ArgModel,
    sequences: &Sequences,
    trees: &mut LocalTrees,
    new_chrom: usize,
    rng: &mut SmallRng,
    progress_enabled: bool,
) -> Result<()> {
    let mut fw = ForwardTable::new(trees.start_coord, trees.length());
    let mut path = vec![0i32; trees.length()];

    let pb = progress_enabled.then(|| progress::spinner("thread", "forward"));
    let mut iter = ArgMatrixIter::new(model, Some(sequences), trees, new_chrom, false);
    forward_alg(trees, model, &mut iter, &mut fw, false, false)?;
    if let Some(pb) = pb {
        pb.finish_with_message("forward done");
    }

    let pb = progress_enabled.then(|| progress::spinner("thread", "traceback"));
    let mut iter = ArgMatrixIter::new(model, None, trees, new_chrom, false);
    stochastic_traceback(trees, &mut iter, &fw, &mut path, false, rng)?;
    if let Some(pb) = pb {
        pb.finish_with_message("traceback done");
    }

    let recombs = sample_recombinations(trees, model, &path, false, rng)?;
    add_arg_thread(trees, model.ntimes, &path, new_chrom, &recombs)
}

/// Maximum-path variant of `sample_arg_thread`.
pub fn max_arg_thread(
    model: &ArgModel,
    sequences: &Sequences,
    trees: &mut LocalTrees,
    new_chrom: usize,
    progress_enabled: bool,
) -> Result<()> {
    let mut fw = ForwardTable::new(trees.start_coord, trees.length());
    let mut path = vec![0i32; trees.length()];

    let pb = progress_enabled.then(|| progress::spinner("thread", "forward"));
    let mut iter = ArgMatrixIter::new(model, Some(sequences), trees, new_chrom, false);
    forward_alg(trees, model, &mut iter, &mut fw, false, false)?;
    if let Some(pb) = pb {
        pb.finish_with_message("forward done");
    }

    let pb = progress_enabled.then(|| progress::spinner("thread", "viterbi"));
    let mut iter = ArgMatrixIter::new(model, None, trees, new_chrom, false);
    max_traceback(trees, &mut iter, &fw, &mut path, false)?;
    if let Some(pb) = pb {
        pb.finish_with_message("viterbi done");
    }

    let recombs = max_recombinations(trees, model, &path, false)?;
    add_arg_thread(trees, model.ntimes, &path, new_chrom, &recombs)
}

/// Thread with pinned endpoints. A `None` pin means "sample it"; a given
/// pin must name a state of the corresponding boundary block.
pub fn cond_sample_arg_thread(
    model: &ArgModel,
    sequences: &Sequences,
    trees: &mut LocalTrees,
    new_chrom: usize,
    start_state: Option<State>,
    end_state: Option<State>,
    rng: &mut SmallRng,
) -> Result<()> {
    let start_coord = trees.start_coord;
    let mut fw = ForwardTable::new(start_coord, trees.length());
    let mut path = vec![0i32; trees.length()];

    let mut iter = ArgMatrixIter::new(model, Some(sequences), trees, new_chrom, false);
    let mut prior_given = false;
    if let Some(start) = start_state {
        iter.seek_start()?;
        let block = iter.block()?;
        let j = find_state(&block.states, start)
            .with_context(|| format!("start state ({}, {}) not found", start.node, start.time))?;
        fw.new_block(block.start, block.start + block.blocklen, block.states.len());
        fw.col_mut(start_coord)[j] = 1.0;
        prior_given = true;
    }
    forward_alg(trees, model, &mut iter, &mut fw, prior_given, false)?;

    let mut last_state_given = false;
    if let Some(end) = end_state {
        let last = trees.blocks.last().expect("an ARG has at least one block");
        let states = get_coal_states(&last.tree, model.ntimes, false);
        let j = find_state(&states, end)
            .with_context(|| format!("end state ({}, {}) not found", end.node, end.time))?;
        path[trees.end_coord - 1 - start_coord] = j as i32;
        last_state_given = true;
    }

    let mut iter = ArgMatrixIter::new(model, None, trees, new_chrom, false);
    stochastic_traceback(trees, &mut iter, &fw, &mut path, last_state_given, rng)?;

    let recombs = sample_recombinations(trees, model, &path, false, rng)?;
    add_arg_thread(trees, model.ntimes, &path, new_chrom, &recombs)
}

/// Detach one chromosome and thread it back in.
pub fn resample_arg_thread(
    model: &ArgModel,
    sequences: &Sequences,
    trees: &mut LocalTrees,
    chrom: usize,
    rng: &mut SmallRng,
    progress_enabled: bool,
) -> Result<()> {
    remove_arg_thread(trees, chrom)?;
    sample_arg_thread(model, sequences, trees, chrom, rng, progress_enabled)
}

/// Thread a pruned internal branch back through an ARG of partial trees.
pub fn sample_arg_thread_internal(
    model: &ArgModel,
    sequences: &Sequences,
    trees: &mut LocalTrees,
    rng: &mut SmallRng,
    progress_enabled: bool,
) -> Result<()> {
    let mut fw = ForwardTable::new(trees.start_coord, trees.length());
    let mut path = vec![0i32; trees.length()];

    let pb = progress_enabled.then(|| progress::spinner("thread", "forward"));
    let mut iter = ArgMatrixIter::new(model, Some(sequences), trees, 0, true);
    forward_alg(trees, model, &mut iter, &mut fw, false, false)?;
    if let Some(pb) = pb {
        pb.finish_with_message("forward done");
    }

    let pb = progress_enabled.then(|| progress::spinner("thread", "traceback"));
    let mut iter = ArgMatrixIter::new(model, None, trees, 0, true);
    stochastic_traceback(trees, &mut iter, &fw, &mut path, false, rng)?;
    if let Some(pb) = pb {
        pb.finish_with_message("traceback done");
    }

    let recombs = sample_recombinations(trees, model, &path, true, rng)?;
    add_arg_thread_path(trees, model.ntimes, &path, &recombs)
}

/// Internal-branch threading with pinned endpoints; fully specified
/// boundary blocks pin themselves.
pub fn cond_sample_arg_thread_internal(
    model: &ArgModel,
    sequences: &Sequences,
    trees: &mut LocalTrees,
    start_state: Option<State>,
    end_state: Option<State>,
    rng: &mut SmallRng,
) -> Result<()> {
    let start_coord = trees.start_coord;
    let mut fw = ForwardTable::new(start_coord, trees.length());
    let mut path = vec![0i32; trees.length()];

    let mut iter = ArgMatrixIter::new(model, Some(sequences), trees, 0, true);
    iter.seek_start()?;
    let mut prior_given = false;
    {
        let block = iter.block()?;
        if block.states.is_empty() {
            fw.new_block(block.start, block.start + block.blocklen, 0);
            fw.col_mut(start_coord)[0] = 1.0;
            prior_given = true;
        } else if let Some(start) = start_state {
            let j = find_state(&block.states, start)
                .with_context(|| format!("start state ({}, {}) not found", start.node, start.time))?;
            fw.new_block(block.start, block.start + block.blocklen, block.states.len());
            fw.col_mut(start_coord)[j] = 1.0;
            prior_given = true;
        }
    }
    forward_alg(trees, model, &mut iter, &mut fw, prior_given, false)?;

    let mut last_state_given = false;
    {
        let last = trees.blocks.last().expect("an ARG has at least one block");
        let states = get_coal_states(&last.tree, model.ntimes, true);
        if states.is_empty() {
            path[trees.end_coord - 1 - start_coord] = 0;
            last_state_given = true;
        } else if let Some(end) = end_state {
            let j = find_state(&states, end)
                .with_context(|| format!("end state ({}, {}) not found", end.node, end.time))?;
            path[trees.end_coord - 1 - start_coord] = j as i32;
            last_state_given = true;
        }
    }

    let mut iter = ArgMatrixIter::new(model, None, trees, 0, true);
    stochastic_traceback(trees, &mut iter, &fw, &mut path, last_state_given, rng)?;

    let recombs = sample_recombinations(trees, model, &path, true, rng)?;
    add_arg_thread_path(trees, model.ntimes, &path, &recombs)
}
