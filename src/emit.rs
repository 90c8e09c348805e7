use anyhow::Result;
use ndarray::Array2;
use rayon::prelude::*;

use crate::model::ArgModel;
use crate::sequences::{Sequences, base_index};
use crate::states::State;
use crate::tree::{LocalTree, LocalTrees, Spr};

/// Partial likelihood over the four bases at one node.
type LkRow = [f64; 4];

/// Jukes-Cantor substitution probability over a branch of length `t`.
#[inline]
fn prob_branch(t: f64, mu: f64, is_mut: bool) -> f64 {
    const F: f64 = 4.0 / 3.0;
    if is_mut {
        0.25 * (1.0 - (-F * mu * t).exp())
    } else {
        0.25 * (1.0 + 3.0 * (-F * mu * t).exp())
    }
}

/// Mark the sites at which every chromosome carries the same base.
pub fn find_invariant_sites(seqs: &[&[u8]]) -> Vec<bool> {
    let seqlen = seqs.first().map_or(0, |s| s.len());
    (0..seqlen)
        .map(|i| {
            let c = seqs[0][i].to_ascii_uppercase();
            seqs[1..].iter().all(|s| s[i].to_ascii_uppercase() == c)
        })
        .collect()
}

/// Per-branch mutation/no-mutation probabilities and the floored total tree
/// length. Branches into a sentinel root are left at zero; nothing reads
/// them.
fn branch_prob_tables(tree: &LocalTree, model: &ArgModel) -> (Vec<f64>, Vec<f64>, f64) {
    let n = tree.nnodes();
    let top = model.ntimes as i32 - 1;
    let mut muts = vec![0.0; n];
    let mut nomuts = vec![0.0; n];
    let mut treelen = 0.0;
    for i in 0..n {
        let parent = tree.nodes[i].parent;
        if parent == -1 || tree.nodes[parent as usize].age > top {
            continue;
        }
        let t = tree.dist(i, &model.times).max(model.mintime);
        muts[i] = prob_branch(t, model.mu, true);
        nomuts[i] = prob_branch(t, model.mu, false);
        treelen += t;
    }
    (muts, nomuts, treelen)
}

fn likelihood_site_node_inner(
    tree: &LocalTree,
    node: usize,
    seqs: &[&[u8]],
    pos: usize,
    muts: &[f64],
    nomuts: &[f64],
    inner: &mut [LkRow],
) {
    let n = &tree.nodes[node];
    if n.is_leaf() {
        match base_index(seqs[node][pos]) {
            Some(b) => {
                inner[node] = [0.0; 4];
                inner[node][b] = 1.0;
            }
            None => inner[node] = [1.0; 4],
        }
    } else {
        let c1 = n.child[0] as usize;
        let c2 = n.child[1] as usize;
        for a in 0..4 {
            let mut p1 = 0.0;
            let mut p2 = 0.0;
            for b in 0..4 {
                if a == b {
                    p1 += inner[c1][b] * nomuts[c1];
                    p2 += inner[c2][b] * nomuts[c2];
                } else {
                    p1 += inner[c1][b] * muts[c1];
                    p2 += inner[c2][b] * muts[c2];
                }
            }
            inner[node][a] = p1 * p2;
        }
    }
}

/// Felsenstein pruning over `order` (a valid postorder restricted to the
/// nodes that need recomputation). Returns the site likelihood.
fn likelihood_site_inner(
    tree: &LocalTree,
    seqs: &[&[u8]],
    pos: usize,
    order: &[usize],
    muts: &[f64],
    nomuts: &[f64],
    inner: &mut [LkRow],
) -> f64 {
    for &node in order {
        likelihood_site_node_inner(tree, node, seqs, pos, muts, nomuts, inner);
    }
    let root = tree.root as usize;
    inner[root].iter().sum::<f64>() * 0.25
}

fn likelihood_site_node_outer(
    tree: &LocalTree,
    root: usize,
    node: usize,
    muts: &[f64],
    nomuts: &[f64],
    inner: &[LkRow],
    outer: &mut [LkRow],
) {
    if node == root {
        outer[node] = [1.0; 4];
        return;
    }
    let sib = tree.sibling(node) as usize;
    let parent = tree.nodes[node].parent as usize;
    for a in 0..4 {
        let mut p1 = 0.0;
        let mut p2 = 0.0;
        for b in 0..4 {
            if a == b {
                p1 += inner[sib][b] * nomuts[sib];
                p2 += outer[parent][b] * nomuts[parent];
            } else {
                p1 += inner[sib][b] * muts[sib];
                p2 += outer[parent][b] * muts[parent];
            }
        }
        outer[node][a] = if parent != root { p1 * p2 } else { p1 };
    }
}

/// "From above" marginals, preorder from the maintree root.
fn likelihood_site_outer(
    tree: &LocalTree,
    muts: &[f64],
    nomuts: &[f64],
    inner: &[LkRow],
    outer: &mut [LkRow],
) {
    let maintree_root = tree.nodes[tree.root as usize].child[1] as usize;
    let mut stack = vec![maintree_root];
    while let Some(node) = stack.pop() {
        likelihood_site_node_outer(tree, maintree_root, node, muts, nomuts, inner, outer);
        for &c in &tree.nodes[node].child {
            if c != -1 {
                stack.push(c as usize);
            }
        }
    }
}

/// Fill inner and outer tables for every variant site of a partial tree.
fn calc_inner_outer(
    tree: &LocalTree,
    model: &ArgModel,
    seqs: &[&[u8]],
    invariant: &[bool],
    inner: &mut [Vec<LkRow>],
    outer: &mut [Vec<LkRow>],
) {
    let order = tree.postorder();
    let (muts, nomuts, _) = branch_prob_tables(tree, model);
    inner
        .par_iter_mut()
        .zip(outer.par_iter_mut())
        .enumerate()
        .for_each(|(i, (inr, out))| {
            if !invariant[i] {
                likelihood_site_inner(tree, seqs, i, &order, &muts, &nomuts, inr);
                likelihood_site_outer(tree, &muts, &nomuts, inr, out);
            }
        });
}

/// Emission column for one augmented tree.
///
/// With `prev_node`/`new_node` given, only the ancestor paths of the
/// previous and current attachment points are recomputed: the previous path
/// is marked dirty, the walk from the new attachment stops at the first
/// dirty node, and the dirty path itself is then redone bottom-up. The
/// per-site tables carry everything else over from the previous state.
fn likelihood_sites(
    tree: &LocalTree,
    model: &ArgModel,
    seqs: &[&[u8]],
    statei: usize,
    invariant: &[bool],
    emit: &mut Array2<f64>,
    table: &mut [Vec<LkRow>],
    prev_node: i32,
    new_node: i32,
) {
    let order: Vec<usize> = if prev_node == -1 || new_node == -1 {
        tree.postorder()
    } else {
        let mut dirty = vec![false; tree.nnodes()];
        let mut j = prev_node;
        while j != -1 {
            dirty[j as usize] = true;
            j = tree.nodes[j as usize].parent;
        }
        let mut order = Vec::new();
        let mut j = new_node as usize;
        while !dirty[j] {
            order.push(j);
            j = tree.nodes[j].parent as usize;
        }
        let mut j = prev_node;
        while j != -1 {
            order.push(j as usize);
            j = tree.nodes[j as usize].parent;
        }
        order
    };

    let (muts, nomuts, treelen) = branch_prob_tables(tree, model);
    let invariant_lk = 0.25 * (-model.mu * treelen.max(model.mintime)).exp();

    let col: Vec<f64> = table
        .par_iter_mut()
        .enumerate()
        .map(|(i, inner)| {
            if invariant[i] {
                invariant_lk
            } else {
                likelihood_site_inner(tree, seqs, i, &order, &muts, &nomuts, inner)
            }
        })
        .collect();
    for (i, v) in col.into_iter().enumerate() {
        emit[[i, statei]] = v;
    }
}

fn calc_emissions_with(
    states: &[State],
    tree: &LocalTree,
    seqs: &[&[u8]],
    model: &ArgModel,
    emit: &mut Array2<f64>,
    reuse: bool,
) {
    let seqlen = seqs.first().map_or(0, |s| s.len());
    let invariant = find_invariant_sites(seqs);
    let mut table: Vec<Vec<LkRow>> = vec![vec![[0.0; 4]; tree.nnodes() + 2]; seqlen];

    let newleaf = tree.nleaves() as i32;
    let displaced = tree.nnodes() as i32;
    let remap = |x: i32| if x == newleaf { displaced } else { x };

    let mut tree2 = tree.clone();
    let mut prev_node = -1i32;
    for (j, state) in states.iter().enumerate() {
        tree2.add_thread_branch(state.node as usize, state.time);
        let new_node = remap(state.node);
        let (p, n) = if reuse && j > 0 {
            (prev_node, new_node)
        } else {
            (-1, -1)
        };
        likelihood_sites(&tree2, model, seqs, j, &invariant, emit, &mut table, p, n);
        tree2.remove_thread_branch();
        prev_node = remap(tree.nodes[state.node as usize].parent);
    }
}

/// Emissions for external threading: each candidate state attaches a new
/// leaf branch to the tree. Successive states reuse the per-site tables via
/// the dirty-set postorder.
pub fn calc_emissions(
    states: &[State],
    tree: &LocalTree,
    seqs: &[&[u8]],
    model: &ArgModel,
    emit: &mut Array2<f64>,
) {
    calc_emissions_with(states, tree, seqs, model, emit, true);
}

/// Full-postorder reference for `calc_emissions`.
pub fn calc_emissions_slow(
    states: &[State],
    tree: &LocalTree,
    seqs: &[&[u8]],
    model: &ArgModel,
    emit: &mut Array2<f64>,
) {
    calc_emissions_with(states, tree, seqs, model, emit, false);
}

/// Emissions for internal threading: the subtree root regrafts onto branch
/// `state.node` at `state.time`. The likelihood factorizes over the subtree
/// inner table, the attachment branch's inner table and its outer
/// complement, joined by the three edges meeting at the coalescence point.
pub fn calc_emissions_internal(
    states: &[State],
    tree: &LocalTree,
    seqs: &[&[u8]],
    model: &ArgModel,
    emit: &mut Array2<f64>,
) {
    let seqlen = seqs.first().map_or(0, |s| s.len());
    if states.is_empty() {
        // fully specified local tree
        for i in 0..seqlen {
            emit[[i, 0]] = 1.0;
        }
        return;
    }

    let root = tree.root as usize;
    let subtree_root = tree.nodes[root].child[0] as usize;
    let maintree_root = tree.nodes[root].child[1] as usize;
    let mintime = model.mintime;

    let invariant = find_invariant_sites(seqs);
    let mut inner: Vec<Vec<LkRow>> = vec![vec![[0.0; 4]; tree.nnodes()]; seqlen];
    let mut outer: Vec<Vec<LkRow>> = vec![vec![[0.0; 4]; tree.nnodes()]; seqlen];
    calc_inner_outer(tree, model, seqs, &invariant, &mut inner, &mut outer);

    // floored lengths of the two partial trees, excluding each root branch
    let subtree_len = |start: usize| -> f64 {
        let mut total = 0.0;
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if node != start {
                total += tree.dist(node, &model.times).max(mintime);
            }
            for &c in &tree.nodes[node].child {
                if c != -1 {
                    stack.push(c as usize);
                }
            }
        }
        total
    };
    let maintreelen = subtree_len(maintree_root);
    let subtreelen = subtree_len(subtree_root);

    for (j, state) in states.iter().enumerate() {
        let node1 = subtree_root;
        let node2 = state.node as usize;
        let parent = tree.nodes[node2].parent as usize;

        let time1 = model.time_at(tree.nodes[node1].age);
        let time2 = model.time_at(tree.nodes[node2].age);
        let parent_time = model.time_at(tree.nodes[parent].age);
        let coal_time = model.times[state.time as usize];

        let dist1 = (coal_time - time1).max(mintime);
        let dist2 = (coal_time - time2).max(mintime);
        let dist3 = (parent_time - coal_time).max(mintime);

        let mut1 = prob_branch(dist1, model.mu, true);
        let mut2 = prob_branch(dist2, model.mu, true);
        let mut3 = prob_branch(dist3, model.mu, true);
        let nomut1 = prob_branch(dist1, model.mu, false);
        let nomut2 = prob_branch(dist2, model.mu, false);
        let nomut3 = prob_branch(dist3, model.mu, false);

        let treelen = if node2 == maintree_root {
            maintreelen
                + subtreelen
                + dist1
                + (coal_time - model.time_at(tree.nodes[maintree_root].age)).max(mintime)
        } else {
            maintreelen + subtreelen + dist1
        };
        let invariant_lk = 0.25 * (-model.mu * treelen.max(mintime)).exp();

        let col: Vec<f64> = (0..seqlen)
            .into_par_iter()
            .map(|i| {
                if invariant[i] {
                    return invariant_lk;
                }
                let inr = &inner[i];
                let out = &outer[i];
                let mut lk = 0.0;
                for a in 0..4 {
                    let mut p1 = 0.0;
                    let mut p2 = 0.0;
                    let mut p3 = 0.0;
                    for b in 0..4 {
                        if a == b {
                            p1 += inr[node1][b] * nomut1;
                            p2 += inr[node2][b] * nomut2;
                            p3 += out[node2][b] * nomut3;
                        } else {
                            p1 += inr[node1][b] * mut1;
                            p2 += inr[node2][b] * mut2;
                            p3 += out[node2][b] * mut3;
                        }
                    }
                    if node2 != maintree_root {
                        lk += p1 * p2 * p3 * 0.25;
                    } else {
                        lk += p1 * p2 * 0.25;
                    }
                }
                lk
            })
            .collect();
        for (i, v) in col.into_iter().enumerate() {
            emit[[i, j]] = v;
        }
    }
}

/// SPR-based reference for `calc_emissions_internal`: regraft, run the full
/// pruning pass, prune back.
pub fn calc_emissions_internal_slow(
    states: &[State],
    tree: &LocalTree,
    seqs: &[&[u8]],
    model: &ArgModel,
    emit: &mut Array2<f64>,
) -> Result<()> {
    let seqlen = seqs.first().map_or(0, |s| s.len());
    if states.is_empty() {
        for i in 0..seqlen {
            emit[[i, 0]] = 1.0;
        }
        return Ok(());
    }

    let root = tree.root as usize;
    let subtree_root = tree.nodes[root].child[0];
    let subtree_age = tree.nodes[subtree_root as usize].age;
    let maxtime = model.removed_root_time();

    let invariant = find_invariant_sites(seqs);
    let mut table: Vec<Vec<LkRow>> = vec![vec![[0.0; 4]; tree.nnodes()]; seqlen];
    let mut tree2 = tree.clone();
    for (j, state) in states.iter().enumerate() {
        tree2.apply_spr(&Spr::new(subtree_root, subtree_age, state.node, state.time))?;
        likelihood_sites(&tree2, model, seqs, j, &invariant, emit, &mut table, -1, -1);
        let root2 = tree2.root;
        tree2.apply_spr(&Spr::new(subtree_root, subtree_age, root2, maxtime))?;
    }
    Ok(())
}

/// Log-likelihood of the observed alignment over `[start, end)` under a
/// fixed tree, with the invariant-site likelihood computed once.
pub fn likelihood_tree(
    tree: &LocalTree,
    model: &ArgModel,
    seqs: &[&[u8]],
    start: usize,
    end: usize,
) -> f64 {
    let order = tree.postorder();
    let (muts, nomuts, _) = branch_prob_tables(tree, model);
    let mut table = vec![[0.0f64; 4]; tree.nnodes()];
    let mut invariant_lk = -1.0;
    let mut lnl = 0.0;

    for i in start..end {
        let c = seqs[0][i].to_ascii_uppercase();
        let invariant = seqs[1..].iter().all(|s| s[i].to_ascii_uppercase() == c);
        let lk = if invariant && invariant_lk > 0.0 {
            invariant_lk
        } else {
            let lk = likelihood_site_inner(tree, seqs, i, &order, &muts, &nomuts, &mut table);
            if invariant {
                invariant_lk = lk;
            }
            lk
        };
        lnl += lk.ln();
    }
    lnl
}

/// Unweighted parsimony cost of one site. Ambiguous bases cost nothing.
pub fn parsimony_cost(tree: &LocalTree, seqs: &[&[u8]], pos: usize, postorder: &[usize]) -> u32 {
    const MAXCOST: u32 = 100_000;
    let mut costs = vec![[MAXCOST; 4]; tree.nnodes()];
    for &node in postorder {
        if tree.nodes[node].is_leaf() {
            match base_index(seqs[node][pos]) {
                Some(b) => {
                    costs[node] = [MAXCOST; 4];
                    costs[node][b] = 0;
                }
                None => costs[node] = [0; 4],
            }
        } else {
            let left = costs[tree.nodes[node].child[0] as usize];
            let right = costs[tree.nodes[node].child[1] as usize];
            for a in 0..4 {
                let mut left_min = MAXCOST;
                let mut right_min = MAXCOST;
                for b in 0..4 {
                    let step = (a != b) as u32;
                    left_min = left_min.min(step + left[b]);
                    right_min = right_min.min(step + right[b]);
                }
                costs[node][a] = left_min + right_min;
            }
        }
    }
    let root = tree.root as usize;
    costs[root].iter().copied().min().unwrap_or(0)
}

/// Number of sites in `[start, end)` that are incompatible with the tree
/// under the infinite-sites model (parsimony cost above one).
pub fn count_noncompat_tree(
    tree: &LocalTree,
    seqs: &[&[u8]],
    start: usize,
    end: usize,
) -> usize {
    let postorder = tree.postorder();
    (start..end)
        .filter(|&i| parsimony_cost(tree, seqs, i, &postorder) > 1)
        .count()
}

/// Incompatible-site count across every block of an ARG.
pub fn count_noncompat(trees: &LocalTrees, sequences: &Sequences) -> usize {
    let nleaves = trees.nleaves();
    let seqs: Vec<&[u8]> = sequences.seqs[..nleaves].iter().map(|s| s.as_slice()).collect();
    let mut total = 0;
    let mut pos = trees.start_coord;
    for block in &trees.blocks {
        total += count_noncompat_tree(&block.tree, &seqs, pos, pos + block.blocklen);
        pos += block.blocklen;
    }
    total
}
