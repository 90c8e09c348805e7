use argthread_rs::forward::{ForwardTable, forward_alg, forward_switch};
use argthread_rs::matrices::ArgMatrixIter;
use argthread_rs::model::ArgModel;
use argthread_rs::sequences::Sequences;
use argthread_rs::states::get_coal_states;
use argthread_rs::traceback::{max_traceback, stochastic_traceback};
use argthread_rs::trans::TransMatrixSwitch;
use argthread_rs::tree::{LocalTree, LocalTreeSpr, LocalTrees, Spr};
use argthread_rs::utils::fequal;
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::SmallRng;

fn model(ntimes: usize) -> ArgModel {
    ArgModel::new(ntimes, 200_000.0, 0.01, 10_000.0, 1.5e-8, 2.5e-8).expect("model init failed")
}

fn four_leaf_tree() -> LocalTree {
    LocalTree::from_parents(&[4, 4, 5, 5, 6, 6, -1], &[0, 0, 0, 0, 1, 2, 3]).expect("bad tree")
}

fn sequences(nseqs: usize, seqlen: usize) -> Sequences {
    let mut seqs = Sequences::new();
    for i in 0..nseqs {
        let row: Vec<u8> = (0..seqlen)
            .map(|j| b"ACGT"[(i * 5 + j * 11 + i * j) % 4])
            .collect();
        seqs.append(format!("chr{i}"), row).expect("append failed");
    }
    seqs
}

/// Two blocks joined by a real recombination.
fn two_block_arg(len1: usize, len2: usize) -> LocalTrees {
    let t1 = four_leaf_tree();
    let spr = Spr::new(0, 0, 2, 2);
    let mut t2 = t1.clone();
    t2.apply_spr(&spr).expect("spr failed");
    LocalTrees::new(
        0,
        vec![
            LocalTreeSpr {
                tree: t1,
                spr: None,
                blocklen: len1,
            },
            LocalTreeSpr {
                tree: t2,
                spr: Some(spr),
                blocklen: len2,
            },
        ],
    )
    .expect("bad arg")
}

fn run_forward(
    model: &ArgModel,
    seqs: &Sequences,
    trees: &LocalTrees,
    slow: bool,
) -> ForwardTable {
    let mut fw = ForwardTable::new(trees.start_coord, trees.length());
    let mut iter = ArgMatrixIter::new(model, Some(seqs), trees, trees.nleaves(), false);
    forward_alg(trees, model, &mut iter, &mut fw, false, slow).expect("forward failed");
    fw
}

#[test]
fn factored_forward_matches_dense_reference() {
    let model = model(6);
    let trees = two_block_arg(12, 8);
    let seqs = sequences(5, 20);

    let fast = run_forward(&model, &seqs, &trees, false);
    let slow = run_forward(&model, &seqs, &trees, true);

    for pos in 0..20 {
        let a = fast.col(pos);
        let b = slow.col(pos);
        assert_eq!(a.len(), b.len());
        for k in 0..a.len() {
            assert!(
                fequal(a[k], b[k], 1e-4, 1e-12),
                "position {pos} state {k}: {} vs {}",
                a[k],
                b[k]
            );
        }
    }
}

#[test]
fn forward_columns_are_normalized() {
    let model = model(6);
    let trees = two_block_arg(12, 8);
    let seqs = sequences(5, 20);
    let fw = run_forward(&model, &seqs, &trees, false);

    for pos in 0..20 {
        let sum: f64 = fw.col(pos).iter().sum();
        assert!(
            (sum - 1.0).abs() <= 1e-9,
            "column {pos} sums to {sum}"
        );
    }
}

#[test]
fn identity_switch_preserves_the_column() {
    let col1 = [0.1, 0.2, 0.3, 0.4];
    let mut col2 = [0.0; 4];
    let switch_mat = TransMatrixSwitch::identity(4);
    let emit = Array1::from_elem(4, 1.0);
    forward_switch(&col1, &mut col2, &switch_mat, emit.view(), 0).expect("switch failed");
    for k in 0..4 {
        assert!(fequal(col2[k], col1[k], 1e-12, 1e-15), "{:?}", col2);
    }
}

#[test]
fn continuation_blocks_match_a_single_block() {
    // splitting a block without a recombination must not change anything
    let model = model(6);
    let tree = four_leaf_tree();
    let seqs = sequences(5, 20);

    let one = LocalTrees::single(tree.clone(), 0, 20).expect("bad arg");
    let two = LocalTrees::new(
        0,
        vec![
            LocalTreeSpr {
                tree: tree.clone(),
                spr: None,
                blocklen: 10,
            },
            LocalTreeSpr {
                tree,
                spr: None,
                blocklen: 10,
            },
        ],
    )
    .expect("bad arg");

    let fw_one = run_forward(&model, &seqs, &one, false);
    let fw_two = run_forward(&model, &seqs, &two, false);
    for pos in 0..20 {
        let a = fw_one.col(pos);
        let b = fw_two.col(pos);
        for k in 0..a.len() {
            assert!(
                fequal(a[k], b[k], 1e-12, 1e-15),
                "position {pos} state {k}: {} vs {}",
                a[k],
                b[k]
            );
        }
    }

    // traceback crosses the seam without a discontinuity in distribution
    let mut path_one = vec![0i32; 20];
    let mut path_two = vec![0i32; 20];
    let mut rng = SmallRng::seed_from_u64(7);
    let mut iter = ArgMatrixIter::new(&model, None, &one, 5, false);
    stochastic_traceback(&one, &mut iter, &fw_one, &mut path_one, false, &mut rng)
        .expect("traceback failed");
    let mut rng = SmallRng::seed_from_u64(7);
    let mut iter = ArgMatrixIter::new(&model, None, &two, 5, false);
    stochastic_traceback(&two, &mut iter, &fw_two, &mut path_two, false, &mut rng)
        .expect("traceback failed");
    assert_eq!(path_one, path_two);
}

#[test]
fn sampled_path_respects_state_constraints() {
    let model = model(6);
    let trees = two_block_arg(12, 8);
    let seqs = sequences(5, 20);
    let fw = run_forward(&model, &seqs, &trees, false);

    let mut path = vec![0i32; 20];
    let mut rng = SmallRng::seed_from_u64(17);
    let mut iter = ArgMatrixIter::new(&model, None, &trees, 5, false);
    let lnl = stochastic_traceback(&trees, &mut iter, &fw, &mut path, false, &mut rng)
        .expect("traceback failed");
    assert!(lnl.is_finite());

    let mut pos = 0;
    for block in &trees.blocks {
        let states = get_coal_states(&block.tree, model.ntimes, false);
        for i in pos..pos + block.blocklen {
            let idx = path[i] as usize;
            assert!(idx < states.len(), "path index out of range at {i}");
            let s = states[idx];
            let age = block.tree.nodes[s.node as usize].age;
            assert!(s.time >= age, "state below branch age at {i}");
        }
        pos += block.blocklen;
    }
}

#[test]
fn pinned_endpoints_are_honored() {
    let model = model(6);
    let trees = two_block_arg(12, 8);
    let seqs = sequences(5, 20);

    // one-hot prior on state 0 of the first block
    let first_states = get_coal_states(&trees.blocks[0].tree, model.ntimes, false);
    let mut fw = ForwardTable::new(0, 20);
    fw.new_block(0, 12, first_states.len());
    fw.col_mut(0)[0] = 1.0;
    let mut iter = ArgMatrixIter::new(&model, Some(&seqs), &trees, 5, false);
    forward_alg(&trees, &model, &mut iter, &mut fw, true, false).expect("forward failed");
    assert_eq!(fw.col(0)[0], 1.0);

    // pin the final state to 0 as well
    let mut path = vec![0i32; 20];
    path[19] = 0;
    let mut rng = SmallRng::seed_from_u64(3);
    let mut iter = ArgMatrixIter::new(&model, None, &trees, 5, false);
    stochastic_traceback(&trees, &mut iter, &fw, &mut path, true, &mut rng)
        .expect("traceback failed");

    assert_eq!(path[0], 0);
    assert_eq!(path[19], 0);
}

#[test]
fn viterbi_matches_uncached_reference() {
    let model = model(5);
    let tree = four_leaf_tree();
    let trees = LocalTrees::single(tree, 0, 14).expect("bad arg");
    let seqs = sequences(5, 14);
    let fw = run_forward(&model, &seqs, &trees, false);

    let mut path = vec![0i32; 14];
    let mut iter = ArgMatrixIter::new(&model, None, &trees, 5, false);
    max_traceback(&trees, &mut iter, &fw, &mut path, false).expect("viterbi failed");

    // plain backward argmax without transition caching
    let mut iter = ArgMatrixIter::new(&model, None, &trees, 5, false);
    iter.seek_end().expect("seek failed");
    let block = iter.block().expect("no block");
    let nstates = block.states.len();
    let mut reference = vec![0usize; 14];
    let last = fw.col(13);
    for j in 1..nstates {
        if last[j] > last[reference[13]] {
            reference[13] = j;
        }
    }
    for i in (0..13).rev() {
        let col = fw.col(i);
        let k = reference[i + 1];
        let mut best = 0usize;
        let mut best_prob = col[0].ln() + block.trans.get_log(&block.states, 0, k);
        for j in 1..nstates {
            let prob = col[j].ln() + block.trans.get_log(&block.states, j, k);
            if prob > best_prob {
                best = j;
                best_prob = prob;
            }
        }
        reference[i] = best;
    }

    let path_usize: Vec<usize> = path.iter().map(|&v| v as usize).collect();
    assert_eq!(path_usize, reference);
}
