use argthread_rs::emit::{
    calc_emissions, calc_emissions_internal, calc_emissions_internal_slow, calc_emissions_slow,
    count_noncompat_tree, find_invariant_sites, likelihood_tree,
};
use argthread_rs::model::ArgModel;
use argthread_rs::states::{get_coal_states, get_coal_states_internal};
use argthread_rs::tree::LocalTree;
use argthread_rs::utils::fequal;
use ndarray::Array2;

fn model(ntimes: usize) -> ArgModel {
    ArgModel::new(ntimes, 200_000.0, 0.01, 10_000.0, 1.5e-8, 2.5e-8).expect("model init failed")
}

fn two_leaf_tree() -> LocalTree {
    LocalTree::from_parents(&[2, 2, -1], &[0, 0, 1]).expect("bad tree")
}

fn eight_leaf_tree() -> LocalTree {
    let parents = [8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13, 13, 14, 14, -1];
    let ages = [0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 2, 2, 3, 4, 5];
    LocalTree::from_parents(&parents, &ages).expect("bad tree")
}

/// Deterministic pseudo-random alignment with a sprinkling of Ns.
fn synth_seqs(nseqs: usize, seqlen: usize) -> Vec<Vec<u8>> {
    (0..nseqs)
        .map(|i| {
            (0..seqlen)
                .map(|j| {
                    if (i * 31 + j * 17) % 37 == 0 {
                        b'N'
                    } else {
                        b"ACGT"[(i * 7 + j * 13 + (j / 9) * i) % 4]
                    }
                })
                .collect()
        })
        .collect()
}

fn as_slices(seqs: &[Vec<u8>]) -> Vec<&[u8]> {
    seqs.iter().map(|s| s.as_slice()).collect()
}

#[test]
fn invariant_site_emission_matches_closed_form() {
    // one site, both observed bases equal: every state's emission is the
    // invariant constant for its augmented tree
    let model = model(4);
    let tree = two_leaf_tree();
    let seqs: Vec<Vec<u8>> = vec![b"A".to_vec(), b"A".to_vec(), b"A".to_vec()];
    let states = get_coal_states(&tree, model.ntimes, false);
    assert!(!states.is_empty());

    let mut emit = Array2::zeros((1, states.len()));
    calc_emissions(&states, &tree, &as_slices(&seqs), &model, &mut emit);

    for (k, state) in states.iter().enumerate() {
        let mut tree2 = tree.clone();
        tree2.add_thread_branch(state.node as usize, state.time);
        let treelen = tree2.tree_length(&model.times, model.mintime);
        let expected = 0.25 * (-model.mu * treelen.max(model.mintime)).exp();
        assert!(
            fequal(emit[[0, k]], expected, 1e-12, 1e-300),
            "state {k}: {} != {}",
            emit[[0, k]],
            expected
        );
    }
}

#[test]
fn all_missing_sites_give_constant_emission_columns() {
    let model = model(6);
    let tree = LocalTree::from_parents(&[3, 3, 4, 4, -1], &[0, 0, 0, 1, 2]).expect("bad tree");
    let seqs: Vec<Vec<u8>> = vec![vec![b'N'; 10]; 4];
    let states = get_coal_states(&tree, model.ntimes, false);

    let mut emit = Array2::zeros((10, states.len()));
    calc_emissions(&states, &tree, &as_slices(&seqs), &model, &mut emit);

    for k in 0..states.len() {
        for i in 0..10 {
            assert!(emit[[i, k]] > 0.0);
            assert_eq!(emit[[i, k]], emit[[0, k]], "site {i} state {k} not constant");
        }
    }
}

#[test]
fn fast_and_slow_emissions_agree() {
    // dirty-set partial postorder against the full recomputation
    let model = model(20);
    let tree = eight_leaf_tree();
    let seqs = synth_seqs(9, 100);
    let states = get_coal_states(&tree, model.ntimes, false);

    let mut fast = Array2::zeros((100, states.len()));
    let mut slow = Array2::zeros((100, states.len()));
    calc_emissions(&states, &tree, &as_slices(&seqs), &model, &mut fast);
    calc_emissions_slow(&states, &tree, &as_slices(&seqs), &model, &mut slow);

    for k in 0..states.len() {
        for i in 0..100 {
            assert!(fast[[i, k]] >= 0.0);
            assert!(
                fequal(fast[[i, k]], slow[[i, k]], 1e-4, 1e-12),
                "site {i} state {k}: fast {} vs slow {}",
                fast[[i, k]],
                slow[[i, k]]
            );
        }
    }
}

#[test]
fn internal_emissions_agree_with_spr_reference() {
    let model = model(8);
    // partial tree: leaf 3 pruned, sentinel root joins it to the maintree
    let parents = [4, 4, 5, 6, 5, 6, -1];
    let ages = [0, 0, 0, 0, 1, 2, model.ntimes as i32 + 1];
    let tree = LocalTree::from_parents(&parents, &ages).expect("bad tree");
    let seqs = synth_seqs(4, 40);
    let states = get_coal_states_internal(&tree, model.ntimes);
    assert!(!states.is_empty());

    let mut fast = Array2::zeros((40, states.len()));
    let mut slow = Array2::zeros((40, states.len()));
    calc_emissions_internal(&states, &tree, &as_slices(&seqs), &model, &mut fast);
    calc_emissions_internal_slow(&states, &tree, &as_slices(&seqs), &model, &mut slow)
        .expect("slow internal emissions failed");

    for k in 0..states.len() {
        for i in 0..40 {
            assert!(
                fequal(fast[[i, k]], slow[[i, k]], 1e-4, 1e-12),
                "site {i} state {k}: fast {} vs slow {}",
                fast[[i, k]],
                slow[[i, k]]
            );
        }
    }
}

#[test]
fn find_invariant_sites_handles_case_and_missing() {
    let rows: Vec<Vec<u8>> = vec![b"AaCN".to_vec(), b"AACN".to_vec()];
    let inv = find_invariant_sites(&as_slices(&rows));
    assert_eq!(inv, vec![true, true, true, true]);

    let rows: Vec<Vec<u8>> = vec![b"ACGT".to_vec(), b"ACCT".to_vec()];
    let inv = find_invariant_sites(&as_slices(&rows));
    assert_eq!(inv, vec![true, true, false, true]);
}

#[test]
fn likelihood_tree_is_finite_and_negative() {
    let model = model(8);
    let tree = eight_leaf_tree();
    let seqs = synth_seqs(8, 50);
    let lnl = likelihood_tree(&tree, &model, &as_slices(&seqs), 0, 50);
    assert!(lnl.is_finite());
    assert!(lnl < 0.0);
}

#[test]
fn compatible_alignment_has_no_incompatible_sites() {
    // one mutation per site on a single branch never violates four-gamete
    let tree = LocalTree::from_parents(&[4, 4, 5, 5, 6, 6, -1], &[0, 0, 0, 0, 1, 2, 3])
        .expect("bad tree");
    // sites: invariant, leaf-0 singleton, clade {0,1} doubleton
    let seqs: Vec<Vec<u8>> = vec![
        b"AGC".to_vec(),
        b"AAC".to_vec(),
        b"AAT".to_vec(),
        b"AAT".to_vec(),
    ];
    assert_eq!(count_noncompat_tree(&tree, &as_slices(&seqs), 0, 3), 0);
}
