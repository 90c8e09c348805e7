use crate::tree::LocalTree;

/// A coalescence state: the threading lineage joins branch `node` at grid
/// time `time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    pub node: i32,
    pub time: i32,
}

impl State {
    pub fn new(node: i32, time: i32) -> Self {
        Self { node, time }
    }
}

/// Enumerate the admissible coalescence states of a block.
///
/// States for one branch are contiguous and sorted by time; the factored
/// forward step and `NodeStateLookup` rely on that ordering.
pub fn get_coal_states(tree: &LocalTree, ntimes: usize, internal: bool) -> Vec<State> {
    if internal {
        get_coal_states_internal(tree, ntimes)
    } else {
        get_coal_states_external(tree, ntimes, 0)
    }
}

/// External threading: every branch accepts the new lineage from
/// `max(age, minage)` up to its parent's age (the root branch up to
/// `ntimes - 2`).
pub fn get_coal_states_external(tree: &LocalTree, ntimes: usize, minage: i32) -> Vec<State> {
    let mut states = Vec::new();
    for (i, node) in tree.nodes.iter().enumerate() {
        let mut time = node.age.max(minage);
        if node.parent == -1 {
            while time < ntimes as i32 - 1 {
                states.push(State::new(i as i32, time));
                time += 1;
            }
        } else {
            let parent_age = tree.nodes[node.parent as usize].age;
            while time <= parent_age {
                states.push(State::new(i as i32, time));
                time += 1;
            }
        }
    }
    states
}

/// Internal threading over a partial tree: the sentinel root and the pruned
/// subtree carry no states, and coalescence below the subtree root's age is
/// impossible. A partial tree whose root age is a real grid age is fully
/// specified and has no states at all.
pub fn get_coal_states_internal(tree: &LocalTree, ntimes: usize) -> Vec<State> {
    let root = tree.root as usize;
    if tree.nodes[root].age < ntimes as i32 {
        return Vec::new();
    }
    let subtree_root = tree.nodes[root].child[0];
    let minage = tree.nodes[subtree_root as usize].age;
    let in_subtree = tree.descendants_mask(subtree_root as usize);

    let mut states = Vec::new();
    for (i, node) in tree.nodes.iter().enumerate() {
        if i == root || in_subtree[i] {
            continue;
        }
        let mut time = node.age.max(minage);
        if node.parent == root as i32 {
            // maintree root: open-ended like a root branch
            while time < ntimes as i32 - 1 {
                states.push(State::new(i as i32, time));
                time += 1;
            }
        } else {
            let parent_age = tree.nodes[node.parent as usize].age;
            while time <= parent_age {
                states.push(State::new(i as i32, time));
                time += 1;
            }
        }
    }
    states
}

/// Index of `state` in an enumeration, for endpoint pinning.
pub fn find_state(states: &[State], state: State) -> Option<usize> {
    states.iter().position(|s| *s == state)
}

/// Constant-time map from `(node, time)` to its state index, exploiting the
/// per-branch contiguity of the enumeration.
#[derive(Debug, Clone)]
pub struct NodeStateLookup {
    first: Vec<i32>,
    min_time: Vec<i32>,
    count: Vec<i32>,
}

impl NodeStateLookup {
    pub fn new(states: &[State], nnodes: usize) -> Self {
        let mut first = vec![-1i32; nnodes];
        let mut min_time = vec![-1i32; nnodes];
        let mut count = vec![0i32; nnodes];
        for (j, s) in states.iter().enumerate() {
            let n = s.node as usize;
            if first[n] == -1 {
                first[n] = j as i32;
                min_time[n] = s.time;
            }
            count[n] += 1;
        }
        Self {
            first,
            min_time,
            count,
        }
    }

    /// State index of `(node, time)`, or `-1` when no such state exists.
    pub fn lookup(&self, node: usize, time: i32) -> i32 {
        if self.first[node] == -1 {
            return -1;
        }
        let offset = time - self.min_time[node];
        if offset < 0 || offset >= self.count[node] {
            return -1;
        }
        self.first[node] + offset
    }
}
