use anyhow::{Result, bail};

/// One node of a local tree. `-1` marks a missing parent or child. Leaves
/// occupy indices `0..nleaves` and carry the sequence row of the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalNode {
    pub parent: i32,
    pub child: [i32; 2],
    pub age: i32,
}

impl LocalNode {
    pub fn leaf(parent: i32) -> Self {
        Self {
            parent,
            child: [-1, -1],
            age: 0,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.child[0] == -1
    }
}

/// A rooted binary coalescent tree over one genomic interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTree {
    pub nodes: Vec<LocalNode>,
    pub root: i32,
}

impl LocalTree {
    /// Build from parallel parent/age arrays; children are derived.
    pub fn from_parents(parents: &[i32], ages: &[i32]) -> Result<Self> {
        if parents.len() != ages.len() {
            bail!(
                "parent array length {} does not match age array length {}",
                parents.len(),
                ages.len()
            );
        }
        let n = parents.len();
        let mut nodes: Vec<LocalNode> = ages
            .iter()
            .zip(parents)
            .map(|(&age, &parent)| LocalNode {
                parent,
                child: [-1, -1],
                age,
            })
            .collect();
        let mut root = -1;
        for i in 0..n {
            let p = parents[i];
            if p == -1 {
                if root != -1 {
                    bail!("tree has more than one root ({root} and {i})");
                }
                root = i as i32;
                continue;
            }
            if p < 0 || p as usize >= n {
                bail!("node {i} has out-of-range parent {p}");
            }
            let c = &mut nodes[p as usize].child;
            if c[0] == -1 {
                c[0] = i as i32;
            } else if c[1] == -1 {
                c[1] = i as i32;
            } else {
                bail!("node {p} has more than two children");
            }
        }
        if root == -1 {
            bail!("tree has no root");
        }
        Ok(Self { nodes, root })
    }

    #[inline]
    pub fn nnodes(&self) -> usize {
        self.nodes.len()
    }

    /// Full binary tree: `nnodes = 2*nleaves - 1`.
    #[inline]
    pub fn nleaves(&self) -> usize {
        (self.nodes.len() + 1) / 2
    }

    /// Children-before-parents traversal order.
    pub fn postorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root as usize];
        while let Some(node) = stack.pop() {
            order.push(node);
            for &c in &self.nodes[node].child {
                if c != -1 {
                    stack.push(c as usize);
                }
            }
        }
        order.reverse();
        order
    }

    pub fn sibling(&self, node: usize) -> i32 {
        let parent = self.nodes[node].parent;
        if parent == -1 {
            return -1;
        }
        let c = &self.nodes[parent as usize].child;
        if c[0] == node as i32 { c[1] } else { c[0] }
    }

    /// Length of the branch above `node` in model time. Sentinel ages clamp
    /// to the top of the grid; the root branch has length 0.
    pub fn dist(&self, node: usize, times: &[f64]) -> f64 {
        let parent = self.nodes[node].parent;
        if parent == -1 {
            return 0.0;
        }
        let top = times.len() - 1;
        let pa = (self.nodes[parent as usize].age.max(0) as usize).min(top);
        let na = (self.nodes[node].age.max(0) as usize).min(top);
        times[pa] - times[na]
    }

    /// Sum of floored branch lengths.
    pub fn tree_length(&self, times: &[f64], mintime: f64) -> f64 {
        (0..self.nnodes())
            .filter(|&i| i != self.root as usize)
            .map(|i| self.dist(i, times).max(mintime))
            .sum()
    }

    /// Mask of `node` and everything below it.
    pub fn descendants_mask(&self, node: usize) -> Vec<bool> {
        let mut mask = vec![false; self.nnodes()];
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            mask[n] = true;
            for &c in &self.nodes[n].child {
                if c != -1 {
                    stack.push(c as usize);
                }
            }
        }
        mask
    }

    fn set_root(&mut self) {
        for (i, node) in self.nodes.iter().enumerate() {
            if node.parent == -1 {
                self.root = i as i32;
                return;
            }
        }
    }

    /// Attach the threading lineage to `node` at grid time `time`.
    ///
    /// Displacement convention: the new leaf takes index `nleaves` so leaves
    /// stay contiguous, the node previously at that index moves to `nnodes`,
    /// and the new coalescence node is `nnodes + 1`.
    pub fn add_thread_branch(&mut self, node: usize, time: i32) {
        let nleaves = self.nleaves();
        let nnodes = self.nnodes();
        let newleaf = nleaves;
        let displaced = nnodes;
        let newcoal = nnodes + 1;

        let attach_parent = self.nodes[node].parent;
        self.nodes.resize(nnodes + 2, LocalNode::leaf(-1));

        let node2 = if node != newleaf { node } else { displaced };
        let parent2 = if attach_parent != newleaf as i32 {
            attach_parent
        } else {
            displaced as i32
        };

        // move whatever occupies the new leaf slot out of the way
        if newleaf < nnodes {
            self.nodes[displaced] = self.nodes[newleaf];
            let moved = self.nodes[displaced];
            if moved.parent != -1 {
                for c in self.nodes[moved.parent as usize].child.iter_mut() {
                    if *c == newleaf as i32 {
                        *c = displaced as i32;
                    }
                }
            }
            for c in moved.child {
                if c != -1 {
                    self.nodes[c as usize].parent = displaced as i32;
                }
            }
        }

        self.nodes[newleaf] = LocalNode::leaf(newcoal as i32);
        self.nodes[newcoal] = LocalNode {
            parent: parent2,
            child: [newleaf as i32, node2 as i32],
            age: time,
        };
        self.nodes[node2].parent = newcoal as i32;
        if parent2 != -1 {
            for c in self.nodes[parent2 as usize].child.iter_mut() {
                if *c == node2 as i32 {
                    *c = newcoal as i32;
                }
            }
        }
        self.set_root();
    }

    /// Undo `add_thread_branch`, restoring the previous node numbering.
    /// Returns the attachment `(node, time)` in the restored tree's indices.
    pub fn remove_thread_branch(&mut self) -> (usize, i32) {
        let nnodes = self.nnodes();
        let nleaves = self.nleaves();
        let leaf = nleaves - 1;
        let coal = self.nodes[leaf].parent as usize;
        debug_assert_eq!(coal, nnodes - 1, "thread branch was not the last added");
        let time = self.nodes[coal].age;

        let other = if self.nodes[coal].child[0] == leaf as i32 {
            1
        } else {
            0
        };
        let node2 = self.nodes[coal].child[other] as usize;
        let parent2 = self.nodes[coal].parent;

        // splice the coalescence node out
        self.nodes[node2].parent = parent2;
        if parent2 != -1 {
            for c in self.nodes[parent2 as usize].child.iter_mut() {
                if *c == coal as i32 {
                    *c = node2 as i32;
                }
            }
        }

        // move the displaced node back into the leaf slot
        let displaced = nnodes - 2;
        if leaf < displaced {
            self.nodes[leaf] = self.nodes[displaced];
            let moved = self.nodes[leaf];
            if moved.parent != -1 {
                for c in self.nodes[moved.parent as usize].child.iter_mut() {
                    if *c == displaced as i32 {
                        *c = leaf as i32;
                    }
                }
            }
            for c in moved.child {
                if c != -1 {
                    self.nodes[c as usize].parent = leaf as i32;
                }
            }
        }

        let node = if node2 == displaced { leaf } else { node2 };
        self.nodes.truncate(nnodes - 2);
        self.set_root();
        (node, time)
    }

    /// Remove leaf `leaf` (must be the last leaf) and its parent, compacting
    /// node indices. Returns the old-to-new index map (`-1` for the removed
    /// pair) and the attachment `(node, time)` in new indices.
    pub fn remove_leaf_branch(&mut self, leaf: usize) -> Result<(Vec<i32>, usize, i32)> {
        let nnodes = self.nnodes();
        let nleaves = self.nleaves();
        if leaf != nleaves - 1 {
            bail!("only the last leaf can be removed, got {leaf} of {nleaves}");
        }
        if !self.nodes[leaf].is_leaf() {
            bail!("node {leaf} is not a leaf");
        }
        let coal = self.nodes[leaf].parent;
        if coal == -1 {
            bail!("cannot remove the branch of a single-node tree");
        }
        let coal = coal as usize;
        let time = self.nodes[coal].age;
        let sib = self.sibling(leaf);
        let grandparent = self.nodes[coal].parent;

        self.nodes[sib as usize].parent = grandparent;
        if grandparent != -1 {
            for c in self.nodes[grandparent as usize].child.iter_mut() {
                if *c == coal as i32 {
                    *c = sib;
                }
            }
        }

        // compact: leaves keep their indices, internals above the holes
        // shift down
        let mut map = vec![-1i32; nnodes];
        let mut next = 0i32;
        for i in 0..nnodes {
            if i == leaf || i == coal {
                continue;
            }
            map[i] = next;
            next += 1;
        }
        let mut nodes = Vec::with_capacity(nnodes - 2);
        for i in 0..nnodes {
            if map[i] == -1 {
                continue;
            }
            let mut n = self.nodes[i];
            if n.parent != -1 {
                n.parent = map[n.parent as usize];
            }
            for c in n.child.iter_mut() {
                if *c != -1 {
                    *c = map[*c as usize];
                }
            }
            nodes.push(n);
        }
        self.nodes = nodes;
        self.set_root();
        let node = map[sib as usize] as usize;
        Ok((map, node, time))
    }

    /// Apply a subtree-prune-regraft. The parent of the recombining branch
    /// is broken out of the tree and reused as the new coalescence node, so
    /// every other branch keeps its index.
    pub fn apply_spr(&mut self, spr: &Spr) -> Result<()> {
        let rnode = spr.recomb_node as usize;
        if spr.coal_node == spr.recomb_node {
            bail!("recombining branch cannot recoalesce onto itself");
        }
        let recoal = self.nodes[rnode].parent;
        if recoal == -1 {
            bail!("recombining branch {rnode} has no parent to break");
        }
        let recoal = recoal as usize;
        let other = if self.nodes[recoal].child[0] == rnode as i32 {
            1
        } else {
            0
        };
        let sib = self.nodes[recoal].child[other];
        let broke_parent = self.nodes[recoal].parent;

        // splice the broken node out
        self.nodes[sib as usize].parent = broke_parent;
        if broke_parent != -1 {
            for c in self.nodes[broke_parent as usize].child.iter_mut() {
                if *c == recoal as i32 {
                    *c = sib;
                }
            }
        }

        // coalescing onto the broken branch means onto the merged sibling
        let coal_node = if spr.coal_node as usize == recoal {
            sib as usize
        } else {
            spr.coal_node as usize
        };
        let coal_parent = self.nodes[coal_node].parent;
        self.nodes[recoal] = LocalNode {
            parent: coal_parent,
            child: [rnode as i32, coal_node as i32],
            age: spr.coal_time,
        };
        self.nodes[rnode].parent = recoal as i32;
        self.nodes[coal_node].parent = recoal as i32;
        if coal_parent != -1 {
            for c in self.nodes[coal_parent as usize].child.iter_mut() {
                if *c == coal_node as i32 {
                    *c = recoal as i32;
                }
            }
        }
        self.set_root();
        Ok(())
    }
}

/// A recombination event: the branch above `recomb_node` breaks at
/// `recomb_time` and recoalesces onto `coal_node` at `coal_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spr {
    pub recomb_node: i32,
    pub recomb_time: i32,
    pub coal_node: i32,
    pub coal_time: i32,
}

impl Spr {
    pub fn new(recomb_node: i32, recomb_time: i32, coal_node: i32, coal_time: i32) -> Self {
        Self {
            recomb_node,
            recomb_time,
            coal_node,
            coal_time,
        }
    }
}

/// One genomic block: its local tree, the recombination from the previous
/// block (`None` for the first block and for continuation blocks that share
/// the previous tree), and the block length in sites.
#[derive(Debug, Clone)]
pub struct LocalTreeSpr {
    pub tree: LocalTree,
    pub spr: Option<Spr>,
    pub blocklen: usize,
}

/// An ARG as a sequence of local trees along a chromosome.
#[derive(Debug, Clone)]
pub struct LocalTrees {
    pub start_coord: usize,
    pub end_coord: usize,
    pub blocks: Vec<LocalTreeSpr>,
}

impl LocalTrees {
    pub fn new(start_coord: usize, blocks: Vec<LocalTreeSpr>) -> Result<Self> {
        if blocks.is_empty() {
            bail!("an ARG needs at least one block");
        }
        if blocks[0].spr.is_some() {
            bail!("first block cannot carry a recombination");
        }
        let mut end_coord = start_coord;
        for (i, block) in blocks.iter().enumerate() {
            if block.blocklen == 0 {
                bail!("block {i} has zero length");
            }
            end_coord += block.blocklen;
        }
        Ok(Self {
            start_coord,
            end_coord,
            blocks,
        })
    }

    /// A trivial ARG: one tree covering the whole region.
    pub fn single(tree: LocalTree, start_coord: usize, length: usize) -> Result<Self> {
        Self::new(
            start_coord,
            vec![LocalTreeSpr {
                tree,
                spr: None,
                blocklen: length,
            }],
        )
    }

    pub fn length(&self) -> usize {
        self.end_coord - self.start_coord
    }

    pub fn ntrees(&self) -> usize {
        self.blocks.len()
    }

    pub fn nleaves(&self) -> usize {
        self.blocks[0].tree.nleaves()
    }
}
