use anyhow::{Context, Result, bail};
use ndarray::Array2;

use crate::emit::{calc_emissions, calc_emissions_internal};
use crate::model::ArgModel;
use crate::sequences::Sequences;
use crate::states::{State, get_coal_states};
use crate::trans::{LineageCounts, TransMatrix, TransMatrixSwitch};
use crate::tree::{LocalTree, LocalTrees};

/// Everything the forward and backward passes need for one genomic block.
/// Owned by the cursor; invalidated when it moves.
#[derive(Debug)]
pub struct BlockMatrices {
    pub index: usize,
    pub start: usize,
    pub blocklen: usize,
    pub states: Vec<State>,
    pub lineages: LineageCounts,
    pub trans: TransMatrix,
    pub switch_mat: Option<TransMatrixSwitch>,
    pub emit: Option<Array2<f64>>,
}

/// Bidirectional cursor over an ARG's blocks, building the per-block
/// transition, switch, and emission matrices lazily.
///
/// Without sequences (the traceback re-walk) emissions are skipped. In
/// external mode the threaded chromosome's row is appended after the tree's
/// leaf rows, matching the new leaf index the emission engine assigns.
pub struct ArgMatrixIter<'a> {
    model: &'a ArgModel,
    sequences: Option<&'a Sequences>,
    trees: &'a LocalTrees,
    new_chrom: usize,
    internal: bool,
    starts: Vec<usize>,
    current: Option<BlockMatrices>,
}

impl<'a> ArgMatrixIter<'a> {
    pub fn new(
        model: &'a ArgModel,
        sequences: Option<&'a Sequences>,
        trees: &'a LocalTrees,
        new_chrom: usize,
        internal: bool,
    ) -> Self {
        let mut starts = Vec::with_capacity(trees.ntrees());
        let mut pos = trees.start_coord;
        for block in &trees.blocks {
            starts.push(pos);
            pos += block.blocklen;
        }
        Self {
            model,
            sequences,
            trees,
            new_chrom,
            internal,
            starts,
            current: None,
        }
    }

    pub fn seek_start(&mut self) -> Result<()> {
        self.load(0)
    }

    pub fn seek_end(&mut self) -> Result<()> {
        self.load(self.trees.ntrees() - 1)
    }

    /// Move forward one block; `false` once the last block was current.
    pub fn advance(&mut self) -> Result<bool> {
        let idx = self.current.as_ref().map_or(0, |b| b.index + 1);
        if idx >= self.trees.ntrees() {
            self.current = None;
            return Ok(false);
        }
        self.load(idx)?;
        Ok(true)
    }

    /// Move backward one block; `false` once the first block was current.
    pub fn retreat(&mut self) -> Result<bool> {
        let idx = match self.current.as_ref() {
            Some(b) if b.index > 0 => b.index - 1,
            _ => {
                self.current = None;
                return Ok(false);
            }
        };
        self.load(idx)?;
        Ok(true)
    }

    pub fn block(&self) -> Result<&BlockMatrices> {
        self.current
            .as_ref()
            .context("matrix cursor is not positioned on a block")
    }

    fn block_seqs(&self, sequences: &'a Sequences, tree: &LocalTree, start: usize, end: usize) -> Result<Vec<&'a [u8]>> {
        if end > sequences.length() {
            bail!(
                "ARG extends to {} but sequences end at {}",
                end,
                sequences.length()
            );
        }
        let nleaves = tree.nleaves();
        let mut rows: Vec<&[u8]> = Vec::with_capacity(nleaves + 1);
        for i in 0..nleaves {
            rows.push(&sequences.seqs[i][start..end]);
        }
        if !self.internal {
            if self.new_chrom >= sequences.nseqs() {
                bail!(
                    "new chromosome {} is not among the {} sequences",
                    self.new_chrom,
                    sequences.nseqs()
                );
            }
            rows.push(&sequences.seqs[self.new_chrom][start..end]);
        }
        Ok(rows)
    }

    fn load(&mut self, index: usize) -> Result<()> {
        let block = &self.trees.blocks[index];
        let start = self.starts[index];
        let tree = &block.tree;
        let local_model = self.model.local_model(start);

        let states = get_coal_states(tree, local_model.ntimes, self.internal);
        let lineages = LineageCounts::count(tree, local_model.ntimes, self.internal);
        let trans = TransMatrix::new(local_model, tree, &lineages, self.internal);

        let switch_mat = match (&block.spr, index) {
            (Some(spr), i) if i > 0 => {
                let prev_tree = &self.trees.blocks[index - 1].tree;
                let states1 = get_coal_states(prev_tree, local_model.ntimes, self.internal);
                Some(TransMatrixSwitch::new(
                    prev_tree,
                    spr,
                    &states1,
                    &states,
                    local_model,
                    &lineages,
                    trans.minage,
                )?)
            }
            _ => None,
        };

        let emit = match self.sequences {
            Some(sequences) => {
                let seqs = self.block_seqs(sequences, tree, start, start + block.blocklen)?;
                let mut emit = Array2::zeros((block.blocklen, states.len().max(1)));
                if self.internal {
                    calc_emissions_internal(&states, tree, &seqs, local_model, &mut emit);
                } else {
                    calc_emissions(&states, tree, &seqs, local_model, &mut emit);
                }
                Some(emit)
            }
            None => None,
        };

        self.current = Some(BlockMatrices {
            index,
            start,
            blocklen: block.blocklen,
            states,
            lineages,
            trans,
            switch_mat,
            emit,
        });
        Ok(())
    }
}
