use anyhow::{Result, bail};

/// Index of a DNA base in partial-likelihood tables, or `None` for anything
/// that is not an unambiguous base.
#[inline]
pub fn base_index(c: u8) -> Option<usize> {
    match c.to_ascii_uppercase() {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' => Some(3),
        _ => None,
    }
}

#[inline]
pub fn is_missing(c: u8) -> bool {
    c == b'N' || c == b'n'
}

#[inline]
pub fn is_valid_base(c: u8) -> bool {
    base_index(c).is_some() || is_missing(c)
}

/// A sequence or species name: non-empty, drawn from a small legal character
/// set, no leading/trailing spaces, and not purely numeric.
pub fn check_seq_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("sequence name is empty");
    }
    if name.starts_with(' ') || name.ends_with(' ') {
        bail!("sequence name '{name}' starts or ends with a space");
    }
    for c in name.chars() {
        if !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' || c == ' ') {
            bail!("sequence name '{name}' contains illegal character '{c}'");
        }
    }
    if name.chars().all(|c| c.is_ascii_digit()) {
        bail!("sequence name '{name}' is purely numeric");
    }
    Ok(())
}

/// An alignment of equal-length chromosomes over `{A,C,G,T,N}` (either
/// case). Row `i` is the sequence carried by leaf `i` of every local tree.
#[derive(Debug, Clone, Default)]
pub struct Sequences {
    pub names: Vec<String>,
    pub seqs: Vec<Vec<u8>>,
    length: usize,
}

impl Sequences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nseqs(&self) -> usize {
        self.seqs.len()
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Append one chromosome, enforcing equal lengths and legal characters.
    pub fn append(&mut self, name: String, seq: Vec<u8>) -> Result<()> {
        check_seq_name(&name)?;
        if self.seqs.is_empty() {
            self.length = seq.len();
        } else if seq.len() != self.length {
            bail!(
                "sequence '{}' has length {}, expected {}",
                name,
                seq.len(),
                self.length
            );
        }
        if let Some(pos) = seq.iter().position(|&c| !is_valid_base(c)) {
            bail!(
                "sequence '{}' has illegal character '{}' at position {}",
                name,
                seq[pos] as char,
                pos
            );
        }
        self.names.push(name);
        self.seqs.push(seq);
        Ok(())
    }
}

/// A sparse alignment: only variant columns are stored, everything else is
/// implicitly the default base.
#[derive(Debug, Clone, Default)]
pub struct Sites {
    pub chrom: String,
    pub start_coord: usize,
    pub end_coord: usize,
    pub names: Vec<String>,
    pub positions: Vec<usize>,
    pub cols: Vec<Vec<u8>>,
}

impl Sites {
    pub fn length(&self) -> usize {
        self.end_coord - self.start_coord
    }

    pub fn nsites(&self) -> usize {
        self.positions.len()
    }

    pub fn append(&mut self, position: usize, col: Vec<u8>) -> Result<()> {
        if col.len() != self.names.len() {
            bail!(
                "site column at position {} has {} bases, expected {}",
                position,
                col.len(),
                self.names.len()
            );
        }
        if let Some(last) = self.positions.last()
            && position <= *last
        {
            bail!("site positions must be sorted and unique ({position} after {last})");
        }
        if position < self.start_coord || position >= self.end_coord {
            bail!(
                "site position {} outside region {}..{}",
                position,
                self.start_coord,
                self.end_coord
            );
        }
        if let Some(&c) = col.iter().find(|&&c| !is_valid_base(c)) {
            bail!(
                "site column at position {} has illegal character '{}'",
                position,
                c as char
            );
        }
        self.positions.push(position);
        self.cols.push(col);
        Ok(())
    }
}

/// Expand a sparse sites alignment into dense sequences, filling invariant
/// positions with `default_base`.
pub fn make_sequences_from_sites(sites: &Sites, default_base: u8) -> Result<Sequences> {
    let nseqs = sites.names.len();
    let seqlen = sites.length();
    let mut sequences = Sequences::new();
    for i in 0..nseqs {
        let mut seq = vec![default_base; seqlen];
        for (col, &pos) in sites.positions.iter().enumerate() {
            seq[pos - sites.start_coord] = sites.cols[col][i];
        }
        sequences.append(sites.names[i].clone(), seq)?;
    }
    Ok(sequences)
}

/// Collapse dense sequences into their variant columns.
pub fn make_sites_from_sequences(sequences: &Sequences, chrom: &str) -> Result<Sites> {
    let nseqs = sequences.nseqs();
    if nseqs == 0 {
        bail!("cannot build sites from an empty alignment");
    }
    let mut sites = Sites {
        chrom: chrom.to_string(),
        start_coord: 0,
        end_coord: sequences.length(),
        names: sequences.names.clone(),
        ..Default::default()
    };
    for i in 0..sequences.length() {
        let c = sequences.seqs[0][i];
        if sequences.seqs[1..].iter().any(|s| s[i] != c) {
            let col = sequences.seqs.iter().map(|s| s[i]).collect();
            sites.append(i, col)?;
        }
    }
    Ok(sites)
}
