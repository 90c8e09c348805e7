use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::sequences::Sequences;

fn open_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("failed to open {path:?}"))?;
    let reader: Box<dyn Read> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

/// Read a (possibly gzipped) FASTA alignment into equal-length sequences.
pub fn read_fasta(path: &Path) -> Result<Sequences> {
    let reader = open_reader(path)?;
    let mut seqs = Sequences::new();
    let mut name: Option<String> = None;
    let mut body = Vec::<u8>::new();

    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read {path:?}"))?;
        let line = line.trim_end();
        if let Some(key) = line.strip_prefix('>') {
            if let Some(prev) = name.take() {
                seqs.append(prev, std::mem::take(&mut body))?;
            }
            name = Some(key.trim().to_string());
        } else {
            if name.is_none() && !line.trim().is_empty() {
                bail!("sequence data before first FASTA header in {path:?}");
            }
            body.extend_from_slice(line.trim().as_bytes());
        }
    }
    if let Some(prev) = name.take() {
        seqs.append(prev, body)?;
    }
    if seqs.nseqs() == 0 {
        bail!("no sequences found in {path:?}");
    }
    Ok(seqs)
}

pub fn write_fasta(path: &Path, seqs: &Sequences) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
    let mut w = BufWriter::new(file);
    for (name, seq) in seqs.names.iter().zip(&seqs.seqs) {
        writeln!(w, ">{name}")?;
        w.write_all(seq)?;
        writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}
