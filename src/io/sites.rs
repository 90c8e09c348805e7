use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::sequences::{Sites, check_seq_name};

fn open_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("failed to open {path:?}"))?;
    let reader: Box<dyn Read> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

/// Read the tab-separated sites format:
///
/// ```text
/// NAMES<TAB>name1<TAB>name2...
/// REGION<TAB>chrom<TAB>start<TAB>end     (1-based, inclusive start)
/// position<TAB>bases                     (1-based, one row per variant site)
/// ```
pub fn read_sites(path: &Path) -> Result<Sites> {
    let reader = open_reader(path)?;
    let mut sites = Sites::default();
    let mut have_region = false;

    for (lineno, line) in reader.lines().enumerate() {
        let lineno = lineno + 1;
        let line = line.with_context(|| format!("failed to read {path:?}"))?;
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("NAMES\t") {
            sites.names = rest.split('\t').map(str::to_string).collect();
            for name in &sites.names {
                check_seq_name(name).with_context(|| format!("bad NAMES line (line {lineno})"))?;
            }
        } else if let Some(rest) = line.strip_prefix("REGION\t") {
            let fields: Vec<&str> = rest.split('\t').collect();
            if fields.len() != 3 {
                bail!("bad REGION format (line {lineno})");
            }
            sites.chrom = fields[0].to_string();
            let start: usize = fields[1]
                .parse()
                .with_context(|| format!("bad REGION start (line {lineno})"))?;
            if start == 0 {
                bail!("REGION start is 1-based, got 0 (line {lineno})");
            }
            sites.start_coord = start - 1;
            sites.end_coord = fields[2]
                .parse()
                .with_context(|| format!("bad REGION end (line {lineno})"))?;
            have_region = true;
        } else {
            if sites.names.is_empty() || !have_region {
                bail!("site row before NAMES/REGION headers (line {lineno})");
            }
            let (pos_str, bases) = line
                .split_once('\t')
                .with_context(|| format!("site row is not tab-separated (line {lineno})"))?;
            let position: usize = pos_str
                .parse()
                .with_context(|| format!("first column is not an integer (line {lineno})"))?;
            if position == 0 {
                bail!("site positions are 1-based, got 0 (line {lineno})");
            }
            let col: Vec<u8> = bases.trim().bytes().map(|b| b.to_ascii_uppercase()).collect();
            if col.len() != sites.names.len() {
                bail!(
                    "expected {} bases, got {} (line {lineno})",
                    sites.names.len(),
                    col.len()
                );
            }
            sites
                .append(position - 1, col)
                .with_context(|| format!("bad site row (line {lineno})"))?;
        }
    }

    if sites.names.is_empty() || !have_region {
        bail!("sites file {path:?} is missing NAMES or REGION header");
    }
    Ok(sites)
}

pub fn write_sites(path: &Path, sites: &Sites) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
    let mut w = BufWriter::new(file);
    writeln!(w, "NAMES\t{}", sites.names.join("\t"))?;
    writeln!(
        w,
        "REGION\t{}\t{}\t{}",
        sites.chrom,
        sites.start_coord + 1,
        sites.end_coord
    )?;
    for (pos, col) in sites.positions.iter().zip(&sites.cols) {
        write!(w, "{}\t", pos + 1)?;
        w.write_all(col)?;
        writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}
