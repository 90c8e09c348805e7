use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::model::ArgModel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgParamsFile {
    pub times: Vec<f64>,
    pub popsizes: Vec<f64>,
    pub rho: f64,
    pub mu: f64,
}

pub fn save_params(path: &Path, params: &ArgParamsFile) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, params)
        .with_context(|| format!("failed to write {:?}", path))?;
    Ok(())
}

pub fn load_params(path: &Path) -> Result<ArgParamsFile> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let reader = BufReader::new(file);
    let params =
        serde_json::from_reader(reader).with_context(|| format!("failed to parse {:?}", path))?;
    Ok(params)
}

pub fn load_model(path: &Path) -> Result<ArgModel> {
    let params = load_params(path)?;
    ArgModel::from_times(params.times, params.popsizes, params.rho, params.mu)
}
