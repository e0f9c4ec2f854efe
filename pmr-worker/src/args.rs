use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use common::Code;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The Python interpreter backing the sandbox.
    #[arg(long, default_value = "python3")]
    pub python: PathBuf,

    /// File defining `fmap(value)`.
    #[arg(short, long)]
    pub map: PathBuf,

    /// File defining `fcomb(key, values)`. The combine step is skipped
    /// without one.
    #[arg(short, long)]
    pub combiner: Option<PathBuf>,

    /// File defining `fred(key, values)`.
    #[arg(short, long)]
    pub reduce: PathBuf,

    /// Glob matching the input files (txt, csv, json or arff).
    #[arg(short, long)]
    pub input: String,

    /// The peer that coordinates the job.
    #[arg(long, default_value = "owner")]
    pub coordinator: String,

    /// A key this peer is asked to reduce. May be given several times.
    #[arg(short = 'k', long = "reduce-key")]
    pub reduce_keys: Vec<String>,

    /// Stop once the code has been validated.
    #[arg(long)]
    pub validate_only: bool,
}

impl Args {
    pub fn load_code(&self) -> Result<Code> {
        let read = |path: &PathBuf| {
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
        };

        let combiner = match &self.combiner {
            Some(path) => read(path)?,
            None => String::new(),
        };
        Ok(Code::new(read(&self.map)?, combiner, read(&self.reduce)?))
    }

    /// The input files, in glob order.
    pub fn input_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in glob::glob(&self.input).context("invalid input pattern")? {
            let path = entry?;
            if path.is_file() {
                files.push(path);
            }
        }
        Ok(files)
    }
}
