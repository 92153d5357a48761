//! Audit dump of processed readouts.

use crate::codec::{encode_readout, RECORD_SIZE};
use crate::Result;
use efu_core::Readout;
use log::info;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Appends packed readout records to `<prefix>-<n>.bin`.
///
/// With a split interval the writer moves on to the next file index once
/// the current file has been open that long.
pub struct DumpFileWriter {
    prefix: PathBuf,
    split: Option<Duration>,
    index: usize,
    writer: BufWriter<File>,
    opened: Instant,
    scratch: Vec<u8>,
    records: u64,
    paths: Vec<PathBuf>,
}

impl DumpFileWriter {
    /// Creates `<prefix>-0.bin`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(prefix: P, split: Option<Duration>) -> Result<Self> {
        let prefix = prefix.as_ref().to_path_buf();
        let path = dump_path(&prefix, 0);
        let writer = BufWriter::new(File::create(&path)?);
        info!("dumping readouts to {}", path.display());
        Ok(Self {
            prefix,
            split: split.filter(|d| !d.is_zero()),
            index: 0,
            writer,
            opened: Instant::now(),
            scratch: Vec::new(),
            records: 0,
            paths: vec![path],
        })
    }

    /// Appends `readouts` to the current file.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub fn push(&mut self, readouts: &[Readout]) -> Result<()> {
        self.scratch.clear();
        self.scratch.reserve(readouts.len() * RECORD_SIZE);
        for readout in readouts {
            encode_readout(readout, &mut self.scratch);
        }
        self.writer.write_all(&self.scratch)?;
        self.records += readouts.len() as u64;
        Ok(())
    }

    /// Rotates if the split interval has elapsed. Returns true on rotation.
    ///
    /// # Errors
    /// Returns an error if the next file cannot be created.
    pub fn check_rotate(&mut self) -> Result<bool> {
        match self.split {
            Some(split) if self.opened.elapsed() >= split => {
                self.rotate()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Flushes the current file and starts the next one.
    ///
    /// # Errors
    /// Returns an error if the flush fails or the next file cannot be created.
    pub fn rotate(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.index += 1;
        let path = dump_path(&self.prefix, self.index);
        self.writer = BufWriter::new(File::create(&path)?);
        self.opened = Instant::now();
        info!("rotated dump to {}", path.display());
        self.paths.push(path);
        Ok(())
    }

    /// Flushes buffered records to disk.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Records written across all files.
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Files created so far, oldest first.
    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

fn dump_path(prefix: &Path, index: usize) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(format!("-{index}.bin"));
    PathBuf::from(name)
}
