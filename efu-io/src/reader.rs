//! Memory-mapped file readers.
//!

use crate::codec::{decode_readout, decode_records, RECORD_SIZE};
use crate::{Error, Result};
use efu_core::{EventType, ParseSummary, Readout};
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A memory-mapped file reader.
///
/// Uses memmap2 to efficiently access file contents without
/// loading the entire file into memory.
pub struct MappedFileReader {
    mmap: Option<Mmap>,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // zero length files cannot be mapped on every platform
        let mmap = if file.metadata()?.len() == 0 {
            None
        } else {
            // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
            // This is the standard safety contract for memory mapping.
            #[allow(unsafe_code)]
            let mmap = unsafe { Mmap::map(&file)? };
            Some(mmap)
        };
        Ok(Self {
            mmap,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or_default()
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the path the file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A batch of readouts read back from a dump.
#[derive(Debug, Clone, Default)]
pub struct ReadoutBatch {
    /// Decoded readouts in file order.
    pub readouts: Vec<Readout>,
    /// Timestamp range and error counts of the batch.
    pub summary: ParseSummary,
}

/// Reader for dump files written by [`DumpFileWriter`](crate::DumpFileWriter).
pub struct DumpFileReader {
    reader: MappedFileReader,
}

impl DumpFileReader {
    /// Opens a dump file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be mapped or its size is not a
    /// whole number of records.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = MappedFileReader::open(path)?;
        if !reader.len().is_multiple_of(RECORD_SIZE) {
            return Err(Error::InvalidFormat(format!(
                "file size {} is not a multiple of {RECORD_SIZE} (file: {})",
                reader.len(),
                reader.path().display()
            )));
        }
        Ok(Self { reader })
    }

    /// Returns the number of records in the file.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.reader.len() / RECORD_SIZE
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn file_size(&self) -> usize {
        self.reader.len()
    }

    /// Decodes the whole file, skipping records with unknown event codes.
    #[must_use]
    pub fn read_all(&self) -> Vec<Readout> {
        self.reader
            .as_bytes()
            .par_chunks_exact(RECORD_SIZE)
            .filter_map(|chunk| <&[u8; RECORD_SIZE]>::try_from(chunk).ok())
            .map(decode_readout)
            .filter(|r| r.event_type != EventType::Invalid)
            .collect()
    }

    /// Iterates over the file in batches of up to `batch_size` records.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = ReadoutBatch> + '_ {
        self.reader
            .as_bytes()
            .chunks(batch_size.max(1) * RECORD_SIZE)
            .map(|bytes| {
                let mut readouts = Vec::with_capacity(bytes.len() / RECORD_SIZE);
                let summary = decode_records(bytes, &mut readouts);
                ReadoutBatch { readouts, summary }
            })
    }
}
