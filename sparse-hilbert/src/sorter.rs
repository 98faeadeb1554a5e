//! External merge sort for record streams that may not fit in memory.
//!
//! Records are buffered up to a configured count, sorted in memory and
//! spilled to anonymous temporary files, then merged. When the number of
//! spill files exceeds the merge fan-in, intermediate merge passes reduce
//! them first, so file-handle usage stays bounded no matter how large the
//! input is.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use log::debug;

use crate::codec::RecordCodec;
use crate::errors::IndexResult;

/// Tuning knobs for the external sort.
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Records buffered in memory before spilling a sorted run to disk.
    pub max_items_per_file: usize,
    /// Maximum spill files merged in a single pass.
    pub max_files_per_merge: usize,
}

impl Default for SortConfig {
    fn default() -> Self {
        SortConfig {
            max_items_per_file: 100_000,
            max_files_per_merge: 100,
        }
    }
}

/// Sorts all records from `input` into `output` using `compare`, spilling to
/// temporary files as needed. Returns the number of records written.
pub fn sort<C, F>(
    codec: &C,
    compare: F,
    input: &mut dyn Read,
    output: &mut dyn Write,
    config: &SortConfig,
) -> IndexResult<u64>
where
    C: RecordCodec,
    F: Fn(&C::Record, &C::Record) -> Ordering,
{
    let mut runs: Vec<File> = Vec::new();
    let mut buffer: Vec<C::Record> = Vec::new();
    let mut count = 0u64;

    while let Some(record) = codec.read_record(input)? {
        buffer.push(record);
        count += 1;
        if buffer.len() >= config.max_items_per_file.max(1) {
            runs.push(spill(codec, &compare, &mut buffer)?);
        }
    }
    if !buffer.is_empty() {
        runs.push(spill(codec, &compare, &mut buffer)?);
    }
    debug!("sorted {} records into {} spill files", count, runs.len());

    // Reduce the run count until one merge pass can finish the job.
    let fan_in = config.max_files_per_merge.max(2);
    while runs.len() > fan_in {
        let mut next = Vec::new();
        for group in runs.chunks_mut(fan_in) {
            let mut merged = tempfile::tempfile()?;
            {
                let mut w = BufWriter::new(&mut merged);
                merge(codec, &compare, group, &mut w)?;
                w.flush()?;
            }
            merged.seek(SeekFrom::Start(0))?;
            next.push(merged);
        }
        debug!("intermediate merge pass produced {} files", next.len());
        runs = next;
    }

    merge(codec, &compare, &mut runs, output)?;
    Ok(count)
}

/// Sorts the buffer, writes it to a fresh temporary file and rewinds the
/// file ready for merging. The buffer is left empty.
fn spill<C, F>(codec: &C, compare: &F, buffer: &mut Vec<C::Record>) -> IndexResult<File>
where
    C: RecordCodec,
    F: Fn(&C::Record, &C::Record) -> Ordering,
{
    buffer.sort_by(compare);
    let mut file = tempfile::tempfile()?;
    {
        let mut w = BufWriter::new(&mut file);
        for record in buffer.iter() {
            codec.write_record(&mut w, record)?;
        }
        w.flush()?;
    }
    file.seek(SeekFrom::Start(0))?;
    buffer.clear();
    Ok(file)
}

/// K-way merge of sorted runs into `output`. The fan-in is small enough that
/// a linear scan over the current heads beats a heap in practice.
fn merge<C, F>(
    codec: &C,
    compare: &F,
    runs: &mut [File],
    output: &mut dyn Write,
) -> IndexResult<()>
where
    C: RecordCodec,
    F: Fn(&C::Record, &C::Record) -> Ordering,
{
    let mut readers: Vec<BufReader<&mut File>> =
        runs.iter_mut().map(BufReader::new).collect();
    let mut heads: Vec<Option<C::Record>> = Vec::with_capacity(readers.len());
    for reader in readers.iter_mut() {
        heads.push(codec.read_record(reader)?);
    }
    loop {
        let mut min: Option<usize> = None;
        for (i, head) in heads.iter().enumerate() {
            if let Some(record) = head {
                match min {
                    None => min = Some(i),
                    Some(m) => {
                        if compare(record, heads[m].as_ref().unwrap()) == Ordering::Less {
                            min = Some(i);
                        }
                    }
                }
            }
        }
        let Some(i) = min else { break };
        let record = heads[i].take().unwrap();
        codec.write_record(output, &record)?;
        heads[i] = codec.read_record(&mut readers[i])?;
    }
    Ok(())
}
