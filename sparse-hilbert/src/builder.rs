//! Two-pass index construction: a bounds scan over the raw data, an external
//! sort by curve index, then a byte-counting pass that samples the sparse
//! position table from the sorted output.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use log::info;

use crate::codec::RecordCodec;
use crate::curve::HilbertCurve;
use crate::errors::{IndexError, IndexResult};
use crate::index::{normalize_ordinate, SpatialIndex};
use crate::sorter::{self, SortConfig};

/// Construction parameters for an index.
///
/// `bits` and `dimensions` are fixed at creation and validated together; the
/// public fields tune table density and sort resource usage.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    bits: u32,
    dimensions: u32,
    /// Target number of position table entries. The builder samples roughly
    /// every `count / approx_index_entries` records; small files get an entry
    /// per record.
    pub approx_index_entries: usize,
    pub sort: SortConfig,
}

impl IndexConfig {
    pub fn new(bits: u32, dimensions: u32) -> IndexResult<IndexConfig> {
        // same validity rules as the curve itself
        HilbertCurve::new(bits, dimensions)?;
        Ok(IndexConfig {
            bits,
            dimensions,
            approx_index_entries: 10_000,
            sort: SortConfig::default(),
        })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn dimensions(&self) -> u32 {
        self.dimensions
    }
}

/// Builds an index over the records in `input`, writing the curve-sorted copy
/// of the data to `output` and returning the in-memory index for it.
///
/// The caller persists the index with [`SpatialIndex::write_to_path`] when
/// wanted; searches always run against the sorted copy, never the original.
pub fn create_index<C, P>(
    codec: C,
    point_mapper: P,
    config: &IndexConfig,
    input: &Path,
    output: &Path,
) -> IndexResult<SpatialIndex<C, P>>
where
    C: RecordCodec,
    P: Fn(&C::Record) -> Vec<f64>,
{
    if config.approx_index_entries == 0 {
        return Err(IndexError::Config(
            "approx_index_entries must be at least 1".to_string(),
        ));
    }
    let curve = HilbertCurve::new(config.bits, config.dimensions)?;
    let d = config.dimensions as usize;

    // pass 1: coordinate bounds and record count
    let mut mins = vec![f64::MAX; d];
    let mut maxes = vec![f64::MIN; d];
    let mut count = 0u64;
    {
        let mut reader = BufReader::new(File::open(input)?);
        while let Some(record) = codec.read_record(&mut reader)? {
            let point = point_mapper(&record);
            if point.len() != d {
                return Err(IndexError::Config(format!(
                    "record has {} coordinates but the index has {} dimensions",
                    point.len(),
                    d
                )));
            }
            for i in 0..d {
                mins[i] = mins[i].min(point[i]);
                maxes[i] = maxes[i].max(point[i]);
            }
            count += 1;
        }
    }
    if count == 0 {
        mins = vec![0.0; d];
        maxes = vec![0.0; d];
        File::create(output)?;
        info!("indexed empty input {}", input.display());
        return Ok(SpatialIndex::from_parts(
            curve,
            mins,
            maxes,
            0,
            BTreeMap::new(),
            codec,
            point_mapper,
        ));
    }

    let max_ordinate = curve.max_ordinate();
    let curve_index = |record: &C::Record| -> u64 {
        let point = point_mapper(record);
        let ordinates: Vec<u32> = point
            .iter()
            .enumerate()
            .map(|(i, &x)| normalize_ordinate(x, mins[i], maxes[i], max_ordinate))
            .collect();
        curve.index(&ordinates)
    };

    // sort the data by curve index into the output file
    {
        let mut reader = BufReader::new(File::open(input)?);
        let mut writer = BufWriter::new(File::create(output)?);
        sorter::sort(
            &codec,
            |a, b| curve_index(a).cmp(&curve_index(b)),
            &mut reader,
            &mut writer,
            &config.sort,
        )?;
        writer.flush()?;
    }

    // pass 2: walk the sorted copy counting serialized bytes, sampling an
    // entry whenever the running byte position lands on a multiple of
    // `chunk`. Where sampled records share a curve index the first position
    // wins, so a scan starting there sees them all. The last record is
    // anchored into the table when the file end misses a chunk boundary.
    let chunk = (count / config.approx_index_entries as u64).max(1);
    let mut positions: BTreeMap<u32, u64> = BTreeMap::new();
    {
        let mut reader = BufReader::new(File::open(output)?);
        let mut position = 0u64;
        let mut last: Option<(u32, u64)> = None;
        while let Some(record) = codec.read_record(&mut reader)? {
            let index = curve_index(&record) as u32;
            if position % chunk == 0 {
                positions.entry(index).or_insert(position);
            }
            last = Some((index, position));
            position += record_length(&codec, &record)?;
        }
        if position % chunk != 0 {
            if let Some((index, last_position)) = last {
                positions.entry(index).or_insert(last_position);
            }
        }
    }
    info!(
        "indexed {} records from {} into {} table entries",
        count,
        input.display(),
        positions.len()
    );
    Ok(SpatialIndex::from_parts(
        curve,
        mins,
        maxes,
        count,
        positions,
        codec,
        point_mapper,
    ))
}

/// Serialized length of one record, measured by writing it to a counting
/// sink. Works for any codec without requiring a length method.
fn record_length<C: RecordCodec>(codec: &C, record: &C::Record) -> IndexResult<u64> {
    let mut sink = CountingSink { count: 0 };
    codec.write_record(&mut sink, record)?;
    Ok(sink.count)
}

struct CountingSink {
    count: u64,
}

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LineCodec;
    use std::io::Read;

    fn csv_point(record: &String) -> Vec<f64> {
        record.split(',').map(|s| s.parse().unwrap()).collect()
    }

    fn write_input(dir: &Path, lines: &[&str]) -> std::path::PathBuf {
        let path = dir.join("input.txt");
        let mut content = String::new();
        for l in lines {
            content.push_str(l);
            content.push('\n');
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_create_index_sorts_and_samples() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), &["10,2,300", "4,5,600", "8,7,100"]);
        let output = dir.path().join("sorted.txt");
        let config = IndexConfig::new(2, 3).unwrap();
        let index =
            create_index(LineCodec, csv_point, &config, &input, &output).unwrap();

        assert_eq!(index.count(), 3);
        assert_eq!(index.mins(), &[4.0, 2.0, 100.0]);
        assert_eq!(index.maxes(), &[10.0, 7.0, 600.0]);

        let mut sorted = String::new();
        File::open(&output)
            .unwrap()
            .read_to_string(&mut sorted)
            .unwrap();
        assert_eq!(sorted, "4,5,600\n8,7,100\n10,2,300\n");

        let entries: Vec<(u64, u64)> = index.positions().collect();
        assert_eq!(entries, vec![(17, 0), (35, 8), (56, 16)]);
    }

    #[test]
    fn test_create_index_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), &[]);
        let output = dir.path().join("sorted.txt");
        let config = IndexConfig::new(2, 3).unwrap();
        let index =
            create_index(LineCodec, csv_point, &config, &input, &output).unwrap();
        assert_eq!(index.count(), 0);
        assert_eq!(index.positions().count(), 0);
        assert_eq!(std::fs::metadata(&output).unwrap().len(), 0);
    }

    #[test]
    fn test_chunked_sampling_is_byte_position_based() {
        let dir = tempfile::tempdir().unwrap();
        // five 7-byte records at distinct curve cells
        let input = write_input(
            dir.path(),
            &["0,0,10", "1,1,10", "2,2,10", "3,3,10", "4,4,10"],
        );
        let output = dir.path().join("sorted.txt");
        let mut config = IndexConfig::new(3, 3).unwrap();
        config.approx_index_entries = 2;
        let index =
            create_index(LineCodec, csv_point, &config, &input, &output).unwrap();
        // chunk of 2 samples the records at byte offsets 0, 14 and 28
        assert_eq!(index.positions().count(), 3);
        let entries: Vec<(u64, u64)> = index.positions().collect();
        assert!(entries.iter().any(|&(_, p)| p == 0));
        assert!(entries.iter().any(|&(_, p)| p == 14));
        assert!(entries.iter().any(|&(_, p)| p == 28));
    }

    #[test]
    fn test_duplicate_curve_index_keeps_first_position() {
        let dir = tempfile::tempdir().unwrap();
        // two records at the same point share a curve index
        let input = write_input(dir.path(), &["5,5,5", "0,0,0", "5,5,5"]);
        let output = dir.path().join("sorted.txt");
        let config = IndexConfig::new(2, 3).unwrap();
        let index =
            create_index(LineCodec, csv_point, &config, &input, &output).unwrap();
        let entries: Vec<(u64, u64)> = index.positions().collect();
        assert_eq!(entries.len(), 2);
        let mut sorted = String::new();
        File::open(&output)
            .unwrap()
            .read_to_string(&mut sorted)
            .unwrap();
        assert_eq!(sorted, "0,0,0\n5,5,5\n5,5,5\n");
        assert_eq!(entries[0], (0, 0));
        assert_eq!(entries[1].1, 6);
    }

    #[test]
    fn test_record_dimension_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), &["1,2"]);
        let output = dir.path().join("sorted.txt");
        let config = IndexConfig::new(2, 3).unwrap();
        assert!(matches!(
            create_index(LineCodec, csv_point, &config, &input, &output),
            Err(IndexError::Config(_))
        ));
    }

    #[test]
    fn test_zero_approx_entries_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), &["1,2,3"]);
        let output = dir.path().join("sorted.txt");
        let mut config = IndexConfig::new(2, 3).unwrap();
        config.approx_index_entries = 0;
        assert!(matches!(
            create_index(LineCodec, csv_point, &config, &input, &output),
            Err(IndexError::Config(_))
        ));
    }
}
