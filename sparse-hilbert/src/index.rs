//! The sparse index itself: the position table, coordinate normalization,
//! curve-range to byte-range resolution and the versioned on-disk format.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::debug;

use crate::bounds::Bounds;
use crate::codec::RecordCodec;
use crate::curve::{HilbertCurve, IndexRange};
use crate::errors::{IndexError, IndexResult};

/// On-disk format version written by this build.
const FORMAT_VERSION: u16 = 1;

/// A contiguous byte region of the data file to scan for one or more curve
/// ranges.
///
/// `max_curve_index` is the largest curve index any record in the region can
/// have and still be wanted; a scan stops early once it passes it.
/// `ceiling_position` is `None` when the region runs to the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRange {
    max_curve_index: u64,
    floor_position: u64,
    ceiling_position: Option<u64>,
}

impl PositionRange {
    pub fn new(max_curve_index: u64, floor_position: u64, ceiling_position: Option<u64>) -> Self {
        PositionRange {
            max_curve_index,
            floor_position,
            ceiling_position,
        }
    }

    pub fn max_curve_index(&self) -> u64 {
        self.max_curve_index
    }

    pub fn floor_position(&self) -> u64 {
        self.floor_position
    }

    pub fn ceiling_position(&self) -> Option<u64> {
        self.ceiling_position
    }

    /// Merges two overlapping or touching regions into their union.
    pub fn join(&self, other: &PositionRange) -> PositionRange {
        let ceiling = match (self.ceiling_position, other.ceiling_position) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        PositionRange {
            max_curve_index: self.max_curve_index.max(other.max_curve_index),
            floor_position: self.floor_position.min(other.floor_position),
            ceiling_position: ceiling,
        }
    }
}

impl fmt::Display for PositionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ceiling_position {
            Some(c) => write!(
                f,
                "[{}, {}) maxIndex={}",
                self.floor_position, c, self.max_curve_index
            ),
            None => write!(
                f,
                "[{}, end) maxIndex={}",
                self.floor_position, self.max_curve_index
            ),
        }
    }
}

/// A sparse Hilbert-curve index over a data file whose records are sorted by
/// curve index.
///
/// The index holds coordinate bounds for normalization, the record count and
/// a sparse table mapping a sampled curve index to the byte position of the
/// first record carrying it. The table is small enough to live in memory even
/// for very large files; the data file itself is only ever touched through
/// positioned range reads.
pub struct SpatialIndex<C, P> {
    curve: HilbertCurve,
    mins: Vec<f64>,
    maxes: Vec<f64>,
    count: u64,
    positions: BTreeMap<u32, u64>,
    codec: C,
    point_mapper: P,
}

impl<C, P> SpatialIndex<C, P>
where
    C: RecordCodec,
    P: Fn(&C::Record) -> Vec<f64>,
{
    pub(crate) fn from_parts(
        curve: HilbertCurve,
        mins: Vec<f64>,
        maxes: Vec<f64>,
        count: u64,
        positions: BTreeMap<u32, u64>,
        codec: C,
        point_mapper: P,
    ) -> Self {
        SpatialIndex {
            curve,
            mins,
            maxes,
            count,
            positions,
            codec,
            point_mapper,
        }
    }

    pub fn curve(&self) -> &HilbertCurve {
        &self.curve
    }

    pub fn mins(&self) -> &[f64] {
        &self.mins
    }

    pub fn maxes(&self) -> &[f64] {
        &self.maxes
    }

    /// Number of records in the indexed data file.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// The sparse position table, in curve-index order.
    pub fn positions(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.positions.iter().map(|(&k, &v)| (k as u64, v))
    }

    pub(crate) fn codec(&self) -> &C {
        &self.codec
    }

    /// Normalized ordinates of a coordinate tuple, clamped to the index
    /// bounds. A degenerate dimension (`min == max`) always maps to 0.
    pub fn ordinates(&self, point: &[f64]) -> Vec<u32> {
        debug_assert_eq!(point.len(), self.mins.len());
        let max_ordinate = self.curve.max_ordinate();
        point
            .iter()
            .zip(self.mins.iter().zip(self.maxes.iter()))
            .map(|(&x, (&min, &max))| normalize_ordinate(x, min, max, max_ordinate))
            .collect()
    }

    /// Curve index of a record, via the point mapper and normalization.
    pub fn curve_index_of(&self, record: &C::Record) -> u64 {
        let point = (self.point_mapper)(record);
        self.curve.index(&self.ordinates(&point))
    }

    pub(crate) fn point_of(&self, record: &C::Record) -> Vec<f64> {
        (self.point_mapper)(record)
    }

    /// Maps ascending, non-overlapping curve ranges through the position
    /// table into merged byte regions. [`resolve`](Self::resolve) is the
    /// usual entry point; this is the table-lookup half on its own.
    pub fn position_ranges(&self, ranges: &[IndexRange]) -> Vec<PositionRange> {
        position_ranges(&self.positions, ranges)
    }

    /// Resolves a query box to the byte regions of the data file that can
    /// contain matching records, merged and in ascending position order.
    ///
    /// `max_ranges == 0` leaves the curve decomposition exact; a positive
    /// value coarsens it to at most that many curve ranges before the
    /// position lookup.
    pub fn resolve(&self, bounds: &Bounds, max_ranges: usize) -> IndexResult<Vec<PositionRange>> {
        if bounds.dimensions() != self.curve.dimensions() as usize {
            return Err(IndexError::Config(format!(
                "query has {} dimensions but the index has {}",
                bounds.dimensions(),
                self.curve.dimensions()
            )));
        }
        if !bounds.intersects(&self.mins, &self.maxes) {
            return Ok(Vec::new());
        }
        let low = self.ordinates(bounds.mins());
        let high = self.ordinates(bounds.maxes());
        let ranges = self.curve.query(&low, &high, max_ranges);
        let position_ranges = position_ranges(&self.positions, &ranges);
        debug!(
            "resolved query to {} curve ranges, {} byte regions",
            ranges.len(),
            position_ranges.len()
        );
        Ok(position_ranges)
    }

    /// Serializes the index in the versioned big-endian format.
    pub fn write_to(&self, writer: &mut dyn Write) -> IndexResult<()> {
        writer.write_all(&FORMAT_VERSION.to_be_bytes())?;
        writer.write_all(&(self.curve.bits() as i32).to_be_bytes())?;
        writer.write_all(&(self.curve.dimensions() as i32).to_be_bytes())?;
        // bounds are stored interleaved, one (min, max) pair per dimension
        for (&min, &max) in self.mins.iter().zip(self.maxes.iter()) {
            writer.write_all(&min.to_be_bytes())?;
            writer.write_all(&max.to_be_bytes())?;
        }
        writer.write_all(&(self.count as i64).to_be_bytes())?;
        writer.write_all(&(self.positions.len() as i32).to_be_bytes())?;
        // Positions are written as 4 bytes when they all fit, 8 otherwise.
        let wide = self
            .positions
            .values()
            .any(|&p| p > i32::MAX as u64);
        writer.write_all(&(wide as i32).to_be_bytes())?;
        for (&index, &position) in &self.positions {
            writer.write_all(&(index as i32).to_be_bytes())?;
            if wide {
                writer.write_all(&(position as i64).to_be_bytes())?;
            } else {
                if position > i32::MAX as u64 {
                    return Err(IndexError::PositionOverflow(position));
                }
                writer.write_all(&(position as i32).to_be_bytes())?;
            }
        }
        Ok(())
    }

    pub fn write_to_path<Q: AsRef<Path>>(&self, path: Q) -> IndexResult<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_to(&mut w)?;
        w.flush()?;
        Ok(())
    }

    /// Deserializes an index, pairing it with the codec and point mapper the
    /// data file requires (those are behavior, not data, and are never
    /// persisted).
    pub fn read_from(reader: &mut dyn Read, codec: C, point_mapper: P) -> IndexResult<Self> {
        let version = u16::from_be_bytes(read_array(reader, "version")?);
        if version != FORMAT_VERSION {
            return Err(IndexError::UnsupportedVersion(version));
        }
        let bits = i32::from_be_bytes(read_array(reader, "bits")?);
        let dimensions = i32::from_be_bytes(read_array(reader, "dimensions")?);
        if bits <= 0 || dimensions <= 0 {
            return Err(IndexError::Corrupt(format!(
                "invalid curve parameters: bits={bits} dimensions={dimensions}"
            )));
        }
        let curve = HilbertCurve::new(bits as u32, dimensions as u32)
            .map_err(|e| IndexError::Corrupt(e.to_string()))?;
        let d = dimensions as usize;
        let mut mins = Vec::with_capacity(d);
        let mut maxes = Vec::with_capacity(d);
        for _ in 0..d {
            mins.push(f64::from_be_bytes(read_array(reader, "bounds")?));
            maxes.push(f64::from_be_bytes(read_array(reader, "bounds")?));
        }
        let count = i64::from_be_bytes(read_array(reader, "count")?);
        if count < 0 {
            return Err(IndexError::Corrupt(format!("negative record count {count}")));
        }
        let num_entries = i32::from_be_bytes(read_array(reader, "entry count")?);
        if num_entries < 0 {
            return Err(IndexError::Corrupt(format!(
                "negative entry count {num_entries}"
            )));
        }
        let width_flag = i32::from_be_bytes(read_array(reader, "position width flag")?);
        let wide = match width_flag {
            0 => false,
            1 => true,
            other => {
                return Err(IndexError::Corrupt(format!(
                    "unknown position width flag {other}"
                )))
            }
        };
        let mut positions = BTreeMap::new();
        let mut last: Option<(u32, u64)> = None;
        for _ in 0..num_entries {
            let index = i32::from_be_bytes(read_array(reader, "table entry")?);
            if index < 0 {
                return Err(IndexError::Corrupt(format!("negative curve index {index}")));
            }
            let position = if wide {
                let p = i64::from_be_bytes(read_array(reader, "table entry")?);
                if p < 0 {
                    return Err(IndexError::Corrupt(format!("negative position {p}")));
                }
                p as u64
            } else {
                let p = i32::from_be_bytes(read_array(reader, "table entry")?);
                if p < 0 {
                    return Err(IndexError::Corrupt(format!("negative position {p}")));
                }
                p as u64
            };
            if let Some((li, lp)) = last {
                if index as u32 <= li || position < lp {
                    return Err(IndexError::Corrupt(format!(
                        "position table not monotonic at curve index {index}"
                    )));
                }
            }
            last = Some((index as u32, position));
            positions.insert(index as u32, position);
        }
        Ok(SpatialIndex {
            curve,
            mins,
            maxes,
            count: count as u64,
            positions,
            codec,
            point_mapper,
        })
    }

    pub fn read_from_path<Q: AsRef<Path>>(
        path: Q,
        codec: C,
        point_mapper: P,
    ) -> IndexResult<Self> {
        let mut r = BufReader::new(File::open(path)?);
        Self::read_from(&mut r, codec, point_mapper)
    }

    /// Fetches a serialized index over HTTP and deserializes it. Index files
    /// are small, so a whole-body GET is used rather than range requests.
    #[cfg(feature = "http")]
    pub fn read_from_url(url: &str, codec: C, point_mapper: P) -> IndexResult<Self> {
        use crate::search::http_err;
        let response = reqwest::blocking::get(url)
            .and_then(|r| r.error_for_status())
            .map_err(http_err)?;
        let bytes = response.bytes().map_err(http_err)?;
        Self::read_from(&mut std::io::Cursor::new(bytes.as_ref()), codec, point_mapper)
    }
}

impl<C, P> fmt::Display for SpatialIndex<C, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SpatialIndex [bits={}, dimensions={}, count={}, entries={}]",
            self.curve.bits(),
            self.curve.dimensions(),
            self.count,
            self.positions.len()
        )
    }
}

/// Clamps `x` into `[min, max]` and scales it to an integer ordinate in
/// `[0, max_ordinate]`.
pub(crate) fn normalize_ordinate(x: f64, min: f64, max: f64, max_ordinate: u32) -> u32 {
    if max <= min {
        return 0;
    }
    let clamped = x.clamp(min, max);
    (((clamped - min) / (max - min)) * max_ordinate as f64).round() as u32
}

/// Maps ascending curve ranges to byte regions via the sparse table, merging
/// regions whose byte extents overlap or touch.
pub(crate) fn position_ranges(
    positions: &BTreeMap<u32, u64>,
    ranges: &[IndexRange],
) -> Vec<PositionRange> {
    let (Some((&first_key, &first_pos)), Some((&last_key, _))) =
        (positions.first_key_value(), positions.last_key_value())
    else {
        return Vec::new();
    };
    let mut out: Vec<PositionRange> = Vec::new();
    for range in ranges {
        if range.low() > last_key as u64 || range.high() < first_key as u64 {
            continue;
        }
        // Largest sampled index at or below the range start; if the range
        // starts before the first sample, the first sampled position covers
        // it because nothing precedes the first record.
        let floor = if range.low() <= u32::MAX as u64 {
            positions
                .range(..=range.low() as u32)
                .next_back()
                .map(|(_, &p)| p)
                .unwrap_or(first_pos)
        } else {
            first_pos
        };
        // First sampled index strictly above the range end bounds the scan;
        // past the last sample the scan runs to end of file.
        let ceiling = if range.high() < last_key as u64 {
            positions
                .range((range.high() + 1) as u32..)
                .next()
                .map(|(_, &p)| p)
        } else {
            None
        };
        let next = PositionRange::new(range.high(), floor, ceiling);
        let touches_last = out.last().is_some_and(|last_pr| {
            last_pr
                .ceiling_position()
                .map_or(true, |c| next.floor_position() <= c)
        });
        if touches_last {
            let joined = out.pop().unwrap().join(&next);
            out.push(joined);
        } else {
            out.push(next);
        }
    }
    out
}

fn read_array<const N: usize>(reader: &mut dyn Read, what: &str) -> IndexResult<[u8; N]> {
    let mut buf = [0u8; N];
    reader
        .read_exact(&mut buf)
        .map_err(|e| IndexError::truncated_from(e, what))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LineCodec;
    use std::io::Cursor;

    fn table(entries: &[(u32, u64)]) -> BTreeMap<u32, u64> {
        entries.iter().copied().collect()
    }

    fn test_index(positions: BTreeMap<u32, u64>) -> SpatialIndex<LineCodec, fn(&String) -> Vec<f64>> {
        SpatialIndex::from_parts(
            HilbertCurve::new(2, 3).unwrap(),
            vec![4.0, 2.0, 100.0],
            vec![10.0, 7.0, 600.0],
            3,
            positions,
            LineCodec,
            |_r: &String| vec![0.0, 0.0, 0.0],
        )
    }

    #[test]
    fn test_position_ranges_empty_ranges() {
        let t = table(&[(1, 0), (8, 5)]);
        assert!(position_ranges(&t, &[]).is_empty());
    }

    #[test]
    fn test_position_ranges_range_above_last_key() {
        let t = table(&[(1, 0), (8, 5)]);
        assert!(position_ranges(&t, &[IndexRange::new(10, 12)]).is_empty());
    }

    #[test]
    fn test_position_ranges_single_range() {
        let t = table(&[(1, 0), (8, 5), (16, 10), (20, 16)]);
        let prs = position_ranges(&t, &[IndexRange::new(5, 9)]);
        assert_eq!(prs, vec![PositionRange::new(9, 0, Some(10))]);
    }

    #[test]
    fn test_position_ranges_disjoint_ranges_stay_separate() {
        let t = table(&[(1, 0), (8, 5), (16, 10), (20, 16)]);
        let prs = position_ranges(
            &t,
            &[IndexRange::new(2, 3), IndexRange::new(18, 22)],
        );
        // the second range starts at 18, whose floor key is 16 at position 10
        assert_eq!(
            prs,
            vec![
                PositionRange::new(3, 0, Some(5)),
                PositionRange::new(22, 10, None),
            ]
        );
    }

    #[test]
    fn test_position_ranges_touching_regions_merge() {
        let t = table(&[(1, 0), (8, 5), (16, 10), (20, 16)]);
        let prs = position_ranges(
            &t,
            &[IndexRange::new(2, 3), IndexRange::new(7, 9)],
        );
        assert_eq!(prs, vec![PositionRange::new(9, 0, Some(10))]);
    }

    #[test]
    fn test_position_ranges_start_before_first_key() {
        let t = table(&[(5, 0), (8, 5)]);
        let prs = position_ranges(&t, &[IndexRange::new(0, 6)]);
        assert_eq!(prs, vec![PositionRange::new(6, 0, Some(5))]);
    }

    #[test]
    fn test_position_ranges_empty_table() {
        let t = BTreeMap::new();
        assert!(position_ranges(&t, &[IndexRange::new(0, 63)]).is_empty());
    }

    #[test]
    fn test_scenario_table_sub_box() {
        // table for three records indexed at 17, 35 and 56, chunked into
        // three byte regions of 8 bytes each
        let idx = test_index(table(&[(17, 0), (35, 8), (56, 16)]));
        let bounds = Bounds::new(vec![7.0, 6.0, 50.0], vec![9.0, 8.0, 150.0]).unwrap();
        let prs = idx.resolve(&bounds, 1).unwrap();
        assert_eq!(prs.len(), 1);
        assert_eq!(prs[0].floor_position(), 0);
        assert_eq!(prs[0].ceiling_position(), Some(16));
        assert_eq!(prs[0].max_curve_index(), 35);
    }

    #[test]
    fn test_scenario_whole_domain() {
        let idx = test_index(table(&[(17, 0), (35, 8), (56, 16)]));
        let bounds = Bounds::new(vec![4.0, 2.0, 100.0], vec![10.0, 7.0, 600.0]).unwrap();
        let prs = idx.resolve(&bounds, 0).unwrap();
        assert_eq!(prs, vec![PositionRange::new(63, 0, None)]);
    }

    #[test]
    fn test_resolve_disjoint_box_is_empty() {
        let idx = test_index(table(&[(17, 0), (35, 8), (56, 16)]));
        let bounds = Bounds::new(vec![11.0, 0.0, 0.0], vec![12.0, 10.0, 700.0]).unwrap();
        assert!(idx.resolve(&bounds, 0).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_rejects_dimension_mismatch() {
        let idx = test_index(table(&[(17, 0)]));
        let bounds = Bounds::new(vec![0.0], vec![1.0]).unwrap();
        assert!(matches!(
            idx.resolve(&bounds, 0),
            Err(IndexError::Config(_))
        ));
    }

    #[test]
    fn test_normalize_ordinate() {
        assert_eq!(normalize_ordinate(0.0, 0.0, 10.0, 1023), 0);
        assert_eq!(normalize_ordinate(10.0, 0.0, 10.0, 1023), 1023);
        assert_eq!(normalize_ordinate(5.0, 0.0, 10.0, 1023), 512);
        // clamping
        assert_eq!(normalize_ordinate(-3.0, 0.0, 10.0, 1023), 0);
        assert_eq!(normalize_ordinate(99.0, 0.0, 10.0, 1023), 1023);
        // degenerate dimension
        assert_eq!(normalize_ordinate(7.0, 7.0, 7.0, 1023), 0);
    }

    #[test]
    fn test_write_read_round_trip_narrow_positions() {
        let idx = test_index(table(&[(17, 0), (35, 8), (56, 16)]));
        let mut buf = Vec::new();
        idx.write_to(&mut buf).unwrap();
        let back =
            SpatialIndex::read_from(&mut Cursor::new(&buf), LineCodec, |_r: &String| {
                vec![0.0, 0.0, 0.0]
            })
            .unwrap();
        assert_eq!(back.count(), 3);
        assert_eq!(back.curve().bits(), 2);
        assert_eq!(back.curve().dimensions(), 3);
        assert_eq!(back.mins(), &[4.0, 2.0, 100.0]);
        assert_eq!(back.maxes(), &[10.0, 7.0, 600.0]);
        let entries: Vec<(u64, u64)> = back.positions().collect();
        assert_eq!(entries, vec![(17, 0), (35, 8), (56, 16)]);
    }

    #[test]
    fn test_write_read_round_trip_wide_positions() {
        let big = i32::MAX as u64 + 100;
        let idx = test_index(table(&[(17, 0), (35, big)]));
        let mut buf = Vec::new();
        idx.write_to(&mut buf).unwrap();
        let back =
            SpatialIndex::read_from(&mut Cursor::new(&buf), LineCodec, |_r: &String| {
                vec![0.0, 0.0, 0.0]
            })
            .unwrap();
        let entries: Vec<(u64, u64)> = back.positions().collect();
        assert_eq!(entries, vec![(17, 0), (35, big)]);
    }

    #[test]
    fn test_read_rejects_unknown_version() {
        let idx = test_index(table(&[(17, 0)]));
        let mut buf = Vec::new();
        idx.write_to(&mut buf).unwrap();
        buf[0] = 0;
        buf[1] = 9;
        assert!(matches!(
            SpatialIndex::read_from(&mut Cursor::new(&buf), LineCodec, |_r: &String| vec![]),
            Err(IndexError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_read_rejects_truncated_data() {
        let idx = test_index(table(&[(17, 0), (35, 8)]));
        let mut buf = Vec::new();
        idx.write_to(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(matches!(
            SpatialIndex::read_from(&mut Cursor::new(&buf), LineCodec, |_r: &String| vec![]),
            Err(IndexError::Truncated(_))
        ));
    }

    #[test]
    fn test_read_rejects_non_monotonic_table() {
        let idx = test_index(table(&[(17, 0), (35, 8)]));
        let mut buf = Vec::new();
        idx.write_to(&mut buf).unwrap();
        // overwrite the second entry's curve index (17 < 35) in place
        let entry_start = buf.len() - 8;
        buf[entry_start..entry_start + 4].copy_from_slice(&17i32.to_be_bytes());
        assert!(matches!(
            SpatialIndex::read_from(&mut Cursor::new(&buf), LineCodec, |_r: &String| vec![]),
            Err(IndexError::Corrupt(_))
        ));
    }
}
