//! Search statistics: per-range byte counts, latency to first byte and
//! record hit ratios, accumulated across however many threads serve a query.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A point-in-time copy of the counters for one search.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    /// Records decoded from the data file, matching or not.
    pub records_read: u64,
    /// Records that passed the exact bounds filter.
    pub records_found: u64,
    /// Byte ranges opened against the data source.
    pub ranges_read: u64,
    /// Data-file bytes read across all ranges.
    pub bytes_read: u64,
    /// Sum of per-range latencies from open to first byte.
    pub time_to_first_byte: Duration,
    /// Wall-clock time since the search started.
    pub elapsed: Duration,
}

impl StatsSnapshot {
    /// Fraction of decoded records that matched, or `None` before any record
    /// has been read.
    pub fn hit_ratio(&self) -> Option<f64> {
        if self.records_read == 0 {
            None
        } else {
            Some(self.records_found as f64 / self.records_read as f64)
        }
    }

    /// Mean time to first byte across ranges, or `None` before any range has
    /// been opened.
    pub fn mean_time_to_first_byte(&self) -> Option<Duration> {
        if self.ranges_read == 0 {
            None
        } else {
            Some(self.time_to_first_byte / self.ranges_read as u32)
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    records_read: u64,
    records_found: u64,
    ranges_read: u64,
    bytes_read: u64,
    time_to_first_byte: Duration,
}

/// Shared counter set for one search, updated from the reading side and
/// snapshotted from the consuming side.
#[derive(Debug)]
pub struct StatsAccumulator {
    started: Instant,
    inner: Mutex<Counters>,
}

impl StatsAccumulator {
    pub fn new() -> Arc<StatsAccumulator> {
        Arc::new(StatsAccumulator {
            started: Instant::now(),
            inner: Mutex::new(Counters::default()),
        })
    }

    pub fn record_read(&self) {
        self.inner.lock().records_read += 1;
    }

    pub fn record_found(&self) {
        self.inner.lock().records_found += 1;
    }

    /// Folds in one finished range: its byte count and, if any byte arrived,
    /// its latency to the first one.
    pub fn range_read(&self, bytes: u64, time_to_first_byte: Option<Duration>) {
        let mut c = self.inner.lock();
        c.ranges_read += 1;
        c.bytes_read += bytes;
        if let Some(ttfb) = time_to_first_byte {
            c.time_to_first_byte += ttfb;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = self.inner.lock();
        StatsSnapshot {
            records_read: c.records_read,
            records_found: c.records_found,
            ranges_read: c.ranges_read,
            bytes_read: c.bytes_read,
            time_to_first_byte: c.time_to_first_byte,
            elapsed: self.started.elapsed(),
        }
    }
}

/// A search result paired with the statistics as of its emission.
///
/// Streams that report statistics yield one `WithStats` per matching record
/// with `value` set, then a final item with `value == None` carrying the
/// totals for the whole search.
#[derive(Debug, Clone)]
pub struct WithStats<T> {
    pub value: Option<T>,
    pub stats: StatsSnapshot,
}

/// Wraps a range reader, counting bytes and the latency to the first byte,
/// and folds both into the accumulator when the reader is dropped.
///
/// Dropping is the only flush point, so the counts land exactly once whether
/// the range was read to the end, abandoned early or cancelled.
pub struct CountingReader<R> {
    inner: R,
    stats: Arc<StatsAccumulator>,
    opened: Instant,
    bytes: u64,
    first_byte: Option<Duration>,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R, stats: Arc<StatsAccumulator>) -> CountingReader<R> {
        CountingReader {
            inner,
            stats,
            opened: Instant::now(),
            bytes: 0,
            first_byte: None,
        }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 && self.first_byte.is_none() {
            self.first_byte = Some(self.opened.elapsed());
        }
        self.bytes += n as u64;
        Ok(n)
    }
}

impl<R> Drop for CountingReader<R> {
    fn drop(&mut self) {
        self.stats.range_read(self.bytes, self.first_byte);
    }
}
