//! Streaming search over the sorted data file: positioned range reads from a
//! local file or an HTTP server, record filtering with early termination, and
//! optional bounded-concurrency fan-out across byte regions.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver};
use log::debug;

use crate::bounds::Bounds;
use crate::codec::RecordCodec;
use crate::errors::IndexResult;
use crate::index::{PositionRange, SpatialIndex};
use crate::stats::{CountingReader, StatsAccumulator, WithStats};

/// Tuning for one search.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Cap on curve ranges before position lookup; 0 means exact coverage.
    /// Lowering it trades extra bytes scanned for fewer reads, which matters
    /// most against high-latency remote sources.
    pub max_ranges: usize,
    /// Worker threads for the concurrent searches. Ignored by the sequential
    /// ones.
    pub concurrency: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            max_ranges: 0,
            concurrency: 1,
        }
    }
}

/// Supplies positioned readers over the sorted data file.
///
/// `end` is exclusive; `None` reads to the end of the data. Each call opens
/// an independent reader, so ranges can be scanned concurrently.
pub trait RangeSource {
    fn open(&self, start: u64, end: Option<u64>) -> IndexResult<Box<dyn Read + Send>>;
}

/// Byte ranges of a local file, via seek and a length-limited reader.
#[derive(Debug, Clone)]
pub struct FileRangeSource {
    path: PathBuf,
}

impl FileRangeSource {
    pub fn new<P: AsRef<Path>>(path: P) -> FileRangeSource {
        FileRangeSource {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl RangeSource for FileRangeSource {
    fn open(&self, start: u64, end: Option<u64>) -> IndexResult<Box<dyn Read + Send>> {
        if let Some(end) = end {
            if end <= start {
                return Ok(Box::new(io::empty()));
            }
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        match end {
            Some(end) => Ok(Box::new(file.take(end - start))),
            None => Ok(Box::new(file)),
        }
    }
}

/// Byte ranges of a remote file, via HTTP `Range` requests.
///
/// Servers that ignore the header and reply `200 OK` with the full body are
/// tolerated: the unwanted prefix is read and discarded and the body is
/// truncated at the range end, so results are identical either way, just
/// slower.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpRangeSource {
    url: String,
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http")]
impl HttpRangeSource {
    pub fn new<S: Into<String>>(url: S) -> HttpRangeSource {
        HttpRangeSource {
            url: url.into(),
            client: reqwest::blocking::Client::new(),
        }
    }

    pub fn with_client<S: Into<String>>(
        url: S,
        client: reqwest::blocking::Client,
    ) -> HttpRangeSource {
        HttpRangeSource {
            url: url.into(),
            client,
        }
    }
}

/// `Range` header value for `[start, end)`, which the header expresses with
/// an inclusive last byte.
#[cfg(feature = "http")]
fn range_header(start: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("bytes={}-{}", start, end - 1),
        None => format!("bytes={}-", start),
    }
}

#[cfg(feature = "http")]
impl RangeSource for HttpRangeSource {
    fn open(&self, start: u64, end: Option<u64>) -> IndexResult<Box<dyn Read + Send>> {
        if let Some(end) = end {
            if end <= start {
                return Ok(Box::new(io::empty()));
            }
        }
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, range_header(start, end))
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(http_err)?;
        if response.status() == reqwest::StatusCode::PARTIAL_CONTENT {
            return Ok(Box::new(response));
        }
        debug!("server ignored Range header, discarding {} byte prefix", start);
        let mut body: Box<dyn Read + Send> = Box::new(response);
        io::copy(&mut body.by_ref().take(start), &mut io::sink())?;
        match end {
            Some(end) => Ok(Box::new(body.take(end - start))),
            None => Ok(body),
        }
    }
}

#[cfg(feature = "http")]
pub(crate) fn http_err(e: reqwest::Error) -> crate::errors::IndexError {
    crate::errors::IndexError::Io(io::Error::new(io::ErrorKind::Other, e))
}

/// Scan state for one byte region: decodes records, stops early once curve
/// indexes pass the region's maximum, and applies the exact bounds filter.
///
/// The reader is held in an `Option` and taken on close, so whether a scan
/// finishes, fails or is dropped mid-way, the underlying handle is released
/// exactly once.
struct RangeScan<'a, C: RecordCodec, P> {
    index: &'a SpatialIndex<C, P>,
    bounds: Bounds,
    max_curve_index: u64,
    reader: Option<io::BufReader<Box<dyn Read + Send>>>,
    stats: Option<Arc<StatsAccumulator>>,
}

fn open_scan<'a, C, P, S>(
    index: &'a SpatialIndex<C, P>,
    bounds: Bounds,
    range: &PositionRange,
    source: &S,
    stats: Option<Arc<StatsAccumulator>>,
) -> IndexResult<RangeScan<'a, C, P>>
where
    C: RecordCodec,
    P: Fn(&C::Record) -> Vec<f64>,
    S: RangeSource + ?Sized,
{
    let raw = source.open(range.floor_position(), range.ceiling_position())?;
    let boxed: Box<dyn Read + Send> = match &stats {
        Some(s) => Box::new(CountingReader::new(raw, Arc::clone(s))),
        None => raw,
    };
    Ok(RangeScan {
        index,
        bounds,
        max_curve_index: range.max_curve_index(),
        reader: Some(io::BufReader::new(boxed)),
        stats,
    })
}

impl<C, P> RangeScan<'_, C, P>
where
    C: RecordCodec,
    P: Fn(&C::Record) -> Vec<f64>,
{
    fn next_record(&mut self) -> Option<IndexResult<C::Record>> {
        loop {
            let reader = self.reader.as_mut()?;
            match self.index.codec().read_record(reader) {
                Err(e) => {
                    self.close();
                    return Some(Err(e));
                }
                Ok(None) => {
                    self.close();
                    return None;
                }
                Ok(Some(record)) => {
                    if let Some(s) = &self.stats {
                        s.record_read();
                    }
                    // records are sorted by curve index, so the first one
                    // past the region's maximum ends the scan
                    if self.index.curve_index_of(&record) > self.max_curve_index {
                        self.close();
                        return None;
                    }
                    if self.bounds.contains(&self.index.point_of(&record)) {
                        if let Some(s) = &self.stats {
                            s.record_found();
                        }
                        return Some(Ok(record));
                    }
                }
            }
        }
    }

    fn close(&mut self) {
        self.reader.take();
    }
}

/// Sequential search results, one byte region at a time.
///
/// The stream terminates on the first error; after an error or exhaustion it
/// keeps returning `None`.
pub struct SearchStream<'a, C: RecordCodec, P, S> {
    index: &'a SpatialIndex<C, P>,
    source: &'a S,
    bounds: Bounds,
    ranges: VecDeque<PositionRange>,
    current: Option<RangeScan<'a, C, P>>,
    stats: Option<Arc<StatsAccumulator>>,
    terminated: bool,
}

impl<C, P, S> Iterator for SearchStream<'_, C, P, S>
where
    C: RecordCodec,
    P: Fn(&C::Record) -> Vec<f64>,
    S: RangeSource,
{
    type Item = IndexResult<C::Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.terminated {
            return None;
        }
        loop {
            if self.current.is_none() {
                let range = match self.ranges.pop_front() {
                    Some(r) => r,
                    None => return None,
                };
                match open_scan(
                    self.index,
                    self.bounds.clone(),
                    &range,
                    self.source,
                    self.stats.clone(),
                ) {
                    Ok(scan) => self.current = Some(scan),
                    Err(e) => {
                        self.terminated = true;
                        return Some(Err(e));
                    }
                }
            }
            match self.current.as_mut().and_then(|s| s.next_record()) {
                Some(Ok(record)) => return Some(Ok(record)),
                Some(Err(e)) => {
                    self.terminated = true;
                    self.current = None;
                    return Some(Err(e));
                }
                None => self.current = None,
            }
        }
    }
}

/// Sequential search results with statistics attached: each match carries the
/// counters as of its emission, and a final item with no value carries the
/// totals. An error ends the stream without a totals item.
pub struct StatsSearchStream<'a, C: RecordCodec, P, S> {
    inner: SearchStream<'a, C, P, S>,
    stats: Arc<StatsAccumulator>,
    finished: bool,
}

impl<C, P, S> Iterator for StatsSearchStream<'_, C, P, S>
where
    C: RecordCodec,
    P: Fn(&C::Record) -> Vec<f64>,
    S: RangeSource,
{
    type Item = IndexResult<WithStats<C::Record>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.inner.next() {
            Some(Ok(record)) => Some(Ok(WithStats {
                value: Some(record),
                stats: self.stats.snapshot(),
            })),
            Some(Err(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            None => {
                self.finished = true;
                Some(Ok(WithStats {
                    value: None,
                    stats: self.stats.snapshot(),
                }))
            }
        }
    }
}

/// Results from a pool of worker threads scanning byte regions in parallel.
///
/// Regions are handed out over a channel, so workers stay busy regardless of
/// how unevenly sized the regions are. Dropping the stream cancels the
/// search: workers notice the closed result channel at their next send and
/// abandon their scans, which closes the underlying readers.
pub struct ConcurrentSearchStream<T> {
    rx: Option<Receiver<IndexResult<T>>>,
    workers: Vec<JoinHandle<()>>,
    terminated: bool,
}

impl<T> ConcurrentSearchStream<T> {
    fn shutdown(&mut self) {
        self.rx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<T> Iterator for ConcurrentSearchStream<T> {
    type Item = IndexResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.terminated {
            return None;
        }
        let rx = self.rx.as_ref()?;
        match rx.recv() {
            Ok(Ok(record)) => Some(Ok(record)),
            Ok(Err(e)) => {
                self.terminated = true;
                self.shutdown();
                Some(Err(e))
            }
            Err(_) => {
                self.terminated = true;
                self.shutdown();
                None
            }
        }
    }
}

impl<T> Drop for ConcurrentSearchStream<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Concurrent search results with statistics, ending with a totals item once
/// all workers have finished and flushed their counters.
pub struct ConcurrentStatsStream<T> {
    inner: ConcurrentSearchStream<T>,
    stats: Arc<StatsAccumulator>,
    finished: bool,
}

impl<T> Iterator for ConcurrentStatsStream<T> {
    type Item = IndexResult<WithStats<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.inner.next() {
            Some(Ok(record)) => Some(Ok(WithStats {
                value: Some(record),
                stats: self.stats.snapshot(),
            })),
            Some(Err(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            None => {
                self.finished = true;
                Some(Ok(WithStats {
                    value: None,
                    stats: self.stats.snapshot(),
                }))
            }
        }
    }
}

impl<C, P> SpatialIndex<C, P>
where
    C: RecordCodec,
    P: Fn(&C::Record) -> Vec<f64>,
{
    /// Streams the records inside `bounds`, scanning the resolved byte
    /// regions of `source` one after another.
    pub fn search<'a, S: RangeSource>(
        &'a self,
        bounds: &Bounds,
        source: &'a S,
        options: &SearchOptions,
    ) -> IndexResult<SearchStream<'a, C, P, S>> {
        let ranges = self.resolve(bounds, options.max_ranges)?;
        Ok(SearchStream {
            index: self,
            source,
            bounds: bounds.clone(),
            ranges: ranges.into(),
            current: None,
            stats: None,
            terminated: false,
        })
    }

    /// Like [`search`](Self::search), with counters attached to every result
    /// and a trailing totals item.
    pub fn search_with_stats<'a, S: RangeSource>(
        &'a self,
        bounds: &Bounds,
        source: &'a S,
        options: &SearchOptions,
    ) -> IndexResult<StatsSearchStream<'a, C, P, S>> {
        let ranges = self.resolve(bounds, options.max_ranges)?;
        let stats = StatsAccumulator::new();
        Ok(StatsSearchStream {
            inner: SearchStream {
                index: self,
                source,
                bounds: bounds.clone(),
                ranges: ranges.into(),
                current: None,
                stats: Some(Arc::clone(&stats)),
                terminated: false,
            },
            stats,
            finished: false,
        })
    }
}

impl<C, P> SpatialIndex<C, P>
where
    C: RecordCodec + Send + Sync + 'static,
    C::Record: Send + 'static,
    P: Fn(&C::Record) -> Vec<f64> + Send + Sync + 'static,
{
    /// Streams the records inside `bounds` using `options.concurrency` worker
    /// threads, one byte region per worker at a time. Result order is
    /// whatever the workers produce.
    pub fn search_concurrent<S>(
        self: Arc<Self>,
        bounds: &Bounds,
        source: Arc<S>,
        options: &SearchOptions,
    ) -> IndexResult<ConcurrentSearchStream<C::Record>>
    where
        S: RangeSource + Send + Sync + 'static,
    {
        let ranges = self.resolve(bounds, options.max_ranges)?;
        Ok(spawn_workers(
            self,
            source,
            bounds.clone(),
            ranges,
            options.concurrency,
            None,
        ))
    }

    /// Concurrent search with shared counters and a trailing totals item.
    pub fn search_concurrent_with_stats<S>(
        self: Arc<Self>,
        bounds: &Bounds,
        source: Arc<S>,
        options: &SearchOptions,
    ) -> IndexResult<ConcurrentStatsStream<C::Record>>
    where
        S: RangeSource + Send + Sync + 'static,
    {
        let ranges = self.resolve(bounds, options.max_ranges)?;
        let stats = StatsAccumulator::new();
        let inner = spawn_workers(
            self,
            source,
            bounds.clone(),
            ranges,
            options.concurrency,
            Some(Arc::clone(&stats)),
        );
        Ok(ConcurrentStatsStream {
            inner,
            stats,
            finished: false,
        })
    }
}

fn spawn_workers<C, P, S>(
    index: Arc<SpatialIndex<C, P>>,
    source: Arc<S>,
    bounds: Bounds,
    ranges: Vec<PositionRange>,
    concurrency: usize,
    stats: Option<Arc<StatsAccumulator>>,
) -> ConcurrentSearchStream<C::Record>
where
    C: RecordCodec + Send + Sync + 'static,
    C::Record: Send + 'static,
    P: Fn(&C::Record) -> Vec<f64> + Send + Sync + 'static,
    S: RangeSource + Send + Sync + 'static,
{
    let (range_tx, range_rx) = unbounded::<PositionRange>();
    debug!(
        "spawning {} workers for {} byte regions",
        concurrency.max(1),
        ranges.len()
    );
    for range in ranges {
        // receiver is alive, this cannot fail
        let _ = range_tx.send(range);
    }
    drop(range_tx);
    let (result_tx, result_rx) = bounded(1024);
    let mut workers = Vec::new();
    for _ in 0..concurrency.max(1) {
        let range_rx = range_rx.clone();
        let result_tx = result_tx.clone();
        let index = Arc::clone(&index);
        let source = Arc::clone(&source);
        let bounds = bounds.clone();
        let stats = stats.clone();
        workers.push(thread::spawn(move || {
            while let Ok(range) = range_rx.recv() {
                let mut scan = match open_scan(
                    index.as_ref(),
                    bounds.clone(),
                    &range,
                    source.as_ref(),
                    stats.clone(),
                ) {
                    Ok(scan) => scan,
                    Err(e) => {
                        let _ = result_tx.send(Err(e));
                        return;
                    }
                };
                while let Some(item) = scan.next_record() {
                    let was_error = item.is_err();
                    if result_tx.send(item).is_err() {
                        // consumer dropped the stream; abandoning the scan
                        // closes its reader
                        return;
                    }
                    if was_error {
                        return;
                    }
                }
            }
        }));
    }
    drop(result_tx);
    ConcurrentSearchStream {
        rx: Some(result_rx),
        workers,
        terminated: false,
    }
}
