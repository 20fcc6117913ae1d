//! Chunk descriptor store
//!
//! Descriptors are filled one table run at a time and cached per run with
//! LRU eviction. Table sections are discovered lazily, segment by segment,
//! only as far as the requested chunk index needs. Anything the cache drops
//! is re-derived from the segment file on the next access; descriptors that
//! did not come from the stored table (chunk scan corrections, `set`) live in a
//! separate map that is never evicted.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, trace, warn};

use crate::config::ChunkTableConfig;
use crate::error::{ChunkTableError, Result};

use super::codec::FormatVersion;
use super::descriptor::{ChunkDescriptor, ChunkFlags};
use super::reconstruct::{self, correct_v1, fill_v1, fill_v2, TableState};
use super::types::{IoValues, SegmentSource, TableSection};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Table runs
// =============================================================================

/// One table section and the chunk indices it covers
struct TableRun {
    id: usize,
    section: TableSection,
    first_chunk: u64,
    state: Mutex<TableState>,
    /// Held while the run is being filled, so concurrent misses wait for one fill
    fill_lock: Mutex<()>,
}

impl TableRun {
    fn end_chunk(&self) -> u64 {
        self.first_chunk.saturating_add(self.section.number_of_entries as u64)
    }

    fn contains(&self, chunk_index: u64) -> bool {
        chunk_index >= self.first_chunk && chunk_index < self.end_chunk()
    }

    fn duplicate(&self) -> Self {
        Self {
            id: self.id,
            section: self.section.clone(),
            first_chunk: self.first_chunk,
            state: Mutex::new(*lock(&self.state)),
            fill_lock: Mutex::new(()),
        }
    }
}

#[derive(Default)]
struct RunIndex {
    /// Sorted by first chunk, non-overlapping
    runs: Vec<Arc<TableRun>>,
    segments_loaded: usize,
    next_chunk: u64,
}

impl RunIndex {
    fn covering(&self, chunk_index: u64) -> Option<&Arc<TableRun>> {
        let i = self.runs.partition_point(|run| run.first_chunk <= chunk_index);
        i.checked_sub(1)
            .map(|i| &self.runs[i])
            .filter(|run| run.contains(chunk_index))
    }
}

// =============================================================================
// Cache
// =============================================================================

struct CachedRun {
    descriptors: Arc<Vec<ChunkDescriptor>>,
    last_used: AtomicU64,
}

#[derive(Default)]
struct RunCache {
    entries: HashMap<usize, CachedRun>,
    /// Descriptors held across all entries
    total: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct FillProgress {
    previous_last_chunk_filled: Option<u64>,
    last_chunk_filled: Option<u64>,
    last_chunk_compared: Option<u64>,
}

impl FillProgress {
    fn advance_filled(&mut self, chunk_index: u64) {
        if self.last_chunk_filled.map_or(true, |last| chunk_index > last) {
            self.previous_last_chunk_filled = self.last_chunk_filled;
            self.last_chunk_filled = Some(chunk_index);
        }
    }

    fn advance_compared(&mut self, chunk_index: u64) {
        let bounded = self.last_chunk_filled.map(|filled| filled.min(chunk_index));
        if bounded > self.last_chunk_compared {
            self.last_chunk_compared = bounded;
        }
    }
}

// =============================================================================
// Descriptor Store
// =============================================================================

pub struct DescriptorStore {
    chunk_size: u32,
    format_version: FormatVersion,
    max_cached: usize,
    verify_tainted: bool,
    runs: RwLock<RunIndex>,
    cache: RwLock<RunCache>,
    installed: RwLock<BTreeMap<u64, ChunkDescriptor>>,
    progress: Mutex<FillProgress>,
    tick: AtomicU64,
}

impl DescriptorStore {
    pub fn new(io: IoValues, config: &ChunkTableConfig) -> Self {
        Self {
            chunk_size: io.chunk_size,
            format_version: io.format_version,
            max_cached: config.max_cached_descriptors,
            verify_tainted: config.verify_tainted_tables,
            runs: RwLock::new(RunIndex::default()),
            cache: RwLock::new(RunCache::default()),
            installed: RwLock::new(BTreeMap::new()),
            progress: Mutex::new(FillProgress::default()),
            tick: AtomicU64::new(0),
        }
    }

    /// Descriptor for a chunk, filling its table run on a cache miss
    pub fn get(&self, chunk_index: u64, source: &dyn SegmentSource) -> Result<ChunkDescriptor> {
        if let Some(descriptor) = read(&self.installed).get(&chunk_index) {
            return Ok(*descriptor);
        }

        let run = self.find_run(chunk_index, source)?;
        let descriptors = self.descriptors_for(&run, source)?;
        descriptors
            .get((chunk_index - run.first_chunk) as usize)
            .copied()
            .ok_or(ChunkTableError::ChunkIndexNotFound(chunk_index))
    }

    /// Install a descriptor, overriding whatever the stored table says
    pub fn set(&self, chunk_index: u64, descriptor: ChunkDescriptor) {
        write(&self.installed).insert(chunk_index, descriptor);
        lock(&self.progress).advance_filled(chunk_index);
    }

    /// Whether a table entry exists for the chunk; never reads entry data
    pub fn exists(&self, chunk_index: u64, source: &dyn SegmentSource) -> Result<bool> {
        if read(&self.installed).contains_key(&chunk_index) {
            return Ok(true);
        }
        match self.find_run(chunk_index, source) {
            Ok(_) => Ok(true),
            Err(ChunkTableError::ChunkIndexNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Trust state of the table section covering a chunk
    pub fn table_state(&self, chunk_index: u64, source: &dyn SegmentSource) -> Result<TableState> {
        let run = self.find_run(chunk_index, source)?;
        let state = *lock(&run.state);
        Ok(state)
    }

    /// Raw table entries for a chunk range, built from current descriptors
    pub fn generate_table_entries_data(
        &self,
        chunk_indices: Range<u64>,
        format_version: FormatVersion,
        base_offset: i64,
        source: &dyn SegmentSource,
    ) -> Result<Vec<u8>> {
        let descriptors = chunk_indices
            .map(|chunk_index| self.get(chunk_index, source))
            .collect::<Result<Vec<_>>>()?;
        reconstruct::generate_table_entries_data(&descriptors, format_version, base_offset)
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn format_version(&self) -> FormatVersion {
        self.format_version
    }

    pub fn last_chunk_filled(&self) -> Option<u64> {
        lock(&self.progress).last_chunk_filled
    }

    pub fn previous_last_chunk_filled(&self) -> Option<u64> {
        lock(&self.progress).previous_last_chunk_filled
    }

    pub fn last_chunk_compared(&self) -> Option<u64> {
        lock(&self.progress).last_chunk_compared
    }

    /// Descriptors currently held by the cache
    pub fn cached_descriptors(&self) -> usize {
        read(&self.cache).total
    }

    /// Independent store for another read session
    ///
    /// Section states, installed descriptors and counters are copied; the
    /// cache starts empty.
    pub fn clone_for_session(&self) -> Self {
        let index = read(&self.runs);
        let runs = RunIndex {
            runs: index.runs.iter().map(|run| Arc::new(run.duplicate())).collect(),
            segments_loaded: index.segments_loaded,
            next_chunk: index.next_chunk,
        };

        Self {
            chunk_size: self.chunk_size,
            format_version: self.format_version,
            max_cached: self.max_cached,
            verify_tainted: self.verify_tainted,
            runs: RwLock::new(runs),
            cache: RwLock::new(RunCache::default()),
            installed: RwLock::new(read(&self.installed).clone()),
            progress: Mutex::new(*lock(&self.progress)),
            tick: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Run index
    // -------------------------------------------------------------------------

    fn find_run(&self, chunk_index: u64, source: &dyn SegmentSource) -> Result<Arc<TableRun>> {
        loop {
            let segment = {
                let index = read(&self.runs);
                if let Some(run) = index.covering(chunk_index) {
                    return Ok(Arc::clone(run));
                }
                if chunk_index < index.next_chunk || index.segments_loaded >= source.number_of_segments() {
                    return Err(ChunkTableError::ChunkIndexNotFound(chunk_index));
                }
                index.segments_loaded
            };
            self.load_segment(segment, source)?;
        }
    }

    fn load_segment(&self, segment: usize, source: &dyn SegmentSource) -> Result<()> {
        let mut index = write(&self.runs);
        if index.segments_loaded != segment {
            // Another reader got here first
            return Ok(());
        }

        // Nothing is committed until every section of the segment is accepted
        let sections = source.table_sections(segment)?;
        let mut staged = Vec::with_capacity(sections.len());
        let mut next_chunk = index.next_chunk;
        for section in sections {
            if section.number_of_entries == 0 {
                continue;
            }
            if section.format_version != self.format_version {
                return Err(ChunkTableError::MalformedSection(format!(
                    "segment {} holds a {:?} table in a {:?} image",
                    segment, section.format_version, self.format_version
                )));
            }

            let first_chunk = section.first_chunk.unwrap_or(next_chunk);
            if first_chunk < next_chunk {
                warn!(
                    segment,
                    first_chunk,
                    next_chunk,
                    "Skipping table section overlapping an earlier one"
                );
                continue;
            }
            let Some(end_chunk) = first_chunk.checked_add(section.number_of_entries as u64) else {
                return Err(ChunkTableError::MalformedSection(format!(
                    "segment {} table at chunk {} with {} entries overflows the chunk index",
                    segment, first_chunk, section.number_of_entries
                )));
            };

            let run = TableRun {
                id: index.runs.len() + staged.len(),
                state: Mutex::new(TableState::initial(&section)),
                fill_lock: Mutex::new(()),
                first_chunk,
                section,
            };
            trace!(
                segment,
                first_chunk,
                entries = run.section.number_of_entries,
                tainted = run.section.tainted,
                "Table run"
            );
            next_chunk = end_chunk;
            staged.push(Arc::new(run));
        }

        index.runs.extend(staged);
        index.next_chunk = next_chunk;
        index.segments_loaded += 1;
        debug!(segment, runs = index.runs.len(), next_chunk = index.next_chunk, "Loaded table sections");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Fill
    // -------------------------------------------------------------------------

    fn descriptors_for(&self, run: &TableRun, source: &dyn SegmentSource) -> Result<Arc<Vec<ChunkDescriptor>>> {
        if let Some(descriptors) = self.cached(run.id) {
            return Ok(descriptors);
        }

        let _fill = lock(&run.fill_lock);
        if let Some(descriptors) = self.cached(run.id) {
            return Ok(descriptors);
        }

        let descriptors = Arc::new(self.fill_run(run, source)?);
        self.cache_insert(run.id, &descriptors);
        Ok(descriptors)
    }

    fn fill_run(&self, run: &TableRun, source: &dyn SegmentSource) -> Result<Vec<ChunkDescriptor>> {
        let section = &run.section;
        let entries = source.read_at(section.pool_entry, section.entries_offset, section.entries_size())?;
        let last_chunk = run.end_chunk() - 1;

        let descriptors = match section.format_version {
            FormatVersion::V2 => fill_v2(section, run.first_chunk, &entries, self.chunk_size)?,
            FormatVersion::V1 if !section.tainted => {
                fill_v1(section, run.first_chunk, &entries, self.chunk_size, false)?
            }
            FormatVersion::V1 => return self.fill_tainted(run, &entries, source),
        };
        lock(&self.progress).advance_filled(last_chunk);
        Ok(descriptors)
    }

    fn fill_tainted(&self, run: &TableRun, entries: &[u8], source: &dyn SegmentSource) -> Result<Vec<ChunkDescriptor>> {
        let section = &run.section;
        let mut descriptors = fill_v1(section, run.first_chunk, entries, self.chunk_size, true)?;
        let last_chunk = run.end_chunk() - 1;
        lock(&self.progress).advance_filled(last_chunk);

        if !self.verify_tainted {
            return Ok(descriptors);
        }

        let mut state = lock(&run.state);
        if !state.begin_verification() {
            // Already scanned: corrections are installed, the rest held up
            for descriptor in descriptors.iter_mut() {
                descriptor.flags -= ChunkFlags::PROVISIONAL;
            }
            return Ok(descriptors);
        }

        match correct_v1(section, run.first_chunk, entries, self.chunk_size, source, &mut descriptors) {
            Ok(outcome) => {
                for (chunk_index, descriptor) in (run.first_chunk..).zip(&descriptors) {
                    if descriptor.is_corrected() {
                        self.set(chunk_index, *descriptor);
                    }
                }
                lock(&self.progress).advance_compared(last_chunk);
                state.complete(&outcome);
                debug!(
                    segment = section.segment_file_id,
                    first_chunk = run.first_chunk,
                    state = ?*state,
                    "Tainted table scanned"
                );
                Ok(descriptors)
            }
            Err(e) => {
                state.abort();
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Cache
    // -------------------------------------------------------------------------

    fn cached(&self, run_id: usize) -> Option<Arc<Vec<ChunkDescriptor>>> {
        let cache = read(&self.cache);
        cache.entries.get(&run_id).map(|entry| {
            entry.last_used.store(self.tick.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
            Arc::clone(&entry.descriptors)
        })
    }

    fn cache_insert(&self, run_id: usize, descriptors: &Arc<Vec<ChunkDescriptor>>) {
        let len = descriptors.len();
        if len > self.max_cached {
            trace!(run = run_id, len, "Table run larger than cache, not cached");
            return;
        }

        let mut cache = write(&self.cache);
        if let Some(previous) = cache.entries.remove(&run_id) {
            cache.total -= previous.descriptors.len();
        }

        while cache.total + len > self.max_cached {
            let oldest = cache
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
                .map(|(&id, _)| id);
            let Some(oldest) = oldest else { break };
            if let Some(evicted) = cache.entries.remove(&oldest) {
                cache.total -= evicted.descriptors.len();
                trace!(run = oldest, "Evicted table run");
            }
        }

        cache.entries.insert(
            run_id,
            CachedRun {
                descriptors: Arc::clone(descriptors),
                last_used: AtomicU64::new(self.tick.fetch_add(1, Ordering::Relaxed)),
            },
        );
        cache.total += len;
    }
}
