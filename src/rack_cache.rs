//! Rack/shelf state cache with write-through reservations.
//!
//! A reservation is persisted as `occupied = false, contents = job`, so it
//! survives invalidation: a refresh reads it back from the repository.

use ottoflow_shared::ErrorKind;
use ottoflow_shared::model::{JobId, RackId, Shelf, ShelfId};
use ottoflow_shared::repository::{RackRepository, RepositoryError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    #[error("no shelf available in rack {0}")]
    ShelfUnavailable(RackId),
    #[error("shelf {shelf_id} in rack {rack_id} is already taken")]
    ShelfTaken { rack_id: RackId, shelf_id: ShelfId },
    #[error("shelf {shelf_id} not found in rack {rack_id}")]
    UnknownShelf { rack_id: RackId, shelf_id: ShelfId },
    #[error("cached state of shelf {shelf_id} in rack {rack_id} does not match job {job_id}")]
    Stale { rack_id: RackId, shelf_id: ShelfId, job_id: JobId },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::ShelfUnavailable(_)
            | CacheError::ShelfTaken { .. }
            | CacheError::UnknownShelf { .. } => ErrorKind::ShelfUnavailable,
            CacheError::Stale { .. } => ErrorKind::StaleCache,
            CacheError::Repository(e) => e.kind(),
        }
    }
}

/// What a job needs from a shelf.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShelfCriteria {
    pub min_clearance_mm: Option<f64>,
    /// Only this shelf will do.
    pub shelf_id: Option<ShelfId>,
}

impl ShelfCriteria {
    fn accepts(&self, shelf: &Shelf) -> bool {
        if let Some(wanted) = self.shelf_id {
            if shelf.id != wanted {
                return false;
            }
        }
        match (self.min_clearance_mm, shelf.clearance_mm) {
            (Some(needed), Some(clearance)) => clearance >= needed,
            _ => true,
        }
    }
}

struct CacheEntry {
    shelves: Vec<Shelf>,
    fetched_at: Instant,
    stale: bool,
}

impl CacheEntry {
    fn new(mut shelves: Vec<Shelf>) -> Self {
        shelves.sort_by_key(|s| s.number);
        Self { shelves, fetched_at: Instant::now(), stale: false }
    }

    fn shelf_mut(&mut self, shelf_id: ShelfId) -> Option<&mut Shelf> {
        self.shelves.iter_mut().find(|s| s.id == shelf_id)
    }
}

pub struct RackCache {
    repo: Arc<dyn RackRepository>,
    ttl: Duration,
    entries: Mutex<HashMap<RackId, CacheEntry>>,
}

impl RackCache {
    pub fn new(repo: Arc<dyn RackRepository>, ttl: Duration) -> Self {
        Self { repo, ttl, entries: Mutex::new(HashMap::new()) }
    }

    async fn load<'a>(
        &self,
        entries: &'a mut HashMap<RackId, CacheEntry>,
        rack_id: RackId,
    ) -> Result<&'a mut CacheEntry, CacheError> {
        let refresh = match entries.get(&rack_id) {
            Some(entry) => entry.stale || entry.fetched_at.elapsed() >= self.ttl,
            None => true,
        };
        if refresh {
            let shelves = self.repo.get_shelves(rack_id).await?;
            tracing::debug!(rack_id, shelves = shelves.len(), "rack cache refreshed");
            entries.insert(rack_id, CacheEntry::new(shelves));
        }
        entries.get_mut(&rack_id).ok_or(CacheError::ShelfUnavailable(rack_id))
    }

    /// Current view of a rack's shelves, ordered by shelf number.
    pub async fn shelves(&self, rack_id: RackId) -> Result<Vec<Shelf>, CacheError> {
        let mut entries = self.entries.lock().await;
        Ok(self.load(&mut entries, rack_id).await?.shelves.clone())
    }

    /// Lowest-numbered empty, unreserved shelf matching `criteria`. Does not reserve.
    pub async fn get_available_shelf(&self, rack_id: RackId, criteria: &ShelfCriteria) -> Result<Shelf, CacheError> {
        let mut entries = self.entries.lock().await;
        let entry = self.load(&mut entries, rack_id).await?;
        entry
            .shelves
            .iter()
            .find(|s| s.is_empty() && criteria.accepts(s))
            .cloned()
            .ok_or(CacheError::ShelfUnavailable(rack_id))
    }

    /// Claims a specific shelf for a job. Re-reserving for the same job is a no-op.
    pub async fn reserve(&self, rack_id: RackId, shelf_id: ShelfId, job_id: JobId) -> Result<Shelf, CacheError> {
        let mut entries = self.entries.lock().await;
        let entry = self.load(&mut entries, rack_id).await?;
        let shelf = entry
            .shelf_mut(shelf_id)
            .ok_or(CacheError::UnknownShelf { rack_id, shelf_id })?;
        if shelf.is_reserved_for(job_id) {
            return Ok(shelf.clone());
        }
        if !shelf.is_empty() {
            return Err(CacheError::ShelfTaken { rack_id, shelf_id });
        }
        self.write_through(entry, rack_id, shelf_id, false, Some(job_id)).await
    }

    /// Picks and claims a shelf in one step, so two jobs never see the same
    /// shelf as free.
    pub async fn reserve_available(
        &self,
        rack_id: RackId,
        criteria: &ShelfCriteria,
        job_id: JobId,
    ) -> Result<Shelf, CacheError> {
        let mut entries = self.entries.lock().await;
        let entry = self.load(&mut entries, rack_id).await?;
        if let Some(existing) = entry.shelves.iter().find(|s| s.is_reserved_for(job_id)) {
            return Ok(existing.clone());
        }
        let shelf_id = entry
            .shelves
            .iter()
            .find(|s| s.is_empty() && criteria.accepts(s))
            .map(|s| s.id)
            .ok_or(CacheError::ShelfUnavailable(rack_id))?;
        self.write_through(entry, rack_id, shelf_id, false, Some(job_id)).await
    }

    /// EMPTY -> OCCUPIED after the part is on the shelf.
    pub async fn confirm_occupied(&self, rack_id: RackId, shelf_id: ShelfId, job_id: JobId) -> Result<Shelf, CacheError> {
        let mut entries = self.entries.lock().await;
        let entry = self.load(&mut entries, rack_id).await?;
        let shelf = entry
            .shelf_mut(shelf_id)
            .ok_or(CacheError::UnknownShelf { rack_id, shelf_id })?;
        if shelf.occupied && shelf.contents == Some(job_id) {
            return Ok(shelf.clone());
        }
        if !shelf.is_reserved_for(job_id) {
            entry.stale = true;
            return Err(CacheError::Stale { rack_id, shelf_id, job_id });
        }
        self.write_through(entry, rack_id, shelf_id, true, Some(job_id)).await
    }

    /// Drops a reservation after a workflow ended without storing anything.
    /// A shelf no longer reserved for `job_id` is left alone.
    pub async fn release(&self, rack_id: RackId, shelf_id: ShelfId, job_id: JobId) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        let entry = self.load(&mut entries, rack_id).await?;
        let reserved = entry.shelf_mut(shelf_id).is_some_and(|s| s.is_reserved_for(job_id));
        if !reserved {
            tracing::debug!(rack_id, shelf_id, job_id, "no reservation to release");
            return Ok(());
        }
        self.write_through(entry, rack_id, shelf_id, false, None).await.map(|_| ())
    }

    /// Operator pickup: OCCUPIED -> EMPTY. A shelf reserved for a running
    /// workflow is refused; an empty one is returned unchanged.
    pub async fn reset_shelf(&self, rack_id: RackId, shelf_id: ShelfId) -> Result<Shelf, CacheError> {
        let mut entries = self.entries.lock().await;
        let entry = self.load(&mut entries, rack_id).await?;
        let shelf = entry
            .shelf_mut(shelf_id)
            .ok_or(CacheError::UnknownShelf { rack_id, shelf_id })?;
        if !shelf.occupied {
            if shelf.contents.is_some() {
                return Err(CacheError::ShelfTaken { rack_id, shelf_id });
            }
            return Ok(shelf.clone());
        }
        self.write_through(entry, rack_id, shelf_id, false, None).await
    }

    pub async fn invalidate(&self, rack_id: RackId) {
        self.entries.lock().await.remove(&rack_id);
    }

    pub async fn invalidate_all(&self) {
        let mut entries = self.entries.lock().await;
        let dropped = entries.len();
        entries.clear();
        tracing::info!(dropped, "rack cache invalidated");
    }

    /// Clears reservations held for jobs that are no longer running, such as
    /// those left behind by a previous process. Returns how many were released.
    pub async fn release_orphaned(&self, live_jobs: &HashSet<JobId>) -> Result<usize, CacheError> {
        let racks = self.repo.list_racks().await?;
        let mut released = 0;
        let mut entries = self.entries.lock().await;
        for rack in racks {
            let entry = self.load(&mut entries, rack.id).await?;
            let orphaned: Vec<(ShelfId, JobId)> = entry
                .shelves
                .iter()
                .filter(|s| !s.occupied)
                .filter_map(|s| s.contents.map(|job| (s.id, job)))
                .filter(|(_, job)| !live_jobs.contains(job))
                .collect();
            for (shelf_id, job_id) in orphaned {
                tracing::warn!(rack_id = rack.id, shelf_id, job_id, "releasing orphaned shelf reservation");
                self.write_through(entry, rack.id, shelf_id, false, None).await?;
                released += 1;
            }
        }
        Ok(released)
    }

    /// Applies a shelf change in memory, then persists it. On a failed write the
    /// in-memory change is rolled back and the rack is marked stale.
    async fn write_through(
        &self,
        entry: &mut CacheEntry,
        rack_id: RackId,
        shelf_id: ShelfId,
        occupied: bool,
        contents: Option<JobId>,
    ) -> Result<Shelf, CacheError> {
        let Some(shelf) = entry.shelf_mut(shelf_id) else {
            return Err(CacheError::UnknownShelf { rack_id, shelf_id });
        };
        let previous = shelf.clone();
        shelf.occupied = occupied;
        shelf.contents = contents;
        match self.repo.set_shelf(rack_id, shelf_id, occupied, contents).await {
            Ok(persisted) => {
                if let Some(shelf) = entry.shelf_mut(shelf_id) {
                    *shelf = persisted.clone();
                }
                Ok(persisted)
            }
            Err(e) => {
                tracing::warn!(rack_id, shelf_id, "shelf write failed, rolling back: {}", e);
                if let Some(shelf) = entry.shelf_mut(shelf_id) {
                    *shelf = previous;
                }
                entry.stale = true;
                Err(e.into())
            }
        }
    }
}
