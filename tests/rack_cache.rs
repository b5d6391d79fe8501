//! Shelf reservation and cache coherence against the in-memory store.

mod common;

use common::shelves;
use ottoflow::rack_cache::{CacheError, RackCache, ShelfCriteria};
use ottoflow::repository::InMemoryStore;
use ottoflow::shared::model::{RackRecord, Shelf};
use ottoflow::shared::ErrorKind;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn setup(shelf_count: u32) -> (Arc<InMemoryStore>, RackCache) {
    let store = Arc::new(InMemoryStore::new());
    store.add_rack(RackRecord { id: 1, name: "rack".to_string(), ottoeject_id: Some(1) }, shelves(1, shelf_count));
    let cache = RackCache::new(store.clone(), Duration::from_secs(60));
    (store, cache)
}

#[tokio::test]
async fn lowest_free_shelf_is_offered_without_reserving() {
    let (_store, cache) = setup(3);
    let criteria = ShelfCriteria::default();
    assert_eq!(cache.get_available_shelf(1, &criteria).await.unwrap().number, 1);
    assert_eq!(cache.get_available_shelf(1, &criteria).await.unwrap().number, 1);
}

#[tokio::test]
async fn concurrent_reservations_get_distinct_shelves() {
    let (store, cache) = setup(2);
    let cache = Arc::new(cache);
    let criteria = ShelfCriteria::default();
    let (a, b, c) = tokio::join!(
        cache.reserve_available(1, &criteria, 100),
        cache.reserve_available(1, &criteria, 101),
        cache.reserve_available(1, &criteria, 102),
    );
    let mut taken = HashSet::new();
    let mut unavailable = 0;
    for result in [a, b, c] {
        match result {
            Ok(shelf) => assert!(taken.insert(shelf.id)),
            Err(e) => {
                assert_eq!(e, CacheError::ShelfUnavailable(1));
                unavailable += 1;
            }
        }
    }
    assert_eq!(taken.len(), 2);
    assert_eq!(unavailable, 1);
    assert!(store.shelf(1, 1).unwrap().contents.is_some());
    assert!(store.shelf(1, 2).unwrap().contents.is_some());
}

#[tokio::test]
async fn reserving_twice_for_the_same_job_is_a_no_op() {
    let (_store, cache) = setup(2);
    let first = cache.reserve(1, 2, 100).await.unwrap();
    let again = cache.reserve(1, 2, 100).await.unwrap();
    assert_eq!(first.id, again.id);
    let taken = cache.reserve(1, 2, 101).await.unwrap_err();
    assert_eq!(taken, CacheError::ShelfTaken { rack_id: 1, shelf_id: 2 });
    assert_eq!(taken.kind(), ErrorKind::ShelfUnavailable);
}

#[tokio::test]
async fn failed_write_rolls_back_and_refreshes() {
    let (store, cache) = setup(1);
    store.fail_next_shelf_writes(1);
    let err = cache.reserve(1, 1, 100).await.unwrap_err();
    assert!(matches!(err, CacheError::Repository(_)));

    // rolled back in memory and never persisted
    assert!(cache.shelves(1).await.unwrap()[0].is_empty());
    assert!(store.shelf(1, 1).unwrap().is_empty());
    cache.reserve(1, 1, 100).await.unwrap();
}

#[tokio::test]
async fn invalidation_picks_up_changes_made_elsewhere() {
    let (store, cache) = setup(2);
    let criteria = ShelfCriteria::default();
    assert_eq!(cache.get_available_shelf(1, &criteria).await.unwrap().number, 1);

    store.overwrite_shelf(1, 1, true, Some(55));
    // still served from cache
    assert_eq!(cache.get_available_shelf(1, &criteria).await.unwrap().number, 1);
    cache.invalidate_all().await;
    assert_eq!(cache.get_available_shelf(1, &criteria).await.unwrap().number, 2);
}

#[tokio::test]
async fn entries_expire_after_ttl() {
    let store = Arc::new(InMemoryStore::new());
    store.add_rack(RackRecord { id: 1, name: "rack".to_string(), ottoeject_id: None }, shelves(1, 2));
    let cache = RackCache::new(store.clone(), Duration::ZERO);
    cache.shelves(1).await.unwrap();
    store.overwrite_shelf(1, 1, true, Some(9));
    assert!(cache.shelves(1).await.unwrap()[0].occupied);
}

#[tokio::test]
async fn confirm_requires_a_matching_reservation() {
    let (store, cache) = setup(2);
    cache.reserve(1, 1, 100).await.unwrap();
    let stale = cache.confirm_occupied(1, 1, 200).await.unwrap_err();
    assert_eq!(stale.kind(), ErrorKind::StaleCache);

    let stored = cache.confirm_occupied(1, 1, 100).await.unwrap();
    assert!(stored.occupied);
    assert_eq!(store.shelf(1, 1).unwrap().contents, Some(100));

    cache.reset_shelf(1, 1).await.unwrap();
    assert!(store.shelf(1, 1).unwrap().is_empty());
}

#[tokio::test]
async fn release_leaves_other_jobs_alone() {
    let (store, cache) = setup(2);
    cache.reserve(1, 1, 100).await.unwrap();
    cache.release(1, 1, 999).await.unwrap();
    assert_eq!(store.shelf(1, 1).unwrap().contents, Some(100));
    cache.release(1, 1, 100).await.unwrap();
    assert!(store.shelf(1, 1).unwrap().is_empty());
}

#[tokio::test]
async fn clearance_filters_short_shelves() {
    let store = Arc::new(InMemoryStore::new());
    store.add_rack(
        RackRecord { id: 1, name: "rack".to_string(), ottoeject_id: Some(1) },
        vec![Shelf::new(1, 1, 1).with_clearance(50.0), Shelf::new(1, 2, 2).with_clearance(150.0)],
    );
    let cache = RackCache::new(store, Duration::from_secs(60));
    let tall = ShelfCriteria { min_clearance_mm: Some(120.0), shelf_id: None };
    assert_eq!(cache.get_available_shelf(1, &tall).await.unwrap().number, 2);
    let giant = ShelfCriteria { min_clearance_mm: Some(500.0), shelf_id: None };
    assert_eq!(cache.get_available_shelf(1, &giant).await.unwrap_err(), CacheError::ShelfUnavailable(1));
}

#[tokio::test]
async fn orphaned_reservations_are_released() {
    let (store, cache) = setup(3);
    store.overwrite_shelf(1, 1, false, Some(7));
    store.overwrite_shelf(1, 2, false, Some(8));
    store.overwrite_shelf(1, 3, true, Some(9));
    let live = HashSet::from([8]);
    assert_eq!(cache.release_orphaned(&live).await.unwrap(), 1);
    assert!(store.shelf(1, 1).unwrap().is_empty());
    assert_eq!(store.shelf(1, 2).unwrap().contents, Some(8));
    assert!(store.shelf(1, 3).unwrap().occupied);
}

#[tokio::test]
async fn unknown_rack_surfaces_repository_error() {
    let (_store, cache) = setup(1);
    let err = cache.shelves(42).await.unwrap_err();
    assert!(matches!(err, CacheError::Repository(_)));
}

#[tokio::test]
async fn reset_refuses_a_shelf_reserved_for_a_running_job() {
    let (store, cache) = setup(1);
    let criteria = ShelfCriteria::default();
    let reserved = cache.reserve_available(1, &criteria, 100).await.unwrap();

    let refused = cache.reset_shelf(1, reserved.id).await.unwrap_err();
    assert_eq!(refused, CacheError::ShelfTaken { rack_id: 1, shelf_id: reserved.id });
    assert_eq!(store.shelf(1, reserved.id).unwrap().contents, Some(100));
    assert_eq!(
        cache.reserve_available(1, &criteria, 200).await.unwrap_err(),
        CacheError::ShelfUnavailable(1)
    );

    // resetting an empty shelf changes nothing
    cache.release(1, reserved.id, 100).await.unwrap();
    assert!(cache.reset_shelf(1, reserved.id).await.unwrap().is_empty());
    assert_eq!(cache.reserve_available(1, &criteria, 200).await.unwrap().id, reserved.id);
}
