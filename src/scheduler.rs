//! The ready queue: dependency- and resource-aware selection of the next
//! test to launch, bucketed by core demand and ordered longest-runtime-first
//! within a bucket.

use std::collections::BTreeMap;

use crate::deps;
use crate::model::{ResourceRequest, TestId};
use crate::resources::ResourcePool;
use crate::store::TestCaseStore;

/// An estimate of how long a test will take, used to order same-bucket
/// candidates longest-first so long-running tests get first crack at idle
/// resources: starting the slowest test in a bucket earliest minimizes the
/// tail latency of the whole run.
pub trait RuntimeEstimates {
    fn estimated_runtime_secs(&self, id: &TestId) -> u64;
}

/// A no-op estimator: every test is assumed equally long, so selection
/// falls back to store iteration order. Used when no runtime history exists
/// yet (first run).
pub struct NoEstimates;

impl RuntimeEstimates for NoEstimates {
    fn estimated_runtime_secs(&self, _id: &TestId) -> u64 {
        0
    }
}

/// Picks the next ready test to run, if any, given the current store state
/// and available resources. A test is *ready* when it is `NotRun`, none of
/// its dependencies are blocking it, and the resource pool can satisfy its
/// request (now, or via the oversubscription escape hatch).
pub fn pop_next(
    store: &TestCaseStore,
    pool: &ResourcePool,
    estimates: &dyn RuntimeEstimates,
) -> Option<TestId> {
    let mut buckets: BTreeMap<u32, Vec<TestId>> = BTreeMap::new();

    for (id, tc) in store.iter() {
        if tc.status.status != crate::model::TestStatus::NotRun {
            continue;
        }
        if deps::is_blocking(store, id) {
            continue;
        }
        let req = tc.resource_request();
        buckets.entry(req.cores).or_default().push(id.clone());
    }

    // Largest np bucket first: descending core-count buckets so big jobs get
    // scheduled while the machine is most free.
    for (_np, mut ids) in buckets.into_iter().rev() {
        ids.sort_by(|a, b| {
            estimates
                .estimated_runtime_secs(b)
                .cmp(&estimates.estimated_runtime_secs(a))
                .then_with(|| a.cmp(b))
        });

        for id in ids {
            let Some(tc) = store.get(&id) else { continue };
            let req = tc.resource_request();
            if pool.can_ever_satisfy(req) {
                // `can_ever_satisfy` only tells us the request is not
                // hopeless; whether it fits *right now* is for the caller
                // to check via `ResourcePool::try_obtain`, since that call
                // mutates pool state. We hand back the first test whose
                // request is currently satisfiable to avoid reserving here.
                if request_fits_now(pool, req) {
                    return Some(id);
                }
            }
        }
    }

    // Oversubscription retry: if nothing fit in the normal pass and the
    // pool is idle, allow the single largest-request ready test through.
    if pool.is_idle() {
        let mut best: Option<(ResourceRequest, TestId)> = None;
        for (id, tc) in store.iter() {
            if tc.status.status != crate::model::TestStatus::NotRun {
                continue;
            }
            if deps::is_blocking(store, id) {
                continue;
            }
            let req = tc.resource_request();
            if !pool.can_ever_satisfy(req) {
                continue;
            }
            if request_fits_now(pool, req) {
                continue;
            }
            if best.as_ref().map(|(r, _)| req.cores > r.cores).unwrap_or(true) {
                best = Some((req, id.clone()));
            }
        }
        return best.map(|(_, id)| id);
    }

    None
}

fn request_fits_now(pool: &ResourcePool, req: ResourceRequest) -> bool {
    req.cores <= pool.available_cores() && req.devices <= pool.available_devices()
}

/// Every test that is `NotRun` and has no hope of ever running because a
/// dependency has already landed in a status that fails its predicate.
pub fn collect_will_never_run(store: &TestCaseStore) -> Vec<(TestId, TestId)> {
    store
        .ids()
        .filter_map(|id| deps::will_never_run(store, id).map(|blocker| (id.clone(), blocker)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TestId, TestSpec};
    use std::path::PathBuf;

    fn spec(name: &str, np: i64) -> TestSpec {
        let mut params = std::collections::BTreeMap::new();
        if np != 0 {
            params.insert("np".to_string(), crate::model::ParamValue::Int(np));
        }
        TestSpec {
            id: TestId::new(name, [], None),
            root: PathBuf::from("/src"),
            file: PathBuf::from(format!("{name}.vvt")),
            params,
            keywords: vec![],
            dependencies: vec![],
            timeout_secs: None,
            files: vec![],
            is_analyze: false,
            is_staged: false,
        }
    }

    #[test]
    fn picks_largest_np_bucket_first() {
        let mut store = TestCaseStore::new();
        let root = PathBuf::from("/results");
        store.insert(spec("small", 1), &root);
        store.insert(spec("big", 4), &root);
        let pool = ResourcePool::new(4, 0, true);
        let next = pop_next(&store, &pool, &NoEstimates).unwrap();
        assert_eq!(next, TestId::new("big", [], None));
    }

    #[test]
    fn empty_store_yields_nothing() {
        let store = TestCaseStore::new();
        let pool = ResourcePool::new(4, 0, true);
        assert!(pop_next(&store, &pool, &NoEstimates).is_none());
    }

    #[test]
    fn oversubscription_retry_picked_when_pool_idle() {
        let mut store = TestCaseStore::new();
        let root = PathBuf::from("/results");
        store.insert(spec("huge", 99), &root);
        let pool = ResourcePool::new(4, 0, true);
        let next = pop_next(&store, &pool, &NoEstimates);
        assert_eq!(next, Some(TestId::new("huge", [], None)));
    }
}
