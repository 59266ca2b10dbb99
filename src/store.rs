//! The in-memory registry of all test cases for a run.
//!
//! Tests are stored by value in a `BTreeMap` keyed by [`TestId`] rather than
//! linked by pointer, so dependency edges and scheduler queues can reference
//! a test by id without any lifetime or ownership entanglement.

use std::collections::BTreeMap;

use crate::model::{TestCase, TestId, TestSpec, TestStatus};

/// Registry of every [`TestCase`] discovered for a run, plus the secondary
/// indexes the dependency resolver and scheduler need.
#[derive(Debug, Default)]
pub struct TestCaseStore {
    cases: BTreeMap<TestId, TestCase>,
    /// Execute-directory string → the group key that claimed it, used to
    /// detect and warn about xdir collisions rather than silently
    /// overwriting results. Staged siblings deliberately share an xdir (same
    /// group key, different stage), so collisions are only flagged across
    /// *different* groups.
    by_xdir: BTreeMap<String, (String, Vec<(String, String)>)>,
    /// `group_key() → ids`, ordered by stage, for staged/analyze lookups.
    groups: BTreeMap<(String, Vec<(String, String)>), Vec<TestId>>,
}

impl TestCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly parsed test. Returns `false` (and does not insert)
    /// if the exact same id was already inserted, or if another test from a
    /// *different* parameter group already claimed the same execute
    /// directory — treated as a duplicate-test warning, not a hard error.
    /// Staged siblings intentionally share an xdir and are not rejected by
    /// this check.
    pub fn insert(&mut self, spec: TestSpec, results_root: &std::path::Path) -> bool {
        if self.cases.contains_key(&spec.id) {
            tracing::warn!(id = %spec.id, "duplicate test id; skipping");
            return false;
        }

        let xdir_key = spec.xdir(results_root).display().to_string();
        let group_key = spec.id.group_key();
        if let Some((existing_group, _)) = self.by_xdir.get(&xdir_key) {
            if existing_group != &group_key.0 {
                tracing::warn!(
                    xdir = %xdir_key,
                    duplicate = %spec.id,
                    "duplicate execute directory; skipping test"
                );
                return false;
            }
        }

        let id = spec.id.clone();
        self.by_xdir.insert(xdir_key, (group_key.0.clone(), group_key.1.clone()));
        self.groups.entry(group_key).or_default().push(id.clone());
        self.cases.insert(id, TestCase::new(spec));
        true
    }

    pub fn get(&self, id: &TestId) -> Option<&TestCase> {
        self.cases.get(id)
    }

    pub fn get_mut(&mut self, id: &TestId) -> Option<&mut TestCase> {
        self.cases.get_mut(id)
    }

    pub fn contains(&self, id: &TestId) -> bool {
        self.cases.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TestId> {
        self.cases.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TestId, &TestCase)> {
        self.cases.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&TestId, &mut TestCase)> {
        self.cases.iter_mut()
    }

    /// All ids sharing the given test's `(name, params)` group, in
    /// insertion order (which callers sort by stage where that matters).
    pub fn siblings(&self, id: &TestId) -> &[TestId] {
        self.groups
            .get(&id.group_key())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Tests not yet in a terminal status.
    pub fn active_ids(&self) -> Vec<TestId> {
        self.cases
            .iter()
            .filter(|(_, tc)| !tc.status.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn count_by_status(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for tc in self.cases.values() {
            *counts.entry(tc.status.status.word()).or_insert(0) += 1;
        }
        counts
    }

    /// Mark every still-active test `NotRunByDep` with no blocking id set,
    /// used as the final sweep once the scheduler determines nothing else
    /// can possibly run.
    pub fn flush_remaining_to_not_run_by_dep(&mut self) {
        for tc in self.cases.values_mut() {
            if !tc.status.status.is_terminal() {
                tc.status.status = TestStatus::NotRunByDep;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(name: &str) -> TestSpec {
        TestSpec {
            id: TestId::new(name, [], None),
            root: PathBuf::from("/src"),
            file: PathBuf::from(format!("{name}.vvt")),
            params: Default::default(),
            keywords: vec![],
            dependencies: vec![],
            timeout_secs: None,
            files: vec![],
            is_analyze: false,
            is_staged: false,
        }
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let mut store = TestCaseStore::new();
        let root = PathBuf::from("/results");
        assert!(store.insert(spec("a"), &root));
        assert_eq!(store.len(), 1);
        assert!(store.get(&TestId::new("a", [], None)).is_some());
    }

    #[test]
    fn duplicate_xdir_is_rejected() {
        let mut store = TestCaseStore::new();
        let root = PathBuf::from("/results");
        let mut dup = spec("a");
        dup.id = TestId::new("a", [], None);
        assert!(store.insert(spec("a"), &root));
        assert!(!store.insert(dup, &root));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn siblings_share_group_key_across_stages() {
        let mut store = TestCaseStore::new();
        let root = PathBuf::from("/results");
        let mut s1 = spec("staged");
        s1.id = TestId::new("staged", [], Some(1));
        let mut s2 = spec("staged");
        s2.id = TestId::new("staged", [], Some(2));
        store.insert(s1, &root);
        store.insert(s2, &root);
        assert_eq!(store.siblings(&TestId::new("staged", [], Some(1))).len(), 2);
    }
}
