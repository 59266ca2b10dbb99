//! Dependency resolution — turning each test's raw dependency patterns into
//! concrete [`DependencyEdge`]s against other tests in the store, plus cycle
//! detection and the blocking/will-never-run predicates the scheduler
//! consults every time it looks for ready work.

use std::collections::{BTreeMap, BTreeSet};

use glob::Pattern;

use crate::error::DependencyError;
use crate::model::{DependencyEdge, ExpectCriterion, ResultPredicate, TestId, TestStatus};
use crate::store::TestCaseStore;

/// Match a dependency glob pattern against candidate execute directories
/// using a four-step fallback, scoped to the dependent's own execute
/// directory: first the pattern anchored directly under the dependent's
/// parent directory, then one level further nested under it, then the raw
/// pattern against the full path, then a `*`-prefixed form. The first step
/// that yields any match wins; later steps are only tried if the current one
/// is empty.
pub fn find_matching_xdirs<'a>(
    self_xdir: &str,
    pattern: &str,
    candidates: impl Iterator<Item = (&'a TestId, &'a str)>,
) -> Vec<&'a TestId> {
    let candidates: Vec<(&TestId, &str)> = candidates.collect();

    let mut tbase = std::path::Path::new(self_xdir)
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    if tbase == "." {
        tbase.clear();
    } else if !tbase.is_empty() {
        tbase.push('/');
    }

    let steps: [String; 4] = [
        format!("{tbase}{pattern}"),
        format!("{tbase}*/{pattern}"),
        pattern.to_string(),
        format!("*{pattern}"),
    ];

    for step in &steps {
        let Ok(glob_pat) = Pattern::new(step) else {
            continue;
        };
        let matched: Vec<&TestId> = candidates
            .iter()
            .filter(|(_, xdir)| glob_pat.matches(xdir))
            .map(|(id, _)| *id)
            .collect();
        if !matched.is_empty() {
            return matched;
        }
    }
    Vec::new()
}

/// Resolve every test's raw [`crate::model::DependencyPattern`]s against the
/// store's execute directories, installing `depends_on` edges and
/// `has_dependent` flags, plus implicit analyze→sibling edges. Returns an
/// error if an `ExpectCriterion` requiring a minimum match count was left
/// unsatisfied, or if a cycle is detected.
pub fn resolve_dependencies(
    store: &mut TestCaseStore,
    results_root: &std::path::Path,
) -> Result<(), DependencyError> {
    let xdirs: BTreeMap<TestId, String> = store
        .iter()
        .map(|(id, tc)| (id.clone(), tc.spec.xdir(results_root).display().to_string()))
        .collect();

    let mut new_edges: Vec<(TestId, Vec<(DependencyEdge, String)>)> = Vec::new();

    for (id, tc) in store.iter() {
        let mut edges = Vec::new();
        let self_xdir = xdirs.get(id).cloned().unwrap_or_default();
        let candidates = xdirs.iter().filter(|(cid, _)| *cid != id).map(|(cid, xd)| (cid, xd.as_str()));

        for pattern in &tc.spec.dependencies {
            let matches = find_matching_xdirs(&self_xdir, &pattern.glob, candidates.clone());
            if matches.is_empty() && pattern.expect.requires_minimum() {
                return Err(DependencyError::Other(anyhow::anyhow!(
                    "dependency pattern {:?} on test {} matched nothing but requires at least one match",
                    pattern.glob,
                    id
                )));
            }
            if !pattern.expect.is_satisfied_by(matches.len()) {
                return Err(DependencyError::Other(anyhow::anyhow!(
                    "dependency pattern {:?} on test {} matched {} tests, which does not satisfy {:?}",
                    pattern.glob,
                    id,
                    matches.len(),
                    pattern.expect
                )));
            }
            for m in matches {
                let target_xdir = xdirs.get(m).cloned().unwrap_or_default();
                edges.push((
                    DependencyEdge {
                        from: id.clone(),
                        to: m.clone(),
                        predicate: pattern.predicate.clone(),
                        match_pattern: pattern.glob.clone(),
                    },
                    target_xdir,
                ));
            }
        }

        // Staged tests run serially within their group: stage N implicitly
        // depends on stage N-1, even with no explicit dependency pattern,
        // since later stages usually read files the earlier stage left in
        // the shared execute directory.
        if tc.spec.is_staged {
            if let Some(stage) = id.stage {
                if stage > 1 {
                    let group_key = id.group_key();
                    if let Some(prev_id) = store
                        .iter()
                        .map(|(cid, _)| cid)
                        .find(|cid| cid.group_key() == group_key && cid.stage == Some(stage - 1))
                    {
                        let target_xdir = xdirs.get(prev_id).cloned().unwrap_or_default();
                        edges.push((
                            DependencyEdge {
                                from: id.clone(),
                                to: prev_id.clone(),
                                predicate: ResultPredicate::Default,
                                match_pattern: String::from("<stage-predecessor>"),
                            },
                            target_xdir,
                        ));
                    }
                }
            }
        }

        // Analyze tests implicitly depend on every other parameterized test
        // sharing their test name (the parameter sweep they summarize).
        if tc.spec.is_analyze {
            for (other_id, other_tc) in store.iter() {
                if other_id != id && other_id.name == id.name && !other_tc.spec.is_analyze {
                    let target_xdir = xdirs.get(other_id).cloned().unwrap_or_default();
                    edges.push((
                        DependencyEdge {
                            from: id.clone(),
                            to: other_id.clone(),
                            predicate: ResultPredicate::Any,
                            match_pattern: String::from("<analyze-sibling>"),
                        },
                        target_xdir,
                    ));
                }
            }
        }

        if !edges.is_empty() {
            new_edges.push((id.clone(), edges));
        }
    }

    for (id, edges) in &new_edges {
        for (edge, _) in edges {
            if let Some(dep) = store.get_mut(&edge.to) {
                dep.has_dependent = true;
            }
        }
        if let Some(tc) = store.get_mut(id) {
            for (edge, target_xdir) in edges {
                tc.dep_dir_map
                    .entry(edge.match_pattern.clone())
                    .or_default()
                    .push(std::path::PathBuf::from(target_xdir));
                tc.depends_on.push(edge.clone());
            }
        }
    }

    detect_cycles(store)
}

/// Depth-first cycle detection over the `depends_on` edges.
fn detect_cycles(store: &TestCaseStore) -> Result<(), DependencyError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: BTreeMap<TestId, Mark> = BTreeMap::new();

    fn visit(
        id: &TestId,
        store: &TestCaseStore,
        marks: &mut BTreeMap<TestId, Mark>,
        stack: &mut BTreeSet<TestId>,
    ) -> Result<(), DependencyError> {
        if let Some(Mark::Done) = marks.get(id) {
            return Ok(());
        }
        if stack.contains(id) {
            return Err(DependencyError::Cycle(id.clone()));
        }
        stack.insert(id.clone());
        if let Some(tc) = store.get(id) {
            for edge in &tc.depends_on {
                visit(&edge.to, store, marks, stack)?;
            }
        }
        stack.remove(id);
        marks.insert(id.clone(), Mark::Done);
        Ok(())
    }

    let mut stack = BTreeSet::new();
    for id in store.ids() {
        visit(id, store, &mut marks, &mut stack)?;
    }
    Ok(())
}

/// Whether `id`'s dependencies currently block it from running: at least one
/// not-yet-terminal dependency, or a terminal dependency whose result fails
/// the edge's predicate.
pub fn is_blocking(store: &TestCaseStore, id: &TestId) -> bool {
    let Some(tc) = store.get(id) else {
        return false;
    };
    tc.depends_on.iter().any(|edge| {
        store
            .get(&edge.to)
            .map(|dep| !dep.status.status.is_terminal())
            .unwrap_or(true)
    })
}

/// Whether `id` can never run because a dependency has already reached a
/// terminal state that fails the edge's predicate (e.g. the dependency
/// failed and the edge required `pass`/`diff`).
pub fn will_never_run(store: &TestCaseStore, id: &TestId) -> Option<TestId> {
    let tc = store.get(id)?;
    for edge in &tc.depends_on {
        let Some(dep) = store.get(&edge.to) else {
            continue;
        };
        let status = dep.status.status;
        if status.is_terminal()
            && status != TestStatus::NotRunByDep
            && !edge.predicate.is_satisfied_by(status.word())
        {
            return Some(edge.to.clone());
        }
        if status == TestStatus::NotRunByDep {
            return Some(edge.to.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_one_prefers_dependents_own_directory() {
        let a = TestId::new("a", [], None);
        let b = TestId::new("b", [], None);
        let candidates = vec![(&a, "root/sub/a"), (&b, "root/other/b")];
        let found = find_matching_xdirs("root/sub/from", "a", candidates.into_iter());
        assert_eq!(found, vec![&a]);
    }

    #[test]
    fn same_named_pattern_in_unrelated_group_is_not_matched_first() {
        // Two different test groups each contain an "a"-named xdir. A
        // dependent living under "root/sub" must match the sibling in its
        // own directory, not the unrelated one under "root/other".
        let wanted = TestId::new("wanted", [], None);
        let other = TestId::new("other", [], None);
        let candidates = vec![(&wanted, "root/sub/a"), (&other, "root/other/a")];
        let found = find_matching_xdirs("root/sub/from", "a", candidates.into_iter());
        assert_eq!(found, vec![&wanted]);
    }

    #[test]
    fn falls_back_to_raw_pattern_when_basename_step_empty() {
        let a = TestId::new("a", [], None);
        let candidates = vec![(&a, "exact/path/name")];
        let found = find_matching_xdirs("root/unrelated", "exact/path/name", candidates.into_iter());
        assert_eq!(found, vec![&a]);
    }

    #[test]
    fn no_match_returns_empty() {
        let a = TestId::new("a", [], None);
        let candidates = vec![(&a, "root/a")];
        let found = find_matching_xdirs("root/from", "nonexistent", candidates.into_iter());
        assert!(found.is_empty());
    }

    #[test]
    fn staged_sibling_depends_on_previous_stage() {
        use crate::model::TestSpec;
        use std::path::PathBuf;

        let root = PathBuf::from("/results");
        let mut store = TestCaseStore::new();

        for stage in [1u32, 2, 3] {
            let spec = TestSpec {
                id: TestId::new("staged", [], Some(stage)),
                root: PathBuf::from("/src"),
                file: PathBuf::from("staged.vvt"),
                params: Default::default(),
                keywords: vec![],
                dependencies: vec![],
                timeout_secs: None,
                files: vec![],
                is_analyze: false,
                is_staged: true,
            };
            store.insert(spec, &root);
        }

        resolve_dependencies(&mut store, &root).unwrap();

        let stage1 = TestId::new("staged", [], Some(1));
        let stage2 = TestId::new("staged", [], Some(2));
        let stage3 = TestId::new("staged", [], Some(3));

        assert!(store.get(&stage1).unwrap().depends_on.is_empty());
        assert_eq!(store.get(&stage2).unwrap().depends_on[0].to, stage1);
        assert_eq!(store.get(&stage3).unwrap().depends_on[0].to, stage2);

        assert!(is_blocking(&store, &stage2));
        store.get_mut(&stage1).unwrap().status.status = TestStatus::Pass;
        assert!(!is_blocking(&store, &stage2));
    }
}
