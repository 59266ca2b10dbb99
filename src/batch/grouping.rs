//! Runtime-bucketed grouping of tests into batch jobs.

use crate::model::TestId;

/// Default queue-time ceiling used when a test specifies no timeout at all:
/// 21 hours.
pub const DEFAULT_QUEUE_CEILING_SECS: u64 = 21 * 60 * 60;

/// A single test slated for a batch job, with the runtime estimate the
/// grouper bucket-packs by.
#[derive(Debug, Clone)]
pub struct Groupable {
    pub id: TestId,
    pub estimated_runtime_secs: u64,
    /// Analyze tests and tests with no timeout at all always get their own
    /// singleton batch job, never sharing with siblings.
    pub force_singleton: bool,
}

/// One planned batch job: its member tests and the raw (pre-bump) queue time
/// computed for it.
#[derive(Debug, Clone)]
pub struct BatchGroup {
    pub members: Vec<TestId>,
    pub queue_time_secs: u64,
}

/// Pad a computed runtime estimate before requesting walltime from the
/// scheduler, to absorb queue/launch jitter the raw estimate doesn't
/// account for.
pub fn apply_queue_timeout_bump_factor(qtime: f64) -> f64 {
    if qtime < 60.0 {
        qtime + 60.0
    } else if qtime < 600.0 {
        qtime * 2.0
    } else if qtime < 1800.0 {
        qtime + (600.0 + 0.3 * (qtime - 600.0)).min(900.0)
    } else {
        qtime + (600.0 + 0.3 * (1800.0 - 600.0)).min(900.0)
    }
}

/// Bucket `tests` into batch groups targeting roughly `group_size` tests
/// (by count) and `max_timeout_secs` walltime per group, before bumping.
/// Singleton-forced tests always get their own group.
pub fn process_groups(
    tests: &[Groupable],
    group_size: u32,
    max_timeout_secs: Option<u64>,
) -> Vec<BatchGroup> {
    let mut groups = Vec::new();
    let mut current: Vec<&Groupable> = Vec::new();
    let mut current_runtime: u64 = 0;

    let ceiling = max_timeout_secs.unwrap_or(DEFAULT_QUEUE_CEILING_SECS);

    let flush = |current: &mut Vec<&Groupable>, current_runtime: &mut u64, groups: &mut Vec<BatchGroup>| {
        if current.is_empty() {
            return;
        }
        let bumped = apply_queue_timeout_bump_factor(*current_runtime as f64).round() as u64;
        let queue_time = bumped.min(ceiling);
        groups.push(BatchGroup {
            members: current.iter().map(|g| g.id.clone()).collect(),
            queue_time_secs: queue_time,
        });
        current.clear();
        *current_runtime = 0;
    };

    // Longest-running first, so a bucket fills predictably rather than
    // depending on discovery order.
    let mut sorted: Vec<&Groupable> = tests.iter().collect();
    sorted.sort_by(|a, b| b.estimated_runtime_secs.cmp(&a.estimated_runtime_secs));

    for g in sorted {
        if g.force_singleton {
            flush(&mut current, &mut current_runtime, &mut groups);
            let bumped = apply_queue_timeout_bump_factor(g.estimated_runtime_secs as f64).round() as u64;
            groups.push(BatchGroup {
                members: vec![g.id.clone()],
                queue_time_secs: bumped.min(ceiling),
            });
            continue;
        }

        if current.len() as u32 >= group_size && !current.is_empty() {
            flush(&mut current, &mut current_runtime, &mut groups);
        }

        current.push(g);
        current_runtime += g.estimated_runtime_secs;
    }
    flush(&mut current, &mut current_runtime, &mut groups);

    groups
}

/// For a singleton batch, tighten the requested walltime below the bumped
/// queue time, so the scheduler reclaims the job promptly once the test
/// itself times out rather than waiting out the full padded window:
/// `qtime * 0.90` under 600s, else `qtime - 120`.
pub fn singleton_script_timeout(queue_time_secs: u64) -> u64 {
    if queue_time_secs < 600 {
        (queue_time_secs as f64 * 0.90).round() as u64
    } else {
        queue_time_secs.saturating_sub(120)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_under_60_adds_flat_60() {
        assert_eq!(apply_queue_timeout_bump_factor(30.0), 90.0);
    }

    #[test]
    fn bump_under_600_doubles() {
        assert_eq!(apply_queue_timeout_bump_factor(300.0), 600.0);
    }

    #[test]
    fn bump_under_1800_caps_padding_at_900() {
        let bumped = apply_queue_timeout_bump_factor(1799.0);
        assert!(bumped <= 1799.0 + 900.0);
    }

    #[test]
    fn singleton_under_600_scales_by_90_percent() {
        assert_eq!(singleton_script_timeout(500), 450);
    }

    #[test]
    fn singleton_at_or_above_600_subtracts_120() {
        assert_eq!(singleton_script_timeout(700), 580);
    }

    #[test]
    fn forced_singletons_never_share_a_group() {
        let tests = vec![
            Groupable {
                id: TestId::new("analyze", [], None),
                estimated_runtime_secs: 10,
                force_singleton: true,
            },
            Groupable {
                id: TestId::new("a", [], None),
                estimated_runtime_secs: 10,
                force_singleton: false,
            },
        ];
        let groups = process_groups(&tests, 30, None);
        assert_eq!(groups.len(), 2);
    }
}
