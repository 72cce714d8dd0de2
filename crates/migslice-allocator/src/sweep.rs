//! Allocation-order sweeps
//!
//! Whether a set of requests fits depends on the order they arrive in. A
//! sweep tries every ordering of every combination of partition sizes that
//! adds up to a total, and checks that capacity comes back afterwards.

use migslice_core::{MigError, MigResult, WaitPolicy};
use tracing::debug;

use crate::allocator::Allocator;

/// Every multiset of `sizes` summing to `total`, each sorted ascending
pub fn multiset_sums(total: u32, sizes: &[u32]) -> Vec<Vec<u32>> {
    let mut descending: Vec<u32> = sizes.iter().copied().filter(|&s| s > 0).collect();
    descending.sort_unstable_by(|a, b| b.cmp(a));
    descending.dedup();

    let mut out = Vec::new();
    collect_sums(&mut out, &mut Vec::new(), total, &descending);
    out
}

fn collect_sums(out: &mut Vec<Vec<u32>>, partial: &mut Vec<u32>, remaining: u32, sizes: &[u32]) {
    for (i, &size) in sizes.iter().enumerate() {
        if size > remaining {
            continue;
        }
        partial.push(size);
        if size == remaining {
            let mut multiset = partial.clone();
            multiset.reverse();
            out.push(multiset);
        } else {
            // Only sizes no larger than this one, so each multiset appears once
            collect_sums(out, partial, remaining - size, &sizes[i..]);
        }
        partial.pop();
    }
}

/// Advance `items` to the next lexicographic permutation
///
/// Returns false, leaving `items` sorted ascending, after the last one.
pub fn next_permutation(items: &mut [u32]) -> bool {
    if items.len() < 2 {
        return false;
    }

    let mut i = items.len() - 1;
    while i > 0 && items[i - 1] >= items[i] {
        i -= 1;
    }
    if i == 0 {
        items.reverse();
        return false;
    }

    let mut j = items.len() - 1;
    while items[j] <= items[i - 1] {
        j -= 1;
    }
    items.swap(i - 1, j);
    items[i..].reverse();
    true
}

/// How one ordering went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Every allocation in the ordering succeeded
    Succeeded,
    /// The allocation at `position` failed
    FailedAt { position: usize, error: String },
}

/// Result of allocating one ordering
#[derive(Debug, Clone)]
pub struct SweepRun {
    /// Slice counts in allocation order
    pub order: Vec<u32>,
    pub outcome: SweepOutcome,
    /// Whether single-slice capacity returned to its starting value
    pub restored: bool,
}

/// Allocate every ordering of every multiset summing to `total`
///
/// Each run frees whatever it managed to allocate before the next starts.
/// The allocator must fail fast: a run holds its partitions while it
/// allocates, so a blocking allocator would wait on a release that only the
/// sweep itself could make.
pub fn sweep_allocation_orders(allocator: &dyn Allocator, total: u32) -> MigResult<Vec<SweepRun>> {
    if allocator.wait_policy() != WaitPolicy::FailFast {
        return Err(MigError::Config(
            "allocation-order sweeps need a fail-fast allocator".to_string(),
        ));
    }

    let baseline = allocator.remaining(1)?;
    let sizes = allocator.device().profile().valid_slices();
    let mut runs = Vec::new();

    for mut order in multiset_sums(total, &sizes) {
        loop {
            let mut held = Vec::with_capacity(order.len());
            let mut outcome = SweepOutcome::Succeeded;
            for (position, &slices) in order.iter().enumerate() {
                match allocator.allocate(slices) {
                    Ok(partition) => held.push(partition),
                    Err(e) => {
                        outcome = SweepOutcome::FailedAt {
                            position,
                            error: e.to_string(),
                        };
                        break;
                    }
                }
            }
            for partition in held {
                allocator.free(partition);
            }

            let restored = allocator.remaining(1)? == baseline;
            debug!(order = ?order, outcome = ?outcome, restored, "Sweep run finished");
            runs.push(SweepRun {
                order: order.clone(),
                outcome,
                restored,
            });

            if !next_permutation(&mut order) {
                break;
            }
        }
    }

    Ok(runs)
}
