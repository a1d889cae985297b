//! Work balancing: splits work items across N workers.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::time::Duration;

use slipway_config::BalancerChoice;

/// One unit of work with its byte size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub path: String,
    pub size: u64,
}

impl WorkItem {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

/// Historical timing samples, item path → observed durations.
#[derive(Debug, Default, Clone)]
pub struct TimingHistory {
    samples: HashMap<String, Vec<Duration>>,
}

impl TimingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, path: impl Into<String>, duration: Duration) {
        self.samples.entry(path.into()).or_default().push(duration);
    }

    pub fn is_empty(&self) -> bool {
        self.samples.values().all(Vec::is_empty)
    }

    /// Worst observed duration for an item, if it was ever seen.
    fn worst(&self, path: &str) -> Option<Duration> {
        self.samples.get(path)?.iter().max().copied()
    }

    /// Smallest duration observed across all items.
    fn min_observed(&self) -> Option<Duration> {
        self.samples.values().flatten().min().copied()
    }
}

/// Split `items` into at most `workers` groups (strategies may produce more
/// or fewer; `isolated` ignores the count entirely). When timing samples
/// exist, LPT time-greedy balancing takes precedence over the configured
/// strategy. Every input item lands in exactly one group; empty groups are
/// dropped.
pub fn balance(
    items: Vec<WorkItem>,
    workers: usize,
    choice: BalancerChoice,
    timings: Option<&TimingHistory>,
    seed: u64,
) -> Vec<Vec<WorkItem>> {
    let workers = workers.max(1);
    if items.is_empty() {
        return Vec::new();
    }

    let groups = match timings {
        Some(history) if !history.is_empty() => time_greedy(items, workers, history),
        _ => match choice {
            BalancerChoice::Alphabetical => alphabetical(items, workers),
            BalancerChoice::Isolated => items.into_iter().map(|item| vec![item]).collect(),
            BalancerChoice::RoundRobin => round_robin(items, workers),
            BalancerChoice::SortedRoundRobin => {
                let mut items = items;
                items.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
                round_robin(items, workers)
            }
            BalancerChoice::GreedySize => greedy_size(items, workers),
            BalancerChoice::AverageSize => average_size(items, workers),
            BalancerChoice::Shuffle => shuffle(items, workers, seed),
            BalancerChoice::TimeGreedy => greedy_size(items, workers),
        },
    };

    groups.into_iter().filter(|g| !g.is_empty()).collect()
}

/// Sort by path, split into contiguous chunks.
fn alphabetical(mut items: Vec<WorkItem>, workers: usize) -> Vec<Vec<WorkItem>> {
    items.sort_by(|a, b| a.path.cmp(&b.path));
    chunked(items, workers)
}

fn chunked(items: Vec<WorkItem>, workers: usize) -> Vec<Vec<WorkItem>> {
    let per_chunk = items.len().div_ceil(workers);
    items
        .chunks(per_chunk)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Deal items to buckets in order.
fn round_robin(items: Vec<WorkItem>, workers: usize) -> Vec<Vec<WorkItem>> {
    let mut buckets = vec![Vec::new(); workers];
    for (i, item) in items.into_iter().enumerate() {
        buckets[i % workers].push(item);
    }
    buckets
}

/// Classic bin-packing: each item, largest first, into the currently
/// smallest bucket.
fn greedy_size(mut items: Vec<WorkItem>, workers: usize) -> Vec<Vec<WorkItem>> {
    items.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
    let mut buckets: Vec<(u64, Vec<WorkItem>)> = vec![(0, Vec::new()); workers];
    for item in items {
        let bucket = buckets.iter_mut().min_by_key(|(load, _)| *load).unwrap();
        bucket.0 += item.size;
        bucket.1.push(item);
    }
    buckets.into_iter().map(|(_, items)| items).collect()
}

/// Fill a bucket until it reaches the average per-worker byte size, then
/// start the next.
fn average_size(items: Vec<WorkItem>, workers: usize) -> Vec<Vec<WorkItem>> {
    let total: u64 = items.iter().map(|i| i.size).sum();
    let threshold = (total / workers as u64).max(1);

    let mut groups: Vec<Vec<WorkItem>> = vec![Vec::new()];
    let mut current_size = 0u64;
    for item in items {
        if current_size >= threshold && !groups.last().unwrap().is_empty() {
            groups.push(Vec::new());
            current_size = 0;
        }
        current_size += item.size;
        groups.last_mut().unwrap().push(item);
    }
    groups
}

/// Seeded Fisher-Yates shuffle, then contiguous chunks.
fn shuffle(mut items: Vec<WorkItem>, workers: usize, seed: u64) -> Vec<Vec<WorkItem>> {
    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);
    chunked(items, workers)
}

/// Greedy-LPT makespan heuristic over historical durations: items sorted by
/// worst observed duration descending, each placed into the least-loaded
/// bucket. Half the minimum observed duration is subtracted from each
/// placement as an amortized per-item setup cost; unseen items default to
/// the minimum observed duration.
fn time_greedy(mut items: Vec<WorkItem>, workers: usize, history: &TimingHistory) -> Vec<Vec<WorkItem>> {
    let floor = history.min_observed().unwrap_or(Duration::ZERO);
    let setup_discount = floor / 2;
    let cost = |item: &WorkItem| history.worst(&item.path).unwrap_or(floor);

    items.sort_by(|a, b| cost(b).cmp(&cost(a)).then_with(|| a.path.cmp(&b.path)));

    let mut buckets: Vec<(Duration, Vec<WorkItem>)> = vec![(Duration::ZERO, Vec::new()); workers];
    for item in items {
        let placement = cost(&item).saturating_sub(setup_discount);
        let bucket = buckets.iter_mut().min_by_key(|(load, _)| *load).unwrap();
        bucket.0 += placement;
        bucket.1.push(item);
    }
    buckets.into_iter().map(|(_, items)| items).collect()
}
