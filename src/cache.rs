//! TTL stamping and draft/confirmed merging shared by the offer and deal caches
use super::types::TimeStamp;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Change notifications for the presentation layer. Views recompute when the
/// generation they rendered from is older than the one announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketEvent {
    OffersChanged { generation: u64 },
    DealsChanged { generation: u64 },
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

/// Counts in-flight fetches for as long as it is alive.
pub(crate) struct Loading<'a>(&'a AtomicUsize);

impl<'a> Loading<'a> {
    pub(crate) fn start(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Loading<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp {
        TimeStamp::new()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(Mutex<TimeStamp>);

impl ManualClock {
    pub fn new(start: TimeStamp) -> Self {
        Self(Mutex::new(start))
    }
    pub fn advance(&self, by: Duration) {
        let step = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        let mut now = self.0.lock().unwrap_or_else(|p| p.into_inner());
        *now = now.plus(step);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeStamp {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// An immutable snapshot plus when it was fetched and which fetch produced it.
#[derive(Debug)]
pub struct Stamped<T> {
    pub value: Arc<T>,
    pub fetched_at: TimeStamp,
    pub ticket: u64,
}

impl<T> Clone for Stamped<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
            ticket: self.ticket,
        }
    }
}

impl<T> Stamped<T> {
    pub fn new(value: T, fetched_at: TimeStamp, ticket: u64) -> Self {
        Self {
            value: Arc::new(value),
            fetched_at,
            ticket,
        }
    }
    /// Fresh while strictly younger than `ttl`.
    pub fn is_fresh(&self, now: TimeStamp, ttl: Duration) -> bool {
        let age = now.since(&self.fetched_at);
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => age < ttl,
            Err(_) => true,
        }
    }
}

/// A cache row tagged by whether the ledger has confirmed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry<T> {
    Draft(T),
    Confirmed(T),
}

impl<T> Entry<T> {
    pub fn value(&self) -> &T {
        match self {
            Entry::Draft(v) | Entry::Confirmed(v) => v,
        }
    }
    pub fn into_value(self) -> T {
        match self {
            Entry::Draft(v) | Entry::Confirmed(v) => v,
        }
    }
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Entry::Confirmed(_))
    }
}

/// Merges confirmed rows with local entries, one row per key.
///
/// Confirmed always wins: a confirmed row from `chain` beats any local entry,
/// and among local entries a confirmed one beats a draft. Chain order is kept,
/// surviving local entries are appended in their original order.
pub fn merge<T, K, F>(chain: &[T], local: &[Entry<T>], key: F) -> Vec<T>
where
    T: Clone,
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut seen: HashSet<K> = HashSet::new();
    let mut merged = Vec::with_capacity(chain.len() + local.len());

    for row in chain {
        if seen.insert(key(row)) {
            merged.push(row.clone());
        }
    }
    for entry in local.iter().filter(|e| e.is_confirmed()) {
        if seen.insert(key(entry.value())) {
            merged.push(entry.value().clone());
        }
    }
    for entry in local.iter().filter(|e| !e.is_confirmed()) {
        if seen.insert(key(entry.value())) {
            merged.push(entry.value().clone());
        }
    }
    merged
}
