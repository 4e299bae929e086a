//! Sharded parallel scans.
//!
//! The visitor splits a snapshot's key space into lanes using the index's
//! range-split pivots and drives them with a bounded worker pool. Lane
//! boundaries are pivot keys: for a fixed snapshot the lanes partition the
//! visible key space exactly, so every item is delivered to exactly one
//! lane, in key order within the lane.

use std::cmp::Ordering;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::item::Item;
use crate::iterator::SnapshotIter;
use crate::snapshot::Snapshot;
use crate::Store;

impl Store {
    /// Visits every item visible to `snap`, split into up to `shards`
    /// lanes driven by `concurrency` worker threads. The callback receives
    /// each item together with its lane index; the first callback error
    /// aborts that lane and is returned verbatim.
    pub fn visit<F>(
        &self,
        snap: &Arc<Snapshot>,
        shards: usize,
        concurrency: usize,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&Item, usize) -> Result<()> + Send + Sync,
    {
        let pivots = self.core.store.range_split_items(shards.max(1));
        let lanes = lanes_from_pivots(pivots);
        let workers = concurrency.clamp(1, lanes.len().max(1));

        let (tx, rx) = crossbeam_channel::unbounded::<usize>();
        for lane in 0..lanes.len() {
            let _ = tx.send(lane);
        }
        drop(tx);

        let failures: Vec<Mutex<Option<Error>>> =
            (0..lanes.len()).map(|_| Mutex::new(None)).collect();

        thread::scope(|s| {
            for _ in 0..workers {
                let rx = rx.clone();
                let lanes = &lanes;
                let failures = &failures;
                let callback = &callback;
                s.spawn(move || {
                    while let Ok(lane) = rx.recv() {
                        if let Err(err) = self.visit_lane(snap, &lanes[lane], lane, callback) {
                            warn!(lane, %err, "visitor lane aborted");
                            *failures[lane].lock() = Some(err);
                            // A failed callback retires the whole worker,
                            // not just its current lane.
                            return;
                        }
                    }
                });
            }
        });

        for failure in failures {
            if let Some(err) = failure.into_inner() {
                return Err(err);
            }
        }
        Ok(())
    }

    fn visit_lane<F>(
        &self,
        snap: &Arc<Snapshot>,
        lane: &Lane,
        index: usize,
        callback: &F,
    ) -> Result<()>
    where
        F: Fn(&Item, usize) -> Result<()>,
    {
        let iter_cmp = &*self.core.config.iter_cmp;
        let mut it: SnapshotIter<'_> = match self.new_iterator(snap) {
            Some(it) => it,
            None => return Err(Error::Shutdown),
        };

        match &lane.start {
            None => it.seek_first(),
            Some(pivot) => it.seek_item(pivot),
        }

        while it.valid() {
            if self.core.closed.load(AtomicOrdering::Acquire) {
                return Err(Error::Shutdown);
            }
            let item = it.item().expect("valid cursor has an item");
            if let Some(end) = &lane.end {
                if iter_cmp(item, end) != Ordering::Less {
                    break;
                }
            }
            callback(item, index)?;
            it.next();
        }
        Ok(())
    }
}

struct Lane {
    start: Option<Item>,
    end: Option<Item>,
}

fn lanes_from_pivots(pivots: Vec<Item>) -> Vec<Lane> {
    let mut lanes = Vec::with_capacity(pivots.len() + 1);
    let mut start: Option<Item> = None;
    for pivot in pivots {
        lanes.push(Lane {
            start: start.take(),
            end: Some(pivot.clone()),
        });
        start = Some(pivot);
    }
    lanes.push(Lane { start, end: None });
    lanes
}
