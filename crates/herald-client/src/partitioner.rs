//! Partition selection
//!
//! Keyed records are hashed with murmur2 so a key always maps to the same
//! partition. Keyless records rotate round-robin over the topic's partitions,
//! starting from a random partition per topic.
//!
//! A (topic, key) lane with records still awaiting their outcome is pinned to
//! the partition its first record went to. The hash only decides again once
//! the lane is idle, so a change in the known partition count never splits
//! in-flight records of one key across partitions.

use crate::hash::murmur2_partition;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

type Lane = (String, Bytes);

struct LanePin {
    partition: u32,
    outstanding: u64,
}

type PinTable = Arc<Mutex<HashMap<Lane, LanePin>>>;

/// Partition chosen for one record
pub(crate) struct Assignment {
    pub(crate) partition: u32,
    /// Held until the record's outcome is known (keyed records only)
    pub(crate) lease: Option<PinLease>,
}

/// Keeps a keyed lane on its partition; dropping it releases the hold
pub(crate) struct PinLease {
    pins: PinTable,
    lane: Lane,
}

impl Drop for PinLease {
    fn drop(&mut self) {
        let mut pins = self.pins.lock();
        if let Some(pin) = pins.get_mut(&self.lane) {
            pin.outstanding -= 1;
            if pin.outstanding == 0 {
                pins.remove(&self.lane);
            }
        }
    }
}

pub(crate) struct Partitioner {
    /// Next round-robin position per topic
    counters: Mutex<HashMap<String, u32>>,
    pins: PinTable,
}

impl Partitioner {
    pub(crate) fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            pins: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Choose a partition and, for keyed records, pin the lane to it
    pub(crate) fn assign(
        &self,
        topic: &str,
        key: Option<&Bytes>,
        num_partitions: u32,
    ) -> Assignment {
        let Some(key) = key else {
            return Assignment {
                partition: self.round_robin(topic, num_partitions),
                lease: None,
            };
        };

        let lane = (topic.to_string(), key.clone());
        let mut pins = self.pins.lock();
        let pin = pins.entry(lane.clone()).or_insert_with(|| LanePin {
            partition: self.partition(topic, Some(key.as_ref()), num_partitions),
            outstanding: 0,
        });
        pin.outstanding += 1;

        Assignment {
            partition: pin.partition,
            lease: Some(PinLease {
                pins: Arc::clone(&self.pins),
                lane,
            }),
        }
    }

    /// Partition for a record of `topic` with an optional key
    pub(crate) fn partition(&self, topic: &str, key: Option<&[u8]>, num_partitions: u32) -> u32 {
        if num_partitions == 0 {
            return 0;
        }
        match key {
            Some(key) => murmur2_partition(key, num_partitions),
            None => self.round_robin(topic, num_partitions),
        }
    }

    fn round_robin(&self, topic: &str, num_partitions: u32) -> u32 {
        if num_partitions == 0 {
            return 0;
        }
        let mut counters = self.counters.lock();
        let counter = counters
            .entry(topic.to_string())
            .or_insert_with(|| rand::thread_rng().gen_range(0..num_partitions));
        let partition = *counter % num_partitions;
        *counter = counter.wrapping_add(1);
        partition
    }
}
