//! In-memory [`Stream`] for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::{partition_for, PartitionSignals, Stream, StreamRecord};
use crate::error::PipelineResult;

struct Partition {
    records: VecDeque<StreamRecord>,
    next_offset: u64,
}

pub struct MemoryStream {
    name: String,
    partitions: Vec<Mutex<Partition>>,
    signals: PartitionSignals,
}

impl MemoryStream {
    pub fn new(name: impl Into<String>, partitions: u32) -> Self {
        let partitions = partitions.max(1);
        Self {
            name: name.into(),
            partitions: (0..partitions)
                .map(|_| {
                    Mutex::new(Partition {
                        records: VecDeque::new(),
                        next_offset: 0,
                    })
                })
                .collect(),
            signals: PartitionSignals::new(&vec![0; partitions as usize]),
        }
    }

    /// Total retained records across all partitions.
    pub fn len(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.lock().unwrap().records.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn partition(&self, partition: u32) -> Option<&Mutex<Partition>> {
        self.partitions.get(partition as usize)
    }
}

#[async_trait]
impl Stream for MemoryStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn append(&self, key: &str, payload: &str) -> PipelineResult<(u32, u64)> {
        let partition = partition_for(key, self.partitions());
        let offset = {
            let mut p = self.partitions[partition as usize].lock().unwrap();
            let offset = p.next_offset;
            p.records.push_back(StreamRecord {
                partition,
                offset,
                key: key.to_string(),
                payload: payload.to_string(),
                appended_at: Utc::now(),
            });
            p.next_offset += 1;
            offset
        };
        self.signals.advance(partition, offset + 1);
        Ok((partition, offset))
    }

    async fn read(&self, partition: u32, from: u64, max: usize) -> PipelineResult<Vec<StreamRecord>> {
        let Some(p) = self.partition(partition) else {
            return Ok(Vec::new());
        };
        let p = p.lock().unwrap();
        Ok(p.records
            .iter()
            .filter(|r| r.offset >= from)
            .take(max)
            .cloned()
            .collect())
    }

    async fn end_offset(&self, partition: u32) -> PipelineResult<u64> {
        Ok(self
            .partition(partition)
            .map(|p| p.lock().unwrap().next_offset)
            .unwrap_or(0))
    }

    async fn start_offset(&self, partition: u32) -> PipelineResult<u64> {
        Ok(self
            .partition(partition)
            .map(|p| {
                let p = p.lock().unwrap();
                p.records.front().map(|r| r.offset).unwrap_or(p.next_offset)
            })
            .unwrap_or(0))
    }

    async fn trim_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64> {
        let mut removed = 0u64;
        for p in &self.partitions {
            let mut p = p.lock().unwrap();
            while p.records.front().is_some_and(|r| r.appended_at < cutoff) {
                p.records.pop_front();
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn wait_for_data(&self, partition: u32, from: u64, timeout: Duration) {
        self.signals.wait(partition, from, timeout).await
    }
}
