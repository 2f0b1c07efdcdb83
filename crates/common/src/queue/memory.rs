use super::{Delivery, TaskEnvelope, TaskQueue};
use crate::errors::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct Lane {
    /// (priority, sequence) -> envelope
    ready: BTreeMap<(u8, u64), TaskEnvelope>,
    delayed: Vec<(Instant, TaskEnvelope)>,
    in_flight: HashMap<String, (Instant, TaskEnvelope)>,
}

/// Process-local queue with the same delivery semantics as [`super::RedisQueue`]
pub struct MemoryQueue {
    lanes: Mutex<HashMap<String, Lane>>,
    sequence: Mutex<u64>,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            sequence: Mutex::new(0),
            visibility_timeout,
        }
    }

    /// Jobs waiting on `queue` (ready or delayed), in no particular order
    pub fn pending(&self, queue: &str) -> Vec<TaskEnvelope> {
        let lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        lanes
            .get(queue)
            .map(|lane| {
                lane.ready
                    .values()
                    .cloned()
                    .chain(lane.delayed.iter().map(|(_, e)| e.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn in_flight(&self, queue: &str) -> usize {
        let lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        lanes.get(queue).map(|l| l.in_flight.len()).unwrap_or(0)
    }

    fn next_sequence(&self) -> u64 {
        let mut seq = self.sequence.lock().unwrap_or_else(|p| p.into_inner());
        *seq += 1;
        *seq
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(360))
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, envelope: TaskEnvelope, countdown: Duration) -> Result<String> {
        let job_id = envelope.job_id.clone();
        let seq = self.next_sequence();
        let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        let lane = lanes.entry(envelope.queue.clone()).or_default();
        if countdown.is_zero() {
            lane.ready.insert((envelope.priority, seq), envelope);
        } else {
            lane.delayed.push((Instant::now() + countdown, envelope));
        }
        Ok(job_id)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Delivery>> {
        let now = Instant::now();
        let mut promoted = Vec::new();
        let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        let Some(lane) = lanes.get_mut(queue) else {
            return Ok(None);
        };

        let (due, waiting): (Vec<_>, Vec<_>) =
            lane.delayed.drain(..).partition(|(at, _)| *at <= now);
        lane.delayed = waiting;
        promoted.extend(due.into_iter().map(|(_, e)| e));

        let expired: Vec<String> = lane
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some((_, envelope)) = lane.in_flight.remove(&id) {
                promoted.push(envelope);
            }
        }

        for envelope in promoted {
            let seq = self.next_sequence();
            lane.ready.insert((envelope.priority, seq), envelope);
        }

        let Some(key) = lane.ready.keys().next().copied() else {
            return Ok(None);
        };
        let Some(envelope) = lane.ready.remove(&key) else {
            return Ok(None);
        };
        lane.in_flight.insert(
            envelope.job_id.clone(),
            (now + self.visibility_timeout, envelope.clone()),
        );
        Ok(Some(Delivery { envelope }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(lane) = lanes.get_mut(&delivery.envelope.queue) {
            lane.in_flight.remove(delivery.job_id());
        }
        Ok(())
    }

    async fn defer(&self, delivery: &Delivery, countdown: Duration) -> Result<bool> {
        let seq = self.next_sequence();
        let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        let Some(lane) = lanes.get_mut(&delivery.envelope.queue) else {
            return Ok(false);
        };
        let Some((_, envelope)) = lane.in_flight.remove(delivery.job_id()) else {
            return Ok(false);
        };
        if countdown.is_zero() {
            lane.ready.insert((envelope.priority, seq), envelope);
        } else {
            lane.delayed.push((Instant::now() + countdown, envelope));
        }
        Ok(true)
    }

    async fn revoke(&self, queue: &str, job_id: &str) -> Result<bool> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        let Some(lane) = lanes.get_mut(queue) else {
            return Ok(false);
        };
        let before = lane.ready.len() + lane.delayed.len() + lane.in_flight.len();
        lane.ready.retain(|_, e| e.job_id != job_id);
        lane.delayed.retain(|(_, e)| e.job_id != job_id);
        lane.in_flight.remove(job_id);
        Ok(lane.ready.len() + lane.delayed.len() + lane.in_flight.len() < before)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(priority: u8) -> TaskEnvelope {
        TaskEnvelope::new("extraction.process_document", "ocr", priority, &json!({})).unwrap()
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = MemoryQueue::default();
        let sweep = queue.enqueue(envelope(6), Duration::ZERO).await.unwrap();
        let first = queue.enqueue(envelope(0), Duration::ZERO).await.unwrap();
        let second = queue.enqueue(envelope(0), Duration::ZERO).await.unwrap();

        let order: Vec<String> = [
            queue.dequeue("ocr").await.unwrap().unwrap(),
            queue.dequeue("ocr").await.unwrap().unwrap(),
            queue.dequeue("ocr").await.unwrap().unwrap(),
        ]
        .iter()
        .map(|d| d.job_id().to_string())
        .collect();
        assert_eq!(order, vec![first, second, sweep]);
        assert!(queue.dequeue("ocr").await.unwrap().is_none());
        assert!(queue.dequeue("default").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_delays_visibility() {
        let queue = MemoryQueue::default();
        queue.enqueue(envelope(0), Duration::from_secs(30)).await.unwrap();
        assert!(queue.dequeue("ocr").await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(queue.dequeue("ocr").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_job_is_redelivered() {
        let queue = MemoryQueue::new(Duration::from_secs(10));
        let id = queue.enqueue(envelope(0), Duration::ZERO).await.unwrap();
        let first = queue.dequeue("ocr").await.unwrap().unwrap();
        assert!(queue.dequeue("ocr").await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        let again = queue.dequeue("ocr").await.unwrap().unwrap();
        assert_eq!(again.job_id(), id);
        queue.ack(&first).await.unwrap();
        assert_eq!(queue.in_flight("ocr"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_job_keeps_its_id() {
        let queue = MemoryQueue::default();
        let id = queue.enqueue(envelope(3), Duration::ZERO).await.unwrap();
        let delivery = queue.dequeue("ocr").await.unwrap().unwrap();

        assert!(queue.defer(&delivery, Duration::from_secs(5)).await.unwrap());
        assert_eq!(queue.in_flight("ocr"), 0);
        assert!(queue.dequeue("ocr").await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        let again = queue.dequeue("ocr").await.unwrap().unwrap();
        assert_eq!(again.job_id(), id);
    }

    #[tokio::test]
    async fn test_defer_of_revoked_job_is_noop() {
        let queue = MemoryQueue::default();
        let id = queue.enqueue(envelope(0), Duration::ZERO).await.unwrap();
        let delivery = queue.dequeue("ocr").await.unwrap().unwrap();
        queue.revoke("ocr", &id).await.unwrap();

        assert!(!queue.defer(&delivery, Duration::ZERO).await.unwrap());
        assert!(queue.pending("ocr").is_empty());
    }

    #[tokio::test]
    async fn test_revoke_pending_job() {
        let queue = MemoryQueue::default();
        let id = queue.enqueue(envelope(3), Duration::ZERO).await.unwrap();
        assert!(queue.revoke("ocr", &id).await.unwrap());
        assert!(!queue.revoke("ocr", &id).await.unwrap());
        assert!(queue.pending("ocr").is_empty());
    }
}
