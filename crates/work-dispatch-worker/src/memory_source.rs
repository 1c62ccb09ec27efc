use crate::error::SourceError;
use crate::source::{Delivery, Receipt, WorkItemSource};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use work_dispatch_core::{MessageId, Priority, WorkItem};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// A queued body with its delivery ordering
#[derive(Clone)]
struct Entry {
    seq: u64,
    priority: Priority,
    message_id: MessageId,
    body: Bytes,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first
        match self.priority.cmp(&other.priority) {
            // Within same priority, earlier pushes first (FIFO)
            Ordering::Equal => other.seq.cmp(&self.seq),
            ordering => ordering,
        }
    }
}

struct InFlight {
    entry: Entry,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Entry>,
    in_flight: HashMap<String, InFlight>,
    next_seq: u64,
    next_receipt: u64,
    acked: Vec<MessageId>,
    failed: Vec<MessageId>,
    redelivered: u64,
    closed: bool,
}

/// In-process queue for local runs and tests.
///
/// Delivers by priority, FIFO within a priority. A delivery that is neither
/// acked nor failed within the visibility timeout goes back on the queue and
/// its old receipt stops being accepted. Failed items are recorded, not
/// redelivered.
pub struct MemoryWorkSource {
    name: String,
    visibility_timeout: Duration,
    state: Mutex<State>,
}

impl MemoryWorkSource {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryWorkSource {
            name: name.into(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Queue an item in its JSON form
    pub fn push(&self, item: &WorkItem) -> work_dispatch_core::Result<()> {
        let body = Bytes::from(item.to_json()?);
        self.push_raw(item.priority, item.message_id.clone(), body);
        Ok(())
    }

    /// Queue a body as is, without checking that it decodes
    pub fn push_raw(&self, priority: Priority, message_id: impl Into<MessageId>, body: Bytes) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry {
            seq,
            priority,
            message_id: message_id.into(),
            body,
        });
    }

    /// Once closed and drained, `next` reports an interruption instead of
    /// waiting for more work
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Items waiting for delivery
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn acked(&self) -> Vec<MessageId> {
        self.state.lock().acked.clone()
    }

    pub fn failed(&self) -> Vec<MessageId> {
        self.state.lock().failed.clone()
    }

    /// Deliveries that timed out and were queued again
    pub fn redelivered(&self) -> u64 {
        self.state.lock().redelivered
    }

    /// Count of queued items by priority tier (high, normal, low)
    pub fn count_by_priority(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        let mut high = 0;
        let mut normal = 0;
        let mut low = 0;

        for entry in state.heap.iter() {
            match entry.priority {
                Priority::High => high += 1,
                Priority::Normal => normal += 1,
                Priority::Low => low += 1,
            }
        }

        (high, normal, low)
    }

    fn requeue_expired(state: &mut State, now: Instant) {
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.deadline <= now)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(flight) = state.in_flight.remove(&token) {
                warn!(
                    "Delivery {} of message {} timed out, requeueing",
                    token, flight.entry.message_id
                );
                state.redelivered += 1;
                state.heap.push(flight.entry);
            }
        }
    }

    fn settle(&self, receipt: Receipt) -> Result<Entry, SourceError> {
        let mut state = self.state.lock();
        Self::requeue_expired(&mut state, Instant::now());
        state
            .in_flight
            .remove(receipt.token())
            .map(|flight| flight.entry)
            .ok_or_else(|| SourceError::UnknownReceipt(receipt.token().to_string()))
    }
}

#[async_trait]
impl WorkItemSource for MemoryWorkSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next(&self) -> Result<Option<Delivery>, SourceError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        Self::requeue_expired(&mut state, now);

        let Some(entry) = state.heap.pop() else {
            if state.closed && state.in_flight.is_empty() {
                return Err(SourceError::Interrupted);
            }
            return Ok(None);
        };

        let token = format!("{}-{}", self.name, state.next_receipt);
        state.next_receipt += 1;
        debug!("Delivering message {} as {}", entry.message_id, token);

        let delivery = Delivery {
            receipt: Receipt::new(token.clone()),
            message_id: Some(entry.message_id.clone()),
            body: entry.body.clone(),
        };
        state.in_flight.insert(
            token,
            InFlight {
                entry,
                deadline: now + self.visibility_timeout,
            },
        );
        Ok(Some(delivery))
    }

    async fn ack(&self, receipt: Receipt) -> Result<(), SourceError> {
        let entry = self.settle(receipt)?;
        self.state.lock().acked.push(entry.message_id);
        Ok(())
    }

    async fn fail(&self, receipt: Receipt) -> Result<(), SourceError> {
        let entry = self.settle(receipt)?;
        self.state.lock().failed.push(entry.message_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, priority: Priority) -> WorkItem {
        WorkItem::builder()
            .message_id(id)
            .vertex("v1")
            .priority(priority)
            .build()
            .unwrap()
    }

    async fn next_id(source: &MemoryWorkSource) -> (MessageId, Receipt) {
        let delivery = source.next().await.unwrap().unwrap();
        (delivery.message_id.unwrap(), delivery.receipt)
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let source = MemoryWorkSource::new("q");
        source.push(&item("low", Priority::Low)).unwrap();
        source.push(&item("normal-1", Priority::Normal)).unwrap();
        source.push(&item("high", Priority::High)).unwrap();
        source.push(&item("normal-2", Priority::Normal)).unwrap();
        assert_eq!(source.count_by_priority(), (1, 2, 1));

        let mut order = Vec::new();
        while let Some(delivery) = source.next().await.unwrap() {
            order.push(delivery.message_id.unwrap());
            source.ack(delivery.receipt).await.unwrap();
        }
        assert_eq!(order, vec!["high", "normal-1", "normal-2", "low"]);
        assert_eq!(source.acked().len(), 4);
    }

    #[tokio::test]
    async fn test_receipt_settles_once() {
        let source = MemoryWorkSource::new("q");
        source.push(&item("a", Priority::Normal)).unwrap();

        let (_, receipt) = next_id(&source).await;
        let replay = Receipt::new(receipt.token());
        source.fail(receipt).await.unwrap();

        let err = source.ack(replay).await.unwrap_err();
        assert!(matches!(err, SourceError::UnknownReceipt(_)));
        assert_eq!(source.failed(), vec!["a".to_string()]);
        assert!(source.acked().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_timeout_redelivers() {
        let source = MemoryWorkSource::new("q").with_visibility_timeout(Duration::from_secs(5));
        source.push(&item("slow", Priority::Normal)).unwrap();

        let (_, stale) = next_id(&source).await;
        assert!(source.next().await.unwrap().is_none());
        assert_eq!(source.in_flight(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        let (id, fresh) = next_id(&source).await;
        assert_eq!(id, "slow");
        assert_eq!(source.redelivered(), 1);

        assert!(matches!(
            source.ack(stale).await,
            Err(SourceError::UnknownReceipt(_))
        ));
        source.ack(fresh).await.unwrap();
        assert_eq!(source.acked(), vec!["slow".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_source_interrupts_once_drained() {
        let source = MemoryWorkSource::new("q");
        source.push(&item("a", Priority::Normal)).unwrap();
        source.close();

        let (_, receipt) = next_id(&source).await;
        // Still one delivery outstanding
        assert!(source.next().await.unwrap().is_none());
        source.ack(receipt).await.unwrap();
        assert!(matches!(source.next().await, Err(SourceError::Interrupted)));
    }
}
