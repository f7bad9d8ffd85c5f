//! Priority lanes and the type-erased requests queued in them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::window::RateLimitWindow;
use crate::errors::MarketDataError;
use crate::models::ProviderId;

/// Dispatch priority. Lower lanes are never serviced while a higher lane
/// of the same provider holds work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Latency-sensitive single lookups
    High,
    Medium,
    /// Bulk work (historical series)
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    fn lane(self) -> usize {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Type-erased unit of work owned by a queued request.
pub(crate) trait Job: Send {
    /// Run one attempt. On success the value is delivered to the caller.
    fn attempt(&self) -> BoxFuture<'static, Result<(), MarketDataError>>;

    /// Deliver a final failure to the caller.
    fn reject(&self, error: MarketDataError);

    /// The caller stopped waiting for the outcome.
    fn is_abandoned(&self) -> bool;
}

type Reply<T> = Arc<Mutex<Option<oneshot::Sender<Result<T, MarketDataError>>>>>;

fn take_sender<T>(reply: &Reply<T>) -> Option<oneshot::Sender<Result<T, MarketDataError>>> {
    reply
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

pub(crate) struct TypedJob<T> {
    call: Box<dyn Fn() -> BoxFuture<'static, Result<T, MarketDataError>> + Send + Sync>,
    reply: Reply<T>,
}

impl<T: Send + 'static> TypedJob<T> {
    pub(crate) fn new<F, Fut>(call: F) -> (Self, oneshot::Receiver<Result<T, MarketDataError>>)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, MarketDataError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = Self {
            call: Box::new(move || call().boxed()),
            reply: Arc::new(Mutex::new(Some(tx))),
        };
        (job, rx)
    }
}

impl<T: Send + 'static> Job for TypedJob<T> {
    fn attempt(&self) -> BoxFuture<'static, Result<(), MarketDataError>> {
        let call = (self.call)();
        let reply = Arc::clone(&self.reply);
        async move {
            let value = call.await?;
            if let Some(tx) = take_sender(&reply) {
                let _ = tx.send(Ok(value));
            }
            Ok(())
        }
        .boxed()
    }

    fn reject(&self, error: MarketDataError) {
        if let Some(tx) = take_sender(&self.reply) {
            let _ = tx.send(Err(error));
        }
    }

    fn is_abandoned(&self) -> bool {
        self.reply
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }
}

/// A request waiting in (or travelling between) dispatcher lanes.
pub(crate) struct QueuedRequest {
    pub provider: ProviderId,
    pub priority: Priority,
    pub label: String,
    pub enqueued_at: Instant,
    /// Global enqueue sequence; orders a lane, including after retries.
    pub seq: u64,
    pub attempts: u32,
    pub job: Box<dyn Job>,
}

/// Lanes and rate-limit window of one provider.
pub(crate) struct ProviderQueue {
    pub window: RateLimitWindow,
    lanes: [VecDeque<QueuedRequest>; 3],
}

impl ProviderQueue {
    pub fn new(window: RateLimitWindow) -> Self {
        Self {
            window,
            lanes: Default::default(),
        }
    }

    /// Insert keeping the lane ordered by enqueue sequence.
    pub fn push(&mut self, request: QueuedRequest) {
        let lane = &mut self.lanes[request.priority.lane()];
        match lane.back() {
            Some(last) if last.seq > request.seq => {
                let index = lane.partition_point(|queued| queued.seq < request.seq);
                lane.insert(index, request);
            }
            _ => lane.push_back(request),
        }
    }

    /// Highest priority with queued work.
    pub fn head_priority(&self) -> Option<Priority> {
        Priority::ALL
            .into_iter()
            .find(|priority| !self.lanes[priority.lane()].is_empty())
    }

    pub fn front(&self, priority: Priority) -> Option<&QueuedRequest> {
        self.lanes[priority.lane()].front()
    }

    pub fn pop(&mut self, priority: Priority) -> Option<QueuedRequest> {
        self.lanes[priority.lane()].pop_front()
    }

    pub fn queued(&self, priority: Priority) -> usize {
        self.lanes[priority.lane()].len()
    }

    pub fn drain(&mut self) -> Vec<QueuedRequest> {
        self.lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
    }
}
