//! A subscriber's view of one thread: backlog first, then live frames.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, warn};

use crate::log::{EventFrame, EventLog};

/// An ordered, duplicate-free feed of a thread's events.
///
/// Frames with a message id at or below the last delivered id are
/// skipped. If the live channel overflows, missed frames are read back
/// from the durable log.
pub struct Subscription {
    thread_id: String,
    backlog: VecDeque<EventFrame>,
    live: broadcast::Receiver<Arc<EventFrame>>,
    last_id: u64,
    log: Option<Arc<dyn EventLog>>,
    needs_refill: bool,
}

impl Subscription {
    pub(crate) fn new(
        thread_id: &str,
        backlog: Vec<EventFrame>,
        live: broadcast::Receiver<Arc<EventFrame>>,
        last_id: u64,
        log: Option<Arc<dyn EventLog>>,
    ) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            backlog: backlog.into(),
            live,
            last_id,
            log,
            needs_refill: false,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Highest message id delivered so far.
    pub fn last_message_id(&self) -> u64 {
        self.last_id
    }

    /// Wait for the next frame. Returns `None` once the thread's channel
    /// is closed.
    ///
    /// Cancel safe: a refill interrupted by dropping the future is retried
    /// on the next call.
    pub async fn recv(&mut self) -> Option<EventFrame> {
        loop {
            if self.needs_refill {
                self.refill().await;
            }
            if let Some(frame) = self.backlog.pop_front() {
                if let Some(frame) = self.accept(frame) {
                    return Some(frame);
                }
                continue;
            }

            match self.live.recv().await {
                Ok(frame) => {
                    if let Some(frame) = self.accept((*frame).clone()) {
                        return Some(frame);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(
                        "Subscriber on thread {} lagged by {} events; refilling from log",
                        self.thread_id, missed
                    );
                    self.needs_refill = true;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Consume into a `Stream` of frames.
    pub fn into_stream(self) -> impl Stream<Item = EventFrame> + Send {
        stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|frame| (frame, sub))
        })
    }

    fn accept(&mut self, frame: EventFrame) -> Option<EventFrame> {
        match frame.message_id {
            Some(id) if id <= self.last_id => None,
            Some(id) => {
                self.last_id = id;
                Some(frame)
            }
            // Degraded delivery carries no id
            None => Some(frame),
        }
    }

    async fn refill(&mut self) {
        let Some(log) = &self.log else {
            self.needs_refill = false;
            return;
        };
        let entries = log.read_after(&self.thread_id, Some(self.last_id)).await;
        self.needs_refill = false;
        match entries {
            Ok(entries) => self.backlog.extend(
                entries
                    .into_iter()
                    .map(|entry| EventFrame::from_logged(entry, false)),
            ),
            Err(e) => error!(
                "Failed to refill thread {} from event log: {}",
                self.thread_id, e
            ),
        }
    }
}
