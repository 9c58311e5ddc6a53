//! Outbound frame scheduling.
//!
//! Eight FIFO lanes, lane 0 first. Any number of producers push; the send loop
//! is the only consumer.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

use crate::frame::Frame;

/// Number of priority lanes (SPDY/3 priorities 0..=7).
pub const LANES: usize = 8;

#[derive(Debug, Default)]
struct Lanes {
    lanes: [VecDeque<Frame>; LANES],
    closed: bool,
}

#[derive(Debug, Default)]
pub struct PriorityQueue {
    inner: Mutex<Lanes>,
    notify: Notify,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `frame` on lane `priority` (clamped to 7).
    ///
    /// Gives the frame back once the queue is closed.
    pub fn push(&self, priority: u8, frame: Frame) -> Result<(), Frame> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.closed {
                return Err(frame);
            }
            let lane = usize::from(priority).min(LANES - 1);
            inner.lanes[lane].push_back(frame);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Like `push`, but also gives the frame back when its lane already
    /// holds `cap` frames.
    pub fn push_bounded(&self, priority: u8, frame: Frame, cap: usize) -> Result<(), Frame> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let lane = usize::from(priority).min(LANES - 1);
            if inner.closed || inner.lanes[lane].len() >= cap {
                return Err(frame);
            }
            inner.lanes[lane].push_back(frame);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Head of the highest-priority non-empty lane.
    pub fn try_pop(&self) -> Option<Frame> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.lanes.iter_mut().find_map(|lane| lane.pop_front())
    }

    /// Wait for the next frame. Frames queued before `close` are still
    /// returned; `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(frame) = inner.lanes.iter_mut().find_map(|lane| lane.pop_front()) {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuse further pushes and wake the consumer.
    pub fn close(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Frames currently queued across all lanes.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
