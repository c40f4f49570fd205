//! Per-channel write flow control.
//!
//! Writes go straight to the socket writer while the channel is writable.
//! Once the bytes in flight reach the high water mark the channel stops
//! being writable and further writes are parked here, in order, until the
//! in-flight total drains below the low water mark.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::promise::Promise;

pub(crate) struct WriteRequest {
    pub data: Bytes,
    pub promise: Box<dyn Promise<bool>>,
}

pub(crate) enum Submitted {
    /// Hand the write to the socket writer now.
    Start(WriteRequest),
    Parked,
    /// The channel has closed. The request is handed back to be failed.
    Closed(WriteRequest),
}

/// Outcome of a finished write.
pub(crate) struct WriteCompletion {
    /// Parked writes remain, so the caller should pause.
    pub backlog: bool,
    /// Parked write to hand to the writer next.
    pub next: Option<WriteRequest>,
}

pub(crate) struct WriteQueue {
    parked: VecDeque<WriteRequest>,
    in_flight: usize,
    writable: bool,
    closed: bool,
    low_water_mark: usize,
    high_water_mark: usize,
}

impl WriteQueue {
    pub fn new(low_water_mark: usize, high_water_mark: usize) -> Self {
        Self {
            parked: VecDeque::new(),
            in_flight: 0,
            writable: true,
            closed: false,
            low_water_mark: low_water_mark.min(high_water_mark),
            high_water_mark,
        }
    }

    pub fn submit(&mut self, request: WriteRequest) -> Submitted {
        if self.closed {
            Submitted::Closed(request)
        } else if self.writable && self.parked.is_empty() {
            Submitted::Start(self.start(request))
        } else {
            self.parked.push_back(request);
            Submitted::Parked
        }
    }

    /// Record that a started write of `written` bytes finished.
    pub fn complete(&mut self, written: usize) -> WriteCompletion {
        self.in_flight = self.in_flight.saturating_sub(written);
        if !self.writable && !self.closed && self.in_flight <= self.low_water_mark {
            self.writable = true;
        }
        let next = if self.writable {
            self.parked.pop_front().map(|request| self.start(request))
        } else {
            None
        };
        WriteCompletion {
            backlog: !self.parked.is_empty() || !self.writable,
            next,
        }
    }

    /// Refuse further writes and hand back every parked one.
    pub fn close(&mut self) -> Vec<WriteRequest> {
        self.closed = true;
        self.writable = false;
        self.parked.drain(..).collect()
    }

    #[cfg(test)]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    #[cfg(test)]
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    fn start(&mut self, request: WriteRequest) -> WriteRequest {
        self.in_flight += request.data.len();
        if self.in_flight >= self.high_water_mark {
            self.writable = false;
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::OncePromise;

    fn started(submitted: Submitted) -> bool {
        matches!(submitted, Submitted::Start(_))
    }

    fn request(len: usize) -> WriteRequest {
        WriteRequest {
            data: Bytes::from(vec![len as u8; len]),
            promise: OncePromise::new(|_: crate::error::Result<bool>| {}).boxed(),
        }
    }

    #[test]
    fn test_writes_pass_through_while_writable() {
        let mut queue = WriteQueue::new(4, 10);
        assert!(started(queue.submit(request(3))));
        assert!(started(queue.submit(request(3))));
        assert!(queue.is_writable());

        let done = queue.complete(3);
        assert!(!done.backlog);
        assert!(done.next.is_none());
    }

    #[test]
    fn test_parked_writes_flush_in_order() {
        let mut queue = WriteQueue::new(2, 10);
        assert!(started(queue.submit(request(10))));
        assert!(!queue.is_writable());

        assert!(matches!(queue.submit(request(1)), Submitted::Parked));
        assert!(matches!(queue.submit(request(2)), Submitted::Parked));
        assert!(matches!(queue.submit(request(3)), Submitted::Parked));
        assert_eq!(queue.parked(), 3);

        let done = queue.complete(10);
        assert!(done.backlog);
        assert_eq!(done.next.unwrap().data.len(), 1);

        let done = queue.complete(1);
        assert_eq!(done.next.unwrap().data.len(), 2);

        let done = queue.complete(2);
        assert!(!done.backlog);
        assert_eq!(done.next.unwrap().data.len(), 3);
        assert_eq!(queue.parked(), 0);
    }

    #[test]
    fn test_stays_paused_above_low_water_mark() {
        let mut queue = WriteQueue::new(2, 8);
        assert!(started(queue.submit(request(5))));
        assert!(started(queue.submit(request(5))));
        assert!(matches!(queue.submit(request(1)), Submitted::Parked));

        let done = queue.complete(5);
        assert!(done.next.is_none());
        assert!(done.backlog);

        let done = queue.complete(5);
        assert_eq!(done.next.unwrap().data.len(), 1);
    }

    #[test]
    fn test_new_writes_queue_behind_parked_ones() {
        let mut queue = WriteQueue::new(0, 4);
        assert!(started(queue.submit(request(4))));
        assert!(matches!(queue.submit(request(1)), Submitted::Parked));

        let done = queue.complete(4);
        let first = done.next.unwrap();
        assert_eq!(first.data.len(), 1);
        assert!(started(queue.submit(request(2))));
        assert_eq!(queue.close().len(), 0);
    }

    #[test]
    fn test_close_hands_back_parked_and_refuses_new() {
        let mut queue = WriteQueue::new(0, 1);
        assert!(started(queue.submit(request(1))));
        assert!(matches!(queue.submit(request(2)), Submitted::Parked));

        let parked = queue.close();
        assert_eq!(parked.len(), 1);
        assert!(matches!(queue.submit(request(3)), Submitted::Closed(_)));
        assert!(queue.complete(1).next.is_none());
    }
}
