//! Worker extension plumbing.
//!
//! Two rings in opposite directions: requests go from the audio thread to the
//! worker, responses come back to the audio thread. Each ring has exactly one
//! producer and one consumer.

use super::descriptor::{Lv2Status, Lv2Worker};
use cadenza_core::{byte_ring, RingReader, RingWriter};
use parking_lot::Mutex;
use std::sync::Arc;

/// Schedule handle given to the plugin; called from `run()`.
#[derive(Clone)]
pub struct WorkerSchedule {
    requests: Arc<Mutex<RingWriter>>,
}

impl std::fmt::Debug for WorkerSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSchedule").finish_non_exhaustive()
    }
}

impl WorkerSchedule {
    /// Queue a work request. Never blocks.
    pub fn schedule(&self, data: &[u8]) -> Lv2Status {
        let Some(mut requests) = self.requests.try_lock() else {
            return Lv2Status::NoSpace;
        };
        let queued = requests.write_u32(data.len() as u32)
            && requests.write_bytes(data)
            && requests.commit_write();
        if !queued {
            requests.discard();
            tracing::error!("Worker input buffer full, at least 1 message lost");
            return Lv2Status::NoSpace;
        }
        Lv2Status::Success
    }
}

/// Read one `size + bytes` message into `scratch`.
fn read_message(reader: &mut RingReader, scratch: &mut Vec<u8>) -> bool {
    let Some(size) = reader.read_u32() else {
        return false;
    };
    scratch.resize(size as usize, 0);
    if !reader.read_bytes(scratch) {
        tracing::error!("Worker ring holds a truncated message, dropping queue");
        reader.clear();
        return false;
    }
    true
}

/// Worker-side ends of both rings, waiting for the worker object.
pub struct WorkerQueues {
    requests: RingReader,
    responses: RingWriter,
}

impl WorkerQueues {
    pub fn attach(self, worker: Box<dyn Lv2Worker>) -> WorkerHost {
        WorkerHost {
            worker,
            requests: self.requests,
            responses: self.responses,
            scratch: Vec::new(),
        }
    }
}

/// Runs scheduled work off the audio thread.
pub struct WorkerHost {
    worker: Box<dyn Lv2Worker>,
    requests: RingReader,
    responses: RingWriter,
    scratch: Vec<u8>,
}

impl WorkerHost {
    /// Run every pending request. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut count = 0;
        while read_message(&mut self.requests, &mut self.scratch) {
            let responses = &mut self.responses;
            let mut respond = |data: &[u8]| {
                let queued = responses.write_u32(data.len() as u32)
                    && responses.write_bytes(data)
                    && responses.commit_write();
                if !queued {
                    responses.discard();
                    tracing::error!("Worker response buffer full, at least 1 message lost");
                }
                queued
            };
            let data = std::mem::take(&mut self.scratch);
            let status = self.worker.work(&mut respond, &data);
            if status != Lv2Status::Success {
                tracing::warn!("Worker job returned {:?}", status);
            }
            self.scratch = data;
            count += 1;
        }
        count
    }
}

/// Audio-thread end of the response ring.
pub struct WorkerResponses {
    reader: RingReader,
    scratch: Vec<u8>,
}

impl WorkerResponses {
    /// Hand every queued response to `f`.
    pub fn drain(&mut self, mut f: impl FnMut(&[u8])) {
        while read_message(&mut self.reader, &mut self.scratch) {
            f(&self.scratch);
        }
    }
}

/// Create the request/response rings for one plugin.
pub fn worker_rings(capacity: usize) -> (WorkerSchedule, WorkerQueues, WorkerResponses) {
    let (request_writer, request_reader) = byte_ring(capacity);
    let (response_writer, response_reader) = byte_ring(capacity);
    (
        WorkerSchedule {
            requests: Arc::new(Mutex::new(request_writer)),
        },
        WorkerQueues {
            requests: request_reader,
            responses: response_writer,
        },
        WorkerResponses {
            reader: response_reader,
            scratch: Vec::with_capacity(capacity),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl Lv2Worker for Doubler {
        fn work(&mut self, respond: &mut dyn FnMut(&[u8]) -> bool, data: &[u8]) -> Lv2Status {
            let doubled: Vec<u8> = data.iter().map(|b| b * 2).collect();
            respond(&doubled);
            Lv2Status::Success
        }
    }

    #[test]
    fn test_request_response_flow() {
        let (schedule, queues, mut responses) = worker_rings(256);
        let mut host = queues.attach(Box::new(Doubler));

        assert_eq!(schedule.schedule(&[1, 2, 3]), Lv2Status::Success);
        assert_eq!(schedule.schedule(&[4]), Lv2Status::Success);
        assert_eq!(host.run_pending(), 2);

        let mut seen = Vec::new();
        responses.drain(|data| seen.push(data.to_vec()));
        assert_eq!(seen, vec![vec![2, 4, 6], vec![8]]);
    }

    #[test]
    fn test_full_ring_drops_request() {
        let (schedule, _queues, _responses) = worker_rings(16);
        assert_eq!(schedule.schedule(&[0; 8]), Lv2Status::Success);
        assert_eq!(schedule.schedule(&[0; 8]), Lv2Status::NoSpace);
    }
}
