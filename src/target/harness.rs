//! Pipe handler connecting the target's test harness to the data channel.
//!
//! The harness inside the target speaks a two-message protocol over the pipe:
//! an empty send starts a test and is answered with the pending fuzzer input,
//! a non-empty send ends it. The payload of the latter is kept as the run's
//! output and the run is stopped.

use super::StopHandle;
use crate::{
    dio::{DataChannel, RecordKind},
    transport::PipeHandler,
};
use std::sync::Arc;

pub struct DioHandler {
    dio: Arc<DataChannel>,
    stop: StopHandle,
    /// The response to an end-of-test message stays empty.
    skip_write: bool,
    tests: u64,
}

impl DioHandler {
    pub fn new(dio: Arc<DataChannel>, stop: StopHandle) -> Self {
        Self {
            dio,
            stop,
            skip_write: false,
            tests: 0,
        }
    }

    /// Completed tests.
    pub fn tests(&self) -> u64 {
        self.tests
    }
}

impl PipeHandler for DioHandler {
    fn read(&mut self, magic: u64, payload: &[u8]) {
        if payload.is_empty() {
            log::trace!("start of test on {:#018x}", magic);
            return;
        }
        log::trace!("end of test on {:#018x}, {} bytes", magic, payload.len());
        if let Err(e) = self.dio.put(RecordKind::Output, payload) {
            log::warn!("target output dropped: {}", e);
        }
        self.tests += 1;
        self.skip_write = true;
        self.stop.request();
    }

    fn write(&mut self, _magic: u64, out: &mut [u8]) -> usize {
        if self.skip_write {
            self.skip_write = false;
            return 0;
        }
        match self.dio.copy_if(RecordKind::Input, out) {
            Ok(Some(n)) => n,
            Ok(None) => 0,
            Err(e) => {
                log::warn!("no input for target: {}", e);
                0
            }
        }
    }
}
