//! Abnormal exit classification.
//!
//! Collaborators register breakpoints that mark an abnormal end of a run,
//! each with the message reported to the fuzzer when it is hit.

use super::StopHandle;
use crate::dio::{DataChannel, DioError, RecordKind};
use std::{collections::BTreeMap, fmt::Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExitError {
    #[error("breakpoint {0} already registered")]
    AlreadyRegistered(u64),
}

#[derive(Debug, Default, Clone)]
pub struct ExitDescriptors {
    exits: BTreeMap<u64, String>,
}

impl ExitDescriptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, bp: u64, msg: impl Into<String>) -> Result<(), ExitError> {
        if self.exits.contains_key(&bp) {
            return Err(ExitError::AlreadyRegistered(bp));
        }
        self.exits.insert(bp, msg.into());
        Ok(())
    }

    pub fn remove(&mut self, bp: u64) -> Option<String> {
        self.exits.remove(&bp)
    }

    pub fn clear(&mut self) {
        self.exits.clear();
    }

    pub fn get(&self, bp: u64) -> Option<&str> {
        self.exits.get(&bp).map(|m| m.as_str())
    }

    pub fn len(&self) -> usize {
        self.exits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exits.is_empty()
    }

    /// Registered exits, ordered by breakpoint id.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> + '_ {
        self.exits.iter().map(|(bp, m)| (*bp, m.as_str()))
    }

    /// One `BPID <id> : '<msg>'` line per exit.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (bp, msg) in self.iter() {
            let _ = writeln!(out, "BPID {} : '{}'", bp, msg);
        }
        out
    }

    /// Breakpoint hit: reports the exit message and stops the run. Returns
    /// false for breakpoints that are not exits.
    pub fn on_breakpoint(
        &self,
        bp: u64,
        dio: &DataChannel,
        stop: &StopHandle,
    ) -> Result<bool, DioError> {
        let msg = match self.exits.get(&bp) {
            Some(msg) => msg,
            None => return Ok(false),
        };
        log::debug!("abnormal exit at breakpoint {}: {}", bp, msg);
        dio.put(RecordKind::AbnormalExit, msg.as_bytes())?;
        stop.request();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_and_unique() {
        let mut exits = ExitDescriptors::new();
        exits.add(7, "double free").unwrap();
        exits.add(2, "panic").unwrap();
        assert!(matches!(
            exits.add(7, "other"),
            Err(ExitError::AlreadyRegistered(7))
        ));
        assert_eq!(exits.get(7), Some("double free"));
        assert_eq!(
            exits.describe(),
            "BPID 2 : 'panic'\nBPID 7 : 'double free'\n"
        );

        assert_eq!(exits.remove(2).as_deref(), Some("panic"));
        assert_eq!(exits.len(), 1);
        exits.clear();
        assert!(exits.is_empty());
        assert_eq!(exits.describe(), "");
    }

    #[test]
    fn breakpoint_reports_exit() {
        let mut exits = ExitDescriptors::new();
        exits.add(3, "assert failed").unwrap();
        let dio = DataChannel::local(64);
        let stop = StopHandle::new();

        assert!(!exits.on_breakpoint(4, &dio, &stop).unwrap());
        assert!(!stop.is_requested());
        assert_eq!(dio.kind().unwrap(), RecordKind::Empty);

        assert!(exits.on_breakpoint(3, &dio, &stop).unwrap());
        assert!(stop.is_requested());
        let rec = dio.get().unwrap();
        assert_eq!(rec.kind, RecordKind::AbnormalExit);
        assert_eq!(rec.data, b"assert failed");
    }
}
