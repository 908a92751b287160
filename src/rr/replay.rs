//! The record/replay state machine around the log: in record mode non-deterministic events
//! are appended; in replay mode they are consumed in order, with `n_exec` as the logical
//! clock and distinct outcomes on divergence.

use std::path::Path;

use log::{debug, info};

use crate::error::Error;
use crate::vcpu::VcpuSnapshot;

use super::log::{
    decode_snapshot, encode_snapshot, IntrRecord, IoRecord, LogTag, RrLog, StringIoRecord,
};

/// The execution mode with respect to the log.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RrMode {
    /// No log attached; devices are live.
    Off,
    /// Non-deterministic events are appended to the log.
    Record,
    /// Non-deterministic events come from the log.
    Replay,
}

/// How a run ended. The numeric values are the process exit codes of the original tool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    Normal = 0,
    PanicReproduced = 13,
    InsnCountMismatch = 14,
}

/// A replay event that has become due at the current `n_exec`.
#[derive(Clone, Debug)]
pub enum ReplayEvent {
    Interrupt(IntrRecord),
    Snapshot(VcpuSnapshot),
    Mrep,
    Panic,
    Exit,
}

/// The record/replay state.
pub struct RrState {
    log: Option<RrLog>,
    mode: RrMode,
    /// The next not-yet-due record, peeked during replay.
    pending: Option<(LogTag, Vec<u8>, u64)>,
    /// Log every block entry with a snapshot (divergence hunting).
    pub lockstep: bool,
}

impl RrState {
    pub fn new() -> Self {
        Self {
            log: None,
            mode: RrMode::Off,
            pending: None,
            lockstep: false,
        }
    }

    pub fn mode(&self) -> RrMode {
        self.mode
    }

    pub fn recording(&self) -> bool {
        self.mode == RrMode::Record
    }

    pub fn replaying(&self) -> bool {
        self.mode == RrMode::Replay
    }

    pub fn active(&self) -> bool {
        self.mode != RrMode::Off
    }

    /// Starts recording into a fresh log.
    pub fn start_record(&mut self, path: &Path) -> Result<(), Error> {
        info!("recording to {}", path.display());
        self.log = Some(RrLog::create(path)?);
        self.mode = RrMode::Record;
        self.pending = None;
        Ok(())
    }

    /// Starts replaying an existing log from its beginning.
    pub fn start_replay(&mut self, path: &Path) -> Result<(), Error> {
        info!("replaying {}", path.display());
        let mut log = RrLog::open(path)?;
        log.rewind()?;
        self.log = Some(log);
        self.mode = RrMode::Replay;
        self.pending = None;
        Ok(())
    }

    fn log_mut(&mut self) -> Result<&mut RrLog, Error> {
        self.log.as_mut().ok_or(Error::NoLog)
    }

    /// Direct access for the micro-replay controller's seeks.
    pub fn raw_log(&mut self) -> Option<&mut RrLog> {
        self.log.as_mut()
    }

    /// Swaps record for replay (micro-replay rollback) or back. The pending peek is dropped:
    /// the caller just sought the log.
    pub fn set_mode(&mut self, mode: RrMode) {
        debug!("rr mode {:?} -> {:?}", self.mode, mode);
        self.mode = mode;
        self.pending = None;
    }

    // Record-side append helpers. Each returns the record's starting offset.

    pub fn log_interrupt(
        &mut self,
        vector: u8,
        error_code: u32,
        n_exec: u64,
        eip: u32,
    ) -> Result<u64, Error> {
        let rec = IntrRecord {
            vector,
            error_code,
            n_exec,
            eip,
        };
        self.log_mut()?.write_record(LogTag::Intr, &rec.encode())
    }

    pub fn log_io(&mut self, tag: LogTag, rec: &IoRecord) -> Result<u64, Error> {
        debug_assert!(matches!(tag, LogTag::In | LogTag::Out));
        self.log_mut()?.write_record(tag, &rec.encode())
    }

    pub fn log_string_io(&mut self, tag: LogTag, rec: &StringIoRecord) -> Result<u64, Error> {
        debug_assert!(matches!(tag, LogTag::Ins | LogTag::Outs));
        self.log_mut()?.write_record(tag, &rec.encode())
    }

    pub fn log_snapshot(&mut self, snap: &VcpuSnapshot) -> Result<u64, Error> {
        self.log_mut()?.write_record(LogTag::Ms, &encode_snapshot(snap))
    }

    pub fn log_marker(&mut self, tag: LogTag) -> Result<u64, Error> {
        debug_assert!(matches!(tag, LogTag::Mrep | LogTag::Panic | LogTag::Exit));
        self.log_mut()?.write_record(tag, &[])
    }

    // Replay-side consumption.

    fn peek(&mut self) -> Result<Option<&(LogTag, Vec<u8>, u64)>, Error> {
        if self.pending.is_none() {
            self.pending = self.log_mut()?.read_record()?;
        }
        Ok(self.pending.as_ref())
    }

    /// The `n_exec` at which the next log record is due, if any.
    pub fn next_due(&mut self) -> Result<Option<u64>, Error> {
        let due = match self.peek()? {
            Some((tag, payload, _)) => match tag {
                LogTag::Intr => Some(IntrRecord::decode(payload)?.n_exec),
                LogTag::In | LogTag::Out => Some(IoRecord::decode(payload)?.n_exec),
                LogTag::Ins | LogTag::Outs => Some(StringIoRecord::decode(payload)?.n_exec),
                LogTag::Ms => Some(decode_snapshot(payload)?.n_exec),
                LogTag::Mrep | LogTag::Panic | LogTag::Exit => Some(0),
            },
            None => None,
        };
        Ok(due)
    }

    /// Consumes the next record if it is due at `n_exec`. Records due earlier than the
    /// current clock are a divergence (the event's instruction never retired here).
    pub fn poll_event(&mut self, n_exec: u64) -> Result<Option<ReplayEvent>, Error> {
        let due = match self.next_due()? {
            Some(d) => d,
            None => return Ok(None),
        };
        let (tag, payload, offset) = match self.peek()? {
            Some(p) => p.clone(),
            None => return Ok(None),
        };
        match tag {
            LogTag::Mrep | LogTag::Panic | LogTag::Exit => {}
            LogTag::In | LogTag::Out | LogTag::Ins | LogTag::Outs => {
                // Port I/O records are pulled by the in/out callouts when their instruction
                // executes; here they only bound the clock.
                if due < n_exec {
                    debug!(
                        "replay overshoot: io record at n_exec {:#x}, clock {:#x} (offset {:#x})",
                        due, n_exec, offset
                    );
                    return Err(Error::ReplayDivergence("n_exec overshoot"));
                }
                return Ok(None);
            }
            _ => {
                if due > n_exec {
                    return Ok(None);
                }
                if due < n_exec {
                    debug!(
                        "replay overshoot: record at n_exec {:#x}, clock {:#x} (offset {:#x})",
                        due, n_exec, offset
                    );
                    return Err(Error::ReplayDivergence("n_exec overshoot"));
                }
            }
        }
        self.pending = None;
        let event = match tag {
            LogTag::Intr => ReplayEvent::Interrupt(IntrRecord::decode(&payload)?),
            LogTag::Ms => ReplayEvent::Snapshot(decode_snapshot(&payload)?),
            LogTag::Mrep => ReplayEvent::Mrep,
            LogTag::Panic => ReplayEvent::Panic,
            LogTag::Exit => ReplayEvent::Exit,
            LogTag::In | LogTag::Out | LogTag::Ins | LogTag::Outs => unreachable!(),
        };
        Ok(Some(event))
    }

    /// Consumes the next record, requiring it to be the given I/O tag at the current clock.
    pub fn consume_io(&mut self, tag: LogTag, n_exec: u64) -> Result<(IoRecord, u64), Error> {
        let (t, payload, offset) = match self.peek()? {
            Some(p) => p.clone(),
            None => return Err(Error::TruncatedLog),
        };
        if t != tag {
            return Err(Error::ReplayDivergence("unexpected tag at io callout"));
        }
        let rec = IoRecord::decode(&payload)?;
        if rec.n_exec != n_exec {
            return Err(Error::ReplayDivergence("io record at wrong n_exec"));
        }
        self.pending = None;
        Ok((rec, offset))
    }

    /// String-I/O variant of [`RrState::consume_io`].
    pub fn consume_string_io(
        &mut self,
        tag: LogTag,
        n_exec: u64,
    ) -> Result<(StringIoRecord, u64), Error> {
        let (t, payload, offset) = match self.peek()? {
            Some(p) => p.clone(),
            None => return Err(Error::TruncatedLog),
        };
        if t != tag {
            return Err(Error::ReplayDivergence("unexpected tag at string io callout"));
        }
        let rec = StringIoRecord::decode(&payload)?;
        if rec.n_exec != n_exec {
            return Err(Error::ReplayDivergence("string io record at wrong n_exec"));
        }
        self.pending = None;
        Ok((rec, offset))
    }

    /// The current log position (next record to be read or written).
    pub fn tell(&mut self) -> Result<u64, Error> {
        // A pending peek means the cursor already advanced past it.
        let pos = self.log_mut()?.tell()?;
        Ok(pos)
    }
}

impl Default for RrState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_then_replay() -> (tempfile::TempDir, RrState) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rr.log");
        let mut rr = RrState::new();
        rr.start_record(&path).unwrap();
        rr.log_io(
            LogTag::In,
            &IoRecord {
                port: 0x60,
                size: 1,
                value: 0x1c,
                n_exec: 10,
            },
        )
        .unwrap();
        rr.log_interrupt(0x20, 0, 25, 0x7c21).unwrap();
        rr.log_marker(LogTag::Exit).unwrap();
        rr.start_replay(&path).unwrap();
        (dir, rr)
    }

    #[test]
    fn io_replays_identical_value() {
        let (_dir, mut rr) = record_then_replay();
        let (rec, _) = rr.consume_io(LogTag::In, 10).unwrap();
        assert_eq!(rec.value, 0x1c);
        assert_eq!(rec.port, 0x60);
    }

    #[test]
    fn interrupt_not_due_until_clock_matches() {
        let (_dir, mut rr) = record_then_replay();
        rr.consume_io(LogTag::In, 10).unwrap();
        assert!(rr.poll_event(20).unwrap().is_none());
        match rr.poll_event(25).unwrap() {
            Some(ReplayEvent::Interrupt(i)) => {
                assert_eq!(i.vector, 0x20);
                assert_eq!(i.eip, 0x7c21);
            }
            other => panic!("unexpected event {:?}", other),
        }
        match rr.poll_event(30).unwrap() {
            Some(ReplayEvent::Exit) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn overshoot_is_a_divergence() {
        let (_dir, mut rr) = record_then_replay();
        rr.consume_io(LogTag::In, 10).unwrap();
        let err = rr.poll_event(26).unwrap_err();
        assert!(matches!(err, Error::ReplayDivergence(_)));
    }

    #[test]
    fn wrong_tag_at_io_callout_diverges() {
        let (_dir, mut rr) = record_then_replay();
        rr.consume_io(LogTag::In, 10).unwrap();
        let err = rr.consume_io(LogTag::Out, 25).unwrap_err();
        assert!(matches!(err, Error::ReplayDivergence(_)));
    }

    #[test]
    fn io_at_wrong_n_exec_diverges() {
        let (_dir, mut rr) = record_then_replay();
        let err = rr.consume_io(LogTag::In, 11).unwrap_err();
        assert!(matches!(err, Error::ReplayDivergence(_)));
    }
}
