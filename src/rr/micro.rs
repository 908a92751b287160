//! The micro-replay controller: bounded rollback over the recorded log. On a trigger the log
//! is rewound to just before the last N interrupt injections and re-run with those injection
//! eips blacklisted, localizing non-deterministic failures.

use log::info;

use crate::error::Error;

use super::blacklist::Blacklist;
use super::log::{LogTag, RECORD_FRAME};
use super::replay::{RrMode, RrState};

/// How often (in executed instructions) a periodic micro-replay fires.
pub const MICRO_REPLAY_FREQUENCY: u64 = 1 << 24;

/// How the harvest window grows between unsuccessful rounds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MrepGrowth {
    Linear,
    Geometric,
}

/// The rollback state machine. The original kept this as an integer `rollback_mode` in
/// {0, 1, 2}; the three states are made explicit here.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RollbackMode {
    /// Normal recording (mode 0).
    Live,
    /// Replaying while harvesting rollback candidates (mode 1).
    Harvest,
    /// Replaying after the rollback point was fixed; interrupts are being suppressed
    /// (mode 2).
    RolledBack,
}

/// One harvested interrupt-injection point.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MrepInterrupt {
    pub eip: u32,
    pub n_exec: u64,
    pub offset: u64,
}

/// Knobs, set from the monitor configuration.
#[derive(Clone, Copy, Debug)]
pub struct MrepConfig {
    /// The initial number of interrupts to rewind past.
    pub n_interrupts: usize,
    pub growth: MrepGrowth,
    /// Whether blacklists accumulate across rounds.
    pub cumulative: bool,
    /// The maximum eips blacklisted per round.
    pub n_blacklists: usize,
    pub frequency: u64,
}

impl Default for MrepConfig {
    fn default() -> Self {
        Self {
            n_interrupts: 32,
            growth: MrepGrowth::Geometric,
            cumulative: true,
            n_blacklists: 8,
            frequency: MICRO_REPLAY_FREQUENCY,
        }
    }
}

/// What the driver loop should do after a mode switch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MrepAction {
    /// Nothing changed.
    None,
    /// The log position and mode changed; restart the loop (the original longjmps here).
    Restart,
}

/// The micro-replay controller.
pub struct MicroReplay {
    config: MrepConfig,
    mode: RollbackMode,
    rollback_offset: u64,
    rollback_n_exec: u64,
    deterministic_error: bool,
    ring: Vec<MrepInterrupt>,
    next: usize,
    last_trigger: u64,
    pub num_micro_replays: u64,
}

impl MicroReplay {
    pub fn new(config: MrepConfig) -> Self {
        Self {
            config,
            mode: RollbackMode::Live,
            rollback_offset: 0,
            rollback_n_exec: u64::MAX,
            deterministic_error: false,
            ring: Vec::new(),
            next: 0,
            last_trigger: 0,
            num_micro_replays: 0,
        }
    }

    pub fn mode(&self) -> RollbackMode {
        self.mode
    }

    pub fn deterministic_error(&self) -> bool {
        self.deterministic_error
    }

    /// Observes a consumed log record while harvesting. I/O records advance the candidate
    /// rollback anchor; interrupt records enter the ring.
    pub fn on_record(&mut self, tag: LogTag, offset_after: u64, n_exec: u64, eip: u32) {
        if self.mode != RollbackMode::Harvest {
            return;
        }
        match tag {
            LogTag::In | LogTag::Ins | LogTag::Out | LogTag::Outs => {
                self.rollback_offset = offset_after;
                self.rollback_n_exec = n_exec;
            }
            LogTag::Intr => {
                let slot = self.next;
                self.ring[slot] = MrepInterrupt {
                    eip,
                    n_exec,
                    offset: offset_after,
                };
                self.next = (self.next + 1) % self.ring.len();
            }
            _ => {}
        }
    }

    /// Whether the periodic trigger fires at the given clock.
    pub fn check_periodic(&mut self, n_exec: u64, recording: bool) -> bool {
        if !recording {
            return false;
        }
        if n_exec.saturating_sub(self.last_trigger) > self.config.frequency {
            self.last_trigger = n_exec;
            true
        } else {
            false
        }
    }

    /// Picks the rollback point from the harvested ring and fills the blacklist with the
    /// injection eips of the last rounds' interrupts. Fewer than N harvested interrupts means
    /// the failure reproduces without any interrupt in the window: it is deterministic.
    fn decide_rollback_point(&mut self, blacklist: &mut Blacklist) {
        if !self.config.cumulative {
            blacklist.clear();
        }
        let n = self.ring.len();
        let mut rollback_point = (self.next + 1) % n;
        if self.ring[rollback_point].eip == 0 {
            rollback_point = 1 % n;
        }
        if self.rollback_n_exec < self.ring[rollback_point].n_exec {
            self.rollback_n_exec = self.ring[rollback_point].n_exec;
            self.rollback_offset = self.ring[(rollback_point + n - 1) % n].offset;
        }
        let mut i = rollback_point;
        while i != self.next {
            if self.ring[i].eip == 0 {
                info!("hitting error deterministically (no interrupts in window)");
                self.deterministic_error = true;
                break;
            }
            let distance = (self.next + n - i) % n;
            if distance < self.config.n_blacklists {
                info!("blacklisting eip {:#x}", self.ring[i].eip);
                blacklist.insert(self.ring[i].eip);
            }
            i = (i + 1) % n;
        }
    }

    /// The mode switch: drives `Live -> Harvest -> RolledBack -> Live`, seeking the log and
    /// flipping the record/replay direction as it goes. Returns whether the driver loop must
    /// restart.
    pub fn switch_mode(
        &mut self,
        rr: &mut RrState,
        blacklist: &mut Blacklist,
        cur_n_exec: u64,
    ) -> Result<(MrepAction, Option<u64>), Error> {
        if !rr.active() || self.deterministic_error {
            return Ok((MrepAction::None, None));
        }

        let mut forced_n_exec = None;
        if rr.replaying() && self.mode == RollbackMode::RolledBack {
            // The rollback point was reached again: resume live recording there.
            let log = rr.raw_log().ok_or(Error::NoLog)?;
            log.rewind()?;
            rr.set_mode(RrMode::Record);
            forced_n_exec = Some(self.rollback_n_exec);
            self.mode = RollbackMode::Live;
            self.ring.clear();
            self.num_micro_replays += 1;
            info!("rollback complete; entering live mode");
        } else {
            let first_replay = self.mode == RollbackMode::Harvest && rr.replaying();
            if rr.recording() || first_replay {
                if first_replay {
                    self.decide_rollback_point(blacklist);
                    if self.deterministic_error {
                        return Ok((MrepAction::None, None));
                    }
                    info!(
                        "fixed rollback at n_exec {:#x}, replaying again from offset {:#x}",
                        self.rollback_n_exec, self.rollback_offset
                    );
                    let target = self.rollback_offset.saturating_sub(RECORD_FRAME);
                    let log = rr.raw_log().ok_or(Error::NoLog)?;
                    log.seek(target)?;
                    rr.set_mode(RrMode::Record);
                    forced_n_exec = Some(self.rollback_n_exec);
                }
                rr.log_marker(LogTag::Mrep)?;
                let log = rr.raw_log().ok_or(Error::NoLog)?;
                log.rewind()?;
                if first_replay {
                    rr.set_mode(RrMode::Replay);
                    self.mode = RollbackMode::RolledBack;
                    self.ring.clear();
                } else {
                    // Recording: flip to replay and start harvesting.
                    rr.set_mode(RrMode::Replay);
                    self.mode = RollbackMode::Harvest;
                }
            }

            if self.mode == RollbackMode::Harvest {
                let log = rr.raw_log().ok_or(Error::NoLog)?;
                self.rollback_offset = log.tell()?;
                self.rollback_n_exec = cur_n_exec;
                match self.config.growth {
                    MrepGrowth::Linear => self.config.n_interrupts += 1,
                    MrepGrowth::Geometric => self.config.n_interrupts *= 2,
                }
                self.ring = vec![MrepInterrupt::default(); self.config.n_interrupts];
                self.next = 0;
            }
        }
        Ok((MrepAction::Restart, forced_n_exec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rr::log::IoRecord;

    fn small_config() -> MrepConfig {
        MrepConfig {
            n_interrupts: 4,
            growth: MrepGrowth::Geometric,
            cumulative: true,
            n_blacklists: 8,
            frequency: 100,
        }
    }

    fn recorded_state(dir: &tempfile::TempDir) -> RrState {
        let path = dir.path().join("rr.log");
        let mut rr = RrState::new();
        rr.start_record(&path).unwrap();
        for i in 0..4u64 {
            rr.log_io(
                LogTag::In,
                &IoRecord {
                    port: 0x60,
                    size: 1,
                    value: i as u32,
                    n_exec: 10 * (i + 1),
                },
            )
            .unwrap();
            rr.log_interrupt(0x20, 0, 10 * (i + 1) + 5, 0x1000 + 0x100 * i as u32)
                .unwrap();
        }
        rr
    }

    #[test]
    fn live_to_harvest_transition() {
        let dir = tempfile::tempdir().unwrap();
        let mut rr = recorded_state(&dir);
        let mut mrep = MicroReplay::new(small_config());
        let mut bl = Blacklist::default();
        assert_eq!(mrep.mode(), RollbackMode::Live);
        let (action, _) = mrep.switch_mode(&mut rr, &mut bl, 50).unwrap();
        assert_eq!(action, MrepAction::Restart);
        assert_eq!(mrep.mode(), RollbackMode::Harvest);
        assert!(rr.replaying());
        // The harvest ring grew geometrically.
        assert_eq!(mrep.ring.len(), 8);
    }

    #[test]
    fn harvest_to_rolledback_fills_blacklist() {
        let dir = tempfile::tempdir().unwrap();
        let mut rr = recorded_state(&dir);
        let mut mrep = MicroReplay::new(small_config());
        let mut bl = Blacklist::default();
        mrep.switch_mode(&mut rr, &mut bl, 50).unwrap();
        // Simulate the harvest pass observing the four recorded interrupts.
        for i in 0..4u64 {
            mrep.on_record(
                LogTag::Intr,
                RECORD_FRAME * (2 * i + 2),
                10 * (i + 1) + 5,
                0x1000 + 0x100 * i as u32,
            );
        }
        let (action, forced) = mrep.switch_mode(&mut rr, &mut bl, 45).unwrap();
        assert_eq!(action, MrepAction::Restart);
        assert_eq!(mrep.mode(), RollbackMode::RolledBack);
        assert!(rr.replaying());
        assert!(forced.is_some());
        // The recent injection eips are blacklisted, coalesced into distinct intervals; the
        // one at the rollback point itself is not re-injected and stays unlisted this round.
        assert!(bl.num_intervals() <= 4);
        for i in 1..4u32 {
            assert!(bl.contains(0x1000 + 0x100 * i));
        }
        assert!(!bl.contains(0x1000));
    }

    #[test]
    fn rolledback_returns_to_live() {
        let dir = tempfile::tempdir().unwrap();
        let mut rr = recorded_state(&dir);
        let mut mrep = MicroReplay::new(small_config());
        let mut bl = Blacklist::default();
        mrep.switch_mode(&mut rr, &mut bl, 50).unwrap();
        for i in 0..4u64 {
            mrep.on_record(LogTag::Intr, RECORD_FRAME * (2 * i + 2), 10 * (i + 1) + 5, 0x1000);
        }
        mrep.switch_mode(&mut rr, &mut bl, 45).unwrap();
        let (action, forced) = mrep.switch_mode(&mut rr, &mut bl, 45).unwrap();
        assert_eq!(action, MrepAction::Restart);
        assert_eq!(mrep.mode(), RollbackMode::Live);
        assert!(rr.recording());
        assert_eq!(forced, Some(mrep.rollback_n_exec));
        assert_eq!(mrep.num_micro_replays, 1);
    }

    #[test]
    fn fewer_than_n_interrupts_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let mut rr = recorded_state(&dir);
        let mut mrep = MicroReplay::new(small_config());
        let mut bl = Blacklist::default();
        mrep.switch_mode(&mut rr, &mut bl, 50).unwrap();
        // Only one interrupt harvested out of a ring of eight.
        mrep.on_record(LogTag::Intr, RECORD_FRAME, 15, 0x1000);
        mrep.switch_mode(&mut rr, &mut bl, 45).unwrap();
        assert!(mrep.deterministic_error());
        // Once declared deterministic, further switches are refused.
        let (action, _) = mrep.switch_mode(&mut rr, &mut bl, 45).unwrap();
        assert_eq!(action, MrepAction::None);
    }

    #[test]
    fn periodic_trigger_respects_frequency() {
        let mut mrep = MicroReplay::new(small_config());
        assert!(!mrep.check_periodic(50, true));
        assert!(mrep.check_periodic(200, true));
        assert!(!mrep.check_periodic(250, true));
        assert!(!mrep.check_periodic(5000, false));
    }
}
