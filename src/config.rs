//! Monitor configuration, built up the builder way before the monitor is constructed.

use std::path::PathBuf;

use crate::mem::phys::DEFAULT_RAM_SIZE;
use crate::rr::micro::{MrepConfig, MrepGrowth};
use crate::tb::cache::Replacement;

/// All build-time knobs of a [`crate::Monitor`].
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Guest physical RAM size in bytes.
    pub ram_size: u32,
    /// Translation-cache arena size in bytes.
    pub tc_size: u32,
    /// Max guest instructions per translation block.
    pub max_tu_size: usize,
    /// Shadow/swap pool size in pages.
    pub swap_page_limit: usize,
    /// Whether the A20 gate starts unmasked. Legacy real-mode binaries that wrap at 1 MiB
    /// need it masked.
    pub a20_unmasked: bool,
    /// The TB replacement policy.
    pub replacement: Replacement,
    /// Optional backing file for evicted dirty swap pages.
    pub swap_file: Option<PathBuf>,
    /// Micro-replay knobs.
    pub mrep: MrepConfig,
    /// The guest OS's panic entry point; reaching it during record triggers micro-replay.
    pub panic_eip: Option<u32>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ram_size: DEFAULT_RAM_SIZE,
            tc_size: 1 << 20,
            max_tu_size: crate::peep::MAX_TU_SIZE,
            swap_page_limit: 256,
            a20_unmasked: true,
            replacement: Replacement::Random,
            swap_file: None,
            mrep: MrepConfig::default(),
            panic_eip: None,
        }
    }
}

/// Builder for a [`crate::Monitor`].
pub struct MonitorBuilder {
    config: MonitorConfig,
}

impl MonitorBuilder {
    pub fn new() -> Self {
        Self {
            config: MonitorConfig::default(),
        }
    }

    pub fn with_ram_size(mut self, bytes: u32) -> Self {
        self.config.ram_size = bytes;
        self
    }

    pub fn with_tc_size(mut self, bytes: u32) -> Self {
        self.config.tc_size = bytes;
        self
    }

    pub fn with_max_tu_size(mut self, insns: usize) -> Self {
        self.config.max_tu_size = insns;
        self
    }

    pub fn with_swap_page_limit(mut self, pages: usize) -> Self {
        self.config.swap_page_limit = pages;
        self
    }

    pub fn with_a20_unmasked(mut self, unmasked: bool) -> Self {
        self.config.a20_unmasked = unmasked;
        self
    }

    pub fn with_replacement(mut self, policy: Replacement) -> Self {
        self.config.replacement = policy;
        self
    }

    pub fn with_swap_file(mut self, path: PathBuf) -> Self {
        self.config.swap_file = Some(path);
        self
    }

    pub fn with_mrep_interrupts(mut self, n: usize) -> Self {
        self.config.mrep.n_interrupts = n;
        self
    }

    pub fn with_mrep_growth(mut self, growth: MrepGrowth) -> Self {
        self.config.mrep.growth = growth;
        self
    }

    pub fn with_mrep_cumulative(mut self, cumulative: bool) -> Self {
        self.config.mrep.cumulative = cumulative;
        self
    }

    pub fn with_panic_eip(mut self, eip: u32) -> Self {
        self.config.panic_eip = Some(eip);
        self
    }

    /// Builds the monitor.
    pub fn build(self) -> Result<crate::Monitor, crate::Error> {
        crate::Monitor::with_config(self.config)
    }
}

impl Default for MonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let b = MonitorBuilder::new()
            .with_ram_size(0x80_0000)
            .with_a20_unmasked(false)
            .with_mrep_interrupts(4)
            .with_panic_eip(0xc010_0000);
        assert_eq!(b.config.ram_size, 0x80_0000);
        assert!(!b.config.a20_unmasked);
        assert_eq!(b.config.mrep.n_interrupts, 4);
        assert_eq!(b.config.panic_eip, Some(0xc010_0000));
    }
}
