//! This module provides the peephole translation engine: the template table, the matcher, the
//! snippet emitter and the translator that strings emitted snippets into translation blocks.

pub mod emit;
pub mod matcher;
pub mod table;
pub mod translate;

pub use emit::{Emitter, RollbackSet};
pub use table::{CpuConstraints, PeepTable};
pub use translate::{TranslationOut, Translator, MAX_TU_SIZE};
