//! This module provides architecture definitions for the guest ISA.

pub mod x86;
