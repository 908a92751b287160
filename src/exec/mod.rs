//! This module provides the execution machinery around translated code: the shared-block
//! layout, the callout dispatcher, forced-callout patching, interrupt plumbing and the driver
//! loop.

pub mod callout;
pub mod dispatch;
pub mod forced;
pub mod intr;
pub mod layout;
