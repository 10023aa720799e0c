//! Instance and device bring-up. Everything here lives for the whole run.

pub mod instance;
pub mod device;
pub mod queue;
