//! "Internals" refers to the bookkeeping behind the frame loop: resource
//! state tracking, transient memory and the swapchain.

pub mod barrier;
pub mod swapchain;
pub mod transient;
