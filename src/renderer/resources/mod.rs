//! "Resources" refers to GPU objects created through the graphics context.
//! They are owned and dropped by the user.

pub mod buffer;
pub mod image;
