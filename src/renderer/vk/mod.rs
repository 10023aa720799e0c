// Thin helpers over raw command recording

pub mod util;
