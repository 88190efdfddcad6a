#![forbid(unsafe_code)]

pub mod debounce;
pub mod search;
