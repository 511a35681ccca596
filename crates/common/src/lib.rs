//! Small helpers shared by every codehost crate: the error-context macro and
//! wall-clock helpers.

pub mod error;
pub mod time;

pub use {
    error::FromMessage,
    time::{format_age, now_ms},
};
