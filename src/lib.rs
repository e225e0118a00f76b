#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(missing_debug_implementations, nonstandard_style)]
#![warn(unreachable_pub)]

#[macro_use]
extern crate serde_derive;

extern crate serde;
extern crate serde_json;
extern crate url;

pub mod builder;
pub mod container;
pub mod detect;
pub mod driver;
pub mod exec;
pub mod health;
pub mod host;
pub mod manifest;
pub mod merge;
pub mod progress;
pub mod resume;
pub mod runtime;
pub mod stack;
