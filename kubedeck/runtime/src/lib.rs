#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
mod console;
mod http;
mod roles;
mod socket;

pub use self::{
    args::{parse_duration, Args, LogFormat},
    console::Console,
    http::{router, ApiError},
};
