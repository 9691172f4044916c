mod bindings;
mod filesystem;
mod parsing;
mod platform;
mod virtual_memory;
mod write_watch;

pub(crate) use bindings::*;
pub(crate) use filesystem::*;
pub(crate) use parsing::*;
pub(crate) use platform::*;
pub(crate) use write_watch::*;
