mod bindings;
mod platform;
mod virtual_memory;

pub(crate) use bindings::*;
pub(crate) use platform::*;
