#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;

pub mod config;
pub mod errors;
pub mod history;
pub mod object_store;
pub mod registry;
pub mod scanner;
pub mod sigv4;
pub mod sweep;
pub mod xml;

pub use errors::GcError;
