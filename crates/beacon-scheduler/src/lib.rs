//! Check scheduling for beacon.
//!
//! Creates checks for resources that are due, deduplicated per resource
//! config scope, and runs claimed checks in session containers on the
//! worker fleet.

pub mod checker;
pub mod factory;
pub mod scanner;
pub mod step;

#[cfg(test)]
pub(crate) mod testing;

pub use checker::Checker;
pub use factory::CheckFactory;
pub use scanner::Scanner;
pub use step::{CheckStep, StepContext};
