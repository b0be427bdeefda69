//! Running a closure in a forked child and collecting what it returned or
//! raised.

mod fork;
mod outcome;

pub use fork::{
    run, spawn, spawn_with, ActivationHooks, ForkChannel, ForkEvent, ProcessHandle, Side,
};
pub use outcome::{ChildError, Outcome, RAISED, RETURNED};
