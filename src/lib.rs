pub mod common;
pub mod comms;
pub mod deposit;
pub mod manager;
pub mod persistence;
pub mod proof;
pub mod protocol;
pub mod task;
pub mod trade;
pub mod wallet;

pub mod testing;
