//! Serial driver, startup rendezvous and data logger for a two-channel
//! vacuum gauge controller.

pub mod acquire;
pub mod config;
pub mod frame;
pub mod gauge;
pub mod logging;
pub mod port;
pub mod proto;
pub mod record;
pub mod stats;
pub mod sync;

#[cfg(test)]
mod testing;
