//! Enquiry/acknowledge exchange with the gauge controller.

pub mod command;
pub mod engine;
pub mod error;
pub mod parser;
