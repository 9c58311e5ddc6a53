//! Connection tests against a raw peer on an in-memory transport

mod common;
mod control;
mod scenarios;
