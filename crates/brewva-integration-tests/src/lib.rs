//! Cross-crate integration tests for the Brewva channel orchestrator.
//!
//! The tests live in `tests/`; this library only hosts the shared fakes so
//! every integration test wires the real orchestrator against a scripted
//! runtime and a capturing transport.

#![deny(unsafe_code)]
#![deny(clippy::all)]

pub mod support;
