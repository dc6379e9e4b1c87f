//! Mockgate is a session-isolated HTTP stubbing gateway: clients declare
//! stub rules per test session, the gateway answers matching traffic with
//! canned or patched responses, forwards the rest to the real upstream,
//! and records/broadcasts every session-scoped exchange.

pub mod admin_api;
pub mod config;
pub mod gateway;
pub mod guard;
pub mod names;
pub mod repository;
pub mod session;
pub mod stub;
pub mod traffic;
