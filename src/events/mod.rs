//! The event backbone: a closed set of typed domain events ([types::Event])
//! and the in-process bus that distributes them ([dispatcher::EventDispatcher])
//! with per-handler fault isolation and a bounded, introspectable history.

pub mod dispatcher;
pub mod types;
