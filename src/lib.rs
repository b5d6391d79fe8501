//! ottoflow: print-farm orchestrator driving printers, an ottoeject part
//! remover and OttoRack shelves.

pub mod adapters;
pub mod config;
pub mod connection;
pub mod moonraker;
pub mod orchestrator;
pub mod ottoeject;
pub mod rack_cache;
pub mod repository;
pub mod web;

pub use ottoflow_shared as shared;
