pub mod error;
pub mod matcher;
pub mod model;
pub mod pack;
pub mod queue;
pub mod registry;
pub mod rewrite;
pub mod scan;
pub mod service;
