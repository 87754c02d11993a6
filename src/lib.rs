pub mod api;
pub mod cli;
pub mod decision;
pub mod engine;
pub mod nodes;
pub mod storage;
