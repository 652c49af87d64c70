pub mod data_flow;
pub mod quality_monitor;
