pub mod manager;
pub mod timer;
