pub mod capture_provider;
pub mod delegates;
