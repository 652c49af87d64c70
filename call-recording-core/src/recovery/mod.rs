pub mod recovery_manager;
