pub mod audio_models;
pub mod config;
pub mod error;
pub mod health;
pub mod quality;
pub mod recording_result;
pub mod state;
