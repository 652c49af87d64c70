pub mod file_manager;
pub mod metadata;
pub mod streaming_encoder;
pub mod validator;
