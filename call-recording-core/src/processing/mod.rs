pub mod converter;
pub mod frame_buffer;
pub mod g711;
pub mod mixer;
pub mod wav_format;
