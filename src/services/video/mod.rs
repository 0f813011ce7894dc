// Video processing services

pub mod concat;
pub mod render;
pub mod tools;

pub use concat::{Concatenator, FfmpegConcatenator, concat_media};
pub use render::{FfmpegRenderer, VideoRenderer};
pub use tools::{MediaTools, probe_duration};
