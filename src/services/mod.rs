// Services module
// Contains the backend-facing logic separated by domain areas

pub mod chunking;      // Text chunking strategies
pub mod image;         // Image generation services
pub mod transcription; // Audio transcription services
pub mod translation;   // Translation and rewrite services
pub mod tts;           // Text-to-Speech services
pub mod video;         // Video render and concatenation services
