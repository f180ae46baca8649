pub mod assembler;
pub mod llm;
pub mod narration;
pub mod setup;
pub mod story;
pub mod tracking;
pub mod visual;
pub mod workflow;
