pub mod assembly;
pub mod characters;
pub mod illustration;
pub mod image;
pub mod llm;
pub mod narrative;
pub mod scenario;
pub mod setup;
pub mod speech;
pub mod voice;
pub mod workflow;
