pub mod gemini;

pub use gemini::{
    Candidate, Content, GeminiGenerateContentRequest, GeminiModel, GeminiModelList,
    GeminiResponseBody, GenerationConfig, Part, Tool, ToolConfig,
};
