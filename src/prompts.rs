//! Versioned system prompts.
//!
//! Every chat answer is generated under a named prompt version so that
//! feedback can be attributed to the exact instructions in effect.

/// Version used when `chat.prompt_version` is not configured.
pub const CURRENT_VERSION: &str = "v1.0.0";

/// Context placeholder used when retrieval finds nothing.
pub const NO_CONTEXT: &str = "No relevant documents found.";

/// The exact phrase the model must use when the answer is not in the context.
pub const NOT_FOUND_PHRASE: &str = "I cannot find that information in the documents provided.";

/// Fixed instruction for structured extraction during ingestion.
pub const EXTRACTION_PROMPT: &str = r#"You are an expert document analyzer.
1. Extract all the textual content from this file.
2. Analyze the content and return a JSON object with this exact schema:
{
  "fullText": "The complete text extracted...",
  "summary": "string (max 2 sentences)",
  "tags": ["string", "string", "string"]
}"#;

/// A named RAG system prompt template.
#[derive(Debug, Clone, Copy)]
pub struct PromptVersion {
    pub version: &'static str,
    render: fn(&str) -> String,
}

impl PromptVersion {
    /// Render the system instruction around `context`.
    ///
    /// An empty (or whitespace-only) context is replaced by [`NO_CONTEXT`].
    pub fn system_instruction(&self, context: &str) -> String {
        let context = if context.trim().is_empty() {
            NO_CONTEXT
        } else {
            context
        };
        (self.render)(context)
    }
}

fn rag_system_v1(context: &str) -> String {
    format!(
        "You are an intelligent assistant specializing in document analysis.\n\
         \n\
         STRICT INSTRUCTIONS:\n\
         1. Use ONLY the context provided below.\n\
         2. If the answer is not in the context, explicitly say: \"{}\"\n\
         3. Do not hallucinate or invent facts.\n\
         4. Format your response in clean Markdown.\n\
         \n\
         CONTEXT:\n\
         {}\n",
        NOT_FOUND_PHRASE, context
    )
}

const REGISTRY: &[PromptVersion] = &[PromptVersion {
    version: "v1.0.0",
    render: rag_system_v1,
}];

/// Look up a prompt by version string.
pub fn lookup(version: &str) -> Option<PromptVersion> {
    REGISTRY.iter().copied().find(|p| p.version == version)
}

/// All registered version strings.
pub fn versions() -> Vec<&'static str> {
    REGISTRY.iter().map(|p| p.version).collect()
}
