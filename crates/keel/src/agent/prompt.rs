//! Structured system prompt builder.
//!
//! [`SystemPromptBuilder`] assembles the system prompt from a preamble,
//! `## Heading` sections and raw blocks, skipping anything empty.
//! [`HookComposer::compose_system_prompt`](super::hooks::HookComposer::compose_system_prompt)
//! uses it to lay out the prompt in its fixed order.

/// Builder for multi-section system prompts.
///
/// Sections are joined with double newlines. Empty sections are skipped.
///
/// # Example
///
/// ```
/// use keel::agent::prompt::SystemPromptBuilder;
///
/// let prompt = SystemPromptBuilder::new("You are a helpful agent.")
///     .section("Instructions", "Answer in French.")
///     .section_opt("Summary", None::<String>)
///     .build();
///
/// assert!(prompt.contains("## Instructions"));
/// assert!(!prompt.contains("## Summary"));
/// ```
#[derive(Debug, Clone)]
pub struct SystemPromptBuilder {
    sections: Vec<String>,
}

impl SystemPromptBuilder {
    /// Create a builder whose first block is `preamble`, as-is.
    pub fn new(preamble: impl Into<String>) -> Self {
        Self {
            sections: Vec::new(),
        }
        .raw(preamble)
    }

    /// Append a named section. Skipped if `content` is blank.
    pub fn section(mut self, heading: &str, content: impl Into<String>) -> Self {
        let content = content.into();
        if !content.trim().is_empty() {
            self.sections.push(format!("## {heading}\n\n{content}"));
        }
        self
    }

    /// Append a section only if the content is `Some`.
    pub fn section_opt(self, heading: &str, content: Option<impl Into<String>>) -> Self {
        match content {
            Some(c) => self.section(heading, c),
            None => self,
        }
    }

    /// Append raw text without a heading. Skipped if blank.
    pub fn raw(mut self, content: impl Into<String>) -> Self {
        let content = content.into();
        if !content.trim().is_empty() {
            self.sections.push(content);
        }
        self
    }

    pub fn build(self) -> String {
        self.sections.join("\n\n")
    }
}
