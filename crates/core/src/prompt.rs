use crate::models::ScoredChunk;

/// Reply the model is told to give for questions outside medicine.
pub const REFUSAL_MESSAGE: &str =
    "I'm trained only to answer medical and health-related questions. Please ask something in that domain.";

pub fn build_context(hits: &[ScoredChunk]) -> String {
    hits.iter()
        .map(|hit| hit.chunk.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Fills the fixed assistant template with retrieved context and the question.
///
/// Domain restriction is a soft guardrail: it relies on the model following
/// the instruction.
pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "You are Medibot, a trustworthy AI **medical** assistant.\n\
         Only answer questions related to medicine, health, diseases, symptoms, treatment, anatomy, or healthcare.\n\
         Do NOT answer questions outside the medical domain. If the question is unrelated, respond:\n\
         \"{REFUSAL_MESSAGE}\"\n\
         Here is the relevant medical context from trusted sources:\n\
         {context}\n\
         Below is the user question:\n\
         Question: {question}\n\
         Answer:"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, Metadata};

    fn hit(content: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                content: content.to_string(),
                metadata: Metadata::new(),
                start_index: 0,
            },
            score: 0.9,
        }
    }

    #[test]
    fn context_joins_chunks_with_blank_lines() {
        let context = build_context(&[hit("first"), hit("second")]);
        assert_eq!(context, "first\n\nsecond");
        assert_eq!(build_context(&[]), "");
    }

    #[test]
    fn prompt_places_context_before_question() {
        let prompt = build_prompt("Aspirin is a blood thinner.", "What is aspirin?");

        let context_at = prompt.find("Aspirin is a blood thinner.");
        let question_at = prompt.find("Question: What is aspirin?");
        assert!(matches!((context_at, question_at), (Some(c), Some(q)) if c < q));
        assert!(prompt.starts_with("You are Medibot"));
        assert!(prompt.ends_with("Answer:"));
    }

    #[test]
    fn out_of_domain_question_still_carries_refusal_instruction() {
        let prompt = build_prompt("", "Who won the 2018 World Cup?");
        assert!(prompt.contains(&format!("\"{REFUSAL_MESSAGE}\"")));
        assert!(prompt.contains("Do NOT answer questions outside the medical domain"));
    }
}
