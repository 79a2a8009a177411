//! Prompt text for the LLM-backed collaborators.
//!
//! Wording here is a tuning concern; the pipeline only depends on the JSON
//! shapes the prompts ask for.

use serde_json::json;

use crate::decision::EvaluationCandidate;
use crate::extract::CandidateFact;

const FACT_EXTRACTION_PROMPT: &str = r#"Extract the relevant facts, significant preferences and important memories from the text below.
Phrase every fact from the perspective of the person speaking. Keep facts short and self-contained.
If the text holds nothing worth remembering, return empty lists and no metadata.
Answer in the language of the text.

Reply with a single JSON object:
{
  "relevant_facts": ["..."],
  "metadata": {
    "scope": "...",
    "sentiment": "positive | negative | neutral",
    "related_entities": ["..."],
    "related_events": ["..."],
    "tags": ["..."]
  }
}

Text:
"#;

const DECISION_PROMPT: &str = r#"You maintain a memory store. Compare the new facts against the existing memories and decide, for each new fact, one action:
- ADD: the fact is not covered by any existing memory. Omit "id"; put the fact in "text".
- UPDATE: an existing memory is about the same subject but the fact adds or changes information. "id" is the existing memory's id; "text" is the merged memory.
- DELETE: the fact contradicts an existing memory. "id" is the memory to remove.
- NONE: the fact is already fully covered. "id" may name the memory that covers it.
- CONFLICT: the fact conflicts with a memory in a way you cannot resolve. "id" names that memory.

Only use ids that appear in the existing memories list.

Reply with a single JSON object:
{"memory": [{"event": "ADD|UPDATE|DELETE|NONE|CONFLICT", "id": "<id>", "text": "..."}]}

"#;

pub fn fact_extraction_prompt(text: &str) -> String {
    format!("{FACT_EXTRACTION_PROMPT}{text}\n")
}

/// Candidates are numbered by local ordinal, never by storage id.
pub fn decision_prompt(candidates: &[EvaluationCandidate], facts: &[CandidateFact]) -> String {
    let existing: Vec<_> = candidates
        .iter()
        .enumerate()
        .map(|(ordinal, c)| {
            json!({
                "id": ordinal.to_string(),
                "text": c.memory_text,
                "matched_fact": c.fact_ordinal,
                "score": c.score,
            })
        })
        .collect();
    let new_facts: Vec<_> = facts
        .iter()
        .map(|f| json!({ "fact": f.ordinal, "text": f.text }))
        .collect();
    let input = json!({ "existing_memories": existing, "new_facts": new_facts });
    format!("{DECISION_PROMPT}Input:\n{input:#}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Payload;

    #[test]
    fn decision_prompt_numbers_candidates_by_position_not_id() {
        let candidates = vec![EvaluationCandidate {
            fact_ordinal: 0,
            memory_id: "3f0c2a9e-real-storage-id".into(),
            score: 0.93,
            memory_text: "Loves cheese pizza".into(),
            metadata: Payload::new(),
            content_hash: None,
        }];
        let facts = vec![CandidateFact {
            ordinal: 0,
            text: "Dislikes cheese pizza".into(),
        }];
        let prompt = decision_prompt(&candidates, &facts);
        assert!(prompt.contains("\"id\": \"0\""));
        assert!(!prompt.contains("3f0c2a9e"));
        assert!(prompt.contains("Dislikes cheese pizza"));
    }

    #[test]
    fn extraction_prompt_embeds_the_text() {
        assert!(fact_extraction_prompt("I moved to Lisbon").ends_with("I moved to Lisbon\n"));
    }
}
