pub mod provider;

use indoc::{formatdoc, indoc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One unit of provider work: a single training-conversation generation
/// request. Opaque to the request queue; the dispatcher only needs the
/// job/item linkage to route outcomes back to batch progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTask {
    pub job_id: Option<Uuid>,
    pub item_id: Option<Uuid>,
    pub topic: String,
    pub tier: Option<String>,
    /// Opaque generation parameters (template selection, turn counts, ...).
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl GenerationTask {
    pub fn direct(topic: impl Into<String>) -> Self {
        Self {
            job_id: None,
            item_id: None,
            topic: topic.into(),
            tier: None,
            parameters: serde_json::Value::Null,
        }
    }
}

/// Output of a successful provider call.
#[derive(Debug, Clone)]
pub struct GeneratedConversation {
    pub conversation_id: Uuid,
    pub content: String,
    pub token_usage: i64,
}

const GENERATION_INSTRUCTIONS: &str = indoc! {r#"
    Produce a realistic multi-turn conversation between a user and an assistant.
    Stay on the given topic for the full conversation.
    Alternate turns strictly, starting with the user.
    Keep each turn self-contained and conversational.
    Do not mention that the conversation is synthetic or generated."#
};

pub fn system_prompt() -> String {
    formatdoc! {r#"
        You are a training-conversation generation engine.
        Your task is to write one complete conversation for an AI training dataset.

        Instructions:
        {GENERATION_INSTRUCTIONS}

        You will only respond with a JSON object with the keys "title" and "turns",
        where "turns" is an array of objects with the keys "role" and "content".
        Do not provide explanations."#
    }
}

/// Build the user prompt for a single generation task.
pub fn generation_user_prompt(task: &GenerationTask) -> String {
    let parameters = if task.parameters.is_null() {
        "{}".to_string()
    } else {
        task.parameters.to_string()
    };

    formatdoc!(
        r#"Generate a training conversation for the following topic.
            Honor every constraint in the parameters object.

            <topic>{}</topic>
            <tier>{}</tier>
            <parameters>{}</parameters>"#,
        task.topic,
        task.tier.as_deref().unwrap_or("standard"),
        parameters,
    )
}
