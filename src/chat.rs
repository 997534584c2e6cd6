//! Retrieval-augmented question answering over stored observations.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::db::{ChatStore, ObservationStore};
use crate::embedding::{rank_top_k, Embedder};
use crate::llm::ChatModel;
use crate::types::StoredObservation;

pub const SYSTEM_INSTRUCTION: &str = "You answer questions about what a security camera has seen. \
Use only the observations given in the prompt and do not add anything they do not say. \
Reply in a natural, conversational tone, as if you watched the footage yourself. \
Never mention transcripts, observations, records or how the information was retrieved. \
If the observations do not answer the question, say you did not see anything like that.";

pub const UNAVAILABLE_MESSAGE: &str =
    "Query service temporarily unavailable. Please try after sometime.";

pub const NO_OBSERVATIONS_MESSAGE: &str =
    "Nothing has been observed on this camera yet, so there is nothing to answer from.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatAnswer {
    pub answer: String,
    /// Frame numbers of the observations the answer was grounded on, best match first.
    pub frames: Vec<u64>,
}

impl ChatAnswer {
    fn unavailable() -> Self {
        Self {
            answer: UNAVAILABLE_MESSAGE.to_string(),
            frames: Vec::new(),
        }
    }
}

pub struct RetrievalChat {
    store: Arc<dyn ObservationStore>,
    history: Arc<dyn ChatStore>,
    embedder: Arc<dyn Embedder>,
    model: Arc<dyn ChatModel>,
    recent_limit: usize,
    top_k: usize,
}

impl RetrievalChat {
    pub fn new(
        store: Arc<dyn ObservationStore>,
        history: Arc<dyn ChatStore>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn ChatModel>,
        cfg: &ChatConfig,
    ) -> Self {
        Self {
            store,
            history,
            embedder,
            model,
            recent_limit: cfg.recent_limit.max(1),
            top_k: cfg.top_k.max(1),
        }
    }

    /// Answer `question` from the camera's recent observations.
    ///
    /// Never fails: upstream problems degrade to [`UNAVAILABLE_MESSAGE`].
    pub async fn ask(&self, camera_id: i64, question: &str) -> ChatAnswer {
        let answer = match self.answer(camera_id, question).await {
            Ok(Some(answer)) => answer,
            Ok(None) => {
                return ChatAnswer {
                    answer: NO_OBSERVATIONS_MESSAGE.to_string(),
                    frames: Vec::new(),
                }
            }
            Err(e) => {
                warn!("Chat for camera {} degraded: {:#}", camera_id, e);
                return ChatAnswer::unavailable();
            }
        };

        if let Err(e) = self
            .history
            .append_chat(camera_id, question, &answer.answer, &answer.frames)
        {
            warn!("Chat turn for camera {} not saved: {:#}", camera_id, e);
        }
        answer
    }

    async fn answer(&self, camera_id: i64, question: &str) -> Result<Option<ChatAnswer>> {
        let recent = self
            .store
            .list(camera_id, self.recent_limit)
            .context("fetch recent observations")?;
        if recent.is_empty() {
            return Ok(None);
        }

        let top = self.retrieve(question, &recent).await?;
        let prompt = build_prompt(question, &top);
        debug!("Chat prompt for camera {}:\n{}", camera_id, prompt);

        let text = self
            .model
            .complete(SYSTEM_INSTRUCTION, &prompt)
            .await
            .context("chat completion")?;

        let frames: Vec<u64> = top.iter().map(|s| s.observation.frame_number).collect();
        info!(
            "Answered question for camera {} from frames {:?}",
            camera_id, frames
        );
        Ok(Some(ChatAnswer {
            answer: text,
            frames,
        }))
    }

    /// Top-k observations by cosine similarity to the question.
    async fn retrieve<'a>(
        &self,
        question: &str,
        recent: &'a [StoredObservation],
    ) -> Result<Vec<&'a StoredObservation>> {
        let texts: Vec<String> = recent.iter().map(transcript_text).collect();
        let vectors = self
            .embedder
            .embed_batch(&texts)
            .await
            .context("embed observations")?;
        let query = self
            .embedder
            .embed(question)
            .await
            .context("embed question")?;

        Ok(rank_top_k(&query, &vectors, self.top_k)
            .into_iter()
            .map(|i| &recent[i])
            .collect())
    }
}

fn transcript_text(stored: &StoredObservation) -> String {
    let description = stored.observation.description();
    if description.is_empty() {
        format!(
            "No notable activity. Lighting: {}",
            stored.observation.lighting_conditions.trim()
        )
    } else {
        description
    }
}

pub fn build_prompt(question: &str, top: &[&StoredObservation]) -> String {
    let mut prompt = format!("Question: {}\nRelevant Transcripts:\n", question.trim());
    for stored in top {
        prompt.push_str(&format!(
            "Time: {} | Description: {}\n",
            stored.recorded_at.format("%Y-%m-%d %H:%M:%S UTC"),
            transcript_text(stored)
        ));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::embedding::HashingEmbedder;
    use crate::test_support::EchoChat;
    use crate::types::sample_observation;
    use async_trait::async_trait;

    struct FailingChat;

    #[async_trait]
    impl ChatModel for FailingChat {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            anyhow::bail!("HTTP 502")
        }
    }

    fn chat_with(db: &Arc<Database>, model: Arc<dyn ChatModel>) -> RetrievalChat {
        RetrievalChat::new(
            db.clone(),
            db.clone(),
            Arc::new(HashingEmbedder::new(256)),
            model,
            &ChatConfig::default(),
        )
    }

    fn seed(db: &Database, n: u64) {
        for frame in 1..=n {
            let mut obs = sample_observation(1, frame);
            obs.human_activity = match frame % 4 {
                0 => "a delivery driver carrying a parcel".into(),
                1 => "a jogger running past".into(),
                2 => "none".into(),
                _ => "two kids riding bicycles".into(),
            };
            if frame % 10 == 0 {
                obs.animal_activity = "a brown dog barking at the gate".into();
            }
            db.append(&obs).unwrap();
        }
    }

    #[tokio::test]
    async fn returns_at_most_three_frames_deterministically() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        seed(&db, 100);
        let chat = chat_with(&db, Arc::new(EchoChat::default()));

        let first = chat.ask(1, "was there a dog barking?").await;
        let again = chat.ask(1, "was there a dog barking?").await;
        assert!(first.frames.len() <= 3);
        assert_eq!(first.frames, again.frames);
        assert!(first.frames.iter().all(|f| f % 10 == 0));
        assert_eq!(db.list_chats(1, 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn prompt_carries_question_and_descriptions() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        seed(&db, 12);
        let model = Arc::new(EchoChat::default());
        let chat = chat_with(&db, model.clone());

        let answer = chat.ask(1, "who delivered a parcel?").await;
        assert_eq!(answer.answer, "answer to: Question: who delivered a parcel?");

        let prompts = model.prompts.lock().unwrap();
        let (system, user) = &prompts[0];
        assert_eq!(system, SYSTEM_INSTRUCTION);
        assert!(user.contains("Relevant Transcripts:"));
        assert!(user.contains("| Description: a delivery driver carrying a parcel"));
        assert_eq!(user.matches("Time: ").count(), 3);
    }

    #[tokio::test]
    async fn empty_transcript_skips_model() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let model = Arc::new(EchoChat::default());
        let chat = chat_with(&db, model.clone());

        let answer = chat.ask(1, "anything?").await;
        assert_eq!(answer.answer, NO_OBSERVATIONS_MESSAGE);
        assert!(answer.frames.is_empty());
        assert!(model.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_failure_degrades_to_fixed_message() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        seed(&db, 5);
        let chat = chat_with(&db, Arc::new(FailingChat));

        let answer = chat.ask(1, "anything?").await;
        assert_eq!(answer, ChatAnswer::unavailable());
        assert!(db.list_chats(1, 10).unwrap().is_empty());
    }

    #[test]
    fn quiet_observation_still_has_text() {
        let db = Database::open_in_memory().unwrap();
        let stored = db.append(&sample_observation(1, 1)).unwrap();
        assert_eq!(transcript_text(&stored), "No notable activity. Lighting: well-lit");
    }
}
