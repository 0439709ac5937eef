//! Retrieval and answer orchestration.
//!
//! [`RetrievalAnswerer::search_collection`] embeds a query and returns the
//! nearest stored documents. [`RetrievalAnswerer::answer_question`] builds a
//! RAG prompt from those documents, asks the generation provider, and falls
//! back to the extractive [`summary`](crate::summary) when generation fails
//! or comes back blank.
//!
//! Result discipline:
//!
//! | Situation | `search_collection` | `answer_question` |
//! |-----------|--------------------|-------------------|
//! | blank query | `Err(Validation)` | `Err(Validation)` |
//! | collection missing | `Ok(vec![])` | `Ok(None)` |
//! | no hits | `Ok(vec![])` | `Ok(None)` |
//! | embedding/store failure | `Err(Provider)` | `Err(Provider)` |
//! | generation failure | n/a | fallback summary |

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::embedding::{EmbedPurpose, Embedder};
use crate::error::{RagError, Result};
use crate::generation::{ChatMessage, Generator, Role};
use crate::models::{Project, RetrievedDocument};
use crate::namer::collection_name;
use crate::store::VectorStore;
use crate::summary::summarize;
use crate::templates::TemplateLookup;

pub const APOLOGY: &str = "I found relevant information in the documents, but I'm unable to generate a proper answer at this time. Please try rephrasing your question.";

/// A generated (or summarized) answer with the prompt that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub full_prompt: String,
    pub chat_history: Vec<ChatMessage>,
}

pub struct RetrievalAnswerer {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    templates: Arc<dyn TemplateLookup>,
}

impl RetrievalAnswerer {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        templates: Arc<dyn TemplateLookup>,
    ) -> Self {
        Self {
            store,
            embedder,
            generator,
            templates,
        }
    }

    /// Top-`limit` documents for `text`, best first.
    pub async fn search_collection(
        &self,
        project: &Project,
        text: &str,
        limit: usize,
    ) -> Result<Vec<RetrievedDocument>> {
        if text.trim().is_empty() {
            return Err(RagError::validation("query text must not be empty"));
        }

        let name = collection_name(self.embedder.dims(), project.project_id);
        if !self.store.is_collection_exist(&name).await {
            warn!(project_id = project.project_id, collection = %name, "search on missing collection");
            return Ok(Vec::new());
        }

        let vectors = self
            .embedder
            .embed(&[text.to_string()], EmbedPurpose::Query)
            .await
            .inspect_err(|e| error!(error = %e, "failed to embed query"))?;

        let vector = match vectors.into_iter().next() {
            Some(v) if !v.is_empty() => v,
            _ => return Err(RagError::provider("embedding provider returned an empty vector")),
        };

        let results = self
            .store
            .search_by_vector(&name, &vector, limit)
            .await
            .inspect_err(|e| error!(collection = %name, error = %e, "vector search failed"))?;

        debug!(collection = %name, hits = results.len(), "search complete");
        Ok(results)
    }

    /// Answer `query` from the project's documents. `Ok(None)` means nothing
    /// relevant was retrieved.
    pub async fn answer_question(
        &self,
        project: &Project,
        query: &str,
        limit: usize,
    ) -> Result<Option<Answer>> {
        info!(project_id = project.project_id, "answering question");
        let documents = self.search_collection(project, query, limit).await?;
        if documents.is_empty() {
            warn!(project_id = project.project_id, "no documents retrieved");
            return Ok(None);
        }
        info!(count = documents.len(), "documents retrieved");

        let system_prompt = self.templates.get("rag", "system_prompt", None);

        let document_prompt = documents
            .iter()
            .enumerate()
            .map(|(i, doc)| {
                let vars = HashMap::from([
                    ("doc_num".to_string(), (i + 1).to_string()),
                    ("chunk_text".to_string(), self.generator.process_text(&doc.text)),
                ]);
                self.templates.get("rag", "document_prompt", Some(&vars))
            })
            .collect::<Vec<_>>()
            .join("\n");

        let footer_vars = HashMap::from([("query".to_string(), query.to_string())]);
        let footer_prompt = self.templates.get("rag", "footer_prompt", Some(&footer_vars));

        let chat_history = vec![self.generator.construct_message(&system_prompt, Role::System)];
        let full_prompt = format!("{}\n\n{}", document_prompt, footer_prompt);
        debug!(chars = full_prompt.chars().count(), "prompt constructed");

        let generated = match self.generator.generate(&full_prompt, &chat_history).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(error = %e, model = self.generator.model_name(), "generation failed");
                None
            }
        };

        let answer = match generated.filter(|a| !a.trim().is_empty()) {
            Some(answer) => answer,
            None => {
                warn!("generation produced no answer, using extractive summary");
                fallback_answer(&documents)
            }
        };

        Ok(Some(Answer {
            answer,
            full_prompt,
            chat_history,
        }))
    }
}

fn fallback_answer(documents: &[RetrievedDocument]) -> String {
    match panic::catch_unwind(AssertUnwindSafe(|| summarize(documents))) {
        Ok(summary) => summary,
        Err(_) => {
            error!("extractive summary failed");
            APOLOGY.to_string()
        }
    }
}
