use crate::config::PromptConfig;
use crate::error::ConfigError;
use crate::models::{Citation, Query, Role, Route, RouteDecision, ScoredChunk};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CORPUS_TEMPLATE: &str = "\
You are a patient tutor for classical Japanese. Answer the learner's question using only the textbook excerpts below.

Rules:
- Cite every claim with the marker of the excerpt it comes from, for example [S1].
- If the excerpts do not contain enough information, say so plainly instead of guessing.

Conversation so far:
{history}

Textbook excerpts:
{context}

Question: {question}

Answer:";

pub const GENERAL_TEMPLATE: &str = "\
You are a knowledgeable tutor for classical Japanese language and literature. No textbook material covers this question, so answer from general knowledge.

Rules:
- Start the answer with \"(General knowledge)\".
- Do not cite textbook pages or source markers.

Conversation so far:
{history}

Question: {question}

Answer:";

pub const HYBRID_TEMPLATE: &str = "\
You are a tutor for classical Japanese. Combine the textbook excerpts below with your general knowledge, in two sections:

### Textbook-grounded
Only what the excerpts support, each claim cited with its marker such as [S1]. Say so if the excerpts are insufficient.

### General Knowledge
Background from your own knowledge. Do not use source markers in this section.

Conversation so far:
{history}

Textbook excerpts:
{context}

Question: {question}

Answer:";

pub const CLARIFICATION_FRAGMENT: &str = "\
The question is ambiguous for the available material. Before answering in full, ask the learner one short question that would make clear what they want to know.";

const QUESTION: &str = "question";
const CONTEXT: &str = "context";
const HISTORY: &str = "history";

/// Marker handed to the model for one retrieved chunk, and the citation it
/// stands for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceRef {
    pub marker: String,
    pub document_id: String,
    pub source_name: String,
    pub page: u32,
    pub note_topic: Option<String>,
}

impl SourceRef {
    pub fn citation(&self) -> Citation {
        Citation {
            document_id: self.document_id.clone(),
            source_name: self.source_name.clone(),
            pages: if self.note_topic.is_some() {
                Vec::new()
            } else {
                vec![self.page]
            },
            note_topic: self.note_topic.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub route: Route,
    pub text: String,
    pub sources: Vec<SourceRef>,
}

/// The closed set of route templates, validated on construction.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    corpus: String,
    general: String,
    hybrid: String,
    clarification: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            corpus: CORPUS_TEMPLATE.to_string(),
            general: GENERAL_TEMPLATE.to_string(),
            hybrid: HYBRID_TEMPLATE.to_string(),
            clarification: CLARIFICATION_FRAGMENT.to_string(),
        }
    }
}

impl PromptTemplates {
    pub fn from_config(config: &PromptConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let templates = Self {
            corpus: config.corpus.clone().unwrap_or(defaults.corpus),
            general: config.general.clone().unwrap_or(defaults.general),
            hybrid: config.hybrid.clone().unwrap_or(defaults.hybrid),
            clarification: config.clarification.clone().unwrap_or(defaults.clarification),
        };
        templates.validate()?;
        Ok(templates)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for route in [Route::Corpus, Route::Hybrid] {
            let names = placeholders(self.template(route));
            for required in [QUESTION, CONTEXT] {
                if !names.iter().any(|name| name == required) {
                    return Err(ConfigError::MissingPlaceholder {
                        route: route.to_string(),
                        placeholder: required.to_string(),
                    });
                }
            }
        }

        let general = placeholders(&self.general);
        if !general.iter().any(|name| name == QUESTION) {
            return Err(ConfigError::MissingPlaceholder {
                route: Route::General.to_string(),
                placeholder: QUESTION.to_string(),
            });
        }
        if general.iter().any(|name| name == CONTEXT) {
            return Err(ConfigError::ForbiddenPlaceholder {
                route: Route::General.to_string(),
                placeholder: CONTEXT.to_string(),
            });
        }
        Ok(())
    }

    fn template(&self, route: Route) -> &str {
        match route {
            Route::Corpus => &self.corpus,
            Route::General => &self.general,
            Route::Hybrid => &self.hybrid,
        }
    }

    pub fn assemble(
        &self,
        decision: &RouteDecision,
        query: &Query,
        results: &[ScoredChunk],
    ) -> AssembledPrompt {
        let sources: Vec<SourceRef> = match decision.route {
            Route::General => Vec::new(),
            Route::Corpus | Route::Hybrid => results
                .iter()
                .enumerate()
                .map(|(index, result)| SourceRef {
                    marker: format!("S{}", index + 1),
                    document_id: result.chunk.document_id.clone(),
                    source_name: result.chunk.source_name.clone(),
                    page: result.chunk.page,
                    note_topic: result.chunk.note_topic.clone(),
                })
                .collect(),
        };

        let mut values = BTreeMap::new();
        values.insert(QUESTION, query.text.trim().to_string());
        values.insert(HISTORY, render_history(query));
        if decision.route != Route::General {
            values.insert(CONTEXT, render_context(&sources, results));
        }

        let mut text = render(self.template(decision.route), &values);
        if decision.needs_clarification {
            text.push_str("\n\n");
            text.push_str(&self.clarification);
        }

        AssembledPrompt {
            route: decision.route,
            text,
            sources,
        }
    }
}

fn render_history(query: &Query) -> String {
    if query.history.is_empty() {
        return "(no earlier turns)".to_string();
    }
    query
        .history
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                Role::User => "Learner",
                Role::Assistant => "Tutor",
            };
            format!("{speaker}: {}", turn.content.trim())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_context(sources: &[SourceRef], results: &[ScoredChunk]) -> String {
    if results.is_empty() {
        return "(no excerpts were found)".to_string();
    }
    sources
        .iter()
        .zip(results)
        .map(|(source, result)| {
            let header = match &source.note_topic {
                Some(topic) => format!("[{}] Note: {topic}", source.marker),
                None => format!(
                    "[{}] Source: {}, Page: {}",
                    source.marker, source.source_name, source.page
                ),
            };
            format!("{header}\n{}", result.chunk.text.trim())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Names of the `{name}` placeholders in `template`.
fn placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                if is_placeholder_name(name) {
                    names.push(name.to_string());
                }
                rest = &after[close + 1..];
            }
            None => break,
        }
    }
    names
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase() || c == '_')
}

/// Single-pass substitution, so text inserted for one placeholder is never
/// scanned for another.
fn render(template: &str, values: &BTreeMap<&str, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replacement = after
            .find('}')
            .and_then(|close| values.get(&after[..close]).map(|value| (close, value)));
        match replacement {
            Some((close, value)) => {
                output.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                output.push('{');
                rest = after;
            }
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, KnowledgeMode, QuestionLabel, RetrievalMetrics, Turn};
    use std::collections::BTreeSet;

    fn decision(route: Route, needs_clarification: bool) -> RouteDecision {
        RouteDecision {
            route,
            confidence: 0.8,
            metrics: RetrievalMetrics {
                density: 1.0,
                diversity: 1,
                mean_distance: 0.1,
                result_count: 1,
            },
            label: QuestionLabel::Grammar,
            overridden: false,
            needs_clarification,
            explanation: String::new(),
        }
    }

    fn result(page: u32, text: &str, note_topic: Option<&str>) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                chunk_id: format!("c{page}"),
                document_id: "doc".to_string(),
                source_name: "kobun.pdf".to_string(),
                page,
                chunk_index: 0,
                text: text.to_string(),
                char_start: 0,
                char_end: text.chars().count(),
                embedding: Vec::new(),
                tags: BTreeSet::new(),
                note_topic: note_topic.map(str::to_string),
            },
            distance: 0.1,
        }
    }

    #[test]
    fn corpus_prompt_numbers_sources() {
        let templates = PromptTemplates::default();
        let query = Query::new("What is 未然形?");
        let results = vec![
            result(3, "未然形は「まだ然らず」の形。", None),
            result(0, "remember ず attaches to 未然形", Some("negation")),
        ];

        let prompt = templates.assemble(&decision(Route::Corpus, false), &query, &results);
        assert!(prompt.text.contains("[S1] Source: kobun.pdf, Page: 3\n未然形は"));
        assert!(prompt.text.contains("[S2] Note: negation"));
        assert!(prompt.text.contains("Question: What is 未然形?"));
        assert_eq!(prompt.sources.len(), 2);
        assert_eq!(prompt.sources[0].marker, "S1");
        assert_eq!(prompt.sources[1].citation().to_string(), "[Note: negation]");
    }

    #[test]
    fn general_prompt_has_no_context_or_sources() {
        let templates = PromptTemplates::default();
        let query = Query::new("Who was Sei Shonagon?").with_mode(KnowledgeMode::General);
        let results = vec![result(3, "unrelated excerpt", None)];

        let prompt = templates.assemble(&decision(Route::General, false), &query, &results);
        assert!(prompt.sources.is_empty());
        assert!(!prompt.text.contains("unrelated excerpt"));
        assert!(prompt.text.contains("(General knowledge)"));
    }

    #[test]
    fn hybrid_prompt_has_both_sections_and_history() {
        let templates = PromptTemplates::default();
        let query = Query::new("How is けり used in the Tale of Genji?").with_history(vec![
            Turn {
                role: Role::User,
                content: "What does けり mean?".to_string(),
            },
            Turn {
                role: Role::Assistant,
                content: "It marks recollection.".to_string(),
            },
        ]);

        let prompt = templates.assemble(&decision(Route::Hybrid, true), &query, &[]);
        assert!(prompt.text.contains("### Textbook-grounded"));
        assert!(prompt.text.contains("### General Knowledge"));
        assert!(prompt.text.contains("Learner: What does けり mean?\nTutor: It marks recollection."));
        assert!(prompt.text.contains("(no excerpts were found)"));
        assert!(prompt.text.ends_with(CLARIFICATION_FRAGMENT));
    }

    #[test]
    fn question_text_is_not_treated_as_a_placeholder() {
        let templates = PromptTemplates::default();
        let query = Query::new("what does {context} mean?");
        let prompt = templates.assemble(&decision(Route::General, false), &query, &[]);
        assert!(prompt.text.contains("what does {context} mean?"));
    }

    #[test]
    fn general_template_must_not_reference_context() {
        let config = PromptConfig {
            general: Some("{question}\n{context}".to_string()),
            ..PromptConfig::default()
        };
        assert!(matches!(
            PromptTemplates::from_config(&config),
            Err(ConfigError::ForbiddenPlaceholder { .. })
        ));
    }

    #[test]
    fn hybrid_template_requires_context() {
        let config = PromptConfig {
            hybrid: Some("{question}".to_string()),
            ..PromptConfig::default()
        };
        assert!(matches!(
            PromptTemplates::from_config(&config),
            Err(ConfigError::MissingPlaceholder { placeholder, .. }) if placeholder == "context"
        ));
    }

    #[test]
    fn unknown_braces_are_left_alone() {
        let mut values = BTreeMap::new();
        values.insert(QUESTION, "q".to_string());
        assert_eq!(render("{ {question} {other} {", &values), "{ q {other} {");
    }
}
