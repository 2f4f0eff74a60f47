//! Deterministic query rewriting and ambiguity detection.
//!
//! Visitors ask about the persona in fragments: bare pronouns ("그는 뭐
//! 했어?"), single keywords ("경력"), or context-dependent follow-ups. The
//! rewriter normalizes these into retrieval-friendly queries through an
//! ordered rule pipeline, recording every change it makes:
//!
//! 1. Direct pronoun substitution from a fixed lookup table, guarded so a
//!    name-prefixed token is never substituted twice.
//! 2. Standalone-pronoun resolution, gated on a conjunction exception list
//!    and a persona mention in the last five history turns.
//! 3. Short-query expansion against a keyword table.
//! 4. Default-context injection when the persona is still unmentioned.
//!
//! If no rule fires and the query is unambiguous, the result is `method =
//! none` with `rewritten` byte-equal to the original.
//!
//! Rule tables live here as data (ordered, first match wins) so the ruleset
//! can grow without touching control flow.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PersonaConfig;
use crate::llm::{LanguageModel, LlmRequest};
use crate::models::{ChatMessage, RewriteMethod, RewriteResult, SeuResult};

/// Change labels recorded in [`RewriteResult::changes`].
pub const CHANGE_PRONOUN: &str = "pronoun_substitution";
pub const CHANGE_STANDALONE: &str = "standalone_pronoun_resolution";
pub const CHANGE_EXPANSION: &str = "short_query_expansion";
pub const CHANGE_DEFAULT_CONTEXT: &str = "default_context_injection";

/// History turns inspected when resolving a standalone pronoun.
const HISTORY_LOOKBACK: usize = 5;

/// Ambiguity length thresholds by script (characters, not bytes).
const AMBIGUOUS_LEN_HANGUL: usize = 3;
const AMBIGUOUS_LEN_LATIN: usize = 5;

/// Short-query expansion thresholds by script.
const SHORT_QUERY_LEN_HANGUL: usize = 6;
const SHORT_QUERY_LEN_LATIN: usize = 12;

/// Korean conjunctions/adverbs that begin with the standalone pronoun "그".
/// A token equal to one of these is connective tissue, not a reference to
/// the persona.
static PRONOUN_EXCEPTIONS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "그리고", "그래서", "그런데", "그러면", "그렇게", "그러나", "그러니까", "그때", "그만",
        "그냥", "그대로", "그중",
    ]
});

/// Bare interrogatives that make a query ambiguous on their own.
static BARE_INTERROGATIVES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "뭐", "뭘", "왜", "누구", "언제", "어디", "어때", "what", "why", "who", "when", "where",
        "how",
    ]
});

/// Closed set of single-noun queries about the persona that need a
/// clarifying question rather than a guess.
static AMBIGUOUS_NOUNS: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["나이", "생일", "연락처", "근황", "계획", "age", "contact", "plans"]);

/// "Short subject + particle" shape, e.g. "집은?", "회사는".
static SUBJECT_PARTICLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[가-힣]{1,3}(은|는|이|가)\??$").unwrap());

/// Built-in short-query keyword → expansion terms. Merged under the
/// persona-specific table from config, which wins on conflict.
static DEFAULT_EXPANSIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("경력", "경력 이력 직장 회사 커리어"),
        ("학력", "학력 학교 전공 대학"),
        ("취미", "취미 여가 관심사"),
        ("직업", "직업 하는 일 개발자"),
        ("프로젝트", "프로젝트 개발 작업물 포트폴리오"),
        ("기술", "기술 스택 언어 프레임워크"),
        ("블로그", "블로그 글 포스트"),
        ("career", "career work history company experience"),
        ("education", "education school degree major"),
        ("hobby", "hobby hobbies interests free time"),
        ("skills", "skills stack languages frameworks tools"),
        ("projects", "projects portfolio side projects"),
    ]
    .into_iter()
    .collect()
});

fn has_hangul(text: &str) -> bool {
    text.chars().any(|c| ('\u{AC00}'..='\u{D7A3}').contains(&c))
}

/// Normalizes visitor queries against a single persona.
pub struct QueryRewriter {
    persona: PersonaConfig,
    language_model: Option<Arc<dyn LanguageModel>>,
    /// Ordered pronoun lookup table: token form → replacement.
    pronoun_table: Vec<(String, String)>,
    expansions: HashMap<String, String>,
}

impl QueryRewriter {
    pub fn new(persona: &PersonaConfig, language_model: Option<Arc<dyn LanguageModel>>) -> Self {
        let name = persona.name.clone();
        let native = persona.name_native.clone();
        let possessive = persona.possessive();

        // Ordered by specificity: longer/possessive forms before bare ones.
        let pronoun_table = vec![
            ("그분은".to_string(), format!("{}은", native)),
            ("그분의".to_string(), format!("{}의", native)),
            ("그사람은".to_string(), format!("{}은", native)),
            ("그에게".to_string(), format!("{}에게", native)),
            ("그의".to_string(), format!("{}의", native)),
            ("그는".to_string(), format!("{}은", native)),
            ("그가".to_string(), format!("{}이", native)),
            ("그를".to_string(), format!("{}을", native)),
            ("his".to_string(), possessive.clone()),
            ("him".to_string(), name.clone()),
            ("he".to_string(), name.clone()),
        ];

        let mut expansions: HashMap<String, String> = DEFAULT_EXPANSIONS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (k, v) in &persona.expansions {
            expansions.insert(k.clone(), v.clone());
        }

        Self {
            persona: persona.clone(),
            language_model,
            pronoun_table,
            expansions,
        }
    }

    fn mentions_persona(&self, text: &str) -> bool {
        text.contains(&self.persona.name)
            || text.contains(&self.persona.name_native)
            || text
                .to_lowercase()
                .contains(&self.persona.name.to_lowercase())
    }

    /// Apply the deterministic rule pipeline.
    pub fn rewrite(&self, query: &str, history: &[ChatMessage]) -> RewriteResult {
        let original = query.to_string();
        let mut text = query.trim().to_string();
        let mut changes = Vec::new();

        if let Some(substituted) = self.substitute_pronouns(&text) {
            text = substituted;
            changes.push(CHANGE_PRONOUN.to_string());
        }

        if let Some(resolved) = self.resolve_standalone_pronoun(&text, history) {
            text = resolved;
            changes.push(CHANGE_STANDALONE.to_string());
        }

        if let Some(expanded) = self.expand_short_query(&text) {
            text = expanded;
            changes.push(CHANGE_EXPANSION.to_string());
        }

        if !self.mentions_persona(&text) {
            text = format!("{} {}", self.persona.name_native, text);
            changes.push(CHANGE_DEFAULT_CONTEXT.to_string());
        }

        let needs_clarification = self.is_ambiguous(query);

        if changes.is_empty() {
            let mut result = RewriteResult::unchanged(&original);
            result.needs_clarification = needs_clarification;
            return result;
        }

        RewriteResult {
            original,
            rewritten: text,
            method: RewriteMethod::Rule,
            changes,
            needs_clarification,
            suggested_questions: Vec::new(),
        }
    }

    /// Step 1: table substitution. Tokens already carrying the persona's
    /// name are skipped, so re-applying the rewriter never stacks prefixes.
    fn substitute_pronouns(&self, text: &str) -> Option<String> {
        let mut changed = false;
        let tokens: Vec<String> = text
            .split_whitespace()
            .map(|token| {
                let (core, trailing) = split_trailing_punct(token);
                if core.starts_with(&self.persona.name_native) || core.starts_with(&self.persona.name)
                {
                    return token.to_string();
                }
                for (form, replacement) in &self.pronoun_table {
                    let matches = if has_hangul(form) {
                        core == form
                    } else {
                        core.eq_ignore_ascii_case(form)
                    };
                    if matches {
                        changed = true;
                        return format!("{}{}", replacement, trailing);
                    }
                }
                token.to_string()
            })
            .collect();

        changed.then(|| tokens.join(" "))
    }

    /// Step 2: a bare "그" refers to the persona only when it is not one of
    /// the conjunction exceptions and the recent history actually mentions
    /// the persona by name.
    fn resolve_standalone_pronoun(&self, text: &str, history: &[ChatMessage]) -> Option<String> {
        let recent_mentions_persona = history
            .iter()
            .rev()
            .take(HISTORY_LOOKBACK)
            .any(|m| self.mentions_persona(&m.content));
        if !recent_mentions_persona {
            return None;
        }

        let mut changed = false;
        let tokens: Vec<String> = text
            .split_whitespace()
            .map(|token| {
                let (core, trailing) = split_trailing_punct(token);
                if PRONOUN_EXCEPTIONS.contains(&core) {
                    return token.to_string();
                }
                if core == "그" {
                    changed = true;
                    return format!("{}{}", self.persona.name_native, trailing);
                }
                token.to_string()
            })
            .collect();

        changed.then(|| tokens.join(" "))
    }

    /// Step 3: expand a recognized short keyword, or prefix the persona's
    /// name when the query is short but unrecognized.
    fn expand_short_query(&self, text: &str) -> Option<String> {
        let trimmed = text.trim();
        let len = trimmed.chars().count();
        let threshold = if has_hangul(trimmed) {
            SHORT_QUERY_LEN_HANGUL
        } else {
            SHORT_QUERY_LEN_LATIN
        };
        if len == 0 || len >= threshold {
            return None;
        }

        let key = trimmed.trim_end_matches(['?', '!', '.']).to_lowercase();
        if let Some(terms) = self.expansions.get(key.as_str()) {
            return Some(terms.clone());
        }
        if self.mentions_persona(trimmed) {
            return None;
        }
        Some(format!("{} {}", self.persona.name_native, trimmed))
    }

    /// Length- and pattern-based ambiguity classification.
    pub fn is_ambiguous(&self, query: &str) -> bool {
        let trimmed = query.trim().trim_end_matches(['?', '!', '.']);
        if trimmed.is_empty() {
            return true;
        }

        let len = trimmed.chars().count();
        let threshold = if has_hangul(trimmed) {
            AMBIGUOUS_LEN_HANGUL
        } else {
            AMBIGUOUS_LEN_LATIN
        };
        if len < threshold {
            return true;
        }

        let lower = trimmed.to_lowercase();
        if BARE_INTERROGATIVES.contains(&lower.as_str()) {
            return true;
        }
        if SUBJECT_PARTICLE_RE.is_match(trimmed) {
            return true;
        }
        AMBIGUOUS_NOUNS.contains(&lower.as_str())
    }

    /// Generate clarifying questions for an ambiguous query via the
    /// language model, falling back to a static set on provider failure.
    pub async fn generate_suggested_questions(
        &self,
        query: &str,
        context: Option<&str>,
        seu: Option<&SeuResult>,
    ) -> Vec<String> {
        let Some(model) = &self.language_model else {
            return self.fallback_questions();
        };

        let mut prompt = format!(
            "A visitor asked an ambiguous question about {}: \"{}\".\n",
            self.persona.name, query
        );
        if let Some(context) = context {
            prompt.push_str(&format!("Retrieved context:\n{}\n", context));
        }
        if let Some(seu) = seu {
            prompt.push_str(&format!(
                "Answer uncertainty was measured at {:.2}.\n",
                seu.uncertainty
            ));
        }
        prompt.push_str(
            "Suggest exactly 3 short, specific questions the visitor might have meant, \
             one per line, no numbering.",
        );

        match model.complete(&LlmRequest::user(prompt)).await {
            Ok(text) => {
                let questions: Vec<String> = text
                    .lines()
                    .map(|l| l.trim().trim_start_matches(['-', '*', ' ']).to_string())
                    .filter(|l| !l.is_empty())
                    .take(3)
                    .collect();
                if questions.is_empty() {
                    self.fallback_questions()
                } else {
                    questions
                }
            }
            Err(e) => {
                tracing::warn!("suggested question generation failed: {:#}", e);
                self.fallback_questions()
            }
        }
    }

    fn fallback_questions(&self) -> Vec<String> {
        vec![
            format!("{}의 경력이 궁금하신가요?", self.persona.name_native),
            format!("{}의 프로젝트가 궁금하신가요?", self.persona.name_native),
            format!("{}의 기술 스택이 궁금하신가요?", self.persona.name_native),
        ]
    }
}

/// Separate trailing punctuation from a token ("그는?" → ("그는", "?")).
fn split_trailing_punct(token: &str) -> (&str, &str) {
    let end = token
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_punctuation() || *c == '…')
        .map(|(i, _)| i)
        .last();
    match end {
        Some(i) => token.split_at(i),
        None => (token, ""),
    }
}

/// Build a result suitable for retrieval from a rewrite: the query text the
/// retriever should actually run.
pub fn search_query(result: &RewriteResult) -> &str {
    if result.rewritten.is_empty() {
        &result.original
    } else {
        &result.rewritten
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatMessage;
    use std::collections::HashMap;

    fn persona() -> PersonaConfig {
        PersonaConfig {
            name: "Taejun Kim".into(),
            name_native: "김태준".into(),
            name_possessive: None,
            expansions: HashMap::new(),
        }
    }

    fn rewriter() -> QueryRewriter {
        QueryRewriter::new(&persona(), None)
    }

    #[test]
    fn named_specific_query_is_noop() {
        let r = rewriter();
        let query = "김태준이 최근에 진행한 프로젝트는 무엇이고 어떤 기술을 썼나요?";
        let result = r.rewrite(query, &[]);
        assert_eq!(result.method, RewriteMethod::None);
        assert_eq!(result.rewritten, query);
        assert!(result.changes.is_empty());
        assert!(!result.needs_clarification);
    }

    #[test]
    fn pronoun_table_substitution() {
        let r = rewriter();
        let result = r.rewrite("그는 어떤 회사에서 일했나요?", &[]);
        assert!(result.changes.contains(&CHANGE_PRONOUN.to_string()));
        assert!(result.rewritten.contains("김태준은"));
        assert!(!result.rewritten.contains("그는"));
    }

    #[test]
    fn pronoun_substitution_is_idempotent() {
        let r = rewriter();
        let first = r.rewrite("그의 경력이 궁금합니다", &[]);
        let second = r.rewrite(&first.rewritten, &[]);
        assert_eq!(second.rewritten, first.rewritten);
        assert!(!second.rewritten.contains("김태준김태준"));
    }

    #[test]
    fn english_pronoun_substitution() {
        let r = rewriter();
        let result = r.rewrite("what companies did he work for and what did his role involve", &[]);
        assert!(result.changes.contains(&CHANGE_PRONOUN.to_string()));
        assert!(result.rewritten.contains("Taejun Kim"));
        assert!(result.rewritten.contains("Taejun Kim's"));
    }

    #[test]
    fn standalone_pronoun_needs_history_mention() {
        let r = rewriter();
        // No history: the bare 그 is left alone (default context still fires).
        let cold = r.rewrite("그 말고 다른 개발자에 대해서도 아나요", &[]);
        assert!(!cold.changes.contains(&CHANGE_STANDALONE.to_string()));

        let history = vec![
            ChatMessage::user("김태준의 경력을 알려줘"),
            ChatMessage::assistant("김태준은 백엔드 개발자입니다."),
        ];
        let warm = r.rewrite("그 이력서 좀 보여줘", &history);
        assert!(warm.changes.contains(&CHANGE_STANDALONE.to_string()));
        assert!(warm.rewritten.contains("김태준"));
    }

    #[test]
    fn conjunctions_are_never_substituted() {
        let r = rewriter();
        let history = vec![ChatMessage::user("김태준에 대해 알려줘")];
        let result = r.rewrite("그리고 그래서 어떻게 됐는데요", &history);
        assert!(!result.changes.contains(&CHANGE_STANDALONE.to_string()));
        assert!(result.rewritten.contains("그리고"));
        assert!(result.rewritten.contains("그래서"));
    }

    #[test]
    fn short_query_keyword_expansion() {
        let r = rewriter();
        let result = r.rewrite("경력", &[]);
        assert!(result.changes.contains(&CHANGE_EXPANSION.to_string()));
        assert!(result.changes.contains(&CHANGE_DEFAULT_CONTEXT.to_string()));
        assert!(result.rewritten.contains("김태준"));
        assert!(result.rewritten.contains("이력"));
    }

    #[test]
    fn short_unknown_query_gets_name_prefix() {
        let r = rewriter();
        let result = r.rewrite("고양이?", &[]);
        assert!(result.rewritten.starts_with("김태준"));
    }

    #[test]
    fn ambiguity_thresholds_by_script() {
        let r = rewriter();
        assert!(r.is_ambiguous("뭐"));
        assert!(r.is_ambiguous("경력"));
        assert!(r.is_ambiguous("job"));
        assert!(!r.is_ambiguous("김태준이 쓰는 언어"));
        assert!(!r.is_ambiguous("which programming languages does Taejun Kim use daily"));
    }

    #[test]
    fn subject_particle_pattern_is_ambiguous() {
        let r = rewriter();
        assert!(r.is_ambiguous("회사는?"));
        assert!(r.is_ambiguous("집은"));
    }

    #[test]
    fn closed_noun_set_is_ambiguous() {
        let r = rewriter();
        assert!(r.is_ambiguous("나이"));
        assert!(r.is_ambiguous("age"));
    }

    #[test]
    fn config_expansions_override_builtin() {
        let mut p = persona();
        p.expansions
            .insert("경력".to_string(), "경력 스타트업 창업".to_string());
        let r = QueryRewriter::new(&p, None);
        let result = r.rewrite("경력", &[]);
        assert!(result.rewritten.contains("스타트업"));
    }

    #[tokio::test]
    async fn suggested_questions_fall_back_without_model() {
        let r = rewriter();
        let questions = r.generate_suggested_questions("경력", None, None).await;
        assert_eq!(questions.len(), 3);
        assert!(questions[0].contains("김태준"));
    }
}
