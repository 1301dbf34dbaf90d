use crate::error::ConfigError;
use crate::models::QuestionLabel;
use crate::traits::QuestionClassifier;
use regex::Regex;

pub const GRAMMAR_TERMS: &[&str] = &[
    "particle", "auxiliary", "conjugation", "tense", "form", "grammar", "rule", "ending",
    "suffix", "prefix", "inflection", "case", "aspect", "mood", "助詞", "助動詞", "活用",
    "語尾", "文法", "けり", "なり", "たり", "未然形", "連用形", "終止形", "連体形", "已然形",
    "命令形", "係り結び",
];

pub const LITERATURE_TERMS: &[&str] = &[
    "poem", "poetry", "genji", "tale", "kokin", "manyou", "author", "work", "heian",
    "kamakura", "court", "culture", "emperor", "empress", "novel", "chronicle", "diary",
    "sei shonagon", "murasaki", "basho", "issa", "歌", "詩", "物語", "日記", "源氏",
    "枕草子", "万葉", "古今", "新古今", "作者", "天皇", "中宮", "宮廷", "文化", "平安", "鎌倉",
];

pub const USAGE_TERMS: &[&str] = &[
    "example", "usage", "appears", "used in", "how does", "literature", "context", "meaning",
    "interpretation", "analysis", "compare", "difference", "similar", "explain", "clarify",
    "demonstrate", "illustrate", "show me", "例", "使用", "用法", "意味", "解釈", "分析",
    "説明", "例示", "違い", "比較",
];

pub const GENERAL_PATTERNS: &[&str] = &[
    r"tell me about",
    r"what do you know about",
    r"background of",
    r"history of",
    r"who (was|is)",
    r"when (was|did)",
    r"cultural significance",
    r"influence of",
];

/// A general-knowledge phrasing counts this much towards LITERATURE.
const GENERAL_PATTERN_WEIGHT: f32 = 1.5;

enum Term {
    /// Latin-script terms match whole words only.
    Word(String, Regex),
    /// CJK terms match as substrings.
    Substring(String),
}

impl Term {
    fn compile(term: &str) -> Result<Self, ConfigError> {
        if term.is_ascii() {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(term));
            Ok(Term::Word(term.to_string(), Regex::new(&pattern)?))
        } else {
            Ok(Term::Substring(term.to_string()))
        }
    }

    fn label(&self) -> &str {
        match self {
            Term::Word(term, _) | Term::Substring(term) => term,
        }
    }

    fn is_match(&self, text: &str) -> bool {
        match self {
            Term::Word(_, pattern) => pattern.is_match(text),
            Term::Substring(term) => text.contains(term.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordSignals {
    pub grammar: Vec<String>,
    pub literature: Vec<String>,
    pub usage: Vec<String>,
    pub general_patterns: Vec<String>,
}

/// Deterministic classifier scoring a question against curated term lists.
///
/// Each matched grammar, literature or usage term adds one point to its label;
/// each general-knowledge phrasing adds 1.5 to LITERATURE. A question that
/// mixes grammar and literature terms adds `min(grammar, literature)` to
/// HYBRID. The highest score wins; a tie for first place, or no match at all,
/// gives UNKNOWN.
pub struct KeywordClassifier {
    grammar: Vec<Term>,
    literature: Vec<Term>,
    usage: Vec<Term>,
    general_patterns: Vec<(String, Regex)>,
}

impl KeywordClassifier {
    pub fn new() -> Result<Self, ConfigError> {
        Self::with_terms(GRAMMAR_TERMS, LITERATURE_TERMS, USAGE_TERMS, GENERAL_PATTERNS)
    }

    pub fn with_terms(
        grammar: &[&str],
        literature: &[&str],
        usage: &[&str],
        general_patterns: &[&str],
    ) -> Result<Self, ConfigError> {
        let compile = |terms: &[&str]| {
            terms
                .iter()
                .map(|term| Term::compile(term))
                .collect::<Result<Vec<Term>, ConfigError>>()
        };
        let general_patterns = general_patterns
            .iter()
            .map(|pattern| -> Result<(String, Regex), ConfigError> {
                Ok((pattern.to_string(), Regex::new(&format!("(?i){pattern}"))?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            grammar: compile(grammar)?,
            literature: compile(literature)?,
            usage: compile(usage)?,
            general_patterns,
        })
    }

    pub fn signals(&self, text: &str) -> KeywordSignals {
        let matched = |terms: &[Term]| {
            terms
                .iter()
                .filter(|term| term.is_match(text))
                .map(|term| term.label().to_string())
                .collect::<Vec<_>>()
        };

        KeywordSignals {
            grammar: matched(&self.grammar),
            literature: matched(&self.literature),
            usage: matched(&self.usage),
            general_patterns: self
                .general_patterns
                .iter()
                .filter(|(_, pattern)| pattern.is_match(text))
                .map(|(label, _)| label.clone())
                .collect(),
        }
    }
}

impl QuestionClassifier for KeywordClassifier {
    fn classify(&self, text: &str) -> QuestionLabel {
        let signals = self.signals(text);
        let grammar = signals.grammar.len() as f32;
        let literature = signals.literature.len() as f32
            + signals.general_patterns.len() as f32 * GENERAL_PATTERN_WEIGHT;
        let mut hybrid = signals.usage.len() as f32;
        if grammar > 0.0 && literature > 0.0 {
            hybrid += grammar.min(literature);
        }

        let scores = [
            (QuestionLabel::Grammar, grammar),
            (QuestionLabel::Literature, literature),
            (QuestionLabel::Hybrid, hybrid),
        ];
        let best = scores.iter().map(|(_, score)| *score).fold(0.0f32, f32::max);
        if best <= 0.0 {
            return QuestionLabel::Unknown;
        }

        let mut leaders = scores.iter().filter(|(_, score)| *score == best);
        match (leaders.next(), leaders.next()) {
            (Some((label, _)), None) => *label,
            _ => QuestionLabel::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(text: &str) -> QuestionLabel {
        match KeywordClassifier::new() {
            Ok(classifier) => classifier.classify(text),
            Err(error) => panic!("default term lists must compile: {error}"),
        }
    }

    #[test]
    fn grammar_questions() {
        assert_eq!(classify("What is 未然形?"), QuestionLabel::Grammar);
        assert_eq!(classify("How do you conjugate the auxiliary けり?"), QuestionLabel::Grammar);
    }

    #[test]
    fn literature_questions() {
        assert_eq!(classify("Who was Murasaki Shikibu?"), QuestionLabel::Literature);
        assert_eq!(classify("Tell me about the Heian court"), QuestionLabel::Literature);
    }

    #[test]
    fn mixed_signals_are_hybrid() {
        assert_eq!(
            classify("Show me an example of the particle ぞ in a poem"),
            QuestionLabel::Hybrid
        );
    }

    #[test]
    fn no_signal_or_tie_is_unknown() {
        assert_eq!(classify("hello there"), QuestionLabel::Unknown);
        assert_eq!(classify(""), QuestionLabel::Unknown);
        assert_eq!(classify("explain the particle"), QuestionLabel::Unknown);
    }

    #[test]
    fn latin_terms_need_word_boundaries() {
        let classifier = KeywordClassifier::new().expect("term lists compile");
        let signals = classifier.signals("Where can I find information about workflows?");
        assert!(signals.grammar.is_empty());
        assert!(signals.literature.is_empty());
    }

    #[test]
    fn classification_is_deterministic() {
        let question = "Compare けり and たり in the Tale of Genji";
        assert_eq!(classify(question), classify(question));
    }
}
