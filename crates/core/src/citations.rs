use crate::models::{Citation, Route};
use crate::prompt::SourceRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledAnswer {
    pub text: String,
    pub citations: Vec<Citation>,
}

/// Rewrites `[S1]`-style markers in a finished answer into citations.
///
/// Markers that name no retrieved source, and every marker inside a
/// `### General Knowledge` section, are removed. A `Sources:` footer lists
/// the citations that remain; a CORPUS answer that cited nothing lists every
/// retrieved source instead.
pub fn reconcile(answer: &str, sources: &[SourceRef], route: Route) -> ReconciledAnswer {
    let mut used = CitationSet::default();
    let mut text = String::with_capacity(answer.len());
    let mut in_general_section = false;

    for line in answer.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("###") {
            in_general_section = trimmed.to_lowercase().contains("general knowledge");
            text.push_str(line);
            continue;
        }
        rewrite_line(line, sources, !in_general_section, &mut used, &mut text);
    }

    if used.is_empty() && route == Route::Corpus {
        for source in sources {
            used.add(source);
        }
    }

    let citations = used.into_citations();
    if !citations.is_empty() {
        let trimmed_len = text.trim_end().len();
        text.truncate(trimmed_len);
        text.push_str("\n\nSources:");
        for citation in &citations {
            text.push_str("\n- ");
            text.push_str(&citation.to_string());
        }
    }

    ReconciledAnswer {
        text: text.trim().to_string(),
        citations,
    }
}

fn rewrite_line(
    line: &str,
    sources: &[SourceRef],
    allow_citations: bool,
    used: &mut CitationSet,
    out: &mut String,
) {
    let mut rest = line;
    while let Some(open) = rest.find('[') {
        let Some((markers, consumed)) = parse_marker_group(&rest[open..]) else {
            out.push_str(&rest[..=open]);
            rest = &rest[open + 1..];
            continue;
        };

        let known: Vec<&SourceRef> = if allow_citations {
            markers
                .iter()
                .filter_map(|marker| sources.iter().find(|source| &source.marker == marker))
                .collect()
        } else {
            Vec::new()
        };

        let before = &rest[..open];
        if known.is_empty() {
            out.push_str(before.strip_suffix(' ').unwrap_or(before));
        } else {
            out.push_str(before);
            let mut group = CitationSet::default();
            for source in known {
                group.add(source);
                used.add(source);
            }
            let rendered = group
                .into_citations()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("");
            out.push_str(&rendered);
        }
        rest = &rest[open + consumed..];
    }
    out.push_str(rest);
}

/// Parses `[S1]` or `[S1, S3]` at the start of `text`, returning the markers
/// and the number of bytes consumed.
fn parse_marker_group(text: &str) -> Option<(Vec<String>, usize)> {
    let close = text.find(']')?;
    let inner = text.get(1..close)?;
    let markers = inner
        .split(',')
        .map(|part| {
            let part = part.trim();
            let digits = part.strip_prefix('S')?;
            if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
                return None;
            }
            Some(part.to_string())
        })
        .collect::<Option<Vec<_>>>()?;
    Some((markers, close + 1))
}

/// Citations grouped by source, in order of first use.
#[derive(Debug, Default)]
struct CitationSet {
    citations: Vec<Citation>,
}

impl CitationSet {
    fn add(&mut self, source: &SourceRef) {
        let existing = self.citations.iter_mut().find(|citation| {
            citation.document_id == source.document_id && citation.note_topic == source.note_topic
        });
        match existing {
            Some(citation) => {
                if source.note_topic.is_none() && !citation.pages.contains(&source.page) {
                    citation.pages.push(source.page);
                    citation.pages.sort_unstable();
                }
            }
            None => self.citations.push(source.citation()),
        }
    }

    fn is_empty(&self) -> bool {
        self.citations.is_empty()
    }

    fn into_citations(self) -> Vec<Citation> {
        self.citations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(marker: &str, page: u32) -> SourceRef {
        SourceRef {
            marker: marker.to_string(),
            document_id: "doc".to_string(),
            source_name: "kobun.pdf".to_string(),
            page,
            note_topic: None,
        }
    }

    fn note(marker: &str, topic: &str) -> SourceRef {
        SourceRef {
            marker: marker.to_string(),
            document_id: "notes".to_string(),
            source_name: "personal_notes".to_string(),
            page: 0,
            note_topic: Some(topic.to_string()),
        }
    }

    #[test]
    fn markers_become_page_citations() {
        let sources = vec![source("S1", 3), source("S2", 7)];
        let answer = reconcile("未然形 is the irrealis form [S1]. It takes ず [S1, S2].", &sources, Route::Corpus);

        assert_eq!(
            answer.text,
            "未然形 is the irrealis form [kobun.pdf p.3]. It takes ず [kobun.pdf p.3, p.7].\n\nSources:\n- [kobun.pdf p.3, p.7]"
        );
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].pages, vec![3, 7]);
    }

    #[test]
    fn unknown_markers_are_dropped() {
        let sources = vec![source("S1", 3)];
        let answer = reconcile("A claim [S9]. Another [S1].", &sources, Route::Corpus);
        assert_eq!(answer.text, "A claim. Another [kobun.pdf p.3].\n\nSources:\n- [kobun.pdf p.3]");
    }

    #[test]
    fn general_section_markers_are_dropped() {
        let sources = vec![source("S1", 3), note("S2", "particles")];
        let answer = reconcile(
            "### Textbook-grounded\nぞ triggers 連体形 [S2].\n\n### General Knowledge\nPoets loved it [S1].",
            &sources,
            Route::Hybrid,
        );

        assert!(answer.text.contains("ぞ triggers 連体形 [Note: particles]."));
        assert!(answer.text.contains("Poets loved it."));
        assert!(!answer.text.contains("[kobun.pdf"));
        assert_eq!(answer.citations.len(), 1);
        assert!(answer.text.ends_with("Sources:\n- [Note: particles]"));
    }

    #[test]
    fn uncited_corpus_answer_lists_all_sources() {
        let sources = vec![source("S1", 3), source("S2", 5)];
        let answer = reconcile("The form is used before ず.", &sources, Route::Corpus);
        assert!(answer.text.ends_with("Sources:\n- [kobun.pdf p.3, p.5]"));
    }

    #[test]
    fn general_answers_carry_no_citations() {
        let answer = reconcile("(General knowledge) Sei Shonagon wrote [S1] a lot.", &[], Route::General);
        assert_eq!(answer.text, "(General knowledge) Sei Shonagon wrote a lot.");
        assert!(answer.citations.is_empty());
    }

    #[test]
    fn ordinary_brackets_are_kept() {
        let answer = reconcile("Compare [a] with [S] and [S1x].", &[], Route::Hybrid);
        assert_eq!(answer.text, "Compare [a] with [S] and [S1x].");
    }
}
