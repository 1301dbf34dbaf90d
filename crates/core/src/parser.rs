use std::collections::VecDeque;

const OPEN_TAGS: [&str; 3] = ["<think>", "<thinking>", "<reasoning>"];
const CLOSE_TAGS: [&str; 3] = ["</think>", "</thinking>", "</reasoning>"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Reasoning(String),
    Answer(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Outside,
    Inside(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Outside,
    MaybeTag { origin: Origin, pending: String },
    InsideReasoning { tag: usize },
}

/// Splits a token stream into reasoning and answer text.
///
/// Reasoning is delimited by `<think>`, `<thinking>` or `<reasoning>` and the
/// matching closing tag, matched ASCII case-insensitively. A delimiter may be
/// split across any number of fragments; at most one tag's worth of text is
/// held back while a possible delimiter is incomplete.
#[derive(Debug, Clone)]
pub struct ReasoningParser {
    state: State,
}

impl Default for ReasoningParser {
    fn default() -> Self {
        Self {
            state: State::Outside,
        }
    }
}

impl ReasoningParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_inside_reasoning(&self) -> bool {
        matches!(
            self.state,
            State::InsideReasoning { .. }
                | State::MaybeTag {
                    origin: Origin::Inside(_),
                    ..
                }
        )
    }

    pub fn feed(&mut self, fragment: &str) -> Vec<Segment> {
        let mut out = Vec::new();
        let mut queue: VecDeque<char> = fragment.chars().collect();
        while let Some(c) = queue.pop_front() {
            self.step(c, &mut queue, &mut out);
        }
        out
    }

    /// Flushes a half-seen delimiter as literal text.
    pub fn finish(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        let state = std::mem::replace(&mut self.state, State::Outside);
        if let State::MaybeTag { origin, pending } = state {
            for c in pending.chars() {
                emit(&mut out, origin, c);
            }
            self.state = origin_state(origin);
        } else {
            self.state = state;
        }
        out
    }

    fn step(&mut self, c: char, queue: &mut VecDeque<char>, out: &mut Vec<Segment>) {
        match &mut self.state {
            State::Outside => {
                if c == '<' {
                    self.state = State::MaybeTag {
                        origin: Origin::Outside,
                        pending: c.to_string(),
                    };
                } else {
                    emit(out, Origin::Outside, c);
                }
            }
            State::InsideReasoning { tag } => {
                let tag = *tag;
                if c == '<' {
                    self.state = State::MaybeTag {
                        origin: Origin::Inside(tag),
                        pending: c.to_string(),
                    };
                } else {
                    emit(out, Origin::Inside(tag), c);
                }
            }
            State::MaybeTag { origin, pending } => {
                let origin = *origin;
                pending.push(c);
                let lowered = pending.to_ascii_lowercase();

                let candidates: Vec<(usize, &str)> = match origin {
                    Origin::Outside => OPEN_TAGS.iter().copied().enumerate().collect(),
                    Origin::Inside(tag) => vec![(tag, CLOSE_TAGS[tag])],
                };

                let complete = candidates.iter().find(|(_, candidate)| *candidate == lowered);
                if let Some((tag, _)) = complete {
                    self.state = match origin {
                        Origin::Outside => State::InsideReasoning { tag: *tag },
                        Origin::Inside(_) => State::Outside,
                    };
                    return;
                }
                if candidates.iter().any(|(_, candidate)| candidate.starts_with(&lowered)) {
                    return;
                }

                // Not a delimiter: the `<` is ordinary text and the rest is
                // scanned again from the origin state.
                let mut chars = pending.chars();
                if let Some(first) = chars.next() {
                    emit(out, origin, first);
                }
                for rest in chars.rev() {
                    queue.push_front(rest);
                }
                self.state = origin_state(origin);
            }
        }
    }
}

fn origin_state(origin: Origin) -> State {
    match origin {
        Origin::Outside => State::Outside,
        Origin::Inside(tag) => State::InsideReasoning { tag },
    }
}

fn emit(out: &mut Vec<Segment>, origin: Origin, c: char) {
    let reasoning = matches!(origin, Origin::Inside(_));
    match out.last_mut() {
        Some(Segment::Reasoning(text)) if reasoning => text.push(c),
        Some(Segment::Answer(text)) if !reasoning => text.push(c),
        _ if reasoning => out.push(Segment::Reasoning(c.to_string())),
        _ => out.push(Segment::Answer(c.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(fragments: &[&str]) -> (String, String) {
        let mut parser = ReasoningParser::new();
        let mut reasoning = String::new();
        let mut answer = String::new();
        let mut segments = Vec::new();
        for fragment in fragments {
            segments.extend(parser.feed(fragment));
        }
        segments.extend(parser.finish());
        for segment in segments {
            match segment {
                Segment::Reasoning(text) => reasoning.push_str(&text),
                Segment::Answer(text) => answer.push_str(&text),
            }
        }
        (reasoning, answer)
    }

    #[test]
    fn plain_answer_passes_through() {
        assert_eq!(
            run(&["未然形 is ", "the irrealis"]),
            (String::new(), "未然形 is the irrealis".to_string())
        );
    }

    #[test]
    fn reasoning_is_separated() {
        let (reasoning, answer) = run(&["<think>check p.3</think>The answer."]);
        assert_eq!(reasoning, "check p.3");
        assert_eq!(answer, "The answer.");
    }

    #[test]
    fn delimiters_split_across_fragments() {
        let (reasoning, answer) = run(&["<th", "ink>plan", "</thi", "nk>", "done"]);
        assert_eq!(reasoning, "plan");
        assert_eq!(answer, "done");
    }

    #[test]
    fn all_spellings_are_case_insensitive() {
        assert_eq!(run(&["<THINKING>a</Thinking>b"]), ("a".to_string(), "b".to_string()));
        assert_eq!(run(&["<Reasoning>a</REASONING>b"]), ("a".to_string(), "b".to_string()));
    }

    #[test]
    fn mismatched_close_tag_stays_reasoning() {
        let (reasoning, answer) = run(&["<think>x</thinking>y</think>z"]);
        assert_eq!(reasoning, "x</thinking>y");
        assert_eq!(answer, "z");
    }

    #[test]
    fn angle_brackets_in_text_are_kept() {
        assert_eq!(run(&["a < b and <br> <th"]), (String::new(), "a < b and <br> <th".to_string()));
        assert_eq!(run(&["<<think>r</think>"]), ("r".to_string(), "<".to_string()));
    }

    #[test]
    fn unterminated_reasoning_never_leaks() {
        let (reasoning, answer) = run(&["<think>still thinking </thi"]);
        assert_eq!(reasoning, "still thinking </thi");
        assert!(answer.is_empty());
    }

    proptest! {
        #[test]
        fn any_fragmentation_yields_the_same_split(
            before in "[a-z 未然形。<]{0,16}",
            reasoning in "[a-z 連用形、<]{0,16}",
            after in "[a-z 終止形。<]{0,16}",
            tag in 0usize..3,
            cuts in proptest::collection::vec(0usize..80, 0..6),
        ) {
            // No `>` in the generated text, so no delimiter can appear by accident.
            let name = ["think", "thinking", "reasoning"][tag];
            let full = format!("{before}<{}>{reasoning}</{name}>{after}", name.to_uppercase());
            let chars: Vec<char> = full.chars().collect();

            let mut points: Vec<usize> = cuts.iter().map(|cut| cut % (chars.len() + 1)).collect();
            points.sort_unstable();
            points.dedup();

            let mut fragments = Vec::new();
            let mut start = 0;
            for point in points {
                fragments.push(chars[start..point].iter().collect::<String>());
                start = point;
            }
            fragments.push(chars[start..].iter().collect::<String>());

            let refs: Vec<&str> = fragments.iter().map(String::as_str).collect();
            let (got_reasoning, got_answer) = run(&refs);
            prop_assert_eq!(got_reasoning, reasoning);
            prop_assert_eq!(got_answer, format!("{before}{after}"));
        }
    }
}
