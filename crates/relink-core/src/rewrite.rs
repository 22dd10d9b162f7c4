use crate::matcher::MatchResult;
use crate::model::{Block, BlockBody, Limits, Span};
use crate::pack::{build_spans, pack, tokenize_spans, PackReport, Token};
use crate::registry::normalize_title;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Match lookup
// ---------------------------------------------------------------------------

/// What a link token becomes after substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkOutcome {
    Mention(String),
    Marker,
}

/// Per-document lookup from normalized display text to substitution outcome,
/// built from match results before rewriting. Anything absent (content
/// changed between scan and rewrite) falls back to the unresolved marker.
#[derive(Debug, Default)]
pub struct MatchLookup {
    by_display: HashMap<String, LinkOutcome>,
}

impl MatchLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, display: &str, result: &MatchResult) {
        let outcome = match result {
            MatchResult::Resolved(target_id) => LinkOutcome::Mention(target_id.clone()),
            MatchResult::Ambiguous(_)
            | MatchResult::Unresolved
            | MatchResult::TargetMissing(_) => LinkOutcome::Marker,
        };
        self.by_display.insert(normalize_title(display), outcome);
    }

    fn get(&self, display: &str) -> LinkOutcome {
        self.by_display
            .get(&normalize_title(display))
            .cloned()
            .unwrap_or(LinkOutcome::Marker)
    }
}

/// Normalized plain-text marker for a pointer that could not be resolved,
/// embedding the original display text and target for follow-up.
pub fn unresolved_marker(display: &str, target: &str) -> String {
    format!("unresolved: {display} → {target}")
}

// ---------------------------------------------------------------------------
// Rewriting
// ---------------------------------------------------------------------------

/// Planned replacement for a container whose legacy pointers were rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewritePlan {
    pub container_id: String,
    pub body: BlockBody,
    /// Overflow siblings to append after the in-place update.
    pub overflow: Vec<Block>,
    pub report: PackReport,
}

/// Rewrite every legacy pointer in one container, in a single pass.
///
/// Tokenizes the container's spans, substitutes each link token with a
/// mention span (resolved) or the unresolved marker, re-packs the stream so
/// the result respects the destination limits, and merges adjacent
/// compatible text. Returns `None` when the container holds no legacy
/// pointer, which makes re-running the rewriter on an already-rewritten
/// container a no-op.
pub fn rewrite_block(block: &Block, lookup: &MatchLookup, limits: &Limits) -> Option<RewritePlan> {
    match &block.body {
        BlockBody::Spans(spans) => {
            let tokens = tokenize_spans(spans);
            if !has_link(&tokens) {
                return None;
            }
            let substituted = substitute(tokens, lookup);
            let (chunks, report) =
                pack(substituted, limits.safe_char_limit, limits.safe_count_limit);
            let mut iter = chunks.into_iter();
            let first = iter.next()?;
            let body = BlockBody::Spans(build_spans(&first, limits.char_limit));
            let overflow = iter
                .map(|chunk| Block {
                    id: String::new(),
                    kind: block.kind,
                    body: BlockBody::Spans(build_spans(&chunk, limits.char_limit)),
                    children: Vec::new(),
                })
                .collect();
            Some(RewritePlan {
                container_id: block.id.clone(),
                body,
                overflow,
                report,
            })
        }
        BlockBody::Cells(cells) => {
            let tokenized: Vec<Vec<Token>> =
                cells.iter().map(|cell| tokenize_spans(cell)).collect();
            if !tokenized.iter().any(|tokens| has_link(tokens)) {
                return None;
            }
            let mut report = PackReport::default();
            let mut new_cells = Vec::with_capacity(cells.len());
            for tokens in tokenized {
                let substituted = substitute(tokens, lookup);
                let (chunks, cell_report) =
                    pack(substituted, limits.safe_char_limit, limits.safe_count_limit);
                report.oversized_link_tokens += cell_report.oversized_link_tokens;
                let mut spans = Vec::new();
                for chunk in &chunks {
                    spans.extend(build_spans(chunk, limits.char_limit));
                }
                new_cells.push(spans);
            }
            Some(RewritePlan {
                container_id: block.id.clone(),
                body: BlockBody::Cells(new_cells),
                overflow: Vec::new(),
                report,
            })
        }
    }
}

fn has_link(tokens: &[Token]) -> bool {
    tokens.iter().any(|t| matches!(t, Token::Link { .. }))
}

fn substitute(tokens: Vec<Token>, lookup: &MatchLookup) -> Vec<Token> {
    tokens
        .into_iter()
        .map(|token| match token {
            Token::Link {
                display,
                target,
                formatting,
                ..
            } => match lookup.get(&display) {
                LinkOutcome::Mention(target_id) => Token::Other(Span::Mention { target_id }),
                LinkOutcome::Marker => Token::Marker {
                    content: unresolved_marker(&display, &target),
                    formatting,
                },
            },
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatchResult;
    use crate::model::{BlockKind, FormatAttrs};
    use crate::registry::RegistryEntry;

    fn lookup(entries: &[(&str, MatchResult)]) -> MatchLookup {
        let mut lookup = MatchLookup::new();
        for (display, result) in entries {
            lookup.insert(display, result);
        }
        lookup
    }

    fn spans_of(plan: &RewritePlan) -> &[Span] {
        match &plan.body {
            BlockBody::Spans(spans) => spans,
            BlockBody::Cells(_) => panic!("expected span body"),
        }
    }

    #[test]
    fn rewrites_mixed_resolution_paragraph() {
        // Registry maps "beta" → d3 and has no "gamma" entry.
        let block = Block::paragraph(
            "b1",
            vec![Span::text("[Beta](legacy://x) and [Gamma](legacy://y)")],
        );
        let lookup = lookup(&[
            ("Beta", MatchResult::Resolved("d3".into())),
            ("Gamma", MatchResult::Unresolved),
        ]);
        let plan = rewrite_block(&block, &lookup, &Limits::default()).expect("plan expected");

        assert_eq!(
            spans_of(&plan),
            &[
                Span::mention("d3"),
                Span::text(" and "),
                Span::text("unresolved: Gamma → legacy://y"),
            ]
        );
        assert!(plan.overflow.is_empty());
    }

    #[test]
    fn href_link_becomes_bare_mention() {
        let block = Block::paragraph(
            "b1",
            vec![Span::Text {
                content: "Beta Notes".into(),
                formatting: FormatAttrs::default(),
                hyperlink: Some("legacy://abc".into()),
            }],
        );
        let lookup = lookup(&[("Beta Notes", MatchResult::Resolved("d3".into()))]);
        let plan = rewrite_block(&block, &lookup, &Limits::default()).unwrap();
        assert_eq!(spans_of(&plan), &[Span::mention("d3")]);
    }

    #[test]
    fn ambiguous_and_missing_targets_get_markers() {
        let block = Block::paragraph(
            "b1",
            vec![Span::text("[A](legacy://1) [B](legacy://2)")],
        );
        let lookup = lookup(&[
            (
                "A",
                MatchResult::Ambiguous(vec![
                    RegistryEntry {
                        id: "d1".into(),
                        title: "A".into(),
                    },
                    RegistryEntry {
                        id: "d2".into(),
                        title: "A".into(),
                    },
                ]),
            ),
            ("B", MatchResult::TargetMissing("d9".into())),
        ]);
        let plan = rewrite_block(&block, &lookup, &Limits::default()).unwrap();
        // Markers stay separate spans; the plain text between them survives.
        assert_eq!(
            spans_of(&plan),
            &[
                Span::text("unresolved: A → legacy://1"),
                Span::text(" "),
                Span::text("unresolved: B → legacy://2"),
            ]
        );
    }

    #[test]
    fn rewriting_is_idempotent_on_rewritten_containers() {
        let block = Block::paragraph(
            "b1",
            vec![Span::text("[Beta](legacy://x) tail")],
        );
        let lookup = lookup(&[("Beta", MatchResult::Resolved("d3".into()))]);
        let plan = rewrite_block(&block, &lookup, &Limits::default()).unwrap();

        // Feed the rewritten container back in: no links remain, so the
        // second pass must be a no-op.
        let rewritten = Block {
            id: block.id.clone(),
            kind: BlockKind::Paragraph,
            body: plan.body.clone(),
            children: Vec::new(),
        };
        assert_eq!(rewrite_block(&rewritten, &lookup, &Limits::default()), None);
    }

    #[test]
    fn no_op_on_containers_without_links() {
        let block = Block::paragraph("b1", vec![Span::text("plain text"), Span::mention("d3")]);
        assert_eq!(
            rewrite_block(&block, &MatchLookup::new(), &Limits::default()),
            None
        );
    }

    #[test]
    fn display_text_missing_from_lookup_falls_back_to_marker() {
        // Content changed between scan and rewrite: the lookup has no entry.
        let block = Block::paragraph("b1", vec![Span::text("[New](legacy://z)")]);
        let plan = rewrite_block(&block, &MatchLookup::new(), &Limits::default()).unwrap();
        assert_eq!(
            spans_of(&plan),
            &[Span::text("unresolved: New → legacy://z")]
        );
    }

    #[test]
    fn preserves_non_link_text_around_substitutions() {
        let before = "prefix [Beta](legacy://x) middle [Beta](legacy://x) suffix";
        let block = Block::paragraph("b1", vec![Span::text(before)]);
        let lookup = lookup(&[("Beta", MatchResult::Resolved("d3".into()))]);
        let plan = rewrite_block(&block, &lookup, &Limits::default()).unwrap();

        // Concatenating non-mention text reproduces the original non-link text.
        let text: String = spans_of(&plan)
            .iter()
            .filter_map(|s| match s {
                Span::Text { content, .. } => Some(content.as_str()),
                Span::Mention { .. } => None,
            })
            .collect();
        assert_eq!(text, "prefix  middle  suffix");
    }

    #[test]
    fn oversized_rewrite_overflows_into_siblings() {
        let limits = Limits::default();
        let filler = "word ".repeat(500); // 2500 chars
        let content = format!("{filler}[Beta](legacy://x)");
        let block = Block::paragraph("b1", vec![Span::text(content)]);
        let lookup = lookup(&[("Beta", MatchResult::Resolved("d3".into()))]);
        let plan = rewrite_block(&block, &lookup, &limits).unwrap();

        assert!(!plan.overflow.is_empty());
        let all_bodies = std::iter::once(&plan.body)
            .chain(plan.overflow.iter().map(|b| &b.body));
        for body in all_bodies {
            let BlockBody::Spans(spans) = body else {
                panic!("expected span body")
            };
            assert!(spans.len() <= limits.count_limit);
            assert!(spans.iter().all(|s| s.char_len() <= limits.char_limit));
        }
        // The mention survived the overflow split.
        let mentions: usize = std::iter::once(&plan.body)
            .chain(plan.overflow.iter().map(|b| &b.body))
            .map(|body| match body {
                BlockBody::Spans(spans) => spans
                    .iter()
                    .filter(|s| matches!(s, Span::Mention { .. }))
                    .count(),
                BlockBody::Cells(_) => 0,
            })
            .sum();
        assert_eq!(mentions, 1);
    }

    #[test]
    fn rewrites_table_cells_in_place() {
        let block = Block {
            id: "row1".into(),
            kind: BlockKind::TableRow,
            body: BlockBody::Cells(vec![
                vec![Span::text("plain")],
                vec![Span::text("[Beta](legacy://x)")],
            ]),
            children: Vec::new(),
        };
        let lookup = lookup(&[("Beta", MatchResult::Resolved("d3".into()))]);
        let plan = rewrite_block(&block, &lookup, &Limits::default()).unwrap();
        let BlockBody::Cells(cells) = &plan.body else {
            panic!("expected cells");
        };
        assert_eq!(cells[0], vec![Span::text("plain")]);
        assert_eq!(cells[1], vec![Span::mention("d3")]);
        assert!(plan.overflow.is_empty());
    }
}
