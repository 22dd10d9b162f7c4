use crate::model::{Block, BlockBody, FormatAttrs, LinkEncoding, Limits, Span};
use crate::scan::{embedded_link_regex, is_legacy_target};

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// Unit of the packing algorithm. Plain text may be cut at any character
/// boundary; a legacy-link token must stay intact; anything else (mentions)
/// passes through as an opaque single element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Text {
        content: String,
        formatting: FormatAttrs,
    },
    Link {
        display: String,
        target: String,
        /// Exact source text of the token, preserved when the link is left
        /// in place (normalization) rather than rewritten.
        raw: String,
        formatting: FormatAttrs,
        encoding: LinkEncoding,
    },
    /// Plain text that must stay its own span: the rewriter's unresolved
    /// marker. Splittable when oversized, never merged with a neighbor.
    Marker {
        content: String,
        formatting: FormatAttrs,
    },
    Other(Span),
}

impl Token {
    /// Character contribution towards the chunk character budget.
    pub fn char_len(&self) -> usize {
        match self {
            Token::Text { content, .. } | Token::Marker { content, .. } => {
                content.chars().count()
            }
            Token::Link { raw, .. } => raw.chars().count(),
            Token::Other(_) => 0,
        }
    }
}

/// Warnings accumulated by a packing call, returned alongside the result
/// instead of being pushed into shared state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackReport {
    /// Non-splittable link tokens longer than the character budget, each
    /// emitted alone in an oversized chunk.
    pub oversized_link_tokens: usize,
}

// ---------------------------------------------------------------------------
// Tokenization
// ---------------------------------------------------------------------------

/// Tokenize a span sequence, cutting text spans around embedded legacy links
/// so those substrings become non-splittable tokens. A span whose hyperlink
/// attribute carries the legacy scheme (and whose text has no embedded link)
/// becomes a single link token covering the whole span.
pub fn tokenize_spans(spans: &[Span]) -> Vec<Token> {
    let re = embedded_link_regex();
    let mut tokens = Vec::new();
    for span in spans {
        let Span::Text {
            content,
            formatting,
            hyperlink,
        } = span
        else {
            tokens.push(Token::Other(span.clone()));
            continue;
        };

        let mut pos = 0;
        let mut matched = false;
        for cap in re.captures_iter(content) {
            matched = true;
            let whole = cap.get(0).unwrap();
            if whole.start() > pos {
                tokens.push(Token::Text {
                    content: content[pos..whole.start()].to_string(),
                    formatting: formatting.clone(),
                });
            }
            tokens.push(Token::Link {
                display: cap[1].to_string(),
                target: cap[2].to_string(),
                raw: whole.as_str().to_string(),
                formatting: formatting.clone(),
                encoding: LinkEncoding::EmbeddedMarkup,
            });
            pos = whole.end();
        }
        if matched {
            if pos < content.len() {
                tokens.push(Token::Text {
                    content: content[pos..].to_string(),
                    formatting: formatting.clone(),
                });
            }
            continue;
        }

        if let Some(href) = hyperlink {
            if is_legacy_target(href) {
                tokens.push(Token::Link {
                    display: content.clone(),
                    target: href.clone(),
                    raw: content.clone(),
                    formatting: formatting.clone(),
                    encoding: LinkEncoding::HrefAttribute,
                });
                continue;
            }
        }

        tokens.push(Token::Text {
            content: content.clone(),
            formatting: formatting.clone(),
        });
    }
    tokens
}

// ---------------------------------------------------------------------------
// Splitting and packing
// ---------------------------------------------------------------------------

/// Cut plain text into pieces of at most `char_limit` characters, preferring
/// word boundaries. Every character of the input survives: pieces keep their
/// trailing separator, so concatenating them reproduces the input exactly.
/// A single word longer than the limit is hard-cut at character boundaries.
pub fn split_text(content: &str, char_limit: usize) -> Vec<String> {
    if content.chars().count() <= char_limit {
        return vec![content.to_string()];
    }
    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for segment in content.split_inclusive(' ') {
        let seg_len = segment.chars().count();
        if current_len + seg_len > char_limit && current_len > 0 {
            pieces.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if seg_len > char_limit {
            let mut rest = segment;
            loop {
                let rest_len = rest.chars().count();
                if rest_len <= char_limit {
                    break;
                }
                let cut = rest
                    .char_indices()
                    .nth(char_limit)
                    .map(|(i, _)| i)
                    .unwrap_or(rest.len());
                pieces.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current = rest.to_string();
            current_len = current.chars().count();
        } else {
            current.push_str(segment);
            current_len += seg_len;
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

struct Packer {
    chunks: Vec<Vec<Token>>,
    cur: Vec<Token>,
    chars: usize,
    elems: usize,
    char_limit: usize,
    count_limit: usize,
}

impl Packer {
    fn close(&mut self) {
        if !self.cur.is_empty() {
            self.chunks.push(std::mem::take(&mut self.cur));
            self.chars = 0;
            self.elems = 0;
        }
    }

    fn push(&mut self, token: Token, len: usize) {
        if !self.cur.is_empty()
            && (self.chars + len > self.char_limit || self.elems + 1 > self.count_limit)
        {
            self.close();
        }
        self.chars += len;
        self.elems += 1;
        self.cur.push(token);
    }
}

/// Greedily pack tokens into chunks that respect `char_limit` characters and
/// `count_limit` elements per chunk.
///
/// A splittable text token longer than the limit is cut via [`split_text`]
/// and its pieces packed normally. A non-splittable link token longer than
/// the limit cannot be cut: it is emitted alone in an oversized chunk and
/// counted in the returned [`PackReport`].
pub fn pack(
    tokens: Vec<Token>,
    char_limit: usize,
    count_limit: usize,
) -> (Vec<Vec<Token>>, PackReport) {
    let mut packer = Packer {
        chunks: Vec::new(),
        cur: Vec::new(),
        chars: 0,
        elems: 0,
        char_limit,
        count_limit,
    };
    let mut report = PackReport::default();

    for token in tokens {
        let len = token.char_len();
        match token {
            Token::Link { .. } if len > char_limit => {
                tracing::warn!(
                    len,
                    char_limit,
                    "non-splittable link token exceeds the character budget; emitting oversized chunk"
                );
                report.oversized_link_tokens += 1;
                packer.close();
                packer.chunks.push(vec![token]);
            }
            Token::Text {
                content,
                formatting,
            } if len > char_limit => {
                for piece in split_text(&content, char_limit) {
                    let piece_len = piece.chars().count();
                    packer.push(
                        Token::Text {
                            content: piece,
                            formatting: formatting.clone(),
                        },
                        piece_len,
                    );
                }
            }
            Token::Marker {
                content,
                formatting,
            } if len > char_limit => {
                for piece in split_text(&content, char_limit) {
                    let piece_len = piece.chars().count();
                    packer.push(
                        Token::Marker {
                            content: piece,
                            formatting: formatting.clone(),
                        },
                        piece_len,
                    );
                }
            }
            other => packer.push(other, len),
        }
    }
    packer.close();
    (packer.chunks, report)
}

// ---------------------------------------------------------------------------
// Span reconstruction
// ---------------------------------------------------------------------------

/// Build a span sequence from a packed chunk, merging adjacent plain-text
/// tokens with identical formatting up to `char_limit` to minimize span
/// count. Link tokens round-trip to their source form and are never merged
/// with a neighbor.
pub fn build_spans(tokens: &[Token], char_limit: usize) -> Vec<Span> {
    // (span, mergeable): link-derived and passthrough spans are sealed.
    let mut out: Vec<(Span, bool)> = Vec::new();
    for token in tokens {
        match token {
            Token::Text {
                content,
                formatting,
            } => {
                if let Some((
                    Span::Text {
                        content: prev,
                        formatting: prev_fmt,
                        hyperlink: None,
                    },
                    true,
                )) = out.last_mut()
                {
                    if prev_fmt == formatting
                        && prev.chars().count() + content.chars().count() <= char_limit
                    {
                        prev.push_str(content);
                        continue;
                    }
                }
                out.push((
                    Span::Text {
                        content: content.clone(),
                        formatting: formatting.clone(),
                        hyperlink: None,
                    },
                    true,
                ));
            }
            Token::Marker {
                content,
                formatting,
            } => {
                out.push((
                    Span::Text {
                        content: content.clone(),
                        formatting: formatting.clone(),
                        hyperlink: None,
                    },
                    false,
                ));
            }
            Token::Link {
                raw,
                target,
                formatting,
                encoding,
                ..
            } => {
                let hyperlink = match encoding {
                    LinkEncoding::EmbeddedMarkup => None,
                    LinkEncoding::HrefAttribute => Some(target.clone()),
                };
                out.push((
                    Span::Text {
                        content: raw.clone(),
                        formatting: formatting.clone(),
                        hyperlink,
                    },
                    false,
                ));
            }
            Token::Other(span) => out.push((span.clone(), false)),
        }
    }
    out.into_iter().map(|(span, _)| span).collect()
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Whether a container already violates (or is dangerously close to) the
/// destination limits and must be split before rewriting: any single text
/// span over the hard character limit, span count over the safe budget, or
/// summed characters over the safe budget.
pub fn needs_normalization(block: &Block, limits: &Limits) -> bool {
    let over = |spans: &[Span]| -> bool {
        if spans.iter().any(|s| s.char_len() > limits.char_limit) {
            return true;
        }
        if spans.len() > limits.safe_count_limit {
            return true;
        }
        spans.iter().map(Span::char_len).sum::<usize>() > limits.safe_char_limit
    };
    match &block.body {
        BlockBody::Spans(spans) => over(spans),
        BlockBody::Cells(cells) => cells.iter().any(|cell| over(cell)),
    }
}

/// Planned replacement for an oversized container: the first chunk replaces
/// the container in place, the rest are appended as new siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizePlan {
    pub body: BlockBody,
    pub overflow: Vec<Block>,
    pub report: PackReport,
}

/// Compute the normalization plan for a container, or `None` if it is
/// already within limits. Table rows are repacked per cell in place; flat
/// containers overflow into appended siblings of the same kind.
pub fn plan_normalization(block: &Block, limits: &Limits) -> Option<NormalizePlan> {
    if !needs_normalization(block, limits) {
        return None;
    }
    match &block.body {
        BlockBody::Spans(spans) => {
            let tokens = tokenize_spans(spans);
            let (chunks, report) = pack(tokens, limits.safe_char_limit, limits.safe_count_limit);
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
            Some(NormalizePlan {
                body,
                overflow,
                report,
            })
        }
        BlockBody::Cells(cells) => {
            // Rows have no meaningful sibling overflow; repack each cell and
            // rejoin the chunks so every span is individually within limits.
            let mut report = PackReport::default();
            let mut new_cells = Vec::with_capacity(cells.len());
            for cell in cells {
                let tokens = tokenize_spans(cell);
                let (chunks, cell_report) =
                    pack(tokens, limits.safe_char_limit, limits.safe_count_limit);
                report.oversized_link_tokens += cell_report.oversized_link_tokens;
                let mut spans = Vec::new();
                for chunk in &chunks {
                    spans.extend(build_spans(chunk, limits.char_limit));
                }
                if spans.len() > limits.count_limit {
                    tracing::warn!(
                        block_id = %block.id,
                        spans = spans.len(),
                        "table cell still exceeds span-count limit after repacking"
                    );
                }
                new_cells.push(spans);
            }
            Some(NormalizePlan {
                body: BlockBody::Cells(new_cells),
                overflow: Vec::new(),
                report,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockKind;

    fn text_token(content: &str) -> Token {
        Token::Text {
            content: content.into(),
            formatting: FormatAttrs::default(),
        }
    }

    fn link_token(raw_len: usize) -> Token {
        Token::Link {
            display: "x".into(),
            target: "legacy://x".into(),
            raw: "x".repeat(raw_len),
            formatting: FormatAttrs::default(),
            encoding: LinkEncoding::EmbeddedMarkup,
        }
    }

    fn chunk_text(chunk: &[Token]) -> String {
        chunk
            .iter()
            .map(|t| match t {
                Token::Text { content, .. } | Token::Marker { content, .. } => content.clone(),
                Token::Link { raw, .. } => raw.clone(),
                Token::Other(_) => String::new(),
            })
            .collect()
    }

    // === split_text ===

    #[test]
    fn split_prefers_word_boundaries_and_preserves_content() {
        let input = "alpha beta gamma delta";
        let pieces = split_text(input, 12);
        assert!(pieces.iter().all(|p| p.chars().count() <= 12));
        assert_eq!(pieces.concat(), input);
        assert!(pieces.len() >= 2);
        // No word is cut in half.
        for piece in &pieces {
            assert!(piece.trim_end().split(' ').all(|w| !w.is_empty()));
        }
    }

    #[test]
    fn split_hard_cuts_single_long_word() {
        let input = "a".repeat(10);
        let pieces = split_text(&input, 4);
        assert_eq!(pieces, vec!["aaaa", "aaaa", "aa"]);
    }

    #[test]
    fn split_is_identity_under_limit() {
        assert_eq!(split_text("short", 100), vec!["short"]);
    }

    // === pack ===

    #[test]
    fn packs_long_plain_text_into_compliant_chunks() {
        let content = "word ".repeat(900).trim_end().to_string();
        assert_eq!(content.chars().count(), 4499);
        let (chunks, report) = pack(vec![text_token(&content)], 1800, 80);
        assert_eq!(chunks.len(), 3);
        assert_eq!(report, PackReport::default());
        let mut rebuilt = String::new();
        for chunk in &chunks {
            let text = chunk_text(chunk);
            assert!(text.chars().count() <= 2000);
            rebuilt.push_str(&text);
        }
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn never_splits_a_link_token() {
        let tokens = vec![
            text_token(&"a".repeat(1500)),
            link_token(500),
            text_token(&"b".repeat(1500)),
        ];
        let (chunks, _) = pack(tokens, 1800, 80);
        for chunk in &chunks {
            for token in chunk {
                if let Token::Link { raw, .. } = token {
                    assert_eq!(raw.chars().count(), 500, "link token was cut");
                }
            }
        }
        // All characters survive in order.
        let rebuilt: String = chunks.iter().map(|c| chunk_text(c)).collect();
        assert_eq!(rebuilt.chars().count(), 1500 + 500 + 1500);
    }

    #[test]
    fn oversized_link_token_goes_into_its_own_chunk() {
        let tokens = vec![text_token("before"), link_token(2500), text_token("after")];
        let (chunks, report) = pack(tokens, 1800, 80);
        assert_eq!(report.oversized_link_tokens, 1);
        let lone = chunks
            .iter()
            .find(|c| c.len() == 1 && matches!(c[0], Token::Link { .. }))
            .expect("oversized link should be alone in a chunk");
        assert_eq!(lone[0].char_len(), 2500);
    }

    #[test]
    fn respects_element_count_limit() {
        let tokens: Vec<Token> = (0..5).map(|_| Token::Other(Span::mention("d1"))).collect();
        let (chunks, _) = pack(tokens, 1800, 2);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 2));
    }

    // === build_spans ===

    #[test]
    fn merges_adjacent_text_with_same_formatting() {
        let tokens = vec![text_token("hello "), text_token("world")];
        let spans = build_spans(&tokens, 2000);
        assert_eq!(spans, vec![Span::text("hello world")]);
    }

    #[test]
    fn does_not_merge_across_formatting_changes() {
        let bold = FormatAttrs {
            bold: true,
            ..FormatAttrs::default()
        };
        let tokens = vec![
            text_token("plain "),
            Token::Text {
                content: "bold".into(),
                formatting: bold.clone(),
            },
        ];
        let spans = build_spans(&tokens, 2000);
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn merge_respects_char_limit() {
        let tokens = vec![text_token(&"a".repeat(1500)), text_token(&"b".repeat(600))];
        let spans = build_spans(&tokens, 2000);
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|s| s.char_len() <= 2000));
    }

    #[test]
    fn never_merges_a_link_with_its_neighbors() {
        let tokens = vec![
            text_token("see "),
            Token::Link {
                display: "Beta".into(),
                target: "legacy://x".into(),
                raw: "[Beta](legacy://x)".into(),
                formatting: FormatAttrs::default(),
                encoding: LinkEncoding::EmbeddedMarkup,
            },
            text_token(" here"),
        ];
        let spans = build_spans(&tokens, 2000);
        assert_eq!(spans.len(), 3);
        assert_eq!(
            spans[1],
            Span::Text {
                content: "[Beta](legacy://x)".into(),
                formatting: FormatAttrs::default(),
                hyperlink: None,
            }
        );
    }

    #[test]
    fn href_link_round_trips_its_hyperlink() {
        let spans_in = vec![Span::Text {
            content: "Beta Notes".into(),
            formatting: FormatAttrs::default(),
            hyperlink: Some("legacy://abc".into()),
        }];
        let tokens = tokenize_spans(&spans_in);
        let spans_out = build_spans(&tokens, 2000);
        assert_eq!(spans_out, spans_in);
    }

    // === tokenize_spans ===

    #[test]
    fn tokenizes_text_around_embedded_links() {
        let spans = vec![Span::text("a [B](legacy://x) c [D](legacy://y)")];
        let tokens = tokenize_spans(&spans);
        assert_eq!(tokens.len(), 4);
        assert!(matches!(&tokens[0], Token::Text { content, .. } if content == "a "));
        assert!(matches!(&tokens[1], Token::Link { display, .. } if display == "B"));
        assert!(matches!(&tokens[2], Token::Text { content, .. } if content == " c "));
        assert!(matches!(&tokens[3], Token::Link { display, .. } if display == "D"));
    }

    #[test]
    fn mentions_pass_through_as_other() {
        let spans = vec![Span::mention("d1")];
        let tokens = tokenize_spans(&spans);
        assert_eq!(tokens, vec![Token::Other(Span::mention("d1"))]);
    }

    // === normalization ===

    #[test]
    fn normalization_detection_thresholds() {
        let limits = Limits::default();
        let fine = Block::paragraph("b", vec![Span::text("short")]);
        assert!(!needs_normalization(&fine, &limits));

        let long_span = Block::paragraph("b", vec![Span::text("x".repeat(2001))]);
        assert!(needs_normalization(&long_span, &limits));

        let many = Block::paragraph("b", (0..81).map(|_| Span::text("a")).collect());
        assert!(needs_normalization(&many, &limits));

        let total = Block::paragraph(
            "b",
            vec![Span::text("x".repeat(1000)), Span::text("y".repeat(900))],
        );
        assert!(needs_normalization(&total, &limits));
    }

    #[test]
    fn plan_splits_oversized_block_into_siblings() {
        let limits = Limits::default();
        let content = "word ".repeat(900); // 4500 chars
        let block = Block::paragraph("b1", vec![Span::text(content.clone())]);
        let plan = plan_normalization(&block, &limits).expect("plan expected");

        let BlockBody::Spans(first) = &plan.body else {
            panic!("expected span body");
        };
        assert_eq!(plan.overflow.len(), 2);
        assert!(plan.overflow.iter().all(|b| b.kind == BlockKind::Paragraph));

        let mut rebuilt = String::new();
        for span in first {
            if let Span::Text { content, .. } = span {
                rebuilt.push_str(content);
            }
        }
        for block in &plan.overflow {
            if let BlockBody::Spans(spans) = &block.body {
                for span in spans {
                    if let Span::Text { content, .. } = span {
                        rebuilt.push_str(content);
                    }
                }
            }
        }
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn plan_is_none_for_compliant_blocks() {
        let block = Block::paragraph("b1", vec![Span::text("fine")]);
        assert!(plan_normalization(&block, &Limits::default()).is_none());
    }
}
