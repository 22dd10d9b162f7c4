use crate::model::{
    Block, BlockBody, BlockKind, Document, LinkEncoding, LinkReference, Span, SpanAddress,
};
use regex::Regex;
use std::sync::LazyLock;

/// Scheme prefix of the old system's addressing. Anything starting with this
/// prefix in a link target is a legacy pointer.
pub const LEGACY_SCHEME: &str = "legacy";

// Compile once, reuse across calls
static EMBEDDED_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\]]*)\]\((legacy[a-zA-Z0-9\-._~:/?#\[\]@!$&'()*+,;=%]*)\)").unwrap()
});

/// True if `target` uses the legacy addressing scheme.
pub fn is_legacy_target(target: &str) -> bool {
    target.starts_with(LEGACY_SCHEME)
}

/// The shared embedded-markup pattern, used by the tokenizer so packing never
/// splits a token the scanner would have matched.
pub fn embedded_link_regex() -> &'static Regex {
    &EMBEDDED_LINK_RE
}

/// Whether a container kind carries scannable text.
pub fn is_text_bearing(kind: BlockKind) -> bool {
    match kind {
        BlockKind::Paragraph
        | BlockKind::Heading1
        | BlockKind::Heading2
        | BlockKind::Heading3
        | BlockKind::BulletedListItem
        | BlockKind::NumberedListItem
        | BlockKind::ToDo
        | BlockKind::Quote
        | BlockKind::Callout
        | BlockKind::Toggle
        | BlockKind::TableRow => true,
    }
}

// ---------------------------------------------------------------------------
// Two-pass detection
// ---------------------------------------------------------------------------

/// Detect every legacy pointer in a document's content tree.
///
/// Pass A: all non-overlapping `[display](legacy:…)` matches inside span
/// text. Pass B: a legacy target in the span's hyperlink attribute, taken
/// only when Pass A found nothing in that span (the whole span text becomes
/// the display text). The two passes are exclusive per span but independent
/// across spans.
///
/// Traversal is an explicit pre-order worklist over nested children; table
/// rows are scanned per cell so the address can re-locate the exact span.
pub fn scan_document(doc: &Document) -> Vec<LinkReference> {
    let mut refs = Vec::new();
    let mut stack: Vec<&Block> = doc.blocks.iter().rev().collect();
    while let Some(block) = stack.pop() {
        if is_text_bearing(block.kind) {
            match &block.body {
                BlockBody::Spans(spans) => {
                    scan_spans(doc, &block.id, None, spans, &mut refs);
                }
                BlockBody::Cells(cells) => {
                    for (cell_idx, cell) in cells.iter().enumerate() {
                        scan_spans(doc, &block.id, Some(cell_idx), cell, &mut refs);
                    }
                }
            }
        }
        for child in block.children.iter().rev() {
            stack.push(child);
        }
    }
    refs
}

fn scan_spans(
    doc: &Document,
    block_id: &str,
    cell: Option<usize>,
    spans: &[Span],
    refs: &mut Vec<LinkReference>,
) {
    for (span_idx, span) in spans.iter().enumerate() {
        let Span::Text {
            content, hyperlink, ..
        } = span
        else {
            continue;
        };

        let mut found_embedded = false;
        for cap in EMBEDDED_LINK_RE.captures_iter(content) {
            found_embedded = true;
            refs.push(LinkReference {
                document_id: doc.id.clone(),
                document_title: doc.title.clone(),
                address: SpanAddress {
                    block_id: block_id.to_string(),
                    cell,
                    span: span_idx,
                },
                display_text: cap[1].to_string(),
                raw_target: cap[2].to_string(),
                encoding: LinkEncoding::EmbeddedMarkup,
            });
        }
        if found_embedded {
            continue;
        }

        if let Some(href) = hyperlink {
            if is_legacy_target(href) {
                refs.push(LinkReference {
                    document_id: doc.id.clone(),
                    document_title: doc.title.clone(),
                    address: SpanAddress {
                        block_id: block_id.to_string(),
                        cell,
                        span: span_idx,
                    },
                    display_text: content.clone(),
                    raw_target: href.clone(),
                    encoding: LinkEncoding::HrefAttribute,
                });
            }
        }
    }
}

/// Whole-document count of embedded-markup legacy links, independent of the
/// scanner. Cross-checks that scanning did not miss matches inside a span.
pub fn census(doc: &Document) -> usize {
    let mut total = 0;
    let mut stack: Vec<&Block> = doc.blocks.iter().rev().collect();
    while let Some(block) = stack.pop() {
        let count_spans = |spans: &[Span]| -> usize {
            spans
                .iter()
                .map(|s| match s {
                    Span::Text { content, .. } => EMBEDDED_LINK_RE.find_iter(content).count(),
                    Span::Mention { .. } => 0,
                })
                .sum()
        };
        match &block.body {
            BlockBody::Spans(spans) => total += count_spans(spans),
            BlockBody::Cells(cells) => {
                total += cells.iter().map(|c| count_spans(c)).sum::<usize>();
            }
        }
        for child in block.children.iter().rev() {
            stack.push(child);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FormatAttrs;

    fn doc(blocks: Vec<Block>) -> Document {
        Document {
            id: "doc1".into(),
            title: "Source".into(),
            blocks,
        }
    }

    fn linked_span(content: &str, href: &str) -> Span {
        Span::Text {
            content: content.into(),
            formatting: FormatAttrs::default(),
            hyperlink: Some(href.into()),
        }
    }

    #[test]
    fn finds_single_embedded_link() {
        let d = doc(vec![Block::paragraph(
            "b1",
            vec![Span::text("See [Beta](legacy://x) for details")],
        )]);
        let refs = scan_document(&d);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].display_text, "Beta");
        assert_eq!(refs[0].raw_target, "legacy://x");
        assert_eq!(refs[0].encoding, LinkEncoding::EmbeddedMarkup);
        assert_eq!(refs[0].address.span, 0);
    }

    #[test]
    fn finds_all_links_in_one_span() {
        let d = doc(vec![Block::paragraph(
            "b1",
            vec![Span::text("[Beta](legacy://x) and [Gamma](legacy://y)")],
        )]);
        let refs = scan_document(&d);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].display_text, "Beta");
        assert_eq!(refs[1].display_text, "Gamma");
    }

    #[test]
    fn href_pass_uses_whole_span_text() {
        let d = doc(vec![Block::paragraph(
            "b1",
            vec![linked_span("Beta Notes", "legacy://abc")],
        )]);
        let refs = scan_document(&d);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].display_text, "Beta Notes");
        assert_eq!(refs[0].encoding, LinkEncoding::HrefAttribute);
    }

    #[test]
    fn embedded_pass_shadows_href_in_same_span() {
        let d = doc(vec![Block::paragraph(
            "b1",
            vec![linked_span("[Beta](legacy://x)", "legacy://other")],
        )]);
        let refs = scan_document(&d);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].encoding, LinkEncoding::EmbeddedMarkup);
    }

    #[test]
    fn passes_are_independent_across_spans() {
        let d = doc(vec![Block::paragraph(
            "b1",
            vec![
                Span::text("[Beta](legacy://x)"),
                linked_span("Gamma", "legacy://y"),
            ],
        )]);
        let refs = scan_document(&d);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].encoding, LinkEncoding::EmbeddedMarkup);
        assert_eq!(refs[1].encoding, LinkEncoding::HrefAttribute);
        assert_eq!(refs[1].address.span, 1);
    }

    #[test]
    fn ignores_non_legacy_schemes() {
        let d = doc(vec![Block::paragraph(
            "b1",
            vec![
                Span::text("[Site](https://example.com)"),
                linked_span("Elsewhere", "https://example.com"),
            ],
        )]);
        assert!(scan_document(&d).is_empty());
    }

    #[test]
    fn recurses_into_children() {
        let mut parent = Block::paragraph("b1", vec![Span::text("no links here")]);
        parent.children.push(Block::paragraph(
            "b2",
            vec![Span::text("[Beta](legacy://x)")],
        ));
        let refs = scan_document(&doc(vec![parent]));
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].address.block_id, "b2");
    }

    #[test]
    fn scans_table_cells_with_cell_coordinates() {
        let d = doc(vec![Block {
            id: "row1".into(),
            kind: BlockKind::TableRow,
            body: BlockBody::Cells(vec![
                vec![Span::text("plain")],
                vec![Span::text("[Beta](legacy://x)")],
            ]),
            children: Vec::new(),
        }]);
        let refs = scan_document(&d);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].address.cell, Some(1));
        assert_eq!(refs[0].address.span, 0);
    }

    #[test]
    fn mentions_are_skipped() {
        let d = doc(vec![Block::paragraph(
            "b1",
            vec![Span::mention("d3"), Span::text(" and text")],
        )]);
        assert!(scan_document(&d).is_empty());
    }

    #[test]
    fn census_counts_embedded_links_everywhere() {
        let mut parent = Block::paragraph(
            "b1",
            vec![Span::text("[A](legacy://1) [B](legacy://2)")],
        );
        parent.children.push(Block::paragraph(
            "b2",
            vec![Span::text("[C](legacy://3)")],
        ));
        let d = doc(vec![parent]);
        assert_eq!(census(&d), 3);
        // Scanner and census agree on embedded links.
        let embedded = scan_document(&d)
            .iter()
            .filter(|r| r.encoding == LinkEncoding::EmbeddedMarkup)
            .count();
        assert_eq!(embedded, 3);
    }
}
