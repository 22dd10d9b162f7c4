use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Destination structural limits
// ---------------------------------------------------------------------------

/// Hard character limit per text span imposed by the destination.
pub const CHAR_LIMIT: usize = 2000;
/// Hard span-count limit per container imposed by the destination.
pub const COUNT_LIMIT: usize = 100;
/// Conservative character budget used when packing, leaving headroom for the
/// mention spans that replace link tokens.
pub const SAFE_CHAR_LIMIT: usize = 1800;
/// Conservative span-count budget used when packing.
pub const SAFE_COUNT_LIMIT: usize = 80;

/// Size limits a rewritten container must respect.
///
/// `char_limit`/`count_limit` are the destination's hard limits; the `safe_*`
/// pair is the packing budget, kept below the hard limits so substituting
/// link tokens with mentions cannot push a packed chunk over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub char_limit: usize,
    pub count_limit: usize,
    pub safe_char_limit: usize,
    pub safe_count_limit: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            char_limit: CHAR_LIMIT,
            count_limit: COUNT_LIMIT,
            safe_char_limit: SAFE_CHAR_LIMIT,
            safe_count_limit: SAFE_COUNT_LIMIT,
        }
    }
}

// ---------------------------------------------------------------------------
// Content tree
// ---------------------------------------------------------------------------

/// Formatting carried by a text span. Preserved verbatim through packing and
/// rewriting; only spans with identical formatting may be merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatAttrs {
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    #[serde(default)]
    pub strikethrough: bool,
    #[serde(default)]
    pub underline: bool,
    #[serde(default)]
    pub code: bool,
    #[serde(default = "default_color")]
    pub color: String,
}

fn default_color() -> String {
    "default".to_string()
}

impl Default for FormatAttrs {
    fn default() -> Self {
        Self {
            bold: false,
            italic: false,
            strikethrough: false,
            underline: false,
            code: false,
            color: default_color(),
        }
    }
}

/// Atomic unit of container content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Span {
    Text {
        content: String,
        #[serde(default)]
        formatting: FormatAttrs,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hyperlink: Option<String>,
    },
    Mention {
        target_id: String,
    },
}

impl Span {
    pub fn text(content: impl Into<String>) -> Self {
        Span::Text {
            content: content.into(),
            formatting: FormatAttrs::default(),
            hyperlink: None,
        }
    }

    pub fn mention(target_id: impl Into<String>) -> Self {
        Span::Mention {
            target_id: target_id.into(),
        }
    }

    /// Character length contributed towards the per-span limit.
    /// Mentions count as zero characters (they only consume a span slot).
    pub fn char_len(&self) -> usize {
        match self {
            Span::Text { content, .. } => content.chars().count(),
            Span::Mention { .. } => 0,
        }
    }
}

/// Text-bearing container kinds recognized by the engine. Closed set so kind
/// dispatch is exhaustiveness-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Paragraph,
    Heading1,
    Heading2,
    Heading3,
    BulletedListItem,
    NumberedListItem,
    ToDo,
    Quote,
    Callout,
    Toggle,
    TableRow,
}

/// Container payload: a flat span sequence, or per-cell span sequences for
/// table rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockBody {
    Spans(Vec<Span>),
    Cells(Vec<Vec<Span>>),
}

impl BlockBody {
    pub fn span_count(&self) -> usize {
        match self {
            BlockBody::Spans(spans) => spans.len(),
            BlockBody::Cells(cells) => cells.iter().map(Vec::len).sum(),
        }
    }
}

/// One content container, possibly with nested children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    pub kind: BlockKind,
    pub body: BlockBody,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Block>,
}

impl Block {
    pub fn paragraph(id: impl Into<String>, spans: Vec<Span>) -> Self {
        Block {
            id: id.into(),
            kind: BlockKind::Paragraph,
            body: BlockBody::Spans(spans),
            children: Vec::new(),
        }
    }
}

/// A destination document: an id, a display title, and an ordered content tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

// ---------------------------------------------------------------------------
// Link references
// ---------------------------------------------------------------------------

/// Which of the two legacy encodings a reference was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkEncoding {
    /// `[display](legacy:…)` inline in span text.
    EmbeddedMarkup,
    /// Legacy scheme in the span's hyperlink attribute.
    HrefAttribute,
}

/// Address of a span, precise enough to re-locate it after a re-fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanAddress {
    pub block_id: String,
    /// Cell index for table rows, `None` for flat span containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<usize>,
    pub span: usize,
}

/// A legacy pointer detected in a document, pending resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReference {
    pub document_id: String,
    pub document_title: String,
    pub address: SpanAddress,
    pub display_text: String,
    pub raw_target: String,
    pub encoding: LinkEncoding,
}

// ---------------------------------------------------------------------------
// Per-document outcome
// ---------------------------------------------------------------------------

/// Final status recorded for a document in the completed queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentStatus {
    Resolved,
    Partial,
    Ambiguous,
    Unresolved,
    NoLinks,
}

impl DocumentStatus {
    /// Classify a document from its per-reference tallies. `unresolved`
    /// includes target-missing outcomes. Callers handle the no-references
    /// case (`NoLinks`) before tallying.
    pub fn classify(resolved: usize, ambiguous: usize, unresolved: usize) -> Self {
        if ambiguous > 0 && resolved == 0 && unresolved == 0 {
            DocumentStatus::Ambiguous
        } else if unresolved > 0 && resolved == 0 && ambiguous == 0 {
            DocumentStatus::Unresolved
        } else if ambiguous > 0 || unresolved > 0 {
            DocumentStatus::Partial
        } else {
            DocumentStatus::Resolved
        }
    }
}
