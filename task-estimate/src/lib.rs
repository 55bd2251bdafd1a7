//! Markdown outline estimation library.
//! Parses outline documents into a typed block tree, rolls trailing hour estimates
//! up from child items into their parents, and formats the result back while
//! leaving untouched text byte-for-byte intact.

pub mod core {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// Deepest container nesting (list items and block quotes) the parser accepts.
    pub const MAX_NESTING_DEPTH: usize = 64;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ItemId(pub Uuid);

    impl ItemId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: one Markdown document.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Document {
        #[serde(default)]
        pub blocks: Vec<BlockWithSource>,

        /// Original source text captured during parsing for round-trip formatting.
        #[serde(skip_serializing, skip_deserializing)]
        pub source_text: Option<String>,
    }

    impl Document {
        pub fn new(blocks: Vec<BlockWithSource>) -> Self {
            Self {
                blocks,
                source_text: None,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SourceRange {
        pub start: usize,
        pub end: usize,
    }

    impl SourceRange {
        pub fn slice<'a>(&self, source: &'a str) -> &'a str {
            &source[self.start..self.end]
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BlockWithSource {
        pub block: Block,
        #[serde(skip_serializing, skip_deserializing)]
        pub source: Option<SourceRange>,
        /// Range of the block's final source line. Survives `mark_dirty` so the
        /// formatter can splice a rewritten line back into the original text.
        #[serde(skip_serializing, skip_deserializing)]
        pub tail: Option<SourceRange>,
    }

    impl BlockWithSource {
        pub fn new(block: Block) -> Self {
            Self {
                block,
                source: None,
                tail: None,
            }
        }

        pub fn from_source(block: Block, source: SourceRange) -> Self {
            Self {
                block,
                source: Some(source),
                tail: None,
            }
        }

        pub fn with_tail(mut self, tail: SourceRange) -> Self {
            self.tail = Some(tail);
            self
        }

        /// Marks the block as modified, clearing stored raw text.
        pub fn mark_dirty(&mut self) {
            self.source = None;
        }

        pub fn is_dirty(&self) -> bool {
            self.source.is_none()
        }
    }

    /* ---------------------------- Content Model ---------------------------- */

    /// Block-level elements. Lines that open no other block become paragraphs.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Block {
        Paragraph(RichText),
        List(List),
        Heading { level: u8, text: RichText },
        Quote(Vec<BlockWithSource>),
        /// Fenced (fences included) or indented code.
        CodeBlock { raw: String },
        /// Raw HTML block, emitted verbatim.
        Html { raw: String },
        ThematicBreak,
    }

    /// A bullet or ordered list.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct List {
        pub kind: ListKind,
        pub items: Vec<ListItem>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum ListKind {
        /// `-`, `*` or `+`.
        Bullet(char),
        /// `1.` or `1)`.
        Ordered { start: u64, delimiter: char },
    }

    impl ListKind {
        /// Items continue the same list only when their markers belong to one family.
        pub fn same_family(&self, other: &ListKind) -> bool {
            match (self, other) {
                (ListKind::Bullet(a), ListKind::Bullet(b)) => a == b,
                (
                    ListKind::Ordered { delimiter: a, .. },
                    ListKind::Ordered { delimiter: b, .. },
                ) => a == b,
                _ => false,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ListItem {
        pub id: ItemId,
        pub checkbox: Option<Checkbox>,
        #[serde(default)]
        pub content: Vec<BlockWithSource>,
    }

    impl ListItem {
        pub fn new(content: Vec<BlockWithSource>) -> Self {
            Self {
                id: ItemId::new(),
                checkbox: None,
                content,
            }
        }

        /// The item's own text: its first paragraph.
        pub fn paragraph(&self) -> Option<&RichText> {
            self.content.iter().find_map(|b| match &b.block {
                Block::Paragraph(text) => Some(text),
                _ => None,
            })
        }

        pub fn paragraph_block_mut(&mut self) -> Option<&mut BlockWithSource> {
            self.content
                .iter_mut()
                .find(|b| matches!(b.block, Block::Paragraph(_)))
        }

        /// Lists directly under this item, in document order.
        pub fn nested_lists(&self) -> impl Iterator<Item = &List> {
            self.content.iter().filter_map(|b| match &b.block {
                Block::List(list) => Some(list),
                _ => None,
            })
        }

        pub fn nested_lists_mut(&mut self) -> impl Iterator<Item = &mut List> {
            self.content.iter_mut().filter_map(|b| match &mut b.block {
                Block::List(list) => Some(list),
                _ => None,
            })
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Checkbox {
        Empty,   // [ ]
        Checked, // [x]
    }

    /// Inline content of a paragraph or heading.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct RichText {
        #[serde(default)]
        pub inlines: Vec<Inline>,
    }

    impl RichText {
        pub fn plain(text: &str) -> Self {
            Self {
                inlines: vec![Inline::Text(text.to_string())],
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Inline {
        Text(String),
        Emphasis {
            delim: char,
            children: Vec<Inline>,
        },
        Strong {
            delim: char,
            children: Vec<Inline>,
        },
        Strike(Vec<Inline>),
        Code(String),
        Link {
            text: Vec<Inline>,
            destination: String,
        },
        Autolink(String), // <https://...>
        Html(String),     // inline tags kept verbatim
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error("outline nests deeper than {limit} levels (at byte {offset})")]
        NestingTooDeep { limit: usize, offset: usize },
    }
}

pub mod storage {
    use super::core::Document;
    use anyhow::Result;

    /// Parsing is independent of the estimation pass and of how text is obtained.
    pub trait DocumentParser {
        fn parse_str(&self, input: &str) -> Result<Document>;
    }
}

pub mod parser {
    //! Markdown outline parser built on `nom`.
    //!
    //! Parsing strategy:
    //! - The input is split into lines that remember their absolute byte offset.
    //! - Block structure is a line-oriented scan; list items and quotes re-scan their
    //!   de-indented lines recursively, so offsets always point into the original text.
    //! - Line openers (markers, fences, headings) and inline markup use `nom` combinators.

    use crate::core::*;
    use crate::storage::DocumentParser;
    use anyhow::{Context, Result};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till, take_till1, take_while1, take_while_m_n},
        character::complete::{anychar, char, digit1, one_of, space1},
        combinator::{all_consuming, map, map_res, opt, recognize},
        error::{VerboseError, VerboseErrorKind},
        multi::many1_count,
        sequence::{delimited, pair, preceded, terminated, tuple},
    };

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a Markdown document from a string.
    pub fn parse_markdown_from_str(input: &str) -> Result<Document> {
        let lines = split_lines(input);
        let blocks = parse_blocks(&lines, 0).context("parsing markdown blocks")?;

        let mut doc = Document::new(blocks);
        doc.source_text = Some(input.to_string());
        Ok(doc)
    }

    /// Concrete parser implementing the `storage::DocumentParser` trait.
    pub struct NomMarkdownParser;

    impl DocumentParser for NomMarkdownParser {
        fn parse_str(&self, input: &str) -> Result<Document> {
            parse_markdown_from_str(input)
        }
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------------- Lines ------------------------------- */

    /// One source line (without its line ending) and its absolute byte offset.
    #[derive(Debug, Clone, Copy)]
    struct Line<'a> {
        start: usize,
        text: &'a str,
    }

    impl<'a> Line<'a> {
        fn is_blank(&self) -> bool {
            self.text.trim().is_empty()
        }

        fn end(&self) -> usize {
            self.start + self.text.len()
        }

        fn skip(&self, bytes: usize) -> Line<'a> {
            Line {
                start: self.start + bytes,
                text: &self.text[bytes..],
            }
        }

        /// Leading indentation in columns (tabs stop every 4 columns).
        fn indent(&self) -> usize {
            let mut col = 0;
            for c in self.text.chars() {
                match c {
                    ' ' => col += 1,
                    '\t' => col += 4 - col % 4,
                    _ => break,
                }
            }
            col
        }

        /// Remove up to `cols` columns of leading whitespace.
        fn dedent(&self, cols: usize) -> Line<'a> {
            let mut col = 0;
            let mut bytes = 0;
            for c in self.text.chars() {
                if col >= cols {
                    break;
                }
                match c {
                    ' ' => col += 1,
                    '\t' => col += 4 - col % 4,
                    _ => break,
                }
                bytes += 1;
            }
            self.skip(bytes)
        }

        fn trim_start(&self) -> Line<'a> {
            let trimmed = self.text.trim_start();
            self.skip(self.text.len() - trimmed.len())
        }
    }

    fn split_lines(input: &str) -> Vec<Line<'_>> {
        let mut lines = Vec::new();
        let mut start = 0;
        for raw in input.split_inclusive('\n') {
            let text = raw.strip_suffix('\n').unwrap_or(raw);
            let text = text.strip_suffix('\r').unwrap_or(text);
            lines.push(Line { start, text });
            start += raw.len();
        }
        lines
    }

    /* ------------------------------- Blocks ------------------------------- */

    fn parse_blocks(lines: &[Line<'_>], depth: usize) -> Result<Vec<BlockWithSource>, DomainError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(DomainError::NestingTooDeep {
                limit: MAX_NESTING_DEPTH,
                offset: lines.first().map(|l| l.start).unwrap_or(0),
            });
        }

        let mut blocks = Vec::new();
        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];
            if line.is_blank() {
                i += 1;
                continue;
            }

            if line.indent() >= 4 {
                let consumed = indented_code_len(&lines[i..]);
                let span = &lines[i..i + consumed];
                let raw = join_text(span);
                blocks.push(BlockWithSource::from_source(Block::CodeBlock { raw }, range_of(span)));
                i += consumed;
            } else if let Some((level, text)) = parse_atx_heading(line.text) {
                let block = Block::Heading {
                    level,
                    text: rt_text(text),
                };
                blocks.push(BlockWithSource::from_source(block, range_of(&lines[i..=i])));
                i += 1;
            } else if is_thematic_break(line.text) {
                let block = BlockWithSource::from_source(Block::ThematicBreak, range_of(&lines[i..=i]));
                blocks.push(block);
                i += 1;
            } else if let Some(fence) = parse_fence_open(line.text) {
                let consumed = fenced_block_len(&lines[i..], fence);
                let span = &lines[i..i + consumed];
                let raw = join_text(span);
                blocks.push(BlockWithSource::from_source(Block::CodeBlock { raw }, range_of(span)));
                i += consumed;
            } else if quote_content(line).is_some() {
                let mut inner = Vec::new();
                let mut j = i;
                while let Some(content) = lines.get(j).and_then(|l| quote_content(*l)) {
                    inner.push(content);
                    j += 1;
                }
                let children = parse_blocks(&inner, depth + 1)?;
                blocks.push(BlockWithSource::from_source(
                    Block::Quote(children),
                    range_of(&lines[i..j]),
                ));
                i = j;
            } else if is_html_start(line.text) {
                let mut j = i;
                while j < lines.len() && !lines[j].is_blank() {
                    j += 1;
                }
                let span = &lines[i..j];
                let raw = join_text(span);
                blocks.push(BlockWithSource::from_source(Block::Html { raw }, range_of(span)));
                i = j;
            } else if parse_list_marker(line.text).is_some() {
                let (list, consumed) = parse_list(&lines[i..], depth)?;
                let consumed = consumed.max(1);
                let span = &lines[i..i + consumed];
                blocks.push(BlockWithSource::from_source(Block::List(list), range_of(span)));
                i += consumed;
            } else {
                let mut j = i + 1;
                while j < lines.len() && !lines[j].is_blank() && !interrupts_paragraph(lines[j].text)
                {
                    j += 1;
                }
                blocks.push(paragraph_block(&lines[i..j]));
                i = j;
            }
        }
        Ok(blocks)
    }

    /// Build a paragraph from consecutive lines; continuation lines lose their
    /// leading whitespace and the last line its trailing whitespace.
    fn paragraph_block(lines: &[Line<'_>]) -> BlockWithSource {
        let stripped: Vec<Line<'_>> = lines.iter().map(|l| l.trim_start()).collect();
        let last = stripped[stripped.len() - 1];
        let last_end = last.start + last.text.trim_end().len();

        let mut text = stripped
            .iter()
            .map(|l| l.text)
            .collect::<Vec<_>>()
            .join("\n");
        text.truncate(text.trim_end().len());

        let range = SourceRange {
            start: stripped[0].start,
            end: last_end,
        };
        let tail = SourceRange {
            start: last.start,
            end: last_end,
        };
        BlockWithSource::from_source(Block::Paragraph(rt_text(&text)), range).with_tail(tail)
    }

    fn interrupts_paragraph(text: &str) -> bool {
        parse_atx_heading(text).is_some()
            || is_thematic_break(text)
            || parse_fence_open(text).is_some()
            || quote_prefix_len(text).is_some()
            || parse_list_marker(text).is_some()
    }

    fn range_of(lines: &[Line<'_>]) -> SourceRange {
        let start = lines.first().map(|l| l.start).unwrap_or(0);
        let end = lines.last().map(|l| l.end()).unwrap_or(start);
        SourceRange { start, end }
    }

    fn join_text(lines: &[Line<'_>]) -> String {
        lines.iter().map(|l| l.text).collect::<Vec<_>>().join("\n")
    }

    fn rt_text(s: &str) -> RichText {
        RichText {
            inlines: parse_inlines_str(s),
        }
    }

    /* ----------------------------- Lists ----------------------------- */

    #[derive(Debug, Clone, Copy)]
    struct Marker {
        kind: ListKind,
        checkbox: Option<Checkbox>,
        /// Byte offset of the item's first content character within the line.
        content_offset: usize,
        /// Column that continuation lines must reach to belong to the item.
        content_col: usize,
    }

    fn parse_list(lines: &[Line<'_>], depth: usize) -> Result<(List, usize), DomainError> {
        let mut items = Vec::new();
        let mut list_kind: Option<ListKind> = None;
        let mut i = 0;
        let mut consumed = 0;

        while i < lines.len() {
            let line = lines[i];
            if is_thematic_break(line.text) {
                break;
            }
            let Some(marker) = parse_list_marker(line.text) else {
                break;
            };
            match list_kind {
                Some(kind) if !kind.same_family(&marker.kind) => break,
                None => list_kind = Some(marker.kind),
                _ => {}
            }

            let mut item_lines = vec![line.skip(marker.content_offset)];
            let mut j = i + 1;
            let mut prev_blank = item_lines[0].is_blank();
            while j < lines.len() {
                let next = lines[j];
                if next.is_blank() {
                    let resumes = lines[j..]
                        .iter()
                        .find(|l| !l.is_blank())
                        .is_some_and(|l| l.indent() >= marker.content_col);
                    if !resumes {
                        break;
                    }
                    item_lines.push(next.dedent(marker.content_col));
                    prev_blank = true;
                } else if next.indent() >= marker.content_col {
                    item_lines.push(next.dedent(marker.content_col));
                    prev_blank = false;
                } else if !prev_blank && !interrupts_paragraph(next.text) {
                    // lazy continuation
                    item_lines.push(next.trim_start());
                } else {
                    break;
                }
                j += 1;
            }

            let content = parse_blocks(&item_lines, depth + 1)?;
            items.push(ListItem {
                id: ItemId::new(),
                checkbox: marker.checkbox,
                content,
            });
            consumed = j;

            // Blank lines between siblings keep the list open.
            i = j;
            while i < lines.len() && lines[i].is_blank() {
                i += 1;
            }
        }

        let kind = list_kind.unwrap_or(ListKind::Bullet('-'));
        Ok((List { kind, items }, consumed))
    }

    fn bullet_marker(i: &str) -> PResult<'_, ListKind> {
        map(one_of("-*+"), ListKind::Bullet)(i)
    }

    fn ordered_marker(i: &str) -> PResult<'_, ListKind> {
        map(
            pair(
                map_res(take_while_m_n(1, 9, |c: char| c.is_ascii_digit()), str::parse::<u64>),
                one_of(".)"),
            ),
            |(start, delimiter)| ListKind::Ordered { start, delimiter },
        )(i)
    }

    fn parse_checkbox(i: &str) -> PResult<'_, Checkbox> {
        let (i, state) = delimited(
            char('['),
            alt((
                map(char(' '), |_| Checkbox::Empty),
                map(one_of("xX"), |_| Checkbox::Checked),
            )),
            char(']'),
        )(i)?;
        let (i, _) = space1(i)?;
        if i.trim().is_empty() {
            return Err(inline_error(i, "empty-task"));
        }
        Ok((i, state))
    }

    fn marker_indent(i: &str) -> PResult<'_, &str> {
        take_while_m_n(0, 3, |c: char| c == ' ')(i)
    }

    /// "- text", "* [ ] text", "1. text", "2) text", or a bare marker, indented
    /// at most three columns.
    fn parse_list_marker(text: &str) -> Option<Marker> {
        let (rest, lead) = marker_indent(text).ok()?;
        let indent = lead.len();
        let (after_marker, kind) = alt((bullet_marker, ordered_marker))(rest).ok()?;
        let marker_end = text.len() - after_marker.len();
        let marker_cols = indent + (rest.len() - after_marker.len());

        if after_marker.trim().is_empty() {
            return Some(Marker {
                kind,
                checkbox: None,
                content_offset: text.len(),
                content_col: marker_cols + 1,
            });
        }

        let (content, spaces) = space1::<_, VerboseError<&str>>(after_marker).ok()?;
        let gap = Line { start: 0, text: spaces }.indent();
        let (content_offset, content_col) = if gap > 4 {
            (marker_end + 1, marker_cols + 1)
        } else {
            (text.len() - content.len(), marker_cols + gap)
        };

        let (checkbox, content_offset) = match parse_checkbox(&text[content_offset..]) {
            Ok((after, state)) => (Some(state), text.len() - after.len()),
            Err(_) => (None, content_offset),
        };

        Some(Marker {
            kind,
            checkbox,
            content_offset,
            content_col,
        })
    }

    /* ---------------------------- Other blocks ---------------------------- */

    fn heading_open(i: &str) -> PResult<'_, &str> {
        preceded(
            take_while_m_n(0, 3, |c: char| c == ' '),
            recognize(many1_count(char('#'))),
        )(i)
    }

    fn parse_atx_heading(text: &str) -> Option<(u8, &str)> {
        let (rest, hashes) = heading_open(text).ok()?;
        if hashes.len() > 6 {
            return None;
        }
        if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
            return None;
        }
        Some((hashes.len() as u8, rest.trim()))
    }

    fn is_thematic_break(text: &str) -> bool {
        if (Line { start: 0, text }).indent() >= 4 {
            return false;
        }
        let trimmed = text.trim();
        let Some(first) = trimmed.chars().next() else {
            return false;
        };
        if !matches!(first, '-' | '*' | '_') {
            return false;
        }
        let mut count = 0;
        for c in trimmed.chars() {
            if c == first {
                count += 1;
            } else if c != ' ' && c != '\t' {
                return false;
            }
        }
        count >= 3
    }

    #[derive(Debug, Clone, Copy)]
    struct Fence {
        ch: char,
        len: usize,
    }

    fn fence_open(i: &str) -> PResult<'_, &str> {
        preceded(
            take_while_m_n(0, 3, |c: char| c == ' '),
            alt((
                take_while1(|c: char| c == '`'),
                take_while1(|c: char| c == '~'),
            )),
        )(i)
    }

    fn parse_fence_open(text: &str) -> Option<Fence> {
        let (info, run) = fence_open(text).ok()?;
        if run.len() < 3 {
            return None;
        }
        let ch = run.chars().next()?;
        if ch == '`' && info.contains('`') {
            return None;
        }
        Some(Fence { ch, len: run.len() })
    }

    /// Indented lines (and blank lines between them) forming one code block.
    fn indented_code_len(lines: &[Line<'_>]) -> usize {
        let mut consumed = 1;
        for (idx, line) in lines.iter().enumerate().skip(1) {
            if line.is_blank() {
                continue;
            }
            if line.indent() < 4 {
                break;
            }
            consumed = idx + 1;
        }
        consumed
    }

    /// Lines covered by a fenced block, closing fence included when present.
    fn fenced_block_len(lines: &[Line<'_>], fence: Fence) -> usize {
        for (idx, line) in lines.iter().enumerate().skip(1) {
            let trimmed = line.text.trim();
            let run = trimmed.chars().take_while(|c| *c == fence.ch).count();
            if run >= fence.len && run == trimmed.chars().count() {
                return idx + 1;
            }
        }
        lines.len()
    }

    fn quote_marker(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            take_while_m_n(0, 3, |c: char| c == ' '),
            char('>'),
            opt(char(' ')),
        )))(i)
    }

    fn quote_prefix_len(text: &str) -> Option<usize> {
        quote_marker(text).ok().map(|(_, prefix)| prefix.len())
    }

    fn quote_content(line: Line<'_>) -> Option<Line<'_>> {
        quote_prefix_len(line.text).map(|len| line.skip(len))
    }

    const HTML_BLOCK_TAGS: &[&str] = &[
        "address", "article", "aside", "blockquote", "details", "dialog", "div", "dl",
        "fieldset", "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header",
        "hr", "nav", "ol", "p", "pre", "script", "section", "style", "summary", "table", "ul",
    ];

    /// Block-level HTML opens with a known block tag or a comment; inline tags
    /// such as `<b>` stay inside paragraphs.
    fn is_html_start(text: &str) -> bool {
        let trimmed = text.trim_start();
        if trimmed.starts_with("<!--") {
            return true;
        }
        let Some(rest) = trimmed.strip_prefix('<') else {
            return false;
        };
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        let name_len = rest
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(rest.len());
        let name = rest[..name_len].to_ascii_lowercase();
        let boundary = rest[name_len..]
            .chars()
            .next()
            .is_none_or(|c| c.is_whitespace() || c == '>' || c == '/');
        boundary && HTML_BLOCK_TAGS.contains(&name.as_str())
    }

    /* --------------------------- INLINE MARKUP --------------------------- */

    /// Parse inline markup; every atom renders back to exactly the text it consumed.
    fn parse_inlines_str(s: &str) -> Vec<Inline> {
        match parse_inlines(s) {
            Ok((rest, mut v)) => {
                if !rest.is_empty() {
                    v.push(Inline::Text(rest.to_string()));
                }
                coalesce_text(&mut v);
                v
            }
            Err(_) => vec![Inline::Text(s.to_string())],
        }
    }

    fn parse_inlines(mut i: &str) -> PResult<'_, Vec<Inline>> {
        let mut out = Vec::new();
        while !i.is_empty() {
            match inline_atom(i) {
                Ok((r, node)) => {
                    out.push(node);
                    i = r;
                }
                Err(_) => {
                    let (r, ch) = anychar(i)?;
                    out.push(Inline::Text(ch.to_string()));
                    i = r;
                }
            }
        }
        Ok(("", out))
    }

    fn inline_atom(i: &str) -> PResult<'_, Inline> {
        alt((
            parse_escape,
            parse_code_span,
            parse_strong_with("**", '*'),
            parse_strong_with("__", '_'),
            parse_strike,
            parse_emph_with('*'),
            parse_emph_with('_'),
            parse_link,
            parse_autolink,
            parse_inline_html,
            parse_text_chunk,
        ))(i)
    }

    fn coalesce_text(xs: &mut Vec<Inline>) {
        let mut out = Vec::with_capacity(xs.len());
        for x in xs.drain(..) {
            if let (Some(Inline::Text(prev)), Inline::Text(s)) = (out.last_mut(), &x) {
                prev.push_str(s);
            } else {
                out.push(x);
            }
        }
        *xs = out;
    }

    fn inline_error<'a>(i: &'a str, ctx: &'static str) -> nom::Err<VerboseError<&'a str>> {
        nom::Err::Error(VerboseError {
            errors: vec![(i, VerboseErrorKind::Context(ctx))],
        })
    }

    /// Byte offset of the first unescaped `pat` in `i`.
    fn find_unescaped(i: &str, pat: &str) -> Option<usize> {
        let mut idx = 0;
        while idx < i.len() {
            let rest = &i[idx..];
            if rest.starts_with(pat) {
                return Some(idx);
            }
            let mut chars = rest.chars();
            let c = chars.next()?;
            idx += c.len_utf8();
            if c == '\\' {
                idx += chars.next().map_or(0, char::len_utf8);
            }
        }
        None
    }

    /// Byte offset of the `]` balancing an already consumed `[`.
    fn link_text_end(i: &str) -> Option<usize> {
        let mut depth = 0usize;
        let mut chars = i.char_indices();
        while let Some((idx, c)) = chars.next() {
            match c {
                '\\' => {
                    chars.next();
                }
                '[' => depth += 1,
                ']' if depth == 0 => return Some(idx),
                ']' => depth -= 1,
                _ => {}
            }
        }
        None
    }

    /// Opener already consumed; the body runs up to the first closer and is
    /// parsed on its own, so a failed opener never re-parses what follows it.
    fn delimited_body<'a>(
        i: &'a str,
        closer: &str,
        ctx: &'static str,
    ) -> PResult<'a, Vec<Inline>> {
        if i.starts_with([' ', '\n']) {
            return Err(inline_error(i, ctx));
        }
        match find_unescaped(i, closer) {
            Some(end) if end > 0 => Ok((&i[end..], parse_inlines_str(&i[..end]))),
            _ => Err(inline_error(i, ctx)),
        }
    }

    fn parse_escape(i: &str) -> PResult<'_, Inline> {
        let (r, escaped) = recognize(pair(
            char('\\'),
            nom::character::complete::satisfy(|c: char| c.is_ascii_punctuation()),
        ))(i)?;
        Ok((r, Inline::Text(escaped.to_string())))
    }

    fn parse_code_span(i: &str) -> PResult<'_, Inline> {
        let (i, _) = char('`')(i)?;
        let (i, body) = take_till1(|c: char| c == '`')(i)?;
        let (i, _) = char('`')(i)?;
        Ok((i, Inline::Code(body.to_string())))
    }

    fn parse_strong_with(
        delim: &'static str,
        marker: char,
    ) -> impl Fn(&str) -> PResult<'_, Inline> {
        move |i: &str| {
            let (i, _) = tag(delim)(i)?;
            let (i, children) = delimited_body(i, delim, "strong")?;
            let (i, _) = tag(delim)(i)?;
            Ok((
                i,
                Inline::Strong {
                    delim: marker,
                    children,
                },
            ))
        }
    }

    fn parse_emph_with(delim: char) -> impl Fn(&str) -> PResult<'_, Inline> {
        move |i: &str| {
            let (i, _) = char(delim)(i)?;
            let mut buf = [0u8; 4];
            let closer = delim.encode_utf8(&mut buf);
            let (i, children) = delimited_body(i, closer, "emphasis")?;
            let (i, _) = char(delim)(i)?;
            Ok((
                i,
                Inline::Emphasis {
                    delim,
                    children,
                },
            ))
        }
    }

    fn parse_strike(i: &str) -> PResult<'_, Inline> {
        let (i, _) = tag("~~")(i)?;
        let (i, children) = delimited_body(i, "~~", "strike")?;
        let (i, _) = tag("~~")(i)?;
        Ok((i, Inline::Strike(children)))
    }

    fn parse_link(i: &str) -> PResult<'_, Inline> {
        let (i, _) = char('[')(i)?;
        let Some(end) = link_text_end(i) else {
            return Err(inline_error(i, "link-text"));
        };
        let (rest, destination) = delimited(
            tag("]("),
            take_till(|c: char| c == ')' || c == '\n'),
            char(')'),
        )(&i[end..])?;
        Ok((
            rest,
            Inline::Link {
                text: parse_inlines_str(&i[..end]),
                destination: destination.to_string(),
            },
        ))
    }

    fn parse_autolink(i: &str) -> PResult<'_, Inline> {
        let scheme = terminated(
            take_while1(|c: char| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-')),
            char(':'),
        );
        let (i, raw) = delimited(
            char('<'),
            recognize(pair(scheme, take_till(|c: char| c == '>' || c == '<' || c.is_whitespace()))),
            char('>'),
        )(i)?;
        Ok((i, Inline::Autolink(raw.to_string())))
    }

    fn parse_inline_html(i: &str) -> PResult<'_, Inline> {
        let (rest, raw) = recognize(tuple((
            char('<'),
            nom::character::complete::satisfy(|c: char| c.is_ascii_alphabetic() || c == '/' || c == '!'),
            take_till(|c: char| c == '>' || c == '<' || c == '\n'),
            char('>'),
        )))(i)?;
        Ok((rest, Inline::Html(raw.to_string())))
    }

    fn parse_text_chunk(i: &str) -> PResult<'_, Inline> {
        fn is_plain(c: char) -> bool {
            !matches!(c, '\\' | '`' | '*' | '_' | '~' | '[' | ']' | '<')
        }
        let (i, s) = take_while1(is_plain)(i)?;
        Ok((i, Inline::Text(s.to_string())))
    }

    /// `<digits>h` as a whole token, e.g. "8h".
    pub(crate) fn parse_duration_token(token: &str) -> Option<u64> {
        let hours = terminated(map_res(digit1, str::parse::<u64>), char('h'));
        all_consuming::<_, _, VerboseError<&str>, _>(hours)(token)
            .ok()
            .map(|(_, hours)| hours)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::format::render_rich_text;

        fn items(doc: &Document) -> &[ListItem] {
            match &doc.blocks[0].block {
                Block::List(list) => &list.items,
                other => panic!("expected list, got {:?}", other),
            }
        }

        #[test]
        fn nested_items_follow_indentation() {
            let input = "- Parent 5h\n  - Child A 3h\n  - Child B 4h\n- Sibling\n";
            let doc = parse_markdown_from_str(input).expect("parse");
            assert_eq!(doc.blocks.len(), 1);

            let items = items(&doc);
            assert_eq!(items.len(), 2);
            let parent = &items[0];
            assert_eq!(
                render_rich_text(&parent.paragraph().expect("paragraph").inlines),
                "Parent 5h"
            );
            let nested: Vec<&List> = parent.nested_lists().collect();
            assert_eq!(nested.len(), 1);
            assert_eq!(nested[0].items.len(), 2);
            assert!(items[1].nested_lists().next().is_none());
        }

        #[test]
        fn paragraph_tail_points_at_last_line() {
            let input = "- First line\n  second line 8h\n";
            let doc = parse_markdown_from_str(input).expect("parse");
            let block = &items(&doc)[0].content[0];
            let tail = block.tail.expect("tail range");
            assert_eq!(tail.slice(input), "second line 8h");
            assert_eq!(block.source.expect("range").slice(input), "First line\n  second line 8h");
        }

        #[test]
        fn lazy_continuation_joins_item_paragraph() {
            let input = "- Design\nthe API 8h\n";
            let doc = parse_markdown_from_str(input).expect("parse");
            let text = items(&doc)[0].paragraph().expect("paragraph");
            assert_eq!(render_rich_text(&text.inlines), "Design\nthe API 8h");
        }

        #[test]
        fn bare_marker_has_no_paragraph() {
            let input = "-\n  - Child 3h\n";
            let doc = parse_markdown_from_str(input).expect("parse");
            let item = &items(&doc)[0];
            assert!(item.paragraph().is_none());
            assert_eq!(item.nested_lists().count(), 1);
        }

        #[test]
        fn ordered_and_task_markers() {
            let input = "1. [ ] Write docs 2h\n2. [x] Ship 1h\n";
            let doc = parse_markdown_from_str(input).expect("parse");
            match &doc.blocks[0].block {
                Block::List(list) => {
                    assert_eq!(
                        list.kind,
                        ListKind::Ordered {
                            start: 1,
                            delimiter: '.'
                        }
                    );
                    assert_eq!(list.items[0].checkbox, Some(Checkbox::Empty));
                    assert_eq!(list.items[1].checkbox, Some(Checkbox::Checked));
                    let text = list.items[0].paragraph().expect("paragraph");
                    assert_eq!(render_rich_text(&text.inlines), "Write docs 2h");
                }
                other => panic!("expected list, got {:?}", other),
            }
        }

        #[test]
        fn changing_bullet_starts_a_new_list() {
            let doc = parse_markdown_from_str("- a\n- b\n* c\n").expect("parse");
            assert_eq!(doc.blocks.len(), 2);
        }

        #[test]
        fn blocks_around_lists() {
            let input = "# Plan\n\nIntro text\n\n---\n\n```\n- not a list\n```\n\n> - Quoted 2h\n\n<div>\n- raw\n</div>\n";
            let doc = parse_markdown_from_str(input).expect("parse");
            let kinds: Vec<&str> = doc
                .blocks
                .iter()
                .map(|b| match &b.block {
                    Block::Heading { .. } => "heading",
                    Block::Paragraph(_) => "paragraph",
                    Block::ThematicBreak => "hr",
                    Block::CodeBlock { .. } => "code",
                    Block::Quote(_) => "quote",
                    Block::Html { .. } => "html",
                    Block::List(_) => "list",
                })
                .collect();
            assert_eq!(kinds, ["heading", "paragraph", "hr", "code", "quote", "html"]);
        }

        #[test]
        fn inline_markup_renders_back_verbatim() {
            for s in [
                "Use `cargo` with **bold** and _under_ 8h",
                "See [docs](https://example.com) <br> <https://x.io> ~~old~~ 3h",
                "snake_case_name and a*b and \\*escaped\\* ``odd`` [unclosed",
            ] {
                assert_eq!(render_rich_text(&parse_inlines_str(s)), s);
            }
        }

        #[test]
        fn last_inline_is_trailing_text() {
            let v = parse_inlines_str("**Bold** task 5h");
            assert!(matches!(v[0], Inline::Strong { .. }));
            assert!(matches!(v.last(), Some(Inline::Text(t)) if t == " task 5h"));
        }

        #[test]
        fn duration_token_grammar() {
            assert_eq!(parse_duration_token("8h"), Some(8));
            assert_eq!(parse_duration_token("120h"), Some(120));
            assert_eq!(parse_duration_token("h"), None);
            assert_eq!(parse_duration_token("8"), None);
            assert_eq!(parse_duration_token("8hours"), None);
            assert_eq!(parse_duration_token("1.5h"), None);
            assert_eq!(parse_duration_token("99999999999999999999999h"), None);
        }

        #[test]
        fn rejects_excessive_nesting() {
            let mut input = String::new();
            for level in 0..=MAX_NESTING_DEPTH + 1 {
                input.push_str(&"  ".repeat(level));
                input.push_str("- item\n");
            }
            let err = parse_markdown_from_str(&input).expect_err("too deep");
            assert!(format!("{err:#}").contains("nests deeper"));
        }

        #[test]
        fn unclosed_openers_stay_linear() {
            let brackets = "[".repeat(40);
            for s in [
                format!("Task {brackets}]("),
                format!("{brackets}x](y) 2h"),
                format!("{}a", "*".repeat(40)),
                "**a ".repeat(40),
                "_".repeat(40),
                "~~a ".repeat(40),
            ] {
                assert_eq!(render_rich_text(&parse_inlines_str(&s)), s);
            }
        }

        #[test]
        fn link_text_is_bracket_balanced() {
            let v = parse_inlines_str("[a [b](c) d](e) 2h");
            match &v[0] {
                Inline::Link { text, destination } => {
                    assert_eq!(render_rich_text(text), "a [b](c) d");
                    assert_eq!(destination, "e");
                }
                other => panic!("expected link, got {:?}", other),
            }
            assert!(matches!(v.last(), Some(Inline::Text(t)) if t == " 2h"));
        }

        #[test]
        fn indented_lines_are_code() {
            let input = "Example:\n\n    - P\n      - A 3h\n\n    ---\n- real\n";
            let doc = parse_markdown_from_str(input).expect("parse");
            assert!(matches!(doc.blocks[0].block, Block::Paragraph(_)));
            match &doc.blocks[1].block {
                Block::CodeBlock { raw } => assert_eq!(raw, "    - P\n      - A 3h\n\n    ---"),
                other => panic!("expected code, got {:?}", other),
            }
            assert!(matches!(doc.blocks[2].block, Block::List(_)));
            assert_eq!(doc.blocks.len(), 3);
        }

        #[test]
        fn checkbox_needs_following_text() {
            let doc = parse_markdown_from_str("- [ ]\n  - A 2h\n- [ ] \n- [x] Done\n").expect("parse");
            let items = items(&doc);
            assert_eq!(items[0].checkbox, None);
            let text = items[0].paragraph().expect("paragraph");
            assert_eq!(render_rich_text(&text.inlines), "[ ]");
            assert_eq!(items[1].checkbox, None);
            assert!(items[1].paragraph().is_some());
            assert_eq!(items[2].checkbox, Some(Checkbox::Checked));
        }
    }
}

pub mod format {
    use super::core::*;

    /// Format a document. Parsed documents reproduce their source text, with each
    /// rewritten paragraph's final line spliced in; others are rendered from the tree.
    pub fn format_document(doc: &Document) -> String {
        if let Some(source) = doc.source_text.as_deref() {
            let mut edits = Vec::new();
            if collect_edits(&doc.blocks, &mut edits) {
                return splice(source, edits);
            }
        }
        render_document(doc)
    }

    struct Edit {
        range: SourceRange,
        text: String,
    }

    /// Returns false when a modified block cannot be placed back into the source.
    fn collect_edits(blocks: &[BlockWithSource], edits: &mut Vec<Edit>) -> bool {
        for block in blocks {
            if block.is_dirty() {
                match (&block.block, block.tail) {
                    (Block::Paragraph(text), Some(tail)) => {
                        let rendered = render_rich_text(&text.inlines);
                        let last_line = rendered.rsplit('\n').next().unwrap_or_default();
                        edits.push(Edit {
                            range: tail,
                            text: last_line.to_string(),
                        });
                    }
                    _ => return false,
                }
            }
            let nested_ok = match &block.block {
                Block::List(list) => list
                    .items
                    .iter()
                    .all(|item| collect_edits(&item.content, edits)),
                Block::Quote(children) => collect_edits(children, edits),
                _ => true,
            };
            if !nested_ok {
                return false;
            }
        }
        true
    }

    fn splice(source: &str, mut edits: Vec<Edit>) -> String {
        edits.sort_by_key(|e| e.range.start);
        let mut out = String::with_capacity(source.len());
        let mut cursor = 0;
        for edit in edits {
            if edit.range.start < cursor {
                continue;
            }
            out.push_str(&source[cursor..edit.range.start]);
            out.push_str(&edit.text);
            cursor = edit.range.end;
        }
        out.push_str(&source[cursor..]);
        out
    }

    /// Canonical rendering of the tree, blank line between top-level blocks.
    pub fn render_document(doc: &Document) -> String {
        doc.blocks
            .iter()
            .map(|b| render_block(&b.block))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn render_block(block: &Block) -> String {
        match block {
            Block::Paragraph(text) => {
                let mut buf = render_rich_text(&text.inlines);
                buf.push('\n');
                buf
            }
            Block::List(list) => render_list(list),
            Block::Heading { level, text } => {
                let mut buf = "#".repeat(usize::from(*level));
                buf.push(' ');
                buf.push_str(&render_rich_text(&text.inlines));
                buf.push('\n');
                buf
            }
            Block::Quote(blocks) => {
                let inner = blocks
                    .iter()
                    .map(|b| render_block(&b.block))
                    .collect::<Vec<_>>()
                    .join("\n");
                let mut buf = String::new();
                for line in inner.lines() {
                    if line.is_empty() {
                        buf.push_str(">\n");
                    } else {
                        buf.push_str("> ");
                        buf.push_str(line);
                        buf.push('\n');
                    }
                }
                buf
            }
            Block::CodeBlock { raw } | Block::Html { raw } => {
                let mut buf = raw.clone();
                if !raw.ends_with('\n') {
                    buf.push('\n');
                }
                buf
            }
            Block::ThematicBreak => "---\n".to_string(),
        }
    }

    fn render_list(list: &List) -> String {
        let mut buf = String::new();
        for (idx, item) in list.items.iter().enumerate() {
            let marker = match list.kind {
                ListKind::Bullet(c) => c.to_string(),
                ListKind::Ordered { start, delimiter } => {
                    format!("{}{}", start + idx as u64, delimiter)
                }
            };
            let pad = " ".repeat(marker.len() + 1);

            let mut body = String::new();
            if let Some(cb) = item.checkbox {
                body.push_str(match cb {
                    Checkbox::Empty => "[ ] ",
                    Checkbox::Checked => "[x] ",
                });
            }
            if !item.content.is_empty() && !matches!(item.content[0].block, Block::Paragraph(_)) {
                body.push('\n');
            }
            for blk in &item.content {
                body.push_str(&render_block(&blk.block));
            }

            buf.push_str(&marker);
            for (n, line) in body.lines().enumerate() {
                if n == 0 {
                    if !line.is_empty() {
                        buf.push(' ');
                        buf.push_str(line.trim_end());
                    }
                } else if line.is_empty() {
                    buf.push('\n');
                } else {
                    buf.push('\n');
                    buf.push_str(&pad);
                    buf.push_str(line);
                }
            }
            buf.push('\n');
        }
        buf
    }

    /// Render inline content back to Markdown source form.
    pub fn render_rich_text(inlines: &[Inline]) -> String {
        let mut buf = String::new();
        for inline in inlines {
            match inline {
                Inline::Text(t) => buf.push_str(t),
                Inline::Emphasis { delim, children } => {
                    buf.push(*delim);
                    buf.push_str(&render_rich_text(children));
                    buf.push(*delim);
                }
                Inline::Strong { delim, children } => {
                    buf.push(*delim);
                    buf.push(*delim);
                    buf.push_str(&render_rich_text(children));
                    buf.push(*delim);
                    buf.push(*delim);
                }
                Inline::Strike(children) => {
                    buf.push_str("~~");
                    buf.push_str(&render_rich_text(children));
                    buf.push_str("~~");
                }
                Inline::Code(code) => {
                    buf.push('`');
                    buf.push_str(code);
                    buf.push('`');
                }
                Inline::Link { text, destination } => {
                    buf.push('[');
                    buf.push_str(&render_rich_text(text));
                    buf.push_str("](");
                    buf.push_str(destination);
                    buf.push(')');
                }
                Inline::Autolink(url) => {
                    buf.push('<');
                    buf.push_str(url);
                    buf.push('>');
                }
                Inline::Html(raw) => buf.push_str(raw),
            }
        }
        buf
    }

}

pub mod estimate {
    //! Hour-estimate roll-up over list items.
    //!
    //! Items carry a trailing `<n>h` token. Parents whose children carry estimates
    //! get their own token replaced (or appended) with the children's sum.

    pub mod extractor {
        use crate::parser::parse_duration_token;
        use serde::{Deserialize, Serialize};

        /// Label and hours parsed from an item's text.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct Annotation {
            pub label: String,
            pub hours: u64,
            /// Hours as written before any roll-up.
            pub stated_hours: u64,
        }

        impl Annotation {
            pub fn is_rewritten(&self) -> bool {
                self.hours != self.stated_hours
            }
        }

        /// Split `text` into a label and the trailing duration token, if any.
        pub fn extract(text: &str) -> Annotation {
            let trimmed = text.trim();
            let (head, token) = match trimmed.rsplit_once(char::is_whitespace) {
                Some((head, token)) => (head, token),
                None => ("", trimmed),
            };

            match parse_duration_token(token) {
                Some(hours) => Annotation {
                    label: head.trim().to_string(),
                    hours,
                    stated_hours: hours,
                },
                None => Annotation {
                    label: trimmed.to_string(),
                    hours: 0,
                    stated_hours: 0,
                },
            }
        }

        #[cfg(test)]
        mod tests {
            use super::*;

            #[test]
            fn splits_trailing_token() {
                let a = extract("Design API 8h");
                assert_eq!(a.hours, 8);
                assert_eq!(a.label, "Design API");
            }

            #[test]
            fn missing_token_means_zero() {
                let a = extract("Design API");
                assert_eq!(a.hours, 0);
                assert_eq!(a.label, "Design API");
            }

            #[test]
            fn token_only_gives_empty_label() {
                let a = extract("8h");
                assert_eq!(a.hours, 8);
                assert_eq!(a.label, "");
            }

            #[test]
            fn only_the_trailing_token_counts() {
                let a = extract("Spend 8h on review");
                assert_eq!(a.hours, 0);
                assert_eq!(a.label, "Spend 8h on review");

                let glued = extract("Design API8h");
                assert_eq!(glued.hours, 0);
            }

            #[test]
            fn surrounding_whitespace_is_ignored() {
                let a = extract("  Write   tests \t 12h \n");
                assert_eq!(a.hours, 12);
                assert_eq!(a.label, "Write   tests");
                assert!(!a.is_rewritten());
            }
        }
    }

    pub mod rewriter {
        use crate::core::{Inline, RichText};

        /// Start of a trailing `<digits>h` in `text`, if present.
        fn trailing_duration_start(text: &str) -> Option<usize> {
            let body = text.strip_suffix('h')?;
            let digits = body.len() - body.trim_end_matches(|c: char| c.is_ascii_digit()).len();
            (digits > 0).then(|| body.len() - digits)
        }

        /// Replace a trailing `<digits>h` with `<hours>h`, or append ` <hours>h`.
        /// Trailing whitespace stays after the token.
        pub fn rewrite_text(text: &mut String, hours: u64) {
            let body_end = text.trim_end().len();
            let token = format!("{hours}h");
            match trailing_duration_start(&text[..body_end]) {
                Some(start) => text.replace_range(start..body_end, &token),
                None => text.insert_str(body_end, &format!(" {token}")),
            }
        }

        /// Rewrite the paragraph's annotation carrier, its last inline run.
        pub fn rewrite(paragraph: &mut RichText, hours: u64) {
            match paragraph.inlines.last_mut() {
                Some(Inline::Text(text)) => rewrite_text(text, hours),
                _ => paragraph.inlines.push(Inline::Text(format!(" {hours}h"))),
            }
        }

    }

    pub mod aggregator {
        use super::extractor::{Annotation, extract};
        use super::rewriter::rewrite;
        use crate::core::{Block, ItemId, ListItem};
        use crate::format::render_rich_text;
        use indexmap::IndexMap;
        use serde::Serialize;
        use tracing::debug;

        /// Annotations computed during one pass, keyed by item, in traversal order.
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        #[serde(transparent)]
        pub struct AnnotationTable {
            entries: IndexMap<ItemId, Annotation>,
        }

        impl AnnotationTable {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn get(&self, id: &ItemId) -> Option<&Annotation> {
                self.entries.get(id)
            }

            pub fn len(&self) -> usize {
                self.entries.len()
            }

            pub fn is_empty(&self) -> bool {
                self.entries.is_empty()
            }

            pub fn iter(&self) -> impl Iterator<Item = (&ItemId, &Annotation)> {
                self.entries.iter()
            }

            pub fn rewritten_count(&self) -> usize {
                self.entries.values().filter(|a| a.is_rewritten()).count()
            }

            pub fn to_json(&self) -> serde_json::Result<String> {
                serde_json::to_string_pretty(self)
            }

            fn insert(&mut self, id: ItemId, annotation: Annotation) {
                self.entries.insert(id, annotation);
            }

            fn set_hours(&mut self, id: &ItemId, hours: u64) {
                if let Some(annotation) = self.entries.get_mut(id) {
                    annotation.hours = hours;
                }
            }
        }

        /// Roll child estimates up into `item`, depth-first, rewriting its text when
        /// the children's total differs from what it states.
        ///
        /// Items without paragraph text are skipped together with everything nested
        /// under them.
        pub fn aggregate(item: &mut ListItem, table: &mut AnnotationTable) {
            let Some(paragraph) = item.paragraph() else {
                debug!("skipping item without paragraph");
                return;
            };
            let text = render_rich_text(&paragraph.inlines);
            if text.trim().is_empty() {
                debug!("skipping item with empty paragraph");
                return;
            }

            let annotation = extract(&text);
            debug!(label = %annotation.label, hours = annotation.hours, "parsed item");
            let own_hours = annotation.hours;
            let label = annotation.label.clone();
            table.insert(item.id, annotation);

            let mut children_hours: u64 = 0;
            let mut has_child_with_time = false;
            for list in item.nested_lists_mut() {
                for child in &mut list.items {
                    aggregate(child, table);
                    if let Some(child_annotation) = table.get(&child.id) {
                        if child_annotation.hours > 0 {
                            children_hours = children_hours.saturating_add(child_annotation.hours);
                            has_child_with_time = true;
                            debug!(
                                child = %child_annotation.label,
                                hours = child_annotation.hours,
                                "child estimate"
                            );
                        }
                    }
                }
            }

            if !has_child_with_time {
                return;
            }
            debug!(%label, children_hours, own_hours, "children total");
            if children_hours == own_hours {
                return;
            }

            debug!(%label, from = own_hours, to = children_hours, "updating estimate");
            if let Some(block) = item.paragraph_block_mut() {
                if let Block::Paragraph(text) = &mut block.block {
                    rewrite(text, children_hours);
                    block.mark_dirty();
                }
            }
            table.set_hours(&item.id, children_hours);
        }

    }

    pub mod driver {
        use super::aggregator::{AnnotationTable, aggregate};
        use crate::core::{Block, BlockWithSource, Document, List};
        use crate::format::format_document;
        use crate::storage::DocumentParser;
        use anyhow::{Context, Result};
        use tracing::{Level, debug, info};

        /// Aggregate every list reachable from the document root without passing
        /// through another list. Nested lists are reached via their parent items.
        pub fn run(doc: &mut Document) -> AnnotationTable {
            debug!("computing task estimates");
            let mut table = AnnotationTable::new();
            let mut lists = 0;
            for_each_root_list(&mut doc.blocks, &mut |list| {
                lists += 1;
                for item in &mut list.items {
                    aggregate(item, &mut table);
                }
            });

            info!(
                lists,
                items = table.len(),
                rewritten = table.rewritten_count(),
                "estimates aggregated"
            );
            if tracing::enabled!(Level::DEBUG) {
                match table.to_json() {
                    Ok(json) => debug!("annotations:\n{json}"),
                    Err(err) => debug!("annotations not serializable: {err}"),
                }
            }
            table
        }

        fn for_each_root_list(blocks: &mut [BlockWithSource], f: &mut impl FnMut(&mut List)) {
            for block in blocks {
                match &mut block.block {
                    Block::List(list) => f(list),
                    Block::Quote(children) => for_each_root_list(children, f),
                    Block::Paragraph(_)
                    | Block::Heading { .. }
                    | Block::CodeBlock { .. }
                    | Block::Html { .. }
                    | Block::ThematicBreak => {}
                }
            }
        }

        /// Parse, aggregate and format one document.
        pub fn process_markdown<P: DocumentParser>(parser: &P, input: &str) -> Result<String> {
            let mut doc = parser.parse_str(input).context("parsing markdown")?;
            run(&mut doc);
            Ok(format_document(&doc))
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::parser::NomMarkdownParser;

            fn process(input: &str) -> String {
                process_markdown(&NomMarkdownParser, input).expect("process")
            }

            #[test]
            fn lists_inside_quotes_are_found() {
                assert_eq!(
                    process("> - P\n>   - A 3h\n"),
                    "> - P 3h\n>   - A 3h\n"
                );
            }

            #[test]
            fn every_top_level_list_is_processed() {
                let input = "- A\n  - x 1h\n\nText\n\n1. B 9h\n   1. y 2h\n";
                let expected = "- A 1h\n  - x 1h\n\nText\n\n1. B 2h\n   1. y 2h\n";
                assert_eq!(process(input), expected);
            }

            #[test]
            fn run_reports_annotations() {
                let mut doc =
                    crate::parser::parse_markdown_from_str("- P\n  - A 3h\n- Q 1h\n").expect("parse");
                let table = run(&mut doc);
                assert_eq!(table.len(), 3);
                assert_eq!(table.rewritten_count(), 1);
            }
        }
    }

    pub use aggregator::{AnnotationTable, aggregate};
    pub use driver::{process_markdown, run};
    pub use extractor::{Annotation, extract};
    pub use rewriter::{rewrite, rewrite_text};
}

pub use estimate::{process_markdown, run};
pub use format::format_document;
pub use parser::{NomMarkdownParser, parse_markdown_from_str};
