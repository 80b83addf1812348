//! Backlog digest library.
//! Renders a page outline as indented text and appends this week's journal blocks
//! that link back to the page. The core stays pure; file and JSON readers sit behind
//! the `storage` traits.

pub mod core {
    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer, Serialize};
    use std::path::PathBuf;

    /* ------------------------------ Outline ------------------------------ */

    /// A single outline block with ordered children.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct OutlineNode {
        /// Block text. Empty text makes the node transparent when rendering.
        #[serde(default, alias = "content")]
        pub text: String,

        /// Child entries in display order.
        #[serde(default)]
        pub children: Vec<Child>,

        /// Block properties (`key:: value`) in source order. Not rendered.
        #[serde(
            default,
            deserialize_with = "string_properties",
            skip_serializing_if = "IndexMap::is_empty"
        )]
        pub properties: IndexMap<String, String>,
    }

    impl OutlineNode {
        pub fn new(text: impl Into<String>) -> Self {
            Self {
                text: text.into(),
                children: vec![],
                properties: IndexMap::new(),
            }
        }

        pub fn with_child(mut self, child: OutlineNode) -> Self {
            self.children.push(Child::Node(child));
            self
        }

        pub fn with_unresolved(mut self, reference: ChildRef) -> Self {
            self.children.push(Child::Unresolved(reference));
            self
        }

        /// Resolved children only; placeholders are skipped.
        pub fn child_nodes(&self) -> impl Iterator<Item = &OutlineNode> {
            self.children.iter().filter_map(|child| match child {
                Child::Node(node) => Some(node),
                Child::Unresolved(_) => None,
            })
        }
    }

    /// A child slot is either an expanded block or the host's unexpanded reference.
    ///
    /// Placeholders arrive as two-element arrays (`["uuid", "<id>"]`), expanded blocks as
    /// objects, so the variants are tried in that order.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum Child {
        Unresolved(ChildRef),
        Node(OutlineNode),
    }

    /// Tuple-shaped reference to a block the host has not expanded.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ChildRef(pub String, pub String);

    impl ChildRef {
        pub fn uuid(id: impl Into<String>) -> Self {
            Self("uuid".into(), id.into())
        }

        pub fn kind(&self) -> &str {
            &self.0
        }

        pub fn id(&self) -> &str {
            &self.1
        }
    }

    // Host properties may carry arrays or numbers; keep them as their JSON text.
    fn string_properties<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<IndexMap<String, serde_json::Value>>::deserialize(deserializer)?;
        Ok(raw
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect())
    }

    /* ------------------------------ Sources ------------------------------ */

    /// The page a related group was gathered from.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Source {
        /// Title as shown to users, e.g. `October 26th, 2023` for journals.
        #[serde(alias = "originalName")]
        pub display_name: String,

        /// Journal date as YYYYMMDD; absent or zero for regular pages.
        #[serde(default)]
        pub journal_day: Option<u32>,
    }

    impl Source {
        pub fn page(display_name: impl Into<String>) -> Self {
            Self {
                display_name: display_name.into(),
                journal_day: None,
            }
        }

        pub fn journal(display_name: impl Into<String>, journal_day: u32) -> Self {
            Self {
                display_name: display_name.into(),
                journal_day: Some(journal_day),
            }
        }

        /// The journal day when this source is a dated entry.
        pub fn dated_day(&self) -> Option<u32> {
            self.journal_day.filter(|day| *day != 0)
        }
    }

    /// A source paired with the blocks from it that reference the exported page.
    ///
    /// Serialized the way the host returns linked references: `[source, [blocks...]]`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(
        from = "(Option<Source>, Vec<OutlineNode>)",
        into = "(Option<Source>, Vec<OutlineNode>)"
    )]
    pub struct RelatedGroup {
        pub source: Option<Source>,
        pub nodes: Vec<OutlineNode>,
    }

    impl RelatedGroup {
        pub fn new(source: Option<Source>, nodes: Vec<OutlineNode>) -> Self {
            Self { source, nodes }
        }
    }

    impl From<(Option<Source>, Vec<OutlineNode>)> for RelatedGroup {
        fn from((source, nodes): (Option<Source>, Vec<OutlineNode>)) -> Self {
            Self { source, nodes }
        }
    }

    impl From<RelatedGroup> for (Option<Source>, Vec<OutlineNode>) {
        fn from(group: RelatedGroup) -> Self {
            (group.source, group.nodes)
        }
    }

    /// A related group whose source is a dated journal entry inside the window.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DatedGroup {
        pub source: Source,
        /// Non-zero YYYYMMDD copied from the source.
        pub journal_day: u32,
        pub nodes: Vec<OutlineNode>,
    }

    /* ------------------------------ Parsed pages ------------------------------ */

    /// Result of parsing one markdown page.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct ParsedPage {
        /// Properties declared before the first block.
        pub properties: IndexMap<String, String>,
        /// Top-level blocks.
        pub blocks: Vec<OutlineNode>,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error("page {0:?} not found")]
        PageNotFound(String),
        #[error("file name of {0:?} is not valid UTF-8")]
        NonUtf8FileName(PathBuf),
    }
}

pub mod storage {
    use super::core::{OutlineNode, ParsedPage, RelatedGroup};
    use anyhow::Result;
    use std::path::Path;

    /// Supplies the page outline and its linked references.
    pub trait OutlineRepository {
        /// The page's stored name for a requested name. Lookups may ignore case while
        /// link cleanup matches the stored name exactly.
        fn resolve_page(&self, page: &str) -> Result<String> {
            Ok(page.to_string())
        }

        /// Top-level blocks of `page`, in display order.
        fn fetch_outline(&self, page: &str) -> Result<Vec<OutlineNode>>;

        /// Blocks on other pages that reference `page`, grouped by source page.
        fn fetch_related_groups(&self, page: &str) -> Result<Vec<RelatedGroup>>;
    }

    impl<T: OutlineRepository + ?Sized> OutlineRepository for &T {
        fn resolve_page(&self, page: &str) -> Result<String> {
            (**self).resolve_page(page)
        }

        fn fetch_outline(&self, page: &str) -> Result<Vec<OutlineNode>> {
            (**self).fetch_outline(page)
        }

        fn fetch_related_groups(&self, page: &str) -> Result<Vec<RelatedGroup>> {
            (**self).fetch_related_groups(page)
        }
    }

    /// Parsing is independent of graph scanning.
    pub trait OutlineParser {
        fn parse_file(&self, abs_path: &Path) -> Result<ParsedPage>;
    }
}

pub mod render {
    //! Outline → indented markdown bullets.

    use super::core::{Child, OutlineNode};
    use tracing::warn;

    const INDENT: &str = "  ";

    /// Render `node` and its descendants, starting at `indent_level`.
    ///
    /// A node with text produces `"{indent}- {text}\n"` and pushes its children one level
    /// deeper. A node without text produces nothing and its children stay at its level.
    /// Unresolved child references are skipped with a warning.
    pub fn render_node(node: &OutlineNode, indent_level: usize) -> String {
        let mut out = String::new();
        write_node(&mut out, node, indent_level);
        out
    }

    /// Render top-level blocks in order, each starting at level 0.
    pub fn render_outline(nodes: &[OutlineNode]) -> String {
        let mut out = String::new();
        for node in nodes {
            write_node(&mut out, node, 0);
        }
        out
    }

    fn write_node(out: &mut String, node: &OutlineNode, indent_level: usize) {
        let next_level = if node.text.is_empty() {
            indent_level
        } else {
            for _ in 0..indent_level {
                out.push_str(INDENT);
            }
            out.push_str("- ");
            out.push_str(&node.text);
            out.push('\n');
            indent_level + 1
        };

        for child in &node.children {
            match child {
                Child::Node(child) => write_node(out, child, next_level),
                Child::Unresolved(reference) => {
                    warn!(
                        kind = reference.kind(),
                        id = reference.id(),
                        "skipping unresolved child reference"
                    );
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::ChildRef;
        use tracing_test::traced_test;

        fn count_text_nodes(node: &OutlineNode) -> usize {
            let own = usize::from(!node.text.is_empty());
            own + node.child_nodes().map(count_text_nodes).sum::<usize>()
        }

        #[test]
        fn nested_children_indent_two_spaces_per_level() {
            let node = OutlineNode::new("root")
                .with_child(OutlineNode::new("child").with_child(OutlineNode::new("grandchild")))
                .with_child(OutlineNode::new("sibling"));

            let rendered = render_node(&node, 0);
            assert_eq!(
                rendered,
                "- root\n  - child\n    - grandchild\n  - sibling\n"
            );
        }

        #[test]
        fn starting_level_offsets_every_line() {
            let node = OutlineNode::new("a").with_child(OutlineNode::new("b"));
            assert_eq!(render_node(&node, 2), "    - a\n      - b\n");
        }

        #[test]
        fn empty_text_is_transparent() {
            let node = OutlineNode::new("parent").with_child(
                OutlineNode::new("")
                    .with_child(OutlineNode::new("kept level"))
                    .with_child(OutlineNode::new("").with_child(OutlineNode::new("still kept"))),
            );

            let rendered = render_node(&node, 0);
            assert_eq!(rendered, "- parent\n  - kept level\n  - still kept\n");
        }

        #[test]
        fn empty_leaf_renders_nothing() {
            assert_eq!(render_node(&OutlineNode::new(""), 3), "");
        }

        #[test]
        #[traced_test]
        fn unresolved_children_are_skipped_with_warning() {
            let node = OutlineNode::new("parent")
                .with_unresolved(ChildRef::uuid("65a1f0c2-0000-4000-8000-000000000001"))
                .with_child(OutlineNode::new("resolved"));

            let rendered = render_node(&node, 0);
            assert_eq!(rendered, "- parent\n  - resolved\n");
            assert!(logs_contain("skipping unresolved child reference"));
            assert!(logs_contain("65a1f0c2-0000-4000-8000-000000000001"));
        }

        #[test]
        fn line_count_matches_nodes_with_text() {
            let node = OutlineNode::new("one")
                .with_child(OutlineNode::new(""))
                .with_child(
                    OutlineNode::new("two")
                        .with_unresolved(ChildRef::uuid("x"))
                        .with_child(OutlineNode::new("three")),
                )
                .with_child(OutlineNode::new("").with_child(OutlineNode::new("four")));

            let rendered = render_node(&node, 0);
            assert_eq!(rendered.lines().count(), count_text_nodes(&node));
            assert_eq!(rendered.lines().count(), 4);
        }

        #[test]
        fn outline_concatenates_top_level_blocks() {
            let nodes = vec![
                OutlineNode::new("A"),
                OutlineNode::new("B").with_child(OutlineNode::new("B1")),
            ];
            assert_eq!(render_outline(&nodes), "- A\n- B\n  - B1\n");
            assert_eq!(render_outline(&[]), "");
        }
    }
}

pub mod calendar {
    //! Week arithmetic and journal date encodings.

    use chrono::{Datelike, Duration, Local, NaiveDate};

    /// Source of "today" for week computations.
    pub trait Clock {
        fn today(&self) -> NaiveDate;
    }

    /// The local calendar date.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn today(&self) -> NaiveDate {
            Local::now().date_naive()
        }
    }

    /// Always returns the wrapped date.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FixedClock(pub NaiveDate);

    impl Clock for FixedClock {
        fn today(&self) -> NaiveDate {
            self.0
        }
    }

    /// Most recent Monday on or before `date`.
    pub fn week_start(date: NaiveDate) -> NaiveDate {
        let from_sunday = date.weekday().num_days_from_sunday();
        let days_back = (from_sunday + 6) % 7;
        date - Duration::days(i64::from(days_back))
    }

    /// Encode as YYYYMMDD.
    pub fn to_journal_day(date: NaiveDate) -> u32 {
        let year = u32::try_from(date.year()).unwrap_or(0);
        year * 10_000 + date.month() * 100 + date.day()
    }

    /// Journal page title, e.g. `January 2nd, 2024`.
    pub fn journal_title(date: NaiveDate) -> String {
        let day = date.day();
        format!(
            "{} {}{}, {}",
            date.format("%B"),
            day,
            ordinal_suffix(day),
            date.year()
        )
    }

    fn ordinal_suffix(day: u32) -> &'static str {
        match day % 100 {
            11..=13 => "th",
            _ => match day % 10 {
                1 => "st",
                2 => "nd",
                3 => "rd",
                _ => "th",
            },
        }
    }

    /// Drop the two characters before the first comma: `October 26th, 2023` → `October 26, 2023`.
    ///
    /// The cut is positional; it assumes a two-letter suffix sits right before the comma.
    /// Without a comma the name is returned unchanged, and a comma closer than two
    /// characters to the start keeps everything from the comma on.
    pub fn strip_ordinal(display_name: &str) -> String {
        let chars: Vec<char> = display_name.chars().collect();
        match chars.iter().position(|c| *c == ',') {
            Some(comma) => chars[..comma.saturating_sub(2)]
                .iter()
                .chain(&chars[comma..])
                .collect(),
            None => display_name.to_string(),
        }
    }

}

pub mod digest {
    //! Weekly digest: the page outline followed by this week's linked journal blocks.

    use crate::calendar::{self, Clock};
    use crate::core::*;
    use crate::render::render_outline;
    use crate::storage::OutlineRepository;
    use anyhow::{Context, Result};
    use tracing::debug;

    /* ------------------------------ Options ------------------------------ */

    /// Document layout knobs.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DigestOptions {
        /// Line between the page outline and the backlog section.
        pub separator: String,
        /// Heading line opening the backlog section.
        pub heading: String,
    }

    impl Default for DigestOptions {
        fn default() -> Self {
            Self {
                separator: "----".into(),
                heading: "## Backlog".into(),
            }
        }
    }

    /* ------------------------------ Builder ------------------------------ */

    pub struct DigestBuilder<R, C> {
        repository: R,
        clock: C,
        options: DigestOptions,
    }

    impl<R: OutlineRepository, C: Clock> DigestBuilder<R, C> {
        pub fn new(repository: R, clock: C) -> Self {
            Self {
                repository,
                clock,
                options: DigestOptions::default(),
            }
        }

        pub fn with_options(mut self, options: DigestOptions) -> Self {
            self.options = options;
            self
        }

        /// Build the digest document for `page`.
        ///
        /// Repository failures propagate unchanged apart from added context.
        pub fn build(&self, requested: &str) -> Result<String> {
            let page = self
                .repository
                .resolve_page(requested)
                .with_context(|| format!("resolving page {requested:?}"))?;
            let page = page.as_str();
            let outline = self
                .repository
                .fetch_outline(page)
                .with_context(|| format!("fetching outline of {page:?}"))?;
            let groups = self
                .repository
                .fetch_related_groups(page)
                .with_context(|| format!("fetching references to {page:?}"))?;

            let today = self.clock.today();
            let since = calendar::to_journal_day(calendar::week_start(today));
            debug!(%today, since, groups = groups.len(), "selecting this week's references");

            let recent = select_recent(groups, since);
            Ok(assemble(&outline, &recent, page, &self.options))
        }
    }

    /* ------------------------------ Pipeline ------------------------------ */

    /// Keep dated groups on or after `since` (YYYYMMDD), newest first.
    ///
    /// Groups without a source or without a journal day are dropped. Groups sharing a
    /// day keep their incoming order.
    pub fn select_recent(groups: Vec<RelatedGroup>, since: u32) -> Vec<DatedGroup> {
        let mut recent: Vec<DatedGroup> = groups
            .into_iter()
            .filter_map(|group| {
                let RelatedGroup { source, nodes } = group;
                let Some(source) = source else {
                    debug!("dropping reference group without a source");
                    return None;
                };
                let Some(journal_day) = source.dated_day() else {
                    debug!(source = %source.display_name, "dropping undated source");
                    return None;
                };
                if journal_day < since {
                    debug!(source = %source.display_name, journal_day, "dropping source before week start");
                    return None;
                }
                Some(DatedGroup {
                    source,
                    journal_day,
                    nodes,
                })
            })
            .collect();
        recent.sort_by(|a, b| b.journal_day.cmp(&a.journal_day));
        recent
    }

    /// Remove `#[[page]]` and `[[page]]` literally, then trim the ends.
    pub fn clean_reference_text(text: &str, page: &str) -> String {
        let tagged = format!("#[[{page}]]");
        let linked = format!("[[{page}]]");
        text.replace(&tagged, "")
            .replace(&linked, "")
            .trim()
            .to_string()
    }

    /// Cleaned copies of `nodes`; only the top-level text changes.
    pub fn clean_nodes(nodes: &[OutlineNode], page: &str) -> Vec<OutlineNode> {
        nodes
            .iter()
            .map(|node| OutlineNode {
                text: clean_reference_text(&node.text, page),
                ..node.clone()
            })
            .collect()
    }

    /// Lay out the final document from already selected groups.
    pub fn assemble(
        outline: &[OutlineNode],
        recent: &[DatedGroup],
        page: &str,
        options: &DigestOptions,
    ) -> String {
        let mut out = render_outline(outline);
        out.push_str(&options.separator);
        out.push('\n');
        out.push_str(&options.heading);
        out.push('\n');

        for group in recent {
            out.push_str("**");
            out.push_str(&calendar::strip_ordinal(&group.source.display_name));
            out.push_str("**\n");
            out.push_str(&render_outline(&clean_nodes(&group.nodes, page)));
        }
        out
    }

}

pub mod parser {
    //! Markdown outline parser built on `nom`.
    //!
    //! Parsing strategy:
    //! - The scan is line-oriented; each line is classified with small `nom` parsers.
    //! - `- text` lines open blocks. Depth is one per tab or per two spaces of indentation.
    //! - `key:: value` lines attach to the open block, or to the page before the first block.
    //! - Any other line continues the open block's text.
    //! - The block tree is stack-built from depths.

    use crate::core::*;
    use crate::storage::OutlineParser;
    use anyhow::{Context, Result};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while, take_while1},
        character::complete::{char, not_line_ending, space1},
        combinator::{all_consuming, eof, map, value},
        error::VerboseError,
        sequence::{preceded, separated_pair, tuple},
    };
    use std::{fs, path::Path};
    use tracing::trace;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a markdown outline page.
    pub fn parse_outline_from_str(input: &str) -> ParsedPage {
        let mut page = ParsedPage::default();
        let mut stack: Vec<(usize, OutlineNode)> = Vec::new();

        for (idx, line) in input.lines().enumerate() {
            match classify(line) {
                Line::Blank => {}
                Line::Bullet { depth, text } => {
                    while stack.last().is_some_and(|(open, _)| *open >= depth) {
                        close_top(&mut stack, &mut page.blocks);
                    }
                    stack.push((depth, OutlineNode::new(text)));
                }
                Line::Property { key, value } => {
                    let target = match stack.last_mut() {
                        Some((_, node)) => &mut node.properties,
                        None => &mut page.properties,
                    };
                    target.insert(key.to_string(), value.to_string());
                }
                Line::Text(text) => match stack.last_mut() {
                    Some((_, node)) => {
                        if !node.text.is_empty() {
                            node.text.push('\n');
                        }
                        node.text.push_str(text);
                    }
                    None => trace!(line = idx + 1, "ignoring text before the first block"),
                },
            }
        }

        while !stack.is_empty() {
            close_top(&mut stack, &mut page.blocks);
        }
        page
    }

    /// Concrete parser implementing the `storage::OutlineParser` trait.
    pub struct MarkdownOutlineParser;

    impl OutlineParser for MarkdownOutlineParser {
        fn parse_file(&self, abs_path: &Path) -> Result<ParsedPage> {
            let text =
                fs::read_to_string(abs_path).with_context(|| format!("reading {:?}", abs_path))?;
            Ok(parse_outline_from_str(&text))
        }
    }

    /* ------------------------------- Utils ------------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    #[derive(Debug, PartialEq, Eq)]
    enum Line<'a> {
        Blank,
        Bullet { depth: usize, text: &'a str },
        Property { key: &'a str, value: &'a str },
        Text(&'a str),
    }

    fn classify(line: &str) -> Line<'_> {
        if line.trim().is_empty() {
            return Line::Blank;
        }
        if let Ok((_, (depth, text))) = bullet_line(line) {
            return Line::Bullet { depth, text };
        }
        let trimmed = line.trim();
        if let Ok((_, (key, value))) = property_line(trimmed) {
            return Line::Property { key, value };
        }
        Line::Text(trimmed)
    }

    fn close_top(stack: &mut Vec<(usize, OutlineNode)>, roots: &mut Vec<OutlineNode>) {
        if let Some((_, node)) = stack.pop() {
            match stack.last_mut() {
                Some((_, parent)) => parent.children.push(Child::Node(node)),
                None => roots.push(node),
            }
        }
    }

    fn indent_depth(ws: &str) -> usize {
        let tabs = ws.chars().filter(|c| *c == '\t').count();
        let spaces = ws.chars().filter(|c| *c == ' ').count();
        tabs + spaces / 2
    }

    fn is_property_key_char(c: char) -> bool {
        c.is_alphanumeric() || c == '-' || c == '_'
    }

    /* ------------------------------ Lines ------------------------------ */

    fn indentation(i: &str) -> PResult<'_, usize> {
        map(take_while(|c: char| c == ' ' || c == '\t'), indent_depth)(i)
    }

    fn bullet_line(i: &str) -> PResult<'_, (usize, &str)> {
        map(
            tuple((
                indentation,
                char('-'),
                alt((value("", eof), preceded(space1, not_line_ending))),
            )),
            |(depth, _, text)| (depth, text.trim_end()),
        )(i)
    }

    fn property_line(i: &str) -> PResult<'_, (&str, &str)> {
        all_consuming(separated_pair(
            take_while1(is_property_key_char),
            tag("::"),
            map(not_line_ending, str::trim),
        ))(i)
    }

}

pub mod graph {
    //! Markdown graph on disk: `pages/*.md` plus `journals/YYYY_MM_DD.md`.
    //!
    //! Pages are keyed by lower-cased name and kept in load order. Journal pages get a
    //! `journal_day` and an English title (`January 2nd, 2024`).

    use crate::calendar::{journal_title, to_journal_day};
    use crate::core::*;
    use crate::parser::MarkdownOutlineParser;
    use crate::storage::{OutlineParser, OutlineRepository};
    use anyhow::{Context, Result};
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use std::{
        fs,
        path::{Path, PathBuf},
    };
    use tracing::{debug, warn};

    pub const PAGES_DIR: &str = "pages";
    pub const JOURNALS_DIR: &str = "journals";

    /// A loaded page.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Page {
        pub name: String,
        /// YYYYMMDD for journal pages.
        pub journal_day: Option<u32>,
        /// Properties declared before the first block.
        pub properties: IndexMap<String, String>,
        pub blocks: Vec<OutlineNode>,
    }

    impl Page {
        pub fn new(name: impl Into<String>, blocks: Vec<OutlineNode>) -> Self {
            Self {
                name: name.into(),
                journal_day: None,
                properties: IndexMap::new(),
                blocks,
            }
        }

        pub fn journal(date: NaiveDate, blocks: Vec<OutlineNode>) -> Self {
            Self {
                journal_day: Some(to_journal_day(date)),
                ..Self::new(journal_title(date), blocks)
            }
        }

        pub fn source(&self) -> Source {
            Source {
                display_name: self.name.clone(),
                journal_day: self.journal_day,
            }
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct LogseqGraph {
        pages: IndexMap<String, Page>,
    }

    impl LogseqGraph {
        /// Read every page and journal under `root`. Missing subdirectories are empty.
        pub fn load(root: &Path) -> Result<Self> {
            let parser = MarkdownOutlineParser;
            let mut graph = Self::default();

            for path in markdown_files(&root.join(PAGES_DIR))? {
                let parsed = parser.parse_file(&path)?;
                let name = match parsed.properties.get("title") {
                    Some(title) => title.clone(),
                    None => page_name_from_stem(file_stem(&path)?),
                };
                debug!(?path, %name, "loaded page");
                graph.insert(Page {
                    name,
                    journal_day: None,
                    properties: parsed.properties,
                    blocks: parsed.blocks,
                });
            }

            for path in markdown_files(&root.join(JOURNALS_DIR))? {
                let stem = file_stem(&path)?;
                let Ok(date) = NaiveDate::parse_from_str(stem, "%Y_%m_%d") else {
                    warn!(?path, "skipping journal with an unrecognized file name");
                    continue;
                };
                let parsed = parser.parse_file(&path)?;
                debug!(?path, %date, "loaded journal");
                graph.insert(Page {
                    properties: parsed.properties,
                    ..Page::journal(date, parsed.blocks)
                });
            }

            Ok(graph)
        }

        /// Add or replace a page; names compare case-insensitively.
        pub fn insert(&mut self, page: Page) {
            self.pages.insert(page.name.to_lowercase(), page);
        }

        pub fn page(&self, name: &str) -> Option<&Page> {
            self.pages.get(&name.to_lowercase())
        }

        pub fn pages(&self) -> impl Iterator<Item = &Page> {
            self.pages.values()
        }

        pub fn len(&self) -> usize {
            self.pages.len()
        }

        pub fn is_empty(&self) -> bool {
            self.pages.is_empty()
        }

        fn require(&self, name: &str) -> Result<&Page> {
            self.page(name)
                .ok_or_else(|| DomainError::PageNotFound(name.to_string()).into())
        }
    }

    impl OutlineRepository for LogseqGraph {
        fn resolve_page(&self, page: &str) -> Result<String> {
            Ok(self.require(page)?.name.clone())
        }

        fn fetch_outline(&self, page: &str) -> Result<Vec<OutlineNode>> {
            Ok(self.require(page)?.blocks.clone())
        }

        fn fetch_related_groups(&self, page: &str) -> Result<Vec<RelatedGroup>> {
            let target = self.require(page)?;
            let key = target.name.to_lowercase();

            let mut groups = Vec::new();
            for other in self.pages() {
                if other.name.to_lowercase() == key {
                    continue;
                }
                let mut nodes = Vec::new();
                collect_mentions(&other.blocks, &key, &mut nodes);
                if !nodes.is_empty() {
                    groups.push(RelatedGroup::new(Some(other.source()), nodes));
                }
            }
            Ok(groups)
        }
    }

    /// Whether `text` links the page as `[[page]]` or tags it as `#page`, ignoring case.
    ///
    /// `page_key` must already be lower-cased.
    pub fn mentions(text: &str, page_key: &str) -> bool {
        let text = text.to_lowercase();
        if text.contains(&format!("[[{page_key}]]")) {
            return true;
        }
        text.split_whitespace().any(|word| {
            word.strip_prefix('#')
                .map(|tag| tag.trim_end_matches(|c: char| ",.;:!?".contains(c)))
                .is_some_and(|tag| tag == page_key)
        })
    }

    // Outermost mentioning blocks; their subtrees travel with them.
    fn collect_mentions<'a>(
        nodes: impl IntoIterator<Item = &'a OutlineNode>,
        page_key: &str,
        out: &mut Vec<OutlineNode>,
    ) {
        for node in nodes {
            if mentions(&node.text, page_key) {
                out.push(node.clone());
            } else {
                collect_mentions(node.child_nodes(), page_key, out);
            }
        }
    }

    fn page_name_from_stem(stem: &str) -> String {
        stem.replace("___", "/")
    }

    fn file_stem(path: &Path) -> Result<&str> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| DomainError::NonUtf8FileName(path.to_path_buf()).into())
    }

    fn markdown_files(dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            debug!(?dir, "directory missing; nothing to load");
            return Ok(vec![]);
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("reading directory {:?}", dir))? {
            let path = entry?.path();
            if path.is_file() && path.extension().map(|ext| ext == "md").unwrap_or(false) {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

}

pub mod snapshot {
    //! JSON capture of the host payloads for one page.
    //!
    //! ```json
    //! { "page": "Project",
    //!   "outline": [{ "content": "A", "children": [["uuid", "65a1..."]] }],
    //!   "related": [[{ "originalName": "Jan 2nd, 2024", "journalDay": 20240102 },
    //!                [{ "content": "Task #[[Project]]" }]]] }
    //! ```

    use crate::core::*;
    use crate::storage::OutlineRepository;
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Snapshot {
        pub page: String,
        #[serde(default)]
        pub outline: Vec<OutlineNode>,
        #[serde(default)]
        pub related: Vec<RelatedGroup>,
    }

    impl Snapshot {
        pub fn new(
            page: impl Into<String>,
            outline: Vec<OutlineNode>,
            related: Vec<RelatedGroup>,
        ) -> Self {
            Self {
                page: page.into(),
                outline,
                related,
            }
        }

        pub fn from_json_str(input: &str) -> Result<Self> {
            serde_json::from_str(input).context("decoding snapshot JSON")
        }

        pub fn load(path: &Path) -> Result<Self> {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Self::from_json_str(&text).with_context(|| format!("parsing {:?}", path))
        }

        fn ensure_page(&self, page: &str) -> Result<()> {
            if self.page.to_lowercase() == page.to_lowercase() {
                Ok(())
            } else {
                Err(DomainError::PageNotFound(page.to_string()).into())
            }
        }
    }

    impl OutlineRepository for Snapshot {
        fn resolve_page(&self, page: &str) -> Result<String> {
            self.ensure_page(page)?;
            Ok(self.page.clone())
        }

        fn fetch_outline(&self, page: &str) -> Result<Vec<OutlineNode>> {
            self.ensure_page(page)?;
            Ok(self.outline.clone())
        }

        fn fetch_related_groups(&self, page: &str) -> Result<Vec<RelatedGroup>> {
            self.ensure_page(page)?;
            Ok(self.related.clone())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::render::render_outline;

        const SAMPLE: &str = r#"{
  "page": "Project",
  "outline": [
    { "content": "A", "uuid": "ignored", "children": [["uuid", "65a1f0c2"], { "content": "A1" }] },
    { "content": "B", "properties": { "tags": ["x", "y"], "id": "b1" } }
  ],
  "related": [
    [{ "originalName": "January 2nd, 2024", "journalDay": 20240102, "name": "january 2nd, 2024" },
     [{ "content": "Task #[[Project]]" }]],
    [null, [{ "content": "orphan" }]],
    [{ "displayName": "Inbox" }, []]
  ]
}"#;

        #[test]
        fn decodes_host_payload_shapes() {
            let snapshot = Snapshot::from_json_str(SAMPLE).expect("decode");

            assert!(matches!(
                &snapshot.outline[0].children[0],
                Child::Unresolved(r) if r.kind() == "uuid" && r.id() == "65a1f0c2"
            ));
            assert_eq!(render_outline(&snapshot.outline), "- A\n  - A1\n- B\n");
            assert_eq!(
                snapshot.outline[1].properties.get("tags").map(String::as_str),
                Some("[\"x\",\"y\"]")
            );

            assert_eq!(snapshot.related.len(), 3);
            assert_eq!(
                snapshot.related[0].source,
                Some(Source::journal("January 2nd, 2024", 20240102))
            );
            assert_eq!(snapshot.related[1].source, None);
            assert_eq!(snapshot.related[2].source, Some(Source::page("Inbox")));
        }

        #[test]
        fn serializes_groups_as_tuples() {
            let group = RelatedGroup::new(None, vec![OutlineNode::new("x")]);
            let json = serde_json::to_value(&group).expect("encode");
            assert_eq!(json, serde_json::json!([null, [{ "text": "x", "children": [] }]]));
        }

        #[test]
        fn other_pages_are_not_found() {
            let snapshot = Snapshot::from_json_str(SAMPLE).expect("decode");
            assert!(snapshot.fetch_outline("project").is_ok());
            assert_eq!(snapshot.resolve_page("PROJECT").expect("resolve"), "Project");
            assert!(snapshot.fetch_related_groups("Elsewhere").is_err());
        }

        #[test]
        fn load_reports_bad_json() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("bad.json");
            fs::write(&path, "{ not json").expect("write");
            let err = Snapshot::load(&path).expect_err("bad json");
            assert!(format!("{err:#}").contains("decoding snapshot JSON"));
        }
    }
}

pub use calendar::{Clock, FixedClock, SystemClock};
pub use digest::{DigestBuilder, DigestOptions};
pub use graph::LogseqGraph;
pub use parser::parse_outline_from_str;
pub use snapshot::Snapshot;
pub use storage::OutlineRepository;
