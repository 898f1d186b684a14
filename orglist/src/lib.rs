//! Org outline TODO lists.
//! Level-1 headings are named lists, their todo-keyword children are items. Every
//! mutation is one whole-document transaction that prints untouched text back verbatim.

pub mod core {
    use chrono::{Local, NaiveDate, NaiveTime, Timelike};
    use indexmap::{IndexMap, IndexSet};
    use serde::Serialize;
    use std::{fmt, path::PathBuf, str::FromStr};

    /// Property holding an item's effort estimate.
    pub const EFFORT_PROPERTY: &str = "Effort";

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: a single outline document.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
    pub struct Document {
        /// Where the text was loaded from, if anywhere.
        pub path: Option<PathBuf>,

        /// File-local settings (`#+TODO:` and other `#+KEY:` lines).
        pub settings: FileSettings,

        /// Content before the first heading.
        pub preamble: Vec<BlockWithSource>,

        /// Top-level headings in document order.
        pub headings: Vec<Heading>,
    }

    impl Document {
        pub fn new(path: Option<PathBuf>) -> Self {
            Self {
                path,
                ..Self::default()
            }
        }

        /// Keyword cycle in effect for this document.
        pub fn cycle(&self) -> &TodoCycle {
            &self.settings.cycle
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
    pub struct FileSettings {
        /// The configured cycle, or the file's own `#+TODO:` sequences when present.
        pub cycle: TodoCycle,

        /// Any other `#+KEY: value` lines from the preamble (keys lowercased).
        pub meta: IndexMap<String, String>,
    }

    /* ------------------------------ Entities ------------------------------ */

    /// A heading node. Level-1 headings are lists; their keyword-carrying children are items.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Heading {
        pub level: u8,

        /// Raw title text, without keyword, priority cookie or tags.
        pub title: String,

        pub todo: Option<TodoKeyword>,

        pub priority: Option<Priority>,

        /// Tags after the title (`:tag1:tag2:`), in written order.
        pub tags: IndexSet<Tag>,

        /// Planning line directly under the headline.
        pub planning: Planning,

        /// Property drawer directly under the headline (or planning line).
        pub properties: PropertyDrawer,

        /// Body content until the first child heading.
        pub section: Section,

        pub children: Vec<Heading>,

        /// Byte offset of the headline in the text this node was parsed from.
        /// Only meaningful for that one parse; edited and moved nodes drop it.
        pub offset: Option<usize>,

        /// Verbatim headline line, used by the printer while the headline is untouched.
        #[serde(skip)]
        pub headline_raw: Option<String>,

        #[serde(skip)]
        pub planning_raw: Option<String>,

        #[serde(skip)]
        pub properties_raw: Option<String>,
    }

    impl Heading {
        pub fn new(level: u8, title: impl Into<String>) -> Self {
            Self {
                level,
                title: title.into(),
                todo: None,
                priority: None,
                tags: IndexSet::new(),
                planning: Planning::default(),
                properties: PropertyDrawer::default(),
                section: Section::default(),
                children: vec![],
                offset: None,
                headline_raw: None,
                planning_raw: None,
                properties_raw: None,
            }
        }

        /// Only headings carrying a todo keyword are enumerable as items.
        pub fn is_item(&self) -> bool {
            self.todo.is_some()
        }

        pub fn mark_headline_dirty(&mut self) {
            self.headline_raw = None;
            self.offset = None;
        }

        pub fn mark_planning_dirty(&mut self) {
            self.planning_raw = None;
        }

        pub fn mark_properties_dirty(&mut self) {
            self.properties_raw = None;
        }

        pub fn set_todo(&mut self, todo: Option<TodoKeyword>) {
            if self.todo != todo {
                self.todo = todo;
                self.mark_headline_dirty();
            }
        }

        pub fn set_priority(&mut self, priority: Option<Priority>) {
            if self.priority != priority {
                self.priority = priority;
                self.mark_headline_dirty();
            }
        }

        pub fn set_tags(&mut self, tags: IndexSet<Tag>) {
            if self.tags != tags {
                self.tags = tags;
                self.mark_headline_dirty();
            }
        }

        pub fn set_closed(&mut self, closed: Option<Timestamp>) {
            if self.planning.closed != closed {
                self.planning.closed = closed;
                self.mark_planning_dirty();
            }
        }

        pub fn property(&self, key: &str) -> Option<&str> {
            self.properties.get(key)
        }

        /// Set (`Some`) or remove (`None`) a property.
        pub fn set_property(&mut self, key: &str, value: Option<&str>) {
            let changed = match value {
                Some(value) => self.properties.set(key, value),
                None => self.properties.remove(key),
            };
            if changed {
                self.mark_properties_dirty();
            }
        }

        /// Effort estimate from the `Effort` property; unparsable values read as `None`.
        pub fn effort(&self) -> Option<Effort> {
            self.property(EFFORT_PROPERTY).and_then(|v| v.parse().ok())
        }

        pub fn set_effort(&mut self, effort: Option<Effort>) {
            let value = effort.map(|e| e.to_string());
            self.set_property(EFFORT_PROPERTY, value.as_deref());
        }

        /// Promote or demote the whole subtree by `delta` levels (never above level 1).
        pub fn shift_level(&mut self, delta: i16) {
            if delta == 0 {
                return;
            }
            let level = (i16::from(self.level) + delta).clamp(1, i16::from(u8::MAX)) as u8;
            if level != self.level {
                self.level = level;
                self.mark_headline_dirty();
            }
            for child in &mut self.children {
                child.shift_level(delta);
            }
        }

        /// Forget source offsets for the whole subtree, e.g. before moving it.
        pub fn detach(&mut self) {
            self.offset = None;
            for child in &mut self.children {
                child.detach();
            }
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
    #[serde(transparent)]
    pub struct Tag(pub String);

    impl Tag {
        /// Validate a tag name (letters, digits, `_ - @ + # %`).
        pub fn parse(raw: &str) -> Result<Self> {
            let raw = raw.trim().trim_matches(':');
            if raw.is_empty() || !raw.chars().all(is_tag_char) {
                return Err(Error::InvalidValue(format!("malformed tag {raw:?}")));
            }
            Ok(Self(raw.to_string()))
        }
    }

    impl From<&str> for Tag {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    impl fmt::Display for Tag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    pub fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || matches!(c, '_' | '-' | '@' | '+' | '#' | '%')
    }

    /// Single-character priority, e.g. `[#A]`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
    #[serde(transparent)]
    pub struct Priority(pub char);

    impl fmt::Display for Priority {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    /// Todo keyword with a "done" flag so file-specific vocabularies are respected.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TodoKeyword {
        pub text: String,
        pub is_done: bool,
    }

    /// Planning line: SCHEDULED, DEADLINE, CLOSED.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
    pub struct Planning {
        pub scheduled: Option<Timestamp>,
        pub deadline: Option<Timestamp>,
        pub closed: Option<Timestamp>,
    }

    impl Planning {
        pub fn is_empty(&self) -> bool {
            self.scheduled.is_none() && self.deadline.is_none() && self.closed.is_none()
        }
    }

    /// Active `<...>` or inactive `[...]` timestamp.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Timestamp {
        pub active: bool,
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
        /// Anything between the time and the closing bracket (repeaters, delays, end times).
        pub suffix: Option<String>,
    }

    impl Timestamp {
        /// Inactive timestamp for the current local minute.
        pub fn inactive_now() -> Self {
            let now = Local::now().naive_local();
            Self {
                active: false,
                date: now.date(),
                time: NaiveTime::from_hms_opt(now.hour(), now.minute(), 0),
                suffix: None,
            }
        }
    }

    /// Effort estimate in minutes; written as `H:MM`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
    #[serde(transparent)]
    pub struct Effort {
        pub minutes: u32,
    }

    impl Effort {
        pub fn from_minutes(minutes: u32) -> Self {
            Self { minutes }
        }
    }

    impl FromStr for Effort {
        type Err = Error;

        fn from_str(s: &str) -> Result<Self> {
            crate::parser::parse_effort(s)
        }
    }

    impl fmt::Display for Effort {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{:02}", self.minutes / 60, self.minutes % 60)
        }
    }

    /* --------------------------- Todo keyword cycle --------------------------- */

    /// One keyword sequence; `|` splits not-done from done states.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TodoSequence {
        pub active: Vec<String>,
        pub done: Vec<String>,
    }

    impl TodoSequence {
        /// Build from Org keyword syntax such as `TODO NEXT | DONE(d!)`.
        /// Without a divider the last keyword is the done state.
        pub fn parse<S: AsRef<str>>(words: &[S]) -> std::result::Result<Self, String> {
            let mut active = Vec::new();
            let mut done = Vec::new();
            let mut divided = false;
            for word in words {
                let word = word.as_ref().trim();
                if word.is_empty() {
                    continue;
                }
                if word == "|" {
                    if divided {
                        return Err("more than one `|` divider".into());
                    }
                    divided = true;
                    continue;
                }
                let keyword = strip_fast_access(word);
                if keyword.is_empty()
                    || !keyword
                        .chars()
                        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
                {
                    return Err(format!("invalid todo keyword {word:?}"));
                }
                if active.iter().chain(done.iter()).any(|k| k == keyword) {
                    return Err(format!("duplicate todo keyword {keyword:?}"));
                }
                if divided {
                    done.push(keyword.to_string());
                } else {
                    active.push(keyword.to_string());
                }
            }
            if !divided && active.len() > 1 {
                if let Some(last) = active.pop() {
                    done.push(last);
                }
            }
            if active.is_empty() && done.is_empty() {
                return Err("empty todo keyword sequence".into());
            }
            Ok(Self { active, done })
        }

        fn keywords(&self) -> impl Iterator<Item = &String> {
            self.active.iter().chain(self.done.iter())
        }

        fn keyword_at(&self, idx: usize) -> Option<TodoKeyword> {
            let text = self.keywords().nth(idx)?.clone();
            Some(TodoKeyword {
                is_done: idx >= self.active.len(),
                text,
            })
        }
    }

    /// `DONE(d!)` -> `DONE`
    fn strip_fast_access(word: &str) -> &str {
        match word.find('(') {
            Some(pos) if word.ends_with(')') => &word[..pos],
            _ => word,
        }
    }

    /// Recognized keywords and the order the toggle action walks through them.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TodoCycle {
        sequences: Vec<TodoSequence>,
    }

    impl Default for TodoCycle {
        fn default() -> Self {
            Self {
                sequences: vec![TodoSequence {
                    active: vec!["TODO".into()],
                    done: vec!["DONE".into()],
                }],
            }
        }
    }

    impl TodoCycle {
        pub fn new(sequences: Vec<TodoSequence>) -> std::result::Result<Self, String> {
            if sequences.is_empty() {
                return Err("no todo keyword sequence".into());
            }
            let mut seen = std::collections::HashSet::new();
            for keyword in sequences.iter().flat_map(|s| s.keywords()) {
                if !seen.insert(keyword.as_str()) {
                    return Err(format!("duplicate todo keyword {keyword:?}"));
                }
            }
            Ok(Self { sequences })
        }

        pub fn sequences(&self) -> &[TodoSequence] {
            &self.sequences
        }

        pub fn contains(&self, word: &str) -> bool {
            self.find(word).is_some()
        }

        pub fn keyword(&self, word: &str) -> Option<TodoKeyword> {
            let (seq, idx) = self.find(word)?;
            self.sequences[seq].keyword_at(idx)
        }

        /// State given to newly inserted items.
        pub fn first(&self) -> Option<TodoKeyword> {
            self.sequences.first()?.keyword_at(0)
        }

        /// Next state after `current`: no keyword -> first, last keyword -> no keyword.
        pub fn next(&self, current: Option<&TodoKeyword>) -> Option<TodoKeyword> {
            let Some(current) = current else {
                return self.first();
            };
            match self.find(&current.text) {
                Some((seq, idx)) => self.sequences[seq].keyword_at(idx + 1),
                None => self.first(),
            }
        }

        fn find(&self, word: &str) -> Option<(usize, usize)> {
            self.sequences.iter().enumerate().find_map(|(seq, s)| {
                s.keywords()
                    .position(|k| k == word)
                    .map(|idx| (seq, idx))
            })
        }
    }

    /* ---------------------------- Content Model ---------------------------- */

    /// Body content under a headline.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
    pub struct Section {
        pub blocks: Vec<BlockWithSource>,
    }

    /// Opaque body blocks; only as much structure as printing a fresh block needs.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub enum Block {
        Blank,
        Paragraph(String),
        Drawer(Drawer),
        Directive { key: String, value: String },
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Drawer {
        pub name: String,
        pub lines: Vec<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct BlockWithSource {
        pub block: Block,
        #[serde(skip)]
        pub raw: Option<String>,
    }

    impl BlockWithSource {
        pub fn new(block: Block) -> Self {
            Self { block, raw: None }
        }

        pub fn from_source(block: Block, raw: String) -> Self {
            Self {
                block,
                raw: Some(raw),
            }
        }

        /// Marks the block as modified, clearing stored raw text.
        pub fn mark_dirty(&mut self) {
            self.raw = None;
        }
    }

    /// Ordered key/value drawer; keys compare case-insensitively like Org does.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
    pub struct PropertyDrawer {
        pub props: IndexMap<String, String>,
    }

    impl PropertyDrawer {
        pub fn get(&self, key: &str) -> Option<&str> {
            self.props
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str())
        }

        /// Returns whether anything changed.
        pub fn set(&mut self, key: &str, value: &str) -> bool {
            if let Some((_, existing)) = self
                .props
                .iter_mut()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
            {
                if existing == value {
                    return false;
                }
                *existing = value.to_string();
                return true;
            }
            self.props.insert(key.to_string(), value.to_string());
            true
        }

        /// Returns whether anything changed.
        pub fn remove(&mut self, key: &str) -> bool {
            match self.props.keys().position(|k| k.eq_ignore_ascii_case(key)) {
                Some(idx) => self.props.shift_remove_index(idx).is_some(),
                None => false,
            }
        }

        pub fn is_empty(&self) -> bool {
            self.props.is_empty()
        }
    }

    /* ------------------------------ Addressing ------------------------------ */

    /// An item as the caller saw it: title plus the offset captured from some earlier parse.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ItemRef {
        pub title: String,
        pub offset: Option<usize>,
    }

    /// Logical key of a heading that survives reparsing: list, title, and which
    /// same-titled sibling it is.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ItemKey {
        pub section: String,
        pub title: String,
        pub occurrence: usize,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum Error {
        #[error("parse error at line {line}: {message}")]
        Parse { line: usize, message: String },
        #[error("could not {action} {}: {source}", path.display())]
        Storage {
            action: &'static str,
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("no list named {0:?}")]
        SectionNotFound(String),
        #[error("no item {title:?} in list {section:?}")]
        ItemNotFound { section: String, title: String },
        #[error("no list is active")]
        NoActiveSection,
        #[error("no list name given and none could be guessed")]
        NoSectionName,
        #[error("invalid configuration: {0}")]
        Configuration(String),
        #[error("could not parse configuration {}: {source}", path.display())]
        ConfigFormat {
            path: PathBuf,
            source: toml::de::Error,
        },
        #[error("invalid value: {0}")]
        InvalidValue(String),
    }

    pub type Result<T, E = Error> = std::result::Result<T, E>;

}

pub mod parser {
    //! Line-oriented Org parser built on `nom`.
    //!
    //! - The document is split into lines that keep their endings; every parsed part keeps
    //!   the exact lines it came from so unmodified parts print back byte for byte.
    //! - Headlines, planning lines, property lines and directives are parsed with `nom`.
    //! - The heading tree is stack-built by levels (`*`, `**`, ...).

    use crate::core::*;
    use indexmap::IndexMap;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till1, take_while, take_while1, take_while_m_n},
        character::complete::{anychar, char, digit1, space0, space1},
        combinator::{all_consuming, eof, map, map_opt, map_res, opt, rest, verify},
        error::{VerboseError, VerboseErrorKind},
        multi::fold_many1,
        sequence::{delimited, pair, preceded, separated_pair, terminated, tuple},
    };
    use std::path::PathBuf;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a document using the default `TODO | DONE` keywords.
    pub fn parse_document(input: &str) -> Result<Document> {
        parse_document_with(None, input, &TodoCycle::default())
    }

    /// Parse a document. `cycle` decides which words are todo keywords unless the
    /// file declares its own with `#+TODO:` lines.
    pub fn parse_document_with(
        path: Option<PathBuf>,
        input: &str,
        cycle: &TodoCycle,
    ) -> Result<Document> {
        let lines = split_lines(input);
        let mut cursor = 0;

        // 1) Preamble and file settings.
        let preamble = parse_preamble(&lines, &mut cursor)?;
        let mut doc = Document::new(path);
        doc.preamble = preamble.blocks;
        doc.settings.meta = preamble.meta;
        doc.settings.cycle = match preamble.sequences.last() {
            None => cycle.clone(),
            Some((line, _)) => {
                let line = *line;
                let sequences = preamble.sequences.into_iter().map(|(_, s)| s).collect();
                TodoCycle::new(sequences).map_err(|message| Error::Parse { line, message })?
            }
        };

        // 2) Headings (stack build).
        doc.headings = parse_headings_tree(&lines, &mut cursor, &doc.settings.cycle)?;
        Ok(doc)
    }

    /// Parse an effort estimate: `1:30`, `90`, `1h 30min`, `2d`, `1w`.
    pub fn parse_effort(input: &str) -> Result<Effort> {
        let invalid = || Error::InvalidValue(format!("unrecognized effort {input:?}"));
        let (_, minutes) = all_consuming(effort_minutes)(input.trim()).map_err(|_| invalid())?;
        u32::try_from(minutes).map(Effort::from_minutes).map_err(|_| invalid())
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn fail<'a, T>(i: &'a str, context: &'static str) -> PResult<'a, T> {
        Err(nom::Err::Error(VerboseError {
            errors: vec![(i, VerboseErrorKind::Context(context))],
        }))
    }

    /* ------------------------------- Lines ------------------------------- */

    #[derive(Debug, Clone, Copy)]
    struct Line<'a> {
        /// 1-based.
        number: usize,
        offset: usize,
        /// Including the line ending.
        raw: &'a str,
        /// Without the line ending.
        text: &'a str,
    }

    fn split_lines(input: &str) -> Vec<Line<'_>> {
        let mut out = Vec::new();
        let mut offset = 0;
        for (idx, raw) in input.split_inclusive('\n').enumerate() {
            let text = raw.strip_suffix('\n').unwrap_or(raw);
            let text = text.strip_suffix('\r').unwrap_or(text);
            out.push(Line {
                number: idx + 1,
                offset,
                raw,
                text,
            });
            offset += raw.len();
        }
        out
    }

    fn concat_raw(lines: &[Line<'_>]) -> String {
        lines.iter().map(|l| l.raw).collect()
    }

    fn is_heading_line(s: &str) -> bool {
        // Heading when line starts with one-or-more '*' then a space.
        let stars = s.chars().take_while(|c| *c == '*').count();
        stars >= 1 && s[stars..].starts_with(' ')
    }

    fn is_blank(s: &str) -> bool {
        s.trim().is_empty()
    }

    fn flush_paragraph(blocks: &mut Vec<BlockWithSource>, para: &mut Vec<Line<'_>>) {
        if para.is_empty() {
            return;
        }
        let text = para.iter().map(|l| l.text).collect::<Vec<_>>().join("\n");
        blocks.push(BlockWithSource::from_source(
            Block::Paragraph(text),
            concat_raw(para),
        ));
        para.clear();
    }

    /* --------------------------- Preamble block -------------------------- */

    struct Preamble {
        blocks: Vec<BlockWithSource>,
        sequences: Vec<(usize, TodoSequence)>,
        meta: IndexMap<String, String>,
    }

    /// Directives and free text up to the first heading.
    fn parse_preamble(lines: &[Line<'_>], cursor: &mut usize) -> Result<Preamble> {
        let mut out = Preamble {
            blocks: Vec::new(),
            sequences: Vec::new(),
            meta: IndexMap::new(),
        };
        let mut para = Vec::new();

        while let Some(line) = lines.get(*cursor) {
            if is_heading_line(line.text) {
                break;
            }
            *cursor += 1;

            if let Ok((_, (key, value))) = parse_hash_key_value(line.text) {
                flush_paragraph(&mut out.blocks, &mut para);
                let value = value.trim();
                match key.to_ascii_lowercase().as_str() {
                    "todo" | "seq_todo" | "typ_todo" => {
                        let words: Vec<&str> = value.split_whitespace().collect();
                        if !words.is_empty() {
                            let seq = TodoSequence::parse(&words).map_err(|message| {
                                Error::Parse {
                                    line: line.number,
                                    message,
                                }
                            })?;
                            out.sequences.push((line.number, seq));
                        }
                    }
                    other => {
                        out.meta.insert(other.to_string(), value.to_string());
                    }
                }
                out.blocks.push(BlockWithSource::from_source(
                    Block::Directive {
                        key: key.to_string(),
                        value: value.to_string(),
                    },
                    line.raw.to_string(),
                ));
                continue;
            }

            if is_blank(line.text) {
                flush_paragraph(&mut out.blocks, &mut para);
                out.blocks.push(BlockWithSource::from_source(
                    Block::Blank,
                    line.raw.to_string(),
                ));
            } else {
                para.push(*line);
            }
        }

        flush_paragraph(&mut out.blocks, &mut para);
        Ok(out)
    }

    fn parse_hash_key_value(i: &str) -> PResult<'_, (&str, &str)> {
        // #+key: value
        map(
            tuple((
                tag("#+"),
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
                tag(":"),
                space0,
                rest,
            )),
            |(_, key, _, _, val)| (key, val),
        )(i)
    }

    /* --------------------------- Headings section --------------------------- */

    fn parse_headings_tree(
        lines: &[Line<'_>],
        cursor: &mut usize,
        cycle: &TodoCycle,
    ) -> Result<Vec<Heading>> {
        let mut stack: Vec<Heading> = Vec::new();
        let mut roots: Vec<Heading> = Vec::new();

        while let Some(line) = lines.get(*cursor) {
            let mut node = headline_from_line(line, cycle)?;
            *cursor += 1;
            parse_heading_body(lines, cursor, &mut node)?;

            // Close every open heading at the same or a deeper level.
            while stack.last().is_some_and(|top| top.level >= node.level) {
                if let Some(completed) = stack.pop() {
                    attach(&mut stack, &mut roots, completed);
                }
            }
            stack.push(node);
        }

        while let Some(completed) = stack.pop() {
            attach(&mut stack, &mut roots, completed);
        }
        Ok(roots)
    }

    fn attach(stack: &mut [Heading], roots: &mut Vec<Heading>, completed: Heading) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(completed),
            None => roots.push(completed),
        }
    }

    fn headline_from_line(line: &Line<'_>, cycle: &TodoCycle) -> Result<Heading> {
        let malformed = |message: &str| Error::Parse {
            line: line.number,
            message: message.to_string(),
        };
        let (_, parts) = parse_headline(line.text, cycle).map_err(|_| malformed("malformed headline"))?;
        let level = u8::try_from(parts.level).map_err(|_| malformed("heading nested too deeply"))?;

        let mut h = Heading::new(level, parts.title);
        h.todo = parts.keyword.and_then(|k| cycle.keyword(k));
        h.priority = parts.priority.map(Priority);
        h.tags = parts.tags.into_iter().map(Tag::from).collect();
        h.offset = Some(line.offset);
        h.headline_raw = Some(line.raw.to_string());
        Ok(h)
    }

    /// Planning line, property drawer, then opaque blocks until the next heading.
    fn parse_heading_body(lines: &[Line<'_>], cursor: &mut usize, node: &mut Heading) -> Result<()> {
        if let Some(line) = lines.get(*cursor) {
            if let Ok((_, planning)) = parse_planning_line(line.text) {
                node.planning = planning;
                node.planning_raw = Some(line.raw.to_string());
                *cursor += 1;
            }
        }

        if let Some(line) = lines.get(*cursor) {
            if drawer_name(line.text).is_some_and(|n| n.eq_ignore_ascii_case("PROPERTIES")) {
                let (props, raw) = parse_properties_drawer(lines, cursor)?;
                node.properties = props;
                node.properties_raw = Some(raw);
            }
        }

        let mut para = Vec::new();
        while let Some(line) = lines.get(*cursor) {
            if is_heading_line(line.text) {
                break;
            }
            if let Some(name) = drawer_name(line.text) {
                if let Some(drawer) = parse_drawer(lines, cursor, name)? {
                    flush_paragraph(&mut node.section.blocks, &mut para);
                    node.section.blocks.push(drawer);
                    continue;
                }
            }
            *cursor += 1;
            if is_blank(line.text) {
                flush_paragraph(&mut node.section.blocks, &mut para);
                node.section.blocks.push(BlockWithSource::from_source(
                    Block::Blank,
                    line.raw.to_string(),
                ));
            } else {
                para.push(*line);
            }
        }
        flush_paragraph(&mut node.section.blocks, &mut para);
        Ok(())
    }

    #[derive(Debug, PartialEq, Eq)]
    struct Headline<'a> {
        level: usize,
        keyword: Option<&'a str>,
        priority: Option<char>,
        title: &'a str,
        tags: Vec<&'a str>,
    }

    /// Parse a single headline line (without its line ending).
    fn parse_headline<'a>(i: &'a str, cycle: &TodoCycle) -> PResult<'a, Headline<'a>> {
        let (i, stars) = take_while1(|c: char| c == '*')(i)?;
        let (i, _) = char(' ')(i)?;
        let (i, _) = space0(i)?;

        let (i, keyword) = opt(terminated(
            verify(take_till1(|c: char| c == ' ' || c == '\t'), |w: &str| {
                cycle.contains(w)
            }),
            alt((space1, eof)),
        ))(i)?;

        let (i, priority) = opt(terminated(
            delimited(
                tag("[#"),
                verify(anychar, |c: &char| c.is_ascii_alphanumeric()),
                char(']'),
            ),
            alt((space1, eof)),
        ))(i)?;

        let (title, tags) = split_tags(i);
        Ok((
            "",
            Headline {
                level: stars.len(),
                keyword,
                priority,
                title,
                tags,
            },
        ))
    }

    /// Split a trailing `:a:b:` group off the title.
    fn split_tags(s: &str) -> (&str, Vec<&str>) {
        let trimmed = s.trim_end();
        let (head, last) = match trimmed.rfind([' ', '\t']) {
            Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
            None => ("", trimmed),
        };
        if last.len() > 2 && last.starts_with(':') && last.ends_with(':') {
            let tags: Vec<&str> = last[1..last.len() - 1].split(':').collect();
            if tags.iter().all(|t| !t.is_empty() && t.chars().all(is_tag_char)) {
                return (head.trim_end(), tags);
            }
        }
        (trimmed, Vec::new())
    }

    /// Whether a synthesized headline would parse back to the same keyword, priority,
    /// title and tags.
    pub(crate) fn headline_survives(heading: &Heading, cycle: &TodoCycle) -> bool {
        let rendered = crate::format::render_headline(heading);
        let Ok((_, parts)) = parse_headline(rendered.trim_end_matches('\n'), cycle) else {
            return false;
        };
        parts.title == heading.title
            && parts.keyword == heading.todo.as_ref().map(|k| k.text.as_str())
            && parts.priority == heading.priority.map(|p| p.0)
            && parts.tags.len() == heading.tags.len()
            && parts.tags.iter().zip(&heading.tags).all(|(a, b)| *a == b.0)
    }

    /* --------------------------- Planning & Drawers --------------------------- */

    fn parse_planning_line(text: &str) -> PResult<'_, Planning> {
        // e.g.: CLOSED: [2025-11-15 Sat 14:10] SCHEDULED: <2025-11-15 Sat>
        let mut planning = Planning::default();
        let (mut i, _) = space0(text)?;
        if i.is_empty() {
            return fail(text, "planning-empty");
        }
        while !i.is_empty() {
            let (r, (keyword, ts)) = pair(
                alt((tag("SCHEDULED:"), tag("DEADLINE:"), tag("CLOSED:"))),
                preceded(space0, parse_timestamp),
            )(i)?;
            match keyword {
                "SCHEDULED:" => planning.scheduled = Some(ts),
                "DEADLINE:" => planning.deadline = Some(ts),
                _ => planning.closed = Some(ts),
            }
            let (r, _) = space0(r)?;
            i = r;
        }
        Ok((i, planning))
    }

    fn parse_timestamp(i: &str) -> PResult<'_, Timestamp> {
        // Active: <YYYY-MM-DD [Day] [HH:MM][suffix]>
        // Inactive: [YYYY-MM-DD [Day] [HH:MM][suffix]]
        let (i, open) = alt((char('<'), char('[')))(i)?;
        let close = if open == '<' { '>' } else { ']' };
        let (i, date) = parse_date(i)?;
        let (i, _weekday) = opt(preceded(
            space1,
            verify(
                take_till1(move |c: char| c == ' ' || c == close),
                |w: &str| w.chars().all(|c| c.is_alphabetic() || c == '.'),
            ),
        ))(i)?;
        let (i, time) = opt(preceded(space1, parse_time))(i)?;
        let (i, suffix) = opt(take_till1(move |c: char| c == close || c == '\n'))(i)?;
        let (i, _) = char(close)(i)?;
        Ok((
            i,
            Timestamp {
                active: open == '<',
                date,
                time,
                suffix: suffix.map(str::to_string),
            },
        ))
    }

    fn parse_date(i: &str) -> PResult<'_, chrono::NaiveDate> {
        map_opt(
            tuple((
                map_res(take_while_m_n(4, 4, |c: char| c.is_ascii_digit()), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_digit()), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_digit()), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| chrono::NaiveDate::from_ymd_opt(y, m, d),
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, chrono::NaiveTime> {
        map_opt(
            separated_pair(
                map_res(take_while_m_n(1, 2, |c: char| c.is_ascii_digit()), |s: &str| {
                    s.parse::<u32>()
                }),
                char(':'),
                map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_digit()), |s: &str| {
                    s.parse::<u32>()
                }),
            ),
            |(h, m)| chrono::NaiveTime::from_hms_opt(h, m, 0),
        )(i)
    }

    /// `:NAME:` alone on a line (`:END:` excluded).
    fn drawer_name(text: &str) -> Option<&str> {
        let parsed: PResult<'_, &str> = all_consuming(delimited(
            pair(space0, char(':')),
            take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-'),
            pair(char(':'), space0),
        ))(text);
        match parsed {
            Ok((_, name)) if !name.eq_ignore_ascii_case("END") => Some(name),
            _ => None,
        }
    }

    fn is_drawer_end(text: &str) -> bool {
        text.trim().eq_ignore_ascii_case(":END:")
    }

    fn parse_properties_drawer(
        lines: &[Line<'_>],
        cursor: &mut usize,
    ) -> Result<(PropertyDrawer, String)> {
        // :PROPERTIES:\n:KEY: value\n ... \n:END:
        let start = *cursor;
        let open = lines[start];
        let mut props = IndexMap::new();
        let mut idx = start + 1;
        loop {
            let Some(line) = lines.get(idx).filter(|l| !is_heading_line(l.text)) else {
                return Err(Error::Parse {
                    line: open.number,
                    message: "property drawer is never closed with :END:".into(),
                });
            };
            idx += 1;
            if is_drawer_end(line.text) {
                break;
            }
            let (_, (key, value)) = parse_property_line(line.text).map_err(|_| Error::Parse {
                line: line.number,
                message: format!("malformed property line {:?}", line.text),
            })?;
            props.insert(key.to_string(), value.trim().to_string());
        }
        *cursor = idx;
        Ok((PropertyDrawer { props }, concat_raw(&lines[start..idx])))
    }

    fn parse_property_line(i: &str) -> PResult<'_, (&str, &str)> {
        // :KEY: value  (value may be empty)
        all_consuming(map(
            tuple((
                space0,
                char(':'),
                take_while1(|c: char| !c.is_whitespace() && c != ':'),
                char(':'),
                alt((preceded(space1, rest), eof)),
            )),
            |(_, _, key, _, val)| (key, val),
        ))(i)
    }

    /// Drawers other than the property drawer. LOGBOOK must be closed; any other
    /// unclosed `:NAME:` line is ordinary text, as in Org.
    fn parse_drawer(
        lines: &[Line<'_>],
        cursor: &mut usize,
        name: &str,
    ) -> Result<Option<BlockWithSource>> {
        let start = *cursor;
        let mut idx = start + 1;
        while let Some(line) = lines.get(idx) {
            if is_heading_line(line.text) {
                break;
            }
            idx += 1;
            if is_drawer_end(line.text) {
                *cursor = idx;
                let drawer = Drawer {
                    name: name.to_string(),
                    lines: lines[start + 1..idx - 1]
                        .iter()
                        .map(|l| l.text.to_string())
                        .collect(),
                };
                return Ok(Some(BlockWithSource::from_source(
                    Block::Drawer(drawer),
                    concat_raw(&lines[start..idx]),
                )));
            }
        }
        if name.eq_ignore_ascii_case("LOGBOOK") || name.eq_ignore_ascii_case("PROPERTIES") {
            return Err(Error::Parse {
                line: lines[start].number,
                message: format!("drawer :{name}: is never closed with :END:"),
            });
        }
        Ok(None)
    }

    /* ------------------------------- Effort ------------------------------- */

    fn effort_minutes(i: &str) -> PResult<'_, u64> {
        alt((
            // H:MM
            map_opt(
                separated_pair(
                    map_res(digit1, |s: &str| s.parse::<u64>()),
                    char(':'),
                    map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_digit()), |s: &str| {
                        s.parse::<u64>()
                    }),
                ),
                |(h, m)| (m < 60).then(|| h.checked_mul(60)?.checked_add(m)).flatten(),
            ),
            // 1h 30min, 2d, 1w
            fold_many1(effort_unit, || 0u64, |acc, n| acc.saturating_add(n)),
            // bare minutes
            map_res(digit1, |s: &str| s.parse::<u64>()),
        ))(i)
    }

    fn effort_unit(i: &str) -> PResult<'_, u64> {
        let (i, _) = space0(i)?;
        let (i, n) = map_res(digit1, |s: &str| s.parse::<u64>())(i)?;
        let (i, _) = space0(i)?;
        let (i, unit) = alt((tag("min"), tag("h"), tag("d"), tag("w")))(i)?;
        let (i, _) = take_while(|c: char| c == ' ')(i)?;
        let factor = match unit {
            "min" => 1,
            "h" => 60,
            "d" => 60 * 24,
            _ => 60 * 24 * 7,
        };
        Ok((i, n.saturating_mul(factor)))
    }

}

pub mod format {
    use super::core::*;

    pub fn format_document(doc: &Document) -> String {
        let mut out = String::new();

        for block in &doc.preamble {
            append_block(&mut out, block);
        }

        for heading in &doc.headings {
            format_heading(&mut out, heading);
        }

        out
    }

    /// Print a single subtree, e.g. for display.
    pub fn format_heading_tree(heading: &Heading) -> String {
        let mut out = String::new();
        format_heading(&mut out, heading);
        out
    }

    /// Parts always start on a fresh line. Verbatim text only lacks its newline
    /// when it ended the input, so this never changes an unmodified print.
    fn push_part(out: &mut String, part: &str) {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(part);
    }

    fn append_block(out: &mut String, block: &BlockWithSource) {
        match &block.raw {
            Some(raw) => push_part(out, raw),
            None => push_part(out, &render_block(&block.block)),
        }
    }

    fn render_block(block: &Block) -> String {
        match block {
            Block::Blank => "\n".to_string(),
            Block::Paragraph(text) => format!("{text}\n"),
            Block::Directive { key, value } => format!("#+{key}: {value}\n"),
            Block::Drawer(drawer) => {
                let mut buf = format!(":{}:\n", drawer.name);
                for line in &drawer.lines {
                    buf.push_str(line);
                    buf.push('\n');
                }
                buf.push_str(":END:\n");
                buf
            }
        }
    }

    fn format_heading(out: &mut String, heading: &Heading) {
        match &heading.headline_raw {
            Some(raw) => push_part(out, raw),
            None => push_part(out, &render_headline(heading)),
        }

        if let Some(raw) = &heading.planning_raw {
            push_part(out, raw);
        } else if !heading.planning.is_empty() {
            push_part(out, &render_planning(&heading.planning));
        }

        if let Some(raw) = &heading.properties_raw {
            push_part(out, raw);
        } else if !heading.properties.is_empty() {
            push_part(out, &render_properties(&heading.properties));
        }

        for block in &heading.section.blocks {
            append_block(out, block);
        }

        for child in &heading.children {
            format_heading(out, child);
        }
    }

    pub(crate) fn render_headline(heading: &Heading) -> String {
        let mut buf = "*".repeat(usize::from(heading.level.max(1)));
        let mut words: Vec<String> = Vec::new();

        if let Some(todo) = &heading.todo {
            words.push(todo.text.clone());
        }
        if let Some(priority) = &heading.priority {
            words.push(format!("[#{}]", priority.0));
        }
        if !heading.title.is_empty() {
            words.push(heading.title.clone());
        }
        if !heading.tags.is_empty() {
            let tags: Vec<&str> = heading.tags.iter().map(|t| t.0.as_str()).collect();
            words.push(format!(":{}:", tags.join(":")));
        }

        buf.push(' ');
        buf.push_str(&words.join(" "));
        buf.push('\n');
        buf
    }

    fn render_planning(plan: &Planning) -> String {
        let mut parts = Vec::new();
        if let Some(ts) = &plan.closed {
            parts.push(format!("CLOSED: {}", render_timestamp(ts)));
        }
        if let Some(ts) = &plan.deadline {
            parts.push(format!("DEADLINE: {}", render_timestamp(ts)));
        }
        if let Some(ts) = &plan.scheduled {
            parts.push(format!("SCHEDULED: {}", render_timestamp(ts)));
        }
        let mut line = parts.join(" ");
        line.push('\n');
        line
    }

    fn render_properties(props: &PropertyDrawer) -> String {
        let mut buf = String::new();
        buf.push_str(":PROPERTIES:\n");
        for (k, v) in &props.props {
            buf.push(':');
            buf.push_str(k);
            buf.push(':');
            if !v.is_empty() {
                buf.push(' ');
                buf.push_str(v);
            }
            buf.push('\n');
        }
        buf.push_str(":END:\n");
        buf
    }

    pub(crate) fn render_timestamp(ts: &Timestamp) -> String {
        let mut buf = String::new();
        buf.push(if ts.active { '<' } else { '[' });
        buf.push_str(&ts.date.format("%Y-%m-%d %a").to_string());
        if let Some(time) = ts.time {
            buf.push(' ');
            buf.push_str(&time.format("%H:%M").to_string());
        }
        if let Some(suffix) = &ts.suffix {
            buf.push_str(suffix);
        }
        buf.push(if ts.active { '>' } else { ']' });
        buf
    }

}

pub mod index {
    //! Read-only queries over a parsed document. Nothing here mutates or caches.

    use crate::core::*;
    use serde::Serialize;

    /// A level-1 heading as seen by callers.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct SectionRef {
        pub name: String,
        pub tags: Vec<String>,
        pub offset: Option<usize>,
    }

    /// A todo-carrying direct child of a section.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ItemEntry {
        pub title: String,
        pub state: String,
        pub done: bool,
        pub priority: Option<char>,
        pub tags: Vec<String>,
        pub effort: Option<Effort>,
        pub offset: Option<usize>,
    }

    impl ItemEntry {
        fn from_heading(h: &Heading) -> Option<Self> {
            let todo = h.todo.as_ref()?;
            Some(Self {
                title: h.title.clone(),
                state: todo.text.clone(),
                done: todo.is_done,
                priority: h.priority.map(|p| p.0),
                tags: h.tags.iter().map(|t| t.0.clone()).collect(),
                effort: h.effort(),
                offset: h.offset,
            })
        }

        pub fn item_ref(&self) -> ItemRef {
            ItemRef {
                title: self.title.clone(),
                offset: self.offset,
            }
        }
    }

    pub fn section_names(doc: &Document) -> Vec<String> {
        doc.headings.iter().map(|h| h.title.clone()).collect()
    }

    pub fn sections(doc: &Document) -> Vec<SectionRef> {
        doc.headings.iter().map(section_ref).collect()
    }

    /// First level-1 heading whose title is exactly `name`.
    pub fn find_section(doc: &Document, name: &str) -> Option<SectionRef> {
        section_position(doc, name).map(|idx| section_ref(&doc.headings[idx]))
    }

    pub fn section_position(doc: &Document, name: &str) -> Option<usize> {
        doc.headings.iter().position(|h| h.title == name)
    }

    /// `None` when the section does not exist, an empty list when it has no items.
    pub fn list_items(doc: &Document, section: &str) -> Option<Vec<ItemEntry>> {
        let idx = section_position(doc, section)?;
        Some(
            doc.headings[idx]
                .children
                .iter()
                .filter_map(ItemEntry::from_heading)
                .collect(),
        )
    }

    /// Logical key for `parent.children[idx]`.
    pub fn item_key(section: &str, parent: &[Heading], idx: usize) -> ItemKey {
        let title = parent[idx].title.clone();
        let occurrence = parent[..idx].iter().filter(|h| h.title == title).count();
        ItemKey {
            section: section.to_string(),
            title,
            occurrence,
        }
    }

    /// Find a heading by key. An empty section name addresses top-level headings.
    pub fn locate<'a>(doc: &'a Document, key: &ItemKey) -> Option<&'a Heading> {
        let siblings = if key.section.is_empty() {
            &doc.headings
        } else {
            &doc.headings[section_position(doc, &key.section)?].children
        };
        siblings
            .iter()
            .filter(|h| h.title == key.title)
            .nth(key.occurrence)
    }

    /// 1-based line number of a byte offset.
    pub fn line_at(text: &str, offset: usize) -> usize {
        let end = offset.min(text.len());
        text.as_bytes()[..end].iter().filter(|b| **b == b'\n').count() + 1
    }

    fn section_ref(h: &Heading) -> SectionRef {
        SectionRef {
            name: h.title.clone(),
            tags: h.tags.iter().map(|t| t.0.clone()).collect(),
            offset: h.offset,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_document;

        const TEXT: &str = "\
* Home :house:
** TODO Buy milk
** note without keyword
** DONE [#A] Buy milk :shop:
:PROPERTIES:
:Effort: 0:30
:END:
* Empty
* Home
** TODO shadowed duplicate
";

        #[test]
        fn names_in_document_order() {
            let doc = parse_document(TEXT).unwrap();
            assert_eq!(section_names(&doc), vec!["Home", "Empty", "Home"]);
        }

        #[test]
        fn duplicate_names_resolve_to_the_first() {
            let doc = parse_document(TEXT).unwrap();
            let home = find_section(&doc, "Home").unwrap();
            assert_eq!(home.offset, Some(0));
            assert_eq!(home.tags, vec!["house"]);
            assert_eq!(list_items(&doc, "Home").unwrap().len(), 2);
        }

        #[test]
        fn missing_section_differs_from_empty_section() {
            let doc = parse_document(TEXT).unwrap();
            assert_eq!(list_items(&doc, "Empty"), Some(vec![]));
            assert_eq!(list_items(&doc, "Nope"), None);
            assert_eq!(find_section(&doc, "home"), None);
        }

        #[test]
        fn items_carry_state_priority_tags_effort_and_offset() {
            let doc = parse_document(TEXT).unwrap();
            let items = list_items(&doc, "Home").unwrap();
            let done = &items[1];
            assert_eq!(done.state, "DONE");
            assert!(done.done);
            assert_eq!(done.priority, Some('A'));
            assert_eq!(done.tags, vec!["shop"]);
            assert_eq!(done.effort, Some(Effort::from_minutes(30)));
            let offset = done.offset.unwrap();
            assert!(TEXT[offset..].starts_with("** DONE [#A] Buy milk"));
            assert_eq!(line_at(TEXT, offset), 4);
        }

        #[test]
        fn keys_distinguish_same_titled_siblings() {
            let doc = parse_document(TEXT).unwrap();
            let children = &doc.headings[0].children;
            let key = item_key("Home", children, 2);
            assert_eq!(key.occurrence, 1);
            let found = locate(&doc, &key).unwrap();
            assert_eq!(found.todo.as_ref().unwrap().text, "DONE");
            let top = ItemKey {
                section: String::new(),
                title: "Empty".into(),
                occurrence: 0,
            };
            assert_eq!(locate(&doc, &top).map(|h| h.level), Some(1));
        }
    }
}

pub mod storage {
    //! Whole-document persistence. A document is read and rewritten in full.

    use crate::core::{Error, Result};
    use log::debug;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::io::{self, Write};
    use std::path::{Path, PathBuf};
    use std::rc::Rc;
    use tempfile::NamedTempFile;

    pub trait DocumentStore {
        /// Path the document is known by (used for archive targets and reporting).
        fn location(&self) -> &Path;

        /// Full text; a document that does not exist yet reads as empty.
        fn load(&self) -> Result<String>;

        /// Replace the full text. Either the new text is stored or the old one stays.
        fn save(&self, text: &str) -> Result<()>;

        /// A store of the same kind for another document, e.g. an archive file.
        fn sibling(&self, location: PathBuf) -> Self
        where
            Self: Sized;
    }

    #[derive(Debug, Clone)]
    pub struct FileStore {
        path: PathBuf,
    }

    impl FileStore {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }
    }

    impl DocumentStore for FileStore {
        fn location(&self) -> &Path {
            &self.path
        }

        fn load(&self) -> Result<String> {
            match std::fs::read_to_string(&self.path) {
                Ok(text) => Ok(text),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
                Err(source) => Err(Error::Storage {
                    action: "read",
                    path: self.path.clone(),
                    source,
                }),
            }
        }

        fn save(&self, text: &str) -> Result<()> {
            atomic_write(&self.path, text.as_bytes()).map_err(|source| Error::Storage {
                action: "write",
                path: self.path.clone(),
                source,
            })?;
            debug!(
                "event=store_write module=storage status=ok path={} bytes={}",
                self.path.display(),
                text.len()
            );
            Ok(())
        }

        fn sibling(&self, location: PathBuf) -> Self {
            Self::new(location)
        }
    }

    /// Write to a temp file in the target directory, then rename over the target.
    pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content)?;
        tmp.flush()?;
        if let Ok(meta) = std::fs::metadata(path) {
            tmp.as_file().set_permissions(meta.permissions())?;
        }
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// In-memory documents keyed by location. Siblings share the same map, so an
    /// archive written through a sibling is visible to the store that created it.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryStore {
        location: PathBuf,
        docs: Rc<RefCell<HashMap<PathBuf, String>>>,
        writes: Rc<Cell<usize>>,
        fail_writes: Rc<Cell<bool>>,
    }

    impl MemoryStore {
        pub fn new(location: impl Into<PathBuf>, text: &str) -> Self {
            let store = Self {
                location: location.into(),
                ..Self::default()
            };
            store
                .docs
                .borrow_mut()
                .insert(store.location.clone(), text.to_string());
            store
        }

        /// Current text of this store's document.
        pub fn text(&self) -> String {
            self.text_of(&self.location)
        }

        pub fn text_of(&self, location: &Path) -> String {
            self.docs
                .borrow()
                .get(location)
                .cloned()
                .unwrap_or_default()
        }

        /// Number of successful saves through this store and its siblings.
        pub fn writes(&self) -> usize {
            self.writes.get()
        }

        /// Make every following save fail, as a full disk would.
        pub fn fail_writes(&self, fail: bool) {
            self.fail_writes.set(fail);
        }
    }

    impl DocumentStore for MemoryStore {
        fn location(&self) -> &Path {
            &self.location
        }

        fn load(&self) -> Result<String> {
            Ok(self.text())
        }

        fn save(&self, text: &str) -> Result<()> {
            if self.fail_writes.get() {
                return Err(Error::Storage {
                    action: "write",
                    path: self.location.clone(),
                    source: io::Error::other("writes disabled"),
                });
            }
            self.docs
                .borrow_mut()
                .insert(self.location.clone(), text.to_string());
            self.writes.set(self.writes.get() + 1);
            Ok(())
        }

        fn sibling(&self, location: PathBuf) -> Self {
            Self {
                location,
                ..self.clone()
            }
        }
    }

}

pub mod config {
    //! TOML configuration. Every key is optional; `Config::validate` turns the raw
    //! values into `Settings` and reports anything unusable as `Error::Configuration`.

    use crate::core::*;
    use indexmap::IndexSet;
    use serde::{Deserialize, Serialize};
    use std::path::{Path, PathBuf};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct Config {
        /// Outline document holding the lists. `~` is expanded.
        pub storage_path: PathBuf,
        /// Tags given to newly created lists.
        pub default_tags: Vec<String>,
        /// Offer a guessed list name (environment, enclosing repository) when selecting.
        pub guess_enabled: bool,
        /// Keywords in toggle order, Org syntax (`TODO NEXT | DONE`).
        pub todo_state_cycle: Vec<String>,
        /// `FILE::HEADING`; `%s` is the list file's name, an empty FILE the list file itself.
        pub archive_location: String,
        pub archive_save_context: bool,
        /// Stamp `CLOSED:` when an item enters a done state.
        pub log_done: bool,
        pub highest_priority: char,
        pub lowest_priority: char,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                storage_path: PathBuf::from("~/todo.org"),
                default_tags: Vec::new(),
                guess_enabled: true,
                todo_state_cycle: vec!["TODO".into(), "DONE".into()],
                archive_location: "%s_archive::".into(),
                archive_save_context: true,
                log_done: false,
                highest_priority: 'A',
                lowest_priority: 'C',
            }
        }
    }

    impl Config {
        pub fn load(path: &Path) -> Result<Self> {
            let text = std::fs::read_to_string(path).map_err(|source| Error::Storage {
                action: "read",
                path: path.to_path_buf(),
                source,
            })?;
            Self::parse(&text, path)
        }

        /// Like `load`, but a missing file yields the defaults.
        pub fn load_or_default(path: &Path) -> Result<Self> {
            if path.exists() {
                Self::load(path)
            } else {
                log::debug!(
                    "event=config_load module=config status=default path={}",
                    path.display()
                );
                Ok(Self::default())
            }
        }

        pub fn parse(text: &str, path: &Path) -> Result<Self> {
            toml::from_str(text).map_err(|source| Error::ConfigFormat {
                path: path.to_path_buf(),
                source,
            })
        }

        pub fn validate(&self) -> Result<Settings> {
            let bad = |msg: String| Error::Configuration(msg);

            if self.storage_path.as_os_str().is_empty() {
                return Err(bad("storage_path is empty".into()));
            }

            let sequence = TodoSequence::parse(self.todo_state_cycle.as_slice())
                .map_err(|e| bad(format!("todo_state_cycle: {e}")))?;
            let cycle = TodoCycle::new(vec![sequence])
                .map_err(|e| bad(format!("todo_state_cycle: {e}")))?;

            let default_tags = self
                .default_tags
                .iter()
                .map(|t| Tag::parse(t).map_err(|_| bad(format!("default_tags: malformed tag {t:?}"))))
                .collect::<Result<IndexSet<_>>>()?;

            let (high, low) = (self.highest_priority, self.lowest_priority);
            if !high.is_ascii_alphanumeric() || !low.is_ascii_alphanumeric() || high > low {
                return Err(bad(format!(
                    "priority range {high}..{low} must be ascending letters or digits"
                )));
            }

            let archive = ArchiveLocation::parse(&self.archive_location)?;

            Ok(Settings {
                storage_path: expand_home(&self.storage_path),
                default_tags,
                guess_enabled: self.guess_enabled,
                cycle,
                archive,
                archive_save_context: self.archive_save_context,
                log_done: self.log_done,
                highest_priority: Priority(high),
                lowest_priority: Priority(low),
            })
        }
    }

    /// Validated configuration.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Settings {
        pub storage_path: PathBuf,
        pub default_tags: IndexSet<Tag>,
        pub guess_enabled: bool,
        pub cycle: TodoCycle,
        pub archive: ArchiveLocation,
        pub archive_save_context: bool,
        pub log_done: bool,
        pub highest_priority: Priority,
        pub lowest_priority: Priority,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                storage_path: expand_home(Path::new("~/todo.org")),
                default_tags: IndexSet::new(),
                guess_enabled: true,
                cycle: TodoCycle::default(),
                archive: ArchiveLocation {
                    file: Some("%s_archive".into()),
                    heading: None,
                },
                archive_save_context: true,
                log_done: false,
                highest_priority: Priority('A'),
                lowest_priority: Priority('C'),
            }
        }
    }

    impl Settings {
        pub fn check_priority(&self, priority: Priority) -> Result<()> {
            if (self.highest_priority..=self.lowest_priority).contains(&priority) {
                Ok(())
            } else {
                Err(Error::InvalidValue(format!(
                    "priority {priority} is outside {}..{}",
                    self.highest_priority, self.lowest_priority
                )))
            }
        }
    }

    /// Org `archive-location`: `FILE::HEADING`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ArchiveLocation {
        /// `None` archives into the list file itself.
        pub file: Option<String>,
        /// `None` archives as top-level headings.
        pub heading: Option<String>,
    }

    impl ArchiveLocation {
        pub fn parse(raw: &str) -> Result<Self> {
            let (file, heading) = raw.rsplit_once("::").ok_or_else(|| {
                Error::Configuration(format!("archive_location {raw:?} lacks `::`"))
            })?;
            let file = file.trim();
            let heading = heading.trim().trim_start_matches('*').trim();
            if heading.contains('\n') {
                return Err(Error::Configuration(
                    "archive_location heading spans lines".into(),
                ));
            }
            Ok(Self {
                file: (!file.is_empty()).then(|| file.to_string()),
                heading: (!heading.is_empty()).then(|| heading.to_string()),
            })
        }

        /// Archive file for a list file, or `None` when archiving in place.
        pub fn file_for(&self, origin: &Path) -> Option<PathBuf> {
            let pattern = self.file.as_deref()?;
            let name = origin
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let path = expand_home(Path::new(&pattern.replace("%s", &name)));
            let path = match origin.parent() {
                Some(dir) if path.is_relative() => dir.join(path),
                _ => path,
            };
            (path != origin).then_some(path)
        }

        pub fn heading_for(&self, origin: &Path) -> Option<String> {
            let name = origin
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.heading.as_ref().map(|h| h.replace("%s", &name))
        }
    }

    /// Expand a leading `~` to `$HOME`.
    pub fn expand_home(path: &Path) -> PathBuf {
        let Ok(rest) = path.strip_prefix("~") else {
            return path.to_path_buf();
        };
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn parse(text: &str) -> Result<Config> {
            Config::parse(text, Path::new("config.toml"))
        }

        #[test]
        fn empty_file_gives_defaults() {
            let settings = parse("").unwrap().validate().unwrap();
            assert_eq!(settings.cycle, TodoCycle::default());
            assert!(settings.guess_enabled);
            assert!(settings.default_tags.is_empty());
            assert_eq!(settings.archive.file.as_deref(), Some("%s_archive"));
            assert_eq!(settings.archive.heading, None);
            assert_eq!(settings, Settings::default());
        }

        #[test]
        fn full_config() {
            let config = parse(
                r#"
storage_path = "/srv/lists/todo.org"
default_tags = ["project", ":work:"]
guess_enabled = false
todo_state_cycle = ["TODO", "NEXT", "|", "DONE", "CANCELLED"]
archive_location = "::* Archive"
log_done = true
highest_priority = "A"
lowest_priority = "E"
"#,
            )
            .unwrap();
            let settings = config.validate().unwrap();
            assert_eq!(settings.storage_path, PathBuf::from("/srv/lists/todo.org"));
            let tags: Vec<_> = settings.default_tags.iter().map(|t| t.0.as_str()).collect();
            assert_eq!(tags, vec!["project", "work"]);
            assert!(settings.cycle.keyword("CANCELLED").unwrap().is_done);
            assert!(!settings.cycle.keyword("NEXT").unwrap().is_done);
            assert_eq!(settings.archive.file, None);
            assert_eq!(settings.archive.heading.as_deref(), Some("Archive"));
            assert!(settings.check_priority(Priority('E')).is_ok());
            assert!(settings.check_priority(Priority('F')).is_err());
        }

        #[test]
        fn invalid_values_are_configuration_errors() {
            for text in [
                r#"todo_state_cycle = []"#,
                r#"todo_state_cycle = ["TODO", "TODO"]"#,
                r#"todo_state_cycle = ["A", "|", "B", "|", "C"]"#,
                r#"default_tags = ["two words"]"#,
                r#"highest_priority = "C"
lowest_priority = "A""#,
                r#"archive_location = "no separator""#,
            ] {
                let result = parse(text).unwrap().validate();
                assert!(
                    matches!(result, Err(Error::Configuration(_))),
                    "{text}: {result:?}"
                );
            }
        }

        #[test]
        fn syntax_errors_and_unknown_keys_name_the_file() {
            assert!(matches!(parse("storage_path = "), Err(Error::ConfigFormat { .. })));
            assert!(matches!(parse("colour = 1"), Err(Error::ConfigFormat { .. })));
        }

        #[test]
        fn archive_file_is_relative_to_the_list_file() {
            let loc = ArchiveLocation::parse("%s_archive::* Done %s").unwrap();
            let origin = Path::new("/home/me/todo.org");
            assert_eq!(
                loc.file_for(origin),
                Some(PathBuf::from("/home/me/todo.org_archive"))
            );
            assert_eq!(loc.heading_for(origin).as_deref(), Some("Done todo.org"));
            let same = ArchiveLocation::parse("todo.org::").unwrap();
            assert_eq!(same.file_for(origin), None);
        }

        #[test]
        fn home_expansion_only_touches_a_leading_tilde() {
            assert_eq!(expand_home(Path::new("/a/~b")), PathBuf::from("/a/~b"));
            if let Some(home) = std::env::var_os("HOME") {
                assert_eq!(
                    expand_home(Path::new("~/todo.org")),
                    PathBuf::from(home).join("todo.org")
                );
            }
        }
    }
}

pub mod session {
    //! Caller-side state and the seams to the user interface.

    use crate::core::Result;
    use std::fmt;

    /// The list the user is working in. Only the name survives between
    /// transactions; positions are always looked up again.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct Session {
        active_section: Option<String>,
    }

    impl Session {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_section(name: impl Into<String>) -> Self {
            Self {
                active_section: Some(name.into()),
            }
        }

        pub fn active_section(&self) -> Option<&str> {
            self.active_section.as_deref()
        }

        pub fn select(&mut self, name: impl Into<String>) {
            self.active_section = Some(name.into());
        }

        pub fn clear(&mut self) {
            self.active_section = None;
        }
    }

    type Guesser = Box<dyn Fn() -> Option<String>>;

    /// Ordered providers of a default list name; the first non-empty answer wins.
    #[derive(Default)]
    pub struct NameGuessers {
        providers: Vec<(&'static str, Guesser)>,
    }

    impl NameGuessers {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, label: &'static str, provider: impl Fn() -> Option<String> + 'static) -> Self {
            self.providers.push((label, Box::new(provider)));
            self
        }

        pub fn guess(&self) -> Option<String> {
            self.providers.iter().find_map(|(label, provider)| {
                let name = provider()?.trim().to_string();
                if name.is_empty() {
                    return None;
                }
                log::debug!("event=name_guess module=session status=ok provider={label} name={name}");
                Some(name)
            })
        }
    }

    impl fmt::Debug for NameGuessers {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_list()
                .entries(self.providers.iter().map(|(label, _)| label))
                .finish()
        }
    }

    /// What a selector returns: one of the offered candidates, or free text.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Choice<T> {
        Existing(T),
        Typed(String),
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Candidate<T> {
        pub label: String,
        pub value: T,
    }

    /// Interactive picker (completion UI, numbered prompt, ...).
    pub trait Selector {
        /// `default` is offered when the user enters nothing.
        fn choose<T: Clone>(
            &mut self,
            prompt: &str,
            candidates: &[Candidate<T>],
            default: Option<&str>,
        ) -> Result<Choice<T>>;
    }

}

pub mod resolver {
    //! Find-or-create for lists.

    use crate::core::*;
    use crate::engine::TodoFile;
    use crate::index::{self, SectionRef};
    use crate::parser::headline_survives;
    use crate::storage::DocumentStore;
    use indexmap::IndexSet;
    use log::info;

    /// Return the list named `name`, appending and saving it first if it is missing.
    /// A present list is returned without writing anything.
    pub fn resolve_or_create<S: DocumentStore>(file: &TodoFile<S>, name: &str) -> Result<SectionRef> {
        let doc = file.load()?;
        let name = checked_title(name, None, doc.cycle())?;
        if let Some(found) = index::find_section(&doc, &name) {
            return Ok(found);
        }

        let tags = file.settings().default_tags.clone();
        let commit = file.transact(|doc| {
            ensure_section(doc, &name, &tags);
            Ok(())
        })?;
        info!(
            "event=section_create module=resolver status=ok name={name} written={}",
            commit.written
        );
        index::find_section(&commit.document, &name).ok_or(Error::SectionNotFound(name))
    }

    /// Position of the list `name`, appended with `tags` when missing.
    pub fn ensure_section(doc: &mut Document, name: &str, tags: &IndexSet<Tag>) -> usize {
        if let Some(idx) = index::section_position(doc, name) {
            return idx;
        }
        let mut heading = Heading::new(1, name);
        heading.tags = tags.clone();
        doc.headings.push(heading);
        doc.headings.len() - 1
    }

    /// Trim a user-supplied list or item title and make sure it reads back the same
    /// after printing: one line, not empty, no trailing `:tag:` group, no leading
    /// keyword or priority cookie that the parser would take away.
    pub fn checked_title(raw: &str, todo: Option<TodoKeyword>, cycle: &TodoCycle) -> Result<String> {
        let title = raw.trim();
        if title.is_empty() {
            return Err(Error::InvalidValue("title is empty".into()));
        }
        if title.contains(['\n', '\r']) {
            return Err(Error::InvalidValue(format!("title {title:?} spans lines")));
        }
        let mut probe = Heading::new(1, title);
        probe.todo = todo;
        if !headline_survives(&probe, cycle) {
            return Err(Error::InvalidValue(format!(
                "title {title:?} would not read back as written"
            )));
        }
        Ok(title.to_string())
    }

}

pub mod engine {
    //! Mutation engine. Every operation is one transaction over the whole document:
    //! load, parse, change one thing, print, parse the printed text again, save if
    //! the text changed.

    use crate::config::Settings;
    use crate::core::*;
    use crate::format::format_document;
    use crate::index::{self, ItemEntry, SectionRef};
    use crate::parser::parse_document_with;
    use crate::resolver::{checked_title, ensure_section, resolve_or_create};
    use crate::session::{Candidate, Choice, NameGuessers, Selector, Session};
    use crate::storage::{DocumentStore, FileStore};
    use chrono::Local;
    use indexmap::IndexSet;
    use log::{debug, info};
    use serde::Serialize;
    use std::path::{Path, PathBuf};

    /// Result of a transaction.
    #[derive(Debug)]
    pub struct Commit<T> {
        pub value: T,
        /// The committed text, parsed again (fresh offsets).
        pub document: Document,
        pub text: String,
        /// False when the change left the text as it was.
        pub written: bool,
    }

    /// What an action applies to.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Target {
        /// An item listed earlier. The offset is only a hint; the title decides.
        Existing(ItemRef),
        /// Free text: the item with this title, created when there is none.
        Literal(String),
    }

    impl From<Choice<ItemRef>> for Target {
        fn from(choice: Choice<ItemRef>) -> Self {
            match choice {
                Choice::Existing(item) => Target::Existing(item),
                Choice::Typed(text) => Target::Literal(text),
            }
        }
    }

    impl From<ItemEntry> for Target {
        fn from(entry: ItemEntry) -> Self {
            Target::Existing(entry.item_ref())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Action {
        Insert,
        Visit,
        Toggle,
        SetPriority(Option<Priority>),
        SetTags(IndexSet<Tag>),
        SetEffort(Option<Effort>),
        SetProperty { key: String, value: Option<String> },
        Archive,
        Refile { to: String },
    }

    impl Action {
        pub fn name(&self) -> &'static str {
            match self {
                Action::Insert => "insert",
                Action::Visit => "visit",
                Action::Toggle => "toggle",
                Action::SetPriority(_) => "priority",
                Action::SetTags(_) => "tags",
                Action::SetEffort(_) => "effort",
                Action::SetProperty { .. } => "property",
                Action::Archive => "archive",
                Action::Refile { .. } => "refile",
            }
        }
    }

    /// Where an item ended up after an action, computed from the committed text.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ItemLocation {
        pub file: PathBuf,
        /// Empty when the item is a top-level heading (archived without a heading).
        pub section: String,
        pub title: String,
        pub offset: usize,
        /// 1-based.
        pub line: usize,
    }

    /// One outline document and the settings used to read and change it.
    #[derive(Debug)]
    pub struct TodoFile<S: DocumentStore = FileStore> {
        store: S,
        settings: Settings,
    }

    impl TodoFile<FileStore> {
        pub fn open(settings: Settings) -> Self {
            let store = FileStore::new(settings.storage_path.clone());
            Self { store, settings }
        }
    }

    impl<S: DocumentStore> TodoFile<S> {
        pub fn with_store(store: S, settings: Settings) -> Self {
            Self { store, settings }
        }

        pub fn settings(&self) -> &Settings {
            &self.settings
        }

        pub fn store(&self) -> &S {
            &self.store
        }

        pub fn load(&self) -> Result<Document> {
            load_from(&self.store, &self.settings.cycle)
        }

        pub fn transact<T>(&self, f: impl FnOnce(&mut Document) -> Result<T>) -> Result<Commit<T>> {
            transact_on(&self.store, &self.settings.cycle, f)
        }

        /* ---------------------------- Command surface ---------------------------- */

        pub fn list_sections(&self) -> Result<Vec<SectionRef>> {
            Ok(index::sections(&self.load()?))
        }

        /// Items of a list. A missing list is an error here and is never created.
        pub fn list_items(&self, section: &str) -> Result<Vec<ItemEntry>> {
            index::list_items(&self.load()?, section)
                .ok_or_else(|| Error::SectionNotFound(section.to_string()))
        }

        /// Make `hint` (or else the first guess) the active list, creating it if needed.
        pub fn select_or_create_section(
            &self,
            session: &mut Session,
            hint: Option<&str>,
            guessers: &NameGuessers,
        ) -> Result<SectionRef> {
            let name = hint
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .or_else(|| self.guess_name(guessers))
                .ok_or(Error::NoSectionName)?;
            let section = resolve_or_create(self, &name)?;
            session.select(section.name.clone());
            info!("event=section_select module=engine status=ok name={}", section.name);
            Ok(section)
        }

        /// Ask the selector for a list among the existing ones (or a new name).
        pub fn choose_section<Sel: Selector>(
            &self,
            session: &mut Session,
            selector: &mut Sel,
            guessers: &NameGuessers,
        ) -> Result<SectionRef> {
            let candidates: Vec<Candidate<String>> = self
                .list_sections()?
                .into_iter()
                .map(|s| Candidate {
                    label: s.name.clone(),
                    value: s.name,
                })
                .collect();
            let guess = self.guess_name(guessers);
            let name = match selector.choose("List", &candidates, guess.as_deref())? {
                Choice::Existing(name) | Choice::Typed(name) => name,
            };
            self.select_or_create_section(session, Some(&name), guessers)
        }

        /// Ask the selector for an item of the active list (or a new item's text).
        pub fn choose_item<Sel: Selector>(&self, session: &Session, selector: &mut Sel) -> Result<Target> {
            let section = session.active_section().ok_or(Error::NoActiveSection)?;
            let candidates: Vec<Candidate<ItemRef>> = self
                .list_items(section)?
                .into_iter()
                .map(|item| Candidate {
                    label: format!("{} {}", item.state, item.title),
                    value: item.item_ref(),
                })
                .collect();
            Ok(selector.choose("Item", &candidates, None)?.into())
        }

        /// Apply one action to one item of the active list.
        pub fn apply_action(&self, session: &Session, action: Action, target: Target) -> Result<ItemLocation> {
            let section = session.active_section().ok_or(Error::NoActiveSection)?;
            let kind = action.name();
            let location = match action {
                Action::Archive => self.archive(section, &target)?,
                Action::Refile { to } => self.refile(section, &target, &to)?,
                edit => {
                    let commit = self.transact(|doc| {
                        let (sidx, idx) = resolve_target(doc, section, &target, &self.settings)?;
                        let cycle = doc.cycle().clone();
                        apply_edit(&mut doc.headings[sidx].children[idx], edit, &self.settings, &cycle)?;
                        Ok(index::item_key(section, &doc.headings[sidx].children, idx))
                    })?;
                    locate_item(&commit, &commit.value, self.store.location())?
                }
            };
            info!(
                "event=action module=engine status=ok action={kind} section={section} title={} line={}",
                location.title, location.line
            );
            Ok(location)
        }

        /// Guessed list name, unless guessing is turned off.
        pub fn guess_name(&self, guessers: &NameGuessers) -> Option<String> {
            if self.settings.guess_enabled {
                guessers.guess()
            } else {
                None
            }
        }

        fn refile(&self, section: &str, target: &Target, to: &str) -> Result<ItemLocation> {
            let tags = self.settings.default_tags.clone();
            let commit = self.transact(|doc| {
                let to = checked_title(to, None, doc.cycle())?;
                let (sidx, idx) = resolve_target(doc, section, target, &self.settings)?;
                if to == section {
                    return Ok(index::item_key(section, &doc.headings[sidx].children, idx));
                }
                let mut subtree = doc.headings[sidx].children.remove(idx);
                subtree.detach();
                let tidx = ensure_section(doc, &to, &tags);
                let dest = &mut doc.headings[tidx];
                subtree.shift_level(i16::from(dest.level) + 1 - i16::from(subtree.level));
                dest.children.push(subtree);
                Ok(index::item_key(&to, &dest.children, dest.children.len() - 1))
            })?;
            locate_item(&commit, &commit.value, self.store.location())
        }

        fn archive(&self, section: &str, target: &Target) -> Result<ItemLocation> {
            let origin = self.store.location().to_path_buf();
            let archive_file = self.settings.archive.file_for(&origin);
            let heading = self.settings.archive.heading_for(&origin);

            let commit = self.transact(|doc| {
                let (sidx, idx) = resolve_target(doc, section, target, &self.settings)?;
                let category = doc
                    .settings
                    .meta
                    .get("category")
                    .cloned()
                    .or_else(|| origin.file_stem().map(|s| s.to_string_lossy().into_owned()))
                    .unwrap_or_default();
                let parent_tags = doc.headings[sidx]
                    .tags
                    .iter()
                    .map(|t| t.0.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                let mut subtree = doc.headings[sidx].children.remove(idx);
                subtree.detach();
                if self.settings.archive_save_context {
                    save_context(&mut subtree, &origin, section, &category, &parent_tags);
                }

                let Some(path) = &archive_file else {
                    return Ok(Placed::Here(place_archived(doc, heading.as_deref(), subtree)));
                };
                // The archive file is saved before the list file: a failure in between
                // leaves the item in both files, never in neither.
                let sibling = self.store.sibling(path.clone());
                let archived = transact_on(&sibling, &self.settings.cycle, |adoc| {
                    if adoc.headings.is_empty() && adoc.preamble.is_empty() {
                        adoc.preamble = archive_header(&origin);
                    }
                    Ok(place_archived(adoc, heading.as_deref(), subtree))
                })?;
                locate_item(&archived, &archived.value, path).map(Placed::Elsewhere)
            })?;

            match &commit.value {
                Placed::Elsewhere(location) => Ok(location.clone()),
                Placed::Here(key) => locate_item(&commit, key, &origin),
            }
        }
    }

    enum Placed {
        Here(ItemKey),
        Elsewhere(ItemLocation),
    }

    fn load_from<S: DocumentStore>(store: &S, cycle: &TodoCycle) -> Result<Document> {
        let text = store.load()?;
        parse_document_with(Some(store.location().to_path_buf()), &text, cycle)
    }

    /// Load, mutate, print, verify by parsing the printed text, save when changed.
    /// Nothing is saved when `f` or the verification fails.
    pub fn transact_on<S: DocumentStore, T>(
        store: &S,
        cycle: &TodoCycle,
        f: impl FnOnce(&mut Document) -> Result<T>,
    ) -> Result<Commit<T>> {
        let path = store.location().to_path_buf();
        let before = store.load()?;
        let mut doc = parse_document_with(Some(path.clone()), &before, cycle)?;
        let value = f(&mut doc)?;
        let text = format_document(&doc);
        let document = parse_document_with(Some(path.clone()), &text, cycle)?;
        let written = text != before;
        if written {
            store.save(&text)?;
        }
        debug!(
            "event=transaction module=engine status=ok path={} written={written} bytes={}",
            path.display(),
            text.len()
        );
        Ok(Commit {
            value,
            document,
            text,
            written,
        })
    }

    fn locate_item<T>(commit: &Commit<T>, key: &ItemKey, file: &Path) -> Result<ItemLocation> {
        let not_found = || Error::ItemNotFound {
            section: key.section.clone(),
            title: key.title.clone(),
        };
        let heading = index::locate(&commit.document, key).ok_or_else(not_found)?;
        let offset = heading.offset.ok_or_else(not_found)?;
        Ok(ItemLocation {
            file: file.to_path_buf(),
            section: key.section.clone(),
            title: heading.title.clone(),
            offset,
            line: index::line_at(&commit.text, offset),
        })
    }

    /// Position `(section, child)` of the target inside `doc`, creating the list
    /// and item for literal targets when they are missing.
    fn resolve_target(
        doc: &mut Document,
        section: &str,
        target: &Target,
        settings: &Settings,
    ) -> Result<(usize, usize)> {
        let sidx = match (index::section_position(doc, section), target) {
            (Some(sidx), _) => sidx,
            (None, Target::Existing(_)) => return Err(Error::SectionNotFound(section.to_string())),
            (None, Target::Literal(_)) => {
                let name = checked_title(section, None, doc.cycle())?;
                ensure_section(doc, &name, &settings.default_tags)
            }
        };

        match target {
            Target::Existing(item) => {
                // Captured offset first, then the first item with the title, then any
                // heading with the title (an item toggled back to no keyword).
                let children = &doc.headings[sidx].children;
                let by_offset = item.offset.and_then(|offset| {
                    children
                        .iter()
                        .position(|h| h.offset == Some(offset) && h.title == item.title)
                });
                by_offset
                    .or_else(|| {
                        children
                            .iter()
                            .position(|h| h.is_item() && h.title == item.title)
                    })
                    .or_else(|| children.iter().position(|h| h.title == item.title))
                    .map(|idx| (sidx, idx))
                    .ok_or_else(|| Error::ItemNotFound {
                        section: section.to_string(),
                        title: item.title.clone(),
                    })
            }
            Target::Literal(text) => {
                let text = text.trim();
                if text.is_empty() || text.contains(['\n', '\r']) {
                    return Err(Error::InvalidValue(format!("item text {text:?} is not one line")));
                }
                let children = &doc.headings[sidx].children;
                if let Some(idx) = children.iter().position(|h| h.is_item() && h.title == text) {
                    return Ok((sidx, idx));
                }
                let cycle = doc.cycle().clone();
                let title = checked_title(text, cycle.first(), &cycle)?;
                let parent = &mut doc.headings[sidx];
                let mut item = Heading::new(parent.level.saturating_add(1), title);
                item.todo = cycle.first();
                parent.children.push(item);
                debug!("event=item_insert module=engine status=ok section={section} title={text}");
                Ok((sidx, parent.children.len() - 1))
            }
        }
    }

    fn apply_edit(item: &mut Heading, action: Action, settings: &Settings, cycle: &TodoCycle) -> Result<()> {
        match action {
            Action::Insert | Action::Visit => {}
            Action::Toggle => {
                let was_done = item.todo.as_ref().is_some_and(|k| k.is_done);
                let next = cycle.next(item.todo.as_ref());
                let now_done = next.as_ref().is_some_and(|k| k.is_done);
                item.set_todo(next);
                if settings.log_done && now_done && !was_done {
                    item.set_closed(Some(Timestamp::inactive_now()));
                } else if settings.log_done && !now_done {
                    item.set_closed(None);
                }
            }
            Action::SetPriority(priority) => {
                if let Some(p) = priority {
                    settings.check_priority(p)?;
                }
                item.set_priority(priority);
            }
            Action::SetTags(tags) => {
                if let Some(bad) = tags.iter().find(|t| t.0.is_empty() || !t.0.chars().all(is_tag_char)) {
                    return Err(Error::InvalidValue(format!("malformed tag {:?}", bad.0)));
                }
                item.set_tags(tags);
            }
            Action::SetEffort(effort) => item.set_effort(effort),
            Action::SetProperty { key, value } => {
                let key = key.trim();
                if key.is_empty() || key.contains(|c: char| c.is_whitespace() || c == ':') {
                    return Err(Error::InvalidValue(format!("malformed property name {key:?}")));
                }
                // Drawer delimiters would end or reopen the drawer when printed.
                if key.eq_ignore_ascii_case("END") || key.eq_ignore_ascii_case("PROPERTIES") {
                    return Err(Error::InvalidValue(format!("reserved property name {key:?}")));
                }
                let value = value.as_deref().map(str::trim);
                if value.is_some_and(|v| v.contains(['\n', '\r'])) {
                    return Err(Error::InvalidValue("property value spans lines".into()));
                }
                item.set_property(key, value);
            }
            Action::Archive | Action::Refile { .. } => {
                return Err(Error::InvalidValue(format!("{} is not an in-place edit", action.name())));
            }
        }
        Ok(())
    }

    /// Org's archive context properties.
    fn save_context(item: &mut Heading, origin: &Path, section: &str, category: &str, parent_tags: &str) {
        let time = Local::now().format("%Y-%m-%d %a %H:%M").to_string();
        item.set_property("ARCHIVE_TIME", Some(&time));
        item.set_property("ARCHIVE_FILE", Some(&origin.display().to_string()));
        item.set_property("ARCHIVE_OLPATH", Some(section));
        item.set_property("ARCHIVE_CATEGORY", Some(category));
        if let Some(todo) = item.todo.clone() {
            item.set_property("ARCHIVE_TODO", Some(&todo.text));
        }
        if !parent_tags.is_empty() {
            item.set_property("ARCHIVE_ITAGS", Some(parent_tags));
        }
    }

    fn archive_header(origin: &Path) -> Vec<BlockWithSource> {
        vec![
            BlockWithSource::new(Block::Paragraph(format!(
                "Archived entries from file {}",
                origin.display()
            ))),
            BlockWithSource::new(Block::Blank),
        ]
    }

    /// Append an archived subtree under `heading` (created as needed), or at top level.
    fn place_archived(doc: &mut Document, heading: Option<&str>, mut subtree: Heading) -> ItemKey {
        match heading {
            Some(name) => {
                let idx = ensure_section(doc, name, &IndexSet::new());
                let parent = &mut doc.headings[idx];
                subtree.shift_level(i16::from(parent.level) + 1 - i16::from(subtree.level));
                parent.children.push(subtree);
                index::item_key(name, &parent.children, parent.children.len() - 1)
            }
            None => {
                subtree.shift_level(1 - i16::from(subtree.level));
                doc.headings.push(subtree);
                index::item_key("", &doc.headings, doc.headings.len() - 1)
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::config::ArchiveLocation;
        use crate::storage::MemoryStore;

        fn todo_file(text: &str) -> TodoFile<MemoryStore> {
            with_settings(text, Settings::default())
        }

        fn with_settings(text: &str, settings: Settings) -> TodoFile<MemoryStore> {
            TodoFile::with_store(MemoryStore::new("/lists/todo.org", text), settings)
        }

        fn home() -> Session {
            Session::with_section("Home")
        }

        fn lit(text: &str) -> Target {
            Target::Literal(text.into())
        }

        fn existing(file: &TodoFile<MemoryStore>, nth: usize) -> Target {
            file.list_items("Home").unwrap()[nth].clone().into()
        }

        #[test]
        fn insert_appends_under_the_list_and_reports_its_line() {
            let file = todo_file("* Home\n* Work\n");
            let loc = file.apply_action(&home(), Action::Insert, lit(" Paint ")).unwrap();
            assert_eq!(file.store().text(), "* Home\n** TODO Paint\n* Work\n");
            assert_eq!(loc.file, PathBuf::from("/lists/todo.org"));
            assert_eq!((loc.section.as_str(), loc.title.as_str()), ("Home", "Paint"));
            assert_eq!((loc.offset, loc.line), (7, 2));
        }

        #[test]
        fn inserting_an_existing_title_selects_it_without_writing() {
            let file = todo_file("* Home\n** TODO Paint\n");
            let loc = file.apply_action(&home(), Action::Insert, lit("Paint")).unwrap();
            assert_eq!(loc.line, 2);
            assert_eq!(file.store().writes(), 0);
        }

        #[test]
        fn literal_creates_a_missing_list_but_a_reference_does_not() {
            let file = todo_file("* Home\n");
            let work = Session::with_section("Work");
            file.apply_action(&work, Action::Insert, lit("Plan")).unwrap();
            assert_eq!(file.store().text(), "* Home\n* Work\n** TODO Plan\n");

            let stale = Target::Existing(ItemRef {
                title: "Plan".into(),
                offset: Some(14),
            });
            let err = file
                .apply_action(&Session::with_section("Gone"), Action::Toggle, stale)
                .unwrap_err();
            assert!(matches!(err, Error::SectionNotFound(name) if name == "Gone"));
            assert_eq!(file.store().writes(), 1);
        }

        #[test]
        fn toggle_walks_the_cycle_and_back() {
            let file = todo_file("* Home\n** TODO Paint\n");
            let paint = existing(&file, 0);
            file.apply_action(&home(), Action::Toggle, paint.clone()).unwrap();
            assert_eq!(file.store().text(), "* Home\n** DONE Paint\n");
            file.apply_action(&home(), Action::Toggle, paint.clone()).unwrap();
            assert_eq!(file.store().text(), "* Home\n** Paint\n");
            assert_eq!(file.list_items("Home").unwrap(), vec![]);
            file.apply_action(&home(), Action::Toggle, paint).unwrap();
            assert_eq!(file.store().text(), "* Home\n** TODO Paint\n");
        }

        #[test]
        fn log_done_stamps_and_clears_closed() {
            let settings = Settings {
                log_done: true,
                ..Settings::default()
            };
            let file = with_settings("* Home\n** TODO Paint\n* Work\n", settings);
            file.apply_action(&home(), Action::Toggle, lit("Paint")).unwrap();
            let text = file.store().text();
            let lines: Vec<&str> = text.lines().collect();
            assert_eq!(lines[1], "** DONE Paint");
            assert!(lines[2].starts_with("CLOSED: ["), "{text}");
            assert_eq!(lines[3], "* Work");

            file.apply_action(&home(), Action::Toggle, existing(&file, 0)).unwrap();
            assert_eq!(file.store().text(), "* Home\n** Paint\n* Work\n");
        }

        #[test]
        fn file_keywords_drive_toggle_and_insert() {
            let file = todo_file("#+TODO: NEXT WAIT | DONE\n* Home\n** NEXT Call\n");
            file.apply_action(&home(), Action::Toggle, lit("Call")).unwrap();
            file.apply_action(&home(), Action::Insert, lit("Email")).unwrap();
            assert_eq!(
                file.store().text(),
                "#+TODO: NEXT WAIT | DONE\n* Home\n** WAIT Call\n** NEXT Email\n"
            );
        }

        #[test]
        fn captured_offsets_are_verified_against_the_title() {
            let file = todo_file("* Home\n** TODO Paint\n** TODO Sweep\n");
            let sweep = existing(&file, 1);
            file.store()
                .save("* Home\n** TODO Dust\n** TODO Paint\n** TODO Sweep\n")
                .unwrap();
            let loc = file.apply_action(&home(), Action::Toggle, sweep).unwrap();
            assert_eq!(loc.line, 4);
            assert!(file.store().text().ends_with("** DONE Sweep\n"));
        }

        #[test]
        fn offsets_pick_between_same_titled_items() {
            let file = todo_file("* Home\n** TODO Paint\n** TODO Paint\n");
            let second = existing(&file, 1);
            let loc = file.apply_action(&home(), Action::Toggle, second).unwrap();
            assert_eq!(file.store().text(), "* Home\n** TODO Paint\n** DONE Paint\n");
            assert_eq!(loc.line, 3);
        }

        #[test]
        fn unknown_items_and_lists_are_not_found_without_writing() {
            let file = todo_file("* Home\n** TODO Paint\n");
            let ghost = Target::Existing(ItemRef {
                title: "Ghost".into(),
                offset: Some(7),
            });
            assert!(matches!(
                file.apply_action(&home(), Action::Toggle, ghost),
                Err(Error::ItemNotFound { .. })
            ));
            assert!(matches!(file.list_items("Nope"), Err(Error::SectionNotFound(_))));
            assert!(matches!(
                file.apply_action(&Session::new(), Action::Toggle, lit("Paint")),
                Err(Error::NoActiveSection)
            ));
            assert_eq!(file.store().writes(), 0);
            assert_eq!(file.list_sections().unwrap().len(), 1);
        }

        #[test]
        fn priority_tags_effort_and_properties() {
            let file = todo_file("* Home\n** TODO Paint\n");
            let paint = || lit("Paint");
            file.apply_action(&home(), Action::SetPriority(Some(Priority('B'))), paint())
                .unwrap();
            let tags = ["diy", "weekend"].into_iter().map(Tag::from).collect();
            file.apply_action(&home(), Action::SetTags(tags), paint()).unwrap();
            file.apply_action(&home(), Action::SetEffort(Some(Effort::from_minutes(90))), paint())
                .unwrap();
            let room = Action::SetProperty {
                key: "ROOM".into(),
                value: Some("kitchen".into()),
            };
            file.apply_action(&home(), room, paint()).unwrap();
            assert_eq!(
                file.store().text(),
                "* Home\n** TODO [#B] Paint :diy:weekend:\n:PROPERTIES:\n:Effort: 1:30\n:ROOM: kitchen\n:END:\n"
            );
            let item = &file.list_items("Home").unwrap()[0];
            assert_eq!(item.effort, Some(Effort::from_minutes(90)));

            file.apply_action(&home(), Action::SetEffort(None), paint()).unwrap();
            let unset = Action::SetProperty {
                key: "room".into(),
                value: None,
            };
            file.apply_action(&home(), unset, paint()).unwrap();
            file.apply_action(&home(), Action::SetPriority(None), paint()).unwrap();
            assert_eq!(file.store().text(), "* Home\n** TODO Paint :diy:weekend:\n");
        }

        #[test]
        fn invalid_edits_leave_the_document_alone() {
            let file = todo_file("* Home\n** TODO Paint\n");
            let bad_tags = [Tag("two words".into())].into_iter().collect();
            let bad_key = Action::SetProperty {
                key: "my key".into(),
                value: Some("x".into()),
            };
            for action in [
                Action::SetPriority(Some(Priority('Z'))),
                Action::SetTags(bad_tags),
                bad_key,
            ] {
                let result = file.apply_action(&home(), action, lit("Paint"));
                assert!(matches!(result, Err(Error::InvalidValue(_))), "{result:?}");
            }
            for text in ["", "Paint :tag:", "two\nlines"] {
                assert!(file.apply_action(&home(), Action::Insert, lit(text)).is_err());
            }
            assert_eq!(file.store().writes(), 0);
        }

        #[test]
        fn drawer_delimiters_are_not_property_names() {
            let file = todo_file("* Home\n** TODO Paint\n");
            for key in ["END", "end", "Properties"] {
                let action = Action::SetProperty {
                    key: key.into(),
                    value: Some(String::new()),
                };
                let result = file.apply_action(&home(), action, lit("Paint"));
                assert!(matches!(result, Err(Error::InvalidValue(_))), "{key}: {result:?}");
            }
            assert_eq!(file.store().text(), "* Home\n** TODO Paint\n");
            assert_eq!(file.store().writes(), 0);
        }

        #[test]
        fn archive_under_a_heading_in_the_same_file() {
            let settings = Settings {
                archive: ArchiveLocation::parse("::* Archive").unwrap(),
                archive_save_context: false,
                ..Settings::default()
            };
            let file = with_settings("* Home :house:\n** DONE Paint\nnotes\n** TODO Sweep\n", settings);
            let loc = file.apply_action(&home(), Action::Archive, lit("Paint")).unwrap();
            assert_eq!(
                file.store().text(),
                "* Home :house:\n** TODO Sweep\n* Archive\n** DONE Paint\nnotes\n"
            );
            assert_eq!((loc.section.as_str(), loc.line), ("Archive", 4));
            let titles: Vec<_> = file.list_items("Home").unwrap().into_iter().map(|i| i.title).collect();
            assert_eq!(titles, vec!["Sweep"]);
        }

        #[test]
        fn archive_to_sibling_file_keeps_context() {
            let file = todo_file("#+CATEGORY: chores\n* Home :house:\n** DONE Paint\n");
            let loc = file.apply_action(&home(), Action::Archive, lit("Paint")).unwrap();
            assert_eq!(file.store().text(), "#+CATEGORY: chores\n* Home :house:\n");

            let archive = file.store().text_of(Path::new("/lists/todo.org_archive"));
            assert!(
                archive.starts_with(
                    "Archived entries from file /lists/todo.org\n\n* DONE Paint\n:PROPERTIES:\n:ARCHIVE_TIME: "
                ),
                "{archive}"
            );
            assert!(archive.ends_with(
                ":ARCHIVE_FILE: /lists/todo.org\n:ARCHIVE_OLPATH: Home\n:ARCHIVE_CATEGORY: chores\n:ARCHIVE_TODO: DONE\n:ARCHIVE_ITAGS: house\n:END:\n"
            ));
            assert_eq!(loc.file, PathBuf::from("/lists/todo.org_archive"));
            assert_eq!((loc.section.as_str(), loc.line), ("", 3));
            assert_eq!(file.store().writes(), 2);
        }

        #[test]
        fn failed_archive_write_changes_nothing() {
            let file = todo_file("* Home\n** DONE Paint\n");
            file.store().fail_writes(true);
            let result = file.apply_action(&home(), Action::Archive, lit("Paint"));
            assert!(matches!(result, Err(Error::Storage { .. })));
            assert_eq!(file.store().text(), "* Home\n** DONE Paint\n");
            assert_eq!(file.store().text_of(Path::new("/lists/todo.org_archive")), "");
        }

        #[test]
        fn refile_moves_the_subtree_verbatim() {
            let file = todo_file("* Home\n** TODO [#A] Paint   :diy:\n*** step one\n* Work\n** TODO Other\n");
            let refile = Action::Refile { to: "Work".into() };
            let loc = file.apply_action(&home(), refile, existing(&file, 0)).unwrap();
            assert_eq!(
                file.store().text(),
                "* Home\n* Work\n** TODO Other\n** TODO [#A] Paint   :diy:\n*** step one\n"
            );
            assert_eq!((loc.section.as_str(), loc.line), ("Work", 4));
            let moved = &file.list_items("Work").unwrap()[1];
            assert_eq!(moved.priority, Some('A'));
            assert_eq!(moved.tags, vec!["diy"]);
        }

        #[test]
        fn refile_creates_the_destination_and_ignores_the_current_list() {
            let file = todo_file("* Home\n** TODO Paint\n");
            let same = Action::Refile { to: "Home".into() };
            file.apply_action(&home(), same, lit("Paint")).unwrap();
            assert_eq!(file.store().writes(), 0);
            let garage = Action::Refile { to: "Garage".into() };
            file.apply_action(&home(), garage, lit("Paint")).unwrap();
            assert_eq!(file.store().text(), "* Home\n* Garage\n** TODO Paint\n");
        }

        #[test]
        fn unchanged_transactions_do_not_write() {
            let file = todo_file("* Home  \r\n** TODO Paint");
            let commit = file.transact(|_| Ok(())).unwrap();
            assert!(!commit.written);
            assert_eq!(commit.text, "* Home  \r\n** TODO Paint");
            assert_eq!(file.store().writes(), 0);
        }

        #[test]
        fn select_uses_hint_then_guess() {
            let file = todo_file("* Home\n");
            let guessers = NameGuessers::new().with("fixed", || Some("orglist".into()));
            let mut session = Session::new();
            let home = file
                .select_or_create_section(&mut session, Some("Home"), &guessers)
                .unwrap();
            assert_eq!(home.offset, Some(0));
            let guessed = file.select_or_create_section(&mut session, None, &guessers).unwrap();
            assert_eq!(guessed.name, "orglist");
            assert_eq!(session.active_section(), Some("orglist"));
            assert_eq!(file.store().text(), "* Home\n* orglist\n");

            let quiet = with_settings(
                "",
                Settings {
                    guess_enabled: false,
                    ..Settings::default()
                },
            );
            assert!(matches!(
                quiet.select_or_create_section(&mut session, None, &guessers),
                Err(Error::NoSectionName)
            ));
        }

        struct Scripted(Option<usize>, &'static str);

        impl Selector for Scripted {
            fn choose<T: Clone>(
                &mut self,
                _prompt: &str,
                candidates: &[Candidate<T>],
                _default: Option<&str>,
            ) -> Result<Choice<T>> {
                Ok(match self.0 {
                    Some(idx) => Choice::Existing(candidates[idx].value.clone()),
                    None => Choice::Typed(self.1.to_string()),
                })
            }
        }

        #[test]
        fn selector_choices_map_onto_lists_and_targets() {
            let file = todo_file("* Home\n** TODO Paint\n** TODO Sweep\n* Work\n");
            let mut session = Session::new();
            let guessers = NameGuessers::new();
            let work = file
                .choose_section(&mut session, &mut Scripted(Some(1), ""), &guessers)
                .unwrap();
            assert_eq!(work.name, "Work");
            file.choose_section(&mut session, &mut Scripted(Some(0), ""), &guessers)
                .unwrap();

            let picked = file.choose_item(&session, &mut Scripted(Some(1), "")).unwrap();
            assert_eq!(
                picked,
                Target::Existing(ItemRef {
                    title: "Sweep".into(),
                    offset: Some(21),
                })
            );
            let typed = file.choose_item(&session, &mut Scripted(None, "Dust")).unwrap();
            assert_eq!(typed, lit("Dust"));
        }
    }
}

pub use crate::core::{Error, Result};
pub use engine::{Action, ItemLocation, Target, TodoFile};
pub use format::format_document;
pub use parser::{parse_document, parse_document_with};
