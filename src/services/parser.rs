// src/services/parser.rs

//! Content parser: turns a fetched HTML page into typed reference records.
//!
//! A page is scanned for headings (`h1`..`h6`, including MediaWiki's
//! `div.mw-heading` wrappers) whose text contains one of the configured
//! section indicators for the requested kind. The section body is every
//! following sibling up to the next heading of the same or a higher level;
//! deeper headings inside it become sub-sections.
//!
//! Lists, tables and definition lists in a section body yield one candidate
//! item each. Only structurally unreadable input is an error: a page without
//! matching sections parses to zero records and a warning, and a bad item is
//! skipped and reported in [`ParseOutcome::errors`].

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::error::{AppError, Result};
use crate::models::{
    DomainRecord, GenreRecord, MetaTagRecord, RecordKind, RecordMeta, SectionIndicators,
    TechniqueRecord,
};
use crate::services::vocabulary::{self, GenreFamily, TagCategory, TechniqueKind};
use crate::utils::normalize_whitespace;

const MAX_NAME_CHARS: usize = 100;
const MAX_CONTAINER_DEPTH: usize = 3;

/// Boilerplate headings never treated as sections.
const SKIPPED_HEADINGS: &[&str] = &[
    "contents",
    "references",
    "see also",
    "external links",
    "notes",
    "further reading",
    "navigation menu",
];

const SCENARIO_MARKERS: &[&str] = &[
    "when ",
    "use when",
    "use for",
    "use it",
    "use this",
    "best for",
    "ideal for",
    "great for",
    "useful for",
    "works well",
    "for ",
];

static GENRE_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>[^()]+?)\s*\((?P<desc>.+)\)\s*[.;,]?$").expect("valid regex")
});
static FOOTNOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(?:\d+|edit|citation needed)\]").expect("valid regex"));
static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\[\]]{1,40}\]").expect("valid regex"));

/// Result of parsing one page.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub records: Vec<DomainRecord>,
    /// Items that looked like records but could not be turned into one
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub sections_matched: usize,
}

/// Parses HTML pages into [`DomainRecord`]s.
#[derive(Debug, Clone, Default)]
pub struct ContentParser {
    indicators: SectionIndicators,
}

struct Selectors {
    headings: Selector,
    body_elements: Selector,
    rows: Selector,
    cells: Selector,
    code: Selector,
}

impl Selectors {
    fn new() -> Result<Self> {
        Ok(Self {
            headings: parse_selector("h1, h2, h3, h4, h5, h6")?,
            body_elements: parse_selector("body *")?,
            rows: parse_selector("tr")?,
            cells: parse_selector("td")?,
            code: parse_selector("code")?,
        })
    }
}

struct Section<'a> {
    heading: String,
    blocks: Vec<Block<'a>>,
}

struct Block<'a> {
    subheading: Option<String>,
    element: ElementRef<'a>,
}

#[derive(Debug, Default)]
struct RawItem {
    text: String,
    children: Vec<String>,
    examples: Vec<String>,
}

impl RawItem {
    fn text(text: String) -> Self {
        Self {
            text,
            ..Self::default()
        }
    }
}

impl ContentParser {
    pub fn new(indicators: SectionIndicators) -> Self {
        Self { indicators }
    }

    /// Parse `bytes` fetched from `source_url` into records of `kind`.
    pub fn parse(&self, bytes: &[u8], kind: RecordKind, source_url: &str) -> Result<ParseOutcome> {
        let text = decode(bytes, source_url)?;
        let document = Html::parse_document(&text);
        let selectors = Selectors::new()?;

        if document.select(&selectors.body_elements).next().is_none() {
            return Err(AppError::malformed(source_url, "document contains no markup"));
        }

        let sections = collect_sections(&document, &selectors, self.indicators.for_kind(kind));
        let mut outcome = ParseOutcome {
            sections_matched: sections.len(),
            ..ParseOutcome::default()
        };

        if sections.is_empty() {
            outcome
                .warnings
                .push(format!("no {kind} sections found in {source_url}"));
            return Ok(outcome);
        }

        let mut seen = HashSet::new();
        for section in &sections {
            let before = outcome.records.len();
            match kind {
                RecordKind::Genre => {
                    genres(section, &selectors, source_url, &mut outcome, &mut seen)
                }
                RecordKind::MetaTag => {
                    meta_tags(section, &selectors, source_url, &mut outcome, &mut seen)
                }
                RecordKind::Technique => {
                    techniques(section, &selectors, source_url, &mut outcome, &mut seen)
                }
            }
            if outcome.records.len() == before {
                outcome.warnings.push(format!(
                    "section '{}' produced no {kind} records",
                    section.heading
                ));
            }
        }

        log::debug!(
            "Parsed {} {} records from {} ({} sections, {} item errors)",
            outcome.records.len(),
            kind,
            source_url,
            outcome.sections_matched,
            outcome.errors.len()
        );
        Ok(outcome)
    }
}

fn parse_selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| AppError::selector(s, format!("{e:?}")))
}

fn decode(bytes: &[u8], source_url: &str) -> Result<String> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(AppError::malformed(source_url, "document is empty"));
    }

    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let lossy = String::from_utf8_lossy(bytes);
            let total = lossy.chars().count();
            let replaced = lossy
                .chars()
                .filter(|c| *c == char::REPLACEMENT_CHARACTER)
                .count();
            // tolerate a few stray bytes, reject binary
            if replaced * 20 > total {
                return Err(AppError::malformed(source_url, "document is not text"));
            }
            lossy.into_owned()
        }
    };

    if !text.contains('<') {
        return Err(AppError::malformed(source_url, "document contains no markup"));
    }
    Ok(text)
}

fn clean_text(raw: &str) -> String {
    normalize_whitespace(&FOOTNOTE.replace_all(raw, " "))
}

fn element_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<String>())
}

fn heading_level(element: &ElementRef<'_>) -> Option<u8> {
    match element.value().name() {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

fn is_heading_wrapper(element: &ElementRef<'_>) -> bool {
    element.value().name() == "div"
        && element
            .value()
            .classes()
            .any(|class| class.starts_with("mw-heading"))
}

/// The heading inside `element`, if `element` is one or wraps one.
fn as_heading(element: ElementRef<'_>) -> Option<(u8, ElementRef<'_>)> {
    if let Some(level) = heading_level(&element) {
        return Some((level, element));
    }
    if is_heading_wrapper(&element) {
        return element
            .children()
            .filter_map(ElementRef::wrap)
            .find_map(|child| heading_level(&child).map(|level| (level, child)));
    }
    None
}

/// The node whose following siblings form the section body.
fn section_anchor(heading: ElementRef<'_>) -> ElementRef<'_> {
    let mut anchor = heading;
    if let Some(parent) = anchor.parent().and_then(ElementRef::wrap) {
        if is_heading_wrapper(&parent) {
            anchor = parent;
        }
    }

    // Headings wrapped in their own container: climb until content follows.
    while !anchor.next_siblings().any(|node| node.value().is_element()) {
        match anchor.parent().and_then(ElementRef::wrap) {
            Some(parent) if !matches!(parent.value().name(), "body" | "html") => anchor = parent,
            _ => break,
        }
    }
    anchor
}

fn matches_indicator(heading: &str, indicators: &[String]) -> bool {
    let lower = heading.to_lowercase();
    if lower.is_empty() || SKIPPED_HEADINGS.contains(&lower.as_str()) {
        return false;
    }
    indicators
        .iter()
        .map(|i| i.trim().to_lowercase())
        .any(|i| !i.is_empty() && lower.contains(&i))
}

fn collect_sections<'a>(
    document: &'a Html,
    selectors: &Selectors,
    indicators: &[String],
) -> Vec<Section<'a>> {
    let mut sections = Vec::new();

    for heading in document.select(&selectors.headings) {
        let Some(level) = heading_level(&heading) else {
            continue;
        };
        let title = element_text(heading);
        if !matches_indicator(&title, indicators) {
            continue;
        }

        let mut blocks = Vec::new();
        let mut subheading = None;
        for node in section_anchor(heading).next_siblings() {
            let Some(element) = ElementRef::wrap(node) else {
                continue;
            };
            if let Some((sub_level, sub)) = as_heading(element) {
                if sub_level <= level {
                    break;
                }
                subheading = Some(element_text(sub));
                continue;
            }
            blocks.push(Block {
                subheading: subheading.clone(),
                element,
            });
        }

        sections.push(Section {
            heading: title,
            blocks,
        });
    }
    sections
}

/// Text of `element` without nested lists.
fn own_text(element: ElementRef<'_>) -> String {
    let mut text = String::new();
    for child in element.children() {
        if let Some(t) = child.value().as_text() {
            text.push_str(t);
        } else if let Some(el) = ElementRef::wrap(child) {
            if !matches!(el.value().name(), "ul" | "ol") {
                text.extend(el.text());
            }
        }
    }
    clean_text(&text)
}

fn list_item(li: ElementRef<'_>, selectors: &Selectors) -> RawItem {
    let children = li
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|c| matches!(c.value().name(), "ul" | "ol"))
        .flat_map(|list| {
            list.children()
                .filter_map(ElementRef::wrap)
                .filter(|c| c.value().name() == "li")
        })
        .map(own_text)
        .filter(|s| !s.is_empty())
        .collect();

    let examples = li
        .select(&selectors.code)
        .map(element_text)
        .filter(|s| !s.is_empty())
        .collect();

    RawItem {
        text: own_text(li),
        children,
        examples,
    }
}

fn collect_items(
    element: ElementRef<'_>,
    selectors: &Selectors,
    depth: usize,
    out: &mut Vec<RawItem>,
) {
    match element.value().name() {
        "ul" | "ol" => {
            for li in element
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|c| c.value().name() == "li")
            {
                out.push(list_item(li, selectors));
            }
        }
        "table" => {
            for row in element.select(&selectors.rows) {
                let cells: Vec<String> = row
                    .select(&selectors.cells)
                    .map(element_text)
                    .filter(|c| !c.is_empty())
                    .collect();
                match cells.as_slice() {
                    [] => {}
                    [name] => out.push(RawItem::text(name.clone())),
                    [name, description, ..] => {
                        out.push(RawItem::text(format!("{name}: {description}")))
                    }
                }
            }
        }
        "dl" => {
            let mut term: Option<String> = None;
            for child in element.children().filter_map(ElementRef::wrap) {
                let text = element_text(child);
                match child.value().name() {
                    "dt" => {
                        if let Some(previous) = term.replace(text) {
                            out.push(RawItem::text(previous));
                        }
                    }
                    "dd" => {
                        if let Some(name) = term.take() {
                            out.push(RawItem::text(format!("{name}: {text}")));
                        }
                    }
                    _ => {}
                }
            }
            if let Some(name) = term {
                out.push(RawItem::text(name));
            }
        }
        "div" | "section" | "article" | "aside" | "blockquote" if depth < MAX_CONTAINER_DEPTH => {
            for child in element.children().filter_map(ElementRef::wrap) {
                collect_items(child, selectors, depth + 1, out);
            }
        }
        _ => {}
    }
}

/// Split "Label: description" style text on the earliest separator.
fn split_label(text: &str) -> Option<(&str, &str)> {
    const SEPARATORS: &[&str] = &[": ", " – ", " — ", " - "];
    SEPARATORS
        .iter()
        .filter_map(|sep| text.find(sep).map(|at| (at, sep.len())))
        .min_by_key(|(at, _)| *at)
        .map(|(at, len)| (text[..at].trim(), text[at + len..].trim()))
}

fn split_genre(text: &str) -> (String, String) {
    if let Some(caps) = GENRE_ITEM.captures(text) {
        return (caps["name"].trim().to_string(), caps["desc"].trim().to_string());
    }
    match split_label(text) {
        Some((name, desc)) => (name.to_string(), desc.to_string()),
        None => (trim_label(text).to_string(), String::new()),
    }
}

fn split_tag(text: &str) -> (String, String) {
    if let Some(rest) = text.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            let label = rest[..close].trim();
            let after = rest[close + 1..]
                .trim_start()
                .trim_start_matches([':', '-', '–', '—'])
                .trim();
            return (label.to_string(), after.to_string());
        }
    }
    match split_label(text) {
        Some((label, desc)) => (normalize_tag(label), desc.to_string()),
        None => (normalize_tag(text), String::new()),
    }
}

fn trim_label(text: &str) -> &str {
    text.trim().trim_end_matches([':', '.']).trim()
}

/// "[Verse]" and "Verse:" both become "Verse".
fn normalize_tag(label: &str) -> String {
    trim_label(label)
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim()
        .to_string()
}

fn check_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        Err("empty name")
    } else if name.chars().count() > MAX_NAME_CHARS {
        Err("name too long")
    } else if !name.chars().any(char::is_alphanumeric) {
        Err("name has no letters")
    } else {
        Ok(())
    }
}

fn preview(text: &str) -> String {
    let mut short: String = text.chars().take(40).collect();
    if short.len() < text.len() {
        short.push('…');
    }
    short
}

fn is_scenario(text: &str) -> bool {
    let lower = text.to_lowercase();
    SCENARIO_MARKERS.iter().any(|m| lower.starts_with(m)) || lower.contains(" when ")
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

/// Record a skipped item unless it is plain structure (an empty wrapper).
fn reject(outcome: &mut ParseOutcome, section: &Section<'_>, item_text: &str, reason: &str) {
    if item_text.is_empty() {
        return;
    }
    outcome.errors.push(format!(
        "{}: skipped '{}': {}",
        section.heading,
        preview(item_text),
        reason
    ));
}

fn genres(
    section: &Section<'_>,
    selectors: &Selectors,
    source_url: &str,
    outcome: &mut ParseOutcome,
    seen: &mut HashSet<String>,
) {
    let section_family = vocabulary::classify_genre(&section.heading);

    for block in &section.blocks {
        let heading_family = block
            .subheading
            .as_deref()
            .and_then(vocabulary::classify_genre)
            .or(section_family);

        let mut items = Vec::new();
        collect_items(block.element, selectors, 0, &mut items);

        for item in items {
            let (name, description) = split_genre(&item.text);
            if let Err(reason) = check_name(&name) {
                reject(outcome, section, &item.text, reason);
                continue;
            }
            if !seen.insert(name.to_lowercase()) {
                continue;
            }

            let (family, mut confidence) = match heading_family {
                Some(family) => (family, 0.9),
                None => match vocabulary::classify_genre(&format!("{name} {description}")) {
                    Some(family) => (family, 0.8),
                    None => (GenreFamily::Generic, 0.6),
                },
            };
            if description.is_empty() {
                confidence -= 0.1;
            }

            let profile = vocabulary::genre_profile(family);
            let subgenres = item
                .children
                .iter()
                .map(|child| split_genre(child).0)
                .filter(|child| check_name(child).is_ok())
                .collect();

            outcome.records.push(DomainRecord::Genre(GenreRecord {
                name,
                description,
                subgenres,
                traits: strings(profile.traits),
                instruments: strings(profile.instruments),
                moods: strings(profile.moods),
                meta: RecordMeta::new(source_url, confidence),
            }));
        }
    }
}

fn meta_tags(
    section: &Section<'_>,
    selectors: &Selectors,
    source_url: &str,
    outcome: &mut ParseOutcome,
    seen: &mut HashSet<String>,
) {
    let section_category = vocabulary::classify_tag(&section.heading);

    for block in &section.blocks {
        let heading_category = block
            .subheading
            .as_deref()
            .and_then(vocabulary::classify_tag)
            .or(section_category);

        let mut items = Vec::new();
        collect_items(block.element, selectors, 0, &mut items);

        for item in items {
            let (tag, description) = split_tag(&item.text);
            if let Err(reason) = check_name(&tag) {
                reject(outcome, section, &item.text, reason);
                continue;
            }
            if !seen.insert(tag.to_lowercase()) {
                continue;
            }

            let mut confidence = 0.5;
            let category = match heading_category {
                Some(category) => {
                    confidence += 0.2;
                    category
                }
                None => vocabulary::classify_tag(&tag).unwrap_or(TagCategory::General),
            };
            if !description.is_empty() {
                confidence += 0.2;
            }

            let mut examples = Vec::new();
            for example in &item.examples {
                push_unique(&mut examples, example.clone());
            }
            for found in BRACKETED.find_iter(&description) {
                push_unique(&mut examples, found.as_str().to_string());
            }
            if examples.is_empty() {
                examples.push(format!("[{tag}]"));
            } else {
                confidence += 0.1;
            }

            let compatible_categories = vocabulary::tag_categories_in(&format!("{tag} {description}"))
                .into_iter()
                .filter(|c| *c != category && *c != TagCategory::General)
                .map(|c| c.as_str().to_string())
                .collect();

            outcome.records.push(DomainRecord::MetaTag(MetaTagRecord {
                tag,
                category: category.as_str().to_string(),
                description,
                examples,
                compatible_categories,
                meta: RecordMeta::new(source_url, confidence),
            }));
        }
    }
}

fn techniques(
    section: &Section<'_>,
    selectors: &Selectors,
    source_url: &str,
    outcome: &mut ParseOutcome,
    seen: &mut HashSet<String>,
) {
    let section_kind = vocabulary::classify_technique(&section.heading);
    let has_subsections = section.blocks.iter().any(|b| b.subheading.is_some());

    if has_subsections {
        // Sub-heading per technique; paragraphs describe, list items illustrate.
        let mut groups: Vec<(&str, Vec<ElementRef<'_>>)> = Vec::new();
        for block in &section.blocks {
            let Some(name) = block.subheading.as_deref() else {
                continue;
            };
            if let Some((current, elements)) = groups.last_mut() {
                if *current == name {
                    elements.push(block.element);
                    continue;
                }
            }
            groups.push((name, vec![block.element]));
        }

        for (name, elements) in groups {
            let mut description = Vec::new();
            let mut examples = Vec::new();
            let mut scenarios = Vec::new();

            for element in elements {
                if element.value().name() == "p" {
                    let text = element_text(element);
                    if text.is_empty() {
                        continue;
                    }
                    if is_scenario(&text) {
                        push_unique(&mut scenarios, text);
                    } else {
                        description.push(text);
                    }
                    for code in element.select(&selectors.code) {
                        push_unique(&mut examples, element_text(code));
                    }
                    continue;
                }

                let mut items = Vec::new();
                collect_items(element, selectors, 0, &mut items);
                for item in items {
                    if is_scenario(&item.text) {
                        push_unique(&mut scenarios, item.text);
                    } else {
                        push_unique(&mut examples, item.text);
                    }
                }
            }

            push_technique(
                outcome,
                section,
                seen,
                source_url,
                section_kind,
                name.to_string(),
                description.join(" "),
                examples,
                scenarios,
            );
        }
        return;
    }

    for block in &section.blocks {
        let mut items = Vec::new();
        collect_items(block.element, selectors, 0, &mut items);

        for item in items {
            let (name, description) = match split_label(&item.text) {
                Some((name, desc)) => (trim_label(name).to_string(), desc.to_string()),
                None => (trim_label(&item.text).to_string(), String::new()),
            };
            let scenarios = description
                .split(". ")
                .map(|s| s.trim().trim_end_matches('.'))
                .filter(|s| is_scenario(s))
                .map(str::to_string)
                .collect();

            push_technique(
                outcome,
                section,
                seen,
                source_url,
                section_kind,
                name,
                description,
                item.examples,
                scenarios,
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn push_technique(
    outcome: &mut ParseOutcome,
    section: &Section<'_>,
    seen: &mut HashSet<String>,
    source_url: &str,
    section_kind: Option<TechniqueKind>,
    name: String,
    description: String,
    examples: Vec<String>,
    scenarios: Vec<String>,
) {
    if let Err(reason) = check_name(&name) {
        reject(outcome, section, &name, reason);
        return;
    }
    if !seen.insert(name.to_lowercase()) {
        return;
    }

    let technique_kind = vocabulary::classify_technique(&format!("{name} {description}"))
        .or(section_kind)
        .unwrap_or(TechniqueKind::General);

    let mut confidence = 0.5;
    if !description.is_empty() {
        confidence += 0.2;
    }
    if !examples.is_empty() {
        confidence += 0.15;
    }
    if !scenarios.is_empty() {
        confidence += 0.15;
    }

    outcome.records.push(DomainRecord::Technique(TechniqueRecord {
        name,
        description,
        technique_kind: technique_kind.as_str().to_string(),
        examples,
        scenarios,
        meta: RecordMeta::new(source_url, confidence),
    }));
}
