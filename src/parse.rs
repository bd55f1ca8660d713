use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::warn;

use crate::record::{FailedRecord, Link, Record, Series, Stats, Tags, UserStats, WorkRecord};
use crate::traits::RecordExtractor;
use crate::{Error, Result};

/// Returns the number of pages in the listing: the highest page number linked from the
/// pagination list, or 1 if there is no pagination.
pub fn count_pages(html: &str) -> Result<u32> {
    let doc = Html::parse_document(html);
    let link_selector = create_selector("ol.pagination li a")?;

    let max_page = doc
        .select(&link_selector)
        .filter_map(|link| text_of(link).parse::<u32>().ok())
        .max()
        .unwrap_or(1);
    Ok(max_page.max(1))
}

/// Extracts one record per `li.reading.work.blurb` entry of a history page.
///
/// Selectors and patterns are compiled once, in [`HistoryPageExtractor::new`].
#[derive(Debug)]
pub struct HistoryPageExtractor {
    work: Selector,
    title: Selector,
    author: Selector,
    fandoms: Selector,
    rating: Selector,
    warning: Selector,
    category: Selector,
    completion: Selector,
    summary: Selector,
    warning_tags: Selector,
    relationship_tags: Selector,
    character_tags: Selector,
    freeform_tags: Selector,
    words: Selector,
    chapters: Selector,
    kudos: Selector,
    comments: Selector,
    bookmarks: Selector,
    hits: Selector,
    language: Selector,
    published: Selector,
    viewed: Selector,
    series: Selector,
    series_part: Selector,
    last_visited_re: Regex,
    visits_re: Regex,
}

impl HistoryPageExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            work: create_selector("li.reading.work.blurb")?,
            title: create_selector(".heading a")?,
            author: create_selector(r#"a[rel="author"]"#)?,
            fandoms: create_selector(".fandoms.heading a")?,
            rating: create_selector(".rating")?,
            warning: create_selector(".warnings")?,
            category: create_selector(".category")?,
            completion: create_selector(".iswip")?,
            summary: create_selector("blockquote.userstuff.summary")?,
            warning_tags: create_selector(".tags .warnings a")?,
            relationship_tags: create_selector(".tags .relationships a")?,
            character_tags: create_selector(".tags .characters a")?,
            freeform_tags: create_selector(".tags .freeforms a")?,
            words: create_selector("dd.words")?,
            chapters: create_selector("dd.chapters")?,
            kudos: create_selector("dd.kudos")?,
            comments: create_selector("dd.comments")?,
            bookmarks: create_selector("dd.bookmarks")?,
            hits: create_selector("dd.hits")?,
            language: create_selector("dd.language")?,
            published: create_selector("p.datetime")?,
            viewed: create_selector(".viewed.heading")?,
            series: create_selector(".series a")?,
            series_part: create_selector(".series li strong")?,
            last_visited_re: Regex::new(r"Last visited:\s*([^(]+)")?,
            visits_re: Regex::new(r"Visited (\d+) times")?,
        })
    }

    /// Missing parts fall back to placeholders; an entry without a `work_` id keeps an empty
    /// id.
    fn extract_work(&self, work: ElementRef, page: u32) -> WorkRecord {
        let id = work_id(work).unwrap_or_default();

        let title = work.select(&self.title).next();
        let author = work.select(&self.author).next();
        let viewed = work.select(&self.viewed).next().map(text_of);

        let series = work.select(&self.series).next().map(|link| Series {
            name: text_of(link),
            url: href_of(link),
            part: work
                .select(&self.series_part)
                .next()
                .map(text_of)
                .unwrap_or_else(unknown),
        });

        WorkRecord {
            id,
            page_number: page,
            title: title.map(text_of).unwrap_or_else(|| "Unknown Title".to_string()),
            url: title.and_then(href_of),
            author: author.map(text_of).unwrap_or_else(|| "Anonymous".to_string()),
            author_url: author.and_then(href_of),
            fandoms: links(work, &self.fandoms),
            rating: self.title_or_text(work, &self.rating),
            warning: self.title_or_text(work, &self.warning),
            category: self.title_or_text(work, &self.category),
            completion: self.title_or_text(work, &self.completion),
            summary: first_text(work, &self.summary).unwrap_or_default(),
            tags: Tags {
                warnings: links(work, &self.warning_tags),
                relationships: links(work, &self.relationship_tags),
                characters: links(work, &self.character_tags),
                freeforms: links(work, &self.freeform_tags),
            },
            stats: Stats {
                word_count: first_number(work, &self.words),
                chapters: first_text(work, &self.chapters).unwrap_or_else(|| "?/?".to_string()),
                kudos: first_number(work, &self.kudos),
                comments: first_number(work, &self.comments),
                bookmarks: first_number(work, &self.bookmarks),
                hits: first_number(work, &self.hits),
                language: first_text(work, &self.language).unwrap_or_else(unknown),
                publish_date: first_text(work, &self.published).unwrap_or_else(unknown),
            },
            user_stats: UserStats {
                last_visited: viewed
                    .as_deref()
                    .map(|text| self.last_visited(text))
                    .unwrap_or_else(unknown),
                visits: viewed.as_deref().map(|text| self.visits(text)).unwrap_or(0),
            },
            series,
        }
    }

    /// Required tags keep their full name in the `title` attribute, the text is often an icon
    /// label.
    fn title_or_text(&self, work: ElementRef, selector: &Selector) -> String {
        work.select(selector)
            .next()
            .map(|el| match el.value().attr("title") {
                Some(title) if !title.trim().is_empty() => title.trim().to_string(),
                _ => text_of(el),
            })
            .unwrap_or_else(unknown)
    }

    fn last_visited(&self, viewed: &str) -> String {
        self.last_visited_re
            .captures(viewed)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(unknown)
    }

    fn visits(&self, viewed: &str) -> u32 {
        if viewed.contains("Visited once") {
            return 1;
        }
        self.visits_re
            .captures(viewed)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    }
}

impl RecordExtractor for HistoryPageExtractor {
    fn extract(&self, content: &str, page: u32) -> Vec<Record> {
        let doc = Html::parse_document(content);

        let records = doc
            .select(&self.work)
            .map(|work| {
                let id = work_id(work).unwrap_or_default();
                extract_entry(id, page, || self.extract_work(work, page))
            })
            .collect();
        records
    }
}

/// Runs `extract` for one entry. A panic turns into a placeholder record, so the other
/// entries of the page survive it.
fn extract_entry(id: String, page: u32, extract: impl FnOnce() -> WorkRecord) -> Record {
    match panic::catch_unwind(AssertUnwindSafe(extract)) {
        Ok(work) => Record::from(work),
        Err(payload) => {
            let details = panic_message(payload.as_ref());
            warn!(page, id = %id, error = %details, "Failed to extract a history entry");
            Record::from(FailedRecord::new(id, page, details))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| msg.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown error".to_string())
}

#[inline]
fn create_selector(sel_str: &str) -> Result<Selector> {
    Selector::parse(sel_str).map_err(|_| Error::ParseMissingSelector(sel_str.into()))
}

/// `work_123` -> `123`.
fn work_id(work: ElementRef) -> Option<String> {
    work.value()
        .attr("id")
        .and_then(|id| id.strip_prefix("work_"))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn text_of(el: ElementRef) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn href_of(el: ElementRef) -> Option<String> {
    el.value().attr("href").map(str::to_string)
}

fn first_text(work: ElementRef, selector: &Selector) -> Option<String> {
    work.select(selector).next().map(text_of)
}

fn first_number(work: ElementRef, selector: &Selector) -> u64 {
    first_text(work, selector)
        .map(|text| extract_number(&text))
        .unwrap_or(0)
}

fn links(work: ElementRef, selector: &Selector) -> Vec<Link> {
    work.select(selector)
        .map(|el| Link {
            name: text_of(el),
            url: href_of(el),
        })
        .collect()
}

/// Keeps only the digits, so `1,234` and `1 234` both read as 1234.
fn extract_number(text: &str) -> u64 {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

fn unknown() -> String {
    "Unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"
<html><body>
<ol class="reading work index group">
  <li id="work_123" class="reading work blurb group" role="article">
    <div class="header module">
      <h4 class="heading">
        <a href="/works/123">A Long Road</a>
        by
        <a rel="author" href="/users/writer/pseuds/writer">writer</a>
      </h4>
      <h5 class="fandoms heading">
        <a class="tag" href="/tags/Fandom%20One/works">Fandom One</a>
        <a class="tag" href="/tags/Fandom%20Two/works">Fandom Two</a>
      </h5>
      <ul class="required-tags">
        <li><a class="help symbol question modal"><span class="rating-teen rating" title="Teen And Up Audiences"><span class="text">Teen</span></span></a></li>
        <li><a class="help symbol question modal"><span class="warning-no warnings" title="No Archive Warnings Apply"><span class="text">No Warnings</span></span></a></li>
        <li><a class="help symbol question modal"><span class="category-slash category" title="M/M"><span class="text">M/M</span></span></a></li>
        <li><a class="help symbol question modal"><span class="complete-no iswip" title="Work in Progress"><span class="text">WIP</span></span></a></li>
      </ul>
      <p class="datetime">12 Mar 2021</p>
    </div>
    <h6 class="landmark heading">Tags</h6>
    <ul class="tags commas">
      <li class="warnings"><strong><a class="tag" href="/tags/No%20Warnings/works">No Archive Warnings Apply</a></strong></li>
      <li class="relationships"><a class="tag" href="/tags/A*s*B/works">A/B</a></li>
      <li class="characters"><a class="tag" href="/tags/A/works">A</a></li>
      <li class="characters"><a class="tag" href="/tags/B/works">B</a></li>
      <li class="freeforms"><a class="tag" href="/tags/Slow%20Burn/works">Slow Burn</a></li>
    </ul>
    <blockquote class="userstuff summary"><p>They walk. A lot.</p></blockquote>
    <ul class="series">
      <li>Part <strong>2</strong> of <a href="/series/77">Roads</a></li>
    </ul>
    <dl class="stats">
      <dt class="language">Language:</dt><dd class="language">English</dd>
      <dt class="words">Words:</dt><dd class="words">12,345</dd>
      <dt class="chapters">Chapters:</dt><dd class="chapters">3/10</dd>
      <dt class="comments">Comments:</dt><dd class="comments"><a href="/works/123?show_comments=true">45</a></dd>
      <dt class="kudos">Kudos:</dt><dd class="kudos"><a href="/works/123#kudos">1,024</a></dd>
      <dt class="bookmarks">Bookmarks:</dt><dd class="bookmarks"><a href="/works/123/bookmarks">88</a></dd>
      <dt class="hits">Hits:</dt><dd class="hits">20,001</dd>
    </dl>
    <div class="user module group">
      <h4 class="viewed heading">
        <span>Last visited:</span> 01 Feb 2024 (Update available.)
        Visited 7 times
      </h4>
    </div>
  </li>
  <li class="reading work blurb group" role="article">
    <div class="header module"><h4 class="heading">Deleted work</h4></div>
  </li>
  <li id="work_456" class="reading work blurb group" role="article">
    <div class="header module">
      <h4 class="heading"><a href="/works/456">Short One</a></h4>
    </div>
    <div class="user module group">
      <h4 class="viewed heading"><span>Last visited:</span> 03 Jan 2024 (Latest version.) Visited once</h4>
    </div>
  </li>
</ol>
</body></html>
"##;

    #[test]
    fn extracts_a_complete_work() {
        let extractor = HistoryPageExtractor::new().unwrap();
        let records = extractor.extract(PAGE, 4);

        assert_eq!(records.len(), 3);
        let Record::Work(work) = &records[0] else {
            panic!("first entry should be a work, got {:?}", records[0]);
        };

        assert_eq!(work.id, "123");
        assert_eq!(work.page_number, 4);
        assert_eq!(work.title, "A Long Road");
        assert_eq!(work.url.as_deref(), Some("/works/123"));
        assert_eq!(work.author, "writer");
        assert_eq!(work.author_url.as_deref(), Some("/users/writer/pseuds/writer"));
        assert_eq!(
            work.fandoms.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["Fandom One", "Fandom Two"]
        );
        assert_eq!(work.rating, "Teen And Up Audiences");
        assert_eq!(work.warning, "No Archive Warnings Apply");
        assert_eq!(work.category, "M/M");
        assert_eq!(work.completion, "Work in Progress");
        assert_eq!(work.summary, "They walk. A lot.");

        assert_eq!(work.tags.warnings.len(), 1);
        assert_eq!(work.tags.relationships[0].name, "A/B");
        assert_eq!(work.tags.characters.len(), 2);
        assert_eq!(work.tags.freeforms[0].url.as_deref(), Some("/tags/Slow%20Burn/works"));

        assert_eq!(work.stats.word_count, 12345);
        assert_eq!(work.stats.chapters, "3/10");
        assert_eq!(work.stats.kudos, 1024);
        assert_eq!(work.stats.comments, 45);
        assert_eq!(work.stats.bookmarks, 88);
        assert_eq!(work.stats.hits, 20001);
        assert_eq!(work.stats.language, "English");
        assert_eq!(work.stats.publish_date, "12 Mar 2021");

        assert_eq!(work.user_stats.last_visited, "01 Feb 2024");
        assert_eq!(work.user_stats.visits, 7);

        let series = work.series.as_ref().unwrap();
        assert_eq!(series.name, "Roads");
        assert_eq!(series.url.as_deref(), Some("/series/77"));
        assert_eq!(series.part, "2");
    }

    #[test]
    fn entry_without_id_is_still_extracted() {
        let extractor = HistoryPageExtractor::new().unwrap();
        let records = extractor.extract(PAGE, 4);

        let Record::Work(work) = &records[1] else {
            panic!("second entry should be a work, got {:?}", records[1]);
        };
        assert_eq!(work.id, "");
        assert_eq!(work.page_number, 4);
        assert_eq!(work.title, "Unknown Title");

        assert_eq!(records[2].id(), "456");
        assert!(!records[2].is_error());
    }

    #[test]
    fn panicking_entry_becomes_a_placeholder() {
        let record = extract_entry("99".to_string(), 6, || panic!("bad markup"));

        let Record::Failed(failed) = &record else {
            panic!("expected a placeholder, got {record:?}");
        };
        assert_eq!(failed.id, "99");
        assert_eq!(failed.page_number, 6);
        assert_eq!(failed.error, "Failed to extract complete data");
        assert_eq!(failed.error_details, "bad markup");
    }

    #[test]
    fn sparse_entry_falls_back_to_defaults() {
        let extractor = HistoryPageExtractor::new().unwrap();
        let records = extractor.extract(PAGE, 4);
        let Record::Work(work) = &records[2] else {
            panic!("third entry should be a work");
        };

        assert_eq!(work.author, "Anonymous");
        assert_eq!(work.rating, "Unknown");
        assert_eq!(work.stats.chapters, "?/?");
        assert_eq!(work.stats.word_count, 0);
        assert_eq!(work.user_stats.last_visited, "03 Jan 2024");
        assert_eq!(work.user_stats.visits, 1);
        assert!(work.series.is_none());
    }

    #[test]
    fn page_without_entries_yields_nothing() {
        let extractor = HistoryPageExtractor::new().unwrap();
        assert!(extractor.extract("<html><body></body></html>", 1).is_empty());
    }

    #[test]
    fn count_pages_defaults_to_one() {
        assert_eq!(count_pages("<html><body><p>no pages</p></body></html>").unwrap(), 1);
        assert_eq!(
            count_pages(r#"<ol class="pagination"><li><a href="?page=2">Next</a></li></ol>"#)
                .unwrap(),
            1
        );
        assert_eq!(
            count_pages(
                r#"<ol class="pagination"><li><a>2</a></li><li><a>3</a></li><li><a>31</a></li></ol>"#
            )
            .unwrap(),
            31
        );
    }

    #[test]
    fn extract_number_ignores_separators() {
        assert_eq!(extract_number("1,234"), 1234);
        assert_eq!(extract_number("none"), 0);
    }
}
