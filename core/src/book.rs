//! Book model: chapters of paragraphs and positions within them.
//!
//! A paragraph is the atomic narration unit. Positions are always kept
//! addressable by the engine; the helpers here do the normalisation.

use serde::{Deserialize, Serialize};

/// Pointer into a book: `{chapter, paragraph}`.
///
/// Ordering follows reading order (chapter first, then paragraph).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub chapter: usize,
    pub paragraph: usize,
}

impl Position {
    pub const fn new(chapter: usize, paragraph: usize) -> Self {
        Self { chapter, paragraph }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chapter, self.paragraph)
    }
}

/// Descriptive metadata, available before the chapters are fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMeta {
    pub id: String,
    pub title: String,
    pub author: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub title: String,
    pub paragraphs: Vec<String>,
}

/// A loaded book. Immutable for the lifetime of a narration session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    pub id: String,
    pub title: String,
    pub author: String,
    pub chapters: Vec<Chapter>,
}

impl Book {
    pub fn new(meta: BookMeta, chapters: Vec<Chapter>) -> Self {
        Self {
            id: meta.id,
            title: meta.title,
            author: meta.author,
            chapters,
        }
    }

    pub fn meta(&self) -> BookMeta {
        BookMeta {
            id: self.id.clone(),
            title: self.title.clone(),
            author: self.author.clone(),
        }
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }

    pub fn total_paragraphs(&self) -> usize {
        self.chapters.iter().map(|c| c.paragraphs.len()).sum()
    }

    /// Paragraph text at `pos`, if addressable
    pub fn paragraph(&self, pos: Position) -> Option<&str> {
        self.chapters
            .get(pos.chapter)
            .and_then(|c| c.paragraphs.get(pos.paragraph))
            .map(String::as_str)
    }

    pub fn contains(&self, pos: Position) -> bool {
        self.paragraph(pos).is_some()
    }

    /// Paragraphs strictly before `pos`: whole chapters before it plus the
    /// paragraph index within its own chapter.
    pub fn paragraphs_before(&self, pos: Position) -> usize {
        let whole: usize = self
            .chapters
            .iter()
            .take(pos.chapter)
            .map(|c| c.paragraphs.len())
            .sum();
        whole + pos.paragraph
    }

    /// Completion percentage in `[0, 100]`; 0 for a book without paragraphs.
    pub fn percentage(&self, pos: Position) -> f64 {
        let total = self.total_paragraphs();
        if total == 0 {
            return 0.0;
        }
        let consumed = self.paragraphs_before(pos).min(total);
        consumed as f64 / total as f64 * 100.0
    }

    /// First addressable position at or after `pos`, skipping over exhausted
    /// or empty chapters. `None` when the book has nothing left.
    pub fn normalize(&self, pos: Position) -> Option<Position> {
        let mut chapter = pos.chapter;
        let mut paragraph = pos.paragraph;
        while let Some(c) = self.chapters.get(chapter) {
            if paragraph < c.paragraphs.len() {
                return Some(Position::new(chapter, paragraph));
            }
            chapter += 1;
            paragraph = 0;
        }
        None
    }

    /// Position following `pos` in reading order
    pub fn advance(&self, pos: Position) -> Option<Position> {
        self.normalize(Position::new(pos.chapter, pos.paragraph + 1))
    }

    pub fn last_position(&self) -> Option<Position> {
        self.chapters
            .iter()
            .enumerate()
            .rev()
            .find(|(_, c)| !c.paragraphs.is_empty())
            .map(|(i, c)| Position::new(i, c.paragraphs.len() - 1))
    }

    /// Turn a possibly stale stored position into an addressable one.
    pub fn clamp_seed(&self, pos: Position) -> Position {
        self.normalize(pos)
            .or_else(|| self.last_position())
            .unwrap_or_default()
    }
}

/// Split newline-delimited chapter text into paragraphs, dropping blank lines.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    text.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
