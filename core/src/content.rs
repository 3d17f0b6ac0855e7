//! Content Provider contract and adapters.
//!
//! Book content is a JSON array of `{id, title, text}` chapters, where `text`
//! is a newline-delimited document. Turning that into paragraphs happens in
//! [`load_book`], in front of the engine. Any failure along the way is a
//! `LoadError`, distinct from playback errors.

use crate::book::{split_paragraphs, Book, BookMeta, Chapter};
use crate::progress::ProgressStore;
use crate::{NarratorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Raw chapter as delivered by a provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterSource {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
}

#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Ordered chapters of `book_id`
    async fn fetch_chapters(&self, book_id: &str) -> Result<Vec<ChapterSource>>;
}

// Library ids may be numbers or strings
fn id_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "book id must be a string or number, got {}",
            other
        ))),
    }
}

fn unknown_author() -> String {
    "Unknown Author".to_string()
}

/// One book in the library catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryEntry {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    pub title: String,
    #[serde(default = "unknown_author")]
    pub author: String,
    #[serde(default)]
    pub cover: Option<String>,
    pub content_path: String,
}

impl LibraryEntry {
    pub fn meta(&self) -> BookMeta {
        BookMeta {
            id: self.id.clone(),
            title: self.title.clone(),
            author: self.author.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Library {
    entries: Vec<LibraryEntry>,
}

impl Library {
    pub fn new(entries: Vec<LibraryEntry>) -> Self {
        Self { entries }
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let entries: Vec<LibraryEntry> = serde_json::from_str(data)
            .map_err(|e| NarratorError::LoadError(format!("invalid library: {}", e)))?;
        Ok(Self { entries })
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read_to_string(path).await.map_err(|e| {
            NarratorError::LoadError(format!("read library {}: {}", path.display(), e))
        })?;
        let library = Self::from_json(&data)?;
        info!(target = "content", path = ?path, books = library.entries.len(), "Library loaded");
        Ok(library)
    }

    pub fn entries(&self) -> &[LibraryEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&LibraryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Each entry with its stored completion percentage (0 when unknown).
    /// An unreadable store degrades to all zeros.
    pub fn with_progress(&self, store: &ProgressStore) -> Vec<(LibraryEntry, f64)> {
        let all = store.all().unwrap_or_else(|e| {
            warn!(target = "content", error = %e, "Progress unavailable for library view");
            Default::default()
        });
        self.entries
            .iter()
            .map(|e| {
                let pct = all.get(&e.id).map(|r| r.percentage).unwrap_or(0.0);
                (e.clone(), pct)
            })
            .collect()
    }

    fn content_path(&self, book_id: &str) -> Result<&str> {
        self.get(book_id)
            .map(|e| e.content_path.as_str())
            .ok_or_else(|| NarratorError::LoadError(format!("Book not found: {}", book_id)))
    }
}

/// Parse a chapter document. Anything but a non-empty JSON array is rejected.
pub fn parse_chapters(data: &[u8]) -> Result<Vec<ChapterSource>> {
    let value: serde_json::Value = serde_json::from_slice(data)
        .map_err(|e| NarratorError::LoadError(format!("invalid book content: {}", e)))?;
    match value {
        serde_json::Value::Array(items) if !items.is_empty() => {
            serde_json::from_value(serde_json::Value::Array(items))
                .map_err(|e| NarratorError::LoadError(format!("invalid chapter: {}", e)))
        }
        _ => Err(NarratorError::LoadError(
            "Book content is empty or invalid".into(),
        )),
    }
}

/// Reads `<root>/<contentPath>` for each library entry
pub struct FsContentProvider {
    root: PathBuf,
    library: Library,
}

impl FsContentProvider {
    pub fn new<P: AsRef<Path>>(root: P, library: Library) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            library,
        }
    }

    pub fn library(&self) -> &Library {
        &self.library
    }
}

#[async_trait]
impl ContentProvider for FsContentProvider {
    async fn fetch_chapters(&self, book_id: &str) -> Result<Vec<ChapterSource>> {
        let rel = self.library.content_path(book_id)?;
        let path = self.root.join(rel.trim_start_matches('/'));
        debug!(target = "content", book = book_id, path = ?path, "Loading book content");
        let data = tokio::fs::read(&path).await.map_err(|e| {
            NarratorError::LoadError(format!("read {}: {}", path.display(), e))
        })?;
        parse_chapters(&data)
    }
}

/// Fetches `<base_url>/<contentPath>` over HTTP
pub struct HttpContentProvider {
    base_url: String,
    library: Library,
    client: reqwest::Client,
}

impl HttpContentProvider {
    pub fn new(base_url: impl Into<String>, library: Library, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NarratorError::LoadError(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into(),
            library,
            client,
        })
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    fn url_for(&self, content_path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            content_path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl ContentProvider for HttpContentProvider {
    async fn fetch_chapters(&self, book_id: &str) -> Result<Vec<ChapterSource>> {
        let url = self.url_for(self.library.content_path(book_id)?);
        debug!(target = "content", book = book_id, url = %url, "Fetching book content");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| NarratorError::LoadError(format!("fetch {}: {}", url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NarratorError::LoadError(format!(
                "HTTP error! status: {}",
                status.as_u16()
            )));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| NarratorError::LoadError(format!("read body {}: {}", url, e)))?;
        parse_chapters(&body)
    }
}

/// Fetch and split a book's chapters into paragraphs.
pub async fn load_book(provider: &dyn ContentProvider, meta: BookMeta) -> Result<Book> {
    let sources = provider.fetch_chapters(&meta.id).await.map_err(|e| match e {
        NarratorError::LoadError(_) => e,
        other => NarratorError::LoadError(other.to_string()),
    })?;

    let chapters: Vec<Chapter> = sources
        .into_iter()
        .enumerate()
        .map(|(i, src)| Chapter {
            id: if src.id.is_empty() { i.to_string() } else { src.id },
            title: if src.title.is_empty() {
                format!("Chapter {}", i + 1)
            } else {
                src.title
            },
            paragraphs: split_paragraphs(&src.text),
        })
        .collect();

    let book = Book::new(meta, chapters);
    info!(
        target = "content",
        book = %book.id,
        chapters = book.chapter_count(),
        paragraphs = book.total_paragraphs(),
        "Book loaded"
    );
    Ok(book)
}
