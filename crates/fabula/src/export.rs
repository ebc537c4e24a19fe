//! Read-only manuscript rendering.
//!
//! Turns stored chapter content into plain text, for one chapter or the
//! whole project. Export never writes into the project tree.

use crate::artifacts::ChapterContent;
use crate::error::{EngineError, Result};
use crate::store::ArtifactStore;

/// Render one chapter to text: title line, then scene bodies separated by
/// blank lines.
pub fn render_chapter(content: &ChapterContent) -> String {
    let mut out = String::new();
    let title = if content.title.is_empty() {
        format!("Chapter {}", content.chapter_id)
    } else {
        content.title.clone()
    };
    out.push_str(&title);
    out.push_str("\n\n");
    for (i, scene) in content.scenes.iter().enumerate() {
        if i > 0 {
            out.push_str("\n\n");
        }
        out.push_str(scene.content.trim_end());
    }
    out.push('\n');
    out
}

/// Export a single chapter.
pub fn export_chapter(store: &ArtifactStore, chapter_id: u32) -> Result<String> {
    let content = store.read_chapter_content(chapter_id)?.ok_or_else(|| {
        EngineError::user(format!("chapter {chapter_id} has no stored content"))
    })?;
    Ok(render_chapter(&content))
}

/// Export every stored chapter in order, separated by a rule.
pub fn export_all(store: &ArtifactStore) -> Result<String> {
    let mut chapters = Vec::new();
    let mut chapter_id = 1;
    loop {
        match store.read_chapter_content(chapter_id)? {
            Some(content) => chapters.push(render_chapter(&content)),
            None => break,
        }
        chapter_id += 1;
    }
    if chapters.is_empty() {
        return Err(EngineError::user("no stored chapters to export"));
    }
    Ok(chapters.join("\n----\n\n"))
}
