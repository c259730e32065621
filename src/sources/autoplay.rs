//! Recommendation queries used when the queue runs dry.
//!
//! Each source has an identifier template; placeholders are filled from the
//! last history entry. Sources without a template use the text fallback.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::audio::history::HistoryEntry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoplayConfig {
    /// `sourceName` -> identifier template. Placeholders: `{identifier}`,
    /// `{uri}`, `{title}`, `{author}`.
    pub templates: HashMap<String, String>,
    /// Free-text query sent through the default search platform.
    pub fallback: String,
}

impl Default for AutoplayConfig {
    fn default() -> Self {
        let youtube_radio = "https://www.youtube.com/watch?v={identifier}&list=RD{identifier}";
        let templates = [
            ("youtube", youtube_radio),
            ("youtubemusic", youtube_radio),
            ("spotify", "sprec:seed_tracks={identifier}"),
            ("deezer", "dzrec:{identifier}"),
            ("soundcloud", "{uri}/recommended"),
        ]
        .into_iter()
        .map(|(source, template)| (source.to_string(), template.to_string()))
        .collect();

        Self {
            templates,
            fallback: "{author} {title} related".to_string(),
        }
    }
}

impl AutoplayConfig {
    /// Platform recommendation identifier for the entry's source, if the
    /// source has a template and every placeholder it uses is known.
    pub fn recommendation(&self, entry: &HistoryEntry) -> Option<String> {
        let template = self.templates.get(&entry.source_name.to_lowercase())?;
        render(template, entry)
    }

    pub fn fallback_query(&self, entry: &HistoryEntry) -> Option<String> {
        render(&self.fallback, entry)
            .map(|query| query.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|query| !query.is_empty())
    }
}

fn render(template: &str, entry: &HistoryEntry) -> Option<String> {
    let mut out = template
        .replace("{identifier}", &entry.identifier)
        .replace("{title}", &entry.title)
        .replace("{author}", &entry.author);

    if out.contains("{uri}") {
        out = out.replace("{uri}", entry.uri.as_deref()?);
    }
    Some(out)
}
