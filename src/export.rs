//! Export the store as portable JSON or Markdown. Embeddings are left
//! out; they are derivable from the text.

use serde::Serialize;
use std::fmt::Write as _;

use crate::db::{Link, Memory, MemoryDB, MemoryType, Session};
use crate::error::EngramError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Markdown,
}

impl std::str::FromStr for ExportFormat {
    type Err = EngramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ExportFormat::Json),
            "md" | "markdown" => Ok(ExportFormat::Markdown),
            other => Err(EngramError::Validation(format!("invalid export format: {other}"))),
        }
    }
}

#[derive(Serialize)]
struct ExportDoc {
    exported_at: chrono::DateTime<chrono::Utc>,
    memories: Vec<Memory>,
    links: Vec<Link>,
    sessions: Vec<Session>,
}

pub fn export(db: &MemoryDB, format: ExportFormat) -> Result<String, EngramError> {
    let memories = db.export_all()?;
    let links = db.all_links()?;
    let sessions = db.list_sessions(None, None, u32::MAX as usize)?;
    match format {
        ExportFormat::Json => {
            let doc = ExportDoc { exported_at: crate::db::now(), memories, links, sessions };
            serde_json::to_string_pretty(&doc)
                .map_err(|e| EngramError::Internal(format!("serialize export: {e}")))
        }
        ExportFormat::Markdown => Ok(to_markdown(&memories, &links)),
    }
}

fn to_markdown(memories: &[Memory], links: &[Link]) -> String {
    let mut out = String::from("# Engram export\n");
    for ty in MemoryType::ALL {
        let of_type: Vec<&Memory> = memories.iter().filter(|m| m.mem_type == ty).collect();
        if of_type.is_empty() {
            continue;
        }
        let _ = write!(out, "\n## {ty}\n");
        for m in of_type {
            let _ = write!(out, "\n### {} (#{})\n", m.title, m.id);
            if m.archived {
                out.push_str("_archived_\n");
            }
            if !m.tags.is_empty() {
                let _ = writeln!(out, "tags: {}", m.tags.join(", "));
            }
            let _ = writeln!(
                out,
                "importance: {:.2} | strength: {:.2} | accessed: {}",
                m.importance, m.strength, m.access_count
            );
            if !m.content.is_empty() {
                out.push('\n');
                out.push_str(&m.content);
                out.push('\n');
            }
        }
    }
    if !links.is_empty() {
        out.push_str("\n## Links\n\n");
        for l in links {
            let _ = writeln!(
                out,
                "- #{} —{}→ #{} ({:.2})",
                l.source_id,
                l.relation.as_str(),
                l.target_id,
                l.strength
            );
        }
    }
    out
}
