use crate::error::VaultError;
use crate::types::{CommandEntry, Source};
use rusqlite::{params, Connection, Row};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Read/write surface the resolver needs from persisted commands.
pub trait Vault {
    /// Matching entries, most relevant first.
    fn search(&self, query: &str) -> Result<Vec<CommandEntry>, VaultError>;
    fn record_usage(&self, id: i64) -> Result<(), VaultError>;
    /// Stores `entry` unless an entry with the same commands exists; returns
    /// the id of the stored or existing entry.
    fn save(&self, entry: &NewEntry) -> Result<i64, VaultError>;
}

#[derive(Debug, Clone)]
pub struct NewEntry {
    pub name: Option<String>,
    pub commands: Vec<String>,
    pub description: String,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub source: Source,
    pub variables: Option<BTreeMap<String, String>>,
}

pub struct SqliteVault {
    conn: Connection,
}

impl SqliteVault {
    pub fn open(path: &Path) -> Result<Self, VaultError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, VaultError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, VaultError> {
        init_db(&conn)?;
        Ok(Self { conn })
    }

    pub fn add(&self, entry: &NewEntry) -> Result<i64, VaultError> {
        let commands = serde_json::to_string(&entry.commands)
            .map_err(|e| VaultError::Corrupt(e.to_string()))?;
        let tags = serde_json::to_string(&entry.tags).map_err(|e| VaultError::Corrupt(e.to_string()))?;
        let variables = entry
            .variables
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| VaultError::Corrupt(e.to_string()))?;

        self.conn.execute(
            "INSERT INTO commands (name, commands, description, tags, usage_count, last_used, created_at, confidence, source, variables)
             VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5, ?6, ?7, ?8)",
            params![
                entry.name,
                commands,
                entry.description,
                tags,
                now_secs(),
                entry.confidence.clamp(0.0, 1.0),
                entry.source.as_str(),
                variables
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list(&self) -> Result<Vec<CommandEntry>, VaultError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, commands, description, tags, usage_count, last_used, created_at, confidence, source, variables
             FROM commands ORDER BY usage_count DESC, created_at DESC",
        )?;
        let entries = stmt
            .query_map([], row_to_raw)?
            .filter_map(|r| r.ok())
            .filter_map(|raw| raw.into_entry().ok())
            .collect();
        Ok(entries)
    }

    pub fn remove(&self, id: i64) -> Result<(), VaultError> {
        let changed = self.conn.execute("DELETE FROM commands WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(VaultError::NotFound(id));
        }
        Ok(())
    }

    pub fn find_by_commands(&self, commands: &[String]) -> Result<Option<CommandEntry>, VaultError> {
        Ok(self.list()?.into_iter().find(|e| e.commands == commands))
    }

    pub fn count(&self) -> u32 {
        self.conn
            .query_row("SELECT COUNT(*) FROM commands", [], |row| row.get(0))
            .unwrap_or(0)
    }
}

impl Vault for SqliteVault {
    fn search(&self, query: &str) -> Result<Vec<CommandEntry>, VaultError> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(u32, CommandEntry)> = self
            .list()?
            .into_iter()
            .filter_map(|entry| {
                let (score, matched) = relevance(&entry, &terms);
                // At least half of the meaningful query terms must hit.
                (matched * 2 >= terms.len()).then_some((score, entry))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.usage_count.cmp(&a.1.usage_count))
        });
        Ok(scored.into_iter().map(|(_, e)| e).collect())
    }

    fn record_usage(&self, id: i64) -> Result<(), VaultError> {
        let changed = self.conn.execute(
            "UPDATE commands SET usage_count = usage_count + 1, last_used = ?1 WHERE id = ?2",
            params![now_secs(), id],
        )?;
        if changed == 0 {
            return Err(VaultError::NotFound(id));
        }
        Ok(())
    }

    fn save(&self, entry: &NewEntry) -> Result<i64, VaultError> {
        if let Some(existing) = self.find_by_commands(&entry.commands)? {
            return Ok(existing.id);
        }
        self.add(entry)
    }
}

fn init_db(conn: &Connection) -> Result<(), VaultError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS commands (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT,
            commands TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            tags TEXT NOT NULL DEFAULT '[]',
            usage_count INTEGER NOT NULL DEFAULT 0,
            last_used INTEGER,
            created_at INTEGER NOT NULL,
            confidence REAL NOT NULL,
            source TEXT NOT NULL,
            variables TEXT
        )",
        [],
    )?;
    Ok(())
}

struct RawEntry {
    id: i64,
    name: Option<String>,
    commands: String,
    description: String,
    tags: String,
    usage_count: u32,
    last_used: Option<i64>,
    created_at: i64,
    confidence: f64,
    source: String,
    variables: Option<String>,
}

fn row_to_raw(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        commands: row.get(2)?,
        description: row.get(3)?,
        tags: row.get(4)?,
        usage_count: row.get(5)?,
        last_used: row.get(6)?,
        created_at: row.get(7)?,
        confidence: row.get(8)?,
        source: row.get(9)?,
        variables: row.get(10)?,
    })
}

impl RawEntry {
    fn into_entry(self) -> Result<CommandEntry, VaultError> {
        let commands: Vec<String> =
            serde_json::from_str(&self.commands).map_err(|e| VaultError::Corrupt(e.to_string()))?;
        if commands.is_empty() {
            return Err(VaultError::Corrupt(format!("entry {} has no commands", self.id)));
        }
        let source = Source::parse(&self.source)
            .ok_or_else(|| VaultError::Corrupt(format!("unknown source '{}'", self.source)))?;
        Ok(CommandEntry {
            id: self.id,
            name: self.name,
            commands,
            description: self.description,
            tags: serde_json::from_str(&self.tags).unwrap_or_default(),
            usage_count: self.usage_count,
            last_used: self.last_used,
            created_at: self.created_at,
            confidence: self.confidence,
            source,
            variables: self
                .variables
                .and_then(|v| serde_json::from_str(&v).ok()),
        })
    }
}

const STOP_WORDS: &[&str] = &[
    "a", "all", "an", "and", "any", "are", "can", "do", "for", "from", "give", "how", "i", "in",
    "into", "is", "it", "me", "my", "of", "on", "please", "show", "some", "that", "the", "then",
    "this", "to", "what", "with", "you",
];

fn tokenize(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric() && c != '-' && c != '_')
        .map(|t| t.trim_matches('-').to_lowercase())
        .filter(|t| t.len() > 1 && !STOP_WORDS.contains(&t.as_str()))
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

/// Weighted score and number of distinct terms that hit anything. Name hits
/// weigh 3, tag and description hits 2, command hits 1.
fn relevance(entry: &CommandEntry, terms: &[String]) -> (u32, usize) {
    let name = entry.name.as_deref().map(tokenize).unwrap_or_default();
    let tags: Vec<String> = entry.tags.iter().flat_map(|t| tokenize(t)).collect();
    let description = tokenize(&entry.description);
    let commands: Vec<String> = entry.commands.iter().flat_map(|c| tokenize(c)).collect();

    let scores: Vec<u32> = terms
        .iter()
        .map(|term| {
            let mut score = 0;
            if name.contains(term) {
                score += 3;
            }
            if tags.contains(term) {
                score += 2;
            }
            if description.contains(term) {
                score += 2;
            }
            if commands.contains(term) {
                score += 1;
            }
            score
        })
        .collect();
    let matched = scores.iter().filter(|s| **s > 0).count();
    (scores.iter().sum(), matched)
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
