//! Keyword-triggered retrieval of character and world knowledge.

use narrative_storage::{Character, WorldItem};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CharacterHit {
    pub name: String,
    pub archetype: Option<String>,
    pub goals: Vec<String>,
    pub current_status: Option<String>,
    pub current_mood: Option<String>,
    pub high_importance_memories: Vec<String>,
    pub relationships: serde_json::Value,
    pub matched_keywords: Vec<String>,
    pub hit_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorldItemHit {
    pub kind: String,
    pub name: String,
    pub description: String,
    pub properties: serde_json::Value,
    pub matched_keywords: Vec<String>,
    pub hit_count: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct LorebookScan {
    pub world: Vec<WorldItemHit>,
    pub character: Vec<CharacterHit>,
}

/// Substring-matches each entry's `lorebook_keywords` (or, if empty, the
/// entry's name as an implicit single keyword) against a lowercased probe
/// text. Entries with zero hits are dropped; survivors are sorted by hit
/// count descending with ties broken by insertion order (a stable sort).
pub fn scan(characters: &[Character], world_items: &[WorldItem], text: &str, max_world: usize, max_character: usize) -> LorebookScan {
    let probe = text.to_lowercase();

    let mut character_hits: Vec<(usize, CharacterHit)> = characters
        .iter()
        .filter_map(|c| {
            let keywords = keywords_for(&c.lorebook_keywords, &c.name);
            let matched = matched_keywords(&keywords, &probe);
            if matched.is_empty() {
                return None;
            }
            let hit_count = matched.len();
            Some((
                hit_count,
                CharacterHit {
                    name: c.name.clone(),
                    archetype: c.archetype.clone(),
                    goals: parse_string_list(&c.goals),
                    current_status: c.current_status.clone(),
                    current_mood: c.current_mood.clone(),
                    high_importance_memories: high_importance_memories(&c.memories),
                    relationships: serde_json::from_str(&c.relationships).unwrap_or(serde_json::Value::Null),
                    matched_keywords: matched,
                    hit_count,
                },
            ))
        })
        .collect();
    character_hits.sort_by(|a, b| b.0.cmp(&a.0));
    character_hits.truncate(max_character);

    let mut world_hits: Vec<(usize, WorldItemHit)> = world_items
        .iter()
        .filter_map(|w| {
            let keywords = keywords_for(&w.lorebook_keywords, &w.name);
            let matched = matched_keywords(&keywords, &probe);
            if matched.is_empty() {
                return None;
            }
            let hit_count = matched.len();
            Some((
                hit_count,
                WorldItemHit {
                    kind: w.kind.clone(),
                    name: w.name.clone(),
                    description: w.description.clone(),
                    properties: serde_json::from_str(&w.properties).unwrap_or(serde_json::Value::Null),
                    matched_keywords: matched,
                    hit_count,
                },
            ))
        })
        .collect();
    world_hits.sort_by(|a, b| b.0.cmp(&a.0));
    world_hits.truncate(max_world);

    LorebookScan {
        world: world_hits.into_iter().map(|(_, hit)| hit).collect(),
        character: character_hits.into_iter().map(|(_, hit)| hit).collect(),
    }
}

/// Unconditional bounded slice of every character/world item, used when no
/// probe text is available to scan against.
pub fn full_slice(characters: &[Character], world_items: &[WorldItem], max_world: usize, max_character: usize) -> LorebookScan {
    let character = characters
        .iter()
        .take(max_character)
        .map(|c| CharacterHit {
            name: c.name.clone(),
            archetype: c.archetype.clone(),
            goals: parse_string_list(&c.goals),
            current_status: c.current_status.clone(),
            current_mood: c.current_mood.clone(),
            high_importance_memories: high_importance_memories(&c.memories),
            relationships: serde_json::from_str(&c.relationships).unwrap_or(serde_json::Value::Null),
            matched_keywords: Vec::new(),
            hit_count: 0,
        })
        .collect();

    let world = world_items
        .iter()
        .take(max_world)
        .map(|w| WorldItemHit {
            kind: w.kind.clone(),
            name: w.name.clone(),
            description: w.description.clone(),
            properties: serde_json::from_str(&w.properties).unwrap_or(serde_json::Value::Null),
            matched_keywords: Vec::new(),
            hit_count: 0,
        })
        .collect();

    LorebookScan { world, character }
}

fn keywords_for(lorebook_keywords_json: &str, name: &str) -> Vec<String> {
    let keywords: Vec<String> = serde_json::from_str(lorebook_keywords_json).unwrap_or_default();
    if keywords.is_empty() {
        vec![name.to_string()]
    } else {
        keywords
    }
}

fn matched_keywords(keywords: &[String], lowercase_probe: &str) -> Vec<String> {
    keywords
        .iter()
        .filter(|kw| lowercase_probe.contains(&kw.to_lowercase()))
        .cloned()
        .collect()
}

fn parse_string_list(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}

#[derive(serde::Deserialize)]
struct Memory {
    content: String,
    importance: String,
    #[serde(default)]
    event: Option<String>,
}

fn high_importance_memories(memories_json: &str) -> Vec<String> {
    let memories: Vec<Memory> = serde_json::from_str(memories_json).unwrap_or_default();
    memories
        .into_iter()
        .filter(|m| m.importance == "high")
        .map(|m| m.content)
        .take(3)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn world_item(id: i64, name: &str, keywords: &[&str]) -> WorldItem {
        WorldItem {
            id,
            project_id: 1,
            kind: "item".into(),
            name: name.into(),
            description: format!("{name} description"),
            properties: "{}".into(),
            lorebook_keywords: serde_json::to_string(keywords).unwrap(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn lorebook_keyword_hit_counts_scenario() {
        let a = world_item(1, "A", &["sword", "blade"]);
        let b = world_item(2, "B", &["sword"]);

        let scan = scan(&[], &[a, b], "he drew his sword and raised the blade", 8, 5);

        assert_eq!(scan.world.len(), 2);
        assert_eq!(scan.world[0].name, "A");
        assert_eq!(scan.world[0].hit_count, 2);
        assert_eq!(scan.world[1].name, "B");
        assert_eq!(scan.world[1].hit_count, 1);
    }

    #[test]
    fn entries_without_keywords_use_name_as_implicit_keyword() {
        let item = world_item(1, "Excalibur", &[]);
        let scan = scan(&[], &[item], "she found excalibur in the lake", 8, 5);
        assert_eq!(scan.world.len(), 1);
        assert_eq!(scan.world[0].hit_count, 1);
    }

    #[test]
    fn entries_with_zero_hits_are_dropped() {
        let item = world_item(1, "A", &["dragon"]);
        let scan = scan(&[], &[item], "nothing relevant here", 8, 5);
        assert!(scan.world.is_empty());
    }

    #[test]
    fn truncates_to_per_kind_maximum() {
        let items: Vec<WorldItem> = (0..10).map(|i| world_item(i, &format!("Item{i}"), &["sword"])).collect();
        let scan = scan(&[], &items, "a sword", 3, 5);
        assert_eq!(scan.world.len(), 3);
    }
}
