use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single entry in a collection's JSONL file.
///
/// The first line of every file is a `Header`; each following line is one
/// `Record`. The `type` field is the JSON tag for deserialization.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum CollectionEntry {
    #[serde(rename = "collection")]
    Header {
        version: u32,
        created: String,
        name: String,
    },
    #[serde(rename = "record")]
    Record {
        id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Map<String, Value>,
    },
}

/// A memory record as seen by callers and (read-only) by scripts.
///
/// `score` is present only on records returned from a search; stored records
/// never carry one. The sandbox only ever receives copies of this struct —
/// scripts cannot mutate stored memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub id: String,
    pub collection: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_round_trip() {
        let entry = CollectionEntry::Record {
            id: "abc".to_string(),
            content: "prefers dark mode".to_string(),
            metadata: Map::new(),
        };
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"type\":\"record\""));
        // Empty metadata is omitted from the line
        assert!(!line.contains("metadata"));
        let back: CollectionEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_record_score_omitted_when_absent() {
        let record = MemoryRecord {
            id: "r1".to_string(),
            collection: "memories".to_string(),
            content: "hello".to_string(),
            metadata: Map::new(),
            score: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("score").is_none());
    }

    #[test]
    fn test_record_score_present_on_search_results() {
        let record = MemoryRecord {
            id: "r1".to_string(),
            collection: "memories".to_string(),
            content: "hello".to_string(),
            metadata: json!({"tag": "greeting"}).as_object().unwrap().clone(),
            score: Some(0.5),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["score"], 0.5);
        assert_eq!(json["metadata"]["tag"], "greeting");
    }
}
