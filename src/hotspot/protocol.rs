use super::Hotspot;
use serde::{Deserialize, Serialize};

/// Server → Client hotspot messages (payload of the `hotspots` topic)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HotspotPush {
    Upsert { hotspot: Hotspot },
    Remove { id: String },
    Batch { hotspots: Vec<Hotspot> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_upsert() {
        let push: HotspotPush = serde_json::from_value(json!({
            "type": "upsert",
            "hotspot": {
                "id": "hs-1",
                "category": "sim_swap",
                "location": {"lat": 6.52, "lon": 3.37},
                "risk_score": 0.8,
                "created_at": "2026-03-01T10:00:00Z",
                "valid_for_minutes": 60
            }
        }))
        .unwrap();

        match push {
            HotspotPush::Upsert { hotspot } => {
                assert_eq!(hotspot.id, "hs-1");
                assert!(hotspot.properties.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_remove_and_reject_unknown() {
        let push: HotspotPush =
            serde_json::from_value(json!({"type": "remove", "id": "hs-2"})).unwrap();
        assert_eq!(push, HotspotPush::Remove { id: "hs-2".into() });

        let unknown = serde_json::from_value::<HotspotPush>(json!({"type": "explode"}));
        assert!(unknown.is_err());
    }
}
