/*!
Helpers pour le contrat d'upload

Requête: tableau JSON d'enregistrements `{source, timestamp, type, payload}`.
Réponse 2xx: `{"results": [{"success": bool, "message"?: string}, ...]}`,
alignée par position sur la requête.
Réponse 429: `{"msBeforeNext": <ms>}`.
*/

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};

/// Vérifie qu'un enregistrement reçu respecte le contrat
pub fn assert_upload_record(record: &Value) -> Result<()> {
    let Some(object) = record.as_object() else {
        bail!("record is not an object: {}", record);
    };

    if !object.get("source").is_some_and(Value::is_string) {
        bail!("record.source must be a string");
    }
    if !object.get("timestamp").is_some_and(|t| t.is_i64() || t.is_u64()) {
        bail!("record.timestamp must be an integer (ms since epoch)");
    }
    if !object.get("type").is_some_and(Value::is_string) {
        bail!("record.type must be a string");
    }
    if !object.contains_key("payload") {
        bail!("record.payload is missing");
    }

    let unexpected: Vec<&String> = object
        .keys()
        .filter(|k| !matches!(k.as_str(), "source" | "timestamp" | "type" | "payload"))
        .collect();
    if !unexpected.is_empty() {
        bail!("unexpected record fields: {:?}", unexpected);
    }
    Ok(())
}

/// Corps d'une réponse d'acquittement
pub fn results_body(results: &[(bool, Option<&str>)]) -> Value {
    let results: Vec<Value> = results
        .iter()
        .map(|(success, message)| {
            let mut item = Map::new();
            item.insert("success".to_string(), Value::Bool(*success));
            if let Some(message) = message {
                item.insert("message".to_string(), Value::String(message.to_string()));
            }
            Value::Object(item)
        })
        .collect();
    json!({ "results": results })
}

pub fn rate_limit_body(ms_before_next: u64) -> Value {
    json!({ "msBeforeNext": ms_before_next })
}

/// Lit un champ imbriqué (`payload.hosts`)
pub fn field<'a>(value: &'a Value, field_path: &str) -> Option<&'a Value> {
    field_path
        .split('.')
        .try_fold(value, |current, key| current.get(key))
}
