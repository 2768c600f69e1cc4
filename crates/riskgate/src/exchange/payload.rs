//! Text extraction from request and completion bodies

use serde_json::{Map, Value};

type Object = Map<String, Value>;

/// A JSON object, with a literal `null` read as an empty one
fn parse_object(body: &[u8]) -> Result<Object, serde_json::Error> {
    serde_json::from_slice::<Option<Object>>(body).map(Option::unwrap_or_default)
}

/// Prompt text of a completion request. Missing or non-string `prompt` is `""`.
pub fn extract_prompt(body: &[u8]) -> Result<String, serde_json::Error> {
    let object = parse_object(body)?;
    Ok(object
        .get("prompt")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}

/// First generated text of a completion response (`choices[0].text`).
pub fn extract_completion_text(body: &[u8]) -> Result<String, serde_json::Error> {
    let object = parse_object(body)?;
    Ok(object
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}
