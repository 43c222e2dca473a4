//! Derived scores from the scoring pass.
//!
//! The scoring pass is expected to answer with a JSON object holding one
//! numeric field per configured metric:
//!
//! ```json
//! {"documentation_score": 85, "functionality_score": 90, "style_score": 80, "overall_score": 85}
//! ```
//!
//! The object may be wrapped in prose or a fenced code block. A fenced
//! block wins; otherwise the first `{` that starts a complete JSON object is
//! used, so braces in the surrounding prose are skipped. Extra fields are
//! ignored. A
//! missing or non-numeric required field rejects the whole payload, and
//! nothing is saved.

use crate::error::ScoreError;
use crate::models::{AnalysisRecord, Score};
use crate::store::ArtifactStore;

pub struct ScoreAggregator<'a> {
    store: &'a dyn ArtifactStore,
    scoring_pass: &'a str,
    fields: &'a [String],
}

impl<'a> ScoreAggregator<'a> {
    pub fn new(store: &'a dyn ArtifactStore, scoring_pass: &'a str, fields: &'a [String]) -> Self {
        Self {
            store,
            scoring_pass,
            fields,
        }
    }

    /// Parse the latest scoring result for `record` and persist its metrics.
    pub async fn compute_scores(&self, record: &AnalysisRecord) -> Result<Vec<Score>, ScoreError> {
        let result = self
            .store
            .latest_result(record.id, self.scoring_pass)
            .await?
            .ok_or_else(|| ScoreError::MissingScoringResult(self.scoring_pass.to_string()))?;

        let payload = match &result.output {
            crate::models::PassOutput::Findings(v) => v.clone(),
            crate::models::PassOutput::Text(text) => extract_json_object(text)?,
        };
        let scores = parse_scores(&payload, self.fields)?;
        self.store.save_scores(record.id, &scores).await?;
        Ok(scores)
    }
}

/// Locate and parse the JSON object in free text.
pub fn extract_json_object(text: &str) -> Result<serde_json::Value, ScoreError> {
    if let Some(body) = fenced_block(text) {
        if let Ok(value @ serde_json::Value::Object(_)) =
            serde_json::from_str::<serde_json::Value>(body.trim())
        {
            return Ok(value);
        }
    }

    let mut last_error = None;
    for (start, _) in text.match_indices('{') {
        let mut stream =
            serde_json::Deserializer::from_str(&text[start..]).into_iter::<serde_json::Value>();
        match stream.next() {
            Some(Ok(value @ serde_json::Value::Object(_))) => return Ok(value),
            Some(Err(e)) => last_error = Some(e.to_string()),
            _ => {}
        }
    }
    Err(ScoreError::InvalidJson(
        last_error.unwrap_or_else(|| "no JSON object found".to_string()),
    ))
}

/// Body of the first ``` fenced block, with any language tag dropped.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after = &text[open + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

/// Pull every required metric out of `payload`, in `fields` order.
pub fn parse_scores(payload: &serde_json::Value, fields: &[String]) -> Result<Vec<Score>, ScoreError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| ScoreError::InvalidJson("payload is not an object".to_string()))?;

    fields
        .iter()
        .map(|field| {
            let value = obj
                .get(field)
                .ok_or_else(|| ScoreError::MissingField(field.clone()))?;
            let number = value.as_f64().ok_or_else(|| ScoreError::NotNumeric {
                field: field.clone(),
                value: value.to_string(),
            })?;
            Ok(Score {
                metric: field.clone(),
                value: number,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_score_fields;

    #[test]
    fn accepts_fenced_json() {
        let text = "Here you go:\n```json\n{\"documentation_score\": 85, \"functionality_score\": 90, \"style_score\": 80, \"overall_score\": 85.5}\n```";
        let payload = extract_json_object(text).unwrap();
        let scores = parse_scores(&payload, &default_score_fields()).unwrap();
        assert_eq!(scores.len(), 4);
        assert_eq!(scores[3].metric, "overall_score");
        assert_eq!(scores[3].value, 85.5);
    }

    #[test]
    fn missing_overall_score_is_rejected() {
        let payload = serde_json::json!({
            "documentation_score": 85,
            "functionality_score": 90,
            "style_score": 80
        });
        match parse_scores(&payload, &default_score_fields()) {
            Err(ScoreError::MissingField(f)) => assert_eq!(f, "overall_score"),
            other => panic!("expected MissingField, got {:?}", other),
        }
    }

    #[test]
    fn string_numbers_are_not_numeric() {
        let payload = serde_json::json!({"overall_score": "85"});
        let fields = vec!["overall_score".to_string()];
        assert!(matches!(
            parse_scores(&payload, &fields),
            Err(ScoreError::NotNumeric { .. })
        ));
    }

    #[test]
    fn braces_in_prose_do_not_hide_the_payload() {
        let text = "The method `run() { }` is fine.\n```json\n{\"documentation_score\": 85, \"functionality_score\": 90, \"style_score\": 80, \"overall_score\": 85}\n```";
        let payload = extract_json_object(text).unwrap();
        assert_eq!(payload["overall_score"], 85);

        let unfenced = "Given `if ($x) { return; }`, I score it {\"overall_score\": 70} overall.";
        let payload = extract_json_object(unfenced).unwrap();
        assert_eq!(payload["overall_score"], 70);
    }

    #[test]
    fn prose_without_object_is_invalid() {
        assert!(matches!(
            extract_json_object("I would rate this an 8/10."),
            Err(ScoreError::InvalidJson(_))
        ));
    }
}
