//! Reduce step: fold every Phase 1 result into one six-section profile.
//!
//! The profile always carries all six sections. Unparsable oracle output is
//! replaced by generic text and an oracle failure by an error profile, so
//! callers never see a partial document.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::phase1::Phase1Result;
use crate::error::AnalysisError;
use crate::llm::{extract_json, LlmClient, OracleRequest, TokenUsage};

pub const SECTION_KEYS: [&str; 6] = [
    "meta",
    "L1_Spatio_Temporal",
    "L3_Social_Graph",
    "L4_Behavior_Trends",
    "L5_Psychology",
    "L6_Hooks",
];

const FAILED: &str = "analysis failed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaSection {
    #[serde(default)]
    pub scan_summary: Value,
    #[serde(default)]
    pub timeline_chapters: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatioTemporalSection {
    #[serde(default)]
    pub life_radius: Value,
    #[serde(default)]
    pub biological_clock: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialGraphSection {
    #[serde(default)]
    pub core_circle: Value,
    #[serde(default)]
    pub relationship_dynamics: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorTrendsSection {
    #[serde(default)]
    pub social_mask: Value,
    #[serde(default)]
    pub consumption_shift: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsychologySection {
    #[serde(default)]
    pub personality_type: Value,
    #[serde(default)]
    pub emotional_curve: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HooksSection {
    #[serde(default)]
    pub story_trigger: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase2Profile {
    pub meta: MetaSection,
    #[serde(rename = "L1_Spatio_Temporal")]
    pub spatio_temporal: SpatioTemporalSection,
    #[serde(rename = "L3_Social_Graph")]
    pub social_graph: SocialGraphSection,
    #[serde(rename = "L4_Behavior_Trends")]
    pub behavior_trends: BehaviorTrendsSection,
    #[serde(rename = "L5_Psychology")]
    pub psychology: PsychologySection,
    #[serde(rename = "L6_Hooks")]
    pub hooks: HooksSection,
    /// Oracle text exactly as returned.
    #[serde(default)]
    pub raw_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Any further top-level keys the oracle produced.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn text(s: impl Into<String>) -> Value {
    Value::String(s.into())
}

/// Generic profile used when the oracle's text cannot be parsed.
pub fn fallback_profile(raw: &str) -> Phase2Profile {
    let preview: String = raw.chars().take(100).collect();
    Phase2Profile {
        meta: MetaSection {
            scan_summary: text(format!("Summary of analysis: {}...", preview)),
            timeline_chapters: json!(["Timeline analysis complete"]),
            extra: Map::new(),
        },
        spatio_temporal: SpatioTemporalSection {
            life_radius: text("Activity range inferred from photo GPS data"),
            biological_clock: text("Daily rhythm inferred from photo capture times"),
            extra: Map::new(),
        },
        social_graph: SocialGraphSection {
            core_circle: json!(["Core social circle inferred from how often people appear"]),
            relationship_dynamics: json!([]),
            extra: Map::new(),
        },
        behavior_trends: BehaviorTrendsSection {
            social_mask: text("Social persona inferred from photo content"),
            consumption_shift: text("Consumption changes inferred from shopping and dining scenes"),
            extra: Map::new(),
        },
        psychology: PsychologySection {
            personality_type: text("Personality type inferred from photo content"),
            emotional_curve: text("Emotional curve inferred from photo content"),
            extra: Map::new(),
        },
        hooks: HooksSection {
            story_trigger: text("Story triggers inferred from photo content"),
            extra: Map::new(),
        },
        raw_output: raw.to_string(),
        error: None,
        extra: Map::new(),
    }
}

/// Profile recorded when the Phase 2 oracle call itself failed.
pub fn error_profile(image_count: usize, error: &str) -> Phase2Profile {
    Phase2Profile {
        meta: MetaSection {
            scan_summary: text(format!("Analyzed {} images", image_count)),
            timeline_chapters: json!([FAILED]),
            extra: Map::new(),
        },
        spatio_temporal: SpatioTemporalSection {
            life_radius: text(FAILED),
            biological_clock: text(FAILED),
            extra: Map::new(),
        },
        social_graph: SocialGraphSection {
            core_circle: json!([]),
            relationship_dynamics: json!([]),
            extra: Map::new(),
        },
        behavior_trends: BehaviorTrendsSection {
            social_mask: text(FAILED),
            consumption_shift: text(FAILED),
            extra: Map::new(),
        },
        psychology: PsychologySection {
            personality_type: text(FAILED),
            emotional_curve: text(FAILED),
            extra: Map::new(),
        },
        hooks: HooksSection {
            story_trigger: text(FAILED),
            extra: Map::new(),
        },
        raw_output: String::new(),
        error: Some(error.to_string()),
        extra: Map::new(),
    }
}

/// Parse oracle text into a profile. Sections the oracle left out are taken
/// from the generic fallback.
pub fn parse_profile(raw: &str) -> Result<Phase2Profile, AnalysisError> {
    let json_str = extract_json(raw)
        .ok_or_else(|| AnalysisError::ProfileParseFailed("no JSON document in output".into()))?;

    let mut document = match serde_json::from_str::<Value>(json_str) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            return Err(AnalysisError::ProfileParseFailed(
                "top-level JSON is not an object".into(),
            ))
        }
        Err(e) => return Err(AnalysisError::ProfileParseFailed(e.to_string())),
    };

    let missing: Vec<&str> = SECTION_KEYS
        .iter()
        .copied()
        .filter(|k| !document.contains_key(*k))
        .collect();
    if !missing.is_empty() {
        tracing::warn!(?missing, "profile is missing sections, using generic text");
        let fallback = serde_json::to_value(fallback_profile(raw))
            .map_err(|e| AnalysisError::ProfileParseFailed(e.to_string()))?;
        for key in missing {
            document.insert(key.to_string(), fallback[key].clone());
        }
    }

    document.insert("raw_output".to_string(), Value::String(raw.to_string()));
    document.remove("error");

    serde_json::from_value(Value::Object(document))
        .map_err(|e| AnalysisError::ProfileParseFailed(e.to_string()))
}

pub struct Phase2Reducer {
    llm: LlmClient,
}

impl Phase2Reducer {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    /// One block per batch: id, photo count, time range and summary.
    pub fn digest(results: &[Phase1Result]) -> String {
        results
            .iter()
            .map(|r| {
                let summary = if r.summary.is_empty() { "none" } else { &r.summary };
                format!(
                    "**Batch {}**:\n- Photo count: {}\n- Time range: {} to {}\n- Summary: {}\n",
                    r.batch_id, r.image_count, r.time_range.start, r.time_range.end, summary
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn build_request(&self, results: &[Phase1Result], prompt: &str) -> OracleRequest {
        OracleRequest::new()
            .text(prompt)
            .text(format!("\n\n**Phase 1 results**:\n{}", Self::digest(results)))
    }

    /// Blocking. Always returns a complete profile.
    pub fn reduce(&self, results: &[Phase1Result], prompt: &str) -> (Phase2Profile, TokenUsage) {
        let request = self.build_request(results, prompt);
        let image_count: usize = results.iter().map(|r| r.image_count).sum();

        let response = match self.llm.generate(&request) {
            Ok(response) if response.text.trim().is_empty() => {
                let e = AnalysisError::OracleCallFailed("oracle returned no content".into());
                tracing::error!(error = %e, "profile synthesis failed");
                return (error_profile(image_count, &e.to_string()), response.usage);
            }
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "profile synthesis failed");
                return (error_profile(image_count, &e.to_string()), TokenUsage::default());
            }
        };

        let raw = response.text.trim();
        let profile = match parse_profile(raw) {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(error = %e, "falling back to generic profile");
                fallback_profile(raw)
            }
        };

        tracing::info!(
            batches = results.len(),
            total_tokens = response.usage.total,
            "profile synthesised"
        );
        (profile, response.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::TimeRange;
    use crate::llm::{LlmProvider, OracleResponse, RequestPart};
    use std::sync::Arc;

    struct Scripted(Result<String, String>);

    impl LlmProvider for Scripted {
        fn generate(&self, _request: &OracleRequest) -> anyhow::Result<OracleResponse> {
            match &self.0 {
                Ok(text) => Ok(OracleResponse {
                    text: text.clone(),
                    usage: TokenUsage { total: 5, prompt: 4, completion: 1 },
                }),
                Err(e) => Err(anyhow::anyhow!(e.clone())),
            }
        }

        fn provider_name(&self) -> &'static str {
            "scripted"
        }
    }

    fn reducer(reply: Result<&str, &str>) -> Phase2Reducer {
        let reply = reply.map(str::to_string).map_err(str::to_string);
        Phase2Reducer::new(LlmClient::with_provider(Arc::new(Scripted(reply))))
    }

    fn result(batch_id: &str, count: usize, summary: &str) -> Phase1Result {
        Phase1Result {
            batch_id: batch_id.to_string(),
            raw_output: summary.to_string(),
            summary: summary.to_string(),
            image_count: count,
            time_range: TimeRange {
                start: "2024-01-01T00:00:00".to_string(),
                end: "2024-01-31T00:00:00".to_string(),
            },
            usage: TokenUsage::default(),
            processed_at: "2024-02-01T00:00:00".to_string(),
            failed: false,
        }
    }

    fn assert_all_sections(profile: &Phase2Profile) {
        let value = serde_json::to_value(profile).unwrap();
        for key in SECTION_KEYS {
            assert!(value[key].is_object(), "section {} missing", key);
        }
        assert!(value.get("raw_output").is_some());
    }

    const FULL: &str = r#"{
        "meta": {"scan_summary": "A year of travel", "timeline_chapters": ["spring", "summer"]},
        "L1_Spatio_Temporal": {"life_radius": "city centre", "biological_clock": "early riser"},
        "L3_Social_Graph": {"core_circle": ["partner"], "relationship_dynamics": []},
        "L4_Behavior_Trends": {"social_mask": "outgoing", "consumption_shift": "more dining out"},
        "L5_Psychology": {"personality_type": "ENFP", "emotional_curve": "steady"},
        "L6_Hooks": {"story_trigger": "the trip to Kyoto"},
        "confidence": 0.7
    }"#;

    #[test]
    fn test_fenced_json_is_parsed() {
        let raw = format!("Here you go:\n```json\n{}\n```\nThanks", FULL);
        let (profile, usage) = reducer(Ok(&raw)).reduce(&[result("2024-01", 3, "x")], "P");

        assert_eq!(profile.meta.scan_summary, "A year of travel");
        assert_eq!(profile.psychology.personality_type, "ENFP");
        assert_eq!(profile.extra["confidence"], 0.7);
        assert_eq!(profile.raw_output, raw.trim());
        assert!(profile.error.is_none());
        assert_eq!(usage.total, 5);
    }

    #[test]
    fn test_bare_json_is_parsed() {
        let (profile, _) = reducer(Ok(FULL)).reduce(&[], "P");
        assert_eq!(profile.hooks.story_trigger, "the trip to Kyoto");
    }

    #[test]
    fn test_prose_falls_back_to_generic_profile() {
        let (profile, _) = reducer(Ok("The user seems to enjoy hiking.")).reduce(&[], "P");
        assert_all_sections(&profile);
        assert_eq!(
            profile.meta.scan_summary,
            "Summary of analysis: The user seems to enjoy hiking...."
        );
        assert_eq!(profile.raw_output, "The user seems to enjoy hiking.");
    }

    #[test]
    fn test_missing_sections_are_filled() {
        let profile = parse_profile(r#"{"meta": {"scan_summary": "only meta"}}"#).unwrap();
        assert_all_sections(&profile);
        assert_eq!(profile.meta.scan_summary, "only meta");
        assert_eq!(
            profile.hooks.story_trigger,
            "Story triggers inferred from photo content"
        );
    }

    #[test]
    fn test_non_object_section_is_a_parse_failure() {
        let err = parse_profile(r#"{"meta": "oops"}"#).unwrap_err();
        assert!(matches!(err, AnalysisError::ProfileParseFailed(_)));
    }

    #[test]
    fn test_oracle_failure_yields_error_profile() {
        let (profile, usage) = reducer(Err("connection refused"))
            .reduce(&[result("2024-01", 3, "a"), result("2024-02", 4, "b")], "P");

        assert_all_sections(&profile);
        assert_eq!(profile.error.as_deref(), Some("connection refused"));
        assert_eq!(profile.meta.scan_summary, "Analyzed 7 images");
        assert_eq!(profile.spatio_temporal.life_radius, "analysis failed");
        assert_eq!(usage, TokenUsage::default());
    }

    #[test]
    fn test_request_carries_digest() {
        let r = reducer(Ok(FULL));
        let request = r.build_request(&[result("2024-01", 3, ""), result("2024-02", 1, "park")], "P");
        assert_eq!(request.parts.len(), 2);
        match &request.parts[1] {
            RequestPart::Text(t) => {
                assert!(t.starts_with("\n\n**Phase 1 results**:\n**Batch 2024-01**:\n- Photo count: 3\n"));
                assert!(t.contains("- Time range: 2024-01-01T00:00:00 to 2024-01-31T00:00:00\n"));
                assert!(t.contains("- Summary: none\n"));
                assert!(t.contains("- Summary: park\n"));
            }
            other => panic!("unexpected part {:?}", other),
        }
    }
}
