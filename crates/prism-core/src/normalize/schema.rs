//! Field defaulting and range checks applied to a parsed stage payload.
//!
//! Every value that had to be changed or invented produces a warning.
//! Sanitizing the serialized output of a previous sanitize is a no-op.

use serde_json::{Map, Value};

use crate::domain::{
    AnnotationKind, CategoryScores, Level, OutputSchema, Section, Severity, StageOutput,
    Suggestion, SuggestionCategory, Summary, VisualAnnotation,
};

/// A sanitized payload plus what was corrected on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    pub output: StageOutput,
    pub warnings: Vec<String>,
    /// Sections present in the payload.
    pub sections: Vec<Section>,
}

/// Sanitize a parsed object against `schema`.
///
/// Fails when the object contains none of the recognised section keys.
pub fn sanitize(value: &Value, schema: OutputSchema) -> Result<Sanitized, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "payload is not an object".to_string())?;

    let sections: Vec<Section> = Section::ALL
        .into_iter()
        .filter(|s| section_value(obj, *s).is_some())
        .collect();
    if sections.is_empty() {
        return Err(format!(
            "no recognised section (expected one of {})",
            Section::ALL.map(|s| s.key()).join(", ")
        ));
    }

    let mut warnings = Vec::new();
    for expected in schema.expected_sections() {
        if !sections.contains(expected) {
            warnings.push(format!("expected section `{}` is missing", expected.key()));
        }
    }

    let visual_annotations = match section_value(obj, Section::VisualAnnotations) {
        Some(v) => sanitize_annotations(v, &mut warnings),
        None => Vec::new(),
    };
    let suggestions = match section_value(obj, Section::Suggestions) {
        Some(v) => sanitize_suggestions(v, &mut warnings),
        None => Vec::new(),
    };
    let summary = match section_value(obj, Section::Summary) {
        Some(v) => sanitize_summary(v, &mut warnings),
        None => None,
    };

    Ok(Sanitized {
        output: StageOutput {
            visual_annotations,
            suggestions,
            summary,
        },
        warnings,
        sections,
    })
}

fn section_value(obj: &Map<String, Value>, section: Section) -> Option<&Value> {
    section.aliases().iter().find_map(|key| obj.get(*key))
}

/// Items of an array-valued field; null becomes empty with a warning.
fn array_items<'a>(value: &'a Value, path: &str, warnings: &mut Vec<String>) -> &'a [Value] {
    match value {
        Value::Array(items) => items,
        Value::Null => {
            warnings.push(format!("{path} was null; using []"));
            &[]
        }
        _ => {
            warnings.push(format!("{path} was not an array; using []"));
            &[]
        }
    }
}

fn sanitize_annotations(value: &Value, warnings: &mut Vec<String>) -> Vec<VisualAnnotation> {
    array_items(value, "visualAnnotations", warnings)
        .iter()
        .enumerate()
        .filter_map(|(i, item)| {
            let path = format!("visualAnnotations[{i}]");
            let Some(obj) = item.as_object() else {
                warnings.push(format!("{path} was not an object; dropped"));
                return None;
            };
            // Coordinates may be flat or nested under `boundingBox`.
            let bbox = obj
                .get("boundingBox")
                .and_then(Value::as_object)
                .unwrap_or(obj);

            Some(VisualAnnotation {
                id: id_field(obj, "annotation", i, &path, warnings),
                kind: enum_field(obj, "type", &path, warnings, parse_annotation_kind),
                x: bounded_f64(bbox, "x", 0.0, 100.0, &path, warnings),
                y: bounded_f64(bbox, "y", 0.0, 100.0, &path, warnings),
                width: bounded_f64(bbox, "width", 0.0, 100.0, &path, warnings),
                height: bounded_f64(bbox, "height", 0.0, 100.0, &path, warnings),
                title: string_field(obj, "title", &path, warnings),
                description: string_field(obj, "description", &path, warnings),
                severity: enum_field(obj, "severity", &path, warnings, parse_severity),
                confidence: bounded_f64(obj, "confidence", 0.0, 1.0, &path, warnings),
            })
        })
        .collect()
}

fn sanitize_suggestions(value: &Value, warnings: &mut Vec<String>) -> Vec<Suggestion> {
    array_items(value, "suggestions", warnings)
        .iter()
        .enumerate()
        .filter_map(|(i, item)| {
            let path = format!("suggestions[{i}]");
            let Some(obj) = item.as_object() else {
                warnings.push(format!("{path} was not an object; dropped"));
                return None;
            };
            Some(Suggestion {
                id: id_field(obj, "suggestion", i, &path, warnings),
                category: enum_field(obj, "category", &path, warnings, parse_category),
                title: string_field(obj, "title", &path, warnings),
                description: string_field(obj, "description", &path, warnings),
                impact: enum_field(obj, "impact", &path, warnings, parse_level),
                effort: enum_field(obj, "effort", &path, warnings, parse_level),
                action_items: string_list(obj, "actionItems", &path, warnings),
            })
        })
        .collect()
}

fn sanitize_summary(value: &Value, warnings: &mut Vec<String>) -> Option<Summary> {
    let obj = match value {
        Value::Object(obj) => obj,
        Value::Null => return None,
        _ => {
            warnings.push("summary was not an object; ignored".to_string());
            return None;
        }
    };
    let path = "summary";

    let scores_obj = obj.get("categoryScores").and_then(Value::as_object);
    let raw_categories: Vec<Option<u8>> = ["usability", "accessibility", "visual", "content"]
        .iter()
        .map(|key| {
            scores_obj.and_then(|s| {
                s.get(*key)
                    .and_then(|v| score_value(v, &format!("{path}.categoryScores.{key}"), warnings))
            })
        })
        .collect();

    let overall_score = match obj
        .get("overallScore")
        .and_then(|v| score_value(v, &format!("{path}.overallScore"), warnings))
    {
        Some(score) => score,
        None => {
            let present: Vec<u32> = raw_categories.iter().flatten().map(|s| *s as u32).collect();
            let derived = if present.is_empty() {
                0
            } else {
                (present.iter().sum::<u32>() as f64 / present.len() as f64).round() as u8
            };
            warnings.push(format!(
                "{path}.overallScore missing; derived {derived} from category scores"
            ));
            derived
        }
    };

    let mut category = |idx: usize, key: &str| -> u8 {
        raw_categories[idx].unwrap_or_else(|| {
            warnings.push(format!(
                "{path}.categoryScores.{key} missing; using overallScore"
            ));
            overall_score
        })
    };
    let category_scores = CategoryScores {
        usability: category(0, "usability"),
        accessibility: category(1, "accessibility"),
        visual: category(2, "visual"),
        content: category(3, "content"),
    };

    Some(Summary {
        overall_score,
        category_scores,
        key_issues: string_list(obj, "keyIssues", path, warnings),
        strengths: string_list(obj, "strengths", path, warnings),
    })
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Finite numbers only; `"NaN"` and `"inf"` count as not numeric.
fn number_value(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

/// A 0-100 score, clamped and rounded. `None` when absent or not numeric.
fn score_value(value: &Value, path: &str, warnings: &mut Vec<String>) -> Option<u8> {
    if value.is_null() {
        return None;
    }
    let Some(n) = number_value(value) else {
        warnings.push(format!("{path} was not a number; ignored"));
        return None;
    };
    if value.is_string() {
        warnings.push(format!("{path} was a string; parsed as {n}"));
    }
    let clamped = n.clamp(0.0, 100.0);
    if clamped != n {
        warnings.push(format!("{path} {n} clamped to {clamped}"));
    }
    Some(clamped.round() as u8)
}

fn bounded_f64(
    obj: &Map<String, Value>,
    key: &str,
    min: f64,
    max: f64,
    path: &str,
    warnings: &mut Vec<String>,
) -> f64 {
    let Some(value) = obj.get(key).filter(|v| !v.is_null()) else {
        return min;
    };
    let Some(n) = number_value(value) else {
        warnings.push(format!("{path}.{key} was not a number; using {min}"));
        return min;
    };
    let clamped = n.clamp(min, max);
    if clamped != n {
        warnings.push(format!("{path}.{key} {n} clamped to {clamped}"));
    }
    clamped
}

fn string_field(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    warnings: &mut Vec<String>,
) -> String {
    match obj.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(_) => {
            warnings.push(format!("{path}.{key} was not a string; using \"\""));
            String::new()
        }
    }
}

fn id_field(
    obj: &Map<String, Value>,
    prefix: &str,
    index: usize,
    path: &str,
    warnings: &mut Vec<String>,
) -> String {
    let id = string_field(obj, "id", path, warnings);
    if id.is_empty() {
        let generated = format!("{prefix}-{}", index + 1);
        warnings.push(format!("{path}.id missing; assigned {generated}"));
        generated
    } else {
        id
    }
}

fn string_list(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    warnings: &mut Vec<String>,
) -> Vec<String> {
    let Some(value) = obj.get(key) else {
        return Vec::new();
    };
    let field = format!("{path}.{key}");
    array_items(value, &field, warnings)
        .iter()
        .filter_map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::String(_) => None,
            _ => {
                warnings.push(format!("{field} contained a non-string entry; dropped"));
                None
            }
        })
        .collect()
}

fn enum_field<T: Default + std::fmt::Debug>(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    warnings: &mut Vec<String>,
    parse: fn(&str) -> Option<T>,
) -> T {
    match obj.get(key) {
        None | Some(Value::Null) => T::default(),
        Some(Value::String(s)) => parse(&s.trim().to_lowercase()).unwrap_or_else(|| {
            let fallback = T::default();
            warnings.push(format!(
                "{path}.{key} `{s}` is not recognised; using {fallback:?}"
            ));
            fallback
        }),
        Some(_) => {
            let fallback = T::default();
            warnings.push(format!("{path}.{key} was not a string; using {fallback:?}"));
            fallback
        }
    }
}

fn parse_annotation_kind(s: &str) -> Option<AnnotationKind> {
    match s {
        "issue" | "problem" => Some(AnnotationKind::Issue),
        "suggestion" | "improvement" => Some(AnnotationKind::Suggestion),
        "success" | "strength" | "positive" => Some(AnnotationKind::Success),
        "info" | "note" => Some(AnnotationKind::Info),
        _ => None,
    }
}

fn parse_severity(s: &str) -> Option<Severity> {
    match s {
        "low" | "minor" => Some(Severity::Low),
        "medium" | "moderate" => Some(Severity::Medium),
        "high" | "major" => Some(Severity::High),
        "critical" | "blocker" => Some(Severity::Critical),
        _ => None,
    }
}

fn parse_category(s: &str) -> Option<SuggestionCategory> {
    match s {
        "usability" | "ux" => Some(SuggestionCategory::Usability),
        "accessibility" | "a11y" => Some(SuggestionCategory::Accessibility),
        "visual" | "design" => Some(SuggestionCategory::Visual),
        "content" | "copy" => Some(SuggestionCategory::Content),
        "other" => Some(SuggestionCategory::Other),
        _ => None,
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s {
        "low" => Some(Level::Low),
        "medium" => Some(Level::Medium),
        "high" => Some(Level::High),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requires_a_recognised_section() {
        let err = sanitize(&json!({"answer": 42}), OutputSchema::Full).unwrap_err();
        assert!(err.contains("no recognised section"));
    }

    #[test]
    fn test_clamps_scores_and_fills_categories() {
        let sanitized = sanitize(
            &json!({"summary": {"overallScore": 150}}),
            OutputSchema::Synthesis,
        )
        .unwrap();
        let summary = sanitized.output.summary.unwrap();
        assert_eq!(summary.overall_score, 100);
        assert_eq!(summary.category_scores, CategoryScores::uniform(100));
        assert!(sanitized.warnings.iter().any(|w| w.contains("clamped")));
        assert_eq!(sanitized.sections, vec![Section::Summary]);
    }

    #[test]
    fn test_annotations_get_ids_and_bounds() {
        let sanitized = sanitize(
            &json!({"annotations": [
                {"type": "ISSUE", "x": -5, "y": 40, "width": 120, "height": 10, "confidence": 3},
                "not an object",
                {"id": "keep-me", "type": "sparkle", "boundingBox": {"x": 1, "y": 2, "width": 3, "height": 4}}
            ]}),
            OutputSchema::Extraction,
        )
        .unwrap();

        let annotations = &sanitized.output.visual_annotations;
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[0].id, "annotation-1");
        assert_eq!(annotations[0].kind, AnnotationKind::Issue);
        assert_eq!(annotations[0].x, 0.0);
        assert_eq!(annotations[0].width, 100.0);
        assert_eq!(annotations[0].confidence, 1.0);
        assert_eq!(annotations[1].id, "keep-me");
        assert_eq!(annotations[1].kind, AnnotationKind::Info);
        assert_eq!(annotations[1].height, 4.0);
        assert!(sanitized.warnings.iter().any(|w| w.contains("dropped")));
        assert!(sanitized.warnings.iter().any(|w| w.contains("sparkle")));
    }

    #[test]
    fn test_non_finite_numbers_fall_back_to_defaults() {
        let sanitized = sanitize(
            &json!({"visualAnnotations": [
                {"id": "a", "x": "NaN", "y": "inf", "width": 10, "height": 10, "confidence": "-infinity"}
            ], "summary": {"overallScore": "NaN"}}),
            OutputSchema::Full,
        )
        .unwrap();

        let annotation = &sanitized.output.visual_annotations[0];
        assert_eq!(annotation.x, 0.0);
        assert_eq!(annotation.y, 0.0);
        assert_eq!(annotation.confidence, 0.0);
        assert!(sanitized
            .warnings
            .iter()
            .any(|w| w.contains(".x was not a number")));

        let again = sanitize(
            &serde_json::to_value(&sanitized.output).unwrap(),
            OutputSchema::Full,
        )
        .unwrap();
        assert_eq!(again.output, sanitized.output);
    }

    #[test]
    fn test_null_arrays_become_empty() {
        let sanitized = sanitize(
            &json!({"suggestions": null, "summary": {"overallScore": 60, "keyIssues": null}}),
            OutputSchema::Full,
        )
        .unwrap();
        assert!(sanitized.output.suggestions.is_empty());
        assert!(sanitized.output.summary.unwrap().key_issues.is_empty());
        assert!(sanitized
            .warnings
            .iter()
            .any(|w| w.contains("visualAnnotations") && w.contains("missing")));
    }

    #[test]
    fn test_missing_overall_score_is_derived() {
        let sanitized = sanitize(
            &json!({"summary": {"categoryScores": {"usability": 80, "visual": 60}}}),
            OutputSchema::Synthesis,
        )
        .unwrap();
        let summary = sanitized.output.summary.unwrap();
        assert_eq!(summary.overall_score, 70);
        assert_eq!(summary.category_scores.usability, 80);
        assert_eq!(summary.category_scores.content, 70);
    }

    #[test]
    fn test_suggestion_defaults() {
        let sanitized = sanitize(
            &json!({"suggestions": [{"title": "Raise contrast", "category": "a11y", "impact": "extreme",
                                     "actionItems": ["darken text", 7, ""]}]}),
            OutputSchema::Interpretation,
        )
        .unwrap();
        let s = &sanitized.output.suggestions[0];
        assert_eq!(s.id, "suggestion-1");
        assert_eq!(s.category, SuggestionCategory::Accessibility);
        assert_eq!(s.impact, Level::Medium);
        assert_eq!(s.action_items, vec!["darken text".to_string()]);
    }
}
