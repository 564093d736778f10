use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::modality::{AnalysisData, AnalysisResult, Modality, ResultType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

/// Recommendation category, declared in emission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Safety,
    Form,
    Motivation,
    Context,
}

impl Category {
    pub fn for_result(result_type: ResultType) -> Self {
        match result_type {
            ResultType::SafetyAlert => Category::Safety,
            ResultType::FormAnalysis => Category::Form,
            ResultType::SpeechActivity => Category::Motivation,
            ResultType::Silence | ResultType::SceneContext => Category::Context,
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Category::Safety => Priority::Critical,
            Category::Form => Priority::High,
            Category::Motivation => Priority::Medium,
            Category::Context => Priority::Low,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Category::Safety => "Safety check",
            Category::Form => "Form cue",
            Category::Motivation => "Keep going",
            Category::Context => "Session context",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub category: Category,
    /// Modality the recommendation was derived from
    pub modality: Modality,
}

impl Recommendation {
    /// Summarize one modality's strongest evidence
    pub(crate) fn from_result(category: Category, result: &AnalysisResult) -> Self {
        Self {
            title: category.title().to_string(),
            description: describe(result),
            priority: category.priority(),
            category,
            modality: result.modality,
        }
    }
}

/// Cross-modal insight produced by one fusion pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedInsight {
    pub id: String,
    pub contributing_modalities: BTreeSet<Modality>,
    /// Mean confidence of all contributing analyses
    pub confidence: f32,
    pub recommendations: Vec<Recommendation>,
    pub produced_at: DateTime<Utc>,
}

impl FusedInsight {
    pub fn categories(&self) -> BTreeSet<Category> {
        self.recommendations.iter().map(|r| r.category).collect()
    }
}

fn describe(result: &AnalysisResult) -> String {
    match &result.data {
        AnalysisData::Pose(metrics) => {
            let mut parts = Vec::new();
            if let Some(knee) = metrics.knee_angle_deg {
                parts.push(format!("knee {:.0}°", knee));
            }
            if let Some(hip) = metrics.hip_angle_deg {
                parts.push(format!("hip {:.0}°", hip));
            }
            if let Some(elbow) = metrics.elbow_angle_deg {
                parts.push(format!("elbow {:.0}°", elbow));
            }
            if let Some(tilt) = metrics.shoulder_tilt {
                parts.push(format!("shoulder tilt {:.2}", tilt));
            }
            if parts.is_empty() {
                "Body partially out of frame".to_string()
            } else {
                format!("Pose: {}", parts.join(", "))
            }
        }
        AnalysisData::Audio(features) => {
            if result.result_type == ResultType::SpeechActivity {
                format!("User speaking (level {:.2})", features.level)
            } else {
                "User quiet".to_string()
            }
        }
        AnalysisData::Vision(scene) => match &scene.label {
            Some(label) => format!("Scene: {}", label),
            None if scene.person_visible => "Scene: user in frame".to_string(),
            None => "Scene: user not clearly visible".to_string(),
        },
    }
}
