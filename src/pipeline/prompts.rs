//! Prompt templates. A prompt set may override any kind; the rest use the
//! built-in defaults below.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    Phase1,
    Phase2,
    Protagonist,
}

impl PromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::Phase1 => "phase1",
            PromptKind::Phase2 => "phase2",
            PromptKind::Protagonist => "protagonist",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "phase1" => Some(PromptKind::Phase1),
            "phase2" => Some(PromptKind::Phase2),
            "protagonist" => Some(PromptKind::Protagonist),
            _ => None,
        }
    }
}

pub const DEFAULT_PROMPT_SET: &str = "default";

pub const DEFAULT_PHASE1_PROMPT: &str = "You are a professional visual anthropologist. \
Describe every visual element in this batch of photos in detail: people, places, objects and \
activities. Pay particular attention to details such as clothing, facial expressions and \
surroundings. Your description should be thorough and objective and should capture what \
is essential about each photo.";

pub const DEFAULT_PHASE2_PROMPT: &str = r#"You are a digital anthropologist and psychologist. Based on the user's complete photo record, produce an in-depth synthesis.

Output the analysis in exactly this format:

```json
{
  "meta": {
    "scan_summary": "overall summary of the analysis",
    "timeline_chapters": ["timeline chapter 1", "timeline chapter 2"]
  },
  "L1_Spatio_Temporal": {
    "life_radius": "analysis of the living radius",
    "biological_clock": "analysis of the daily rhythm"
  },
  "L3_Social_Graph": {
    "core_circle": ["core circle member 1", "core circle member 2"],
    "relationship_dynamics": ["relationship dynamic 1"]
  },
  "L4_Behavior_Trends": {
    "social_mask": "analysis of the social persona",
    "consumption_shift": "analysis of changes in consumption"
  },
  "L5_Psychology": {
    "personality_type": "personality type analysis",
    "emotional_curve": "emotional curve analysis"
  },
  "L6_Hooks": {
    "story_trigger": "story trigger analysis"
  }
}
```

Base every section on the Phase 1 results and be specific. The analysis must come from the actual photo content rather than generic descriptions.
"#;

pub const DEFAULT_PROTAGONIST_PROMPT: &str = r#"You are a professional portrait photographer. Describe the person in this photo in detail.

**Task**: extract the following so this person can be recognised in other photos:

1. **Basics**: gender; age group (20-25, 26-30, 31-35, 36-40, over 40); body type (slim/average/full)
2. **Face**: hairstyle (length, straight or curly, colour); face shape; glasses (yes/no, type); other distinctive marks (beard, freckles, moles)
3. **Appearance**: estimated height (e.g. around 165cm); skin tone
4. **Style**: preferred style (casual/business/sporty/fashionable) and usual colours
5. **Identifiers**: the three most obvious features for spotting this person in a crowd

Output JSON:
```json
{
  "gender": "female",
  "age_group": "26-30",
  "body_type": "average",
  "facial_features": {
    "hair": "black shoulder-length bob",
    "face_shape": "oval",
    "glasses": "none",
    "distinctive_features": "small mole on the left cheek"
  },
  "appearance": {
    "height_estimate": "around 165cm",
    "skin_tone": "fair"
  },
  "style": "casual minimalist",
  "key_identifiers": [
    "black shoulder-length bob",
    "oval face, fair skin",
    "mole on the left cheek"
  ]
}
```

Output only the JSON, with no other text."#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    phase1: String,
    phase2: String,
    protagonist: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            phase1: DEFAULT_PHASE1_PROMPT.to_string(),
            phase2: DEFAULT_PHASE2_PROMPT.to_string(),
            protagonist: DEFAULT_PROTAGONIST_PROMPT.to_string(),
        }
    }
}

impl PromptSet {
    pub fn get(&self, kind: PromptKind) -> &str {
        match kind {
            PromptKind::Phase1 => &self.phase1,
            PromptKind::Phase2 => &self.phase2,
            PromptKind::Protagonist => &self.protagonist,
        }
    }

    pub fn set(&mut self, kind: PromptKind, content: String) {
        match kind {
            PromptKind::Phase1 => self.phase1 = content,
            PromptKind::Phase2 => self.phase2 = content,
            PromptKind::Protagonist => self.protagonist = content,
        }
    }
}
