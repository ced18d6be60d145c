use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ordered::OrderedMap;
use crate::provider::AspectRatio;

use super::error::{PipelineError, PipelineResult};

/// Director output: upload metadata plus the ordered narration segments.
///
/// Field names follow the story document consumed by the assembly and upload
/// tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    #[serde(rename = "youtube_bilgileri", default)]
    pub video: VideoInfo,
    #[serde(rename = "hikaye_yapisi")]
    pub sections: OrderedMap<Section>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    #[serde(rename = "seslendirmen", default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    #[serde(rename = "bolum_kisaltmasi")]
    pub abbreviation: String,
    #[serde(rename = "paragraflar", default)]
    pub paragraphs: Vec<Paragraph>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paragraph {
    #[serde(rename = "paragraf_numarasi")]
    pub number: u32,
    #[serde(rename = "segmentler", default)]
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "segment_numarasi")]
    pub number: u32,
    #[serde(rename = "metin")]
    pub text: String,
    #[serde(rename = "gorsel_prompt")]
    pub image_prompt: String,
    #[serde(rename = "en_boy_orani", default)]
    pub aspect_ratio: AspectRatio,
}

/// One narration line and its illustration, named `<ABBR>-<paragraph>-<segment>`.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentAsset {
    pub stem: String,
    pub text: String,
    pub image_prompt: String,
    pub aspect_ratio: AspectRatio,
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.strip_prefix("json").unwrap_or(rest);
    body.strip_suffix("```").unwrap_or(body).trim()
}

impl Story {
    /// Parses model output, tolerating a surrounding markdown code fence.
    pub fn parse(raw: &str) -> PipelineResult<Self> {
        let story: Story = serde_json::from_str(strip_code_fence(raw))
            .map_err(|err| PipelineError::Story(err.to_string()))?;
        story.validate()?;
        Ok(story)
    }

    /// Segment stems become file names under the project directory, so each
    /// section abbreviation must be a plain name.
    pub fn validate(&self) -> PipelineResult<()> {
        for section in self.sections.values() {
            let abbreviation = section.abbreviation.as_str();
            let plain = !abbreviation.is_empty()
                && abbreviation
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-');
            if !plain {
                return Err(PipelineError::Story(format!(
                    "invalid section abbreviation {abbreviation:?}"
                )));
            }
        }
        if self.segments().is_empty() {
            return Err(PipelineError::Story("story has no segments".into()));
        }
        Ok(())
    }

    pub fn to_json(&self) -> PipelineResult<String> {
        serde_json::to_string_pretty(self).map_err(|err| PipelineError::Story(err.to_string()))
    }

    pub fn voice<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.video
            .voice
            .as_deref()
            .filter(|voice| !voice.trim().is_empty())
            .unwrap_or(fallback)
    }

    pub fn segments(&self) -> Vec<SegmentAsset> {
        let mut assets = Vec::new();
        for section in self.sections.values() {
            for paragraph in &section.paragraphs {
                for segment in &paragraph.segments {
                    assets.push(SegmentAsset {
                        stem: format!(
                            "{}-{}-{}",
                            section.abbreviation, paragraph.number, segment.number
                        ),
                        text: segment.text.clone(),
                        image_prompt: segment.image_prompt.clone(),
                        aspect_ratio: segment.aspect_ratio,
                    });
                }
            }
        }
        assets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORY: &str = r#"```json
{
  "youtube_bilgileri": {"seslendirmen": "Puck", "baslik": "AI Trends"},
  "hikaye_yapisi": {
    "giris": {
      "bolum_kisaltmasi": "GIR",
      "paragraflar": [
        {"paragraf_numarasi": 1, "segmentler": [
          {"segment_numarasi": 1, "metin": "Hello", "gorsel_prompt": "sunrise", "en_boy_orani": "9:16"},
          {"segment_numarasi": 2, "metin": "World", "gorsel_prompt": "city", "en_boy_orani": "2:1"}
        ]}
      ]
    },
    "sonuc": {
      "bolum_kisaltmasi": "SON",
      "paragraflar": [
        {"paragraf_numarasi": 1, "segmentler": [
          {"segment_numarasi": 1, "metin": "Bye", "gorsel_prompt": "sunset"}
        ]}
      ]
    }
  }
}
```"#;

    #[test]
    fn parses_fenced_story_in_document_order() {
        let story = Story::parse(STORY).unwrap();
        let stems: Vec<_> = story.segments().into_iter().map(|s| s.stem).collect();
        assert_eq!(stems, vec!["GIR-1-1", "GIR-1-2", "SON-1-1"]);
        let segments = story.segments();
        assert_eq!(segments[0].aspect_ratio, AspectRatio::Tall);
        assert_eq!(segments[1].aspect_ratio, AspectRatio::Wide);
        assert_eq!(segments[2].aspect_ratio, AspectRatio::Wide);
        assert_eq!(story.voice("Kore"), "Puck");
    }

    #[test]
    fn keeps_unknown_video_fields_for_upload() {
        let story = Story::parse(STORY).unwrap();
        let json: Value = serde_json::from_str(&story.to_json().unwrap()).unwrap();
        assert_eq!(json["youtube_bilgileri"]["baslik"], "AI Trends");
        assert_eq!(json["hikaye_yapisi"]["giris"]["paragraflar"][0]["segmentler"][1]["en_boy_orani"], "16:9");
    }

    #[test]
    fn rejects_empty_or_invalid_stories() {
        assert!(Story::parse("not json").is_err());
        assert!(Story::parse(r#"{"hikaye_yapisi": {}}"#).is_err());
    }

    #[test]
    fn rejects_abbreviations_that_leave_the_project() {
        for abbreviation in ["../../escape", "a/b", "a\\b", "", ".."] {
            let raw = STORY.replace("\"GIR\"", &format!("{abbreviation:?}"));
            let err = Story::parse(&raw).unwrap_err();
            assert!(err.to_string().contains("abbreviation"), "{abbreviation}: {err}");
        }
    }
}
