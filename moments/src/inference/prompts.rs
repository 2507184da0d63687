//! Prompt assembly for moment generation and refinement.

use std::fmt::Write as _;

use crate::domain::RunConfig;
use crate::storage::{MomentRecord, TranscriptRecord};

const GENERATION_SYSTEM: &str = "You are a video editor selecting the most engaging moments \
of a video from its transcript. Respond with a JSON array of objects shaped \
{\"start_time\": <seconds>, \"end_time\": <seconds>, \"title\": <string>} and nothing else.";

const REFINEMENT_SYSTEM: &str = "You tighten the boundaries of one video moment so it starts \
and ends on natural beats. Respond with a single JSON object shaped \
{\"start_time\": <seconds>, \"end_time\": <seconds>} and nothing else.";

pub fn generation_system_prompt() -> &'static str {
    GENERATION_SYSTEM
}

pub fn refinement_system_prompt() -> &'static str {
    REFINEMENT_SYSTEM
}

/// Build the user prompt for moment generation from transcript segments and
/// the run's bounds.
pub fn build_generation_prompt(
    transcript: &TranscriptRecord,
    config: &RunConfig,
    duration_seconds: f64,
) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "The video is {duration_seconds:.1} seconds long. Its transcript follows, one segment per line:"
    );
    prompt.push('\n');

    if transcript.segment_timestamps.is_empty() {
        let _ = writeln!(prompt, "(no transcript segments were produced)");
    } else {
        for segment in &transcript.segment_timestamps {
            let _ = writeln!(
                prompt,
                "[{:.1}s - {:.1}s] {}",
                segment.start,
                segment.end,
                segment.text.trim()
            );
        }
    }
    prompt.push('\n');

    let _ = writeln!(prompt, "Select the standout moments.");
    match (config.min_moments, config.max_moments) {
        (Some(min), Some(max)) => {
            let _ = writeln!(prompt, "Return between {min} and {max} moments.");
        }
        (Some(min), None) => {
            let _ = writeln!(prompt, "Return at least {min} moments.");
        }
        (None, Some(max)) => {
            let _ = writeln!(prompt, "Return at most {max} moments.");
        }
        (None, None) => {}
    }
    match (config.min_moment_length, config.max_moment_length) {
        (Some(min), Some(max)) => {
            let _ = writeln!(
                prompt,
                "Each moment must be between {min:.0} and {max:.0} seconds long."
            );
        }
        (Some(min), None) => {
            let _ = writeln!(prompt, "Each moment must be at least {min:.0} seconds long.");
        }
        (None, Some(max)) => {
            let _ = writeln!(prompt, "Each moment must be at most {max:.0} seconds long.");
        }
        (None, None) => {}
    }
    let _ = writeln!(
        prompt,
        "Timestamps must lie within [0, {duration_seconds:.1}] with start_time < end_time."
    );
    prompt
}

/// Build the user prompt for refining one moment. The clip itself, when
/// available, is attached as a `video_url` part by the caller.
pub fn build_refinement_prompt(moment: &MomentRecord, has_clip: bool) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "Moment \"{}\" currently spans [{:.1}s, {:.1}s] of the source video.",
        moment.title, moment.start_time, moment.end_time
    );
    if has_clip {
        let _ = writeln!(
            prompt,
            "The attached clip covers this window plus padding; timestamps you return \
must still refer to the source video timeline."
        );
    }
    let _ = writeln!(
        prompt,
        "Return refined boundaries that keep the action intact but trim dead air."
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GenerationParams, PipelineType};
    use crate::storage::SegmentTimestamp;

    fn transcript(segments: Vec<SegmentTimestamp>) -> TranscriptRecord {
        TranscriptRecord {
            id: 1,
            video_id: 1,
            text: "full text".to_string(),
            word_timestamps: vec![],
            segment_timestamps: segments,
            processing_time: 2.0,
        }
    }

    fn config() -> RunConfig {
        RunConfig {
            generation_model: "vl".to_string(),
            refinement_model: "vl".to_string(),
            generation_params: GenerationParams::default(),
            padding_left_seconds: 0.0,
            padding_right_seconds: 0.0,
            min_moments: Some(2),
            max_moments: Some(5),
            min_moment_length: Some(10.0),
            max_moment_length: None,
            source_url: None,
            force_download: false,
            pipeline_type: PipelineType::Full,
        }
    }

    #[test]
    fn test_generation_prompt_includes_segments_and_bounds() {
        let transcript = transcript(vec![SegmentTimestamp {
            text: "hello world".to_string(),
            start: 1.5,
            end: 4.0,
        }]);
        let prompt = build_generation_prompt(&transcript, &config(), 120.0);
        assert!(prompt.contains("[1.5s - 4.0s] hello world"));
        assert!(prompt.contains("between 2 and 5 moments"));
        assert!(prompt.contains("at least 10 seconds"));
        assert!(prompt.contains("120.0"));
    }

    #[test]
    fn test_generation_prompt_handles_empty_transcript() {
        let prompt = build_generation_prompt(&transcript(vec![]), &config(), 60.0);
        assert!(prompt.contains("no transcript segments"));
    }

    #[test]
    fn test_refinement_prompt_mentions_clip_only_when_present() {
        let moment = MomentRecord {
            id: 1,
            video_id: 1,
            identifier: "1:0".to_string(),
            title: "Rally".to_string(),
            start_time: 10.0,
            end_time: 20.0,
            is_refined: false,
            parent_id: None,
        };
        let with_clip = build_refinement_prompt(&moment, true);
        let without_clip = build_refinement_prompt(&moment, false);
        assert!(with_clip.contains("attached clip"));
        assert!(!without_clip.contains("attached clip"));
        assert!(without_clip.contains("[10.0s, 20.0s]"));
    }
}
