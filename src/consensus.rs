//! Dual-pass consensus selection.
//!
//! Two independent OCR passes are reconciled into one trusted result. The
//! rule: the pass with strictly higher confidence wins; on a tie the pass
//! with non-empty text wins (pass 1 preferred when both have text); if both
//! passes are empty the consensus is an empty string tagged [`ConsensusSource::None`],
//! which is a valid outcome rather than an error.
//!
//! Consensus is always recomputed here from the two pass slots. Engines may
//! report their own merge, but it is advisory only, so the selection rule
//! holds no matter which engine produced the passes.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One recognized word with its image-relative bounding box.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct WordBox {
    pub text: String,
    pub confidence: u8,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Output of one OCR configuration run against one image.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct OcrPassResult {
    /// Extracted text, possibly empty.
    pub text: String,

    /// Average word confidence, 0-100.
    pub confidence: u8,

    /// Per-word boxes, in reading order.
    pub word_boxes: Vec<WordBox>,
}

/// Which pass (or merge rule) produced the consensus text.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusSource {
    /// The first-configuration pass won.
    Pass1,
    /// The second-configuration pass won.
    Pass2,
    /// Both passes were empty; there is no text to trust.
    None,
}

/// The persisted per-image result, at most one per image.
///
/// The two pass slots keep their historical wire names (`pytesseract_*` and
/// `easyocr_*`); they simply mean "pass 1" and "pass 2".
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ConsensusResult {
    pub pytesseract_text: String,
    pub pytesseract_confidence: u8,
    pub easyocr_text: String,
    pub easyocr_confidence: u8,
    pub consensus_text: String,
    pub consensus_confidence: u8,
    pub consensus_source: ConsensusSource,
    /// Boxes from the winning pass only; coordinates are pass-specific and
    /// never merged across passes.
    pub bounding_boxes: Vec<WordBox>,
    pub processed_at: DateTime<Utc>,
}

/// Select the consensus from two passes.
pub fn resolve(pass1: &OcrPassResult, pass2: &OcrPassResult) -> ConsensusResult {
    let winner = pick_winner(pass1, pass2);
    let (consensus_text, consensus_confidence, bounding_boxes) = match winner {
        ConsensusSource::Pass1 => {
            (pass1.text.clone(), pass1.confidence, pass1.word_boxes.clone())
        }
        ConsensusSource::Pass2 => {
            (pass2.text.clone(), pass2.confidence, pass2.word_boxes.clone())
        }
        ConsensusSource::None => (String::new(), 0, vec![]),
    };
    ConsensusResult {
        pytesseract_text: pass1.text.clone(),
        pytesseract_confidence: pass1.confidence,
        easyocr_text: pass2.text.clone(),
        easyocr_confidence: pass2.confidence,
        consensus_text,
        consensus_confidence,
        consensus_source: winner,
        bounding_boxes,
        processed_at: Utc::now(),
    }
}

fn pick_winner(pass1: &OcrPassResult, pass2: &OcrPassResult) -> ConsensusSource {
    let text1 = pass1.text.trim();
    let text2 = pass2.text.trim();
    if text1.is_empty() && text2.is_empty() {
        return ConsensusSource::None;
    }
    if pass1.confidence > pass2.confidence {
        ConsensusSource::Pass1
    } else if pass2.confidence > pass1.confidence {
        ConsensusSource::Pass2
    } else if !text1.is_empty() {
        ConsensusSource::Pass1
    } else {
        ConsensusSource::Pass2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass(text: &str, confidence: u8) -> OcrPassResult {
        OcrPassResult {
            text: text.to_owned(),
            confidence,
            word_boxes: vec![],
        }
    }

    #[test]
    fn higher_confidence_wins() {
        let result = resolve(&pass("X", 92), &pass("Y", 96));
        assert_eq!(result.consensus_text, "Y");
        assert_eq!(result.consensus_confidence, 96);
        assert_eq!(result.consensus_source, ConsensusSource::Pass2);

        let result = resolve(&pass("X", 96), &pass("Y", 92));
        assert_eq!(result.consensus_text, "X");
        assert_eq!(result.consensus_source, ConsensusSource::Pass1);
    }

    #[test]
    fn tie_goes_to_the_pass_with_text() {
        let result = resolve(&pass("", 80), &pass("words", 80));
        assert_eq!(result.consensus_source, ConsensusSource::Pass2);
        assert_eq!(result.consensus_text, "words");

        let result = resolve(&pass("words", 80), &pass("", 80));
        assert_eq!(result.consensus_source, ConsensusSource::Pass1);
    }

    #[test]
    fn tie_with_both_texts_prefers_pass_one() {
        let result = resolve(&pass("a", 70), &pass("b", 70));
        assert_eq!(result.consensus_source, ConsensusSource::Pass1);
        assert_eq!(result.consensus_text, "a");
    }

    #[test]
    fn both_empty_is_a_valid_no_result() {
        let result = resolve(&pass("", 0), &pass("   ", 0));
        assert_eq!(result.consensus_source, ConsensusSource::None);
        assert_eq!(result.consensus_text, "");
        assert_eq!(result.consensus_confidence, 0);
        assert!(result.bounding_boxes.is_empty());
    }

    #[test]
    fn an_empty_pass_can_still_win_on_confidence() {
        // Higher confidence wins strictly, even over non-empty text with a
        // lower score; only the no-text case falls through to the tie rule.
        let result = resolve(&pass("", 90), &pass("something", 50));
        assert_eq!(result.consensus_source, ConsensusSource::Pass1);
        assert_eq!(result.consensus_text, "");
    }

    #[test]
    fn boxes_come_from_the_winning_pass_only() {
        let mut pass1 = pass("one", 50);
        pass1.word_boxes = vec![WordBox {
            text: "one".to_owned(),
            confidence: 50,
            x: 1,
            y: 2,
            width: 30,
            height: 10,
        }];
        let mut pass2 = pass("two", 90);
        pass2.word_boxes = vec![WordBox {
            text: "two".to_owned(),
            confidence: 90,
            x: 5,
            y: 6,
            width: 40,
            height: 12,
        }];

        let result = resolve(&pass1, &pass2);
        assert_eq!(result.bounding_boxes.len(), 1);
        assert_eq!(result.bounding_boxes[0].text, "two");
    }

    #[test]
    fn pass_slots_are_always_recorded() {
        let result = resolve(&pass("first", 10), &pass("second", 99));
        assert_eq!(result.pytesseract_text, "first");
        assert_eq!(result.pytesseract_confidence, 10);
        assert_eq!(result.easyocr_text, "second");
        assert_eq!(result.easyocr_confidence, 99);
    }
}
