//! Captioning payloads: frame encoding under a size budget, the fixed
//! structured-output prompt and parsing of the model's JSON answer.

use std::borrow::Cow;
use std::io::Cursor;
use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::CaptionError;
use crate::types::{Observation, TimeOfDay};

/// Fixed instruction sent with every keyframe.
pub const CAPTION_PROMPT: &str = "You are a video surveillance analyst. Describe this camera frame \
and answer with one JSON object and nothing else: no markdown, no prose before or after it. \
Use exactly these keys, every value a string:\n\
- \"unusual_activity\": anything out of the ordinary or suspicious, or \"none\"\n\
- \"human_activity\": what people are doing, or \"none\"\n\
- \"animal_activity\": animals and their behaviour, or \"none\"\n\
- \"time\": \"day\" or \"night\"\n\
- \"unusual_crowd\": an abnormal gathering of people, or \"none\"\n\
- \"lighting_conditions\": short description of the lighting\n\
- \"vehicle_details\": comma-separated list of vehicles with colour and type, or \"none\"\n\
- \"number_of_individuals\": how many people are visible, an estimate is fine, \"0\" if nobody\n\
- \"object_presence\": notable objects such as bags or tools, or \"none\"\n\
- \"context_notes\": anything else relevant about the scene, or \"none\"\n\
Write \"none\" in lowercase whenever a category does not apply.";

const MIN_JPEG_QUALITY: u8 = 20;
const QUALITY_STEP: u8 = 10;
const MIN_LONG_EDGE: u32 = 64;

/// JPEG + base64 encode a frame, re-compressing until it fits `max_chars`.
///
/// Quality drops in steps down to a floor; after that the image is
/// downscaled by 3/4 per round. Gives up once the long edge would fall
/// below 64 px.
pub fn encode_for_caption(
    image: &RgbImage,
    quality: u8,
    max_chars: usize,
) -> Result<String, CaptionError> {
    let mut current: Cow<'_, RgbImage> = Cow::Borrowed(image);
    let mut quality = quality.clamp(1, 100);

    loop {
        let encoded = jpeg_base64(&current, quality)?;
        if encoded.len() <= max_chars {
            return Ok(encoded);
        }
        debug!(
            "Encoded frame {}x{} q{} is {} chars, over budget {}",
            current.width(),
            current.height(),
            quality,
            encoded.len(),
            max_chars
        );

        if quality > MIN_JPEG_QUALITY {
            quality = quality.saturating_sub(QUALITY_STEP).max(MIN_JPEG_QUALITY);
            continue;
        }

        let (w, h) = current.dimensions();
        let (nw, nh) = (w * 3 / 4, h * 3 / 4);
        if nw.max(nh) < MIN_LONG_EDGE || nw == 0 || nh == 0 {
            return Err(CaptionError::PayloadTooLarge {
                chars: encoded.len(),
                budget: max_chars,
            });
        }
        current = Cow::Owned(imageops::resize(&*current, nw, nh, FilterType::Triangle));
    }
}

fn jpeg_base64(image: &RgbImage, quality: u8) -> Result<String, CaptionError> {
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(image)
        .map_err(|e| CaptionError::Encode(e.to_string()))?;
    Ok(B64.encode(buf.into_inner()))
}

// ─── Response parsing ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CountValue {
    Number(serde_json::Number),
    Text(String),
}

/// The ten keys the model must return. All are required.
#[derive(Debug, Deserialize)]
struct RawCaption {
    unusual_activity: String,
    human_activity: String,
    animal_activity: String,
    time: String,
    unusual_crowd: String,
    lighting_conditions: String,
    vehicle_details: String,
    number_of_individuals: CountValue,
    object_presence: String,
    context_notes: String,
}

/// Parse a model answer into an [`Observation`] for `(camera_id, frame_number)`.
pub fn parse_caption(
    raw: &str,
    camera_id: i64,
    frame_number: u64,
) -> Result<Observation, CaptionError> {
    let body = strip_code_fences(raw);
    let parsed: RawCaption =
        serde_json::from_str(body).map_err(|e| CaptionError::Malformed(e.to_string()))?;

    let individual_count = match &parsed.number_of_individuals {
        CountValue::Text(text) => extract_individual_count(text),
        CountValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.floor() as u64))
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0),
    };

    Ok(Observation {
        camera_id,
        frame_number,
        unusual_activity: parsed.unusual_activity,
        human_activity: parsed.human_activity,
        animal_activity: parsed.animal_activity,
        time_of_day: TimeOfDay::parse_lenient(&parsed.time),
        unusual_crowd: parsed.unusual_crowd,
        lighting_conditions: parsed.lighting_conditions,
        vehicle_details: parsed.vehicle_details,
        individual_count,
        object_presence: parsed.object_presence,
        context_notes: parsed.context_notes,
    })
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.trim_end().trim_end_matches("```").trim()
}

fn digits_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").ok()).as_ref()
}

/// First integer in a possibly approximate count ("about 10-15" → 10), else 0.
///
/// Digits from any script count. A number too large for `u32` is
/// treated as unreadable and yields 0.
pub fn extract_individual_count(text: &str) -> u32 {
    let Some(re) = digits_regex() else { return 0 };
    let Some(run) = re.find(text) else { return 0 };

    let parsed = run.as_str().chars().try_fold(0u32, |acc, c| {
        acc.checked_mul(10)?.checked_add(decimal_value(re, c))
    });
    parsed.unwrap_or_else(|| {
        warn!("Ignoring implausible individual count {:?}", run.as_str());
        0
    })
}

/// Value of a Unicode decimal digit.
///
/// Decimal digits are encoded as runs of ten code points starting at zero,
/// so the value is the offset from the start of the run modulo ten.
fn decimal_value(re: &Regex, c: char) -> u32 {
    if let Some(d) = c.to_digit(10) {
        return d;
    }
    let mut buf = [0u8; 4];
    let mut start = c as u32;
    while let Some(prev) = start.checked_sub(1).and_then(char::from_u32) {
        if !re.is_match(prev.encode_utf8(&mut buf)) {
            break;
        }
        start -= 1;
    }
    (c as u32 - start) % 10
}
