//! Pure VIN decoding for the supported manufacturer's passenger vehicles.

use serde::Serialize;
use thiserror::Error;
use vintrack_core::{is_vin_shaped, VinConfidence};

use crate::generation::generation_for;

/// Attributes recovered from a VIN. Any member may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecodedVin {
    pub model_year: Option<i32>,
    pub model: Option<String>,
    pub engine_type: Option<String>,
    pub trim: Option<String>,
    pub generation: Option<String>,
}

impl DecodedVin {
    fn is_complete(&self) -> bool {
        self.model_year.is_some()
            && self.model.is_some()
            && self.trim.is_some()
            && self.generation.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum VinRejection {
    #[error("expected 17 characters, found {length}")]
    Length { length: usize },
    #[error("character {character:?} is not allowed in a VIN")]
    IllegalCharacter { character: char },
    #[error("world manufacturer identifier {wmi} is not supported")]
    UnknownManufacturer { wmi: String },
    #[error("check digit {found} does not match computed {expected}")]
    CheckDigit { expected: char, found: char },
    #[error("model year code {code:?} is not valid")]
    ModelYearCode { code: char },
}

/// Tagged decode result; an undecodable VIN is `Invalid`, never a panic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum VinDecode {
    Valid {
        confidence: VinConfidence,
        fields: DecodedVin,
    },
    Invalid {
        reason: VinRejection,
    },
}

impl VinDecode {
    pub fn is_valid(&self) -> bool {
        matches!(self, VinDecode::Valid { .. })
    }

    pub fn confidence(&self) -> VinConfidence {
        match self {
            VinDecode::Valid { confidence, .. } => *confidence,
            VinDecode::Invalid { .. } => VinConfidence::Invalid,
        }
    }

    pub fn fields(&self) -> Option<&DecodedVin> {
        match self {
            VinDecode::Valid { fields, .. } => Some(fields),
            VinDecode::Invalid { .. } => None,
        }
    }
}

const SUPPORTED_WMI: &[&str] = &["WP0", "WP1"];

/// (wmi, positions 7-8, model). `None` model means "Cayman or Boxster by body code".
const MODEL_LINES: &[(&str, &str, Option<&str>)] = &[
    ("WP0", "99", Some("911")),
    ("WP0", "A9", Some("911")),
    ("WP0", "98", None),
    ("WP0", "A8", None),
    ("WP0", "A7", Some("Panamera")),
    ("WP0", "Y1", Some("Taycan")),
    ("WP1", "A2", Some("Cayenne")),
    ("WP1", "A5", Some("Macan")),
];

/// (model, position 5, engine type, trim when the code pins it down).
const ENGINE_CODES: &[(&str, char, &str, Option<&str>)] = &[
    ("911", 'A', "3.0L twin-turbo flat-6", Some("Carrera")),
    ("911", 'B', "3.0L twin-turbo flat-6", Some("Carrera S")),
    ("911", 'C', "4.0L naturally aspirated flat-6", None),
    ("911", 'D', "3.8L twin-turbo flat-6", Some("Turbo")),
    ("911", 'E', "3.8L twin-turbo flat-6", Some("Turbo S")),
    ("911", 'F', "3.8L twin-turbo flat-6", Some("GT2 RS")),
    ("Cayman", 'A', "2.0L turbo flat-4", None),
    ("Cayman", 'B', "2.5L turbo flat-4", Some("S")),
    ("Cayman", 'C', "4.0L naturally aspirated flat-6", None),
    ("Boxster", 'A', "2.0L turbo flat-4", None),
    ("Boxster", 'B', "2.5L turbo flat-4", Some("S")),
    ("Boxster", 'C', "4.0L naturally aspirated flat-6", None),
    ("Cayenne", 'A', "3.0L turbo V6", None),
    ("Cayenne", 'B', "2.9L twin-turbo V6", Some("S")),
    ("Cayenne", 'D', "4.0L twin-turbo V8", Some("Turbo")),
    ("Macan", 'A', "2.0L turbo I4", None),
    ("Macan", 'B', "2.9L twin-turbo V6", Some("S")),
    ("Panamera", 'A', "2.9L twin-turbo V6", None),
    ("Panamera", 'D', "4.0L twin-turbo V8", Some("Turbo")),
    ("Taycan", 'A', "dual-motor electric", None),
    ("Taycan", 'D', "dual-motor electric", Some("Turbo")),
    ("Taycan", 'E', "dual-motor electric", Some("Turbo S")),
];

const CHECK_WEIGHTS: [u32; 17] = [8, 7, 6, 5, 4, 3, 2, 10, 0, 9, 8, 7, 6, 5, 4, 3, 2];

fn transliterate(c: char) -> u32 {
    match c {
        '0'..='9' => c as u32 - '0' as u32,
        'A' | 'J' => 1,
        'B' | 'K' | 'S' => 2,
        'C' | 'L' | 'T' => 3,
        'D' | 'M' | 'U' => 4,
        'E' | 'N' | 'V' => 5,
        'F' | 'W' => 6,
        'G' | 'P' | 'X' => 7,
        'H' | 'Y' => 8,
        'R' | 'Z' => 9,
        _ => 0,
    }
}

pub fn check_digit(vin: &[char]) -> char {
    let sum: u32 = vin
        .iter()
        .zip(CHECK_WEIGHTS.iter())
        .map(|(c, w)| transliterate(*c) * w)
        .sum();
    match sum % 11 {
        10 => 'X',
        n => char::from_digit(n, 10).unwrap_or('0'),
    }
}

/// Position 10 code -> year; a numeric position 7 selects the 1980-2009 cycle.
fn model_year(code: char, position_seven: char) -> Option<i32> {
    const CODES: &str = "ABCDEFGHJKLMNPRSTVWXY123456789";
    let offset = CODES.find(code)? as i32;
    let base = if position_seven.is_ascii_digit() { 1980 } else { 2010 };
    Some(base + offset)
}

fn model_for(wmi: &str, line: &str, body: char) -> Option<&'static str> {
    let (_, _, model) = MODEL_LINES
        .iter()
        .find(|(w, code, _)| *w == wmi && *code == line)?;
    Some(model.unwrap_or(if body == 'C' { "Boxster" } else { "Cayman" }))
}

pub fn decode(vin: &str) -> VinDecode {
    match decode_fields(vin) {
        Ok(fields) => {
            let confidence = if fields.is_complete() {
                VinConfidence::High
            } else if fields.model.is_some() && fields.model_year.is_some() {
                VinConfidence::Medium
            } else {
                VinConfidence::Low
            };
            VinDecode::Valid { confidence, fields }
        }
        Err(reason) => VinDecode::Invalid { reason },
    }
}

fn decode_fields(vin: &str) -> Result<DecodedVin, VinRejection> {
    let chars: Vec<char> = vin.chars().collect();
    if chars.len() != 17 {
        return Err(VinRejection::Length {
            length: chars.len(),
        });
    }
    if !is_vin_shaped(vin) {
        let character = chars
            .iter()
            .copied()
            .find(|c| !(c.is_ascii_digit() || c.is_ascii_uppercase()) || matches!(c, 'I' | 'O' | 'Q'))
            .unwrap_or('?');
        return Err(VinRejection::IllegalCharacter { character });
    }

    let wmi: String = chars[..3].iter().collect();
    if !SUPPORTED_WMI.contains(&wmi.as_str()) {
        return Err(VinRejection::UnknownManufacturer { wmi });
    }

    let found = chars[8];
    if found != 'Z' {
        let expected = check_digit(&chars);
        if expected != found {
            return Err(VinRejection::CheckDigit { expected, found });
        }
    }

    let year = model_year(chars[9], chars[6])
        .ok_or(VinRejection::ModelYearCode { code: chars[9] })?;

    let line: String = chars[6..8].iter().collect();
    let model = model_for(&wmi, &line, chars[3]);
    let engine = model.and_then(|m| {
        ENGINE_CODES
            .iter()
            .find(|(em, code, _, _)| *em == m && *code == chars[4])
    });

    Ok(DecodedVin {
        model_year: Some(year),
        model: model.map(str::to_string),
        engine_type: engine.map(|(_, _, e, _)| e.to_string()),
        trim: engine.and_then(|(_, _, _, t)| t.map(str::to_string)),
        generation: model
            .and_then(|m| generation_for(m, year))
            .map(str::to_string),
    })
}
