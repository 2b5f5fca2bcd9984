//! Tokenizer for terminal escape sequences.
//!
//! Splits text into literal runs and the SGR (select graphic rendition)
//! instructions between them. Other CSI, OSC and two-byte escapes are
//! consumed and dropped.

use crate::color::{Rgb, TermColor};

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorRole {
    Foreground,
    Background,
}

/// SGR style attributes, ECMA-48 numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Normal,
    Bold,
    Dim,
    NeitherBoldNorDim,
    Italic,
    NotItalic,
    Underline,
    NotUnderline,
    Blink,
    NotBlink,
    Reverse,
    NotReverse,
    Hidden,
    NotHidden,
    Strikethrough,
    NotStrikethrough,
}

impl Attribute {
    pub fn from_code(code: u16) -> Option<Self> {
        let attr = match code {
            0 => Attribute::Normal,
            1 => Attribute::Bold,
            2 => Attribute::Dim,
            3 => Attribute::Italic,
            4 => Attribute::Underline,
            5 => Attribute::Blink,
            7 => Attribute::Reverse,
            8 => Attribute::Hidden,
            9 => Attribute::Strikethrough,
            22 => Attribute::NeitherBoldNorDim,
            23 => Attribute::NotItalic,
            24 => Attribute::NotUnderline,
            25 => Attribute::NotBlink,
            27 => Attribute::NotReverse,
            28 => Attribute::NotHidden,
            29 => Attribute::NotStrikethrough,
            _ => return None,
        };
        Some(attr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction<'a> {
    Text(&'a str),
    /// `None` resets the role to the terminal default (SGR 39 / 49).
    SetColor {
        role: ColorRole,
        color: Option<TermColor>,
    },
    SetAttribute(Attribute),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SgrError {
    #[error("unterminated escape sequence at byte {0}")]
    Unterminated(usize),
    #[error("malformed escape sequence at byte {0}")]
    Malformed(usize),
    #[error("invalid SGR parameter {0:?}")]
    InvalidParameter(String),
    #[error("incomplete extended color")]
    IncompleteColor,
    #[error("unsupported extended color mode {0}")]
    UnsupportedColorMode(u16),
}

/// Decode `text` into an ordered list of instructions.
pub fn parse(text: &str) -> Result<Vec<Instruction<'_>>, SgrError> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut run_start = 0;
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos] != ESC {
            pos += 1;
            continue;
        }
        if run_start < pos {
            out.push(Instruction::Text(&text[run_start..pos]));
        }
        let escape_start = pos;
        pos = match bytes.get(pos + 1) {
            None => return Err(SgrError::Unterminated(escape_start)),
            Some(b'[') => {
                let (params, final_byte, end) = scan_csi(bytes, pos + 2)?;
                if final_byte == b'm' {
                    parse_sgr(&text[params.0..params.1], &mut out)?;
                }
                end
            }
            Some(b']') => scan_osc(bytes, pos + 2)?,
            Some(&next) if (0x20..=0x2f).contains(&next) => {
                let mut cursor = pos + 2;
                while bytes.get(cursor).is_some_and(|b| (0x20..=0x2f).contains(b)) {
                    cursor += 1;
                }
                match bytes.get(cursor) {
                    Some(b) if (0x30..=0x7e).contains(b) => cursor + 1,
                    Some(_) => return Err(SgrError::Malformed(escape_start)),
                    None => return Err(SgrError::Unterminated(escape_start)),
                }
            }
            Some(&next) if (0x30..=0x7e).contains(&next) => pos + 2,
            Some(_) => return Err(SgrError::Malformed(escape_start)),
        };
        run_start = pos;
    }

    if run_start < bytes.len() {
        out.push(Instruction::Text(&text[run_start..]));
    }
    Ok(out)
}

/// Text with every escape sequence removed. Undecodable input is returned as-is.
pub fn plain_text(text: &str) -> String {
    match parse(text) {
        Ok(instructions) => instructions
            .into_iter()
            .filter_map(|instruction| match instruction {
                Instruction::Text(run) => Some(run),
                _ => None,
            })
            .collect(),
        Err(_) => text.to_string(),
    }
}

/// Returns the parameter byte range, the final byte, and the index after the sequence.
fn scan_csi(bytes: &[u8], start: usize) -> Result<((usize, usize), u8, usize), SgrError> {
    let escape_start = start - 2;
    let mut cursor = start;
    while bytes.get(cursor).is_some_and(|b| (0x30..=0x3f).contains(b)) {
        cursor += 1;
    }
    let params = (start, cursor);
    let mut has_intermediate = false;
    while bytes.get(cursor).is_some_and(|b| (0x20..=0x2f).contains(b)) {
        has_intermediate = true;
        cursor += 1;
    }
    match bytes.get(cursor) {
        Some(&b) if (0x40..=0x7e).contains(&b) => {
            // An intermediate byte makes it something other than SGR.
            let final_byte = if has_intermediate { 0 } else { b };
            Ok((params, final_byte, cursor + 1))
        }
        Some(_) => Err(SgrError::Malformed(escape_start)),
        None => Err(SgrError::Unterminated(escape_start)),
    }
}

fn scan_osc(bytes: &[u8], start: usize) -> Result<usize, SgrError> {
    let mut cursor = start;
    while let Some(&b) = bytes.get(cursor) {
        if b == BEL {
            return Ok(cursor + 1);
        }
        if b == ESC && bytes.get(cursor + 1) == Some(&b'\\') {
            return Ok(cursor + 2);
        }
        cursor += 1;
    }
    Err(SgrError::Unterminated(start - 2))
}

fn parse_sgr<'a>(params: &str, out: &mut Vec<Instruction<'a>>) -> Result<(), SgrError> {
    let codes = sgr_codes(params)?;
    let mut iter = codes.into_iter();

    while let Some(code) = iter.next() {
        let instruction = match code {
            30..=37 => set_color(ColorRole::Foreground, TermColor::Indexed((code - 30) as u8)),
            90..=97 => set_color(ColorRole::Foreground, TermColor::Indexed((code - 90 + 8) as u8)),
            40..=47 => set_color(ColorRole::Background, TermColor::Indexed((code - 40) as u8)),
            100..=107 => {
                set_color(ColorRole::Background, TermColor::Indexed((code - 100 + 8) as u8))
            }
            38 => set_color(ColorRole::Foreground, extended_color(&mut iter)?),
            48 => set_color(ColorRole::Background, extended_color(&mut iter)?),
            39 => Instruction::SetColor {
                role: ColorRole::Foreground,
                color: None,
            },
            49 => Instruction::SetColor {
                role: ColorRole::Background,
                color: None,
            },
            other => match Attribute::from_code(other) {
                Some(attr) => Instruction::SetAttribute(attr),
                None => continue,
            },
        };
        out.push(instruction);
    }
    Ok(())
}

fn set_color<'a>(role: ColorRole, color: TermColor) -> Instruction<'a> {
    Instruction::SetColor {
        role,
        color: Some(color),
    }
}

fn sgr_codes(params: &str) -> Result<Vec<u16>, SgrError> {
    if params.is_empty() {
        return Ok(vec![0]);
    }
    params
        .split(';')
        .map(|part| {
            if part.is_empty() {
                return Ok(0);
            }
            if !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(SgrError::InvalidParameter(part.to_string()));
            }
            part.parse::<u16>()
                .map_err(|_| SgrError::InvalidParameter(part.to_string()))
        })
        .collect()
}

fn extended_color(iter: &mut impl Iterator<Item = u16>) -> Result<TermColor, SgrError> {
    match iter.next().ok_or(SgrError::IncompleteColor)? {
        5 => Ok(TermColor::Indexed(color_component(iter)?)),
        2 => {
            let red = color_component(iter)?;
            let green = color_component(iter)?;
            let blue = color_component(iter)?;
            Ok(TermColor::TrueColor(Rgb::new(red, green, blue)))
        }
        mode => Err(SgrError::UnsupportedColorMode(mode)),
    }
}

fn color_component(iter: &mut impl Iterator<Item = u16>) -> Result<u8, SgrError> {
    let value = iter.next().ok_or(SgrError::IncompleteColor)?;
    u8::try_from(value).map_err(|_| SgrError::InvalidParameter(value.to_string()))
}
