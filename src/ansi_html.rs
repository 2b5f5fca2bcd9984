//! Conversion of terminal-styled text into chat HTML.
//!
//! Every literal run is wrapped in the tags for the style active at that
//! point, so each run is self-contained and tags never straddle runs.

use crate::{
    color::{Rgb, TermColor},
    sgr::{self, Attribute, ColorRole, Instruction, SgrError},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StyleState {
    fg: Option<TermColor>,
    bg: Option<TermColor>,
    bold: bool,
    dim: bool,
    italic: bool,
    underline: bool,
    strikethrough: bool,
    blink: bool,
    reverse: bool,
    hidden: bool,
}

impl StyleState {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }

    fn set_color(&mut self, role: ColorRole, color: Option<TermColor>) {
        match role {
            ColorRole::Foreground => self.fg = color,
            ColorRole::Background => self.bg = color,
        }
    }

    fn apply(&mut self, attr: Attribute) {
        match attr {
            // Strikethrough and reverse survive SGR 0.
            Attribute::Normal => {
                self.fg = None;
                self.bg = None;
                self.bold = false;
                self.dim = false;
                self.italic = false;
                self.underline = false;
                self.blink = false;
                self.hidden = false;
            }
            Attribute::Bold => {
                self.bold = true;
                self.dim = false;
            }
            Attribute::Dim => {
                self.dim = true;
                self.bold = false;
            }
            Attribute::NeitherBoldNorDim => {
                self.bold = false;
                self.dim = false;
            }
            Attribute::Italic => self.italic = true,
            Attribute::NotItalic => self.italic = false,
            Attribute::Underline => self.underline = true,
            Attribute::NotUnderline => self.underline = false,
            Attribute::Strikethrough => self.strikethrough = true,
            Attribute::NotStrikethrough => self.strikethrough = false,
            Attribute::Blink => self.blink = true,
            Attribute::NotBlink => self.blink = false,
            Attribute::Reverse => self.reverse = true,
            Attribute::NotReverse => self.reverse = false,
            Attribute::Hidden => self.hidden = true,
            Attribute::NotHidden => self.hidden = false,
        }
    }

    /// Colors as rendered, with reverse video applied.
    fn render_colors(&self) -> Option<(Rgb, Rgb)> {
        if self.fg.is_none() && self.bg.is_none() {
            return None;
        }
        let fg = self.fg.map_or(Rgb::BLACK, TermColor::rgb);
        let bg = self.bg.map_or(Rgb::WHITE, TermColor::rgb);
        Some(if self.reverse { (bg, fg) } else { (fg, bg) })
    }

    fn push_open_tags(&self, out: &mut String) {
        if self.hidden {
            out.push_str("<span data-mx-spoiler>");
        }
        if let Some((fg, bg)) = self.render_colors() {
            out.push_str("<font");
            if self.reverse || self.fg.is_some() {
                out.push_str(&format!(" color=\"{}\"", fg.hex()));
            }
            if self.reverse || self.bg.is_some() {
                out.push_str(&format!(" data-mx-bg-color=\"{}\"", bg.hex()));
            }
            out.push('>');
        }
        if self.bold {
            out.push_str("<strong>");
        }
        if self.italic {
            out.push_str("<em>");
        }
        if self.strikethrough {
            out.push_str("<del>");
        }
        if self.underline {
            out.push_str("<u>");
        }
    }

    fn push_close_tags(&self, out: &mut String) {
        if self.underline {
            out.push_str("</u>");
        }
        if self.strikethrough {
            out.push_str("</del>");
        }
        if self.italic {
            out.push_str("</em>");
        }
        if self.bold {
            out.push_str("</strong>");
        }
        if self.render_colors().is_some() {
            out.push_str("</font>");
        }
        if self.hidden {
            out.push_str("</span>");
        }
    }
}

/// Render `text` as HTML. Never fails: input that cannot be decoded comes
/// back HTML-escaped and otherwise untouched.
pub fn ansi_to_html(text: &str) -> String {
    match render(text) {
        Ok(html) => html,
        Err(error) => {
            tracing::debug!(
                target = "maush_relay::ansi",
                error = %error,
                "falling back to escaped plain text"
            );
            escape_html(text)
        }
    }
}

fn render(text: &str) -> Result<String, SgrError> {
    let mut out = String::with_capacity(text.len());
    let mut style = StyleState::default();

    for instruction in sgr::parse(text)? {
        match instruction {
            Instruction::Text(run) => {
                let styled = !style.is_default();
                if styled {
                    style.push_open_tags(&mut out);
                }
                out.push_str(&escape_html(run));
                if styled {
                    style.push_close_tags(&mut out);
                }
            }
            Instruction::SetColor { role, color } => style.set_color(role, color),
            Instruction::SetAttribute(attr) => style.apply(attr),
        }
    }
    Ok(out)
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}
