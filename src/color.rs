//! Terminal color references and their RGB values.

use std::fmt;

/// An RGB triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// Lowercase `#rrggbb` form, as used in `color` attributes.
    pub fn hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.red, self.green, self.blue)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

/// A color as a terminal refers to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermColor {
    /// Index into the 256-color palette. 0-7 are the SGR 30-37 colors,
    /// 8-15 their bright variants.
    Indexed(u8),
    TrueColor(Rgb),
}

impl TermColor {
    pub fn rgb(self) -> Rgb {
        match self {
            TermColor::Indexed(index) => palette(index),
            TermColor::TrueColor(rgb) => rgb,
        }
    }

    pub fn hex(self) -> String {
        self.rgb().hex()
    }
}

const SYSTEM_COLORS: [Rgb; 16] = [
    Rgb::new(0x00, 0x00, 0x00),
    Rgb::new(0x80, 0x00, 0x00),
    Rgb::new(0x00, 0x80, 0x00),
    Rgb::new(0x80, 0x80, 0x00),
    Rgb::new(0x00, 0x00, 0x80),
    Rgb::new(0x80, 0x00, 0x80),
    Rgb::new(0x00, 0x80, 0x80),
    Rgb::new(0xc0, 0xc0, 0xc0),
    Rgb::new(0x80, 0x80, 0x80),
    Rgb::new(0xff, 0x00, 0x00),
    Rgb::new(0x00, 0xff, 0x00),
    Rgb::new(0xff, 0xff, 0x00),
    Rgb::new(0x00, 0x00, 0xff),
    Rgb::new(0xff, 0x00, 0xff),
    Rgb::new(0x00, 0xff, 0xff),
    Rgb::new(0xff, 0xff, 0xff),
];

const CUBE_LEVELS: [u8; 6] = [0x00, 0x5f, 0x87, 0xaf, 0xd7, 0xff];

/// xterm 256-color palette lookup.
pub fn palette(index: u8) -> Rgb {
    match index {
        0..=15 => SYSTEM_COLORS[usize::from(index)],
        16..=231 => {
            let cube = index - 16;
            Rgb::new(
                CUBE_LEVELS[usize::from(cube / 36)],
                CUBE_LEVELS[usize::from((cube / 6) % 6)],
                CUBE_LEVELS[usize::from(cube % 6)],
            )
        }
        232..=255 => {
            let level = 8 + (index - 232) * 10;
            Rgb::new(level, level, level)
        }
    }
}
