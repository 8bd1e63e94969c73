// src/text/homoglyph.rs - Script detection and look-alike character folding

use unicode_normalization::UnicodeNormalization;

/// Latin / Cyrillic look-alike pairs
const LATIN_CYRILLIC: &[(char, char)] = &[
    ('a', 'а'), ('c', 'с'), ('e', 'е'), ('o', 'о'), ('p', 'р'),
    ('x', 'х'), ('y', 'у'), ('k', 'к'), ('i', 'і'), ('j', 'ј'), ('s', 'ѕ'),
    ('A', 'А'), ('B', 'В'), ('C', 'С'), ('E', 'Е'), ('H', 'Н'),
    ('K', 'К'), ('M', 'М'), ('O', 'О'), ('P', 'Р'), ('T', 'Т'),
    ('X', 'Х'), ('Y', 'У'), ('I', 'І'), ('J', 'Ј'), ('S', 'Ѕ'),
];

/// Greek look-alikes of Latin letters
const GREEK_LATIN: &[(char, char)] = &[
    ('α', 'a'), ('ο', 'o'), ('ρ', 'p'), ('υ', 'u'), ('ν', 'v'), ('ι', 'i'),
    ('Α', 'A'), ('Β', 'B'), ('Ε', 'E'), ('Ζ', 'Z'), ('Η', 'H'), ('Ι', 'I'),
    ('Κ', 'K'), ('Μ', 'M'), ('Ν', 'N'), ('Ο', 'O'), ('Ρ', 'P'), ('Τ', 'T'),
    ('Υ', 'Y'), ('Χ', 'X'),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Latin,
    Cyrillic,
    Greek,
    Other,
}

pub fn script_of(c: char) -> Script {
    match c as u32 {
        0x41..=0x5A | 0x61..=0x7A | 0xC0..=0x24F | 0x1E00..=0x1EFF => Script::Latin,
        0x400..=0x52F | 0x1C80..=0x1C8F | 0x2DE0..=0x2DFF | 0xA640..=0xA69F => Script::Cyrillic,
        0x370..=0x3FF | 0x1F00..=0x1FFF => Script::Greek,
        _ => Script::Other,
    }
}

/// Latin or Cyrillic, whichever owns more letter runs; ties go to Latin.
///
/// Only Latin and Cyrillic letters are looked at, case-insensitively, and a
/// run of one repeated letter counts once, so lowercasing, punctuation
/// stripping and repeat collapsing never change the outcome. Folding into
/// the winner can only widen its lead, which keeps `fold` idempotent.
pub fn dominant_script(text: &str) -> Script {
    let (mut latin, mut cyrillic) = (0usize, 0usize);
    let mut prev: Option<char> = None;
    for c in text.chars() {
        let script = script_of(c);
        if !c.is_alphabetic() || !matches!(script, Script::Latin | Script::Cyrillic) {
            continue;
        }
        let lower = c.to_lowercase().next().unwrap_or(c);
        if prev == Some(lower) {
            continue;
        }
        prev = Some(lower);
        match script {
            Script::Latin => latin += 1,
            _ => cyrillic += 1,
        }
    }
    if cyrillic > latin {
        Script::Cyrillic
    } else {
        Script::Latin
    }
}

fn to_latin(c: char) -> Option<char> {
    LATIN_CYRILLIC
        .iter()
        .find(|(_, cy)| *cy == c)
        .map(|(la, _)| *la)
        .or_else(|| GREEK_LATIN.iter().find(|(gr, _)| *gr == c).map(|(_, la)| *la))
}

fn to_cyrillic(c: char) -> Option<char> {
    let latin = GREEK_LATIN
        .iter()
        .find(|(gr, _)| *gr == c)
        .map(|(_, la)| *la)
        .unwrap_or(c);
    LATIN_CYRILLIC
        .iter()
        .find(|(la, _)| *la == latin)
        .map(|(_, cy)| *cy)
}

/// Fold compatibility forms (fullwidth, mathematical letters) and map
/// look-alikes into the message's dominant script
pub fn fold(text: &str) -> String {
    let compat: String = text.nfkc().collect();
    let mapped: String = match dominant_script(&compat) {
        Script::Cyrillic => compat
            .chars()
            .map(|c| match script_of(c) {
                Script::Latin | Script::Greek => to_cyrillic(c).unwrap_or(c),
                _ => c,
            })
            .collect(),
        _ => compat
            .chars()
            .map(|c| match script_of(c) {
                Script::Cyrillic | Script::Greek => to_latin(c).unwrap_or(c),
                _ => c,
            })
            .collect(),
    };
    mapped.nfc().collect()
}
