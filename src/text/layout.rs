// src/text/layout.rs - QWERTY <-> ЙЦУКЕН keyboard layout transliteration

/// Same physical key on a US QWERTY and a Russian ЙЦУКЕН keyboard
const KEYS: &[(char, char)] = &[
    ('q', 'й'), ('w', 'ц'), ('e', 'у'), ('r', 'к'), ('t', 'е'), ('y', 'н'),
    ('u', 'г'), ('i', 'ш'), ('o', 'щ'), ('p', 'з'), ('[', 'х'), (']', 'ъ'),
    ('a', 'ф'), ('s', 'ы'), ('d', 'в'), ('f', 'а'), ('g', 'п'), ('h', 'р'),
    ('j', 'о'), ('k', 'л'), ('l', 'д'), (';', 'ж'), ('\'', 'э'),
    ('z', 'я'), ('x', 'ч'), ('c', 'с'), ('v', 'м'), ('b', 'и'), ('n', 'т'),
    ('m', 'ь'), (',', 'б'), ('.', 'ю'), ('`', 'ё'),
];

fn has_cyrillic(word: &str) -> bool {
    word.chars().any(|c| ('\u{400}'..='\u{4FF}').contains(&c))
}

/// Cyrillic text as typed with the Latin layout active ("пидор" -> "gbljh")
pub fn to_latin_keys(word: &str) -> String {
    word.chars()
        .flat_map(char::to_lowercase)
        .map(|c| KEYS.iter().find(|(_, cy)| *cy == c).map(|(la, _)| *la).unwrap_or(c))
        .collect()
}

/// Latin text as typed with the Cyrillic layout active ("gbljh" -> "пидор")
pub fn to_cyrillic_keys(word: &str) -> String {
    word.chars()
        .flat_map(char::to_lowercase)
        .map(|c| KEYS.iter().find(|(la, _)| *la == c).map(|(_, cy)| *cy).unwrap_or(c))
        .collect()
}

/// The word as it would read on the other keyboard layout, if it differs
pub fn swap_layout(word: &str) -> Option<String> {
    let swapped = if has_cyrillic(word) {
        to_latin_keys(word)
    } else {
        to_cyrillic_keys(word)
    };
    (swapped != word.to_lowercase()).then_some(swapped)
}
