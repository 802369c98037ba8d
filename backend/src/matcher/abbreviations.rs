//! Known short codes for popular titles.
//!
//! The table is built once on first use and never mutated afterwards. Keys
//! and expansions are stored in normalized form so lookups compare like
//! with like.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use super::normalize;

/// Raw table: short code -> full titles it may stand for.
const RAW_ABBREVIATIONS: &[(&str, &[&str])] = &[
    ("smw", &["Super Mario World"]),
    ("smw2", &["Super Mario World 2 Yoshi's Island"]),
    ("smb", &["Super Mario Bros"]),
    ("smb2", &["Super Mario Bros 2"]),
    ("smb3", &["Super Mario Bros 3"]),
    ("sm64", &["Super Mario 64"]),
    ("smrpg", &["Super Mario RPG Legend of the Seven Stars"]),
    ("mk64", &["Mario Kart 64"]),
    ("smk", &["Super Mario Kart"]),
    ("loz", &["The Legend of Zelda"]),
    ("alttp", &["The Legend of Zelda A Link to the Past"]),
    ("lttp", &["The Legend of Zelda A Link to the Past"]),
    ("oot", &["The Legend of Zelda Ocarina of Time"]),
    ("mm", &["The Legend of Zelda Majora's Mask"]),
    ("la", &["The Legend of Zelda Link's Awakening"]),
    ("ff", &["Final Fantasy"]),
    ("ff2", &["Final Fantasy II", "Final Fantasy IV"]),
    ("ff3", &["Final Fantasy III", "Final Fantasy VI"]),
    ("ff4", &["Final Fantasy IV", "Final Fantasy II"]),
    ("ff5", &["Final Fantasy V"]),
    ("ff6", &["Final Fantasy VI", "Final Fantasy III"]),
    ("ff7", &["Final Fantasy VII"]),
    ("ff8", &["Final Fantasy VIII"]),
    ("ff9", &["Final Fantasy IX"]),
    ("ct", &["Chrono Trigger"]),
    ("sotn", &["Castlevania Symphony of the Night"]),
    ("dkc", &["Donkey Kong Country"]),
    ("dkc2", &["Donkey Kong Country 2 Diddy's Kong Quest"]),
    ("dkc3", &["Donkey Kong Country 3 Dixie Kong's Double Trouble"]),
    ("eb", &["EarthBound"]),
    ("sf2", &["Street Fighter II"]),
    ("sm", &["Super Metroid"]),
    ("kdl", &["Kirby's Dream Land"]),
    ("som", &["Secret of Mana"]),
    ("soe", &["Secret of Evermore"]),
    ("pkmn", &["Pokemon"]),
    ("mmx", &["Mega Man X"]),
    ("mgs", &["Metal Gear Solid"]),
    ("goldeneye", &["GoldenEye 007"]),
];

/// Normalized abbreviation table.
static ABBREVIATIONS: Lazy<HashMap<String, Vec<String>>> = Lazy::new(|| {
    RAW_ABBREVIATIONS
        .iter()
        .map(|(code, titles)| {
            (
                normalize(code),
                titles.iter().map(|t| normalize(t)).collect(),
            )
        })
        .collect()
});

/// Minimum run-together length before a query may match *inside* an expansion.
const MIN_CONTAINED_LEN: usize = 6;

/// Expand a query into the set of titles it may stand for.
///
/// Tries, in order: the whole query as a code, the first word as a code
/// (keeping the remaining words), and a run-together comparison against
/// every known expansion. The normalized query itself always comes first so
/// a literal title is never lost by expanding it.
pub fn expand(query: &str) -> Vec<String> {
    expand_with(&ABBREVIATIONS, query)
}

fn expand_with(table: &HashMap<String, Vec<String>>, query: &str) -> Vec<String> {
    let normalized = normalize(query);
    if normalized.is_empty() {
        return Vec::new();
    }

    let mut expansions = vec![normalized.clone()];
    let mut push = |candidate: String| {
        if !expansions.contains(&candidate) {
            expansions.push(candidate);
        }
    };

    if let Some(titles) = table.get(&normalized) {
        titles.iter().cloned().for_each(&mut push);
        return expansions;
    }

    if let Some((head, tail)) = normalized.split_once(' ') {
        if let Some(titles) = table.get(head) {
            for title in titles {
                push(format!("{title} {tail}"));
            }
            return expansions;
        }
    }

    let squashed: String = normalized.chars().filter(|c| *c != ' ').collect();
    // Iterate in raw table order so the result does not depend on hash order.
    for (code, _) in RAW_ABBREVIATIONS {
        let Some(titles) = table.get(&normalize(code)) else {
            continue;
        };
        for title in titles {
            let title_squashed: String = title.chars().filter(|c| *c != ' ').collect();
            let contains_title = squashed.contains(&title_squashed);
            let inside_title = squashed.chars().count() >= MIN_CONTAINED_LEN
                && title_squashed.contains(&squashed);
            if contains_title || inside_title {
                push(title.clone());
            }
        }
    }

    expansions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_query_code_expands() {
        let expansions = expand("SMW");
        assert_eq!(expansions, vec!["smw".to_string(), "super mario world".to_string()]);
    }

    #[test]
    fn ambiguous_code_yields_every_title() {
        let expansions = expand("ff6");
        assert!(expansions.contains(&"final fantasy 6".to_string()));
        assert!(expansions.contains(&"final fantasy 3".to_string()));
    }

    #[test]
    fn head_word_expands_and_keeps_tail() {
        let expansions = expand("alttp randomizer");
        assert!(expansions
            .contains(&"the legend of zelda a link to the past randomizer".to_string()));
    }

    #[test]
    fn run_together_names_match_expansions() {
        let expansions = expand("ChronoTrigger");
        assert!(expansions.contains(&"chrono trigger".to_string()));
    }

    #[test]
    fn unknown_query_is_its_own_expansion() {
        assert_eq!(expand("Zzyzx Quest"), vec!["zzyzx quest".to_string()]);
    }

    #[test]
    fn empty_query_has_no_expansions() {
        assert!(expand("  ").is_empty());
    }
}
