//! Fuzzy matching of free-text ROM names against catalog titles
//!
//! Queries and candidates are normalized, optionally expanded through the
//! abbreviation table, and scored with three weighted signals: edit-distance
//! similarity, token overlap and substring containment.

mod abbreviations;

pub use abbreviations::expand;

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Words ignored when comparing token sets.
pub const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "of", "and", "or", "in", "on", "at", "to", "for",
];

const LEVENSHTEIN_WEIGHT: f64 = 0.5;
const TOKEN_WEIGHT: f64 = 0.35;
const SUBSTRING_WEIGHT: f64 = 0.15;

const EXACT_SCORE: f64 = 1.0;
const NORMALIZED_EXACT_SCORE: f64 = 0.98;
const CANDIDATE_CONTAINS_QUERY: f64 = 0.85;
const QUERY_CONTAINS_CANDIDATE: f64 = 0.75;
const PLATFORM_BOOST: f64 = 1.1;

pub const DEFAULT_MIN_SCORE: f64 = 0.6;
pub const DEFAULT_MAX_RESULTS: usize = 5;

const ROMAN_NUMERALS: &[(&str, &str)] = &[
    ("i", "1"),
    ("ii", "2"),
    ("iii", "3"),
    ("iv", "4"),
    ("v", "5"),
    ("vi", "6"),
    ("vii", "7"),
    ("viii", "8"),
    ("ix", "9"),
    ("x", "10"),
];

/// Canonical form used for every comparison.
///
/// Lowercases, turns `_` and `.` into spaces, drops punctuation, collapses
/// whitespace and rewrites standalone Roman numerals I-X as digits.
/// Applying it twice yields the same string as applying it once.
pub fn normalize(input: &str) -> String {
    let lowered = input.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .filter_map(|c| match c {
            '_' | '.' => Some(' '),
            c if c.is_whitespace() => Some(' '),
            c if c.is_alphanumeric() => Some(c),
            _ => None,
        })
        .collect();

    cleaned
        .split_whitespace()
        .map(|word| {
            ROMAN_NUMERALS
                .iter()
                .find(|(roman, _)| *roman == word)
                .map_or(word, |(_, digits)| *digits)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split normalized text into words, dropping stop words.
pub fn tokenize(input: &str) -> Vec<String> {
    normalize(input)
        .split(' ')
        .filter(|word| !word.is_empty() && !STOP_WORDS.contains(word))
        .map(str::to_string)
        .collect()
}

/// Classic dynamic-programming edit distance over characters.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Edit-distance similarity of the normalized forms, in [0, 1].
///
/// Symmetric, and `similarity(a, a) == 1.0` for every input.
pub fn similarity(a: &str, b: &str) -> f64 {
    levenshtein_similarity(&normalize(a), &normalize(b))
}

fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - edit_distance(a, b) as f64 / longest as f64
}

/// Jaccard index of the stop-word-filtered token sets.
pub fn token_similarity(a: &str, b: &str) -> f64 {
    let a: HashSet<String> = tokenize(a).into_iter().collect();
    let b: HashSet<String> = tokenize(b).into_iter().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count();
    let union = a.union(&b).count();
    shared as f64 / union as f64
}

fn substring_score(query: &str, candidate: &str) -> f64 {
    if query.is_empty() || candidate.is_empty() {
        0.0
    } else if candidate.contains(query) {
        CANDIDATE_CONTAINS_QUERY
    } else if query.contains(candidate) {
        QUERY_CONTAINS_CANDIDATE
    } else {
        0.0
    }
}

/// Confidence in [0, 1] that `candidate` is the title `query` refers to.
pub fn score(query: &str, candidate: &str, platform_match: bool) -> f64 {
    if query.trim().to_lowercase() == candidate.trim().to_lowercase() {
        return EXACT_SCORE;
    }

    let query_norm = normalize(query);
    let candidate_norm = normalize(candidate);
    if !query_norm.is_empty() && query_norm == candidate_norm {
        return NORMALIZED_EXACT_SCORE;
    }

    let weighted = LEVENSHTEIN_WEIGHT * levenshtein_similarity(&query_norm, &candidate_norm)
        + TOKEN_WEIGHT * token_similarity(&query_norm, &candidate_norm)
        + SUBSTRING_WEIGHT * substring_score(&query_norm, &candidate_norm);

    if platform_match {
        (weighted * PLATFORM_BOOST).min(1.0)
    } else {
        weighted
    }
}

/// Turn a ROM filename into a matchable title.
///
/// `"Super Mario World (USA) (Rev 1).sfc"` becomes `"super mario world"`.
pub fn extract_core_name(filename: &str) -> String {
    let stem = match filename.rfind('.') {
        Some(dot) if dot > 0 && !filename[dot + 1..].contains(' ') => &filename[..dot],
        _ => filename,
    };

    let mut core = String::with_capacity(stem.len());
    let mut depth = 0usize;
    for c in stem.chars() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            c if depth == 0 => core.push(c),
            _ => {}
        }
    }

    normalize(core.trim())
}

/// A title offered to the ranker.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub title: &'a str,
    /// Caller-supplied hint that the candidate is on the platform the user asked for
    pub platform_match: bool,
}

impl<'a> Candidate<'a> {
    pub fn new(title: &'a str) -> Self {
        Self {
            title,
            platform_match: false,
        }
    }
}

/// Ranking knobs
#[derive(Debug, Clone, Copy)]
pub struct MatchOptions {
    pub min_score: f64,
    pub max_results: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            min_score: DEFAULT_MIN_SCORE,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

/// One ranked candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Position of the candidate in the input list
    pub index: usize,
    pub title: String,
    pub score: f64,
}

/// Rank `candidates` against `query` and every abbreviation expansion of it.
///
/// Candidates scoring below `min_score` are dropped. Equal scores keep their
/// input order.
pub fn find_best_matches(
    query: &str,
    candidates: &[Candidate<'_>],
    options: MatchOptions,
) -> Vec<MatchResult> {
    if query.trim().is_empty() || normalize(query).is_empty() {
        return Vec::new();
    }

    let mut queries = vec![query.to_string()];
    for expansion in expand(query) {
        if !queries.contains(&expansion) {
            queries.push(expansion);
        }
    }

    let mut results: Vec<MatchResult> = candidates
        .iter()
        .enumerate()
        .filter_map(|(index, candidate)| {
            let best = queries
                .iter()
                .map(|q| score(q, candidate.title, candidate.platform_match))
                .fold(0.0_f64, f64::max);
            (best >= options.min_score).then(|| MatchResult {
                index,
                title: candidate.title.to_string(),
                score: best,
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.index.cmp(&b.index))
    });
    results.truncate(options.max_results);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates<'a>(titles: &[&'a str]) -> Vec<Candidate<'a>> {
        titles.iter().map(|t| Candidate::new(t)).collect()
    }

    #[test]
    fn normalize_folds_case_separators_and_numerals() {
        assert_eq!(normalize("Final_Fantasy.VI"), "final fantasy 6");
        assert_eq!(normalize("  Mega   Man X!  "), "mega man 10");
        assert_eq!(normalize("Kirby's Adventure"), "kirbys adventure");
        assert_eq!(normalize("Vixen"), "vixen");
    }

    #[test]
    fn normalize_is_idempotent() {
        let samples = [
            "Super Mario World (USA) (Rev 1).sfc",
            "ii-x",
            "x.i",
            "İstanbul VII",
            "!!!",
            "",
            "Donkey_Kong__Country   III",
            "ä ß Ω iv",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "input {sample:?}");
        }
    }

    #[test]
    fn garbage_degrades_to_empty() {
        assert_eq!(normalize("!!! ??? ---"), "");
        assert!(tokenize("the of and").is_empty());
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn tokenize_drops_stop_words() {
        assert_eq!(
            tokenize("The Legend of Zelda"),
            vec!["legend".to_string(), "zelda".to_string()]
        );
    }

    #[test]
    fn edit_distance_known_values() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("abc", ""), 3);
        assert_eq!(edit_distance("flaw", "lawn"), 2);
    }

    #[test]
    fn similarity_is_symmetric_and_reflexive() {
        let pairs = [
            ("Super Mario World", "Super Mario Land"),
            ("", "abc"),
            ("Chrono Trigger", "chrono_trigger"),
            ("EarthBound", "Mother 2"),
        ];
        for (a, b) in pairs {
            assert_eq!(similarity(a, b), similarity(b, a));
            assert_eq!(similarity(a, a), 1.0);
        }
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("", "abc"), 0.0);
    }

    #[test]
    fn exact_matches_short_circuit() {
        assert_eq!(score("super mario world", "Super Mario World", false), 1.0);
        assert_eq!(score("super_mario_world", "Super Mario World", false), 0.98);
    }

    #[test]
    fn platform_boost_is_capped() {
        let plain = score("mario world", "Super Mario World", false);
        let boosted = score("mario world", "Super Mario World", true);
        assert!(boosted > plain);
        assert!(boosted <= 1.0);
    }

    #[test]
    fn abbreviation_finds_full_title_first() {
        let catalog = candidates(&[
            "Super Mario Bros",
            "Super Mario World",
            "Super Metroid",
            "Mario Paint",
        ]);
        let results = find_best_matches("SMW", &catalog, MatchOptions::default());
        assert!(!results.is_empty());
        assert_eq!(results[0].title, "Super Mario World");
        assert!(results[0].score > 0.7);
    }

    #[test]
    fn blank_query_yields_nothing() {
        let catalog = candidates(&["Super Mario World"]);
        assert!(find_best_matches("   ", &catalog, MatchOptions::default()).is_empty());
        assert!(find_best_matches("?!", &catalog, MatchOptions::default()).is_empty());
    }

    #[test]
    fn ties_keep_input_order() {
        let catalog = candidates(&["Tetris", "Dr Mario", "Tetris"]);
        let results = find_best_matches("tetris", &catalog, MatchOptions::default());
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].index, 0);
        assert_eq!(results[1].index, 2);
    }

    #[test]
    fn results_are_capped_and_thresholded() {
        let catalog = candidates(&[
            "Mega Man",
            "Mega Man 2",
            "Mega Man 3",
            "Mega Man 4",
            "Mega Man 5",
            "Mega Man 6",
            "Tetris",
        ]);
        let options = MatchOptions {
            min_score: 0.6,
            max_results: 3,
        };
        let results = find_best_matches("mega man", &catalog, options);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].title, "Mega Man");
        assert!(results.iter().all(|r| r.title != "Tetris"));
    }

    #[test]
    fn roman_and_arabic_titles_match() {
        let catalog = candidates(&["Final Fantasy III", "Final Fantasy VI"]);
        let results = find_best_matches("Final Fantasy 6", &catalog, MatchOptions::default());
        assert_eq!(results[0].title, "Final Fantasy VI");
        assert_eq!(results[0].score, 0.98);
    }

    #[test]
    fn core_name_strips_extension_and_tags() {
        assert_eq!(
            extract_core_name("Super Mario World (USA) (Rev 1).sfc"),
            "super mario world"
        );
        assert_eq!(
            extract_core_name("Chrono Trigger [T+Eng] (Japan).smc"),
            "chrono trigger"
        );
        assert_eq!(extract_core_name("EarthBound"), "earthbound");
    }
}
