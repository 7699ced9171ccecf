//! Clinical text normalization shared by embedding, reranking and evidence.
//!
//! Normalization is NFKC + lowercase. Tokens are maximal alphanumeric runs
//! of length ≥ 2 with stopwords removed; clinical abbreviations are kept and
//! followed by the tokens of their expansion, so "STEMI" also matches
//! "ST elevation".

use std::collections::BTreeSet;

use unicode_normalization::UnicodeNormalization;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "is", "are", "was", "were", "be", "been", "of", "for", "with",
    "to", "in", "on", "at", "by", "as", "from", "this", "that", "these", "those", "not", "no",
    "yes", "other", "unspecified", "unilateral", "bilateral", "due", "has", "had", "have", "his",
    "her", "patient", "pt", "presents", "complains", "hx", "yo",
];

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("sob", "shortness of breath"),
    ("ekg", "electrocardiogram"),
    ("ecg", "electrocardiogram"),
    ("chf", "congestive heart failure"),
    ("mi", "myocardial infarction"),
    ("ami", "acute myocardial infarction"),
    ("stemi", "st elevation myocardial infarction"),
    ("nstemi", "non st elevation myocardial infarction"),
    ("cva", "cerebrovascular accident"),
    ("htn", "hypertension"),
    ("dm", "diabetes mellitus"),
    ("copd", "chronic obstructive pulmonary disease"),
    ("uri", "upper respiratory infection"),
    ("uti", "urinary tract infection"),
    ("afib", "atrial fibrillation"),
    ("cp", "chest pain"),
    ("dx", "diagnosis"),
    ("tx", "treatment"),
    ("rx", "treatment"),
];

/// NFKC-normalize, lowercase and collapse whitespace.
pub fn normalize(text: &str) -> String {
    let folded: String = text.nfkc().collect::<String>().to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Expansion for a lowercase clinical abbreviation, if known.
pub fn expand_abbreviation(token: &str) -> Option<&'static str> {
    ABBREVIATIONS
        .iter()
        .find(|(abbr, _)| *abbr == token)
        .map(|(_, expansion)| *expansion)
}

/// Tokenize text in order of appearance, expanding abbreviations inline.
pub fn tokenize(text: &str) -> Vec<String> {
    let normalized = normalize(text).replace("r/o", "rule out");
    let mut tokens = Vec::new();
    for raw in normalized.split(|c: char| !c.is_alphanumeric()) {
        if raw.chars().count() < 2 || is_stopword(raw) {
            continue;
        }
        tokens.push(raw.to_string());
        if let Some(expansion) = expand_abbreviation(raw) {
            tokens.extend(
                expansion
                    .split(' ')
                    .filter(|t| t.len() >= 2 && !is_stopword(t))
                    .map(str::to_string),
            );
        }
    }
    tokens
}

/// Distinct tokens in sorted order.
pub fn token_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

/// Whitespace-delimited word count of the raw text.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_case_and_width() {
        assert_eq!(normalize("  Ｃhest   PAIN "), "chest pain");
    }

    #[test]
    fn tokenize_drops_stopwords_and_short_tokens() {
        let tokens = tokenize("Chest pain with a ST elevation");
        assert_eq!(tokens, vec!["chest", "pain", "st", "elevation"]);
    }

    #[test]
    fn abbreviations_keep_the_original_token() {
        let tokens = tokenize("STEMI, r/o CHF");
        assert_eq!(
            tokens,
            vec![
                "stemi",
                "st",
                "elevation",
                "myocardial",
                "infarction",
                "rule",
                "out",
                "chf",
                "congestive",
                "heart",
                "failure",
            ]
        );
    }

    #[test]
    fn token_set_is_sorted_and_distinct() {
        let set = token_set("pain pain chest");
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec!["chest", "pain"]);
    }

    #[test]
    fn word_count_counts_raw_words() {
        assert_eq!(word_count("a b  c\nd"), 4);
        assert_eq!(word_count("   "), 0);
    }
}
