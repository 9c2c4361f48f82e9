use regex::Regex;

/// Decides whether model text signals uncertainty that warrants pausing for
/// user input. Pluggable so the heuristic can be swapped without touching
/// the loop.
pub trait UncertaintyClassifier: Send + Sync {
    fn is_uncertain(&self, text: &str) -> bool;
}

/// Phrases that indicate the model wants confirmation before continuing.
const MARKERS: &[&str] = &[
    "i'm not sure",
    "i am not sure",
    "i'm unsure",
    "this could go either way",
    "do you want me to",
    "should i proceed",
    "before i continue",
    "a few options",
    "which approach",
    "let me know if",
    "would you prefer",
];

/// Default classifier: case-insensitive phrase matching.
pub struct MarkerClassifier {
    pattern: Regex,
}

impl MarkerClassifier {
    pub fn new() -> Self {
        let alternation = MARKERS
            .iter()
            .map(|m| regex::escape(m))
            .collect::<Vec<_>>()
            .join("|");
        let pattern =
            Regex::new(&format!("(?i){alternation}")).expect("marker pattern is valid");
        Self { pattern }
    }
}

impl Default for MarkerClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl UncertaintyClassifier for MarkerClassifier {
    fn is_uncertain(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_uncertainty_phrases() {
        let c = MarkerClassifier::new();
        assert!(c.is_uncertain("I'm not sure which dataset you mean."));
        assert!(c.is_uncertain("Should I proceed with deleting the old runs?"));
        assert!(c.is_uncertain("There are a few options here."));
        assert!(c.is_uncertain("WOULD YOU PREFER the short version?"));
    }

    #[test]
    fn ignores_confident_text() {
        let c = MarkerClassifier::new();
        assert!(!c.is_uncertain("Done. Wrote the summary to notes.md."));
        assert!(!c.is_uncertain("The script finished with exit code 0."));
        assert!(!c.is_uncertain(""));
    }
}
