/// Maps free text (a prompt, a chat message) to a short subject label.
pub trait LabelStrategy: Send + Sync {
    fn infer(&self, text: &str) -> Option<String>;
}

impl<F> LabelStrategy for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn infer(&self, text: &str) -> Option<String> {
        self(text)
    }
}

pub const DEFAULT_SUBJECT_WORDS: &[&str] = &[
    "cat", "dog", "bird", "horse", "fish", "lion", "tiger", "bear", "rabbit", "dragon", "robot",
    "car", "bike", "boat", "plane", "house", "castle", "tree", "flower", "mountain", "beach",
    "city", "forest", "person", "man", "woman", "girl", "boy", "baby", "portrait", "logo",
];

/// Picks the first vocabulary word mentioned in the text, in reading order.
#[derive(Debug, Clone)]
pub struct VocabularyLabeler {
    words: Vec<String>,
}

impl VocabularyLabeler {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            words: words
                .into_iter()
                .map(|word| word.into().trim().to_ascii_lowercase())
                .filter(|word| !word.is_empty())
                .collect(),
        }
    }

    pub fn with_words<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for word in extra {
            let word = word.into().trim().to_ascii_lowercase();
            if !word.is_empty() && !self.words.contains(&word) {
                self.words.push(word);
            }
        }
        self
    }

    fn match_token(&self, token: &str) -> Option<&str> {
        let singulars = [token.strip_suffix("es"), token.strip_suffix('s')];
        self.words
            .iter()
            .find(|word| {
                token == word.as_str()
                    || singulars
                        .iter()
                        .flatten()
                        .any(|singular| *singular == word.as_str())
            })
            .map(String::as_str)
    }
}

impl Default for VocabularyLabeler {
    fn default() -> Self {
        Self::new(DEFAULT_SUBJECT_WORDS.iter().copied())
    }
}

impl LabelStrategy for VocabularyLabeler {
    fn infer(&self, text: &str) -> Option<String> {
        let lowered = text.to_lowercase();
        lowered
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .find_map(|token| self.match_token(token))
            .map(str::to_string)
    }
}
