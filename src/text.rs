// turning raw document text into lemma sequences.
// the same analyzer is used on the corpus and on queries, otherwise query lemmas
// would never line up with the trained vocabulary.

use crate::config::files_handling;
use crate::config::Params;
use crate::error::PersistError;

use rayon::prelude::*;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::info;

// unicode punctuation, unicode symbols and the non-breaking space
const STRIP_PATTERN: &str = r"[\p{P}\p{S}\u{00A0}]";

// anything between angle brackets, crawled pages keep their html tags
const MARKUP_PATTERN: &str = r"<[^>]*>";

fn strip_pattern() -> &'static Regex {
    static STRIP: OnceLock<Regex> = OnceLock::new();
    STRIP.get_or_init(|| Regex::new(STRIP_PATTERN).expect("strip pattern is a valid regex"))
}

fn markup_pattern() -> &'static Regex {
    static MARKUP: OnceLock<Regex> = OnceLock::new();
    MARKUP.get_or_init(|| Regex::new(MARKUP_PATTERN).expect("markup pattern is a valid regex"))
}

/// Replaces html tags with spaces and drops `&quot;` entities.
pub fn strip_markup(text: &str) -> String {
    markup_pattern().replace_all(text, " ").replace("&quot;", "")
}

// defines the behavior needed for tokenizing a document
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

/// Removes html markup, replaces punctuation and symbols with spaces, lowercases and
/// splits on whitespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct PunctuationTokenizer;

impl Tokenizer for PunctuationTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        let text = strip_markup(text);
        strip_pattern()
            .replace_all(&text, " ")
            .to_lowercase()
            .split_whitespace()
            .map(|x| x.to_string())
            .collect()
    }
}

/// Maps a surface word to its dictionary form.
///
/// Returning `None` drops the word from the sequence.
pub trait Lemmatizer: Send + Sync {
    fn lemma(&self, word: &str) -> Option<String>;
}

/// Every word is its own lemma.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityLemmatizer;

impl Lemmatizer for IdentityLemmatizer {
    fn lemma(&self, word: &str) -> Option<String> {
        Some(word.to_string())
    }
}

/// Looks words up in a precomputed word -> lemma table, unknown words map to themselves.
#[derive(Debug, Default, Clone)]
pub struct DictionaryLemmatizer {
    lemmas: HashMap<String, String>,
}

impl DictionaryLemmatizer {
    pub fn new(lemmas: HashMap<String, String>) -> Self {
        Self { lemmas }
    }

    pub fn load(file_path: &str) -> Result<Self, PersistError> {
        let lemmas = files_handling::read_input::<HashMap<String, String>>(file_path)?;
        info!(entries = lemmas.len(), path = file_path, "loaded lemma dictionary");
        Ok(Self::new(lemmas))
    }
}

impl Lemmatizer for DictionaryLemmatizer {
    fn lemma(&self, word: &str) -> Option<String> {
        let word = word.to_lowercase();
        match self.lemmas.get(&word) {
            Some(lemma) if lemma.trim().is_empty() => None,
            Some(lemma) => Some(lemma.to_owned()),
            None => Some(word),
        }
    }
}

pub struct Analyzer {
    tokenizer: Box<dyn Tokenizer>,
    lemmatizer: Box<dyn Lemmatizer>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new(Box::new(PunctuationTokenizer), Box::new(IdentityLemmatizer))
    }
}

impl Analyzer {
    pub fn new(tokenizer: Box<dyn Tokenizer>, lemmatizer: Box<dyn Lemmatizer>) -> Self {
        Self { tokenizer, lemmatizer }
    }

    /// Builds the analyzer described by the run parameters (dictionary lemmatizer if a
    /// lemma file is configured).
    pub fn from_params(params: &Params) -> Result<Self, PersistError> {
        match &params.lemma_file {
            Some(path) => Ok(Self::new(
                Box::new(PunctuationTokenizer),
                Box::new(DictionaryLemmatizer::load(path)?),
            )),
            None => Ok(Self::default()),
        }
    }

    pub fn lemmas(&self, text: &str) -> Vec<String> {
        self.tokenizer
            .tokenize(text)
            .iter()
            .filter_map(|word| self.lemmatizer.lemma(word))
            .filter(|lemma| !lemma.is_empty())
            .collect()
    }

    // documents are independent, analyze them in parallel
    pub fn analyze_corpus<S: AsRef<str> + Sync>(&self, texts: &[S]) -> Vec<Vec<String>> {
        texts.par_iter().map(|text| self.lemmas(text.as_ref())).collect()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn tokenizer_strips_unicode_punctuation() {
        let tokens = PunctuationTokenizer.tokenize("Hello, World! «Привет»\u{00A0}мир — 42$");
        assert_eq!(tokens, vec!["hello", "world", "привет", "мир", "42"]);
    }

    #[test]
    fn tokenizer_drops_quot_entities_and_empties() {
        let tokens = PunctuationTokenizer.tokenize("  &quot;cat&quot;   dog \n\n ");
        assert_eq!(tokens, vec!["cat", "dog"]);
        assert!(PunctuationTokenizer.tokenize("").is_empty());
        assert!(PunctuationTokenizer.tokenize(" ... !!! ").is_empty());
    }

    #[test]
    fn tokenizer_drops_html_tags_and_attributes() {
        let tokens = PunctuationTokenizer.tokenize("<p class=\"lead\">cat</p><br/>dog");
        assert_eq!(tokens, vec!["cat", "dog"]);
        assert_eq!(strip_markup("<b>a</b> &quot;b&quot;"), " a  b");
        // a lone angle bracket is not a tag
        assert_eq!(PunctuationTokenizer.tokenize("3 < 4"), vec!["3", "4"]);
    }

    #[test]
    fn dictionary_lemmatizer_falls_back_to_word() {
        let mut map = HashMap::new();
        map.insert("cats".to_string(), "cat".to_string());
        map.insert("the".to_string(), " ".to_string());
        let analyzer = Analyzer::new(Box::new(PunctuationTokenizer), Box::new(DictionaryLemmatizer::new(map)));

        assert_eq!(analyzer.lemmas("The Cats, dogs"), vec!["cat", "dogs"]);
    }

    #[test]
    fn corpus_analysis_keeps_document_order() {
        let analyzer = Analyzer::default();
        let docs = ["cat dog", "", "bird fish"];
        let sequences = analyzer.analyze_corpus(&docs);
        assert_eq!(sequences.len(), 3);
        assert_eq!(sequences[0], vec!["cat", "dog"]);
        assert!(sequences[1].is_empty());
        assert_eq!(sequences[2], vec!["bird", "fish"]);
    }
}
