//! Importance scoring
//!
//! Scorers are pure functions of a turn and the conversation it joins. Identical
//! inputs always produce identical scores, so promotion decisions are
//! reproducible.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use super::turn::{Importance, Role, Turn};

/// Assigns an importance to a turn
pub trait ImportanceScorer: Send + Sync {
    /// Score `turn` given the user's turns recorded before it (oldest first)
    fn score(&self, turn: &Turn, conversation: &[Turn]) -> Importance;

    /// Scorer name for logs
    fn name(&self) -> &'static str {
        "custom"
    }
}

impl<F> ImportanceScorer for F
where
    F: Fn(&Turn, &[Turn]) -> Importance + Send + Sync,
{
    fn score(&self, turn: &Turn, conversation: &[Turn]) -> Importance {
        self(turn, conversation)
    }
}

static PERSONAL_FACT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?iu)\b(my name is|call me|i am|i'm|i live|i work|i was born|my birthday|my (wife|husband|son|daughter|mother|father|job|address|email|phone)|меня зовут|я живу|я работаю|я родил|мой день рождения)",
    )
    .expect("personal fact pattern is valid")
});

static EXPLICIT_MEMORY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?iu)(remember|don't forget|do not forget|important|запомни|не забудь|важно)")
        .expect("explicit memory pattern is valid")
});

static PREFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?iu)\b(i (really )?(like|love|hate|prefer|want|need)|я (люблю|ненавижу|хочу|предпочитаю))")
        .expect("preference pattern is valid")
});

static NUMERIC_DETAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d").expect("numeric pattern is valid"));

static PLEASANTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?iu)^\s*(hi|hello|hey|ok|okay|thanks|thank you|bye|yes|no|привет|ок|спасибо|пока|да|нет)[\s!.?]*$")
        .expect("pleasantry pattern is valid")
});

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w{4,}").expect("word pattern is valid"));

/// Feature weights for [`HeuristicScorer`]
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    /// Starting score of every turn
    pub base: u32,
    /// Bonus for turns written by the user
    pub user_role: u32,
    /// Bonus for more than `long_content_chars` characters
    pub long_content: u32,
    /// Threshold for the length bonus
    pub long_content_chars: usize,
    /// Bonus for statements about the user themselves
    pub personal_fact: u32,
    /// Bonus for explicit "remember this" markers
    pub explicit_memory: u32,
    /// Bonus for stated preferences
    pub preference: u32,
    /// Bonus for numbers, dates, amounts
    pub numeric_detail: u32,
    /// Bonus for questions
    pub question: u32,
    /// Bonus when most of the vocabulary is new to the conversation
    pub novelty: u32,
    /// Penalty for greetings and acknowledgements
    pub pleasantry_penalty: u32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            base: 1,
            user_role: 1,
            long_content: 1,
            long_content_chars: 200,
            personal_fact: 4,
            explicit_memory: 4,
            preference: 3,
            numeric_detail: 1,
            question: 1,
            novelty: 1,
            pleasantry_penalty: 1,
        }
    }
}

/// Content-feature heuristic scorer
///
/// With default weights a plain user message scores 2, a personal fact or an
/// explicit "remember" request from the user reaches the default threshold of 5.
#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer {
    weights: ScoringWeights,
}

impl HeuristicScorer {
    /// Create a scorer with default weights
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scorer with custom weights
    pub fn with_weights(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    fn is_novel(turn: &Turn, conversation: &[Turn]) -> bool {
        let words: HashSet<String> = WORD
            .find_iter(&turn.content)
            .map(|m| m.as_str().to_lowercase())
            .collect();
        if words.len() < 3 {
            return false;
        }

        let seen: HashSet<String> = conversation
            .iter()
            .flat_map(|t| WORD.find_iter(&t.content).map(|m| m.as_str().to_lowercase()))
            .collect();

        let fresh = words.iter().filter(|w| !seen.contains(*w)).count();
        fresh * 4 >= words.len() * 3
    }
}

impl ImportanceScorer for HeuristicScorer {
    fn score(&self, turn: &Turn, conversation: &[Turn]) -> Importance {
        let w = &self.weights;
        let content = turn.content.as_str();
        let mut score = w.base;

        if turn.role == Role::User {
            score += w.user_role;
        }
        if turn.char_len() > w.long_content_chars {
            score += w.long_content;
        }
        if PERSONAL_FACT.is_match(content) {
            score += w.personal_fact;
        }
        if EXPLICIT_MEMORY.is_match(content) {
            score += w.explicit_memory;
        }
        if PREFERENCE.is_match(content) {
            score += w.preference;
        }
        if NUMERIC_DETAIL.is_match(content) {
            score += w.numeric_detail;
        }
        if content.contains('?') {
            score += w.question;
        }
        if !conversation.is_empty() && Self::is_novel(turn, conversation) {
            score += w.novelty;
        }
        if PLEASANTRY.is_match(content) {
            score = score.saturating_sub(w.pleasantry_penalty);
        }

        Importance::new(score)
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> Turn {
        Turn::new(1, Role::User, content, "auto")
    }

    fn assistant(content: &str) -> Turn {
        Turn::new(1, Role::Assistant, content, "auto")
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let scorer = HeuristicScorer::new();
        let history = vec![user("what is the weather like"), assistant("sunny today")];
        let turn = user("My name is Alice and I live in Berlin");

        let first = scorer.score(&turn, &history);
        let second = scorer.score(&turn.clone(), &history);
        assert_eq!(first, second);
    }

    #[test]
    fn test_plain_message_scores_below_default_threshold() {
        let scorer = HeuristicScorer::new();
        let score = scorer.score(&user("tell me a joke"), &[]);
        assert_eq!(score, Importance::new(2));
        assert!(!score.meets(5));
    }

    #[test]
    fn test_personal_fact_reaches_default_threshold() {
        let scorer = HeuristicScorer::new();
        let score = scorer.score(&user("my name is Alice"), &[]);
        assert!(score.meets(5), "got {}", score);

        let score = scorer.score(&user("Меня зовут Алиса"), &[]);
        assert!(score.meets(5), "got {}", score);
    }

    #[test]
    fn test_explicit_memory_request() {
        let scorer = HeuristicScorer::new();
        let score = scorer.score(&user("please remember the meeting is on friday"), &[]);
        assert!(score.meets(5), "got {}", score);
    }

    #[test]
    fn test_pleasantry_is_penalised() {
        let scorer = HeuristicScorer::new();
        assert_eq!(scorer.score(&user("thanks!"), &[]), Importance::new(1));
        assert_eq!(scorer.score(&assistant("ok"), &[]), Importance::new(0));
    }

    #[test]
    fn test_novelty_against_conversation() {
        let scorer = HeuristicScorer::new();
        let history = vec![user("rust borrow checker lifetimes question")];

        let repeated = assistant("borrow checker lifetimes again");
        let fresh = assistant("gardening tomatoes requires sunlight");

        let repeated_score = scorer.score(&repeated, &history);
        let fresh_score = scorer.score(&fresh, &history);
        assert_eq!(fresh_score.value(), repeated_score.value() + 1);
    }

    #[test]
    fn test_closure_scorer() {
        let scorer = |turn: &Turn, _: &[Turn]| Importance::new(turn.char_len() as u32);
        assert_eq!(scorer.score(&user("abcd"), &[]), Importance::new(4));
        assert_eq!(ImportanceScorer::name(&scorer), "custom");
    }
}
