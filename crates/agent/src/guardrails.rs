use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use threadline_core::config::{GuardrailsConfig, PersonalDataAction};

/// Span, in bytes, re-checked behind the last safe checkpoint when a streamed
/// prefix grows. Covers the longest built-in phrase.
const BUILTIN_WINDOW_BYTES: usize = 96;

const REDACTION_MARK: &str = "[redacted]";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailCategory {
    SexualAdult,
    ViolenceThreat,
    PersonalSensitive,
    PoliticalReligious,
    ControlledSubstances,
}

impl GuardrailCategory {
    /// Evaluation order. The first matching category names the verdict.
    pub const PRIORITY: [GuardrailCategory; 5] = [
        Self::SexualAdult,
        Self::ViolenceThreat,
        Self::PersonalSensitive,
        Self::PoliticalReligious,
        Self::ControlledSubstances,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SexualAdult => "sexual_adult",
            Self::ViolenceThreat => "violence_threat",
            Self::PersonalSensitive => "personal_sensitive",
            Self::PoliticalReligious => "political_religious",
            Self::ControlledSubstances => "controlled_substances",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::PRIORITY.into_iter().find(|category| category.as_str() == name)
    }

    pub fn refusal_message(&self) -> &'static str {
        match self {
            Self::SexualAdult => {
                "I can't help with sexual or adult content. Let's keep this thread professional."
            }
            Self::ViolenceThreat => "I can't help with violent or threatening content.",
            Self::PersonalSensitive => {
                "That message contains personal or sensitive information, so I won't process it. Please remove it and try again."
            }
            Self::PoliticalReligious => {
                "I stay out of political and religious debates. Happy to help with something else."
            }
            Self::ControlledSubstances => {
                "I can't help with requests involving controlled substances."
            }
        }
    }

    fn builtin_patterns(&self) -> &'static [&'static str] {
        match self {
            Self::SexualAdult => &[
                r"(?i)\b(?:explicit (?:content|images?|pictures?|photos?|videos?|material)|sexually explicit|porn\w*|nsfw|nudes?|nudity|erotic\w*|xxx|sex tape)\b",
            ],
            Self::ViolenceThreat => &[
                r"(?i)\b(?:(?:i'?ll|i will|gonna|going to) (?:kill|hurt|shoot|stab|beat up) (?:you|him|her|them|everyone)|kill (?:you|him|her|them|myself)|(?:make|build) a bomb|bomb threat|shoot up|murder)\b",
            ],
            Self::PersonalSensitive => &[
                r"\b\d{3}-\d{2}-\d{4}\b",
                r"\b\d{3}\.\d{3}\.\d{3}-\d{2}\b",
                r"\b(?:\d{4}[ -]?){3}\d{4}\b",
                r"(?i)\b(?:password|passwd|senha)\s*[:=]\s*\S+",
            ],
            Self::PoliticalReligious => &[
                r"(?i)\b(?:who should (?:i|we) vote for|(?:democrats?|republicans?|liberals?|conservatives?) (?:are|is) (?:wrong|evil|stupid|idiots)|(?:is|does) god (?:real|exists?)|which religion is (?:right|true|better)|abortion (?:debate|is murder)|election (?:was )?(?:stolen|rigged))\b",
            ],
            Self::ControlledSubstances => &[
                r"(?i)\b(?:cocaine|heroin|meth(?:amphetamine)?|lsd|mdma|ecstasy pills?|fentanyl|buy (?:weed|drugs)|get high|marijuana|cannabis)\b",
            ],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub category: Option<GuardrailCategory>,
    pub rewritten_text: Option<String>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self { allowed: true, category: None, rewritten_text: None }
    }

    pub fn block(category: GuardrailCategory) -> Self {
        Self { allowed: false, category: Some(category), rewritten_text: None }
    }

    /// Text that should continue through the pipeline in place of the input.
    pub fn effective_text<'a>(&'a self, original: &'a str) -> &'a str {
        self.rewritten_text.as_deref().unwrap_or(original)
    }
}

#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("guardrail pattern for `{category}` failed to compile: {source}")]
    InvalidPattern { category: &'static str, source: regex::Error },
}

#[derive(Clone, Debug)]
struct CategoryMatcher {
    category: GuardrailCategory,
    patterns: Vec<Regex>,
}

impl CategoryMatcher {
    fn is_match(&self, text: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(text))
    }

    fn redact(&self, text: &str) -> String {
        self.patterns.iter().fold(text.to_string(), |current, pattern| {
            pattern.replace_all(&current, REDACTION_MARK).into_owned()
        })
    }
}

/// Deterministic policy evaluator. Holds no per-call state, so one instance is
/// shared by every pipeline.
#[derive(Clone, Debug)]
pub struct GuardrailChain {
    enabled: bool,
    personal_data: PersonalDataAction,
    matchers: Vec<CategoryMatcher>,
    window_bytes: usize,
}

impl GuardrailChain {
    pub fn new(config: &GuardrailsConfig) -> Result<Self, GuardrailError> {
        let mut matchers = Vec::with_capacity(GuardrailCategory::PRIORITY.len());
        let mut window_bytes = BUILTIN_WINDOW_BYTES;

        for category in GuardrailCategory::PRIORITY {
            let mut patterns = category
                .builtin_patterns()
                .iter()
                .map(|pattern| compile(category, pattern))
                .collect::<Result<Vec<_>, _>>()?;

            let extra = config
                .extra_terms
                .get(category.as_str())
                .map(|terms| {
                    terms.iter().map(|term| term.trim()).filter(|term| !term.is_empty())
                })
                .into_iter()
                .flatten()
                .collect::<Vec<_>>();
            if !extra.is_empty() {
                window_bytes = window_bytes.max(extra.iter().map(|term| term.len()).max().unwrap_or(0));
                let alternation =
                    extra.iter().map(|term| regex::escape(term)).collect::<Vec<_>>().join("|");
                patterns.push(compile(category, &format!(r"(?i)\b(?:{alternation})\b"))?);
            }

            matchers.push(CategoryMatcher { category, patterns });
        }

        Ok(Self {
            enabled: config.enabled,
            personal_data: config.inbound_personal_data,
            matchers,
            window_bytes,
        })
    }

    pub fn with_defaults() -> Result<Self, GuardrailError> {
        Self::new(&GuardrailsConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn evaluate(&self, text: &str, direction: Direction) -> Verdict {
        if !self.enabled {
            return Verdict::allow();
        }

        let mut rewritten: Option<String> = None;
        for matcher in &self.matchers {
            let current = rewritten.as_deref().unwrap_or(text);
            if !matcher.is_match(current) {
                continue;
            }

            let redact = matcher.category == GuardrailCategory::PersonalSensitive
                && direction == Direction::Inbound
                && self.personal_data == PersonalDataAction::Redact;
            if redact {
                rewritten = Some(matcher.redact(current));
                continue;
            }

            return Verdict::block(matcher.category);
        }

        match rewritten {
            Some(text) => Verdict {
                allowed: true,
                category: Some(GuardrailCategory::PersonalSensitive),
                rewritten_text: Some(text),
            },
            None => Verdict::allow(),
        }
    }

    fn window_bytes(&self) -> usize {
        self.window_bytes
    }
}

fn compile(category: GuardrailCategory, pattern: &str) -> Result<Regex, GuardrailError> {
    Regex::new(pattern)
        .map_err(|source| GuardrailError::InvalidPattern { category: category.as_str(), source })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardStep {
    /// Full text cleared so far, safe to make visible.
    Release(String),
    /// Nothing new can be released yet.
    Hold,
    Blocked(GuardrailCategory),
}

/// Outbound checker for a growing stream. Every check covers all held text
/// plus a window behind the last release, so phrases split across fragments
/// are seen. Released text always stops at a word boundary at least one
/// window short of the newest completed word: a phrase that is still being
/// streamed cannot have any of its words released before it completes.
#[derive(Debug)]
pub struct StreamingGuard {
    chain: Arc<GuardrailChain>,
    buffer: String,
    /// End of the text released so far.
    checkpoint: usize,
    /// End of the text already evaluated.
    checked: usize,
    blocked: Option<GuardrailCategory>,
}

impl StreamingGuard {
    pub fn new(chain: Arc<GuardrailChain>) -> Self {
        Self { chain, buffer: String::new(), checkpoint: 0, checked: 0, blocked: None }
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn push(&mut self, fragment: &str) -> GuardStep {
        if let Some(category) = self.blocked {
            return GuardStep::Blocked(category);
        }
        self.buffer.push_str(fragment);

        if !self.chain.is_enabled() {
            self.checkpoint = self.buffer.len();
            return GuardStep::Release(self.buffer.clone());
        }

        let boundary = match self.buffer.rfind(char::is_whitespace) {
            Some(index) => index,
            None => return GuardStep::Hold,
        };
        if boundary <= self.checked {
            return GuardStep::Hold;
        }

        let window_start = self.window_start();
        let verdict = self.chain.evaluate(&self.buffer[window_start..boundary], Direction::Outbound);
        if !verdict.allowed {
            return self.block(verdict);
        }
        self.checked = boundary;

        match self.release_point(boundary) {
            Some(end) => {
                self.checkpoint = end;
                GuardStep::Release(self.buffer[..end].to_string())
            }
            None => GuardStep::Hold,
        }
    }

    /// Checks the complete text once the stream has ended.
    pub fn finish(&mut self) -> GuardStep {
        if let Some(category) = self.blocked {
            return GuardStep::Blocked(category);
        }

        let verdict = self.chain.evaluate(&self.buffer, Direction::Outbound);
        if !verdict.allowed {
            return self.block(verdict);
        }

        self.checkpoint = self.buffer.len();
        self.checked = self.buffer.len();
        GuardStep::Release(self.buffer.clone())
    }

    /// Last word boundary lying a full window before `boundary`, if it moves
    /// the release forward.
    fn release_point(&self, boundary: usize) -> Option<usize> {
        let mut limit = boundary.checked_sub(self.chain.window_bytes())?;
        while !self.buffer.is_char_boundary(limit) {
            limit -= 1;
        }
        let end = self.buffer[..limit].rfind(char::is_whitespace)?;
        (end > self.checkpoint).then_some(end)
    }

    fn block(&mut self, verdict: Verdict) -> GuardStep {
        let category = verdict.category.unwrap_or(GuardrailCategory::SexualAdult);
        self.blocked = Some(category);
        GuardStep::Blocked(category)
    }

    fn window_start(&self) -> usize {
        let window = self.chain.window_bytes();
        if self.checkpoint <= window {
            return 0;
        }

        let mut start = self.checkpoint - window;
        while !self.buffer.is_char_boundary(start) {
            start -= 1;
        }
        self.buffer[..start].rfind(char::is_whitespace).unwrap_or(0)
    }
}
