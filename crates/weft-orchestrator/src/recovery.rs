//! Error recovery
//!
//! Every task failure passes through here before it is final:
//! - classify the failure and estimate its severity
//! - look up fixes learned for the same error signature
//! - decide whether to retry and after how long
//! - record the decision as an episodic memory
//!
//! Learned fixes are attached as advisory hints only; nothing here changes
//! how a step is executed.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use weft_core::fail_open::fail_open;
use weft_core::{MemoryRecord, RecordType, Result, RetryConfig, Step, TaskOutcome, WeftError};
use weft_memory::{MemoryStore, RecordFilter};

/// Coarse failure class driving the retry table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    ResourceExhaustion,
    ValidationError,
    PermissionError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::ValidationError => "validation_error",
            Self::PermissionError => "permission_error",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ValidationError | Self::PermissionError)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "transient" => Ok(Self::Transient),
            "resource_exhaustion" => Ok(Self::ResourceExhaustion),
            "validation_error" | "validation" => Ok(Self::ValidationError),
            "permission_error" | "permission" => Ok(Self::PermissionError),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid error category: {}", s)),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone)]
struct ClassifierRule {
    category: ErrorCategory,
    pattern: Regex,
}

// First match wins, so the narrow classes come before Transient
const BUILTIN_RULES: &[(ErrorCategory, &str)] = &[
    (
        ErrorCategory::PermissionError,
        r"(?i)permission denied|access denied|forbidden|unauthori[sz]ed|not permitted|\beacces\b|\beperm\b|\b40[13]\b",
    ),
    (
        ErrorCategory::ResourceExhaustion,
        r"(?i)waiting for an? \S+ slot|out of memory|no space left|disk full|too many (open files|requests)|rate.?limit|quota|resource(s)? exhausted|\b429\b",
    ),
    (
        ErrorCategory::ValidationError,
        r"(?i)invalid|validation|malformed|missing .*input|parse error|failed to parse|unknown resource category|no handler registered|bad request|schema|\b400\b",
    ),
    (
        ErrorCategory::Transient,
        r"(?i)timed? ?out|connection (reset|refused|closed|aborted)|temporar(y|ily)|unavailable|try again|\beagain\b|broken pipe|network|\b50[234]\b",
    ),
];

const CRITICAL_PATTERN: &str =
    r"(?i)out of memory|\boom\b|corrupt|fatal|panic|disk full|no space left|data loss";

fn builtin_rules() -> &'static [ClassifierRule] {
    static RULES: OnceLock<Vec<ClassifierRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        BUILTIN_RULES
            .iter()
            .map(|(category, pattern)| ClassifierRule {
                category: *category,
                pattern: Regex::new(pattern).expect("builtin classifier pattern"),
            })
            .collect()
    })
}

fn critical_pattern() -> &'static Regex {
    static CRITICAL: OnceLock<Regex> = OnceLock::new();
    CRITICAL.get_or_init(|| Regex::new(CRITICAL_PATTERN).expect("builtin severity pattern"))
}

/// Maps failure messages to an [`ErrorCategory`] by pattern
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassifierRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self {
            rules: builtin_rules().to_vec(),
        }
    }

    /// Built-in rules plus the `[[retry.rules]]` entries, which win in order
    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        let mut classifier = Self::new();
        for rule in config.rules.iter().rev() {
            let category: ErrorCategory = rule.category.parse().map_err(WeftError::Config)?;
            classifier = classifier.with_rule(category, &rule.pattern)?;
        }
        Ok(classifier)
    }

    /// Add a rule checked before the built-in ones
    pub fn with_rule(mut self, category: ErrorCategory, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| WeftError::Config(format!("invalid classifier pattern: {}", e)))?;
        self.rules.insert(0, ClassifierRule { category, pattern });
        Ok(self)
    }

    pub fn classify(&self, message: &str) -> ErrorCategory {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(message))
            .map_or(ErrorCategory::Unknown, |rule| rule.category)
    }

    /// Classify an adapter outcome; the executor's tag decides unmatched messages
    pub fn classify_outcome(&self, outcome: &TaskOutcome) -> ErrorCategory {
        match outcome {
            TaskOutcome::Ok(_) => ErrorCategory::Unknown,
            TaskOutcome::TransientFailure { message, .. } => match self.classify(message) {
                ErrorCategory::Unknown => ErrorCategory::Transient,
                category => category,
            },
            TaskOutcome::PermanentFailure { message, .. }
            | TaskOutcome::UnclassifiedFailure { message, .. } => self.classify(message),
        }
    }

    pub fn estimate_severity(&self, category: ErrorCategory, message: &str) -> Severity {
        if critical_pattern().is_match(message) {
            return Severity::Critical;
        }
        match category {
            ErrorCategory::PermissionError => Severity::High,
            ErrorCategory::ValidationError
            | ErrorCategory::ResourceExhaustion
            | ErrorCategory::Unknown => Severity::Medium,
            ErrorCategory::Transient => Severity::Low,
        }
    }
}

/// Outcome of [`RetryStrategy::decide`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay_seconds: f64,
    pub max_attempts: u32,
    pub reason: String,
}

impl RetryDecision {
    fn give_up(max_attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            retry: false,
            delay_seconds: 0.0,
            max_attempts,
            reason: reason.into(),
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_seconds.max(0.0))
    }
}

/// Retry table with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    config: RetryConfig,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryStrategy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Backoff before the retry that follows failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let delay = self.config.base_delay_secs * self.config.multiplier.powi(exponent);
        delay.min(self.config.max_delay_secs).max(0.0)
    }

    /// Decide what to do after attempt number `attempt` failed
    pub fn decide(&self, category: ErrorCategory, severity: Severity, attempt: u32) -> RetryDecision {
        if severity == Severity::Critical {
            return RetryDecision::give_up(attempt, "critical failure, escalating");
        }

        let max_attempts = match category {
            ErrorCategory::ValidationError | ErrorCategory::PermissionError => {
                return RetryDecision::give_up(1, format!("{} is not retryable", category));
            }
            ErrorCategory::Transient | ErrorCategory::ResourceExhaustion => {
                self.config.max_attempts
            }
            ErrorCategory::Unknown => self.config.unknown_max_attempts,
        };

        if attempt >= max_attempts {
            return RetryDecision::give_up(
                max_attempts,
                format!("{} attempts exhausted", max_attempts),
            );
        }

        let delay_seconds = match category {
            ErrorCategory::Unknown => self.config.base_delay_secs,
            _ => self.backoff(attempt),
        };

        RetryDecision {
            retry: true,
            delay_seconds,
            max_attempts,
            reason: format!("{} failure, attempt {} of {}", category, attempt, max_attempts),
        }
    }
}

/// Stable signature for "the same error": category plus normalized message
pub fn error_signature(category: ErrorCategory, message: &str) -> String {
    let normalized = normalize_message(message);
    let digest = Sha256::digest(format!("{}:{}", category, normalized).as_bytes());
    hex::encode(digest)
}

/// Strip the parts of a message that vary between occurrences
pub fn normalize_message(message: &str) -> String {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            (r#""[^"]*"|'[^']*'"#, "<str>"),
            (r"(?:[A-Za-z]:)?(?:[/\\][\w.\-]+)+[/\\]?", "<path>"),
            (
                r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
                "<id>",
            ),
            (r"(?i)\b(?:0x)?[0-9a-f]*\d[0-9a-f]*[a-f][0-9a-f]*\b", "<id>"),
            (r"(?i)\b(?:0x)?[0-9a-f]*[a-f][0-9a-f]*\d[0-9a-f]*\b", "<id>"),
            (r"\d+", "<n>"),
            (r"\s+", " "),
        ]
        .into_iter()
        .map(|(pattern, replacement)| {
            (
                Regex::new(pattern).expect("builtin normalization pattern"),
                replacement,
            )
        })
        .collect()
    });

    let mut normalized = message.trim().to_lowercase();
    for (pattern, replacement) in patterns {
        normalized = pattern.replace_all(&normalized, *replacement).into_owned();
    }
    normalized
}

/// Full decision for one failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryDecision {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub signature: String,
    pub attempt: u32,
    pub retry: RetryDecision,
    /// Fix learned from an earlier failure with the same signature
    pub hint: Option<String>,
}

const RECOVERY_CATEGORY: &str = "recovery";

/// Classifier, retry table and memory, wired together
pub struct ErrorRecovery {
    classifier: ErrorClassifier,
    strategy: RetryStrategy,
    memory: Option<MemoryStore>,
}

impl ErrorRecovery {
    pub fn new(classifier: ErrorClassifier, strategy: RetryStrategy) -> Self {
        Self {
            classifier,
            strategy,
            memory: None,
        }
    }

    pub fn with_memory(mut self, memory: MemoryStore) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }

    /// Decide how to handle failed attempt number `attempt` of `step`
    pub async fn handle_failure(
        &self,
        step: &Step,
        outcome: &TaskOutcome,
        attempt: u32,
    ) -> RecoveryDecision {
        let message = outcome.error_message().unwrap_or("unknown failure");
        let category = self.classifier.classify_outcome(outcome);
        let severity = self.classifier.estimate_severity(category, message);
        let signature = error_signature(category, message);
        let hint = self.lookup_fix(&signature).await;
        let retry = if outcome.is_permanent() {
            RetryDecision::give_up(attempt, "executor reported a permanent failure")
        } else {
            self.strategy.decide(category, severity, attempt)
        };

        if retry.retry {
            info!(
                "Step {} failed ({}, {}), retrying in {:.2}s: {}",
                step.id, category, severity, retry.delay_seconds, message
            );
        } else {
            warn!(
                "Step {} failed ({}, {}), not retrying ({}): {}",
                step.id, category, severity, retry.reason, message
            );
        }

        let decision = RecoveryDecision {
            category,
            severity,
            signature,
            attempt,
            retry,
            hint,
        };
        self.record_decision(step, message, &decision).await;
        decision
    }

    /// Most recent fix recorded for `signature`
    pub async fn lookup_fix(&self, signature: &str) -> Option<String> {
        let memory = self.memory.as_ref()?;
        let mut query = memory
            .query(
                RecordType::Procedural,
                RecordFilter::new()
                    .tag(signature_tag(signature))
                    .newest_first()
                    .limit(1),
            )
            .await;

        let record = query.next().await?;
        let fix = record
            .content
            .get("fix")
            .and_then(|fix| fix.as_str())
            .map(str::to_string);
        if fix.is_some() {
            debug!("Found learned fix for signature {}", &signature[..12.min(signature.len())]);
        }
        fix
    }

    /// Store a fix for future failures with the same signature
    pub async fn record_fix(&self, signature: &str, fix: &str) -> Result<Option<String>> {
        let Some(memory) = &self.memory else {
            return Ok(None);
        };
        let record = MemoryRecord::procedural(
            RECOVERY_CATEGORY,
            json!({ "signature": signature, "fix": fix }),
        )
        .with_tag(signature_tag(signature));
        memory.save(record).await.map(Some)
    }

    /// Remember that a retry was enough for this signature
    pub async fn record_recovered_by_retry(&self, step: &Step, signature: &str, attempts: u32) {
        let fix = format!(
            "Recovered by retrying; step {} succeeded on attempt {}",
            step.id, attempts
        );
        fail_open("recovery::record_fix", self.record_fix(signature, &fix)).await;
    }

    async fn record_decision(&self, step: &Step, message: &str, decision: &RecoveryDecision) {
        let Some(memory) = &self.memory else {
            return;
        };
        let record = MemoryRecord::episodic(
            RECOVERY_CATEGORY,
            json!({
                "step": step.id,
                "resource_category": step.resource_category,
                "message": message,
                "decision": decision,
            }),
        )
        .with_tags([
            signature_tag(&decision.signature),
            format!("step:{}", step.id),
            decision.category.to_string(),
        ]);
        fail_open("recovery::record_decision", memory.save(record)).await;
    }
}

pub fn signature_tag(signature: &str) -> String {
    format!("signature:{}", signature)
}
