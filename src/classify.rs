//! Telling a declined signature apart from real failures
use super::error::{ConfigError, LedgerError, MarketError, ValidationError};

const DECLINED_PHRASE: &str = "rejected";
const SHORT_MESSAGE_LIMIT: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The signer chose not to authorize the call.
    Declined,
    Config,
    Validation,
    /// The ledger's own rules refused or reverted the call.
    Rule,
    Infrastructure,
}

impl ErrorClass {
    pub fn is_fault(self) -> bool {
        matches!(self, ErrorClass::Rule | ErrorClass::Infrastructure)
    }
}

/// Declined anywhere in the chain first, then the phrase in any message.
pub fn is_user_declined(err: &anyhow::Error) -> bool {
    if err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<LedgerError>(),
            Some(LedgerError::Declined(_))
        )
    }) {
        return true;
    }
    err.chain()
        .any(|cause| cause.to_string().to_lowercase().contains(DECLINED_PHRASE))
}

pub fn classify(err: &anyhow::Error) -> ErrorClass {
    if is_user_declined(err) {
        return ErrorClass::Declined;
    }
    for cause in err.chain() {
        if cause.is::<ConfigError>() {
            return ErrorClass::Config;
        }
        if cause.is::<ValidationError>() {
            return ErrorClass::Validation;
        }
        if cause.is::<MarketError>() {
            return ErrorClass::Validation;
        }
        if let Some(ledger) = cause.downcast_ref::<LedgerError>() {
            return match ledger {
                LedgerError::Rule(_) | LedgerError::Reverted { .. } => ErrorClass::Rule,
                _ => ErrorClass::Infrastructure,
            };
        }
    }
    ErrorClass::Infrastructure
}

/// Whether the failure asks the caller to fill in the comment field.
pub fn needs_comment(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<ValidationError>(),
            Some(ValidationError::CommentRequired { .. })
        )
    })
}

/// First sentence of the message, trimmed and capped.
pub fn short_message(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or_default();
    let end = first_line
        .char_indices()
        .find(|(i, c)| {
            matches!(c, '.' | '!' | '?')
                && first_line[i + c.len_utf8()..]
                    .chars()
                    .next()
                    .is_none_or(char::is_whitespace)
        })
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(first_line.len());
    let sentence = first_line[..end].trim();
    if sentence.chars().count() <= SHORT_MESSAGE_LIMIT {
        return sentence.to_string();
    }
    let mut cut: String = sentence.chars().take(SHORT_MESSAGE_LIMIT - 3).collect();
    cut.push_str("...");
    cut
}

/// Logs a failed action at the severity its class calls for and returns the
/// message to show the user.
pub fn report(action: &str, err: &anyhow::Error) -> String {
    let class = classify(err);
    match class {
        ErrorClass::Declined => {
            tracing::info!(action, "signature declined");
            return "Request declined in wallet.".to_string();
        }
        ErrorClass::Config | ErrorClass::Validation => {
            tracing::warn!(action, error = %err, ?class, "action refused locally");
        }
        ErrorClass::Rule | ErrorClass::Infrastructure => {
            tracing::error!(action, error = %format_args!("{err:#}"), ?class, "action failed");
        }
    }
    short_message(&root_message(err))
}

/// The innermost message, which names the actual cause rather than the step.
fn root_message(err: &anyhow::Error) -> String {
    err.chain()
        .last()
        .map(|cause| cause.to_string())
        .unwrap_or_else(|| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn declined_signature_wrapped_in_context() {
        let err = Err::<(), _>(LedgerError::Declined("no".into()))
            .context("Failed to accept deal")
            .unwrap_err();
        assert_eq!(classify(&err), ErrorClass::Declined);
    }

    #[test]
    fn phrase_match_is_case_insensitive() {
        assert!(is_user_declined(&anyhow!("MetaMask Tx Signature: User REJECTED the transaction")));
        assert!(!is_user_declined(&anyhow!("insufficient reserve")));
    }

    #[test]
    fn rule_refusals_are_faults() {
        let err = anyhow::Error::from(LedgerError::Rule("stale price".into()));
        assert_eq!(classify(&err), ErrorClass::Rule);
        assert!(classify(&err).is_fault());
    }

    #[test]
    fn short_message_keeps_first_sentence() {
        assert_eq!(
            short_message("  connection reset by peer. retry later"),
            "connection reset by peer."
        );
        assert_eq!(short_message("version 1.2 is not supported"), "version 1.2 is not supported");
        assert_eq!(short_message(&"x".repeat(500)).chars().count(), SHORT_MESSAGE_LIMIT);
    }
}
