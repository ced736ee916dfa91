use thiserror::Error;

/// Terminal generation outcomes, kept as a tagged type instead of encoding the
/// kind and payload into one error string. Transient transport failures stay
/// plain `anyhow` errors and are absorbed by the retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerateError {
    #[error("model answered with text instead of an image: {0}")]
    TextOnly(String),
    #[error("model response contained neither an image nor text")]
    NoImage,
    #[error("all generation attempts failed")]
    RetriesExhausted,
    #[error("the remote service rejected the prompt as sensitive")]
    SensitivePrompt,
    #[error("video operation did not complete within the polling bound")]
    Timeout,
    #[error("video download failed ({status})")]
    Download { status: String },
    #[error("no API credential configured")]
    MissingCredential,
    #[error("analysis response was empty")]
    EmptyAnalysis,
    #[error("analysis response was not valid JSON: {0}")]
    MalformedAnalysis(String),
}

impl GenerateError {
    /// Picks out a classified failure from an error chain, if one is there.
    pub fn find_in(err: &anyhow::Error) -> Option<&GenerateError> {
        err.chain().find_map(|cause| cause.downcast_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classified_errors_survive_context_wrapping() {
        let err = anyhow::Error::new(GenerateError::TextOnly("no can do".to_string()))
            .context("generation failed");
        assert_eq!(
            GenerateError::find_in(&err),
            Some(&GenerateError::TextOnly("no can do".to_string()))
        );
    }

    #[test]
    fn unclassified_errors_yield_none() {
        let err: anyhow::Error = anyhow::anyhow!("connection reset")
            .context("request failed")
            .context("generation failed");
        assert_eq!(GenerateError::find_in(&err), None);
    }

    #[test]
    fn download_error_carries_status_text() {
        let err = GenerateError::Download {
            status: "403 Forbidden".to_string(),
        };
        assert_eq!(err.to_string(), "video download failed (403 Forbidden)");
    }
}
