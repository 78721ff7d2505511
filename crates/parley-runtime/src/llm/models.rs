//! Model catalog: default model names and known context-window limits.

pub const DEFAULT_NATIVE_MODEL: &str = "gemini-2.5-pro";
pub const DEFAULT_FALLBACK_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_EMBEDDING_MODEL: &str = "gemini-embedding-001";

/// Context-window limit for a model, `None` when the model is unknown
pub fn token_limit(model: &str) -> Option<u32> {
    match model {
        "gemini-1.5-pro" => Some(2_097_152),
        "gemini-1.5-flash"
        | "gemini-2.5-pro-preview-05-06"
        | "gemini-2.5-pro-preview-06-05"
        | "gemini-2.5-pro"
        | "gemini-2.5-flash-preview-05-20"
        | "gemini-2.5-flash"
        | "gemini-2.0-flash" => Some(1_048_576),
        "gemini-2.0-flash-preview-image-generation" => Some(32_000),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_and_unknown_limits() {
        assert_eq!(token_limit("gemini-2.5-pro"), Some(1_048_576));
        assert_eq!(token_limit("gemini-1.5-pro"), Some(2_097_152));
        assert_eq!(token_limit("ep-20250627193526-wzbxz"), None);
    }

    #[test]
    fn test_default_models_have_limits() {
        assert!(token_limit(DEFAULT_NATIVE_MODEL).is_some());
        assert!(token_limit(DEFAULT_FALLBACK_MODEL).is_some());
    }
}
