use anyhow::Result;
use std::path::Path;

const DEFAULT_CONFIG: &str = r#"# Parley Configuration

# Saved chat sessions, one JSON file each
sessions_dir = "~/.parley/sessions"

[provider]
# oauth-personal | gemini-api-key | ark | gpt-openapi
auth_type = "gemini-api-key"
# Leave empty to read GEMINI_API_KEY / GOOGLE_OAUTH_ACCESS_TOKEN /
# ARK_API_KEY / GPT_OPENAPI_API_KEY
api_key = ""
# Empty = vendor default (ark requires a model; ARK_MODEL / GPT_OPENAPI_MODEL also work)
model = ""
timeout_ms = 120000
# base_url = "http://localhost:8080/v1"

[provider.headers]

[session]
max_turns = 100
compression_threshold = 0.95
streaming = true
fallback_model = "gemini-2.5-flash"
temperature = 0.0
top_p = 1.0
system_instruction = ""
# context_window = 128000
# next_speaker_model = "gemini-2.5-flash"
"#;

/// Initialize a new config file
pub fn run_init(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("Config already exists at {:?}", path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG)?;
    println!("Created config at {:?}", path);
    Ok(())
}
