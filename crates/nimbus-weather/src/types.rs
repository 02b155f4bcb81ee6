/// Failure kinds of the remote weather/icon fetch collaborator.
///
/// Nimbus never retries on the collaborator's behalf; these are passed
/// through to the caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Failed to decode data: {0}")]
    Decode(String),
    #[error("Server error with code: {0}")]
    ServerStatus(u16),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Short message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network(_) => "Network error. Check your connection.".to_string(),
            Self::NotFound(_) => "City not found. Please check the spelling.".to_string(),
            Self::Decode(_) => "Received unexpected data from the weather service.".to_string(),
            Self::ServerStatus(code) => format!("Weather service error ({})", code),
            Self::InvalidRequest(_) => "Invalid request".to_string(),
        }
    }
}

/// Trim surrounding whitespace from a city search query.
pub fn normalize_city_query(input: &str) -> &str {
    input.trim()
}

/// A city query is usable when it has at least two characters after trimming.
pub fn is_valid_city_name(input: &str) -> bool {
    normalize_city_query(input).chars().count() >= 2
}

/// Render a byte count the way file sizes are shown in settings
/// (decimal units, one fractional digit).
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1_000.0;
    const MB: f64 = 1_000_000.0;
    const GB: f64 = 1_000_000_000.0;

    if bytes == 0 {
        return "Zero KB".to_string();
    }

    let b = bytes as f64;
    if b < MB {
        format!("{:.1} KB", b / KB)
    } else if b < GB {
        format!("{:.1} MB", b / MB)
    } else {
        format!("{:.1} GB", b / GB)
    }
}
