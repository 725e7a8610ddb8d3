//! CLI error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// Error reported by the control plane.
    #[error("{0}")]
    Api(String),

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Usage(String),

    #[error("File error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error parsing JSON file input - {0}")]
    Json(#[from] serde_json::Error),

    #[error("Error parsing YAML file input - {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CliError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    /// Individual causes; compound server errors join causes with
    /// ` -- ` and are printed one per line.
    pub fn causes(&self) -> Vec<String> {
        self.to_string().split(" -- ").map(str::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causes_split() {
        let err = CliError::Api("first cause -- second cause".to_string());
        assert_eq!(err.causes(), vec!["first cause", "second cause"]);
    }
}
