/// Values the server reports about itself during the startup handshake.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reported as `server_version`.
    pub server_version: String,
    /// Reported as `server_encoding`.
    pub server_encoding: String,
    /// Used when the client's startup packet omits `client_encoding`.
    pub default_client_encoding: String,
    /// Users reported with `is_superuser = on`.
    pub superusers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_version: "15.2".to_string(),
            server_encoding: "UTF8".to_string(),
            default_client_encoding: "UTF8".to_string(),
            superusers: Vec::new(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn is_superuser(&self, user: &str) -> bool {
        self.superusers.iter().any(|u| u == user)
    }
}
