use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use url::Url;

use crate::model::TerminalProfile;

/// Connection settings for a ttyd-style terminal sharing endpoint.
#[derive(Debug, Clone)]
pub struct TtydConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    /// Terminal dimensions announced in the init frame.
    pub columns: u16,
    pub rows: u16,
    pub profile: TerminalProfile,
    /// Extra query string appended to the websocket endpoint.
    pub query: Option<String>,
}

impl TtydConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            use_tls: false,
            columns: 240,
            rows: 60,
            profile: TerminalProfile::Generic,
            query: None,
        }
    }

    pub fn with_profile(mut self, profile: TerminalProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_dimensions(mut self, columns: u16, rows: u16) -> Self {
        self.columns = columns;
        self.rows = rows;
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Base64 `user:pass` token used for both the HTTP Basic-Auth header and
    /// the init frame's `AuthToken` field.
    pub fn auth_token(&self) -> String {
        BASE64.encode(format!("{}:{}", self.username, self.password))
    }

    pub fn endpoint(&self) -> Result<Url, url::ParseError> {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{scheme}://{}:{}/ws", self.host, self.port))?;
        if let Some(ref query) = self.query {
            url.set_query(Some(query));
        }
        Ok(url)
    }
}

impl Default for TtydConfig {
    fn default() -> Self {
        Self::new("localhost", 7681, "demo", "password123")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_reflects_tls_and_query() {
        let config = TtydConfig::new("example.com", 7682, "u", "p")
            .with_tls(true)
            .with_query("arg=shell");
        assert_eq!(
            config.endpoint().unwrap().as_str(),
            "wss://example.com:7682/ws?arg=shell"
        );
    }

    #[test]
    fn auth_token_is_base64_user_colon_pass() {
        let config = TtydConfig::default();
        assert_eq!(config.auth_token(), BASE64.encode("demo:password123"));
    }
}
