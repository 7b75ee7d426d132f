use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::Deserialize;
use url::Url;

use super::{CredentialStore, Token};
use crate::{Error, Result};

/// Lets the logger create files and see only the files it created.
pub const DRIVE_FILE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// OAuth client of an installed application, as downloaded from the Google
/// Cloud console.
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_owned()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_owned()
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Credentials(format!("{}: {e}", path.display())))?;
        Self::from_json(&text).map_err(|e| Error::Credentials(format!("{}: {e}", path.display())))
    }

    fn from_json(text: &str) -> std::result::Result<Self, String> {
        let file: ClientSecretsFile = serde_json::from_str(text).map_err(|e| e.to_string())?;
        file.installed
            .or(file.web)
            .ok_or_else(|| "neither an \"installed\" nor a \"web\" client".to_owned())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl TokenResponse {
    /// Refresh responses usually omit the refresh token, keep the old one then.
    fn into_token(self, previous_refresh_token: Option<String>) -> Token {
        Token {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh_token),
            expires_at: Utc::now() + chrono::Duration::seconds(self.expires_in.max(0)),
        }
    }
}

/// Hands out access tokens, reusing the cached one while it is valid and
/// refreshing it when it expired.
///
/// Only [`Authenticator::login`] may ask the user to log in in a browser.
/// [`Authenticator::access_token`] never blocks on the user, it fails with
/// [`Error::Credentials`] when there is no usable token.
pub struct Authenticator {
    secrets: ClientSecrets,
    store: Box<dyn CredentialStore + Send>,
    agent: ureq::Agent,
    current: Option<Token>,
}

impl Authenticator {
    pub fn new(secrets: ClientSecrets, store: Box<dyn CredentialStore + Send>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(30))
            .build();

        Self {
            secrets,
            store,
            agent,
            current: None,
        }
    }

    /// A token without user interaction: cached, or refreshed.
    pub fn access_token(&mut self) -> Result<String> {
        self.token(false)
    }

    /// Like [`Authenticator::access_token`], but falls back to the browser
    /// login. Meant for start-up, before any data is collected.
    pub fn login(&mut self) -> Result<String> {
        self.token(true)
    }

    fn token(&mut self, interactive: bool) -> Result<String> {
        if let Some(token) = self.current.as_ref().filter(|t| self.store.is_valid(t)) {
            return Ok(token.access_token.clone());
        }

        let cached = match self.current.take() {
            Some(token) => Some(token),
            None => self.store.load()?,
        };

        let token = match cached {
            Some(token) if self.store.is_valid(&token) => token,
            Some(Token {
                refresh_token: Some(refresh_token),
                ..
            }) => match self.refresh(&refresh_token) {
                Ok(token) => {
                    self.store.save(&token)?;
                    token
                }
                Err(e) if interactive => {
                    log::warn!("Token refresh failed ({e}), logging in again");
                    self.interactive_login()?
                }
                Err(e) => return Err(e),
            },
            _ if interactive => self.interactive_login()?,
            _ => {
                return Err(Error::Credentials(
                    "no valid token cached, log in again".into(),
                ))
            }
        };

        let access_token = token.access_token.clone();
        self.current = Some(token);
        Ok(access_token)
    }

    fn interactive_login(&self) -> Result<Token> {
        let token = self.authorize_interactively()?;
        self.store.save(&token)?;
        Ok(token)
    }

    fn refresh(&self, refresh_token: &str) -> Result<Token> {
        log::info!("Refreshing expired access token");
        let response: TokenResponse = self
            .agent
            .post(&self.secrets.token_uri)
            .send_form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.secrets.client_id.as_str()),
                ("client_secret", self.secrets.client_secret.as_str()),
                ("refresh_token", refresh_token),
            ])
            .map_err(credentials_error)?
            .into_json()
            .map_err(|e| Error::Credentials(format!("bad token response: {e}")))?;

        Ok(response.into_token(Some(refresh_token.to_owned())))
    }

    /// Installed-app flow: the user opens the consent page in a browser and
    /// Google redirects back to a one-shot listener on the loopback interface.
    fn authorize_interactively(&self) -> Result<Token> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let redirect_uri = format!("http://127.0.0.1:{}", listener.local_addr()?.port());
        let state = login_state();

        let consent_url = Url::parse_with_params(
            &self.secrets.auth_uri,
            &[
                ("client_id", self.secrets.client_id.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", DRIVE_FILE_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| Error::Credentials(format!("bad auth_uri: {e}")))?;

        println!("Open this URL in your browser to allow access to Google Drive:\n\n    {consent_url}\n");
        log::info!("Waiting for the OAuth redirect on {redirect_uri}");

        let (mut stream, _) = listener.accept()?;
        let mut request_line = String::new();
        BufReader::new(&stream).read_line(&mut request_line)?;

        let outcome = parse_redirect(&request_line, &state);
        let body = match &outcome {
            Ok(_) => "Authorisation complete, you can close this window.",
            Err(_) => "Authorisation failed, see the terminal for details.",
        };
        write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )?;
        let code = outcome?;

        let response: TokenResponse = self
            .agent
            .post(&self.secrets.token_uri)
            .send_form(&[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("client_id", self.secrets.client_id.as_str()),
                ("client_secret", self.secrets.client_secret.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
            ])
            .map_err(credentials_error)?
            .into_json()
            .map_err(|e| Error::Credentials(format!("bad token response: {e}")))?;

        log::info!("Logged in to Google Drive");
        Ok(response.into_token(None))
    }
}

fn login_state() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{:x}{:x}", nanos, std::process::id())
}

/// Pulls the authorisation code out of the redirect's request line,
/// e.g. `GET /?state=..&code=.. HTTP/1.1`.
fn parse_redirect(request_line: &str, expected_state: &str) -> Result<String> {
    let target = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Error::Credentials("malformed redirect request".into()))?;
    let url = Url::parse("http://127.0.0.1")
        .and_then(|base| base.join(target))
        .map_err(|e| Error::Credentials(format!("malformed redirect target: {e}")))?;

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => return Err(Error::Credentials(format!("login refused: {value}"))),
            _ => {}
        }
    }

    if state.as_deref() != Some(expected_state) {
        return Err(Error::Credentials("redirect state does not match".into()));
    }
    code.ok_or_else(|| Error::Credentials("redirect carries no code".into()))
}

fn credentials_error(err: ureq::Error) -> Error {
    match err {
        ureq::Error::Status(code, response) => Error::Credentials(format!(
            "token endpoint returned HTTP {code}: {}",
            response.into_string().unwrap_or_default()
        )),
        ureq::Error::Transport(transport) => {
            Error::Credentials(format!("token endpoint unreachable: {transport}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installed_client_secrets_are_read() {
        let secrets = ClientSecrets::from_json(
            r#"{"installed":{"client_id":"id.apps.googleusercontent.com","client_secret":"s3cret",
                "redirect_uris":["http://localhost"]}}"#,
        )
        .unwrap();
        assert_eq!(secrets.client_id, "id.apps.googleusercontent.com");
        assert_eq!(secrets.token_uri, DEFAULT_TOKEN_URI);
    }

    #[test]
    fn client_secrets_need_a_client() {
        assert!(ClientSecrets::from_json(r#"{"other":{}}"#).is_err());
    }

    #[test]
    fn redirect_yields_the_code() {
        let code = parse_redirect("GET /?state=abc&code=4%2F0Ad&scope=x HTTP/1.1\r\n", "abc");
        assert_eq!(code.unwrap(), "4/0Ad");
    }

    #[test]
    fn redirect_with_wrong_state_or_error_is_refused() {
        assert!(parse_redirect("GET /?state=zzz&code=1 HTTP/1.1", "abc").is_err());
        let err = parse_redirect("GET /?error=access_denied&state=abc HTTP/1.1", "abc");
        assert!(err.unwrap_err().to_string().contains("access_denied"));
        assert!(parse_redirect("", "abc").is_err());
    }

    /// Token cache held in memory.
    struct MemoryStore(std::sync::Mutex<Option<Token>>);

    impl CredentialStore for MemoryStore {
        fn load(&self) -> Result<Option<Token>> {
            Ok(self.0.lock().unwrap().clone())
        }

        fn save(&self, token: &Token) -> Result<()> {
            *self.0.lock().unwrap() = Some(token.clone());
            Ok(())
        }
    }

    fn unreachable_secrets() -> ClientSecrets {
        ClientSecrets {
            client_id: "id".into(),
            client_secret: "secret".into(),
            auth_uri: DEFAULT_AUTH_URI.into(),
            token_uri: "http://127.0.0.1:1/token".into(),
        }
    }

    #[test]
    fn failed_refresh_is_an_error_not_a_login() {
        let expired = Token {
            access_token: "stale".into(),
            refresh_token: Some("1//refresh".into()),
            expires_at: Utc::now() - chrono::Duration::minutes(5),
        };
        let store = MemoryStore(std::sync::Mutex::new(Some(expired)));
        let mut auth = Authenticator::new(unreachable_secrets(), Box::new(store));

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(auth.access_token());
        });
        let result = rx
            .recv_timeout(Duration::from_secs(20))
            .expect("access_token blocked");
        assert!(matches!(result, Err(Error::Credentials(_))));
    }

    #[test]
    fn missing_token_is_an_error_without_login() {
        let store = MemoryStore(std::sync::Mutex::new(None));
        let mut auth = Authenticator::new(unreachable_secrets(), Box::new(store));
        assert!(matches!(auth.access_token(), Err(Error::Credentials(_))));
    }

    #[test]
    fn valid_cached_token_is_reused() {
        let token = Token {
            access_token: "fresh".into(),
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };
        let store = MemoryStore(std::sync::Mutex::new(Some(token)));
        let mut auth = Authenticator::new(unreachable_secrets(), Box::new(store));
        assert_eq!(auth.access_token().unwrap(), "fresh");
        assert_eq!(auth.login().unwrap(), "fresh");
    }

    #[test]
    fn refresh_keeps_the_previous_refresh_token() {
        let response = TokenResponse {
            access_token: "new".into(),
            expires_in: 3599,
            refresh_token: None,
        };
        let token = response.into_token(Some("old-refresh".into()));
        assert_eq!(token.refresh_token.as_deref(), Some("old-refresh"));
        assert!(!token.is_expired_at(Utc::now()));
    }
}
