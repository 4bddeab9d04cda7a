//! HTTP client for the REST collaborators.
//!
//! Every call except `login` and `register` carries the session token as
//! `Authorization: Bearer <token>`. Non-2xx responses become
//! [`ApiError::Status`] with the server's `message` when it sent one.

use std::time::Duration;

use chat_sync_core::Session;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::types::{
    Credentials, FriendRequest, FriendRequestBody, FriendResponse, LoginResponse, MessageBody,
    Profile, PurchaseBody, RespondBody, UserSummary, VipLevel,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// REST client error.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Authentication required")]
    AuthRequired,
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Unexpected response body: {0}")]
    Decode(String),
}

/// Client for the chat REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    session: Option<Session>,
}

impl ApiClient {
    /// Create an unauthenticated client for `base_url`.
    ///
    /// # Errors
    /// Returns error if the URL does not parse or the HTTP client cannot
    /// be built.
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        // A trailing slash keeps any path prefix when joining endpoints.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&normalized)
            .map_err(|e| ApiError::InvalidUrl(format!("{base_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base,
            session: None,
        })
    }

    /// Attach the session used for authenticated calls.
    #[must_use]
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    /// `POST /login`.
    ///
    /// # Errors
    /// Returns `ApiError::Status` for rejected credentials.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, ApiError> {
        let request = self
            .http
            .post(self.endpoint("login")?)
            .json(&Credentials { username, password });
        let body: LoginResponse = self.execute(request, false).await?;
        Session::new(body.token, body.username)
            .ok_or_else(|| ApiError::Decode("login response has an empty token".into()))
    }

    /// `POST /register`. Returns the server's confirmation message.
    ///
    /// # Errors
    /// Returns `ApiError::Status` if the username is taken or input is
    /// missing.
    pub async fn register(&self, username: &str, password: &str) -> Result<String, ApiError> {
        let request = self
            .http
            .post(self.endpoint("register")?)
            .json(&Credentials { username, password });
        let body: MessageBody = self.execute(request, false).await?;
        Ok(body.message)
    }

    /// `GET /api/friends`.
    ///
    /// # Errors
    /// Returns error on transport failure or a non-2xx response.
    pub async fn friends(&self) -> Result<Vec<UserSummary>, ApiError> {
        let request = self.http.get(self.endpoint("api/friends")?);
        self.execute(self.authorize(request)?, true).await
    }

    /// `GET /api/friends/requests`.
    ///
    /// # Errors
    /// Returns error on transport failure or a non-2xx response.
    pub async fn friend_requests(&self) -> Result<Vec<FriendRequest>, ApiError> {
        let request = self.http.get(self.endpoint("api/friends/requests")?);
        self.execute(self.authorize(request)?, true).await
    }

    /// `GET /api/friends/search?query=`.
    ///
    /// # Errors
    /// Returns error on transport failure or a non-2xx response.
    pub async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>, ApiError> {
        let mut url = self.endpoint("api/friends/search")?;
        url.query_pairs_mut().append_pair("query", query);
        let request = self.http.get(url);
        self.execute(self.authorize(request)?, true).await
    }

    /// `POST /api/friends/request`.
    ///
    /// # Errors
    /// Returns error on transport failure or a non-2xx response.
    pub async fn send_friend_request(&self, friend_id: i64) -> Result<String, ApiError> {
        let request = self
            .http
            .post(self.endpoint("api/friends/request")?)
            .json(&FriendRequestBody { friend_id });
        let body: MessageBody = self.execute(self.authorize(request)?, true).await?;
        Ok(body.message)
    }

    /// `POST /api/friends/respond`.
    ///
    /// # Errors
    /// Returns error on transport failure or a non-2xx response.
    pub async fn respond_friend_request(
        &self,
        request_id: i64,
        response: FriendResponse,
    ) -> Result<String, ApiError> {
        let request = self
            .http
            .post(self.endpoint("api/friends/respond")?)
            .json(&RespondBody {
                request_id,
                response,
            });
        let body: MessageBody = self.execute(self.authorize(request)?, true).await?;
        Ok(body.message)
    }

    /// `GET /api/vip/levels`.
    ///
    /// # Errors
    /// Returns error on transport failure or a non-2xx response.
    pub async fn vip_levels(&self) -> Result<Vec<VipLevel>, ApiError> {
        let request = self.http.get(self.endpoint("api/vip/levels")?);
        self.execute(self.authorize(request)?, true).await
    }

    /// `GET /api/user/profile`.
    ///
    /// # Errors
    /// Returns error on transport failure or a non-2xx response.
    pub async fn profile(&self) -> Result<Profile, ApiError> {
        let request = self.http.get(self.endpoint("api/user/profile")?);
        self.execute(self.authorize(request)?, true).await
    }

    /// `POST /api/vip/purchase`.
    ///
    /// # Errors
    /// Returns error on transport failure or a non-2xx response.
    pub async fn purchase_vip(&self, level_id: i64) -> Result<String, ApiError> {
        let request = self
            .http
            .post(self.endpoint("api/vip/purchase")?)
            .json(&PurchaseBody { level_id });
        let body: MessageBody = self.execute(self.authorize(request)?, true).await?;
        Ok(body.message)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|e| ApiError::InvalidUrl(format!("{path}: {e}")))
    }

    fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        let session = self.session.as_ref().ok_or(ApiError::AuthRequired)?;
        Ok(request.bearer_auth(session.token()))
    }

    /// Send and decode. With `authenticated`, a 401 means the session is
    /// no longer valid; without it (login), 401 is an ordinary rejection.
    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        authenticated: bool,
    ) -> Result<T, ApiError> {
        let response = request.send().await?;
        let status = response.status();
        let url = response.url().path().to_string();
        let body = response.text().await?;
        debug!(%status, path = %url, "API response received");

        if authenticated && status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::AuthRequired);
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: error_message(status, &body),
            });
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<MessageBody>(body)
        .ok()
        .map(|b| b.message)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Request failed")
                .to_string()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_prefers_server_text() {
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, r#"{"message":"Username taken"}"#),
            "Username taken"
        );
        assert_eq!(
            error_message(StatusCode::NOT_FOUND, "<html>oops</html>"),
            "Not Found"
        );
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, r#"{"message":""}"#),
            "Bad Request"
        );
    }

    #[test]
    fn test_base_url_keeps_prefix() {
        let client = ApiClient::new("http://example.com/chat").unwrap();
        assert_eq!(
            client.endpoint("api/friends").unwrap().as_str(),
            "http://example.com/chat/api/friends"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            ApiClient::new("not a url"),
            Err(ApiError::InvalidUrl(_))
        ));
    }
}
