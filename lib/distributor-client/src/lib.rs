//! Typed client of the airdrop backend.

use distributor_lib::{config::DistributorConfig, AirdropId, Asset, Batch, BatchId};
use reqwest::{header::AUTHORIZATION, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error as ThisError;
use types::*;

pub mod relay;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use relay::{refresh, BackendSubmitter};
pub use session::Session;

#[derive(ThisError, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("not signed in")]
    Unauthenticated,
    #[error("{}: {}", .0.error, .0.message)]
    Api(ErrorBody),
    #[error("unexpected response ({status}): {body}")]
    Unexpected { status: StatusCode, body: String },
}

impl BackendError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            BackendError::Http(e) => e.status(),
            BackendError::Api(body) => StatusCode::from_u16(body.status_code).ok(),
            BackendError::Unexpected { status, .. } => Some(*status),
            BackendError::Unauthenticated => Some(StatusCode::UNAUTHORIZED),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
    session: Session,
}

impl BackendClient {
    pub fn new(client: reqwest::Client, base_url: &str, session: Session) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            session,
        }
    }

    pub fn from_config(config: &DistributorConfig, session: Session) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_client.timeout_in_secs.get()))
            .gzip(config.http_client.gzip)
            .build()?;
        Ok(Self::new(client, &config.endpoints.backend, session))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn send<P, T>(
        &self,
        method: Method,
        path: &str,
        params: Option<&P>,
    ) -> Result<T, BackendError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let token = self.session.token().ok_or(BackendError::Unauthenticated)?;
        let mut req = self
            .client
            .request(method.clone(), format!("{}{}", self.base_url, path))
            .header(AUTHORIZATION, format!("Bearer {}", token));
        if let Some(params) = params {
            req = req.json(params);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        tracing::debug!("{} {} -> {}", method, path, status);

        if status.is_success() {
            return match serde_json::from_slice::<RestResult<T>>(&body) {
                Ok(result) => result.into_result().map_err(BackendError::Api),
                Err(e) => Err(BackendError::Unexpected {
                    status,
                    body: format!("{e}: {}", String::from_utf8_lossy(&body)),
                }),
            };
        }
        match serde_json::from_slice::<ErrorBody>(&body) {
            Ok(mut error) => {
                if error.status_code == 0 {
                    error.status_code = status.as_u16();
                }
                if status == StatusCode::UNAUTHORIZED {
                    self.session.sign_out();
                }
                Err(BackendError::Api(error))
            }
            Err(_) => Err(BackendError::Unexpected {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }

    pub async fn create_airdrop(
        &self,
        asset: Asset,
        batches: Vec<Batch>,
    ) -> Result<create_airdrop::Output, BackendError> {
        let params = create_airdrop::Params { asset, batches };
        self.send(Method::POST, "/airdrops", Some(&params)).await
    }

    pub async fn list_airdrops(&self) -> Result<list_airdrops::Output, BackendError> {
        self.send::<(), _>(Method::GET, "/airdrops", None).await
    }

    pub async fn get_airdrop(&self, id: AirdropId) -> Result<get_airdrop::Output, BackendError> {
        self.send::<(), _>(Method::GET, &format!("/airdrops/{id}"), None)
            .await
    }

    pub async fn start(
        &self,
        id: AirdropId,
        batches: &[start::StartBatch],
    ) -> Result<start::Output, BackendError> {
        self.send(Method::POST, &format!("/airdrops/{id}/start"), Some(batches))
            .await
    }

    pub async fn retry_batch(
        &self,
        id: AirdropId,
        batch_id: BatchId,
        params: &retry_batch::Params,
    ) -> Result<retry_batch::Output, BackendError> {
        self.send(
            Method::POST,
            &format!("/airdrops/{id}/retry-batch/{batch_id}"),
            Some(params),
        )
        .await
    }

    pub async fn delete_airdrop(
        &self,
        id: AirdropId,
    ) -> Result<delete_airdrop::Output, BackendError> {
        self.send::<(), _>(Method::DELETE, &format!("/airdrops/{id}"), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubBackend;
    use serde_json::json;

    #[tokio::test]
    async fn test_requires_token() {
        let client = BackendClient::new(
            reqwest::Client::new(),
            "http://localhost:1/",
            Session::default(),
        );
        assert_eq!(client.base_url, "http://localhost:1");
        assert!(matches!(
            client.list_airdrops().await,
            Err(BackendError::Unauthenticated)
        ));
    }

    #[test]
    fn test_error_status() {
        let error = BackendError::Api(ErrorBody {
            error: "NotFound".to_owned(),
            message: "airdrop not found".to_owned(),
            status_code: 404,
        });
        assert_eq!(error.to_string(), "NotFound: airdrop not found");
        assert_eq!(error.status(), Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_unauthorized_signs_out() {
        let stub = StubBackend::start([(
            401,
            json!({ "error": "Unauthorized", "message": "token expired" }),
        )])
        .await;
        let session = Session::new(Some("token-1".to_owned()));
        let client = stub.client(session.clone());

        let error = client.list_airdrops().await.unwrap_err();
        assert!(matches!(
            &error,
            BackendError::Api(body) if body.error == "Unauthorized" && body.status_code == 401
        ));
        assert_eq!(error.status(), Some(StatusCode::UNAUTHORIZED));
        assert!(!session.is_signed_in());

        assert!(matches!(
            client.list_airdrops().await,
            Err(BackendError::Unauthenticated)
        ));
        let requests = stub.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].path, "/airdrops");
        assert_eq!(requests[0].authorization.as_deref(), Some("Bearer token-1"));
    }

    #[tokio::test]
    async fn test_error_body_fills_status() {
        let stub = StubBackend::start([(
            404,
            json!({ "error": "NotFound", "message": "airdrop not found" }),
        )])
        .await;
        let session = Session::new(Some("token".to_owned()));
        let client = stub.client(session.clone());

        let error = client.get_airdrop(uuid_of(7)).await.unwrap_err();
        assert_eq!(error.to_string(), "NotFound: airdrop not found");
        assert_eq!(error.status(), Some(StatusCode::NOT_FOUND));
        assert!(session.is_signed_in());
        assert_eq!(stub.requests()[0].path, format!("/airdrops/{}", uuid_of(7)));
    }

    #[tokio::test]
    async fn test_error_in_success_response() {
        let stub = StubBackend::start([(
            200,
            json!({ "error": "Conflict", "message": "airdrop already started", "statusCode": 409 }),
        )])
        .await;
        let client = stub.client(Session::new(Some("token".to_owned())));

        let error = client.start(uuid_of(1), &[]).await.unwrap_err();
        assert!(matches!(&error, BackendError::Api(body) if body.error == "Conflict"));
        assert_eq!(error.status(), Some(StatusCode::CONFLICT));
        assert_eq!(stub.requests()[0].body, json!([]));
    }

    #[tokio::test]
    async fn test_unexpected_body() {
        let stub = StubBackend::start([(502, json!("bad gateway"))]).await;
        let client = stub.client(Session::new(Some("token".to_owned())));

        let error = client.delete_airdrop(uuid_of(2)).await.unwrap_err();
        assert!(matches!(
            &error,
            BackendError::Unexpected { status, .. } if *status == StatusCode::BAD_GATEWAY
        ));
        assert_eq!(stub.requests()[0].method, "DELETE");
    }

    fn uuid_of(n: u128) -> AirdropId {
        AirdropId::from_u128(n)
    }
}
