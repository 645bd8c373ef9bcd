//! Smart HTTP subtransport.
//!
//! Advertisements are `GET <url>/info/refs?service=<svc>`; transfers are
//! `POST <url>/<svc>` with the request body streamed from [`write`] calls.
//! Requests run on a small tokio runtime owned by the subtransport while
//! libgit2 drives the stream synchronously.
//!
//! A 401 triggers one retry with Basic credentials from the credentials
//! callback. The request body is recorded as it streams so the retry can
//! replay it.
//!
//! [`write`]: SmartSubtransportStream::write

use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::{Buf, Bytes};
use futures::Stream;
use reqwest::{
    Method, Response, StatusCode,
    header::{ACCEPT, CONTENT_TYPE},
};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};

use crate::{
    config::HttpConfig,
    credentials::{Credential, CredentialType},
    errors::GitError,
    transport::{
        core::{SmartSubtransport, SmartSubtransportStream, Transport},
        types::SmartServiceAction,
        utils::{TransportRuntime, join_url},
    },
};

#[derive(Clone)]
struct BasicAuth {
    username: String,
    password: String,
}

/// State shared by a subtransport and its streams.
struct HttpClient {
    runtime: TransportRuntime,
    http: reqwest::Client,
    transport: Transport,
    /// Credentials accepted earlier in this connection, sent up front.
    auth: Mutex<Option<BasicAuth>>,
}

impl HttpClient {
    fn auth(&self) -> Option<BasicAuth> {
        self.auth.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_auth(&self, auth: BasicAuth) {
        *self.auth.lock().unwrap_or_else(PoisonError::into_inner) = Some(auth);
    }
}

/// Built-in subtransport for `http://` and `https://`.
pub struct HttpSubtransport {
    transport: Transport,
    config: HttpConfig,
    client: Option<Arc<HttpClient>>,
}

impl HttpSubtransport {
    pub fn new(transport: Transport, config: HttpConfig) -> Self {
        HttpSubtransport {
            transport,
            config,
            client: None,
        }
    }

    fn client(&mut self) -> Result<Arc<HttpClient>, GitError> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let runtime = TransportRuntime::new("git-bridge-http", self.config.worker_threads)?;
        let http = reqwest::Client::builder()
            .user_agent(self.config.user_agent.as_str())
            .build()?;
        let client = Arc::new(HttpClient {
            runtime,
            http,
            transport: self.transport.clone(),
            auth: Mutex::new(None),
        });
        self.client = Some(client.clone());
        Ok(client)
    }
}

impl SmartSubtransport for HttpSubtransport {
    fn action(
        &mut self,
        url: &str,
        action: SmartServiceAction,
    ) -> Result<Box<dyn SmartSubtransportStream>, GitError> {
        let client = self.client()?;
        let request = HttpRequest::for_action(url, action);
        tracing::debug!(%action, method = %request.method, url = %request.url, "http action");
        let mut stream = HttpStream::new(client, request);
        if !action.is_advertisement() {
            // Transfers stream their body while it is written.
            stream.start();
        }
        Ok(Box::new(stream))
    }

    fn close(&mut self) -> Result<(), GitError> {
        Ok(())
    }

    fn free(&mut self) {
        self.client = None;
    }
}

#[derive(Clone, Debug)]
struct HttpRequest {
    method: Method,
    url: String,
    content_type: Option<String>,
    accept: Option<String>,
    /// `Content-Type` a smart server answers with.
    expect: String,
}

impl HttpRequest {
    fn for_action(url: &str, action: SmartServiceAction) -> Self {
        let service = action.service();
        if action.is_advertisement() {
            HttpRequest {
                method: Method::GET,
                url: join_url(url, &format!("info/refs?service={service}")),
                content_type: None,
                accept: None,
                expect: service.advertisement_content_type(),
            }
        } else {
            HttpRequest {
                method: Method::POST,
                url: join_url(url, &service.to_string()),
                content_type: Some(service.request_content_type()),
                accept: Some(service.result_content_type()),
                expect: service.result_content_type(),
            }
        }
    }

    fn has_body(&self) -> bool {
        self.method == Method::POST
    }

    /// Username embedded in the URL, passed to the credentials callback.
    fn username(&self) -> Option<String> {
        reqwest::Url::parse(&self.url)
            .ok()
            .map(|url| url.username().to_string())
            .filter(|user| !user.is_empty())
    }
}

/// Request body written so far plus the chunks still in flight.
struct BodyPipe {
    rx: mpsc::UnboundedReceiver<Bytes>,
    recorded: Vec<Bytes>,
}

/// Body stream that yields every chunk from the start, pulling new chunks
/// from the pipe once the recording is exhausted.
fn replay(pipe: Arc<AsyncMutex<BodyPipe>>) -> impl Stream<Item = Result<Bytes, io::Error>> + Send {
    futures::stream::unfold((pipe, 0usize), |(pipe, index)| async move {
        let chunk = {
            let mut body = pipe.lock().await;
            match body.recorded.get(index) {
                Some(chunk) => Some(chunk.clone()),
                None => match body.rx.recv().await {
                    Some(chunk) => {
                        body.recorded.push(chunk.clone());
                        Some(chunk)
                    }
                    None => None,
                },
            }
        };
        chunk.map(|chunk| (Ok(chunk), (pipe, index + 1)))
    })
}

async fn send(
    http: reqwest::Client,
    request: HttpRequest,
    body: Option<Arc<AsyncMutex<BodyPipe>>>,
    auth: Option<BasicAuth>,
) -> Result<Response, GitError> {
    let mut builder = http.request(request.method.clone(), &request.url);
    if let Some(content_type) = &request.content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    if let Some(accept) = &request.accept {
        builder = builder.header(ACCEPT, accept);
    }
    if let Some(auth) = auth {
        builder = builder.basic_auth(auth.username, Some(auth.password));
    }
    if let Some(body) = body {
        builder = builder.body(reqwest::Body::wrap_stream(replay(body)));
    }
    let response = builder.send().await?;
    tracing::debug!(method = %request.method, url = %request.url, status = %response.status(), "http response");
    Ok(response)
}

struct HttpStream {
    client: Arc<HttpClient>,
    request: HttpRequest,
    body: Option<Arc<AsyncMutex<BodyPipe>>>,
    body_tx: Option<mpsc::UnboundedSender<Bytes>>,
    sent: bool,
    in_flight: Option<oneshot::Receiver<Result<Response, GitError>>>,
    response: Option<Response>,
    leftover: Bytes,
    finished: bool,
}

impl HttpStream {
    fn new(client: Arc<HttpClient>, request: HttpRequest) -> Self {
        let (body, body_tx) = if request.has_body() {
            let (tx, rx) = mpsc::unbounded_channel();
            let pipe = BodyPipe {
                rx,
                recorded: Vec::new(),
            };
            (Some(Arc::new(AsyncMutex::new(pipe))), Some(tx))
        } else {
            (None, None)
        };
        HttpStream {
            client,
            request,
            body,
            body_tx,
            sent: false,
            in_flight: None,
            response: None,
            leftover: Bytes::new(),
            finished: false,
        }
    }

    /// Spawns the request in the background; the body keeps streaming from
    /// later writes.
    fn start(&mut self) {
        if self.sent {
            return;
        }
        self.sent = true;
        let (tx, rx) = oneshot::channel();
        let request = send(
            self.client.http.clone(),
            self.request.clone(),
            self.body.clone(),
            self.client.auth(),
        );
        self.client.runtime.spawn(async move {
            let _ = tx.send(request.await);
        });
        self.in_flight = Some(rx);
    }

    /// Finishes the body and waits for a successful response.
    fn receive(&mut self) -> Result<Response, GitError> {
        self.start();
        self.body_tx = None;
        let in_flight = self.in_flight.take().ok_or_else(|| {
            GitError::CustomError(format!("request to {} already failed", self.request.url))
        })?;
        let response = self
            .client
            .runtime
            .block_on(in_flight)?
            .map_err(|_| GitError::CustomError("http request task was dropped".to_string()))??;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            self.retry_with_credentials()?
        } else {
            response
        };
        if response.status() != StatusCode::OK {
            return Err(GitError::HttpStatus {
                status: response.status().as_u16(),
                url: self.request.url.clone(),
            });
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if content_type != self.request.expect {
            return Err(GitError::CustomError(format!(
                "{} is not a smart http server: unexpected content type `{content_type}`",
                self.request.url
            )));
        }
        Ok(response)
    }

    fn retry_with_credentials(&mut self) -> Result<Response, GitError> {
        let unauthorized = || GitError::HttpStatus {
            status: StatusCode::UNAUTHORIZED.as_u16(),
            url: self.request.url.clone(),
        };
        let username = self.request.username();
        let credential = match self
            .client
            .transport
            .smart_credentials(username.as_deref(), CredentialType::USERPASS_PLAINTEXT)
        {
            Ok(credential) => credential,
            Err(GitError::Passthrough) => return Err(unauthorized()),
            Err(err) => return Err(err),
        };
        let Credential::UserpassPlaintext { username, password } = credential else {
            return Err(GitError::InvalidCredential(format!(
                "{:?} cannot authenticate an http request",
                credential.kind()
            )));
        };
        let auth = BasicAuth { username, password };
        self.client.set_auth(auth.clone());

        tracing::debug!(url = %self.request.url, "retrying request with basic auth");
        let retry = send(
            self.client.http.clone(),
            self.request.clone(),
            self.body.clone(),
            Some(auth),
        );
        let response = self.client.runtime.block_on(retry)??;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(unauthorized());
        }
        Ok(response)
    }
}

impl SmartSubtransportStream for HttpStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, GitError> {
        if self.response.is_none() {
            self.response = Some(self.receive()?);
        }
        while self.leftover.is_empty() {
            if self.finished {
                return Ok(0);
            }
            let Some(response) = self.response.as_mut() else {
                return Ok(0);
            };
            match self.client.runtime.block_on(response.chunk())?? {
                Some(chunk) => self.leftover = chunk,
                None => self.finished = true,
            }
        }
        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, GitError> {
        let Some(tx) = &self.body_tx else {
            return Err(GitError::InvalidArgument(format!(
                "cannot write to {} {} once its body is complete",
                self.request.method, self.request.url
            )));
        };
        tx.send(Bytes::copy_from_slice(buf))
            .map_err(|_| GitError::CustomError("http request body was dropped".to_string()))?;
        Ok(buf.len())
    }

    fn free(&mut self) {
        self.body_tx = None;
        self.in_flight = None;
        self.response = None;
    }
}
